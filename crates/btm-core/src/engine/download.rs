//! Download path: one range-resumable HTTP exchange streaming into a temp
//! file, finalized with an atomic move into the destination.
//!
//! The response is triaged inside the body callback: the first body chunk of
//! the final hop parses the collected headers, runs the resume preflight and
//! disk-space check, opens the temp file, and only then does streaming
//! begin. Cancel/pause are observed between chunks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;

use crate::config::{EngineConfig, UseCacheDir};
use crate::control::{ControlToken, Intent};
use crate::naming;
use crate::platform::Platform;
use crate::task::{ResumeData, Task, TaskError};

use super::exchange;
use super::headers::{etag_matches, task_range, ContentLength, HeaderCollector, ResponseInfo};
use super::partfile::PartFile;
use super::{TransferEvent, TransferResult};

/// Cap on the diagnostic body excerpt captured for failed responses.
const DIAGNOSTIC_CAP: usize = 2048;

/// Files below this size go to the cache dir under the `WhenAble` policy.
const CACHE_QUOTA_BYTES: u64 = 256 * 1024 * 1024;

/// Keep a partial file for later resume only when at least this much is
/// already on disk.
const MIN_RESUMABLE_BYTES: u64 = 1024 * 1024;

/// Report progress to the event channel at most once per this many bytes;
/// the pipeline applies the real 500 ms / 0.02 throttle.
const PROGRESS_GRANULARITY: u64 = 64 * 1024;

enum Sink {
    Pending,
    File(PartFile),
    Diagnostic(Vec<u8>),
}

enum Abort {
    Cancel,
    Pause,
    Fatal(TaskError),
}

struct RunState {
    collector: HeaderCollector,
    info: Option<ResponseInfo>,
    sink: Sink,
    /// Bytes persisted so far, including bytes carried over from a resume.
    bytes_total: u64,
    dest: Option<PathBuf>,
    /// Task snapshot with the server-derived filename applied, when any.
    task: Task,
    resumable: bool,
    abort: Option<Abort>,
    last_reported: u64,
}

/// Runs one download exchange to completion on the current (blocking)
/// thread. Returns the final task snapshot and the transfer result.
pub(super) fn run_download_blocking(
    task: Task,
    cfg: EngineConfig,
    platform: Arc<dyn Platform>,
    resume: Option<ResumeData>,
    token: ControlToken,
    events: UnboundedSender<TransferEvent>,
    remaining: Arc<Mutex<HashMap<String, u64>>>,
) -> (Task, TransferResult) {
    let url = match task.url_with_query() {
        Ok(u) => u,
        Err(e) => return (task, TransferResult::failed(e)),
    };

    // Skip the network entirely when the destination already holds a
    // large-enough file.
    if !task.wants_suggested_filename() && cfg.skip_existing_files_larger_than_mib >= 0 {
        if let Ok(base) = platform.base_path(task.base_directory) {
            let dest = task.resolved_path(&base);
            if let Ok(meta) = std::fs::metadata(&dest) {
                let threshold = cfg.skip_existing_files_larger_than_mib as u64 * 1024 * 1024;
                if meta.len() >= threshold {
                    tracing::debug!(task_id = %task.task_id, "destination exists, skipping download");
                    return (
                        task,
                        TransferResult::Complete {
                            expected_file_size: meta.len() as i64,
                            response_body: None,
                        },
                    );
                }
            }
        }
    }

    let (range_start, range_end) = task_range(&task.headers);
    let resume_offset = resume.as_ref().map(|r| r.required_start_byte).unwrap_or(0);

    let mut easy = curl::easy::Easy::new();
    if let Err(e) = easy.url(&url) {
        return (task, TransferResult::failed(TaskError::url(e.to_string())));
    }
    if let Err(e) = exchange::configure_easy(&mut easy, &cfg) {
        return (task, TransferResult::failed(TaskError::general(e.to_string())));
    }
    if let Err(e) = exchange::apply_method(&mut easy, task.http_method, false) {
        return (task, TransferResult::failed(TaskError::general(e.to_string())));
    }
    if let Err(e) = exchange::apply_body(&mut easy, &task) {
        return (task, TransferResult::failed(e));
    }
    let mut extra_headers: Vec<(String, String)> = Vec::new();
    if resume.is_some() {
        let start = range_start + resume_offset;
        let end = range_end.map(|e| e.to_string()).unwrap_or_default();
        extra_headers.push(("Range".to_string(), format!("bytes={}-{}", start, end)));
    }
    match exchange::header_list(&task, &extra_headers) {
        Ok(list) => {
            if let Err(e) = easy.http_headers(list) {
                return (task, TransferResult::failed(TaskError::general(e.to_string())));
            }
        }
        Err(e) => return (task, TransferResult::failed(TaskError::general(e.to_string()))),
    }

    let state = Arc::new(Mutex::new(RunState {
        collector: HeaderCollector::default(),
        info: None,
        sink: Sink::Pending,
        bytes_total: 0,
        dest: None,
        task: task.clone(),
        resumable: false,
        abort: None,
        last_reported: 0,
    }));

    let perform_result = {
        let header_state = Arc::clone(&state);
        let write_state = Arc::clone(&state);
        let platform_cb = Arc::clone(&platform);
        let remaining_cb = Arc::clone(&remaining);
        let cfg_cb = cfg.clone();
        let resume_cb = resume.clone();
        let events_cb = events.clone();
        let token_cb = token.clone();

        let mut transfer = easy.transfer();
        if let Err(e) = transfer.header_function(move |data| {
            header_state.lock().unwrap().collector.push(data);
            true
        }) {
            return (task, TransferResult::failed(TaskError::general(e.to_string())));
        }
        if let Err(e) = transfer.write_function(move |data| {
            let mut st = write_state.lock().unwrap();
            if st.info.is_none() && st.abort.is_none() {
                begin_body(
                    &mut st,
                    &cfg_cb,
                    platform_cb.as_ref(),
                    resume_cb.as_ref(),
                    &remaining_cb,
                    &events_cb,
                );
            }
            if st.abort.is_some() {
                return Ok(0);
            }
            match token_cb.intent() {
                Intent::Cancel => {
                    st.abort = Some(Abort::Cancel);
                    return Ok(0);
                }
                Intent::Pause => {
                    if st.resumable && st.task.allow_pause {
                        st.abort = Some(Abort::Pause);
                    } else {
                        st.abort = Some(Abort::Fatal(TaskError::general(
                            "pause requested but transfer is not resumable",
                        )));
                    }
                    return Ok(0);
                }
                Intent::None => {}
            }
            match &mut st.sink {
                Sink::File(part) => {
                    if let Err(e) = part.write_chunk(data) {
                        st.abort = Some(Abort::Fatal(TaskError::file_system(format!(
                            "write failed: {}",
                            e
                        ))));
                        return Ok(0);
                    }
                    st.bytes_total += data.len() as u64;
                    if st.bytes_total - st.last_reported >= PROGRESS_GRANULARITY {
                        st.last_reported = st.bytes_total;
                        let _ = events_cb.send(TransferEvent::Progress {
                            bytes_total: st.bytes_total,
                        });
                    }
                }
                Sink::Diagnostic(buf) => {
                    let room = DIAGNOSTIC_CAP.saturating_sub(buf.len());
                    buf.extend_from_slice(&data[..data.len().min(room)]);
                }
                Sink::Pending => {}
            }
            Ok(data.len())
        }) {
            return (task, TransferResult::failed(TaskError::general(e.to_string())));
        }
        transfer.perform()
    };

    let mut st = state.lock().unwrap();
    // An empty 2xx body never enters the write callback; set up the sink now
    // so an empty file still lands at the destination.
    if st.info.is_none() && st.abort.is_none() {
        begin_body(&mut st, &cfg, platform.as_ref(), resume.as_ref(), &remaining, &events);
    }
    finish(&mut st, perform_result, platform.as_ref())
}

/// First-body-chunk (or empty-body) triage: parse headers, derive the
/// filename, run resume preflight and the disk-space check, open the sink.
fn begin_body(
    st: &mut RunState,
    cfg: &EngineConfig,
    platform: &dyn Platform,
    resume: Option<&ResumeData>,
    remaining: &Arc<Mutex<HashMap<String, u64>>>,
    events: &UnboundedSender<TransferEvent>,
) {
    let info = st.collector.parse();
    st.resumable = info.supports_ranges();

    if !info.is_success() {
        // The exchange ran; Running must precede the failure transition.
        let _ = events.send(TransferEvent::Started {
            task: st.task.clone(),
            expected: ContentLength::Unknown,
            resumable: st.resumable,
        });
        st.sink = Sink::Diagnostic(Vec::new());
        st.info = Some(info);
        return;
    }

    // Server-derived filename, unique-ified against the target directory.
    if st.task.wants_suggested_filename() {
        let suggested = naming::suggest_filename(info.content_disposition.as_deref(), &st.task.url)
            .unwrap_or_else(|| st.task.task_id.clone());
        st.task = st.task.with_filename(suggested);
        match platform.base_path(st.task.base_directory) {
            Ok(base) => {
                let dest = naming::unique_path(&st.task.resolved_path(&base));
                if let Some(name) = dest.file_name() {
                    st.task = st.task.with_filename(name.to_string_lossy().into_owned());
                }
                st.dest = Some(dest);
            }
            Err(e) => {
                st.abort = Some(Abort::Fatal(TaskError::file_system(e.to_string())));
                return;
            }
        }
    } else {
        match platform.base_path(st.task.base_directory) {
            Ok(base) => st.dest = Some(st.task.resolved_path(&base)),
            Err(e) => {
                st.abort = Some(Abort::Fatal(TaskError::file_system(e.to_string())));
                return;
            }
        }
    }

    let body_len = info.expected_length(&st.task.headers);

    // Resume preflight (only meaningful on a 206 response).
    let carried = if let Some(rd) = resume {
        match resume_preflight(st, &info, rd, cfg) {
            Ok(carried) => carried,
            Err(e) => {
                let _ = std::fs::remove_file(&rd.data);
                st.abort = Some(Abort::Fatal(e));
                return;
            }
        }
    } else {
        0
    };

    let full_expected = match body_len {
        ContentLength::Known(n) => ContentLength::Known(n + carried),
        ContentLength::Unknown => ContentLength::Unknown,
    };

    if let Err(e) = disk_preflight(st, cfg, platform, full_expected, carried, remaining) {
        st.abort = Some(Abort::Fatal(e));
        return;
    }

    if resume.is_none() {
        let temp_dir = match temp_dir_for(cfg, platform, full_expected) {
            Ok(d) => d,
            Err(e) => {
                st.abort = Some(Abort::Fatal(TaskError::file_system(e.to_string())));
                return;
            }
        };
        match PartFile::create_in(&temp_dir) {
            Ok(part) => {
                st.sink = Sink::File(part);
                st.bytes_total = 0;
            }
            Err(e) => {
                st.abort = Some(Abort::Fatal(TaskError::file_system(e.to_string())));
                return;
            }
        }
    }

    if let ContentLength::Known(n) = full_expected {
        remaining
            .lock()
            .unwrap()
            .insert(st.task.task_id.clone(), n.saturating_sub(st.bytes_total));
    }
    let _ = events.send(TransferEvent::Started {
        task: st.task.clone(),
        expected: full_expected,
        resumable: st.resumable,
    });
    let _ = events.send(TransferEvent::Progress {
        bytes_total: st.bytes_total,
    });
    st.info = Some(info);
}

/// Validates that the partial file on disk still matches the remote entity
/// and re-aligns it with the server's range start. Returns the number of
/// bytes carried over into this attempt.
fn resume_preflight(
    st: &mut RunState,
    info: &ResponseInfo,
    rd: &ResumeData,
    cfg: &EngineConfig,
) -> Result<u64, TaskError> {
    if info.status != 206 {
        return Err(TaskError::resume(format!(
            "server did not honor the range request (status {})",
            info.status
        )));
    }
    let cr = info
        .content_range
        .ok_or_else(|| TaskError::resume("206 response without Content-Range"))?;
    let (range_start, _) = task_range(&st.task.headers);

    let temp_len = std::fs::metadata(&rd.data)
        .map_err(|e| TaskError::resume(format!("temp file unreadable: {}", e)))?
        .len();
    let keep = cr
        .start
        .checked_sub(range_start)
        .ok_or_else(|| TaskError::resume("server range starts before the task range"))?;
    if keep > temp_len {
        return Err(TaskError::resume(format!(
            "temp file holds {} bytes but server resumes at {}",
            temp_len, keep
        )));
    }
    if let Some(stored) = &rd.e_tag {
        match &info.etag {
            Some(current) if etag_matches(stored, current, cfg.allow_weak_etag) => {}
            _ => return Err(TaskError::resume("entity tag changed since pause")),
        }
    }

    let mut part = PartFile::open_append(std::path::Path::new(&rd.data))
        .map_err(|e| TaskError::resume(e.to_string()))?;
    part.truncate_to(keep)
        .map_err(|e| TaskError::resume(e.to_string()))?;
    st.bytes_total = keep;
    st.sink = Sink::File(part);
    Ok(keep)
}

/// Fails the task up front when this download, on top of every other
/// in-flight task's remaining bytes, would push the target volume below the
/// configured free-space floor.
fn disk_preflight(
    st: &RunState,
    cfg: &EngineConfig,
    platform: &dyn Platform,
    expected: ContentLength,
    carried: u64,
    remaining: &Arc<Mutex<HashMap<String, u64>>>,
) -> Result<(), TaskError> {
    if cfg.check_available_space_mib == 0 {
        return Ok(());
    }
    let ContentLength::Known(total) = expected else {
        return Ok(());
    };
    let dest = st.dest.as_deref().unwrap_or_else(|| std::path::Path::new("."));
    let available = platform
        .space_available(dest)
        .map_err(|e| TaskError::file_system(e.to_string()))?;
    let this_remaining = total.saturating_sub(carried);
    let others: u64 = {
        let map = remaining.lock().unwrap();
        map.iter()
            .filter(|(id, _)| id.as_str() != st.task.task_id)
            .map(|(_, v)| *v)
            .sum()
    };
    let floor = cfg.check_available_space_mib * 1024 * 1024;
    if available < this_remaining + others + floor {
        return Err(TaskError::file_system(format!(
            "insufficient disk space: {} available, {} required plus {} floor",
            available,
            this_remaining + others,
            floor
        )));
    }
    Ok(())
}

/// Cache-or-support temp location per the configured policy. Under
/// `WhenAble` small files go to the cache, large ones to the support dir.
fn temp_dir_for(
    cfg: &EngineConfig,
    platform: &dyn Platform,
    expected: ContentLength,
) -> anyhow::Result<PathBuf> {
    match cfg.use_cache_dir {
        UseCacheDir::Always => platform.cache_path(),
        UseCacheDir::Never => platform.support_path(),
        UseCacheDir::WhenAble => match expected {
            ContentLength::Known(n) if n < CACHE_QUOTA_BYTES => platform.cache_path(),
            _ => platform.support_path(),
        },
    }
}

/// Post-perform classification: abort flags, transport errors, HTTP status.
fn finish(
    st: &mut RunState,
    perform_result: Result<(), curl::Error>,
    platform: &dyn Platform,
) -> (Task, TransferResult) {
    let task = st.task.clone();
    let info = st.info.clone().unwrap_or_else(|| st.collector.parse());
    let sink = std::mem::replace(&mut st.sink, Sink::Pending);

    if let Some(abort) = st.abort.take() {
        return match abort {
            Abort::Cancel => {
                discard(sink);
                (task, TransferResult::Canceled)
            }
            Abort::Pause => pause_outcome(st, sink, task, info, false),
            Abort::Fatal(error) => {
                discard(sink);
                (task, TransferResult::failed(error))
            }
        };
    }

    if let Err(e) = perform_result {
        if crate::task::is_timeout(&e) && st.resumable && task.allow_pause && st.bytes_total > 0 {
            return pause_outcome(st, sink, task, info, true);
        }
        let error = crate::task::classify_curl_error(&e);
        // Keep the partial file for a future resume when it is worth it.
        let resume_data = match sink {
            Sink::File(part) if st.resumable && st.bytes_total >= MIN_RESUMABLE_BYTES => {
                let _ = part.sync();
                Some(ResumeData {
                    task: task.clone(),
                    data: part.path().to_string_lossy().into_owned(),
                    required_start_byte: st.bytes_total,
                    e_tag: info.etag.clone(),
                })
            }
            other => {
                discard(other);
                None
            }
        };
        return (
            task,
            TransferResult::Failed {
                error,
                response_body: None,
                resume_data,
            },
        );
    }

    match info.status {
        s if (200..300).contains(&s) => {
            let Sink::File(part) = sink else {
                // 2xx with no file sink: nothing was ever written (HEAD-like
                // response); surface as a zero-length completion.
                return (
                    task,
                    TransferResult::Complete {
                        expected_file_size: 0,
                        response_body: None,
                    },
                );
            };
            let Some(dest) = st.dest.clone() else {
                let _ = part.delete();
                return (
                    task,
                    TransferResult::failed(TaskError::file_system("no destination resolved")),
                );
            };
            if let Err(e) = part.sync() {
                let _ = part.delete();
                return (task, TransferResult::failed(TaskError::file_system(e.to_string())));
            }
            let temp_path = part.path().to_path_buf();
            let size = st.bytes_total;
            drop(part);
            if let Err(e) = platform.move_file(&temp_path, &dest) {
                let _ = std::fs::remove_file(&temp_path);
                return (task, TransferResult::failed(TaskError::file_system(e.to_string())));
            }
            tracing::info!(task_id = %task.task_id, dest = %dest.display(), size, "download complete");
            (
                task,
                TransferResult::Complete {
                    expected_file_size: size as i64,
                    response_body: None,
                },
            )
        }
        404 => {
            let body = diagnostic_text(sink);
            (task, TransferResult::NotFound { response_body: body })
        }
        s => {
            let body = diagnostic_text(sink);
            let error = crate::task::classify_http_status(s, body.as_deref());
            (
                task,
                TransferResult::Failed {
                    error,
                    response_body: body,
                    resume_data: None,
                },
            )
        }
    }
}

fn pause_outcome(
    st: &mut RunState,
    sink: Sink,
    task: Task,
    info: ResponseInfo,
    auto_resume: bool,
) -> (Task, TransferResult) {
    let Sink::File(part) = sink else {
        return (
            task,
            TransferResult::failed(TaskError::general("paused before any bytes arrived")),
        );
    };
    let _ = part.sync();
    let resume_data = ResumeData {
        task: task.clone(),
        data: part.path().to_string_lossy().into_owned(),
        required_start_byte: st.bytes_total,
        e_tag: info.etag,
    };
    (
        task,
        TransferResult::Paused {
            resume_data,
            auto_resume,
        },
    )
}

fn discard(sink: Sink) {
    if let Sink::File(part) = sink {
        let _ = part.delete();
    }
}

fn diagnostic_text(sink: Sink) -> Option<String> {
    match sink {
        Sink::Diagnostic(buf) if !buf.is_empty() => {
            Some(String::from_utf8_lossy(&buf).into_owned())
        }
        Sink::File(part) => {
            let _ = part.delete();
            None
        }
        _ => None,
    }
}
