//! Parallel download path: the task's byte range split into chunks fetched
//! by concurrent Range GETs, each writing at its offset into one
//! preallocated temp file. Pause persists per-chunk offsets as the resume
//! blob; resume revalidates the entity and continues each chunk where it
//! stopped.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;

use crate::config::EngineConfig;
use crate::control::{ControlToken, Intent};
use crate::naming;
use crate::platform::Platform;
use crate::task::{ResumeData, Task, TaskError};

use super::exchange;
use super::headers::{etag_matches, ContentLength, HeaderCollector, ResponseInfo};
use super::partfile::SparseFile;
use super::{TransferEvent, TransferResult};

/// Number of concurrent range chunks per parallel download.
const CHUNK_COUNT: usize = 4;

/// Report shared progress after this many locally accumulated bytes.
const PROGRESS_GRANULARITY: u64 = 64 * 1024;

/// Keep a partial file for later resume only above this size.
const MIN_RESUMABLE_BYTES: u64 = 1024 * 1024;

/// Progress of one chunk: `[start, end)` with `done` bytes written.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkProgress {
    pub start: u64,
    pub end: u64,
    pub done: u64,
}

/// Continuation blob persisted as `ResumeData.data` for parallel downloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParallelResumeBlob {
    pub temp_path: String,
    pub total: u64,
    pub chunks: Vec<ChunkProgress>,
}

/// Splits `[0, total)` into `n` near-equal chunks.
pub fn plan_chunks(total: u64, n: usize) -> Vec<ChunkProgress> {
    let n = n.max(1).min(total.max(1) as usize);
    let base = total / n as u64;
    let rem = total % n as u64;
    let mut chunks = Vec::with_capacity(n);
    let mut start = 0;
    for i in 0..n as u64 {
        let len = base + if i < rem { 1 } else { 0 };
        chunks.push(ChunkProgress {
            start,
            end: start + len,
            done: 0,
        });
        start += len;
    }
    chunks
}

enum ChunkOutcome {
    Done,
    Cancelled,
    Paused,
    Failed(TaskError),
}

/// Runs one parallel download on the current (blocking) thread.
pub(super) fn run_parallel_blocking(
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

    // Probe for size and range support before committing to chunks.
    let info = match probe(&url, &task, &cfg) {
        Ok(info) => info,
        Err(e) => return (task, TransferResult::failed(e)),
    };
    if info.status == 404 {
        // The exchange ran; report Running before the terminal transition.
        let _ = events.send(TransferEvent::Started {
            task: task.clone(),
            expected: ContentLength::Unknown,
            resumable: false,
        });
        return (task, TransferResult::NotFound { response_body: None });
    }
    if !info.is_success() && info.status != 206 {
        let _ = events.send(TransferEvent::Started {
            task: task.clone(),
            expected: ContentLength::Unknown,
            resumable: false,
        });
        let error = crate::task::classify_http_status(info.status, None);
        return (
            task,
            TransferResult::Failed {
                error,
                response_body: None,
                resume_data: None,
            },
        );
    }
    let total = match info.expected_length(&task.headers) {
        ContentLength::Known(n) => n,
        ContentLength::Unknown => {
            return (
                task,
                TransferResult::failed(TaskError::general(
                    "parallel download requires a known content length",
                )),
            )
        }
    };
    if !info.supports_ranges() {
        return (
            task,
            TransferResult::failed(TaskError::general(
                "parallel download requires server range support",
            )),
        );
    }

    // Resolve destination (deriving the filename from the probe if asked).
    let mut task = task;
    let dest = match resolve_dest(&mut task, &info, platform.as_ref()) {
        Ok(d) => d,
        Err(e) => return (task, TransferResult::failed(e)),
    };

    // Fresh chunk plan, or the persisted one when resuming.
    let (sparse, mut chunks) = match &resume {
        Some(rd) => match reopen_for_resume(rd, &info, total, &cfg) {
            Ok(v) => v,
            Err(e) => {
                if let Ok(blob) = serde_json::from_str::<ParallelResumeBlob>(&rd.data) {
                    let _ = std::fs::remove_file(&blob.temp_path);
                }
                return (task, TransferResult::failed(e));
            }
        },
        None => {
            let temp_dir = match platform.support_path() {
                Ok(d) => d,
                Err(e) => return (task, TransferResult::failed(TaskError::file_system(e.to_string()))),
            };
            let sparse = match SparseFile::create_in(&temp_dir, total) {
                Ok(s) => s,
                Err(e) => return (task, TransferResult::failed(TaskError::file_system(e.to_string()))),
            };
            (sparse, plan_chunks(total, CHUNK_COUNT))
        }
    };

    let already_done: u64 = chunks.iter().map(|c| c.done).sum();
    remaining
        .lock()
        .unwrap()
        .insert(task.task_id.clone(), total - already_done);
    let _ = events.send(TransferEvent::Started {
        task: task.clone(),
        expected: ContentLength::Known(total),
        resumable: true,
    });
    let _ = events.send(TransferEvent::Progress {
        bytes_total: already_done,
    });

    let shared_done = Arc::new(AtomicU64::new(already_done));
    let outcomes: Vec<(usize, ChunkOutcome, u64)> = std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for (idx, chunk) in chunks.iter().enumerate() {
            if chunk.done >= chunk.end - chunk.start {
                continue;
            }
            let chunk = *chunk;
            let url = url.clone();
            let task_ref = &task;
            let cfg_ref = &cfg;
            let sparse = sparse.clone();
            let token = token.clone();
            let events = events.clone();
            let shared_done = Arc::clone(&shared_done);
            handles.push(scope.spawn(move || {
                let (outcome, done) = fetch_chunk(
                    &url,
                    task_ref,
                    cfg_ref,
                    chunk,
                    &sparse,
                    &token,
                    &events,
                    &shared_done,
                );
                (idx, outcome, done)
            }));
        }
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (idx, _, done) in &outcomes {
        chunks[*idx].done = *done;
    }
    let total_done: u64 = chunks.iter().map(|c| c.done).sum();

    let cancelled = outcomes
        .iter()
        .any(|(_, o, _)| matches!(o, ChunkOutcome::Cancelled));
    if cancelled || token.intent() == Intent::Cancel {
        let _ = sparse.delete();
        return (task, TransferResult::Canceled);
    }

    let paused = outcomes
        .iter()
        .any(|(_, o, _)| matches!(o, ChunkOutcome::Paused));
    if paused {
        let _ = sparse.sync();
        let blob = ParallelResumeBlob {
            temp_path: sparse.path().to_string_lossy().into_owned(),
            total,
            chunks: chunks.clone(),
        };
        let resume_data = ResumeData {
            task: task.clone(),
            data: serde_json::to_string(&blob).unwrap_or_default(),
            required_start_byte: total_done,
            e_tag: info.etag.clone(),
        };
        return (
            task,
            TransferResult::Paused {
                resume_data,
                auto_resume: false,
            },
        );
    }

    let first_failure = outcomes.iter().find_map(|(_, o, _)| match o {
        ChunkOutcome::Failed(e) => Some(e.clone()),
        _ => None,
    });
    if let Some(error) = first_failure {
        // Chunks are resumable by construction; keep the partial file when
        // it is worth it.
        let resume_data = if total_done >= MIN_RESUMABLE_BYTES {
            let _ = sparse.sync();
            let blob = ParallelResumeBlob {
                temp_path: sparse.path().to_string_lossy().into_owned(),
                total,
                chunks: chunks.clone(),
            };
            Some(ResumeData {
                task: task.clone(),
                data: serde_json::to_string(&blob).unwrap_or_default(),
                required_start_byte: total_done,
                e_tag: info.etag.clone(),
            })
        } else {
            let _ = sparse.delete();
            None
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

    if let Err(e) = sparse.sync() {
        return (task, TransferResult::failed(TaskError::file_system(e.to_string())));
    }
    let temp_path = sparse.path().to_path_buf();
    drop(sparse);
    if let Err(e) = platform.move_file(&temp_path, &dest) {
        let _ = std::fs::remove_file(&temp_path);
        return (task, TransferResult::failed(TaskError::file_system(e.to_string())));
    }
    tracing::info!(task_id = %task.task_id, dest = %dest.display(), total, "parallel download complete");
    (
        task,
        TransferResult::Complete {
            expected_file_size: total as i64,
            response_body: None,
        },
    )
}

/// HEAD probe, falling back to a one-byte range GET for servers that block
/// HEAD.
fn probe(url: &str, task: &Task, cfg: &EngineConfig) -> Result<ResponseInfo, TaskError> {
    let head = probe_once(url, task, cfg, true)?;
    if head.is_success() {
        return Ok(head);
    }
    let ranged = probe_once(url, task, cfg, false)?;
    if ranged.status == 206 {
        if let Some(cr) = ranged.content_range {
            let mut info = ranged;
            info.content_length = cr.total;
            info.content_range = None;
            info.accept_ranges = true;
            return Ok(info);
        }
    }
    Ok(if ranged.is_success() || ranged.status == 404 {
        ranged
    } else {
        head
    })
}

fn probe_once(
    url: &str,
    task: &Task,
    cfg: &EngineConfig,
    head: bool,
) -> Result<ResponseInfo, TaskError> {
    let mut easy = curl::easy::Easy::new();
    easy.url(url).map_err(|e| TaskError::url(e.to_string()))?;
    exchange::configure_easy(&mut easy, cfg).map_err(general)?;
    if head {
        easy.nobody(true).map_err(general)?;
    } else {
        easy.range("0-0").map_err(general)?;
    }
    let list = exchange::header_list(task, &[]).map_err(general)?;
    easy.http_headers(list).map_err(general)?;

    let collector = Arc::new(Mutex::new(HeaderCollector::default()));
    {
        let collector_cb = Arc::clone(&collector);
        let mut transfer = easy.transfer();
        transfer
            .header_function(move |data| {
                collector_cb.lock().unwrap().push(data);
                true
            })
            .map_err(general)?;
        transfer
            .write_function(|data| Ok(data.len()))
            .map_err(general)?;
        transfer
            .perform()
            .map_err(|e| crate::task::classify_curl_error(&e))?;
    }
    let info = collector.lock().unwrap().parse();
    Ok(info)
}

fn general(e: curl::Error) -> TaskError {
    TaskError::general(e.to_string())
}

fn resolve_dest(
    task: &mut Task,
    info: &ResponseInfo,
    platform: &dyn Platform,
) -> Result<PathBuf, TaskError> {
    let base = platform
        .base_path(task.base_directory)
        .map_err(|e| TaskError::file_system(e.to_string()))?;
    if task.wants_suggested_filename() {
        let suggested = naming::suggest_filename(info.content_disposition.as_deref(), &task.url)
            .unwrap_or_else(|| task.task_id.clone());
        *task = task.with_filename(suggested);
        let dest = naming::unique_path(&task.resolved_path(&base));
        if let Some(name) = dest.file_name() {
            *task = task.with_filename(name.to_string_lossy().into_owned());
        }
        Ok(dest)
    } else {
        Ok(task.resolved_path(&base))
    }
}

/// Validates the persisted blob against the re-probed entity and reopens the
/// preallocated temp file.
fn reopen_for_resume(
    rd: &ResumeData,
    info: &ResponseInfo,
    total: u64,
    cfg: &EngineConfig,
) -> Result<(SparseFile, Vec<ChunkProgress>), TaskError> {
    let blob: ParallelResumeBlob = serde_json::from_str(&rd.data)
        .map_err(|e| TaskError::resume(format!("continuation blob unreadable: {}", e)))?;
    if blob.total != total {
        return Err(TaskError::resume(format!(
            "entity size changed since pause: {} -> {}",
            blob.total, total
        )));
    }
    if let Some(stored) = &rd.e_tag {
        match &info.etag {
            Some(current) if etag_matches(stored, current, cfg.allow_weak_etag) => {}
            _ => return Err(TaskError::resume("entity tag changed since pause")),
        }
    }
    let sparse = SparseFile::open_existing(std::path::Path::new(&blob.temp_path))
        .map_err(|e| TaskError::resume(e.to_string()))?;
    Ok((sparse, blob.chunks))
}

/// Downloads one chunk's remaining bytes into the sparse file. Returns the
/// outcome and the chunk's new `done` count.
fn fetch_chunk(
    url: &str,
    task: &Task,
    cfg: &EngineConfig,
    chunk: ChunkProgress,
    sparse: &SparseFile,
    token: &ControlToken,
    events: &UnboundedSender<TransferEvent>,
    shared_done: &Arc<AtomicU64>,
) -> (ChunkOutcome, u64) {
    let mut easy = curl::easy::Easy::new();
    if let Err(e) = easy
        .url(url)
        .and_then(|_| exchange::configure_easy(&mut easy, cfg))
    {
        return (ChunkOutcome::Failed(general(e)), chunk.done);
    }
    let from = chunk.start + chunk.done;
    if let Err(e) = easy.range(&format!("{}-{}", from, chunk.end - 1)) {
        return (ChunkOutcome::Failed(general(e)), chunk.done);
    }
    match exchange::header_list(task, &[]) {
        Ok(list) => {
            if let Err(e) = easy.http_headers(list) {
                return (ChunkOutcome::Failed(general(e)), chunk.done);
            }
        }
        Err(e) => return (ChunkOutcome::Failed(general(e)), chunk.done),
    }

    let done = Arc::new(AtomicU64::new(chunk.done));
    let interrupted = Arc::new(Mutex::new(None::<ChunkOutcome>));
    let unreported = Arc::new(AtomicU64::new(0));

    let perform_result = {
        let done_cb = Arc::clone(&done);
        let interrupted_cb = Arc::clone(&interrupted);
        let unreported_cb = Arc::clone(&unreported);
        let sparse = sparse.clone();
        let token = token.clone();
        let events = events.clone();
        let shared_done = Arc::clone(shared_done);

        let mut transfer = easy.transfer();
        if let Err(e) = transfer.write_function(move |data| {
            match token.intent() {
                Intent::Cancel => {
                    *interrupted_cb.lock().unwrap() = Some(ChunkOutcome::Cancelled);
                    return Ok(0);
                }
                Intent::Pause => {
                    *interrupted_cb.lock().unwrap() = Some(ChunkOutcome::Paused);
                    return Ok(0);
                }
                Intent::None => {}
            }
            let offset = chunk.start + done_cb.load(Ordering::Relaxed);
            if let Err(e) = sparse.write_at(offset, data) {
                *interrupted_cb.lock().unwrap() = Some(ChunkOutcome::Failed(
                    TaskError::file_system(format!("write failed: {}", e)),
                ));
                return Ok(0);
            }
            done_cb.fetch_add(data.len() as u64, Ordering::Relaxed);
            let grand_total =
                shared_done.fetch_add(data.len() as u64, Ordering::Relaxed) + data.len() as u64;
            let pending = unreported_cb.fetch_add(data.len() as u64, Ordering::Relaxed)
                + data.len() as u64;
            if pending >= PROGRESS_GRANULARITY {
                unreported_cb.store(0, Ordering::Relaxed);
                let _ = events.send(TransferEvent::Progress {
                    bytes_total: grand_total,
                });
            }
            Ok(data.len())
        }) {
            return (ChunkOutcome::Failed(general(e)), chunk.done);
        }
        transfer.perform()
    };

    let new_done = done.load(Ordering::Relaxed);
    if let Some(outcome) = interrupted.lock().unwrap().take() {
        return (outcome, new_done);
    }
    if let Err(e) = perform_result {
        return (
            ChunkOutcome::Failed(crate::task::classify_curl_error(&e)),
            new_done,
        );
    }
    let code = easy.response_code().unwrap_or(0) as u16;
    if code != 206 && !(200..300).contains(&code) {
        return (
            ChunkOutcome::Failed(crate::task::classify_http_status(code, None)),
            new_done,
        );
    }
    let expected = chunk.end - chunk.start;
    if new_done != expected {
        return (
            ChunkOutcome::Failed(TaskError::connection(format!(
                "chunk ended early: {} of {} bytes",
                new_done, expected
            ))),
            new_done,
        );
    }
    // Settle any unreported tail so the final fraction is accurate.
    let _ = events.send(TransferEvent::Progress {
        bytes_total: shared_done.load(Ordering::Relaxed),
    });
    (ChunkOutcome::Done, new_done)
}
