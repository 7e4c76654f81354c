//! Upload path: binary (single file as the request body) and multipart
//! form-data framing. Uploads stream through curl's read callback with an
//! explicit Content-Length; they can be cancelled between chunks but never
//! paused.

use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;

use crate::config::EngineConfig;
use crate::control::{ControlToken, Intent};
use crate::platform::Platform;
use crate::task::{Task, TaskError, TaskKind};

use super::exchange;
use super::headers::{ContentLength, HeaderCollector};
use super::{TransferEvent, TransferResult};

/// Fixed per-process multipart boundary.
const BOUNDARY: &str = "-----------------------btm-7f2a9c41e803";

/// Cap on the captured server response body.
const RESPONSE_CAP: usize = 16 * 1024;

/// One part of a streamed request body.
enum Part {
    Bytes(Cursor<Vec<u8>>),
    File { file: File, remaining: u64 },
}

/// Request body assembled from memory segments and file handles, consumed
/// sequentially by the read callback without buffering whole files.
struct StreamBody {
    parts: Vec<Part>,
    index: usize,
    total_len: u64,
    sent: u64,
}

impl StreamBody {
    fn new(parts: Vec<Part>) -> Self {
        let total_len = parts
            .iter()
            .map(|p| match p {
                Part::Bytes(c) => c.get_ref().len() as u64,
                Part::File { remaining, .. } => *remaining,
            })
            .sum();
        StreamBody {
            parts,
            index: 0,
            total_len,
            sent: 0,
        }
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.index < self.parts.len() {
            let n = match &mut self.parts[self.index] {
                Part::Bytes(cursor) => cursor.read(buf)?,
                Part::File { file, remaining } => {
                    let want = buf.len().min(*remaining as usize);
                    if want == 0 {
                        0
                    } else {
                        let n = file.read(&mut buf[..want])?;
                        *remaining -= n as u64;
                        n
                    }
                }
            };
            if n > 0 {
                self.sent += n as u64;
                return Ok(n);
            }
            self.index += 1;
        }
        Ok(0)
    }
}

/// File entry of a multipart upload.
struct FileEntry {
    field: String,
    path: PathBuf,
    filename: String,
    mime_type: String,
}

/// Runs one upload exchange on the current (blocking) thread.
pub(super) fn run_upload_blocking(
    task: Task,
    cfg: EngineConfig,
    platform: Arc<dyn Platform>,
    token: ControlToken,
    events: UnboundedSender<TransferEvent>,
) -> (Task, TransferResult) {
    let url = match task.url_with_query() {
        Ok(u) => u,
        Err(e) => return (task, TransferResult::failed(e)),
    };

    let (body, extra_headers) = match build_body(&task, platform.as_ref()) {
        Ok(v) => v,
        Err(e) => return (task, TransferResult::failed(e)),
    };
    let total_len = body.total_len;

    let mut easy = curl::easy::Easy::new();
    if let Err(e) = easy.url(&url) {
        return (task, TransferResult::failed(TaskError::url(e.to_string())));
    }
    if let Err(e) = exchange::configure_easy(&mut easy, &cfg)
        .and_then(|_| exchange::apply_method(&mut easy, task.http_method, true))
        .and_then(|_| {
            if task.http_method == crate::task::HttpMethod::Put {
                easy.in_filesize(total_len)
            } else {
                easy.post_field_size(total_len)
            }
        })
    {
        return (task, TransferResult::failed(TaskError::general(e.to_string())));
    }
    match exchange::header_list(&task, &extra_headers) {
        Ok(list) => {
            if let Err(e) = easy.http_headers(list) {
                return (task, TransferResult::failed(TaskError::general(e.to_string())));
            }
        }
        Err(e) => return (task, TransferResult::failed(TaskError::general(e.to_string()))),
    }

    let _ = events.send(TransferEvent::Started {
        task: task.clone(),
        expected: ContentLength::Known(total_len),
        resumable: false,
    });
    let _ = events.send(TransferEvent::Progress { bytes_total: 0 });

    let collector = Arc::new(Mutex::new(HeaderCollector::default()));
    let response: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let body = Arc::new(Mutex::new(body));
    let cancelled = Arc::new(Mutex::new(false));

    let perform_result = {
        let collector_cb = Arc::clone(&collector);
        let response_cb = Arc::clone(&response);
        let body_cb = Arc::clone(&body);
        let cancelled_cb = Arc::clone(&cancelled);
        let events_cb = events.clone();

        let mut transfer = easy.transfer();
        if let Err(e) = transfer.header_function(move |data| {
            collector_cb.lock().unwrap().push(data);
            true
        }) {
            return (task, TransferResult::failed(TaskError::general(e.to_string())));
        }
        if let Err(e) = transfer.read_function(move |buf| {
            if token.intent() == Intent::Cancel {
                *cancelled_cb.lock().unwrap() = true;
                return Err(curl::easy::ReadError::Abort);
            }
            let mut body = body_cb.lock().unwrap();
            match body.read_chunk(buf) {
                Ok(n) => {
                    let _ = events_cb.send(TransferEvent::Progress {
                        bytes_total: body.sent,
                    });
                    Ok(n)
                }
                Err(_) => Err(curl::easy::ReadError::Abort),
            }
        }) {
            return (task, TransferResult::failed(TaskError::general(e.to_string())));
        }
        if let Err(e) = transfer.write_function(move |data| {
            let mut buf = response_cb.lock().unwrap();
            let room = RESPONSE_CAP.saturating_sub(buf.len());
            buf.extend_from_slice(&data[..data.len().min(room)]);
            Ok(data.len())
        }) {
            return (task, TransferResult::failed(TaskError::general(e.to_string())));
        }
        transfer.perform()
    };

    if *cancelled.lock().unwrap() {
        return (task, TransferResult::Canceled);
    }

    let response_body = {
        let buf = response.lock().unwrap();
        if buf.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&buf).into_owned())
        }
    };

    if let Err(e) = perform_result {
        return (task, TransferResult::failed(crate::task::classify_curl_error(&e)));
    }

    let status = collector.lock().unwrap().parse().status;
    match status {
        s if (200..300).contains(&s) => {
            tracing::info!(task_id = %task.task_id, bytes = total_len, "upload complete");
            (
                task,
                TransferResult::Complete {
                    expected_file_size: total_len as i64,
                    response_body,
                },
            )
        }
        404 => (task, TransferResult::NotFound { response_body }),
        s => {
            let error = crate::task::classify_http_status(s, response_body.as_deref());
            (
                task,
                TransferResult::Failed {
                    error,
                    response_body,
                    resume_data: None,
                },
            )
        }
    }
}

/// Assembles the request body and the headers it requires.
fn build_body(
    task: &Task,
    platform: &dyn Platform,
) -> Result<(StreamBody, Vec<(String, String)>), TaskError> {
    if task.kind == TaskKind::Upload && task.is_binary_upload() {
        let path = source_path(task, platform)?;
        let file = open_source(&path)?;
        let len = file.metadata().map_err(io_error)?.len();
        let mime = task
            .mime_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let headers = vec![
            ("Content-Type".to_string(), mime),
            ("Content-Length".to_string(), len.to_string()),
            // Suppress Expect: 100-continue; streamed bodies start at once.
            ("Expect".to_string(), String::new()),
        ];
        return Ok((
            StreamBody::new(vec![Part::File {
                file,
                remaining: len,
            }]),
            headers,
        ));
    }

    // Multipart form-data: file parts first, then form fields, then the
    // final boundary.
    let entries = file_entries(task, platform)?;
    let mut parts: Vec<Part> = Vec::new();
    for entry in entries {
        let file = open_source(&entry.path)?;
        let len = file.metadata().map_err(io_error)?.len();
        let head = format!(
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
            BOUNDARY, entry.field, entry.filename, entry.mime_type
        );
        parts.push(Part::Bytes(Cursor::new(head.into_bytes())));
        parts.push(Part::File {
            file,
            remaining: len,
        });
        parts.push(Part::Bytes(Cursor::new(b"\r\n".to_vec())));
    }
    for (name, value) in &task.fields {
        let field = format!(
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
            BOUNDARY, name, value
        );
        parts.push(Part::Bytes(Cursor::new(field.into_bytes())));
    }
    parts.push(Part::Bytes(Cursor::new(
        format!("--{}--\r\n", BOUNDARY).into_bytes(),
    )));

    let body = StreamBody::new(parts);
    let headers = vec![
        (
            "Content-Type".to_string(),
            format!("multipart/form-data; boundary={}", BOUNDARY),
        ),
        ("Content-Length".to_string(), body.total_len.to_string()),
        ("Expect".to_string(), String::new()),
    ];
    Ok((body, headers))
}

/// File parts of the upload. A plain `Upload` contributes its single file;
/// a `MultiUpload` carries parallel JSON arrays in `file_field`, `filename`
/// and `mime_type`.
fn file_entries(task: &Task, platform: &dyn Platform) -> Result<Vec<FileEntry>, TaskError> {
    if task.kind == TaskKind::MultiUpload {
        let fields: Vec<String> = decode_list(task.file_field.as_deref(), "fileField")?;
        let names: Vec<String> = decode_list(Some(task.filename.as_str()), "filename")?;
        let mimes: Vec<String> = decode_list(task.mime_type.as_deref(), "mimeType")?;
        if fields.len() != names.len() || names.len() != mimes.len() {
            return Err(TaskError::general(
                "multi-upload fileField/filename/mimeType lists differ in length",
            ));
        }
        let base = platform
            .base_path(task.base_directory)
            .map_err(|e| TaskError::file_system(e.to_string()))?;
        let mut out = Vec::with_capacity(fields.len());
        for ((field, name), mime) in fields.into_iter().zip(names).zip(mimes) {
            let path = if Path::new(&name).is_absolute() {
                PathBuf::from(&name)
            } else {
                task.with_filename(name.clone()).resolved_path(&base)
            };
            let filename = path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or(name);
            out.push(FileEntry {
                field,
                path,
                filename,
                mime_type: mime,
            });
        }
        return Ok(out);
    }

    let path = source_path(task, platform)?;
    Ok(vec![FileEntry {
        field: task
            .file_field
            .clone()
            .unwrap_or_else(|| "file".to_string()),
        path,
        filename: task.filename.clone(),
        mime_type: task
            .mime_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string()),
    }])
}

fn source_path(task: &Task, platform: &dyn Platform) -> Result<PathBuf, TaskError> {
    let base = platform
        .base_path(task.base_directory)
        .map_err(|e| TaskError::file_system(e.to_string()))?;
    Ok(task.resolved_path(&base))
}

fn open_source(path: &Path) -> Result<File, TaskError> {
    File::open(path)
        .map_err(|e| TaskError::file_system(format!("cannot open {}: {}", path.display(), e)))
}

fn decode_list(raw: Option<&str>, what: &str) -> Result<Vec<String>, TaskError> {
    let raw = raw.ok_or_else(|| TaskError::general(format!("multi-upload missing {}", what)))?;
    serde_json::from_str(raw)
        .map_err(|e| TaskError::general(format!("multi-upload {} is not a JSON list: {}", what, e)))
}

fn io_error(e: std::io::Error) -> TaskError {
    TaskError::file_system(e.to_string())
}
