//! Data-request path: like a download, but the body is captured in memory
//! and surfaced to the caller as a UTF-8 string on the terminal transition.
//! No file is ever written.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;

use crate::config::EngineConfig;
use crate::control::{ControlToken, Intent};
use crate::task::{Task, TaskError};

use super::exchange;
use super::headers::HeaderCollector;
use super::{TransferEvent, TransferResult};

struct DataState {
    collector: HeaderCollector,
    body: Vec<u8>,
    started: bool,
    cancelled: bool,
}

/// Runs one data-request exchange on the current (blocking) thread.
pub(super) fn run_data_blocking(
    task: Task,
    cfg: EngineConfig,
    token: ControlToken,
    events: UnboundedSender<TransferEvent>,
) -> (Task, TransferResult) {
    let url = match task.url_with_query() {
        Ok(u) => u,
        Err(e) => return (task, TransferResult::failed(e)),
    };

    let mut easy = curl::easy::Easy::new();
    if let Err(e) = easy.url(&url) {
        return (task, TransferResult::failed(TaskError::url(e.to_string())));
    }
    if let Err(e) = exchange::configure_easy(&mut easy, &cfg)
        .and_then(|_| exchange::apply_method(&mut easy, task.http_method, false))
    {
        return (task, TransferResult::failed(TaskError::general(e.to_string())));
    }
    if let Err(e) = exchange::apply_body(&mut easy, &task) {
        return (task, TransferResult::failed(e));
    }
    match exchange::header_list(&task, &[]) {
        Ok(list) => {
            if let Err(e) = easy.http_headers(list) {
                return (task, TransferResult::failed(TaskError::general(e.to_string())));
            }
        }
        Err(e) => return (task, TransferResult::failed(TaskError::general(e.to_string()))),
    }

    let state = Arc::new(Mutex::new(DataState {
        collector: HeaderCollector::default(),
        body: Vec::new(),
        started: false,
        cancelled: false,
    }));

    let perform_result = {
        let header_state = Arc::clone(&state);
        let write_state = Arc::clone(&state);
        let events_cb = events.clone();
        let task_cb = task.clone();

        let mut transfer = easy.transfer();
        if let Err(e) = transfer.header_function(move |data| {
            header_state.lock().unwrap().collector.push(data);
            true
        }) {
            return (task, TransferResult::failed(TaskError::general(e.to_string())));
        }
        if let Err(e) = transfer.write_function(move |data| {
            let mut st = write_state.lock().unwrap();
            if token.intent() == Intent::Cancel {
                st.cancelled = true;
                return Ok(0);
            }
            if !st.started {
                st.started = true;
                let info = st.collector.parse();
                let _ = events_cb.send(TransferEvent::Started {
                    task: task_cb.clone(),
                    expected: info.expected_length(&task_cb.headers),
                    resumable: false,
                });
                let _ = events_cb.send(TransferEvent::Progress { bytes_total: 0 });
            }
            st.body.extend_from_slice(data);
            Ok(data.len())
        }) {
            return (task, TransferResult::failed(TaskError::general(e.to_string())));
        }
        transfer.perform()
    };

    let mut st = state.lock().unwrap();
    if st.cancelled {
        return (task, TransferResult::Canceled);
    }
    // An empty body never enters the write callback; the exchange still ran.
    if !st.started {
        st.started = true;
        let info = st.collector.parse();
        let _ = events.send(TransferEvent::Started {
            task: task.clone(),
            expected: info.expected_length(&task.headers),
            resumable: false,
        });
    }
    let response_body = if st.body.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&st.body).into_owned())
    };

    if let Err(e) = perform_result {
        return (task, TransferResult::failed(crate::task::classify_curl_error(&e)));
    }

    let info = st.collector.parse();
    match info.status {
        s if (200..300).contains(&s) => (
            task,
            TransferResult::Complete {
                expected_file_size: st.body.len() as i64,
                response_body,
            },
        ),
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
