//! Shared curl (libcurl easy) request setup.

use curl::easy::{Easy, List};
use std::time::Duration;

use crate::config::EngineConfig;
use crate::task::{HttpMethod, Task, TaskBody, TaskError};

/// Applies redirect policy, timeouts and proxy from the engine config.
/// The request timeout acts as both connect and inactivity timeout; the
/// resource timeout caps the whole exchange.
pub(super) fn configure_easy(easy: &mut Easy, cfg: &EngineConfig) -> Result<(), curl::Error> {
    easy.follow_location(true)?;
    easy.max_redirections(10)?;
    easy.connect_timeout(Duration::from_secs(cfg.request_timeout_seconds))?;
    easy.low_speed_limit(1)?;
    easy.low_speed_time(Duration::from_secs(cfg.request_timeout_seconds))?;
    easy.timeout(Duration::from_secs(cfg.resource_timeout_seconds))?;
    if let Some(addr) = &cfg.proxy_address {
        easy.proxy(addr)?;
        if let Some(port) = cfg.proxy_port {
            easy.proxy_port(port)?;
        }
    }
    Ok(())
}

/// Selects the HTTP method on the handle. `streams_body` marks exchanges
/// that feed the request body through the read callback.
pub(super) fn apply_method(
    easy: &mut Easy,
    method: HttpMethod,
    streams_body: bool,
) -> Result<(), curl::Error> {
    match method {
        HttpMethod::Get => easy.get(true)?,
        HttpMethod::Head => easy.nobody(true)?,
        HttpMethod::Put if streams_body => easy.upload(true)?,
        HttpMethod::Post if streams_body => {
            easy.post(true)?;
        }
        other => {
            if streams_body {
                easy.post(true)?;
            }
            easy.custom_request(other.as_str())?;
        }
    }
    Ok(())
}

/// Builds the outgoing header list: the task's own headers plus any extras
/// the engine adds (rewritten Range, multipart Content-Type, ...).
pub(super) fn header_list(
    task: &Task,
    extra: &[(String, String)],
) -> Result<List, curl::Error> {
    let mut list = List::new();
    for (k, v) in &task.headers {
        // A caller-supplied Range is rewritten by the engine on resume and
        // passed through `extra` instead.
        if k.eq_ignore_ascii_case("Range") && extra.iter().any(|(ek, _)| ek == "Range") {
            continue;
        }
        list.append(&format!("{}: {}", k.trim(), v.trim()))?;
    }
    for (k, v) in extra {
        if v.is_empty() {
            // "Name:" removes a header libcurl would otherwise add.
            list.append(&format!("{}:", k))?;
        } else {
            list.append(&format!("{}: {}", k, v))?;
        }
    }
    Ok(list)
}

/// Encodes the task body for download/data-request exchanges and installs it
/// as the request body with an explicit Content-Length.
pub(super) fn apply_body(easy: &mut Easy, task: &Task) -> Result<bool, TaskError> {
    let Some(body) = &task.body else {
        return Ok(false);
    };
    let bytes: Vec<u8> = match body {
        TaskBody::Text(s) => s.clone().into_bytes(),
        TaskBody::Bytes(b) => b.clone(),
        TaskBody::Form(fields) => {
            let mut ser = url::form_urlencoded::Serializer::new(String::new());
            for (k, v) in fields {
                ser.append_pair(k, v);
            }
            ser.finish().into_bytes()
        }
    };
    easy.post(true)
        .and_then(|_| easy.post_field_size(bytes.len() as u64))
        .and_then(|_| easy.post_fields_copy(&bytes))
        .map_err(|e| TaskError::general(e.to_string()))?;
    if task.http_method != HttpMethod::Post {
        easy.custom_request(task.http_method.as_str())
            .map_err(|e| TaskError::general(e.to_string()))?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{BaseDirectory, TaskKind, Updates};
    use std::collections::HashMap;

    fn task_with_headers(headers: HashMap<String, String>) -> Task {
        Task {
            task_id: "x".into(),
            kind: TaskKind::Download,
            url: "https://example.com/".into(),
            url_query_parameters: HashMap::new(),
            headers,
            http_method: HttpMethod::Get,
            body: None,
            filename: "f".into(),
            directory: String::new(),
            base_directory: BaseDirectory::ApplicationDocuments,
            group: "default".into(),
            updates: Updates::Status,
            requires_wifi: false,
            retries: 0,
            retries_remaining: 0,
            allow_pause: false,
            priority: 5,
            creation_time: 0,
            meta_data: String::new(),
            display_name: String::new(),
            file_field: None,
            mime_type: None,
            fields: HashMap::new(),
        }
    }

    #[test]
    fn header_list_builds_without_error() {
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer t".to_string());
        headers.insert("Range".to_string(), "bytes=0-99".to_string());
        let task = task_with_headers(headers);
        // The engine rewrites Range on resume; the original must be dropped.
        let extra = vec![("Range".to_string(), "bytes=50-99".to_string())];
        assert!(header_list(&task, &extra).is_ok());
        assert!(header_list(&task, &[]).is_ok());
    }
}
