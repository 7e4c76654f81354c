//! Host-visible failure taxonomy and transport error classification.

use serde::{Deserialize, Serialize};

/// Why a transfer failed. This is the taxonomy surfaced to the host on a
/// `Failed`/`NotFound` status update; transport (curl) errors, HTTP statuses
/// and I/O failures are all folded into it by the classifiers below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type")]
pub enum TaskError {
    #[error("{description}")]
    General { description: String },
    #[error("{description}")]
    FileSystem { description: String },
    #[error("{description}")]
    Url { description: String },
    #[error("{description}")]
    Connection { description: String },
    #[error("{description}")]
    Resume { description: String },
    #[error("HTTP {http_response_code}: {description}")]
    HttpResponse {
        http_response_code: u16,
        description: String,
    },
}

impl TaskError {
    pub fn general(description: impl Into<String>) -> Self {
        TaskError::General {
            description: description.into(),
        }
    }

    pub fn file_system(description: impl Into<String>) -> Self {
        TaskError::FileSystem {
            description: description.into(),
        }
    }

    pub fn url(description: impl Into<String>) -> Self {
        TaskError::Url {
            description: description.into(),
        }
    }

    pub fn connection(description: impl Into<String>) -> Self {
        TaskError::Connection {
            description: description.into(),
        }
    }

    pub fn resume(description: impl Into<String>) -> Self {
        TaskError::Resume {
            description: description.into(),
        }
    }

    pub fn http(code: u16, description: impl Into<String>) -> Self {
        TaskError::HttpResponse {
            http_response_code: code,
            description: description.into(),
        }
    }

    /// Taxonomy name as sent over the host channel.
    pub fn kind_str(&self) -> &'static str {
        match self {
            TaskError::General { .. } => "General",
            TaskError::FileSystem { .. } => "FileSystem",
            TaskError::Url { .. } => "Url",
            TaskError::Connection { .. } => "Connection",
            TaskError::Resume { .. } => "Resume",
            TaskError::HttpResponse { .. } => "HttpResponse",
        }
    }

    pub fn description(&self) -> &str {
        match self {
            TaskError::General { description }
            | TaskError::FileSystem { description }
            | TaskError::Url { description }
            | TaskError::Connection { description }
            | TaskError::Resume { description }
            | TaskError::HttpResponse { description, .. } => description,
        }
    }

    pub fn http_response_code(&self) -> Option<u16> {
        match self {
            TaskError::HttpResponse {
                http_response_code, ..
            } => Some(*http_response_code),
            _ => None,
        }
    }

    /// Recovery policy: which failures are eligible for a retry when the task
    /// still has retries left. `Connection` (network, timeout) and 5xx retry;
    /// `FileSystem`, `Resume`, `Url`, 4xx and everything else fail outright.
    pub fn is_retryable(&self) -> bool {
        match self {
            TaskError::Connection { .. } => true,
            TaskError::HttpResponse {
                http_response_code, ..
            } => (500..=599).contains(http_response_code),
            _ => false,
        }
    }
}

/// Classifies a non-2xx HTTP status. 404 is handled by the caller (it maps to
/// the `NotFound` status, not to an error-carrying `Failed`).
pub fn classify_http_status(code: u16, body_excerpt: Option<&str>) -> TaskError {
    let description = match body_excerpt {
        Some(b) if !b.is_empty() => b.to_string(),
        _ => format!("server responded {}", code),
    };
    TaskError::http(code, description)
}

/// Classifies a curl transport error. Timeouts and network-level failures are
/// `Connection`; anything libcurl reports that we do not recognize surfaces
/// as `General` with the underlying description attached.
pub fn classify_curl_error(e: &curl::Error) -> TaskError {
    if e.is_operation_timedout() {
        return TaskError::connection(format!("timeout: {}", e));
    }
    if e.is_couldnt_connect()
        || e.is_couldnt_resolve_host()
        || e.is_couldnt_resolve_proxy()
        || e.is_read_error()
        || e.is_recv_error()
        || e.is_send_error()
        || e.is_got_nothing()
        || e.is_partial_file()
    {
        return TaskError::connection(e.to_string());
    }
    if e.is_url_malformed() || e.is_unsupported_protocol() {
        return TaskError::url(e.to_string());
    }
    TaskError::general(e.to_string())
}

/// True when the transport error is a timeout (request or resource), which
/// drives the auto-pause path for resumable tasks.
pub fn is_timeout(e: &curl::Error) -> bool {
    e.is_operation_timedout()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_and_5xx_are_retryable() {
        assert!(TaskError::connection("reset").is_retryable());
        assert!(TaskError::http(503, "busy").is_retryable());
        assert!(TaskError::http(500, "boom").is_retryable());
    }

    #[test]
    fn client_errors_and_local_failures_are_not_retryable() {
        assert!(!TaskError::http(403, "forbidden").is_retryable());
        assert!(!TaskError::http(404, "missing").is_retryable());
        assert!(!TaskError::file_system("disk full").is_retryable());
        assert!(!TaskError::resume("etag changed").is_retryable());
        assert!(!TaskError::general("???").is_retryable());
    }

    #[test]
    fn http_classification_prefers_body_excerpt() {
        let e = classify_http_status(500, Some("upstream exploded"));
        assert_eq!(e.http_response_code(), Some(500));
        assert_eq!(e.description(), "upstream exploded");
        let e = classify_http_status(502, None);
        assert!(e.description().contains("502"));
    }

    #[test]
    fn error_json_roundtrip() {
        let e = TaskError::http(503, "busy");
        let json = serde_json::to_string(&e).unwrap();
        let back: TaskError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
        assert_eq!(back.kind_str(), "HttpResponse");
    }
}
