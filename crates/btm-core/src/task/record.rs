//! Durable and wire payloads derived from a task: resume state, the tracking
//! record mirrored for host queries, and the status/progress update frames.

use serde::{Deserialize, Serialize};

use super::{Task, TaskError, TaskStatus};

/// Everything needed to restart a paused (or resumably-failed) download
/// without re-fetching completed bytes. Owned by the durable store while the
/// task is paused; consumed by the transfer engine on resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeData {
    pub task: Task,
    /// For a plain download: the temp file path. For a parallel download:
    /// the serialized per-chunk continuation blob.
    pub data: String,
    /// Bytes already persisted; the next attempt starts at this offset
    /// within the task's requested range.
    pub required_start_byte: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e_tag: Option<String>,
}

/// Mirror of a task's last known state, retained for host queries when task
/// tracking is enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task: Task,
    pub status: TaskStatus,
    pub progress: f64,
    /// Expected size in bytes, `-1` when unknown.
    pub expected_file_size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<TaskError>,
}

impl TaskRecord {
    pub fn enqueued(task: Task) -> Self {
        TaskRecord {
            task,
            status: TaskStatus::Enqueued,
            progress: 0.0,
            expected_file_size: -1,
            exception: None,
        }
    }
}

/// One status transition as delivered on the host channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub task: Task,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<TaskError>,
    /// Server response body excerpt, for data-request results and failure
    /// diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
}

/// One progress sample as delivered on the host channel. `progress` is in
/// `[0.0, 1.0]` while running, or a terminal sentinel (`1.0` complete,
/// `-1.0..-5.0` for the non-complete outcomes).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub task: Task,
    pub progress: f64,
    /// Expected size in bytes, `-1` when unknown.
    pub expected_file_size: i64,
    /// Rolling network speed in MB/s; `-1.0` when not yet measurable.
    pub network_speed: f64,
    /// Estimated remaining time in milliseconds; `-1` when not measurable.
    pub time_remaining_ms: i64,
}

/// Which undelivered-update collection a payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndeliveredKind {
    Status,
    Progress,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskKind, HttpMethod, BaseDirectory, Updates};
    use std::collections::HashMap;

    fn task() -> Task {
        Task {
            task_id: "r1".into(),
            kind: TaskKind::Download,
            url: "https://example.com/f".into(),
            url_query_parameters: HashMap::new(),
            headers: HashMap::new(),
            http_method: HttpMethod::Get,
            body: None,
            filename: "f.bin".into(),
            directory: String::new(),
            base_directory: BaseDirectory::ApplicationDocuments,
            group: "default".into(),
            updates: Updates::StatusAndProgress,
            requires_wifi: false,
            retries: 0,
            retries_remaining: 0,
            allow_pause: true,
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
    fn resume_data_roundtrip_is_identical() {
        let rd = ResumeData {
            task: task(),
            data: "/tmp/com.btm.partial123".into(),
            required_start_byte: 2 * 1024 * 1024,
            e_tag: Some("\"abc\"".into()),
        };
        let json = serde_json::to_string(&rd).unwrap();
        let back: ResumeData = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rd);
    }

    #[test]
    fn record_starts_enqueued_with_unknown_size() {
        let r = TaskRecord::enqueued(task());
        assert_eq!(r.status, TaskStatus::Enqueued);
        assert_eq!(r.expected_file_size, -1);
        assert!(r.exception.is_none());
    }
}
