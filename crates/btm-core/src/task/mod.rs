//! Transfer task model: value types, identity, wire encoding, invariants.
//!
//! A `Task` is the immutable specification of one transfer. Identity, equality
//! and hashing are by `task_id` alone; everything else is payload. The wire
//! encoding is JSON with a `taskType` tag; unknown fields are ignored, an
//! unknown tag is rejected at decode time.

mod status;
mod error;
mod record;

pub use error::{classify_curl_error, classify_http_status, is_timeout, TaskError};
pub use record::{ProgressUpdate, ResumeData, StatusUpdate, TaskRecord, UndeliveredKind};
pub use status::TaskStatus;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

/// Body sentinel selecting binary (single-file, non-multipart) upload.
pub const BINARY_BODY: &str = "binary";

/// Default task group.
pub const DEFAULT_GROUP: &str = "default";

/// Kind of transfer a task performs. Serialized as the `taskType` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    Download,
    Upload,
    DataRequest,
    ParallelDownload,
    MultiUpload,
}

impl TaskKind {
    /// True for kinds that write a destination file.
    pub fn writes_file(self) -> bool {
        matches!(self, TaskKind::Download | TaskKind::ParallelDownload)
    }

    /// True for kinds that send a file as the request body.
    pub fn is_upload(self) -> bool {
        matches!(self, TaskKind::Upload | TaskKind::MultiUpload)
    }
}

/// HTTP method of the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HttpMethod {
    #[default]
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
    #[serde(rename = "HEAD")]
    Head,
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "PATCH")]
    Patch,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Head => "HEAD",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
        }
    }
}

/// Which update streams the host wants for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Updates {
    None,
    #[default]
    Status,
    Progress,
    StatusAndProgress,
}

impl Updates {
    pub fn wants_status(self) -> bool {
        matches!(self, Updates::Status | Updates::StatusAndProgress)
    }

    pub fn wants_progress(self) -> bool {
        matches!(self, Updates::Progress | Updates::StatusAndProgress)
    }
}

/// Root against which a task's `directory` is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BaseDirectory {
    #[default]
    ApplicationDocuments,
    Temporary,
    ApplicationSupport,
    ApplicationLibrary,
    /// Empty prefix; the absolute path is carried in `directory`.
    Root,
}

/// Request body of a download or data-request task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskBody {
    Text(String),
    Bytes(Vec<u8>),
    Form(HashMap<String, String>),
}

/// One transfer specification. Immutable except through explicit copy-with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    #[serde(rename = "taskType")]
    pub kind: TaskKind,
    pub url: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub url_query_parameters: HashMap<String, String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub http_method: HttpMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<TaskBody>,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub directory: String,
    #[serde(default)]
    pub base_directory: BaseDirectory,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default)]
    pub updates: Updates,
    #[serde(default)]
    pub requires_wifi: bool,
    #[serde(default)]
    pub retries: u8,
    #[serde(default)]
    pub retries_remaining: u8,
    #[serde(default)]
    pub allow_pause: bool,
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Creation time in milliseconds since the Unix epoch.
    #[serde(default)]
    pub creation_time: i64,
    #[serde(default)]
    pub meta_data: String,
    #[serde(default)]
    pub display_name: String,
    /// Upload only: form field name for the file part.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_field: Option<String>,
    /// Upload only: MIME type of the file part.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Upload only: additional form fields.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub fields: HashMap<String, String>,
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

fn default_priority() -> u8 {
    5
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.task_id == other.task_id
    }
}

impl Eq for Task {}

impl Hash for Task {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.task_id.hash(state);
    }
}

impl Task {
    /// Checks the enqueue-time invariants. A task that fails here is rejected
    /// before it ever reaches the holding queue.
    pub fn validate(&self) -> Result<(), TaskError> {
        if self.task_id.is_empty() {
            return Err(TaskError::general("taskId must not be empty"));
        }
        if self.filename.contains('/') || self.filename.contains('\\') {
            return Err(TaskError::file_system(format!(
                "filename must not contain a path separator: {}",
                self.filename
            )));
        }
        if self.base_directory != BaseDirectory::Root && Path::new(&self.directory).is_absolute() {
            return Err(TaskError::file_system(format!(
                "directory must not be absolute: {}",
                self.directory
            )));
        }
        if self.retries > 10 {
            return Err(TaskError::general(format!(
                "retries must be in 0..=10, got {}",
                self.retries
            )));
        }
        if self.allow_pause && self.http_method != HttpMethod::Get {
            return Err(TaskError::general(
                "allowPause requires httpMethod GET".to_string(),
            ));
        }
        if url::Url::parse(&self.url).is_err() {
            return Err(TaskError::url(format!("invalid url: {}", self.url)));
        }
        Ok(())
    }

    /// Effective request URL with `url_query_parameters` merged in.
    pub fn url_with_query(&self) -> Result<String, TaskError> {
        if self.url_query_parameters.is_empty() {
            return Ok(self.url.clone());
        }
        let mut parsed =
            url::Url::parse(&self.url).map_err(|e| TaskError::url(format!("{}: {}", self.url, e)))?;
        for (k, v) in &self.url_query_parameters {
            parsed.query_pairs_mut().append_pair(k, v);
        }
        Ok(parsed.into())
    }

    /// Host component of the task URL, used for per-host admission caps.
    /// Falls back to the empty string when the URL does not parse.
    pub fn host(&self) -> String {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_default()
    }

    /// Resolves the destination (or source, for uploads) file path:
    /// `base / directory / filename`. `Root` contributes an empty prefix, so
    /// the absolute path must be carried in `directory`.
    pub fn resolved_path(&self, base: &Path) -> PathBuf {
        let mut p = base.to_path_buf();
        if !self.directory.is_empty() {
            p.push(&self.directory);
        }
        p.push(&self.filename);
        p
    }

    /// True when the upload body is the single-file binary stream rather than
    /// a multipart form.
    pub fn is_binary_upload(&self) -> bool {
        matches!(&self.body, Some(TaskBody::Text(s)) if s == BINARY_BODY)
    }

    /// True when the download filename should be derived from the response.
    pub fn wants_suggested_filename(&self) -> bool {
        self.filename == "?"
    }

    /// Copy with a replaced filename (used once the server suggests one).
    pub fn with_filename(&self, filename: String) -> Task {
        Task {
            filename,
            ..self.clone()
        }
    }

    /// Copy with the retry counter decremented (used on re-enqueue after
    /// `WaitingToRetry`).
    pub fn with_one_retry_spent(&self) -> Task {
        Task {
            retries_remaining: self.retries_remaining.saturating_sub(1),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn download_task(id: &str, url: &str) -> Task {
        Task {
            task_id: id.to_string(),
            kind: TaskKind::Download,
            url: url.to_string(),
            url_query_parameters: HashMap::new(),
            headers: HashMap::new(),
            http_method: HttpMethod::Get,
            body: None,
            filename: "file.bin".to_string(),
            directory: String::new(),
            base_directory: BaseDirectory::ApplicationDocuments,
            group: DEFAULT_GROUP.to_string(),
            updates: Updates::StatusAndProgress,
            requires_wifi: false,
            retries: 0,
            retries_remaining: 0,
            allow_pause: false,
            priority: 5,
            creation_time: 1_700_000_000_000,
            meta_data: String::new(),
            display_name: String::new(),
            file_field: None,
            mime_type: None,
            fields: HashMap::new(),
        }
    }

    #[test]
    fn equality_and_hash_are_by_task_id_only() {
        use std::collections::HashSet;
        let a = download_task("t1", "https://example.com/a");
        let mut b = download_task("t1", "https://example.com/b");
        b.priority = 0;
        assert_eq!(a, b);
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn json_roundtrip_preserves_task() {
        let mut t = download_task("rt", "https://example.com/f?x=1");
        t.headers.insert("Authorization".into(), "Bearer abc".into());
        t.body = Some(TaskBody::Text("payload".into()));
        t.retries = 3;
        t.retries_remaining = 2;
        let json = serde_json::to_string(&t).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.task_id, t.task_id);
        assert_eq!(back.kind, t.kind);
        assert_eq!(back.headers, t.headers);
        assert_eq!(back.body, t.body);
        assert_eq!(back.retries_remaining, 2);
    }

    #[test]
    fn unknown_task_type_is_rejected_unknown_fields_ignored() {
        let bad = r#"{"taskId":"x","taskType":"Mystery","url":"https://e.com/"}"#;
        assert!(serde_json::from_str::<Task>(bad).is_err());
        let extra = r#"{"taskId":"x","taskType":"Download","url":"https://e.com/","zzz":42}"#;
        let t: Task = serde_json::from_str(extra).unwrap();
        assert_eq!(t.kind, TaskKind::Download);
    }

    #[test]
    fn validate_rejects_path_separator_in_filename() {
        let mut t = download_task("v1", "https://example.com/a");
        t.filename = "dir/evil.bin".to_string();
        assert!(matches!(t.validate(), Err(TaskError::FileSystem { .. })));
    }

    #[test]
    fn validate_rejects_absolute_directory_except_root() {
        let mut t = download_task("v2", "https://example.com/a");
        t.directory = "/etc".to_string();
        assert!(t.validate().is_err());
        t.base_directory = BaseDirectory::Root;
        assert!(t.validate().is_ok());
    }

    #[test]
    fn validate_rejects_pause_on_non_get() {
        let mut t = download_task("v3", "https://example.com/a");
        t.allow_pause = true;
        assert!(t.validate().is_ok());
        t.http_method = HttpMethod::Post;
        assert!(t.validate().is_err());
    }

    #[test]
    fn validate_rejects_excess_retries() {
        let mut t = download_task("v4", "https://example.com/a");
        t.retries = 11;
        assert!(t.validate().is_err());
    }

    #[test]
    fn resolved_path_joins_base_directory_and_filename() {
        let mut t = download_task("p1", "https://example.com/a");
        t.directory = "sub".to_string();
        let p = t.resolved_path(Path::new("/base"));
        assert_eq!(p, PathBuf::from("/base/sub/file.bin"));
    }

    #[test]
    fn url_with_query_merges_parameters() {
        let mut t = download_task("q1", "https://example.com/a?k=1");
        t.url_query_parameters.insert("extra".into(), "2".into());
        let u = t.url_with_query().unwrap();
        assert!(u.contains("k=1"));
        assert!(u.contains("extra=2"));
    }

    #[test]
    fn binary_upload_sentinel() {
        let mut t = download_task("b1", "https://example.com/a");
        t.kind = TaskKind::Upload;
        assert!(!t.is_binary_upload());
        t.body = Some(TaskBody::Text(BINARY_BODY.into()));
        assert!(t.is_binary_upload());
    }
}
