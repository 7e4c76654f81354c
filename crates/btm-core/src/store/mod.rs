//! Durable keyed document store (SQLite via sqlx).
//!
//! Holds tasks, paused-task resume blobs, and undelivered updates so the
//! engine can survive process restarts. Writes are atomic per document;
//! reads are best-effort (a corrupt document is reported as missing).

mod db;

pub use db::DurableStore;

/// Collection names. A collection is just a key prefix inside the single
/// `documents` table; writes within one collection are serialized by SQLite.
pub mod collection {
    pub const TASKS: &str = "tasks";
    pub const PAUSED_TASKS: &str = "pausedTasks";
    pub const RESUME_DATA: &str = "resumeData";
    pub const UNDELIVERED_STATUS: &str = "undeliveredStatus";
    pub const UNDELIVERED_PROGRESS: &str = "undeliveredProgress";
    pub const METADATA: &str = "metadata";
}

/// Current schema version, stored in `metadata.version`. A mismatch on open
/// triggers the one-shot migration routine named in `metadata.migrator`.
pub const SCHEMA_VERSION: u32 = 1;

/// Per-document rewrite applied during a schema migration. Runs once over
/// every stored document; returning `None` drops the document.
pub trait StoreMigrator: Send + Sync {
    fn migrate(
        &self,
        collection: &str,
        id: &str,
        doc: serde_json::Value,
    ) -> Option<serde_json::Value>;
}

/// Migrator that drops every non-metadata document, forcing a clean rebuild.
/// Registered under the name `"rebuild"` by default.
pub struct RebuildMigrator;

impl StoreMigrator for RebuildMigrator {
    fn migrate(
        &self,
        collection: &str,
        _id: &str,
        doc: serde_json::Value,
    ) -> Option<serde_json::Value> {
        if collection == collection::METADATA {
            Some(doc)
        } else {
            None
        }
    }
}
