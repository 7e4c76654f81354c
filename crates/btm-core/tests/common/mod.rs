//! Shared fixtures: in-tree HTTP server, recording host channel, sandboxed
//! platform, task builders.
#![allow(dead_code)]

pub mod http_server;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use btm_core::pipeline::{ChannelError, HostChannel};
use btm_core::platform::Platform;
use btm_core::store::DurableStore;
use btm_core::task::{
    BaseDirectory, HttpMethod, ProgressUpdate, ResumeData, StatusUpdate, Task, TaskKind,
    TaskStatus, Updates,
};

/// Host channel that records everything and can be taken offline.
pub struct TestChannel {
    online: AtomicBool,
    pub statuses: Mutex<Vec<StatusUpdate>>,
    pub progresses: Mutex<Vec<ProgressUpdate>>,
    pub resume_data: Mutex<Vec<ResumeData>>,
    pub can_resume: Mutex<Vec<(String, bool)>>,
}

impl TestChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(TestChannel {
            online: AtomicBool::new(true),
            statuses: Mutex::new(Vec::new()),
            progresses: Mutex::new(Vec::new()),
            resume_data: Mutex::new(Vec::new()),
            can_resume: Mutex::new(Vec::new()),
        })
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn statuses_for(&self, task_id: &str) -> Vec<TaskStatus> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.task.task_id == task_id)
            .map(|u| u.status)
            .collect()
    }

    pub fn progresses_for(&self, task_id: &str) -> Vec<f64> {
        self.progresses
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.task.task_id == task_id)
            .map(|u| u.progress)
            .collect()
    }

    pub fn last_status(&self, task_id: &str) -> Option<StatusUpdate> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.task.task_id == task_id)
            .last()
            .cloned()
    }

    /// Poll until the task reaches `status` or the timeout expires.
    pub async fn wait_for_status(&self, task_id: &str, status: TaskStatus, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.statuses_for(task_id).contains(&status) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {:?} on {}; saw {:?}",
                status,
                task_id,
                self.statuses_for(task_id)
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll until at least `n` progress updates exist for the task.
    pub async fn wait_for_progress_count(&self, task_id: &str, n: usize, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.progresses_for(task_id).len() < n {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {} progress updates on {}",
                n,
                task_id
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl HostChannel for TestChannel {
    fn status_update(&self, update: &StatusUpdate) -> Result<(), ChannelError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(ChannelError("offline".into()));
        }
        self.statuses.lock().unwrap().push(update.clone());
        Ok(())
    }

    fn progress_update(&self, update: &ProgressUpdate) -> Result<(), ChannelError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(ChannelError("offline".into()));
        }
        self.progresses.lock().unwrap().push(update.clone());
        Ok(())
    }

    fn can_resume(&self, task: &Task, can_resume: bool) -> Result<(), ChannelError> {
        self.can_resume
            .lock()
            .unwrap()
            .push((task.task_id.clone(), can_resume));
        Ok(())
    }

    fn resume_data(&self, data: &ResumeData) -> Result<(), ChannelError> {
        self.resume_data.lock().unwrap().push(data.clone());
        Ok(())
    }
}

/// Platform rooted in a scratch directory, with a switchable metered flag.
pub struct TestPlatform {
    root: PathBuf,
    metered: AtomicBool,
}

impl TestPlatform {
    pub fn new(root: &Path) -> Arc<Self> {
        Arc::new(TestPlatform {
            root: root.to_path_buf(),
            metered: AtomicBool::new(false),
        })
    }

    pub fn set_metered(&self, metered: bool) {
        self.metered.store(metered, Ordering::SeqCst);
    }

    pub fn documents_dir(&self) -> PathBuf {
        self.root.join("documents")
    }

    /// Every temp file currently on disk under the cache/support dirs.
    pub fn temp_files(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        for dir in [self.root.join("cache"), self.root.join("support")] {
            if let Ok(entries) = std::fs::read_dir(&dir) {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name.starts_with(btm_core::engine::TEMP_PREFIX) {
                        out.push(entry.path());
                    }
                }
            }
        }
        out
    }
}

impl Platform for TestPlatform {
    fn base_path(&self, base: BaseDirectory) -> anyhow::Result<PathBuf> {
        Ok(match base {
            BaseDirectory::ApplicationDocuments => self.root.join("documents"),
            BaseDirectory::Temporary => self.root.join("tmp"),
            BaseDirectory::ApplicationSupport => self.root.join("support"),
            BaseDirectory::ApplicationLibrary => self.root.join("library"),
            BaseDirectory::Root => PathBuf::new(),
        })
    }

    fn cache_path(&self) -> anyhow::Result<PathBuf> {
        let p = self.root.join("cache");
        std::fs::create_dir_all(&p)?;
        Ok(p)
    }

    fn support_path(&self) -> anyhow::Result<PathBuf> {
        let p = self.root.join("support");
        std::fs::create_dir_all(&p)?;
        Ok(p)
    }

    fn is_metered_network(&self) -> bool {
        self.metered.load(Ordering::SeqCst)
    }

    fn space_available(&self, _path: &Path) -> anyhow::Result<u64> {
        Ok(u64::MAX / 4)
    }

    fn move_file(&self, src: &Path, dst: &Path) -> anyhow::Result<()> {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if std::fs::rename(src, dst).is_err() {
            std::fs::copy(src, dst)?;
            std::fs::remove_file(src)?;
        }
        Ok(())
    }
}

pub async fn open_store(dir: &Path) -> DurableStore {
    DurableStore::open_at(&dir.join("store.db")).await.unwrap()
}

/// Deterministic test payload.
pub fn pattern_body(len: usize) -> Vec<u8> {
    (0u8..=255).cycle().take(len).collect()
}

pub fn download_task(id: &str, url: &str) -> Task {
    Task {
        task_id: id.to_string(),
        kind: TaskKind::Download,
        url: url.to_string(),
        url_query_parameters: HashMap::new(),
        headers: HashMap::new(),
        http_method: HttpMethod::Get,
        body: None,
        filename: format!("{}.bin", id),
        directory: String::new(),
        base_directory: BaseDirectory::ApplicationDocuments,
        group: "default".to_string(),
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
