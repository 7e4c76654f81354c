//! Transfer engine: one worker per admitted task, each holding at most one
//! in-flight HTTP exchange.
//!
//! The blocking exchange runs on the blocking thread pool and reports back
//! over an event channel; the async side forwards progress into the update
//! pipeline and hands the final result to the scheduler through the outcome
//! channel. The engine holds no reference back to the scheduler.

mod data;
mod download;
mod exchange;
mod headers;
mod parallel;
mod partfile;
mod upload;

pub use headers::ContentLength;
pub use parallel::{ChunkProgress, ParallelResumeBlob};
pub use partfile::TEMP_PREFIX;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

use crate::config::EngineConfig;
use crate::control::TransferControl;
use crate::pipeline::UpdatePipeline;
use crate::platform::Platform;
use crate::registry::{CallbackRegistry, ON_AUTH, ON_TASK_START};
use crate::store::{collection, DurableStore};
use crate::task::{ResumeData, Task, TaskError, TaskKind, TaskRecord, TaskStatus};

/// Event stream from a blocking exchange to its async wrapper.
pub(crate) enum TransferEvent {
    /// Response headers are in and the sink is ready: the transfer is now
    /// `Running`. Carries the task snapshot (server-derived filename
    /// applied), the expected size, and whether the exchange is resumable.
    Started {
        task: Task,
        expected: ContentLength,
        resumable: bool,
    },
    /// Byte count advanced.
    Progress { bytes_total: u64 },
}

/// Final result of one transfer attempt. Status emission and retry policy
/// live in the scheduler; the engine only reports what happened.
#[derive(Debug)]
pub enum TransferResult {
    Complete {
        expected_file_size: i64,
        response_body: Option<String>,
    },
    NotFound {
        response_body: Option<String>,
    },
    Failed {
        error: TaskError,
        response_body: Option<String>,
        /// Partial-file continuation persisted when the failure left enough
        /// resumable bytes behind.
        resume_data: Option<ResumeData>,
    },
    Canceled,
    Paused {
        resume_data: ResumeData,
        /// Set when a request timeout auto-paused the task; the scheduler
        /// schedules a resume shortly after.
        auto_resume: bool,
    },
}

impl TransferResult {
    fn failed(error: TaskError) -> Self {
        TransferResult::Failed {
            error,
            response_body: None,
            resume_data: None,
        }
    }
}

/// One finished transfer, handed to the scheduler's outcome loop.
pub struct TaskOutcome {
    pub task: Task,
    pub result: TransferResult,
}

/// Per-task execution: HTTP exchange, resume, pause/cancel, progress.
pub struct TransferEngine {
    cfg: Arc<RwLock<EngineConfig>>,
    platform: Arc<dyn Platform>,
    pipeline: Arc<UpdatePipeline>,
    store: DurableStore,
    control: Arc<TransferControl>,
    registry: Arc<CallbackRegistry>,
    /// Remaining bytes of every in-flight download, read by the disk-space
    /// preflight.
    remaining: Arc<Mutex<HashMap<String, u64>>>,
    active: Mutex<HashMap<String, Task>>,
    outcome_tx: UnboundedSender<TaskOutcome>,
}

impl TransferEngine {
    pub fn new(
        cfg: Arc<RwLock<EngineConfig>>,
        platform: Arc<dyn Platform>,
        pipeline: Arc<UpdatePipeline>,
        store: DurableStore,
        control: Arc<TransferControl>,
        registry: Arc<CallbackRegistry>,
        outcome_tx: UnboundedSender<TaskOutcome>,
    ) -> Self {
        TransferEngine {
            cfg,
            platform,
            pipeline,
            store,
            control,
            registry,
            remaining: Arc::new(Mutex::new(HashMap::new())),
            active: Mutex::new(HashMap::new()),
            outcome_tx,
        }
    }

    /// Launch the transfer for an admitted task on its own worker.
    pub fn spawn(self: &Arc<Self>, task: Task) {
        let token = self.control.register(&task.task_id);
        self.active
            .lock()
            .unwrap()
            .insert(task.task_id.clone(), task.clone());
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run(task, token).await;
        });
    }

    /// Tasks currently holding a worker, for queue reconciliation and host
    /// queries.
    pub fn active_tasks(&self) -> Vec<Task> {
        self.active.lock().unwrap().values().cloned().collect()
    }

    pub fn active_task(&self, task_id: &str) -> Option<Task> {
        self.active.lock().unwrap().get(task_id).cloned()
    }

    pub fn is_active(&self, task_id: &str) -> bool {
        self.control.is_active(task_id)
    }

    async fn run(&self, task: Task, token: crate::control::ControlToken) {
        let mut task = task;
        // At most one hook call per task start; the hook may swap the URL or
        // refresh auth headers.
        if let Some(modified) = self.registry.run_task_hook(ON_TASK_START, &task) {
            task = modified;
        }
        if let Some(modified) = self.registry.run_task_hook(ON_AUTH, &task) {
            task = modified;
        }

        let resume: Option<ResumeData> = match task.kind {
            TaskKind::Download | TaskKind::ParallelDownload => self
                .store
                .retrieve(collection::RESUME_DATA, &task.task_id)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(task_id = %task.task_id, error = %e, "resume data unreadable");
                    None
                }),
            _ => None,
        };

        let cfg = self.cfg.read().unwrap().clone();
        let (ev_tx, mut ev_rx) = unbounded_channel::<TransferEvent>();

        let mut blocking = {
            let task = task.clone();
            let platform = Arc::clone(&self.platform);
            let remaining = Arc::clone(&self.remaining);
            let token = token.clone();
            tokio::task::spawn_blocking(move || match task.kind {
                TaskKind::Download => download::run_download_blocking(
                    task, cfg, platform, resume, token, ev_tx, remaining,
                ),
                TaskKind::ParallelDownload => parallel::run_parallel_blocking(
                    task, cfg, platform, resume, token, ev_tx, remaining,
                ),
                TaskKind::Upload | TaskKind::MultiUpload => {
                    upload::run_upload_blocking(task, cfg, platform, token, ev_tx)
                }
                TaskKind::DataRequest => data::run_data_blocking(task, cfg, token, ev_tx),
            })
        };

        let mut current = task.clone();
        let mut expected: i64 = -1;
        let joined = loop {
            tokio::select! {
                event = ev_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(&mut current, &mut expected, event).await,
                        // Channel closed: the blocking closure is done.
                        None => break (&mut blocking).await,
                    }
                }
                joined = &mut blocking => break joined,
            }
        };
        while let Ok(event) = ev_rx.try_recv() {
            self.handle_event(&mut current, &mut expected, event).await;
        }

        let (final_task, result) = match joined {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(task_id = %current.task_id, error = %e, "transfer worker panicked");
                (
                    current.clone(),
                    TransferResult::failed(TaskError::general("transfer worker died")),
                )
            }
        };

        // Persist the continuation before anyone learns about the pause, so
        // a crash between the two never loses the partial file.
        match &result {
            TransferResult::Paused { resume_data, .. } => {
                self.persist_resume_data(resume_data, true).await;
            }
            TransferResult::Failed {
                resume_data: Some(resume_data),
                ..
            } => {
                self.persist_resume_data(resume_data, false).await;
            }
            _ => {}
        }

        self.remaining.lock().unwrap().remove(&final_task.task_id);
        self.active.lock().unwrap().remove(&final_task.task_id);
        self.control.unregister(&final_task.task_id);

        let _ = self.outcome_tx.send(TaskOutcome {
            task: final_task,
            result,
        });
    }

    async fn handle_event(&self, current: &mut Task, expected: &mut i64, event: TransferEvent) {
        match event {
            TransferEvent::Started {
                task,
                expected: exp,
                resumable,
            } => {
                *current = task.clone();
                *expected = exp.as_wire();
                self.active
                    .lock()
                    .unwrap()
                    .insert(task.task_id.clone(), task.clone());
                self.pipeline.set_expected_size(&task.task_id, *expected);
                self.pipeline
                    .post_status(&task, TaskStatus::Running, None, None)
                    .await;
                if matches!(task.kind, TaskKind::Download | TaskKind::ParallelDownload) {
                    self.pipeline.post_can_resume(&task, resumable);
                }
                if self.cfg.read().unwrap().track_tasks {
                    let record = TaskRecord {
                        task: task.clone(),
                        status: TaskStatus::Running,
                        progress: 0.0,
                        expected_file_size: *expected,
                        exception: None,
                    };
                    if let Err(e) = self
                        .store
                        .store(collection::TASKS, &task.task_id, &record)
                        .await
                    {
                        tracing::warn!(task_id = %task.task_id, error = %e, "record update failed");
                    }
                }
            }
            TransferEvent::Progress { bytes_total } => {
                if *expected >= 0 {
                    let left = (*expected as u64).saturating_sub(bytes_total);
                    self.remaining
                        .lock()
                        .unwrap()
                        .insert(current.task_id.clone(), left);
                }
                self.pipeline.post_progress(current, bytes_total).await;
            }
        }
    }

    async fn persist_resume_data(&self, resume_data: &ResumeData, paused: bool) {
        let id = resume_data.task.task_id.clone();
        if let Err(e) = self
            .store
            .store(collection::RESUME_DATA, &id, resume_data)
            .await
        {
            tracing::warn!(task_id = %id, error = %e, "failed to persist resume data");
            return;
        }
        if paused {
            if let Err(e) = self
                .store
                .store(collection::PAUSED_TASKS, &id, &resume_data.task)
                .await
            {
                tracing::warn!(task_id = %id, error = %e, "failed to persist paused task");
            }
        }
        self.pipeline.post_resume_data(resume_data);
    }
}
