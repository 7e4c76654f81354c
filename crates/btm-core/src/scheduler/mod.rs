//! Public-facing orchestrator: enqueue/cancel/pause/resume, retry backoff,
//! WiFi-requirement transitions, lifecycle loops.
//!
//! The scheduler owns the holding queue, the transfer engine and the update
//! pipeline. The engine reports each finished transfer over the outcome
//! channel; the loop here decides the final status (including retry versus
//! fail), emits it, and keeps durable records in sync.

mod backoff;

pub use backoff::{retry_delay, RetryWheel, BASE_DELAY, MAX_DELAY};

use anyhow::Result;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use crate::config::{EngineConfig, RequireWiFi};
use crate::control::TransferControl;
use crate::engine::{TaskOutcome, TransferEngine, TransferResult};
use crate::pipeline::{HostChannel, UpdatePipeline};
use crate::platform::Platform;
use crate::queue::HoldingQueue;
use crate::registry::{CallbackRegistry, ON_TASK_FINISHED};
use crate::store::{collection, DurableStore, RebuildMigrator, StoreMigrator};
use crate::task::{
    ResumeData, StatusUpdate, Task, TaskError, TaskRecord, TaskStatus, UndeliveredKind,
};

/// Cadence of the queue/engine counter reconciliation pass.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

/// Delay before the automatic resume that follows a timeout-triggered pause.
const AUTO_RESUME_DELAY: Duration = Duration::from_secs(1);

struct Inner {
    cfg: Arc<RwLock<EngineConfig>>,
    store: DurableStore,
    queue: HoldingQueue,
    engine: Arc<TransferEngine>,
    pipeline: Arc<UpdatePipeline>,
    platform: Arc<dyn Platform>,
    control: Arc<TransferControl>,
    registry: Arc<CallbackRegistry>,
    wheel: RetryWheel,
}

/// Background file-transfer scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Build a scheduler against the default store location.
    pub async fn new(
        cfg: EngineConfig,
        channel: Arc<dyn HostChannel>,
        platform: Arc<dyn Platform>,
        registry: Arc<CallbackRegistry>,
    ) -> Result<Self> {
        let store = DurableStore::open_default().await?;
        Self::with_store(cfg, channel, platform, registry, store).await
    }

    /// Build a scheduler against an explicit store (tests, embedders with
    /// their own state directory).
    pub async fn with_store(
        cfg: EngineConfig,
        channel: Arc<dyn HostChannel>,
        platform: Arc<dyn Platform>,
        registry: Arc<CallbackRegistry>,
        store: DurableStore,
    ) -> Result<Self> {
        // Record the schema version on first open; on a version mismatch the
        // named migrator rewrites the stored documents once before anything
        // else touches them.
        store.migrate_if_needed(&default_migrators()).await?;
        store.store(collection::METADATA, "config", &cfg).await?;

        let queue = HoldingQueue::new(cfg.queue_caps());
        let cfg = Arc::new(RwLock::new(cfg));
        let pipeline = Arc::new(UpdatePipeline::new(channel, store.clone()));
        let control = Arc::new(TransferControl::new());
        let (outcome_tx, outcome_rx) = unbounded_channel::<TaskOutcome>();
        let engine = Arc::new(TransferEngine::new(
            Arc::clone(&cfg),
            Arc::clone(&platform),
            Arc::clone(&pipeline),
            store.clone(),
            Arc::clone(&control),
            Arc::clone(&registry),
            outcome_tx,
        ));

        let scheduler = Scheduler {
            inner: Arc::new(Inner {
                cfg,
                store,
                queue,
                engine,
                pipeline,
                platform,
                control,
                registry,
                wheel: RetryWheel::new(),
            }),
        };
        scheduler.recover_stale_records().await?;
        scheduler.spawn_loops(outcome_rx);
        Ok(scheduler)
    }

    /// Validate and accept one task. On success the task is `Enqueued` and
    /// will start as soon as the admission caps allow.
    pub async fn enqueue(&self, task: Task) -> Result<(), TaskError> {
        let mut task = task;
        if task.task_id.is_empty() {
            task.task_id = generate_task_id();
        }
        if task.creation_time == 0 {
            task.creation_time = now_millis();
        }
        task.retries_remaining = task.retries;
        task.validate()?;
        if self.inner.engine.is_active(&task.task_id)
            || self.inner.queue.waiting_task(&task.task_id).is_some()
        {
            return Err(TaskError::general(format!(
                "task {} is already enqueued or running",
                task.task_id
            )));
        }
        self.accept(task).await;
        Ok(())
    }

    pub async fn enqueue_all(&self, tasks: Vec<Task>) -> Vec<Result<(), TaskError>> {
        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            results.push(self.enqueue(task).await);
        }
        results
    }

    /// Cancel by id wherever each task currently lives: holding queue and
    /// retry wheel synchronously, running transfers at their next chunk
    /// boundary, paused tasks by discarding their resume state.
    pub async fn cancel_tasks_with_ids(&self, ids: &[String]) {
        let inner = &self.inner;
        for task in inner.queue.remove_ids(ids) {
            self.finish_canceled(task).await;
        }
        for task in inner.wheel.remove_ids(ids) {
            self.finish_canceled(task).await;
        }
        for id in ids {
            if inner.control.request_cancel(id) {
                continue;
            }
            if let Ok(Some(task)) = inner
                .store
                .retrieve::<Task>(collection::PAUSED_TASKS, id)
                .await
            {
                self.finish_canceled(task).await;
            }
        }
        self.advance();
    }

    /// Cancel everything, optionally scoped to one group, and clear queue
    /// state for that scope.
    pub async fn reset(&self, group: Option<&str>) {
        let inner = &self.inner;
        for task in inner.queue.remove_all(group) {
            self.finish_canceled(task).await;
        }
        for task in inner.wheel.remove_all(group) {
            self.finish_canceled(task).await;
        }
        for task in inner.engine.active_tasks() {
            if group.map_or(true, |g| task.group == g) {
                inner.control.request_cancel(&task.task_id);
            }
        }
        let paused: Vec<Task> = inner
            .store
            .retrieve_all::<Task>(collection::PAUSED_TASKS)
            .await
            .map(|m| m.into_values().collect())
            .unwrap_or_default();
        for task in paused {
            if group.map_or(true, |g| task.group == g) {
                self.finish_canceled(task).await;
            }
        }
    }

    /// Request pause of a running task. Succeeds only for downloads that
    /// allow pausing; the transfer stops at its next chunk boundary and
    /// emits `Paused` with resume data.
    pub fn pause(&self, task_id: &str) -> bool {
        let Some(task) = self.inner.engine.active_task(task_id) else {
            return false;
        };
        if !task.allow_pause || !task.kind.writes_file() {
            return false;
        }
        self.inner.control.request_pause(task_id)
    }

    /// Re-enqueue a paused task from its persisted resume data, keeping its
    /// original priority. Returns false when no resume state exists.
    pub async fn resume(&self, task_id: &str) -> bool {
        let resume: Option<ResumeData> = self
            .inner
            .store
            .retrieve(collection::RESUME_DATA, task_id)
            .await
            .unwrap_or(None);
        let Some(resume) = resume else {
            return false;
        };
        let _ = self
            .inner
            .store
            .delete(collection::PAUSED_TASKS, Some(task_id))
            .await;
        self.accept(resume.task).await;
        true
    }

    /// Look a task up across the engine, the queue, the retry wheel and the
    /// tracked records.
    pub async fn task_for_id(&self, task_id: &str) -> Option<Task> {
        if let Some(task) = self.inner.engine.active_task(task_id) {
            return Some(task);
        }
        if let Some(task) = self.inner.queue.waiting_task(task_id) {
            return Some(task);
        }
        if let Some(task) = self
            .inner
            .wheel
            .waiting_tasks()
            .into_iter()
            .find(|t| t.task_id == task_id)
        {
            return Some(task);
        }
        self.inner
            .store
            .retrieve::<TaskRecord>(collection::TASKS, task_id)
            .await
            .ok()
            .flatten()
            .map(|r| r.task)
    }

    /// Every task the engine still owes an outcome for: running, queued,
    /// waiting to retry, or paused.
    pub async fn all_tasks(&self) -> Vec<Task> {
        let mut tasks = self.inner.engine.active_tasks();
        tasks.extend(self.inner.queue.waiting_tasks());
        tasks.extend(self.inner.wheel.waiting_tasks());
        let paused: Vec<Task> = self
            .inner
            .store
            .retrieve_all::<Task>(collection::PAUSED_TASKS)
            .await
            .map(|m| m.into_values().collect())
            .unwrap_or_default();
        for task in paused {
            if !tasks.contains(&task) {
                tasks.push(task);
            }
        }
        tasks
    }

    pub async fn all_task_ids(&self) -> Vec<String> {
        self.all_tasks().await.into_iter().map(|t| t.task_id).collect()
    }

    /// Switch the global WiFi-requirement mode. Queued tasks are re-gated on
    /// the next admission pass; running tasks that no longer qualify are
    /// paused (to produce resume data) when `reschedule_running` is set and
    /// the task is resumable.
    pub async fn set_require_wifi(&self, mode: RequireWiFi, reschedule_running: bool) {
        {
            let mut cfg = self.inner.cfg.write().unwrap();
            cfg.require_wifi = mode;
        }
        let cfg = self.inner.cfg.read().unwrap().clone();
        let _ = self
            .inner
            .store
            .store(collection::METADATA, "config", &cfg)
            .await;
        if reschedule_running && self.inner.platform.is_metered_network() {
            for task in self.inner.engine.active_tasks() {
                if cfg.effective_requires_wifi(task.requires_wifi)
                    && task.allow_pause
                    && task.kind.writes_file()
                {
                    self.inner.control.request_pause(&task.task_id);
                }
            }
        }
        self.advance();
    }

    /// Tell the scheduler the network changed (metered/unmetered); blocked
    /// queued tasks are re-inspected.
    pub fn network_changed(&self) {
        self.advance();
    }

    /// Replay undelivered updates after the host channel reconnects.
    pub async fn drain_undelivered(&self, kind: UndeliveredKind) -> Result<usize> {
        self.inner.pipeline.drain_undelivered(kind).await
    }

    pub fn config(&self) -> EngineConfig {
        self.inner.cfg.read().unwrap().clone()
    }

    // ---- internals ----

    /// Emit `Enqueued`, record, queue and try to start.
    async fn accept(&self, task: Task) {
        self.inner
            .pipeline
            .post_status(&task, TaskStatus::Enqueued, None, None)
            .await;
        if self.inner.cfg.read().unwrap().track_tasks {
            let record = TaskRecord::enqueued(task.clone());
            if let Err(e) = self
                .inner
                .store
                .store(collection::TASKS, &task.task_id, &record)
                .await
            {
                tracing::warn!(task_id = %task.task_id, error = %e, "record write failed");
            }
        }
        self.inner.queue.add(task);
        self.advance();
    }

    /// Pop admitted tasks and hand them to the engine. The WiFi gate keeps
    /// metered-blocked tasks in the queue.
    fn advance(&self) {
        let cfg = self.inner.cfg.read().unwrap().clone();
        let metered = self.inner.platform.is_metered_network();
        let admitted = self
            .inner
            .queue
            .advance(|t| !(cfg.effective_requires_wifi(t.requires_wifi) && metered));
        for task in admitted {
            tracing::debug!(task_id = %task.task_id, "task admitted");
            self.inner.engine.spawn(task);
        }
    }

    async fn finish_canceled(&self, task: Task) {
        self.delete_resume_state(&task.task_id).await;
        self.finalize(task, TaskStatus::Canceled, None, None, None).await;
    }

    async fn delete_resume_state(&self, task_id: &str) {
        let _ = self
            .inner
            .store
            .delete(collection::RESUME_DATA, Some(task_id))
            .await;
        let _ = self
            .inner
            .store
            .delete(collection::PAUSED_TASKS, Some(task_id))
            .await;
    }

    /// Emit a terminal status, update/drop the durable record, fire the
    /// finished hook.
    async fn finalize(
        &self,
        task: Task,
        status: TaskStatus,
        error: Option<TaskError>,
        response_body: Option<String>,
        expected_file_size: Option<i64>,
    ) {
        self.inner
            .pipeline
            .post_status(&task, status, error.clone(), response_body.clone())
            .await;
        if self.inner.cfg.read().unwrap().track_tasks {
            let record = TaskRecord {
                task: task.clone(),
                status,
                progress: status.progress_sentinel().unwrap_or(0.0),
                expected_file_size: expected_file_size.unwrap_or(-1),
                exception: error.clone(),
            };
            if let Err(e) = self
                .inner
                .store
                .store(collection::TASKS, &task.task_id, &record)
                .await
            {
                tracing::warn!(task_id = %task.task_id, error = %e, "record write failed");
            }
        } else {
            let _ = self
                .inner
                .store
                .delete(collection::TASKS, Some(&task.task_id))
                .await;
        }
        let update = StatusUpdate {
            task,
            status,
            exception: error,
            response_body,
        };
        self.inner.registry.run_finished_hook(ON_TASK_FINISHED, &update);
    }

    fn spawn_loops(&self, mut outcome_rx: UnboundedReceiver<TaskOutcome>) {
        // Outcome loop: decides terminal status versus retry versus pause.
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(outcome) = outcome_rx.recv().await {
                this.handle_outcome(outcome).await;
            }
        });

        // Retry dispatcher: re-enqueue once backoff elapses.
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let task = this.inner.wheel.next_due().await;
                tracing::debug!(task_id = %task.task_id, "retry backoff elapsed");
                this.accept(task).await;
            }
        });

        // Periodic reconciliation of admission counters with live transfers.
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                this.inner.queue.reconcile(&this.inner.engine.active_tasks());
                this.advance();
            }
        });
    }

    async fn handle_outcome(&self, outcome: TaskOutcome) {
        let TaskOutcome { task, result } = outcome;
        self.inner.queue.task_finished(&task);

        match result {
            TransferResult::Complete {
                expected_file_size,
                response_body,
            } => {
                self.delete_resume_state(&task.task_id).await;
                self.finalize(
                    task,
                    TaskStatus::Complete,
                    None,
                    response_body,
                    Some(expected_file_size),
                )
                .await;
            }
            TransferResult::NotFound { response_body } => {
                self.delete_resume_state(&task.task_id).await;
                self.finalize(task, TaskStatus::NotFound, None, response_body, None)
                    .await;
            }
            TransferResult::Canceled => {
                self.delete_resume_state(&task.task_id).await;
                self.finalize(task, TaskStatus::Canceled, None, None, None).await;
            }
            TransferResult::Failed {
                error,
                response_body,
                resume_data,
            } => {
                if error.is_retryable() && task.retries_remaining > 0 {
                    self.inner
                        .pipeline
                        .post_status(
                            &task,
                            TaskStatus::WaitingToRetry,
                            Some(error.clone()),
                            response_body,
                        )
                        .await;
                    if self.inner.cfg.read().unwrap().track_tasks {
                        let record = TaskRecord {
                            task: task.clone(),
                            status: TaskStatus::WaitingToRetry,
                            progress: -4.0,
                            expected_file_size: -1,
                            exception: Some(error),
                        };
                        let _ = self
                            .inner
                            .store
                            .store(collection::TASKS, &task.task_id, &record)
                            .await;
                    }
                    let delay = retry_delay(task.retries, task.retries_remaining);
                    tracing::info!(
                        task_id = %task.task_id,
                        remaining = task.retries_remaining,
                        delay_ms = delay.as_millis() as u64,
                        "waiting to retry"
                    );
                    self.inner.wheel.schedule(task.with_one_retry_spent(), delay);
                } else {
                    if resume_data.is_none() {
                        self.delete_resume_state(&task.task_id).await;
                    }
                    self.finalize(task, TaskStatus::Failed, Some(error), response_body, None)
                        .await;
                }
            }
            TransferResult::Paused {
                resume_data: _,
                auto_resume,
            } => {
                // The engine already persisted the resume data.
                self.inner
                    .pipeline
                    .post_status(&task, TaskStatus::Paused, None, None)
                    .await;
                if self.inner.cfg.read().unwrap().track_tasks {
                    let record = TaskRecord {
                        task: task.clone(),
                        status: TaskStatus::Paused,
                        progress: -5.0,
                        expected_file_size: -1,
                        exception: None,
                    };
                    let _ = self
                        .inner
                        .store
                        .store(collection::TASKS, &task.task_id, &record)
                        .await;
                }
                if auto_resume {
                    let this = self.clone();
                    let id = task.task_id.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(AUTO_RESUME_DELAY).await;
                        if !this.resume(&id).await {
                            tracing::warn!(task_id = %id, "auto-resume found no resume data");
                        }
                    });
                }
            }
        }
        self.advance();
    }

    /// Tasks recorded as in-flight by a previous process did not survive it;
    /// surface a `Failed` through the undelivered channel so the host hears
    /// about them at least once.
    async fn recover_stale_records(&self) -> Result<()> {
        let records = self
            .inner
            .store
            .retrieve_all::<TaskRecord>(collection::TASKS)
            .await?;
        for (id, mut record) in records {
            if record.status.is_terminal() || record.status == TaskStatus::Paused {
                continue;
            }
            record.status = TaskStatus::Failed;
            record.progress = -1.0;
            record.exception = Some(TaskError::general("task did not survive process restart"));
            let update = StatusUpdate {
                task: record.task.clone(),
                status: TaskStatus::Failed,
                exception: record.exception.clone(),
                response_body: None,
            };
            self.inner
                .store
                .store(collection::UNDELIVERED_STATUS, &id, &update)
                .await?;
            self.inner.store.store(collection::TASKS, &id, &record).await?;
            tracing::info!(task_id = %id, "stale in-flight task marked failed after restart");
        }
        Ok(())
    }
}

/// Migrators the store may run by name. `"rebuild"` (drop every
/// non-metadata document) is the one used when no name is recorded.
fn default_migrators() -> HashMap<String, Arc<dyn StoreMigrator>> {
    let mut migrators: HashMap<String, Arc<dyn StoreMigrator>> = HashMap::new();
    migrators.insert("rebuild".to_string(), Arc::new(RebuildMigrator));
    migrators
}

fn generate_task_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
