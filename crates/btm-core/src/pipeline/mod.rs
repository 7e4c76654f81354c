//! Update pipeline: throttled progress/status delivery to the host channel,
//! with durable fallback and replay when the channel is unreachable.
//!
//! Ordering contract: per task, status updates are delivered in the order
//! produced. Progress updates may be coalesced (newer replaces older), but
//! the final progress value that accompanies a terminal status is always
//! delivered — or stored for replay.

mod throttle;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use anyhow::Result;

use crate::store::{collection, DurableStore};
use crate::task::{
    ProgressUpdate, ResumeData, StatusUpdate, Task, TaskError, TaskStatus, UndeliveredKind,
};
use throttle::ThrottleState;

/// Error returned by a host channel method. Any error makes the pipeline
/// fall back to the durable store; the update is replayed on the next drain.
#[derive(Debug, thiserror::Error)]
#[error("host channel unavailable: {0}")]
pub struct ChannelError(pub String);

/// The bidirectional call surface between the engine and the embedding
/// application. The engine is the caller; the host responds. Implementations
/// must be cheap to call and must not block for long.
pub trait HostChannel: Send + Sync {
    fn status_update(&self, update: &StatusUpdate) -> Result<(), ChannelError>;
    fn progress_update(&self, update: &ProgressUpdate) -> Result<(), ChannelError>;
    fn can_resume(&self, task: &Task, can_resume: bool) -> Result<(), ChannelError>;
    fn resume_data(&self, data: &ResumeData) -> Result<(), ChannelError>;
}

/// Throttled emitter of progress/status with at-least-once delivery.
pub struct UpdatePipeline {
    channel: std::sync::Arc<dyn HostChannel>,
    store: DurableStore,
    throttles: Mutex<HashMap<String, ThrottleState>>,
}

impl UpdatePipeline {
    pub fn new(channel: std::sync::Arc<dyn HostChannel>, store: DurableStore) -> Self {
        UpdatePipeline {
            channel,
            store,
            throttles: Mutex::new(HashMap::new()),
        }
    }

    /// Record the expected file size for a task so progress fractions and the
    /// wire `expected_file_size` field can be computed. `-1` means unknown.
    pub fn set_expected_size(&self, task_id: &str, expected: i64) {
        let mut throttles = self.throttles.lock().unwrap();
        throttles.entry(task_id.to_string()).or_default().expected = expected;
    }

    /// Deliver a status transition. When the host asked for progress updates,
    /// a sentinel progress value accompanies every terminal (and paused /
    /// waiting-to-retry) status, bypassing the throttle.
    pub async fn post_status(
        &self,
        task: &Task,
        status: TaskStatus,
        exception: Option<TaskError>,
        response_body: Option<String>,
    ) {
        let expected = self.expected_of(&task.task_id);
        if task.updates.wants_status() {
            let update = StatusUpdate {
                task: task.clone(),
                status,
                exception,
                response_body,
            };
            if let Err(e) = self.channel.status_update(&update) {
                tracing::debug!(task_id = %task.task_id, error = %e, "status fallback to store");
                if let Err(e) = self
                    .store
                    .store(collection::UNDELIVERED_STATUS, &task.task_id, &update)
                    .await
                {
                    tracing::warn!(task_id = %task.task_id, error = %e, "failed to persist undelivered status");
                }
            }
        }

        if let Some(sentinel) = status.progress_sentinel() {
            if task.updates.wants_progress() {
                self.deliver_progress(ProgressUpdate {
                    task: task.clone(),
                    progress: sentinel,
                    expected_file_size: expected,
                    network_speed: -1.0,
                    time_remaining_ms: -1,
                })
                .await;
            }
            // Transfer is over one way or another; drop the throttle state.
            self.throttles.lock().unwrap().remove(&task.task_id);
        }
    }

    /// Feed one progress sample. Emission is limited to one update per 500 ms
    /// per task, and only when progress moved by at least 0.02.
    pub async fn post_progress(&self, task: &Task, bytes_total: u64) {
        if !task.updates.wants_progress() {
            return;
        }
        let now = Instant::now();
        let sample = {
            let mut throttles = self.throttles.lock().unwrap();
            let state = throttles.entry(task.task_id.clone()).or_default();
            state.sample(now, bytes_total)
        };
        let Some((progress, expected, speed, eta_ms)) = sample else {
            return;
        };
        self.deliver_progress(ProgressUpdate {
            task: task.clone(),
            progress,
            expected_file_size: expected,
            network_speed: speed,
            time_remaining_ms: eta_ms,
        })
        .await;
    }

    /// Tell the host whether the running task can be paused and resumed.
    pub fn post_can_resume(&self, task: &Task, can_resume: bool) {
        if let Err(e) = self.channel.can_resume(task, can_resume) {
            tracing::debug!(task_id = %task.task_id, error = %e, "canResume not delivered");
        }
    }

    /// Hand freshly captured resume data to the host. Durability is the
    /// store's job (the engine persists before calling); this is telemetry.
    pub fn post_resume_data(&self, data: &ResumeData) {
        if let Err(e) = self.channel.resume_data(data) {
            tracing::debug!(task_id = %data.task.task_id, error = %e, "resumeData not delivered");
        }
    }

    /// Replay undelivered updates of one kind, deleting each after a
    /// successful delivery. Returns how many were delivered.
    pub async fn drain_undelivered(&self, kind: UndeliveredKind) -> Result<usize> {
        let mut delivered = 0usize;
        match kind {
            UndeliveredKind::Status => {
                let pending: HashMap<String, StatusUpdate> = self
                    .store
                    .retrieve_all(collection::UNDELIVERED_STATUS)
                    .await?;
                for (id, update) in pending {
                    if self.channel.status_update(&update).is_ok() {
                        self.store
                            .delete(collection::UNDELIVERED_STATUS, Some(&id))
                            .await?;
                        delivered += 1;
                    }
                }
            }
            UndeliveredKind::Progress => {
                let pending: HashMap<String, ProgressUpdate> = self
                    .store
                    .retrieve_all(collection::UNDELIVERED_PROGRESS)
                    .await?;
                for (id, update) in pending {
                    if self.channel.progress_update(&update).is_ok() {
                        self.store
                            .delete(collection::UNDELIVERED_PROGRESS, Some(&id))
                            .await?;
                        delivered += 1;
                    }
                }
            }
        }
        Ok(delivered)
    }

    async fn deliver_progress(&self, update: ProgressUpdate) {
        if let Err(e) = self.channel.progress_update(&update) {
            tracing::debug!(task_id = %update.task.task_id, error = %e, "progress fallback to store");
            if let Err(e) = self
                .store
                .store(collection::UNDELIVERED_PROGRESS, &update.task.task_id, &update)
                .await
            {
                tracing::warn!(error = %e, "failed to persist undelivered progress");
            }
        }
    }

    fn expected_of(&self, task_id: &str) -> i64 {
        self.throttles
            .lock()
            .unwrap()
            .get(task_id)
            .map(|s| s.expected)
            .unwrap_or(-1)
    }
}
