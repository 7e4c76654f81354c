//! Task status state machine.

use serde::{Deserialize, Serialize};

/// Durable state of a task. `Complete`, `NotFound`, `Failed` and `Canceled`
/// are terminal (absorbing); the rest are transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Enqueued,
    Running,
    Complete,
    NotFound,
    Failed,
    Canceled,
    WaitingToRetry,
    Paused,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Complete | TaskStatus::NotFound | TaskStatus::Failed | TaskStatus::Canceled
        )
    }

    /// Whether the transition `self -> next` is a legal edge of the state
    /// machine. Terminal states have no outgoing edges.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match self {
            Enqueued => matches!(next, Running | Canceled),
            Running => matches!(
                next,
                Complete | NotFound | Failed | WaitingToRetry | Canceled | Paused
            ),
            WaitingToRetry => matches!(next, Enqueued | Canceled),
            Paused => matches!(next, Enqueued | Canceled),
            Complete | NotFound | Failed | Canceled => false,
        }
    }

    /// Progress value that accompanies this status on the wire. Transient
    /// states other than `Paused`/`WaitingToRetry` carry real progress and
    /// return `None` here.
    pub fn progress_sentinel(self) -> Option<f64> {
        match self {
            TaskStatus::Complete => Some(1.0),
            TaskStatus::Failed => Some(-1.0),
            TaskStatus::Canceled => Some(-2.0),
            TaskStatus::NotFound => Some(-3.0),
            TaskStatus::WaitingToRetry => Some(-4.0),
            TaskStatus::Paused => Some(-5.0),
            TaskStatus::Enqueued | TaskStatus::Running => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Enqueued => "enqueued",
            TaskStatus::Running => "running",
            TaskStatus::Complete => "complete",
            TaskStatus::NotFound => "notFound",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
            TaskStatus::WaitingToRetry => "waitingToRetry",
            TaskStatus::Paused => "paused",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
