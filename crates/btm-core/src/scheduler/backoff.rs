//! Retry backoff policy and the timer wheel that re-enqueues tasks in
//! `WaitingToRetry` once their backoff elapses.

use rand::Rng;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::task::Task;

/// Base backoff delay.
pub const BASE_DELAY: Duration = Duration::from_secs(2);

/// Backoff cap.
pub const MAX_DELAY: Duration = Duration::from_secs(5 * 60);

/// Backoff for the upcoming attempt:
/// `min(cap, base * 2^(retries - retries_remaining)) * (1 +/- 0.1)`.
pub fn retry_delay(retries: u8, retries_remaining: u8) -> Duration {
    let attempt = retries.saturating_sub(retries_remaining).min(16) as u32;
    let raw = BASE_DELAY
        .saturating_mul(1u32 << attempt)
        .min(MAX_DELAY);
    let jitter = rand::thread_rng().gen_range(0.9..=1.1);
    raw.mul_f64(jitter)
}

struct Entry {
    due: Instant,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due)
    }
}

/// Single monotonic timer wheel for all `WaitingToRetry` tasks.
#[derive(Default)]
pub struct RetryWheel {
    entries: Mutex<BinaryHeap<Reverse<Entry>>>,
    notify: Notify,
}

impl RetryWheel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a task until `delay` elapses.
    pub fn schedule(&self, task: Task, delay: Duration) {
        let due = Instant::now() + delay;
        self.entries.lock().unwrap().push(Reverse(Entry { due, task }));
        self.notify.notify_one();
    }

    /// Remove parked tasks by id (cancellation while waiting to retry).
    /// Returns the removed tasks.
    pub fn remove_ids(&self, ids: &[String]) -> Vec<Task> {
        let mut entries = self.entries.lock().unwrap();
        let drained = std::mem::take(&mut *entries);
        let mut removed = Vec::new();
        for Reverse(entry) in drained {
            if ids.iter().any(|id| *id == entry.task.task_id) {
                removed.push(entry.task);
            } else {
                entries.push(Reverse(entry));
            }
        }
        removed
    }

    /// Remove all parked tasks, optionally scoped to one group.
    pub fn remove_all(&self, group: Option<&str>) -> Vec<Task> {
        let mut entries = self.entries.lock().unwrap();
        let drained = std::mem::take(&mut *entries);
        let mut removed = Vec::new();
        for Reverse(entry) in drained {
            if group.map_or(true, |g| entry.task.group == g) {
                removed.push(entry.task);
            } else {
                entries.push(Reverse(entry));
            }
        }
        removed
    }

    pub fn waiting_tasks(&self) -> Vec<Task> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|Reverse(e)| e.task.clone())
            .collect()
    }

    /// Wait for the soonest parked task to come due, then pop it.
    pub async fn next_due(&self) -> Task {
        loop {
            let soonest = self
                .entries
                .lock()
                .unwrap()
                .peek()
                .map(|Reverse(e)| e.due);
            match soonest {
                None => self.notify.notified().await,
                Some(due) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(due) => {
                            let mut entries = self.entries.lock().unwrap();
                            // Someone may have removed it while we slept.
                            if let Some(Reverse(head)) = entries.peek() {
                                if head.due <= Instant::now() {
                                    let Reverse(entry) = entries.pop().unwrap();
                                    return entry.task;
                                }
                            }
                        }
                        // A new, possibly earlier entry arrived; re-evaluate.
                        _ = self.notify.notified() => {}
                    }
                }
            }
        }
    }
}
