//! Holding queue and admission controller.
//!
//! Admitted-but-not-started tasks wait here in `(priority asc, creation_time
//! asc)` order. `advance` pops items while the global, per-host and per-group
//! concurrency counters stay below their caps. All state lives behind one
//! mutex; callers launch the returned tasks after the lock is released, so no
//! I/O ever runs under it.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::task::Task;

/// Effectively-unlimited cap used when a limit is not configured.
pub const UNLIMITED: usize = 1 << 20;

/// Concurrency caps enforced at admission.
#[derive(Debug, Clone, Copy)]
pub struct QueueCaps {
    pub max_concurrent: usize,
    pub max_concurrent_by_host: usize,
    pub max_concurrent_by_group: usize,
}

impl Default for QueueCaps {
    fn default() -> Self {
        QueueCaps {
            max_concurrent: UNLIMITED,
            max_concurrent_by_host: UNLIMITED,
            max_concurrent_by_group: UNLIMITED,
        }
    }
}

#[derive(Default)]
struct QueueState {
    /// Sorted by `(priority, creation_time)`; earlier entries start first.
    waiting: Vec<Task>,
    concurrent: usize,
    per_host: HashMap<String, usize>,
    per_group: HashMap<String, usize>,
}

/// Priority queue honoring global/per-host/per-group caps.
pub struct HoldingQueue {
    state: Mutex<QueueState>,
    caps: Mutex<QueueCaps>,
}

impl HoldingQueue {
    pub fn new(caps: QueueCaps) -> Self {
        HoldingQueue {
            state: Mutex::new(QueueState::default()),
            caps: Mutex::new(caps),
        }
    }

    pub fn set_caps(&self, caps: QueueCaps) {
        *self.caps.lock().unwrap() = caps;
    }

    /// Insert in priority order. The caller should follow up with `advance`.
    pub fn add(&self, task: Task) {
        let mut state = self.state.lock().unwrap();
        let key = (task.priority, task.creation_time);
        let idx = state
            .waiting
            .partition_point(|t| (t.priority, t.creation_time) <= key);
        state.waiting.insert(idx, task);
    }

    /// Pop every task that may start now: global count below cap, host and
    /// group counts below their caps, and `gate` (e.g. the WiFi requirement)
    /// satisfied. Unqualified items are preserved in order. Counters are
    /// incremented here; the caller launches the returned tasks outside the
    /// lock.
    pub fn advance<F>(&self, gate: F) -> Vec<Task>
    where
        F: Fn(&Task) -> bool,
    {
        let caps = *self.caps.lock().unwrap();
        let mut state = self.state.lock().unwrap();
        let mut admitted = Vec::new();
        while state.concurrent + admitted.len() < caps.max_concurrent {
            let pos = state.waiting.iter().position(|t| {
                let host_ok = state.per_host.get(&t.host()).copied().unwrap_or(0)
                    < caps.max_concurrent_by_host;
                let group_ok = state.per_group.get(&t.group).copied().unwrap_or(0)
                    < caps.max_concurrent_by_group;
                host_ok && group_ok && gate(t)
            });
            let Some(pos) = pos else { break };
            let task = state.waiting.remove(pos);
            *state.per_host.entry(task.host()).or_insert(0) += 1;
            *state.per_group.entry(task.group.clone()).or_insert(0) += 1;
            admitted.push(task);
        }
        state.concurrent += admitted.len();
        admitted
    }

    /// Release the counters held by a finished (or failed-to-start) task.
    /// The caller should follow up with `advance`.
    pub fn task_finished(&self, task: &Task) {
        let mut state = self.state.lock().unwrap();
        state.concurrent = state.concurrent.saturating_sub(1);
        decrement(&mut state.per_host, &task.host());
        decrement(&mut state.per_group, &task.group);
    }

    /// Remove queued (never started) tasks by id. Returns the removed tasks
    /// so the caller can emit synchronous `Canceled` updates.
    pub fn remove_ids(&self, ids: &[String]) -> Vec<Task> {
        let mut state = self.state.lock().unwrap();
        let mut removed = Vec::new();
        state.waiting.retain(|t| {
            if ids.iter().any(|id| *id == t.task_id) {
                removed.push(t.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Remove all queued tasks, optionally scoped to one group.
    pub fn remove_all(&self, group: Option<&str>) -> Vec<Task> {
        let mut state = self.state.lock().unwrap();
        let mut removed = Vec::new();
        state.waiting.retain(|t| {
            if group.map_or(true, |g| t.group == g) {
                removed.push(t.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Recompute all counters from the engine's live transfer set, recovering
    /// from any missed `task_finished`. Run on a <= 10 s cadence.
    pub fn reconcile(&self, active: &[Task]) {
        let mut state = self.state.lock().unwrap();
        let before = state.concurrent;
        state.concurrent = active.len();
        state.per_host.clear();
        state.per_group.clear();
        for t in active {
            *state.per_host.entry(t.host()).or_insert(0) += 1;
            *state.per_group.entry(t.group.clone()).or_insert(0) += 1;
        }
        if before != active.len() {
            tracing::debug!(before, now = active.len(), "queue counters reconciled");
        }
    }

    pub fn waiting_tasks(&self) -> Vec<Task> {
        self.state.lock().unwrap().waiting.clone()
    }

    pub fn waiting_task(&self, task_id: &str) -> Option<Task> {
        self.state
            .lock()
            .unwrap()
            .waiting
            .iter()
            .find(|t| t.task_id == task_id)
            .cloned()
    }

    /// Current number of running tasks as accounted by admission.
    pub fn concurrent(&self) -> usize {
        self.state.lock().unwrap().concurrent
    }
}

fn decrement(map: &mut HashMap<String, usize>, key: &str) {
    if let Some(n) = map.get_mut(key) {
        *n = n.saturating_sub(1);
        if *n == 0 {
            map.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{BaseDirectory, HttpMethod, TaskKind, Updates};
    use std::collections::HashMap as Map;

    fn task(id: &str, url: &str, priority: u8, created: i64, group: &str) -> Task {
        Task {
            task_id: id.into(),
            kind: TaskKind::Download,
            url: url.into(),
            url_query_parameters: Map::new(),
            headers: Map::new(),
            http_method: HttpMethod::Get,
            body: None,
            filename: "f.bin".into(),
            directory: String::new(),
            base_directory: BaseDirectory::ApplicationDocuments,
            group: group.into(),
            updates: Updates::Status,
            requires_wifi: false,
            retries: 0,
            retries_remaining: 0,
            allow_pause: false,
            priority,
            creation_time: created,
            meta_data: String::new(),
            display_name: String::new(),
            file_field: None,
            mime_type: None,
            fields: Map::new(),
        }
    }

    #[test]
    fn pops_in_priority_then_creation_order() {
        let q = HoldingQueue::new(QueueCaps::default());
        q.add(task("late-low", "https://a.com/x", 7, 10, "default"));
        q.add(task("early-low", "https://a.com/x", 7, 5, "default"));
        q.add(task("high", "https://a.com/x", 0, 99, "default"));
        let admitted = q.advance(|_| true);
        let ids: Vec<_> = admitted.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, ["high", "early-low", "late-low"]);
    }

    #[test]
    fn global_cap_limits_admission() {
        let q = HoldingQueue::new(QueueCaps {
            max_concurrent: 2,
            ..QueueCaps::default()
        });
        for i in 0..4 {
            q.add(task(&format!("t{}", i), "https://a.com/x", 5, i, "default"));
        }
        assert_eq!(q.advance(|_| true).len(), 2);
        assert_eq!(q.concurrent(), 2);
        // Nothing more until a slot frees.
        assert!(q.advance(|_| true).is_empty());
        q.task_finished(&task("t0", "https://a.com/x", 5, 0, "default"));
        assert_eq!(q.advance(|_| true).len(), 1);
    }

    #[test]
    fn per_host_cap_skips_to_other_hosts() {
        let q = HoldingQueue::new(QueueCaps {
            max_concurrent_by_host: 1,
            ..QueueCaps::default()
        });
        q.add(task("a1", "https://a.com/1", 5, 0, "default"));
        q.add(task("a2", "https://a.com/2", 5, 1, "default"));
        q.add(task("b1", "https://b.com/1", 5, 2, "default"));
        let ids: Vec<_> = q
            .advance(|_| true)
            .into_iter()
            .map(|t| t.task_id)
            .collect();
        assert_eq!(ids, ["a1", "b1"], "second a.com task must wait");
        assert_eq!(q.waiting_tasks().len(), 1);
    }

    #[test]
    fn per_group_cap_holds_group_back() {
        let q = HoldingQueue::new(QueueCaps {
            max_concurrent_by_group: 1,
            ..QueueCaps::default()
        });
        q.add(task("g1", "https://a.com/1", 5, 0, "bulk"));
        q.add(task("g2", "https://b.com/2", 5, 1, "bulk"));
        q.add(task("other", "https://c.com/3", 5, 2, "default"));
        let ids: Vec<_> = q
            .advance(|_| true)
            .into_iter()
            .map(|t| t.task_id)
            .collect();
        assert_eq!(ids, ["g1", "other"]);
    }

    #[test]
    fn gate_preserves_blocked_items() {
        let q = HoldingQueue::new(QueueCaps::default());
        let mut wifi_task = task("wifi", "https://a.com/1", 0, 0, "default");
        wifi_task.requires_wifi = true;
        q.add(wifi_task);
        q.add(task("plain", "https://a.com/2", 5, 1, "default"));
        let ids: Vec<_> = q
            .advance(|t| !t.requires_wifi)
            .into_iter()
            .map(|t| t.task_id)
            .collect();
        assert_eq!(ids, ["plain"]);
        assert_eq!(q.waiting_tasks().len(), 1, "gated task stays queued");
    }

    #[test]
    fn counters_track_running_set_invariant() {
        let q = HoldingQueue::new(QueueCaps::default());
        q.add(task("x", "https://a.com/1", 5, 0, "g1"));
        q.add(task("y", "https://b.com/1", 5, 1, "g2"));
        let admitted = q.advance(|_| true);
        assert_eq!(q.concurrent(), admitted.len());
        q.task_finished(&admitted[0]);
        assert_eq!(q.concurrent(), 1);
        q.task_finished(&admitted[1]);
        assert_eq!(q.concurrent(), 0);
    }

    #[test]
    fn reconcile_recovers_from_missed_finish() {
        let q = HoldingQueue::new(QueueCaps {
            max_concurrent: 1,
            ..QueueCaps::default()
        });
        q.add(task("gone", "https://a.com/1", 5, 0, "default"));
        let admitted = q.advance(|_| true);
        assert_eq!(admitted.len(), 1);
        // The finish event is lost; the engine reports no active transfers.
        q.reconcile(&[]);
        assert_eq!(q.concurrent(), 0);
        q.add(task("next", "https://a.com/2", 5, 1, "default"));
        assert_eq!(q.advance(|_| true).len(), 1);
    }

    #[test]
    fn remove_ids_and_remove_all_scope() {
        let q = HoldingQueue::new(QueueCaps::default());
        q.add(task("a", "https://a.com/1", 5, 0, "g1"));
        q.add(task("b", "https://a.com/2", 5, 1, "g2"));
        q.add(task("c", "https://a.com/3", 5, 2, "g1"));
        let removed = q.remove_ids(&["b".to_string()]);
        assert_eq!(removed.len(), 1);
        let removed = q.remove_all(Some("g1"));
        assert_eq!(removed.len(), 2);
        assert!(q.waiting_tasks().is_empty());
    }
}
