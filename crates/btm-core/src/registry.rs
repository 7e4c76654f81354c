//! Callback registry: named host hooks registered explicitly at startup.
//!
//! Hooks survive across the host channel because they are looked up by a
//! stable name, never by a serialized function handle. The engine consults
//! the well-known names below at defined points of a transfer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::task::{StatusUpdate, Task};

/// Hook invoked with a task snapshot; may return a modified task (new URL,
/// refreshed auth headers). Must be idempotent: the engine calls it at most
/// once per task start.
pub type TaskHook = Arc<dyn Fn(&Task) -> Option<Task> + Send + Sync>;

/// Hook invoked once with the final status update of a finished task.
pub type FinishedHook = Arc<dyn Fn(&StatusUpdate) + Send + Sync>;

/// Well-known hook names.
pub const ON_TASK_START: &str = "onTaskStart";
pub const ON_AUTH: &str = "onAuth";
pub const ON_TASK_FINISHED: &str = "onTaskFinished";

enum Hook {
    Task(TaskHook),
    Finished(FinishedHook),
}

/// Name-keyed hook storage shared by the scheduler and the engine.
#[derive(Default)]
pub struct CallbackRegistry {
    hooks: RwLock<HashMap<String, Hook>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task-modifying hook under `name` (one of the well-known
    /// names, or a host-defined key). Replaces any previous registration.
    pub fn register_task_hook(&self, name: &str, hook: TaskHook) {
        self.hooks
            .write()
            .unwrap()
            .insert(name.to_string(), Hook::Task(hook));
    }

    pub fn register_finished_hook(&self, name: &str, hook: FinishedHook) {
        self.hooks
            .write()
            .unwrap()
            .insert(name.to_string(), Hook::Finished(hook));
    }

    pub fn unregister(&self, name: &str) {
        self.hooks.write().unwrap().remove(name);
    }

    /// Run the named task hook, if registered. Returns the modified task.
    pub fn run_task_hook(&self, name: &str, task: &Task) -> Option<Task> {
        let hooks = self.hooks.read().unwrap();
        match hooks.get(name) {
            Some(Hook::Task(hook)) => hook(task),
            _ => None,
        }
    }

    /// Run the named finished hook, if registered.
    pub fn run_finished_hook(&self, name: &str, update: &StatusUpdate) {
        let hooks = self.hooks.read().unwrap();
        if let Some(Hook::Finished(hook)) = hooks.get(name) {
            hook(update);
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.hooks.read().unwrap().contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{BaseDirectory, HttpMethod, TaskKind, Updates};
    use std::collections::HashMap as Map;

    fn task() -> Task {
        Task {
            task_id: "h1".into(),
            kind: TaskKind::Download,
            url: "https://example.com/v1".into(),
            url_query_parameters: Map::new(),
            headers: Map::new(),
            http_method: HttpMethod::Get,
            body: None,
            filename: "f".into(),
            directory: String::new(),
            base_directory: BaseDirectory::ApplicationDocuments,
            group: "default".into(),
            updates: Updates::Status,
            requires_wifi: false,
            retries: 0,
            retries_remaining: 0,
            allow_pause: false,
            priority: 5,
            creation_time: 0,
            meta_data: String::new(),
            display_name: String::new(),
            file_field: None,
            mime_type: None,
            fields: Map::new(),
        }
    }

    #[test]
    fn task_hook_rewrites_url() {
        let registry = CallbackRegistry::new();
        registry.register_task_hook(
            ON_TASK_START,
            Arc::new(|t: &Task| {
                let mut t = t.clone();
                t.url = "https://example.com/v2".into();
                Some(t)
            }),
        );
        let out = registry.run_task_hook(ON_TASK_START, &task()).unwrap();
        assert_eq!(out.url, "https://example.com/v2");
        assert!(registry.run_task_hook(ON_AUTH, &task()).is_none());
    }

    #[test]
    fn unregister_removes_hook() {
        let registry = CallbackRegistry::new();
        registry.register_task_hook(ON_AUTH, Arc::new(|_| None));
        assert!(registry.has(ON_AUTH));
        registry.unregister(ON_AUTH);
        assert!(!registry.has(ON_AUTH));
    }
}
