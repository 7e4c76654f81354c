//! Per-task transfer control: cancel/pause intents observed at chunk
//! boundaries.
//!
//! Each running transfer registers a token here. Cancel and pause are
//! requested by flipping the token; the transfer's read/write loop polls it
//! between chunks and stops preemptively. Cancel wins over pause when both
//! are requested.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

const INTENT_NONE: u8 = 0;
const INTENT_PAUSE: u8 = 1;
const INTENT_CANCEL: u8 = 2;

/// What the token currently asks the transfer to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    None,
    Pause,
    Cancel,
}

/// Shared stop token for one transfer. Cloneable into the blocking I/O loop.
#[derive(Clone, Default)]
pub struct ControlToken(Arc<AtomicU8>);

impl ControlToken {
    pub fn intent(&self) -> Intent {
        match self.0.load(Ordering::Relaxed) {
            INTENT_CANCEL => Intent::Cancel,
            INTENT_PAUSE => Intent::Pause,
            _ => Intent::None,
        }
    }

    pub fn request_pause(&self) {
        // Never downgrade an already-requested cancel.
        let _ = self.0.compare_exchange(
            INTENT_NONE,
            INTENT_PAUSE,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    pub fn request_cancel(&self) {
        self.0.store(INTENT_CANCEL, Ordering::Relaxed);
    }
}

/// Registry of task id -> control token for all in-flight transfers.
#[derive(Default)]
pub struct TransferControl {
    tokens: RwLock<HashMap<String, ControlToken>>,
}

impl TransferControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a starting transfer; returns the token to poll in its loop.
    pub fn register(&self, task_id: &str) -> ControlToken {
        let token = ControlToken::default();
        self.tokens
            .write()
            .unwrap()
            .insert(task_id.to_string(), token.clone());
        token
    }

    /// Drop the token when the transfer finishes, whatever the outcome.
    pub fn unregister(&self, task_id: &str) {
        self.tokens.write().unwrap().remove(task_id);
    }

    /// Request cancellation of a running transfer. Returns false when the
    /// task is not in flight.
    pub fn request_cancel(&self, task_id: &str) -> bool {
        match self.tokens.read().unwrap().get(task_id) {
            Some(token) => {
                token.request_cancel();
                true
            }
            None => false,
        }
    }

    /// Request pause of a running transfer. Returns false when the task is
    /// not in flight.
    pub fn request_pause(&self, task_id: &str) -> bool {
        match self.tokens.read().unwrap().get(task_id) {
            Some(token) => {
                token.request_pause();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, task_id: &str) -> bool {
        self.tokens.read().unwrap().contains_key(task_id)
    }
}
