//! Per-key cancellation tokens.
//!
//! Every in-flight send and every live command registers a token here.
//! Cancelling a key signals the owning loop to stop cleanly; loops check
//! the token cooperatively and race it against their blocking waits.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Tracks active cancellation tokens keyed by task or command id.
pub struct CancelMap {
    tokens: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl Default for CancelMap {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelMap {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Create and register a new token for a key, replacing any previous one.
    pub fn register(&self, key: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.lock().insert(key, token.clone());
        token
    }

    /// Clone the token registered for a key, if any.
    pub fn get(&self, key: Uuid) -> Option<CancellationToken> {
        self.tokens.lock().get(&key).cloned()
    }

    /// Signal cancellation. Returns true if a token was registered.
    pub fn cancel(&self, key: Uuid) -> bool {
        if let Some(token) = self.tokens.lock().get(&key) {
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Remove the token for a key (called when the operation finishes).
    pub fn remove(&self, key: Uuid) {
        self.tokens.lock().remove(&key);
    }

    /// Whether an operation is currently registered under this key.
    pub fn is_running(&self, key: Uuid) -> bool {
        self.tokens.lock().contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }
}
