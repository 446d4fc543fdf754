//! SSH context registry.
//!
//! Small named map of remote endpoints. Commands snapshot a context by
//! value at enqueue time, so removing or editing a context never affects
//! commands already holding a copy.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;

use hub_domain::command::SshContext;
use hub_domain::error::{Error, Result};

pub struct SshContextRegistry {
    enabled: bool,
    contexts: RwLock<HashMap<String, SshContext>>,
}

impl SshContextRegistry {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            contexts: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Create or replace a context. The same id always maps to the most
    /// recent definition.
    pub fn upsert(&self, context: SshContext) -> Result<SshContext> {
        self.ensure_enabled()?;
        context.validate()?;
        self.contexts
            .write()
            .insert(context.id.clone(), context.clone());
        tracing::info!(context_id = %context.id, host = %context.host, "ssh context stored");
        Ok(context)
    }

    pub fn get(&self, id: &str) -> Option<SshContext> {
        self.contexts.read().get(id).cloned()
    }

    /// Remove a context. Queued commands keep their snapshots.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.contexts.write().remove(id).is_some();
        if removed {
            tracing::info!(context_id = %id, "ssh context removed");
        }
        removed
    }

    pub fn list(&self) -> Vec<SshContext> {
        let mut all: Vec<SshContext> = self.contexts.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.contexts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.read().is_empty()
    }

    /// Stamp a successful liveness probe.
    pub fn mark_verified(&self, id: &str) -> bool {
        let mut contexts = self.contexts.write();
        if let Some(ctx) = contexts.get_mut(id) {
            ctx.last_verified = Some(Utc::now());
            true
        } else {
            false
        }
    }

    fn ensure_enabled(&self) -> Result<()> {
        if !self.enabled {
            return Err(Error::BusinessLogic(
                "SSH contexts are disabled by configuration".into(),
            ));
        }
        Ok(())
    }
}
