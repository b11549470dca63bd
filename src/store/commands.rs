//! Pending command queue
//!
//! At most one undelivered command per identity. Enqueueing replaces whatever is
//! still waiting (last write wins). Each identity has a [`Notify`] so the connection
//! that owns it can wake up immediately instead of waiting for its next poll tick.
//! A slot is dropped again once it holds no command and no connection holds its
//! [`Notify`], so identities that come and go do not accumulate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Default)]
struct Slot {
    pending: Option<String>,
    notify: Arc<Notify>,
}

/// Process-wide map identity -> pending command
#[derive(Debug, Default)]
pub struct CommandQueue {
    slots: Mutex<HashMap<String, Slot>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `command` for `identity`. Returns the command it replaced, if any.
    pub fn enqueue(&self, identity: &str, command: impl Into<String>) -> Option<String> {
        let command = command.into();
        let (replaced, notify) = {
            let mut slots = self.slots();
            let slot = slots.entry(identity.to_string()).or_default();
            (slot.pending.replace(command), slot.notify.clone())
        };
        if let Some(old) = &replaced {
            debug!(identity, replaced = %old, "Undelivered command overwritten");
        }
        notify.notify_one();
        replaced
    }

    /// Remove and return the pending command for `identity`
    pub fn take(&self, identity: &str) -> Option<String> {
        let mut slots = self.slots();
        let slot = slots.get_mut(identity)?;
        let command = slot.pending.take();
        if Arc::strong_count(&slot.notify) == 1 {
            slots.remove(identity);
        }
        command
    }

    pub fn peek(&self, identity: &str) -> Option<String> {
        self.slots()
            .get(identity)
            .and_then(|slot| slot.pending.clone())
    }

    /// Wake-up handle signalled on every enqueue for `identity`
    pub fn notifier(&self, identity: &str) -> Arc<Notify> {
        self.slots()
            .entry(identity.to_string())
            .or_default()
            .notify
            .clone()
    }

    /// Forget `identity` when nothing is pending and nobody else holds its notifier.
    /// Returns true if the slot was dropped.
    pub fn release(&self, identity: &str) -> bool {
        let mut slots = self.slots();
        let idle = slots.get(identity).map_or(false, |slot| {
            slot.pending.is_none() && Arc::strong_count(&slot.notify) == 1
        });
        if idle {
            slots.remove(identity);
        }
        idle
    }

    /// Number of identities with a slot, pending or not
    pub fn tracked_count(&self) -> usize {
        self.slots().len()
    }

    /// Number of identities with a command waiting
    pub fn pending_count(&self) -> usize {
        self.slots()
            .values()
            .filter(|slot| slot.pending.is_some())
            .count()
    }
}
