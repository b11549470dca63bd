//! Live connection per identity.
//!
//! An identity owns at most one authenticated connection. When a second connection
//! authenticates as the same identity, the first one is cancelled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Live {
    connection: u64,
    cancel: CancellationToken,
}

/// identity -> owning connection
#[derive(Debug, Default)]
pub struct SessionRegistry {
    next_connection: AtomicU64,
    live: Mutex<HashMap<String, Live>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self) -> MutexGuard<'_, HashMap<String, Live>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate an id for a newly accepted connection
    pub fn next_connection_id(&self) -> u64 {
        self.next_connection.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Bind `identity` to `connection`, cancelling whichever connection held it
    pub fn claim(&self, identity: &str, connection: u64, cancel: CancellationToken) -> bool {
        let previous = self
            .live()
            .insert(identity.to_string(), Live { connection, cancel });
        match previous {
            Some(prev) if prev.connection != connection => {
                prev.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Unbind `identity` if `connection` still owns it. Returns whether it did.
    pub fn release(&self, identity: &str, connection: u64) -> bool {
        let mut live = self.live();
        match live.get(identity) {
            Some(current) if current.connection == connection => {
                live.remove(identity);
                true
            }
            _ => false,
        }
    }

    pub fn is_live(&self, identity: &str) -> bool {
        self.live().contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newer_connection_supersedes() {
        let reg = SessionRegistry::new();
        let first = CancellationToken::new();
        let second = CancellationToken::new();
        let (a, b) = (reg.next_connection_id(), reg.next_connection_id());

        assert!(!reg.claim("id", a, first.clone()));
        assert!(reg.claim("id", b, second.clone()));
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        // the superseded connection must not unbind its successor
        assert!(!reg.release("id", a));
        assert!(reg.is_live("id"));
        assert!(reg.release("id", b));
        assert!(reg.is_empty());
    }
}
