//! Per-key async locks for serializing thread mutations.
//!
//! The router (per webhook request) and the ingestion loop both mutate the
//! same table. "Active thread" selection plus read-modify-write of the
//! conversation is not atomic across those contexts, so every mutation span
//! for a given `email_id` runs under that key's mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

/// A lazily-populated table of per-key `tokio::sync::Mutex`es.
///
/// Entries are never removed — the working set is bounded by the number of
/// distinct emails seen in a process lifetime, and a stale entry is just an
/// idle mutex.
#[derive(Default)]
pub struct KeyedLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting if another task holds it.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().expect("lock table poisoned");
            Arc::clone(
                map.entry(key.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }
}
