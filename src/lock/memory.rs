//! In-process lock store for tests and single-process deployments.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::{LockError, LockStore};
use crate::backend::BackendFuture;

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// Lock store backed by a mutex-protected map with per-key deadlines.
///
/// Expired entries are treated as absent and dropped lazily.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryLockStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_live_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> T {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);
        f(&mut entries)
    }
}

impl LockStore for MemoryLockStore {
    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BackendFuture<'a, bool, LockError> {
        Box::pin(async move {
            Ok(self.with_live_entries(|entries| {
                if entries.contains_key(key) {
                    return false;
                }
                entries.insert(
                    key.to_owned(),
                    Entry {
                        value: value.to_owned(),
                        expires_at: Instant::now() + ttl,
                    },
                );
                true
            }))
        })
    }

    fn replace<'a>(&'a self, key: &'a str, value: &'a str) -> BackendFuture<'a, bool, LockError> {
        Box::pin(async move {
            Ok(self.with_live_entries(|entries| {
                entries.get_mut(key).is_some_and(|entry| {
                    value.clone_into(&mut entry.value);
                    true
                })
            }))
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BackendFuture<'a, Option<String>, LockError> {
        Box::pin(async move {
            Ok(self.with_live_entries(|entries| entries.get(key).map(|entry| entry.value.clone())))
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BackendFuture<'a, bool, LockError> {
        Box::pin(async move { Ok(self.with_live_entries(|entries| entries.remove(key).is_some())) })
    }
}
