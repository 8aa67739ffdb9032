//! Named, TTL-bounded exclusive locks.
//!
//! A lock is a key in a shared store, created atomically only when absent and
//! expiring on its own after the TTL. The stored value is a JSON
//! [`LockPayload`] describing the holder. Exclusivity holds only while the
//! TTL has not elapsed: a holder that outlives its TTL silently loses the lock
//! and a later release removes whoever holds the key at that point.
//!
//! Locks are used in two modes. In scoped mode the [`LockGuard`] returned by
//! [`LockManager::acquire`] is released explicitly, or in the background when
//! the guard is dropped on any other path. In hand-off mode the guard is
//! converted into a serialisable [`NamedLock`] token with
//! [`LockGuard::hand_off`] and another task takes it over with
//! [`LockManager::restore`].

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::backend::BackendFuture;

mod memory;
mod redis_store;

pub use memory::MemoryLockStore;
pub use redis_store::RedisLockStore;

/// Prefix applied to every lock key in the store.
pub const LOCK_PREFIX: &str = "kd.exclusivelock.";

/// Operation name reported when the holder's payload cannot be read.
pub const UNKNOWN_OPERATION: &str = "unknown";

/// Errors raised by lock operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LockError {
    /// Raised when the key is held by someone else.
    #[error("lock {key} is already held{}", holder_suffix(holder.as_ref()))]
    AlreadyLocked {
        /// Requested key, without the store prefix.
        key: String,
        /// Payload of the current holder, when it could be read.
        holder: Option<LockPayload>,
    },
    /// Raised when the backing store fails.
    #[error("lock store error: {message}")]
    Store {
        /// Underlying error message.
        message: String,
    },
    /// Raised when a hand-off token cannot be encoded or decoded.
    #[error("invalid lock token: {message}")]
    Token {
        /// Serialisation error message.
        message: String,
    },
}

fn holder_suffix(holder: Option<&LockPayload>) -> String {
    holder.map_or_else(String::new, |payload| {
        format!(" by operation \"{}\"", payload.operation)
    })
}

/// Description of the current holder, stored as the lock value.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LockPayload {
    /// Operation that holds the lock.
    pub operation: String,
    /// Asynchronous task that finishes the operation, once handed off.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Acquisition time as Unix seconds.
    #[serde(default)]
    pub acquired_at: u64,
}

impl LockPayload {
    /// Payload for `operation`, stamped with the current time.
    #[must_use]
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            task_id: None,
            acquired_at: unix_now().as_secs(),
        }
    }

    /// Payload standing in for a holder whose value could not be decoded.
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            operation: String::from(UNKNOWN_OPERATION),
            task_id: None,
            acquired_at: 0,
        }
    }

    /// Attaches the id of the task that continues the operation.
    #[must_use]
    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    fn encode(&self) -> Result<String, LockError> {
        serde_json::to_string(self).map_err(|err| LockError::Store {
            message: format!("failed to encode lock payload: {err}"),
        })
    }

    fn decode(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|err| {
            warn!(error = %err, "unreadable lock payload");
            Self::unknown()
        })
    }
}

/// A held lock. Serialisable so it can travel to another task as a token.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NamedLock {
    /// Lock key, without the store prefix.
    pub key: String,
    /// Time to live granted at acquisition, in seconds.
    pub ttl_secs: u64,
    /// Payload stored with the lock.
    pub payload: LockPayload,
    /// Expiry as Unix milliseconds.
    pub expires_at_ms: u64,
}

impl NamedLock {
    fn new(key: &str, ttl: Duration, payload: LockPayload) -> Self {
        let expires = unix_now().saturating_add(ttl);
        Self {
            key: key.to_owned(),
            ttl_secs: ttl.as_secs(),
            payload,
            expires_at_ms: u64::try_from(expires.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Key as stored, including [`LOCK_PREFIX`].
    #[must_use]
    pub fn store_key(&self) -> String {
        store_key(&self.key)
    }

    /// Returns `true` once the TTL granted at acquisition has elapsed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        let now = u64::try_from(unix_now().as_millis()).unwrap_or(u64::MAX);
        now >= self.expires_at_ms
    }

    /// Encodes the lock as a hand-off token.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Token`] when serialisation fails.
    pub fn to_token(&self) -> Result<String, LockError> {
        serde_json::to_string(self).map_err(|err| LockError::Token {
            message: err.to_string(),
        })
    }

    /// Decodes a hand-off token.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Token`] when the token is malformed.
    pub fn from_token(token: &str) -> Result<Self, LockError> {
        serde_json::from_str(token).map_err(|err| LockError::Token {
            message: err.to_string(),
        })
    }
}

impl fmt::Display for NamedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.key, self.payload.operation)
    }
}

/// Atomic key-value store backing the locks.
pub trait LockStore: Send + Sync {
    /// Stores `value` under `key` with a TTL only when the key is absent.
    /// Returns `true` when the value was stored.
    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BackendFuture<'a, bool, LockError>;

    /// Replaces the value of an existing key, keeping its remaining TTL.
    /// Returns `false` when the key no longer exists.
    fn replace<'a>(&'a self, key: &'a str, value: &'a str) -> BackendFuture<'a, bool, LockError>;

    /// Reads the value under `key`.
    fn get<'a>(&'a self, key: &'a str) -> BackendFuture<'a, Option<String>, LockError>;

    /// Removes `key`. Returns `true` when a value was removed.
    fn remove<'a>(&'a self, key: &'a str) -> BackendFuture<'a, bool, LockError>;
}

/// Bounded retry schedule for [`LockManager::acquire_with_retry`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub attempts: u32,
    /// Pause between two attempts.
    pub pause: Duration,
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    #[must_use]
    pub const fn fail_fast() -> Self {
        Self {
            attempts: 1,
            pause: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            pause: Duration::from_secs(1),
        }
    }
}

/// Acquires and releases named locks against a [`LockStore`].
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LockStore>,
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager").finish_non_exhaustive()
    }
}

impl LockManager {
    /// Creates a manager over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self { store }
    }

    /// Creates a manager over a fresh in-process store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryLockStore::new()))
    }

    /// Takes the lock on `key` for `ttl`, failing immediately when held.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::AlreadyLocked`] with the holder's payload when the
    /// key is held, or [`LockError::Store`] when the store fails.
    pub async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        payload: LockPayload,
    ) -> Result<LockGuard, LockError> {
        let lock = NamedLock::new(key, ttl, payload);
        let stored_key = lock.store_key();
        let value = lock.payload.encode()?;
        if self.store.set_if_absent(&stored_key, &value, ttl).await? {
            debug!(key, operation = %lock.payload.operation, ttl_secs = ttl.as_secs(), "lock acquired");
            return Ok(LockGuard::new(Arc::clone(&self.store), lock));
        }
        let holder = self.inspect(key).await?;
        debug!(key, holder = ?holder, "lock busy");
        Err(LockError::AlreadyLocked {
            key: key.to_owned(),
            holder,
        })
    }

    /// Like [`LockManager::acquire`], retrying while the key is held.
    ///
    /// # Errors
    ///
    /// Returns the last [`LockError::AlreadyLocked`] once all attempts are
    /// spent. Store errors are returned immediately.
    pub async fn acquire_with_retry(
        &self,
        key: &str,
        ttl: Duration,
        payload: LockPayload,
        policy: RetryPolicy,
    ) -> Result<LockGuard, LockError> {
        let attempts = policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.acquire(key, ttl, payload.clone()).await {
                Err(LockError::AlreadyLocked { .. }) if attempt < attempts => {
                    debug!(key, attempt, attempts, "retrying busy lock");
                    attempt += 1;
                    sleep(policy.pause).await;
                }
                result => return result,
            }
        }
    }

    /// Removes the lock unconditionally. Returns `false` when it had already
    /// expired.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Store`] when the store fails.
    pub async fn release(&self, lock: &NamedLock) -> Result<bool, LockError> {
        release_in(self.store.as_ref(), lock).await
    }

    /// Reads the payload of the current holder of `key`.
    ///
    /// An unreadable payload is reported as [`LockPayload::unknown`].
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Store`] when the store fails.
    pub async fn inspect(&self, key: &str) -> Result<Option<LockPayload>, LockError> {
        let raw = self.store.get(&store_key(key)).await?;
        Ok(raw.as_deref().map(LockPayload::decode))
    }

    /// Returns `true` when `key` is currently held.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Store`] when the store fails.
    pub async fn is_locked(&self, key: &str) -> Result<bool, LockError> {
        Ok(self.store.get(&store_key(key)).await?.is_some())
    }

    /// Operator override: removes `key` whoever holds it.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Store`] when the store fails.
    pub async fn break_lock(&self, key: &str) -> Result<bool, LockError> {
        let removed = self.store.remove(&store_key(key)).await?;
        warn!(key, removed, "lock broken by operator");
        Ok(removed)
    }

    /// Re-creates a guard from a hand-off token produced by
    /// [`NamedLock::to_token`]. The store is not consulted; the new guard
    /// releases the key like the original one would.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Token`] when the token is malformed.
    pub fn restore(&self, token: &str) -> Result<LockGuard, LockError> {
        let lock = NamedLock::from_token(token)?;
        debug!(key = %lock.key, "lock restored from token");
        Ok(LockGuard::new(Arc::clone(&self.store), lock))
    }
}

/// Scoped ownership of a [`NamedLock`].
///
/// Dropping an armed guard spawns a release on the current tokio runtime.
#[must_use = "dropping the guard releases the lock"]
pub struct LockGuard {
    store: Arc<dyn LockStore>,
    lock: NamedLock,
    armed: bool,
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("lock", &self.lock)
            .field("armed", &self.armed)
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    fn new(store: Arc<dyn LockStore>, lock: NamedLock) -> Self {
        Self {
            store,
            lock,
            armed: true,
        }
    }

    /// The held lock.
    #[must_use]
    pub const fn lock(&self) -> &NamedLock {
        &self.lock
    }

    /// Records the task continuing the operation in the stored payload,
    /// keeping the remaining TTL. Returns `false` when the lock has expired.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Store`] when the store fails.
    pub async fn attach_task(&mut self, task_id: &str) -> Result<bool, LockError> {
        self.lock.payload.task_id = Some(task_id.to_owned());
        let value = self.lock.payload.encode()?;
        let updated = self.store.replace(&self.lock.store_key(), &value).await?;
        debug!(key = %self.lock.key, task_id, updated, "lock payload updated");
        Ok(updated)
    }

    /// Releases the lock now.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Store`] when the store fails.
    pub async fn release(mut self) -> Result<bool, LockError> {
        self.armed = false;
        release_in(self.store.as_ref(), &self.lock).await
    }

    /// Disarms the guard and returns the lock for another task to release.
    pub fn hand_off(mut self) -> NamedLock {
        self.armed = false;
        debug!(key = %self.lock.key, "lock handed off");
        self.lock.clone()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let lock = self.lock.clone();
        match Handle::try_current() {
            Ok(handle) => {
                let store = Arc::clone(&self.store);
                handle.spawn(async move {
                    if let Err(err) = release_in(store.as_ref(), &lock).await {
                        warn!(key = %lock.key, error = %err, "failed to release dropped lock");
                    }
                });
            }
            Err(_) => {
                warn!(key = %lock.key, "lock dropped outside a runtime; it will expire on its own");
            }
        }
    }
}

async fn release_in(store: &dyn LockStore, lock: &NamedLock) -> Result<bool, LockError> {
    let removed = store.remove(&lock.store_key()).await?;
    if removed {
        debug!(key = %lock.key, "lock released");
    } else {
        info!(key = %lock.key, "lock had already expired at release");
    }
    Ok(removed)
}

fn store_key(key: &str) -> String {
    format!("{LOCK_PREFIX}{key}")
}

fn unix_now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}
