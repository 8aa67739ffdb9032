//! Persistent volume records and the store they live in.
//!
//! The coordinator never caches records: every operation re-reads the row
//! from the [`VolumeStore`] so concurrent control-plane processes observe a
//! single source of truth.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::backend::BackendFuture;

/// Lifecycle state of a persistent volume.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VolumeState {
    /// Requested; the backend has not confirmed the resource yet.
    Pending,
    /// The backend resource exists.
    Created,
    /// Deletion requested; waiting for the reaper.
    #[serde(rename = "TODELETE")]
    ToDelete,
    /// The backend resource is gone. Terminal.
    Deleted,
}

impl VolumeState {
    /// Returns `true` when moving from `self` to `next` is allowed.
    ///
    /// States only move forward; `PENDING` may be re-entered while creation
    /// is retried, and `DELETED` is terminal.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Pending | Self::Created | Self::ToDelete)
                | (Self::Created, Self::Created | Self::ToDelete)
                | (Self::ToDelete, Self::ToDelete | Self::Deleted)
        )
    }

    /// Upper-case label used in logs and persisted rows.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Created => "CREATED",
            Self::ToDelete => "TODELETE",
            Self::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persistent volume as recorded by the control plane.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PersistentVolume {
    /// Opaque record id.
    pub id: Uuid,
    /// Name, unique per owner.
    pub name: String,
    /// Backend-qualified physical identifier.
    pub drive_name: String,
    /// Owning user.
    pub owner_id: u64,
    /// Size in GB.
    pub size: u64,
    /// Workload currently using the volume.
    pub pod_id: Option<String>,
    /// Node the volume is bound to (local volumes only).
    pub node_id: Option<String>,
    /// Lifecycle state.
    pub state: VolumeState,
}

impl PersistentVolume {
    /// Creates a `PENDING` record with a fresh id.
    #[must_use]
    pub fn pending(
        owner_id: u64,
        name: impl Into<String>,
        drive_name: impl Into<String>,
        size: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            drive_name: drive_name.into(),
            owner_id,
            size,
            pod_id: None,
            node_id: None,
            state: VolumeState::Pending,
        }
    }

    /// Moves the record to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`RecordStoreError::InvalidTransition`] for backward moves.
    pub fn transition(&mut self, next: VolumeState) -> Result<(), RecordStoreError> {
        if !self.state.can_transition_to(next) {
            return Err(RecordStoreError::InvalidTransition {
                id: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

/// Errors raised by volume record stores.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RecordStoreError {
    /// Raised when a record does not exist.
    #[error("persistent volume {id} not found")]
    NotFound {
        /// Requested record id.
        id: Uuid,
    },
    /// Raised when a state change would move backwards.
    #[error("persistent volume {id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Record id.
        id: Uuid,
        /// Current state.
        from: VolumeState,
        /// Requested state.
        to: VolumeState,
    },
    /// Raised when the store itself fails.
    #[error("volume store unavailable: {message}")]
    Unavailable {
        /// Underlying error message.
        message: String,
    },
}

/// Persistence of [`PersistentVolume`] rows.
pub trait VolumeStore: Send + Sync {
    /// Reads a record by id.
    fn get(&self, id: Uuid) -> BackendFuture<'_, Option<PersistentVolume>, RecordStoreError>;

    /// Reads the record named `name` owned by `owner_id`, ignoring rows
    /// already `DELETED`.
    fn get_by_owner<'a>(
        &'a self,
        owner_id: u64,
        name: &'a str,
    ) -> BackendFuture<'a, Option<PersistentVolume>, RecordStoreError>;

    /// Inserts or replaces a record.
    fn save<'a>(&'a self, volume: &'a PersistentVolume) -> BackendFuture<'a, (), RecordStoreError>;

    /// Removes a record. Returns `true` when a row was removed.
    fn delete(&self, id: Uuid) -> BackendFuture<'_, bool, RecordStoreError>;

    /// Lists records bound to `node_id`.
    fn find_by_node<'a>(
        &'a self,
        node_id: &'a str,
    ) -> BackendFuture<'a, Vec<PersistentVolume>, RecordStoreError>;

    /// Lists records in `state`.
    fn find_by_state(
        &self,
        state: VolumeState,
    ) -> BackendFuture<'_, Vec<PersistentVolume>, RecordStoreError>;
}

/// In-memory [`VolumeStore`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryVolumeStore {
    rows: Arc<Mutex<BTreeMap<Uuid, PersistentVolume>>>,
}

impl InMemoryVolumeStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every row, ordered by id.
    #[must_use]
    pub fn all(&self) -> Vec<PersistentVolume> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Applies `edit` to the row `id` in place. Returns `false` when the row
    /// does not exist.
    pub fn edit(&self, id: Uuid, edit: impl FnOnce(&mut PersistentVolume)) -> bool {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        rows.get_mut(&id).map(edit).is_some()
    }

    fn select(&self, predicate: impl Fn(&PersistentVolume) -> bool) -> Vec<PersistentVolume> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|row| predicate(row))
            .cloned()
            .collect()
    }
}

impl VolumeStore for InMemoryVolumeStore {
    fn get(&self, id: Uuid) -> BackendFuture<'_, Option<PersistentVolume>, RecordStoreError> {
        Box::pin(async move {
            Ok(self
                .rows
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&id)
                .cloned())
        })
    }

    fn get_by_owner<'a>(
        &'a self,
        owner_id: u64,
        name: &'a str,
    ) -> BackendFuture<'a, Option<PersistentVolume>, RecordStoreError> {
        Box::pin(async move {
            Ok(self
                .select(|row| {
                    row.owner_id == owner_id
                        && row.name == name
                        && row.state != VolumeState::Deleted
                })
                .into_iter()
                .next())
        })
    }

    fn save<'a>(&'a self, volume: &'a PersistentVolume) -> BackendFuture<'a, (), RecordStoreError> {
        Box::pin(async move {
            self.rows
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(volume.id, volume.clone());
            Ok(())
        })
    }

    fn delete(&self, id: Uuid) -> BackendFuture<'_, bool, RecordStoreError> {
        Box::pin(async move {
            Ok(self
                .rows
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id)
                .is_some())
        })
    }

    fn find_by_node<'a>(
        &'a self,
        node_id: &'a str,
    ) -> BackendFuture<'a, Vec<PersistentVolume>, RecordStoreError> {
        Box::pin(async move { Ok(self.select(|row| row.node_id.as_deref() == Some(node_id))) })
    }

    fn find_by_state(
        &self,
        state: VolumeState,
    ) -> BackendFuture<'_, Vec<PersistentVolume>, RecordStoreError> {
        Box::pin(async move { Ok(self.select(|row| row.state == state)) })
    }
}
