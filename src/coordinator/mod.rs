//! Volume lifecycle coordination.
//!
//! The [`VolumeCoordinator`] ties the record store, the named locks and the
//! storage backend together. Every mutating backend call runs under the lock
//! named after the volume's drive name, so two control-plane workers never
//! touch the same physical resource at once. Deletion is two-phase: the user
//! request only marks the row `TODELETE`, and the reaper removes the physical
//! resource once the backend reports it detached.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{
    BackendContext, BackendError, CreateOutcome, DEFAULT_FILESYSTEM, DeleteOutcome, DriveInfo,
    FormatOutcome, StorageBackend, VolumeSpec, VolumeTarget,
};
use crate::drive_name::{DriveName, NAMESPACE_SEPARATOR, OWNER_SEPARATOR};
use crate::lock::{LockError, LockGuard, LockManager, LockPayload, RetryPolicy};
use crate::records::{PersistentVolume, RecordStoreError, VolumeState, VolumeStore};
use crate::tasks::{TaskError, TaskQueue, TaskRef, job};

/// Default TTL of per-volume locks. Longer than the slowest mkfs.
pub const DEFAULT_VOLUME_LOCK_TTL: Duration = Duration::from_secs(1800);

/// Tunables of the coordinator.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CoordinatorSettings {
    /// TTL of the per-volume lock.
    pub lock_ttl: Duration,
    /// Retry schedule used by `format` while another operation holds the lock.
    pub format_retry: RetryPolicy,
    /// Namespace prefix for network drive names.
    pub namespace: Option<String>,
    /// Filesystem used when `format` is not given one.
    pub filesystem: String,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            lock_ttl: DEFAULT_VOLUME_LOCK_TTL,
            format_retry: RetryPolicy::default(),
            namespace: None,
            filesystem: String::from(DEFAULT_FILESYSTEM),
        }
    }
}

/// Parameters of a volume creation request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeRequest {
    /// Owning user.
    pub owner_id: u64,
    /// Volume name, unique per owner.
    pub name: String,
    /// Size in GB.
    pub size: u64,
    /// Node to bind the volume to; required by the local backend.
    pub node_id: Option<String>,
}

impl VolumeRequest {
    /// Builds an unbound request.
    #[must_use]
    pub fn new(owner_id: u64, name: impl Into<String>, size: u64) -> Self {
        Self {
            owner_id,
            name: name.into(),
            size,
            node_id: None,
        }
    }

    /// Binds the volume to `node_id`.
    #[must_use]
    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}

/// Errors surfaced by the coordinator.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum VolumeError {
    /// Raised when the request itself is malformed.
    #[error("invalid volume request: {message}")]
    InvalidRequest {
        /// What is wrong with the request.
        message: String,
    },
    /// Raised when the volume record does not exist.
    #[error("persistent volume {id} not found")]
    NotFound {
        /// Requested id.
        id: Uuid,
    },
    /// Raised when an operation does not apply to the record's state.
    #[error("persistent volume {name} is {state}")]
    InvalidState {
        /// Volume name.
        name: String,
        /// Current state.
        state: VolumeState,
    },
    /// Raised when a volume with the same name exists with another size.
    #[error("persistent volume {name} already exists with size {existing} GB")]
    SizeMismatch {
        /// Volume name.
        name: String,
        /// Size of the existing volume.
        existing: u64,
    },
    /// Raised when a retried request names another node than the pending
    /// volume it resumes.
    #[error("persistent volume {name} is already bound to node {existing}")]
    NodeMismatch {
        /// Volume name.
        name: String,
        /// Node of the pending volume, or `none`.
        existing: String,
    },
    /// Raised when another operation holds the volume lock.
    #[error("persistent volume {drive_name} is busy ({operation})")]
    Locked {
        /// Drive name of the volume.
        drive_name: String,
        /// Operation holding the lock.
        operation: String,
    },
    /// Raised when the storage backend fails.
    #[error("storage backend failed for {drive_name}: {source}")]
    Backend {
        /// Drive name of the volume.
        drive_name: String,
        /// Backend error.
        #[source]
        source: BackendError,
    },
    /// Raised when the backend cannot list its drives.
    #[error("cannot list storage drives: {source}")]
    Inventory {
        /// Backend error.
        #[source]
        source: BackendError,
    },
    /// Raised when the record store fails.
    #[error(transparent)]
    Store(#[from] RecordStoreError),
    /// Raised when the lock store fails.
    #[error(transparent)]
    Lock(LockError),
}

impl VolumeError {
    /// Full diagnostic for operators and logs.
    #[must_use]
    pub fn admin_reason(&self) -> String {
        self.to_string()
    }

    /// Message safe to show to the volume owner.
    #[must_use]
    pub fn user_reason(&self) -> String {
        match self {
            Self::InvalidRequest { .. }
            | Self::NotFound { .. }
            | Self::InvalidState { .. }
            | Self::SizeMismatch { .. }
            | Self::NodeMismatch { .. } => self.to_string(),
            Self::Locked { .. } => String::from(
                "the persistent volume is busy with another operation, try again later",
            ),
            Self::Backend {
                source: BackendError::NoNodes { .. },
                ..
            } => String::from("there are no nodes available for persistent storage"),
            Self::Backend { .. } | Self::Inventory { .. } | Self::Store(_) | Self::Lock(_) => {
                String::from(
                    "persistent storage is temporarily unavailable, contact your administrator",
                )
            }
        }
    }

    fn backend(drive_name: &str, source: BackendError) -> Self {
        Self::Backend {
            drive_name: drive_name.to_owned(),
            source,
        }
    }

    fn from_lock(err: LockError) -> Self {
        match err {
            LockError::AlreadyLocked { key, holder } => Self::Locked {
                drive_name: key,
                operation: holder.map_or_else(
                    || String::from(crate::lock::UNKNOWN_OPERATION),
                    |payload| payload.operation,
                ),
            },
            other => Self::Lock(other),
        }
    }
}

/// Outcome of reaping a single volume.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReapOutcome {
    /// The physical resource is gone and the row is `DELETED`.
    Deleted,
    /// The resource is still attached; the row stays `TODELETE`.
    InUse,
    /// Another operation holds the volume lock; retried next sweep.
    Skipped,
    /// The row no longer exists or is not waiting for deletion.
    Gone,
}

/// Summary of a reaper sweep.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReapSummary {
    /// Volumes whose physical resource was removed.
    pub deleted: usize,
    /// Volumes still attached somewhere.
    pub in_use: usize,
    /// Volumes locked by another operation.
    pub skipped: usize,
    /// Volumes whose deletion failed.
    pub failed: usize,
}

impl fmt::Display for ReapSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "deleted={} in_use={} skipped={} failed={}",
            self.deleted, self.in_use, self.skipped, self.failed
        )
    }
}

/// Orchestrates the persistent volume lifecycle.
#[derive(Clone)]
pub struct VolumeCoordinator {
    backend: Arc<dyn StorageBackend>,
    store: Arc<dyn VolumeStore>,
    locks: LockManager,
    tasks: Arc<dyn TaskQueue>,
    settings: Arc<CoordinatorSettings>,
}

impl fmt::Debug for VolumeCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeCoordinator")
            .field("backend", &self.backend.kind())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl VolumeCoordinator {
    /// Wires a coordinator from its collaborators.
    #[must_use]
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        store: Arc<dyn VolumeStore>,
        locks: LockManager,
        tasks: Arc<dyn TaskQueue>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            backend,
            store,
            locks,
            tasks,
            settings: Arc::new(settings),
        }
    }

    /// Drive name the volume `name` of `owner_id` gets on this backend.
    #[must_use]
    pub fn drive_name(&self, owner_id: u64, name: &str) -> String {
        DriveName::compose(
            self.backend.kind(),
            self.settings.namespace.as_deref(),
            owner_id,
            name,
        )
        .to_string()
    }

    /// Creates a volume, or returns the existing one when an identical
    /// request already succeeded.
    ///
    /// The row is recorded `PENDING` under the volume lock and moves to
    /// `CREATED` once the backend confirms the resource. A backend failure
    /// removes the row it inserted.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::Locked`] when another operation holds the
    /// volume, [`VolumeError::Backend`] when the backend fails, and the
    /// validation variants for conflicting requests.
    pub async fn create(&self, request: VolumeRequest) -> Result<PersistentVolume, VolumeError> {
        validate(&request)?;
        if let Some(row) = self.existing(&request).await? {
            return Ok(row);
        }

        let drive_name = self.drive_name(request.owner_id, &request.name);
        let guard = self
            .lock(&drive_name, "create", RetryPolicy::fail_fast())
            .await?;
        let result = self.create_locked(&request, drive_name).await;
        release(guard).await;
        result
    }

    /// Returns the finished volume matching `request`, if any.
    async fn existing(
        &self,
        request: &VolumeRequest,
    ) -> Result<Option<PersistentVolume>, VolumeError> {
        match self
            .store
            .get_by_owner(request.owner_id, &request.name)
            .await?
        {
            Some(row) if row.state == VolumeState::Created => {
                if row.size != request.size {
                    return Err(VolumeError::SizeMismatch {
                        name: row.name,
                        existing: row.size,
                    });
                }
                debug!(volume = %row.id, "volume already created");
                Ok(Some(row))
            }
            Some(row) if row.state == VolumeState::ToDelete => Err(VolumeError::InvalidState {
                name: row.name,
                state: row.state,
            }),
            _ => Ok(None),
        }
    }

    async fn create_locked(
        &self,
        request: &VolumeRequest,
        drive_name: String,
    ) -> Result<PersistentVolume, VolumeError> {
        // Re-read under the lock: another worker may have finished meanwhile.
        if let Some(row) = self.existing(request).await? {
            return Ok(row);
        }
        let (mut volume, inserted) = match self
            .store
            .get_by_owner(request.owner_id, &request.name)
            .await?
        {
            Some(row) => {
                resumable(&row, request)?;
                (row, false)
            }
            None => {
                let mut row = PersistentVolume::pending(
                    request.owner_id,
                    &request.name,
                    drive_name,
                    request.size,
                );
                row.node_id.clone_from(&request.node_id);
                self.store.save(&row).await?;
                (row, true)
            }
        };

        let created = self
            .backend
            .create(&BackendContext::new(), &VolumeTarget::from(&volume))
            .await;
        match created {
            Ok(outcome) => {
                volume.transition(VolumeState::Created)?;
                self.store.save(&volume).await?;
                info!(
                    volume = %volume.id,
                    drive_name = %volume.drive_name,
                    existed = outcome == CreateOutcome::AlreadyExists,
                    "volume created"
                );
                Ok(volume)
            }
            Err(err) => {
                error!(drive_name = %volume.drive_name, error = %err, "backend create failed");
                if inserted {
                    self.discard(&volume).await;
                }
                Err(VolumeError::backend(&volume.drive_name, err))
            }
        }
    }

    /// Creates `filesystem` (or the default one) on the volume unless one is
    /// present. Waits for the volume lock according to the retry settings.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::Locked`] when the lock stays busy and
    /// [`VolumeError::Backend`] when the backend fails.
    pub async fn format(
        &self,
        volume_id: Uuid,
        filesystem: Option<&str>,
    ) -> Result<FormatOutcome, VolumeError> {
        let volume = self.load(volume_id).await?;
        if volume.state != VolumeState::Created {
            return Err(VolumeError::InvalidState {
                name: volume.name,
                state: volume.state,
            });
        }
        let fs_type = filesystem.unwrap_or(&self.settings.filesystem);
        let guard = self
            .lock(&volume.drive_name, "format", self.settings.format_retry)
            .await?;
        let formatted = self
            .backend
            .format(&BackendContext::new(), &VolumeTarget::from(&volume), fs_type)
            .await;
        release(guard).await;
        formatted
            .inspect(|outcome| debug!(drive_name = %volume.drive_name, ?outcome, "format finished"))
            .map_err(|err| {
                error!(drive_name = %volume.drive_name, error = %err, "backend format failed");
                VolumeError::backend(&volume.drive_name, err)
            })
    }

    /// Marks the volume `TODELETE` and schedules its removal.
    ///
    /// Neither the lock nor the backend is touched here, so the call returns
    /// promptly even when the backend is unreachable.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::NotFound`] for unknown ids and
    /// [`VolumeError::InvalidState`] for volumes already deleted.
    pub async fn delete(&self, volume_id: Uuid) -> Result<TaskRef, VolumeError> {
        let mut volume = self.load(volume_id).await?;
        if volume.state == VolumeState::Deleted {
            return Err(VolumeError::InvalidState {
                name: volume.name,
                state: volume.state,
            });
        }
        if volume.state != VolumeState::ToDelete {
            volume.transition(VolumeState::ToDelete)?;
            self.store.save(&volume).await?;
        }
        info!(volume = %volume.id, drive_name = %volume.drive_name, "volume marked for deletion");

        let coordinator = self.clone();
        let task = self.tasks.submit(
            job(move |_| async move {
                coordinator
                    .reap_one(volume_id)
                    .await
                    .map(drop)
                    .map_err(TaskError::failed)
            }),
            Some(Box::new(move |task: TaskRef, err: &TaskError| {
                warn!(%task, volume = %volume_id, error = %err, "deferred delete failed; the reaper will retry");
            })),
        );
        Ok(task)
    }

    /// Removes the physical resource of one `TODELETE` volume.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::Backend`] when the backend fails and store or
    /// lock errors as they occur.
    pub async fn reap_one(&self, volume_id: Uuid) -> Result<ReapOutcome, VolumeError> {
        let Some(queued) = self.store.get(volume_id).await? else {
            return Ok(ReapOutcome::Gone);
        };
        if queued.state != VolumeState::ToDelete {
            return Ok(ReapOutcome::Gone);
        }
        let guard = match self
            .lock(&queued.drive_name, "delete", RetryPolicy::fail_fast())
            .await
        {
            Ok(guard) => guard,
            Err(VolumeError::Locked { operation, .. }) => {
                debug!(drive_name = %queued.drive_name, %operation, "volume busy, reaping later");
                return Ok(ReapOutcome::Skipped);
            }
            Err(err) => return Err(err),
        };
        let result = self.reap_locked(volume_id).await;
        release(guard).await;
        result
    }

    async fn reap_locked(&self, volume_id: Uuid) -> Result<ReapOutcome, VolumeError> {
        // The row may have changed between the sweep listing and the lock.
        let volume = match self.store.get(volume_id).await? {
            Some(row) if row.state == VolumeState::ToDelete => row,
            _ => return Ok(ReapOutcome::Gone),
        };
        let deleted = self
            .backend
            .delete(&BackendContext::new(), &VolumeTarget::from(&volume))
            .await;
        match deleted {
            Ok(DeleteOutcome::InUse) => {
                info!(drive_name = %volume.drive_name, "volume still in use, keeping for later");
                Ok(ReapOutcome::InUse)
            }
            Ok(outcome @ (DeleteOutcome::Deleted | DeleteOutcome::Missing)) => {
                // Only the state is ours to change; keep edits made while
                // the backend ran.
                let Some(mut fresh) = self.store.get(volume_id).await? else {
                    return Ok(ReapOutcome::Gone);
                };
                if fresh.state != VolumeState::Deleted {
                    fresh.transition(VolumeState::Deleted)?;
                    self.store.save(&fresh).await?;
                }
                info!(drive_name = %fresh.drive_name, ?outcome, "volume deleted");
                Ok(ReapOutcome::Deleted)
            }
            Err(err) => {
                error!(drive_name = %volume.drive_name, error = %err, "backend delete failed");
                Err(VolumeError::backend(&volume.drive_name, err))
            }
        }
    }

    /// Sweeps every `TODELETE` volume once.
    ///
    /// Individual failures are counted and logged; they never abort the sweep.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::Store`] when the pending rows cannot be listed.
    pub async fn reap(&self) -> Result<ReapSummary, VolumeError> {
        let pending = self.store.find_by_state(VolumeState::ToDelete).await?;
        let mut summary = ReapSummary::default();
        for volume in pending {
            match self.reap_one(volume.id).await {
                Ok(ReapOutcome::Deleted) => summary.deleted += 1,
                Ok(ReapOutcome::InUse) => summary.in_use += 1,
                Ok(ReapOutcome::Skipped) => summary.skipped += 1,
                Ok(ReapOutcome::Gone) => {}
                Err(err) => {
                    summary.failed += 1;
                    error!(volume = %volume.id, reason = %err.admin_reason(), "reap failed");
                }
            }
        }
        info!(%summary, "reaper sweep finished");
        Ok(summary)
    }

    /// Runs [`VolumeCoordinator::reap`] every `period` on the current runtime.
    #[must_use = "dropping the handle detaches the reaper; abort it to stop"]
    pub fn spawn_reaper(&self, period: Duration) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = coordinator.reap().await {
                    error!(reason = %err.admin_reason(), "reaper sweep failed");
                }
            }
        })
    }

    /// Drops the bindings of deleted volumes to a node that is going away.
    ///
    /// Best effort: failures are logged and the number of removed rows is
    /// returned.
    pub async fn purge_node_bindings(&self, node_id: &str) -> usize {
        let rows = match self.store.find_by_node(node_id).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(node_id, error = %err, "cannot list volumes bound to node");
                return 0;
            }
        };
        let mut purged = 0;
        for row in rows
            .iter()
            .filter(|row| matches!(row.state, VolumeState::ToDelete | VolumeState::Deleted))
        {
            match self.store.delete(row.id).await {
                Ok(true) => purged += 1,
                Ok(false) => {}
                Err(err) => warn!(node_id, volume = %row.id, error = %err, "cannot purge volume row"),
            }
        }
        info!(node_id, purged, "purged node volume bindings");
        purged
    }

    /// Lists the drives present on the backend, optionally only those of
    /// `owner_id`.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::Inventory`] when the backend cannot be listed.
    pub async fn drives(&self, owner_id: Option<u64>) -> Result<Vec<DriveInfo>, VolumeError> {
        let drives = self
            .backend
            .list_drives(&BackendContext::new(), self.settings.namespace.as_deref())
            .await
            .map_err(|source| {
                error!(error = %source, "cannot list storage drives");
                VolumeError::Inventory { source }
            })?;
        Ok(drives
            .into_iter()
            .filter(|drive| owner_id.is_none_or(|owner| drive.owner_id == owner))
            .collect())
    }

    /// Like [`VolumeCoordinator::drives`], keeping only drives no node
    /// currently uses.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::Inventory`] when the backend cannot be listed.
    pub async fn unmapped_drives(
        &self,
        owner_id: Option<u64>,
    ) -> Result<Vec<DriveInfo>, VolumeError> {
        let mut drives = self.drives(owner_id).await?;
        drives.retain(|drive| !drive.in_use);
        Ok(drives)
    }

    /// Volume-spec description of the volume for workload definitions.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::NotFound`] for unknown ids and
    /// [`VolumeError::Backend`] when connection details cannot be resolved.
    pub async fn wire_spec(&self, volume_id: Uuid) -> Result<VolumeSpec, VolumeError> {
        let volume = self.load(volume_id).await?;
        self.backend
            .to_wire(&BackendContext::new(), &VolumeTarget::from(&volume))
            .await
            .map_err(|err| VolumeError::backend(&volume.drive_name, err))
    }

    /// Finds the record described by a volume spec taken from a workload.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::Backend`] when the spec does not belong to this
    /// backend or its drive name cannot be parsed.
    pub async fn resolve_wire(
        &self,
        spec: &VolumeSpec,
    ) -> Result<Option<PersistentVolume>, VolumeError> {
        let wire = self
            .backend
            .from_wire(spec)
            .map_err(|err| VolumeError::backend(&spec.name, err))?;
        let drive = DriveName::parse(self.backend.kind(), &wire.drive_name).map_err(|_| {
            VolumeError::backend(
                &wire.drive_name,
                BackendError::InvalidDriveName {
                    drive_name: wire.drive_name.clone(),
                },
            )
        })?;
        Ok(self
            .store
            .get_by_owner(drive.owner_id, &drive.name)
            .await?
            .filter(|row| row.drive_name == wire.drive_name))
    }

    async fn load(&self, volume_id: Uuid) -> Result<PersistentVolume, VolumeError> {
        self.store
            .get(volume_id)
            .await?
            .ok_or(VolumeError::NotFound { id: volume_id })
    }

    async fn lock(
        &self,
        drive_name: &str,
        operation: &str,
        policy: RetryPolicy,
    ) -> Result<LockGuard, VolumeError> {
        self.locks
            .acquire_with_retry(
                drive_name,
                self.settings.lock_ttl,
                LockPayload::new(operation),
                policy,
            )
            .await
            .map_err(VolumeError::from_lock)
    }

    async fn discard(&self, volume: &PersistentVolume) {
        if let Err(err) = self.store.delete(volume.id).await {
            warn!(volume = %volume.id, error = %err, "cannot remove pending volume row");
        }
    }
}

async fn release(guard: LockGuard) {
    let key = guard.lock().key.clone();
    if let Err(err) = guard.release().await {
        warn!(key = %key, error = %err, "failed to release volume lock");
    }
}

fn validate(request: &VolumeRequest) -> Result<(), VolumeError> {
    if request.name.trim().is_empty() {
        return Err(VolumeError::InvalidRequest {
            message: String::from("volume name is empty"),
        });
    }
    let name = request.name.as_str();
    if name == "."
        || name == ".."
        || name.contains(NAMESPACE_SEPARATOR)
        || name.contains(OWNER_SEPARATOR)
    {
        return Err(VolumeError::InvalidRequest {
            message: format!("volume name {name:?} is not a single path component"),
        });
    }
    if request.size == 0 {
        return Err(VolumeError::InvalidRequest {
            message: String::from("volume size must be at least 1 GB"),
        });
    }
    Ok(())
}

/// Checks that a `PENDING` row left by an earlier attempt matches the retried
/// request.
fn resumable(row: &PersistentVolume, request: &VolumeRequest) -> Result<(), VolumeError> {
    if row.size != request.size {
        return Err(VolumeError::SizeMismatch {
            name: row.name.clone(),
            existing: row.size,
        });
    }
    if row.node_id != request.node_id {
        return Err(VolumeError::NodeMismatch {
            name: row.name.clone(),
            existing: row.node_id.clone().unwrap_or_else(|| String::from("none")),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests;
