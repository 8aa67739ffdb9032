//! Storage backend abstraction.
//!
//! A backend knows how to place, create, format and delete the physical
//! resource behind a [`crate::records::PersistentVolume`], and how to describe
//! it in the orchestrator's volume-spec format. Three implementations exist:
//! [`ClusteredBackend`] (rbd images in a Ceph pool), [`CloudBackend`]
//! (provider block volumes attached to the node's instance) and
//! [`LocalBackend`] (directories on a single node).

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::OnceCell;

use crate::drive_name::DriveName;
use crate::executor::{CommandRunner, NodeCommandError, RemoteExecutor, quote};
use crate::nodes::{Node, NodeDirectoryError};
use crate::records::PersistentVolume;

pub mod cloud;
pub mod clustered;
pub mod local;
pub mod wire;

pub use cloud::{
    AwsCliApi, BlockStorageApi, CloudAttachment, CloudBackend, CloudSettings, CloudVolume,
};
pub use clustered::{ClusteredBackend, ClusteredSettings};
pub use local::{DEFAULT_LOCAL_STORAGE_PREFIX, LocalBackend, StaticVolumeUsage, VolumeUsage};
pub use wire::{VolumeSpec, WireVolume};

/// Future returned by backend and collaborator operations.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Filesystem created by `format` when the caller does not name one.
pub const DEFAULT_FILESYSTEM: &str = "xfs";

/// Multiplier applied to the executor timeout for filesystem creation.
const MKFS_TIMEOUT_FACTOR: u32 = 10;

/// Storage backend variants, resolved once from configuration.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BackendKind {
    /// rbd images in a Ceph cluster.
    Clustered,
    /// Provider block volumes (EBS).
    Cloud,
    /// Directories on a single node.
    Local,
}

impl BackendKind {
    /// Name used in logs and configuration.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Clustered => "clustered",
            Self::Cloud => "cloud",
            Self::Local => "local",
        }
    }

    /// Detects which backend produced a wire-format volume spec.
    #[must_use]
    pub const fn of_wire(spec: &VolumeSpec) -> Option<Self> {
        if spec.rbd.is_some() {
            Some(Self::Clustered)
        } else if spec.aws_elastic_block_store.is_some() {
            Some(Self::Cloud)
        } else if spec.local_storage.is_some() {
            Some(Self::Local)
        } else {
            None
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "clustered" | "ceph" | "rbd" => Ok(Self::Clustered),
            "cloud" | "aws" | "ebs" => Ok(Self::Cloud),
            "local" | "localstorage" => Ok(Self::Local),
            other => Err(BackendError::UnknownKind(other.to_owned())),
        }
    }
}

/// The physical volume a backend operation acts on.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeTarget {
    /// User-facing volume name, used as the wire-format volume name.
    pub name: String,
    /// Backend-qualified physical identifier.
    pub drive_name: String,
    /// Size in GB.
    pub size_gb: u64,
    /// Node the volume is pinned to, when the backend requires one.
    pub node_id: Option<String>,
}

impl VolumeTarget {
    /// Creates a target that is not pinned to any node.
    #[must_use]
    pub fn new(name: impl Into<String>, drive_name: impl Into<String>, size_gb: u64) -> Self {
        Self {
            name: name.into(),
            drive_name: drive_name.into(),
            size_gb,
            node_id: None,
        }
    }

    /// Pins the target to a node.
    #[must_use]
    pub fn node_id(mut self, value: Option<String>) -> Self {
        self.node_id = value;
        self
    }
}

impl From<&PersistentVolume> for VolumeTarget {
    fn from(volume: &PersistentVolume) -> Self {
        Self::new(&volume.name, &volume.drive_name, volume.size).node_id(volume.node_id.clone())
    }
}

/// Outcome of an idempotent create.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CreateOutcome {
    /// The physical resource was created by this call.
    Created,
    /// The resource already existed; treated as success.
    AlreadyExists,
}

/// Outcome of a format request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FormatOutcome {
    /// A new filesystem was created.
    Formatted,
    /// A filesystem was already present; nothing was written.
    AlreadyFormatted,
    /// The volume is attached elsewhere, so it was left untouched.
    InUse,
}

/// Outcome of a delete request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeleteOutcome {
    /// The physical resource was removed.
    Deleted,
    /// The resource is still attached or referenced; retry later.
    InUse,
    /// The resource did not exist.
    Missing,
}

impl DeleteOutcome {
    /// Return-code view of the outcome: non-zero means "still in use".
    #[must_use]
    pub const fn return_code(self) -> i32 {
        match self {
            Self::Deleted | Self::Missing => 0,
            Self::InUse => 1,
        }
    }
}

/// A physical drive found on the backend, whether or not a record owns it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DriveInfo {
    /// Backend-qualified physical identifier.
    pub drive_name: String,
    /// Volume name recovered from the drive name.
    pub name: String,
    /// Owner recovered from the drive name.
    pub owner_id: u64,
    /// Size in GB; unknown for directories.
    pub size_gb: Option<u64>,
    /// Mapped, attached or declared by a pod.
    pub in_use: bool,
    /// Node hostname the drive is mapped on (for local drives, the node
    /// holding the directory), or the instance id for cloud volumes.
    pub node: Option<String>,
    /// Block device the drive is mapped to.
    pub device: Option<String>,
}

impl DriveInfo {
    /// Builds an unused entry for `drive_name`, or `None` when the name does
    /// not carry an owner and so was not created by this system.
    #[must_use]
    pub fn unused(kind: BackendKind, drive_name: &str, size_gb: Option<u64>) -> Option<Self> {
        let parsed = DriveName::parse(kind, drive_name).ok()?;
        Some(Self {
            drive_name: drive_name.to_owned(),
            name: parsed.name,
            owner_id: parsed.owner_id,
            size_gb,
            in_use: false,
            node: None,
            device: None,
        })
    }

    /// Marks the drive in use on `node`, optionally through `device`.
    #[must_use]
    pub fn used_on(mut self, node: impl Into<String>, device: Option<String>) -> Self {
        self.in_use = true;
        self.node = Some(node.into());
        self.device = device;
        self
    }
}

/// Errors raised by storage backends.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BackendError {
    /// Raised when no node is eligible for the backend.
    #[error("there are no nodes for \"{backend}\" storage")]
    NoNodes {
        /// Backend that needed a node.
        backend: BackendKind,
    },
    /// Raised when a node command fails.
    #[error(transparent)]
    Command(#[from] NodeCommandError),
    /// Raised when the node directory cannot be queried.
    #[error(transparent)]
    Nodes(#[from] NodeDirectoryError),
    /// Raised when the cloud provider rejects a request.
    #[error("provider error: {message}")]
    Provider {
        /// Message returned by the provider tooling.
        message: String,
    },
    /// Raised when a device does not reach the expected state in time.
    #[error("device {device} failed to switch to {state} state")]
    DeviceTimeout {
        /// Block device on the node.
        device: String,
        /// Expected state (`attached` or `detached`).
        state: String,
    },
    /// Raised when a cloud volume is attached while it must not be.
    #[error("drive {drive_name} is already attached")]
    AlreadyAttached {
        /// Drive name of the attached volume.
        drive_name: String,
    },
    /// Raised when no `/dev/xvd*` letter is left on the node.
    #[error("no free letters for devices on node {node}")]
    NoFreeDevice {
        /// Node that ran out of device letters.
        node: String,
    },
    /// Raised when the physical resource does not exist.
    #[error("drive {drive_name} not found")]
    NotFound {
        /// Drive name that was looked up.
        drive_name: String,
    },
    /// Raised when a drive name cannot be mapped to a safe physical location.
    #[error("invalid drive name: {drive_name}")]
    InvalidDriveName {
        /// Offending drive name.
        drive_name: String,
    },
    /// Raised when a wire-format spec lacks this backend's section or fields.
    #[error("volume spec is not a valid {backend} volume: {message}")]
    InvalidWire {
        /// Backend that attempted the translation.
        backend: BackendKind,
        /// What was missing or malformed.
        message: String,
    },
    /// Raised when a backend name cannot be parsed.
    #[error("unknown storage backend: {0}")]
    UnknownKind(String),
    /// Raised when the pod configuration source cannot be read.
    #[error("volume usage lookup failed: {message}")]
    Usage {
        /// Underlying error message.
        message: String,
    },
}

/// Short-lived per-request cache shared by the operations of one request.
///
/// Holds the selected node, cluster monitors and the pools already verified,
/// so repeated lookups within a request hit the node only once. Create a new
/// context for every request; never keep one around.
#[derive(Debug, Default)]
pub struct BackendContext {
    node: OnceCell<Node>,
    monitors: OnceCell<Vec<String>>,
    verified_pools: Mutex<HashSet<String>>,
}

impl BackendContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn node_or_init<F, Fut>(&self, init: F) -> Result<&Node, BackendError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Node, BackendError>>,
    {
        self.node.get_or_try_init(init).await
    }

    pub(crate) async fn monitors_or_init<F, Fut>(&self, init: F) -> Result<&[String], BackendError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<String>, BackendError>>,
    {
        self.monitors
            .get_or_try_init(init)
            .await
            .map(Vec::as_slice)
    }

    pub(crate) fn pool_verified(&self, pool: &str) -> bool {
        self.verified_pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(pool)
    }

    pub(crate) fn mark_pool_verified(&self, pool: &str) {
        self.verified_pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pool.to_owned());
    }
}

/// Capability set every storage backend provides.
pub trait StorageBackend: Send + Sync {
    /// Backend variant.
    fn kind(&self) -> BackendKind;

    /// Chooses the node that runs commands for `target`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::NoNodes`] when no node is eligible.
    fn select_node<'a>(
        &'a self,
        ctx: &'a BackendContext,
        target: &'a VolumeTarget,
    ) -> BackendFuture<'a, Node, BackendError>;

    /// Reports whether the physical resource exists. A missing namespace is
    /// reported as `false`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when the check itself fails.
    fn exists<'a>(
        &'a self,
        ctx: &'a BackendContext,
        target: &'a VolumeTarget,
    ) -> BackendFuture<'a, bool, BackendError>;

    /// Creates the physical resource; an existing resource is a success.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when creation fails.
    fn create<'a>(
        &'a self,
        ctx: &'a BackendContext,
        target: &'a VolumeTarget,
    ) -> BackendFuture<'a, CreateOutcome, BackendError>;

    /// Creates `filesystem` on the volume unless one is present. Any device
    /// mapped or attached for the purpose is released on every exit path.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when mapping, detection or mkfs fails.
    fn format<'a>(
        &'a self,
        ctx: &'a BackendContext,
        target: &'a VolumeTarget,
        filesystem: &'a str,
    ) -> BackendFuture<'a, FormatOutcome, BackendError>;

    /// Deletes the physical resource unless it is still in use.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] for genuine failures; "in use" is reported as
    /// [`DeleteOutcome::InUse`].
    fn delete<'a>(
        &'a self,
        ctx: &'a BackendContext,
        target: &'a VolumeTarget,
    ) -> BackendFuture<'a, DeleteOutcome, BackendError>;

    /// Lists the drives of `namespace` present on the backend, with their
    /// usage. Names that carry no owner are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when the backend cannot be queried.
    fn list_drives<'a>(
        &'a self,
        ctx: &'a BackendContext,
        namespace: Option<&'a str>,
    ) -> BackendFuture<'a, Vec<DriveInfo>, BackendError>;

    /// Describes the volume in the orchestrator's volume-spec format.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when connection details cannot be resolved.
    fn to_wire<'a>(
        &'a self,
        ctx: &'a BackendContext,
        target: &'a VolumeTarget,
    ) -> BackendFuture<'a, VolumeSpec, BackendError>;

    /// Recovers size and drive name from a volume spec produced by
    /// [`StorageBackend::to_wire`].
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::InvalidWire`] when the spec lacks this
    /// backend's section or fields.
    fn from_wire(&self, spec: &VolumeSpec) -> Result<WireVolume, BackendError>;
}

/// Detects an existing filesystem on `device` and creates one when absent.
///
/// `blkid` exits with 2 when it finds no filesystem signature.
pub(crate) async fn make_fs_if_missing<R: CommandRunner>(
    executor: &RemoteExecutor<R>,
    host: &str,
    device: &str,
    filesystem: &str,
) -> Result<FormatOutcome, BackendError> {
    let detect = format!("blkid -o value -s TYPE {}", quote(device));
    match executor.run(host, &detect, executor.default_timeout(), &[2]).await {
        Ok(existing) if !existing.trim().is_empty() => {
            tracing::debug!(host, device, filesystem = existing.trim(), "filesystem present");
            return Ok(FormatOutcome::AlreadyFormatted);
        }
        Ok(_) => {}
        Err(err) if err.is_recognized() => {}
        Err(err) => return Err(err.into()),
    }

    let mkfs = format!("mkfs.{} {}", quote(filesystem), quote(device));
    executor
        .run(
            host,
            &mkfs,
            executor.default_timeout() * MKFS_TIMEOUT_FACTOR,
            &[],
        )
        .await?;
    tracing::info!(host, device, filesystem, "created filesystem");
    Ok(FormatOutcome::Formatted)
}

/// Polling settings shared by the attach/detach wait loops.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollSettings {
    /// Pause between two checks.
    pub interval: Duration,
    /// Upper bound for the whole wait.
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(90),
        }
    }
}
