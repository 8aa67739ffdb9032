//! Node-local storage backend.
//!
//! A local volume is a directory `<prefix>/<drive_name>` on the node the
//! volume is bound to. There is no block device, so `format` has nothing to
//! do. A directory still declared by a workload's pod configuration is never
//! removed.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use tracing::{info, warn};

use super::{
    BackendContext, BackendError, BackendFuture, BackendKind, CreateOutcome, DeleteOutcome,
    DriveInfo, FormatOutcome, StorageBackend, VolumeSpec, VolumeTarget, WireVolume,
    wire::LocalStorageVolumeSource,
};
use crate::executor::{CommandRunner, RemoteExecutor, quote};
use crate::nodes::{Node, NodeDirectory, NodeFilter};

/// Default root of local volumes on a node.
pub const DEFAULT_LOCAL_STORAGE_PREFIX: &str = "/var/lib/kuberdock/storage";

/// Source of the drive names declared by workload pod configurations.
pub trait VolumeUsage: Send + Sync {
    /// Drive names currently declared by any pod.
    fn volumes_in_use(&self) -> BackendFuture<'_, BTreeSet<String>, BackendError>;
}

/// In-memory [`VolumeUsage`].
#[derive(Clone, Debug, Default)]
pub struct StaticVolumeUsage {
    drives: Arc<Mutex<BTreeSet<String>>>,
}

impl StaticVolumeUsage {
    /// Creates an empty usage set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares or releases `drive_name`.
    pub fn set_in_use(&self, drive_name: &str, in_use: bool) {
        let mut drives = self.drives.lock().unwrap_or_else(PoisonError::into_inner);
        if in_use {
            drives.insert(drive_name.to_owned());
        } else {
            drives.remove(drive_name);
        }
    }
}

impl VolumeUsage for StaticVolumeUsage {
    fn volumes_in_use(&self) -> BackendFuture<'_, BTreeSet<String>, BackendError> {
        Box::pin(async move {
            Ok(self
                .drives
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone())
        })
    }
}

/// Backend storing volumes as directories on their bound node.
pub struct LocalBackend<R: CommandRunner> {
    executor: RemoteExecutor<R>,
    nodes: Arc<dyn NodeDirectory>,
    usage: Arc<dyn VolumeUsage>,
    prefix: Utf8PathBuf,
}

impl<R: CommandRunner> LocalBackend<R> {
    /// Creates a backend rooted at `prefix` on every node.
    pub fn new(
        executor: RemoteExecutor<R>,
        nodes: Arc<dyn NodeDirectory>,
        usage: Arc<dyn VolumeUsage>,
        prefix: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            executor,
            nodes,
            usage,
            prefix: prefix.into(),
        }
    }

    /// Directory holding `drive_name`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::InvalidDriveName`] unless the drive name is
    /// exactly `owner/name`, so no volume directory can nest inside another.
    pub fn path_of(&self, drive_name: &str) -> Result<Utf8PathBuf, BackendError> {
        let relative = Utf8Path::new(drive_name);
        let components: Vec<_> = relative.components().collect();
        let plain = components.len() == 2
            && components
                .iter()
                .all(|component| matches!(component, Utf8Component::Normal(_)));
        if !plain {
            return Err(BackendError::InvalidDriveName {
                drive_name: drive_name.to_owned(),
            });
        }
        Ok(self.prefix.join(relative))
    }

    async fn node(
        &self,
        ctx: &BackendContext,
        target: &VolumeTarget,
    ) -> Result<Node, BackendError> {
        ctx.node_or_init(|| async {
            let node_id = target.node_id.as_deref().ok_or(BackendError::NoNodes {
                backend: BackendKind::Local,
            })?;
            Ok(self.nodes.node(node_id).await?)
        })
        .await
        .cloned()
    }

    async fn dir_exists(&self, host: &str, path: &Utf8Path) -> Result<bool, BackendError> {
        let command = format!("test -d {}", quote(path.as_str()));
        match self
            .executor
            .run(host, &command, self.executor.default_timeout(), &[1])
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.is_recognized() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

impl<R: CommandRunner> StorageBackend for LocalBackend<R> {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn select_node<'a>(
        &'a self,
        ctx: &'a BackendContext,
        target: &'a VolumeTarget,
    ) -> BackendFuture<'a, Node, BackendError> {
        Box::pin(self.node(ctx, target))
    }

    fn exists<'a>(
        &'a self,
        ctx: &'a BackendContext,
        target: &'a VolumeTarget,
    ) -> BackendFuture<'a, bool, BackendError> {
        Box::pin(async move {
            let path = self.path_of(&target.drive_name)?;
            let node = self.node(ctx, target).await?;
            self.dir_exists(&node.ip, &path).await
        })
    }

    fn create<'a>(
        &'a self,
        ctx: &'a BackendContext,
        target: &'a VolumeTarget,
    ) -> BackendFuture<'a, CreateOutcome, BackendError> {
        Box::pin(async move {
            let path = self.path_of(&target.drive_name)?;
            let node = self.node(ctx, target).await?;
            if self.dir_exists(&node.ip, &path).await? {
                return Ok(CreateOutcome::AlreadyExists);
            }
            let command = format!("mkdir -p {}", quote(path.as_str()));
            self.executor.run_default(&node.ip, &command).await?;
            info!(node = %node.hostname, path = %path, "created local volume");
            Ok(CreateOutcome::Created)
        })
    }

    fn format<'a>(
        &'a self,
        _ctx: &'a BackendContext,
        target: &'a VolumeTarget,
        _filesystem: &'a str,
    ) -> BackendFuture<'a, FormatOutcome, BackendError> {
        Box::pin(async move {
            self.path_of(&target.drive_name)?;
            Ok(FormatOutcome::AlreadyFormatted)
        })
    }

    fn delete<'a>(
        &'a self,
        ctx: &'a BackendContext,
        target: &'a VolumeTarget,
    ) -> BackendFuture<'a, DeleteOutcome, BackendError> {
        Box::pin(async move {
            let path = self.path_of(&target.drive_name)?;
            if self
                .usage
                .volumes_in_use()
                .await?
                .contains(&target.drive_name)
            {
                return Ok(DeleteOutcome::InUse);
            }
            let node = self.node(ctx, target).await?;
            if !self.dir_exists(&node.ip, &path).await? {
                return Ok(DeleteOutcome::Missing);
            }
            let command = format!("rm -rf {}", quote(path.as_str()));
            self.executor.run_default(&node.ip, &command).await?;
            info!(node = %node.hostname, path = %path, "removed local volume");
            Ok(DeleteOutcome::Deleted)
        })
    }

    fn list_drives<'a>(
        &'a self,
        _ctx: &'a BackendContext,
        _namespace: Option<&'a str>,
    ) -> BackendFuture<'a, Vec<DriveInfo>, BackendError> {
        Box::pin(async move {
            let declared = self.usage.volumes_in_use().await?;
            let command = format!(
                "find {} -mindepth 2 -maxdepth 2 -type d",
                quote(self.prefix.as_str())
            );
            let mut drives = Vec::new();
            for node in self.nodes.list_nodes(NodeFilter::running()).await? {
                // find exits with 1 when the prefix does not exist yet.
                let listing = match self
                    .executor
                    .run(&node.ip, &command, self.executor.default_timeout(), &[1])
                    .await
                {
                    Ok(listing) => listing,
                    Err(err) if err.is_recognized() => continue,
                    Err(err) => {
                        warn!(node = %node.hostname, error = %err, "cannot list local volumes");
                        continue;
                    }
                };
                for line in listing.lines() {
                    let Ok(relative) = Utf8Path::new(line.trim()).strip_prefix(&self.prefix) else {
                        continue;
                    };
                    let Some(mut info) =
                        DriveInfo::unused(BackendKind::Local, relative.as_str(), None)
                    else {
                        continue;
                    };
                    info.in_use = declared.contains(&info.drive_name);
                    info.node = Some(node.hostname.clone());
                    drives.push(info);
                }
            }
            Ok(drives)
        })
    }

    fn to_wire<'a>(
        &'a self,
        _ctx: &'a BackendContext,
        target: &'a VolumeTarget,
    ) -> BackendFuture<'a, VolumeSpec, BackendError> {
        Box::pin(async move {
            let path = self.path_of(&target.drive_name)?;
            Ok(VolumeSpec::local(
                &target.name,
                LocalStorageVolumeSource {
                    path: path.into_string(),
                    size: target.size_gb,
                },
            ))
        })
    }

    fn from_wire(&self, spec: &VolumeSpec) -> Result<WireVolume, BackendError> {
        let source = spec
            .local_storage
            .as_ref()
            .ok_or_else(|| BackendError::InvalidWire {
                backend: BackendKind::Local,
                message: String::from("missing localStorage section"),
            })?;
        let drive_name = Utf8Path::new(&source.path)
            .strip_prefix(&self.prefix)
            .map_err(|_| BackendError::InvalidWire {
                backend: BackendKind::Local,
                message: format!("path {} is outside {}", source.path, self.prefix),
            })?;
        Ok(WireVolume {
            size: Some(source.size),
            drive_name: drive_name.as_str().to_owned(),
        })
    }
}
