//! Clustered block store backend (Ceph rbd images).
//!
//! All rbd commands run on one Ceph-enabled node; the cluster view is the
//! same from every node. A namespace prefix in the drive name is the pool the
//! image lives in; unprefixed drive names use the configured default pool.
//! The volume spec carries the pool and the image name inside it separately.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{
    BackendContext, BackendError, BackendFuture, BackendKind, CreateOutcome, DEFAULT_FILESYSTEM,
    DeleteOutcome, DriveInfo, FormatOutcome, StorageBackend, VolumeSpec, VolumeTarget, WireVolume,
    make_fs_if_missing, wire::RbdVolumeSource,
};
use crate::drive_name::NAMESPACE_SEPARATOR;
use crate::executor::{CommandRunner, RemoteExecutor, quote};
use crate::nodes::{Node, NodeDirectory, NodeFilter};

/// Exit code of `rbd info` for a missing image.
const RBD_NOT_FOUND: i32 = 2;

/// Exit code of rbd commands racing a busy device or image.
const RBD_BUSY: i32 = 16;

/// Monitor used when the cluster configuration names none.
const FALLBACK_MONITOR: &str = "127.0.0.1";

/// Minimum placement-group count for a new pool.
const MIN_PLACEMENT_GROUPS: u64 = 8;

/// Placement groups per OSD before replication.
const PLACEMENT_GROUPS_PER_OSD: u64 = 100;

/// Connection and tuning settings for the clustered backend.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClusteredSettings {
    /// Pool for drive names without a namespace prefix.
    pub pool: String,
    /// Cluster user passed to node agents.
    pub user: String,
    /// Keyring path on the nodes.
    pub keyring: String,
    /// Monitor endpoints; empty means "read them from the node".
    pub monitors: Vec<String>,
    /// Replica count used to size new pools.
    pub replicas: u64,
    /// Filesystem advertised in the volume spec.
    pub filesystem: String,
    /// Pause before retrying an unmap that reported the device busy.
    pub unmap_settle: Duration,
    /// Total unmap attempts.
    pub unmap_attempts: u32,
}

impl Default for ClusteredSettings {
    fn default() -> Self {
        Self {
            pool: String::from("rbd"),
            user: String::from("admin"),
            keyring: String::from("/etc/ceph/ceph.client.admin.keyring"),
            monitors: Vec::new(),
            replicas: 3,
            filesystem: String::from(DEFAULT_FILESYSTEM),
            unmap_settle: Duration::from_secs(5),
            unmap_attempts: 3,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RbdStatus {
    #[serde(default)]
    watchers: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RbdImage {
    image: String,
    size: u64,
    #[serde(default)]
    snapshot: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MappedImage {
    pool: String,
    name: String,
    device: String,
}

/// `rbd showmapped` prints an object keyed by device id on older releases and
/// a list on newer ones.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ShowMapped {
    Keyed(BTreeMap<String, MappedImage>),
    Listed(Vec<MappedImage>),
}

impl ShowMapped {
    fn into_images(self) -> Vec<MappedImage> {
        match self {
            Self::Keyed(map) => map.into_values().collect(),
            Self::Listed(list) => list,
        }
    }
}

const BYTES_PER_GB: u64 = 1 << 30;

/// Backend storing volumes as rbd images.
pub struct ClusteredBackend<R: CommandRunner> {
    executor: RemoteExecutor<R>,
    nodes: Arc<dyn NodeDirectory>,
    settings: ClusteredSettings,
}

impl<R: CommandRunner> ClusteredBackend<R> {
    /// Creates a backend running commands through `executor`.
    pub fn new(
        executor: RemoteExecutor<R>,
        nodes: Arc<dyn NodeDirectory>,
        settings: ClusteredSettings,
    ) -> Self {
        Self {
            executor,
            nodes,
            settings,
        }
    }

    fn pool_of<'a>(&'a self, drive_name: &'a str) -> &'a str {
        drive_name
            .split_once(NAMESPACE_SEPARATOR)
            .map_or(self.settings.pool.as_str(), |(pool, _)| pool)
    }

    /// Image name inside its pool.
    fn image_of(drive_name: &str) -> &str {
        drive_name
            .split_once(NAMESPACE_SEPARATOR)
            .map_or(drive_name, |(_, image)| image)
    }

    /// Drive name of `image` in `pool`; images of the default pool carry no
    /// prefix.
    fn drive_name_in(&self, pool: &str, image: &str) -> String {
        if pool == self.settings.pool {
            image.to_owned()
        } else {
            format!("{pool}{NAMESPACE_SEPARATOR}{image}")
        }
    }

    /// Images of `pool` mapped on any Ceph node, keyed by image name.
    ///
    /// Nodes that cannot be queried are logged and skipped.
    async fn mapped_images(
        &self,
        pool: &str,
    ) -> Result<HashMap<String, (String, String)>, BackendError> {
        let mut mapped = HashMap::new();
        for node in self.nodes.list_nodes(NodeFilter::clustered()).await? {
            let listed: Result<ShowMapped, _> = self
                .executor
                .run_json(
                    &node.ip,
                    "rbd showmapped --format json",
                    self.executor.default_timeout(),
                    &[],
                )
                .await;
            let images = match listed {
                Ok(listed) => listed.into_images(),
                Err(err) => {
                    warn!(node = %node.hostname, error = %err, "cannot list mapped images");
                    continue;
                }
            };
            for image in images.into_iter().filter(|image| image.pool == pool) {
                mapped
                    .entry(image.name)
                    .or_insert_with(|| (node.hostname.clone(), image.device));
            }
        }
        Ok(mapped)
    }

    async fn node(&self, ctx: &BackendContext) -> Result<Node, BackendError> {
        ctx.node_or_init(|| async {
            self.nodes
                .list_nodes(NodeFilter::clustered())
                .await?
                .into_iter()
                .next()
                .ok_or(BackendError::NoNodes {
                    backend: BackendKind::Clustered,
                })
        })
        .await
        .cloned()
    }

    async fn pool_exists(
        &self,
        ctx: &BackendContext,
        host: &str,
        pool: &str,
    ) -> Result<bool, BackendError> {
        if ctx.pool_verified(pool) {
            return Ok(true);
        }
        let pools: Vec<String> = self
            .executor
            .run_json(
                host,
                "ceph osd pool ls --format json",
                self.executor.default_timeout(),
                &[],
            )
            .await?;
        let exists = pools.iter().any(|name| name == pool);
        if exists {
            ctx.mark_pool_verified(pool);
        }
        Ok(exists)
    }

    async fn ensure_pool(
        &self,
        ctx: &BackendContext,
        host: &str,
        pool: &str,
    ) -> Result<(), BackendError> {
        if self.pool_exists(ctx, host, pool).await? {
            return Ok(());
        }
        let osds: Vec<serde_json::Value> = self
            .executor
            .run_json(
                host,
                "ceph osd ls --format json",
                self.executor.default_timeout(),
                &[],
            )
            .await?;
        let osd_count = u64::try_from(osds.len()).unwrap_or(u64::MAX);
        let pg = placement_groups(osd_count, self.settings.replicas);
        let pool_arg = quote(pool);
        self.executor
            .run_default(host, &format!("ceph osd pool create {pool_arg} {pg} {pg}"))
            .await?;
        self.executor
            .run_default(
                host,
                &format!("ceph osd pool application enable {pool_arg} rbd"),
            )
            .await?;
        info!(pool, placement_groups = pg, osds = osd_count, "created pool");
        ctx.mark_pool_verified(pool);
        Ok(())
    }

    async fn image_exists(&self, host: &str, drive_name: &str) -> Result<bool, BackendError> {
        let command = format!("rbd info {}", quote(drive_name));
        match self
            .executor
            .run(host, &command, self.executor.default_timeout(), &[RBD_NOT_FOUND])
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.is_recognized() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn has_watchers(&self, host: &str, drive_name: &str) -> Result<bool, BackendError> {
        let command = format!("rbd status {} --format json", quote(drive_name));
        let status: RbdStatus = self
            .executor
            .run_json(host, &command, self.executor.default_timeout(), &[])
            .await?;
        Ok(!status.watchers.is_empty())
    }

    async fn unmap(&self, host: &str, device: &str) -> Result<(), BackendError> {
        let command = format!("rbd unmap {}", quote(device));
        let attempts = self.settings.unmap_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self
                .executor
                .run(host, &command, self.executor.default_timeout(), &[RBD_BUSY])
                .await
            {
                Ok(_) => return Ok(()),
                Err(err) if err.is_recognized() && attempt < attempts => {
                    debug!(host, device, attempt, "device busy, retrying unmap");
                    attempt += 1;
                    sleep(self.settings.unmap_settle).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn monitors(
        &self,
        ctx: &BackendContext,
        host: &str,
    ) -> Result<Vec<String>, BackendError> {
        ctx.monitors_or_init(|| async {
            if !self.settings.monitors.is_empty() {
                return Ok(self.settings.monitors.clone());
            }
            let conf = self
                .executor
                .run_default(host, "cat /etc/ceph/ceph.conf")
                .await?;
            Ok(parse_mon_host(&conf)
                .unwrap_or_else(|| vec![String::from(FALLBACK_MONITOR)]))
        })
        .await
        .map(<[String]>::to_vec)
    }

    async fn format_mapped(
        &self,
        host: &str,
        drive_name: &str,
        filesystem: &str,
    ) -> Result<FormatOutcome, BackendError> {
        let command = format!("rbd map {}", quote(drive_name));
        let mapped = self.executor.run_default(host, &command).await?;
        let device = mapped.trim();
        debug!(host, drive_name, device, "mapped image");

        let formatted = make_fs_if_missing(&self.executor, host, device, filesystem).await;
        let unmapped = self.unmap(host, device).await;
        match (formatted, unmapped) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), unmapped) => {
                if let Err(unmap_err) = unmapped {
                    warn!(host, device, error = %unmap_err, "failed to unmap after format error");
                }
                Err(err)
            }
        }
    }
}

impl<R: CommandRunner> StorageBackend for ClusteredBackend<R> {
    fn kind(&self) -> BackendKind {
        BackendKind::Clustered
    }

    fn select_node<'a>(
        &'a self,
        ctx: &'a BackendContext,
        _target: &'a VolumeTarget,
    ) -> BackendFuture<'a, Node, BackendError> {
        Box::pin(self.node(ctx))
    }

    fn exists<'a>(
        &'a self,
        ctx: &'a BackendContext,
        target: &'a VolumeTarget,
    ) -> BackendFuture<'a, bool, BackendError> {
        Box::pin(async move {
            let node = self.node(ctx).await?;
            let pool = self.pool_of(&target.drive_name);
            if !self.pool_exists(ctx, &node.ip, pool).await? {
                return Ok(false);
            }
            self.image_exists(&node.ip, &target.drive_name).await
        })
    }

    fn create<'a>(
        &'a self,
        ctx: &'a BackendContext,
        target: &'a VolumeTarget,
    ) -> BackendFuture<'a, CreateOutcome, BackendError> {
        Box::pin(async move {
            let node = self.node(ctx).await?;
            let drive_name = target.drive_name.as_str();
            self.ensure_pool(ctx, &node.ip, self.pool_of(drive_name))
                .await?;
            if self.image_exists(&node.ip, drive_name).await? {
                return Ok(CreateOutcome::AlreadyExists);
            }
            let size_mb = target.size_gb.saturating_mul(1024);
            let command = format!("rbd create {} --size={size_mb}", quote(drive_name));
            if let Err(err) = self.executor.run_default(&node.ip, &command).await {
                if self.image_exists(&node.ip, drive_name).await? {
                    return Ok(CreateOutcome::AlreadyExists);
                }
                return Err(err.into());
            }
            info!(drive_name, size_gb = target.size_gb, "created rbd image");
            Ok(CreateOutcome::Created)
        })
    }

    fn format<'a>(
        &'a self,
        ctx: &'a BackendContext,
        target: &'a VolumeTarget,
        filesystem: &'a str,
    ) -> BackendFuture<'a, FormatOutcome, BackendError> {
        Box::pin(async move {
            let node = self.node(ctx).await?;
            let drive_name = target.drive_name.as_str();
            if self.has_watchers(&node.ip, drive_name).await? {
                info!(drive_name, "image is mapped elsewhere, skipping format");
                return Ok(FormatOutcome::InUse);
            }
            self.format_mapped(&node.ip, drive_name, filesystem).await
        })
    }

    fn delete<'a>(
        &'a self,
        ctx: &'a BackendContext,
        target: &'a VolumeTarget,
    ) -> BackendFuture<'a, DeleteOutcome, BackendError> {
        Box::pin(async move {
            let node = self.node(ctx).await?;
            let drive_name = target.drive_name.as_str();
            if !self.pool_exists(ctx, &node.ip, self.pool_of(drive_name)).await?
                || !self.image_exists(&node.ip, drive_name).await?
            {
                return Ok(DeleteOutcome::Missing);
            }
            if self.has_watchers(&node.ip, drive_name).await? {
                return Ok(DeleteOutcome::InUse);
            }
            let command = format!("rbd rm {}", quote(drive_name));
            match self
                .executor
                .run(&node.ip, &command, self.executor.default_timeout(), &[RBD_BUSY])
                .await
            {
                Ok(_) => {
                    info!(drive_name, "removed rbd image");
                    Ok(DeleteOutcome::Deleted)
                }
                Err(err) if err.is_recognized() => Ok(DeleteOutcome::InUse),
                Err(err) => Err(err.into()),
            }
        })
    }

    fn list_drives<'a>(
        &'a self,
        ctx: &'a BackendContext,
        namespace: Option<&'a str>,
    ) -> BackendFuture<'a, Vec<DriveInfo>, BackendError> {
        Box::pin(async move {
            let node = self.node(ctx).await?;
            let pool = namespace
                .filter(|ns| !ns.is_empty())
                .unwrap_or(self.settings.pool.as_str());
            if !self.pool_exists(ctx, &node.ip, pool).await? {
                return Ok(Vec::new());
            }
            let command = format!("rbd list --long --format json --pool {}", quote(pool));
            let images: Vec<RbdImage> = self
                .executor
                .run_json(&node.ip, &command, self.executor.default_timeout(), &[])
                .await?;
            let mut mapped = self.mapped_images(pool).await?;
            Ok(images
                .into_iter()
                .filter(|image| image.snapshot.is_none())
                .filter_map(|image| {
                    let drive_name = self.drive_name_in(pool, &image.image);
                    let mut info = DriveInfo::unused(
                        BackendKind::Clustered,
                        &drive_name,
                        Some(image.size.div_euclid(BYTES_PER_GB)),
                    )?;
                    if let Some((host, device)) = mapped.remove(&image.image) {
                        info = info.used_on(host, Some(device));
                    }
                    Some(info)
                })
                .collect())
        })
    }

    fn to_wire<'a>(
        &'a self,
        ctx: &'a BackendContext,
        target: &'a VolumeTarget,
    ) -> BackendFuture<'a, VolumeSpec, BackendError> {
        Box::pin(async move {
            let node = self.node(ctx).await?;
            let monitors = self.monitors(ctx, &node.ip).await?;
            Ok(VolumeSpec::rbd(
                &target.name,
                RbdVolumeSource {
                    image: Self::image_of(&target.drive_name).to_owned(),
                    pool: self.pool_of(&target.drive_name).to_owned(),
                    user: self.settings.user.clone(),
                    keyring: self.settings.keyring.clone(),
                    fs_type: self.settings.filesystem.clone(),
                    monitors,
                    size: target.size_gb,
                },
            ))
        })
    }

    fn from_wire(&self, spec: &VolumeSpec) -> Result<WireVolume, BackendError> {
        let source = spec.rbd.as_ref().ok_or_else(|| BackendError::InvalidWire {
            backend: BackendKind::Clustered,
            message: String::from("missing rbd section"),
        })?;
        if source.image.is_empty() || source.pool.is_empty() {
            return Err(BackendError::InvalidWire {
                backend: BackendKind::Clustered,
                message: String::from("empty rbd image or pool"),
            });
        }
        Ok(WireVolume {
            size: Some(source.size),
            drive_name: self.drive_name_in(&source.pool, &source.image),
        })
    }
}

/// Placement-group count for a new pool: `osds * 100 / replicas`, rounded up
/// to a power of two, never below 8.
#[must_use]
pub fn placement_groups(osds: u64, replicas: u64) -> u64 {
    osds.saturating_mul(PLACEMENT_GROUPS_PER_OSD)
        .div_ceil(replicas.max(1))
        .checked_next_power_of_two()
        .unwrap_or(u64::MAX)
        .max(MIN_PLACEMENT_GROUPS)
}

/// Extracts `mon_host` (or `mon host`) from the `[global]` section of a
/// cluster configuration file.
#[must_use]
pub fn parse_mon_host(conf: &str) -> Option<Vec<String>> {
    let mut in_global = false;
    for raw in conf.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            in_global = section.trim() == "global";
            continue;
        }
        if !in_global {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if key.trim().replace(' ', "_") != "mon_host" {
            continue;
        }
        let monitors: Vec<String> = value
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_owned)
            .collect();
        return (!monitors.is_empty()).then_some(monitors);
    }
    None
}
