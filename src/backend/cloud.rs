//! Cloud block-storage backend (EBS-style volumes).
//!
//! Volumes are found through their `Name` tag, which carries the drive name.
//! Formatting attaches the volume to the instance behind a node, waits for the
//! kernel to see the device, creates the filesystem when absent, and detaches
//! again on every exit path.

use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use super::{
    BackendContext, BackendError, BackendFuture, BackendKind, CreateOutcome, DEFAULT_FILESYSTEM,
    DeleteOutcome, DriveInfo, FormatOutcome, PollSettings, StorageBackend, VolumeSpec, VolumeTarget,
    WireVolume, make_fs_if_missing, wire::EbsVolumeSource,
};
use crate::drive_name::DriveName;
use crate::executor::{CommandRunner, RemoteExecutor, quote};
use crate::nodes::{Node, NodeDirectory, NodeFilter};

/// Provider state of a volume attached to an instance.
pub const STATE_IN_USE: &str = "in-use";

/// Letter used when a node has no `xvd*` device yet.
const FIRST_DEVICE_LETTER: char = 'f';

/// A provider block volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CloudVolume {
    /// Provider volume id.
    pub id: String,
    /// Drive name from the `Name` tag.
    pub drive_name: String,
    /// Size in GB.
    pub size_gb: u64,
    /// Provider state, e.g. `available` or `in-use`.
    pub state: String,
    /// Instance and device the volume is attached to.
    pub attachment: Option<CloudAttachment>,
}

/// Where a provider volume is attached.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CloudAttachment {
    /// Instance holding the volume.
    pub instance_id: String,
    /// Device name on the instance.
    pub device: String,
}

impl CloudVolume {
    /// Returns `true` when the volume is attached to an instance.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.state == STATE_IN_USE
    }
}

/// Provider operations used by the cloud backend.
pub trait BlockStorageApi: Send + Sync {
    /// Finds the volume tagged with `drive_name`.
    fn find_volume<'a>(
        &'a self,
        drive_name: &'a str,
    ) -> BackendFuture<'a, Option<CloudVolume>, BackendError>;

    /// Creates a tagged volume and waits until it is available.
    fn create_volume<'a>(
        &'a self,
        drive_name: &'a str,
        size_gb: u64,
    ) -> BackendFuture<'a, CloudVolume, BackendError>;

    /// Attaches a volume to an instance as `device`.
    fn attach_volume<'a>(
        &'a self,
        volume_id: &'a str,
        instance_id: &'a str,
        device: &'a str,
    ) -> BackendFuture<'a, (), BackendError>;

    /// Detaches a volume from an instance.
    fn detach_volume<'a>(
        &'a self,
        volume_id: &'a str,
        instance_id: &'a str,
    ) -> BackendFuture<'a, (), BackendError>;

    /// Deletes a volume.
    fn delete_volume<'a>(&'a self, volume_id: &'a str) -> BackendFuture<'a, (), BackendError>;

    /// Lists every volume carrying a `Name` tag.
    fn list_volumes(&self) -> BackendFuture<'_, Vec<CloudVolume>, BackendError>;

    /// Finds the instance whose private address is `ip`.
    fn instance_for_ip<'a>(
        &'a self,
        ip: &'a str,
    ) -> BackendFuture<'a, Option<String>, BackendError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeVolumes {
    #[serde(default)]
    volumes: Vec<AwsVolume>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsVolume {
    volume_id: String,
    size: u64,
    state: String,
    #[serde(default)]
    tags: Vec<AwsTag>,
    #[serde(default)]
    attachments: Vec<AwsAttachment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsTag {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsAttachment {
    instance_id: String,
    device: String,
}

impl AwsVolume {
    fn into_cloud(self, drive_name: String) -> CloudVolume {
        let attachment = self.attachments.into_iter().next().map(|att| CloudAttachment {
            instance_id: att.instance_id,
            device: att.device,
        });
        CloudVolume {
            id: self.volume_id,
            drive_name,
            size_gb: self.size,
            state: self.state,
            attachment,
        }
    }

    fn name_tag(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.key == "Name")
            .map(|tag| tag.value.as_str())
    }
}

/// [`BlockStorageApi`] backed by the `aws` command-line client.
#[derive(Clone, Debug)]
pub struct AwsCliApi<R: CommandRunner> {
    runner: R,
    aws_bin: String,
    region: String,
    availability_zone: String,
    timeout: Duration,
}

impl<R: CommandRunner> AwsCliApi<R> {
    /// Creates a client for `region`, creating volumes in `availability_zone`.
    pub fn new(
        runner: R,
        aws_bin: impl Into<String>,
        region: impl Into<String>,
        availability_zone: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            aws_bin: aws_bin.into(),
            region: region.into(),
            availability_zone: availability_zone.into(),
            timeout,
        }
    }

    async fn ec2(&self, args: &[&str]) -> Result<String, BackendError> {
        let mut argv: Vec<OsString> = vec![
            OsString::from("--region"),
            OsString::from(&self.region),
            OsString::from("--output"),
            OsString::from("json"),
            OsString::from("ec2"),
        ];
        argv.extend(args.iter().map(OsString::from));
        let output = self
            .runner
            .run(&self.aws_bin, &argv, self.timeout)
            .await
            .map_err(|err| BackendError::Provider {
                message: err.to_string(),
            })?;
        if !output.is_success() {
            return Err(BackendError::Provider {
                message: format!(
                    "aws ec2 {} failed: {}",
                    args.first().copied().unwrap_or_default(),
                    output.stderr.trim()
                ),
            });
        }
        Ok(output.stdout)
    }

    fn parse<T: for<'de> Deserialize<'de>>(raw: &str) -> Result<T, BackendError> {
        serde_json::from_str(raw).map_err(|err| BackendError::Provider {
            message: format!("unexpected aws output: {err}"),
        })
    }
}

impl<R: CommandRunner> BlockStorageApi for AwsCliApi<R> {
    fn find_volume<'a>(
        &'a self,
        drive_name: &'a str,
    ) -> BackendFuture<'a, Option<CloudVolume>, BackendError> {
        Box::pin(async move {
            let filter = format!("Name=tag:Name,Values={drive_name}");
            let raw = self.ec2(&["describe-volumes", "--filters", &filter]).await?;
            let described: DescribeVolumes = Self::parse(&raw)?;
            Ok(described
                .volumes
                .into_iter()
                .next()
                .map(|volume| volume.into_cloud(drive_name.to_owned())))
        })
    }

    fn create_volume<'a>(
        &'a self,
        drive_name: &'a str,
        size_gb: u64,
    ) -> BackendFuture<'a, CloudVolume, BackendError> {
        Box::pin(async move {
            let size = size_gb.to_string();
            let tags = format!("ResourceType=volume,Tags=[{{Key=Name,Value={drive_name}}}]");
            let raw = self
                .ec2(&[
                    "create-volume",
                    "--availability-zone",
                    &self.availability_zone,
                    "--size",
                    &size,
                    "--tag-specifications",
                    &tags,
                ])
                .await?;
            let created: AwsVolume = Self::parse(&raw)?;
            self.ec2(&["wait", "volume-available", "--volume-ids", &created.volume_id])
                .await?;
            Ok(CloudVolume {
                state: String::from("available"),
                ..created.into_cloud(drive_name.to_owned())
            })
        })
    }

    fn attach_volume<'a>(
        &'a self,
        volume_id: &'a str,
        instance_id: &'a str,
        device: &'a str,
    ) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move {
            self.ec2(&[
                "attach-volume",
                "--volume-id",
                volume_id,
                "--instance-id",
                instance_id,
                "--device",
                device,
            ])
            .await
            .map(drop)
        })
    }

    fn detach_volume<'a>(
        &'a self,
        volume_id: &'a str,
        instance_id: &'a str,
    ) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move {
            self.ec2(&[
                "detach-volume",
                "--volume-id",
                volume_id,
                "--instance-id",
                instance_id,
            ])
            .await
            .map(drop)
        })
    }

    fn delete_volume<'a>(&'a self, volume_id: &'a str) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move {
            self.ec2(&["delete-volume", "--volume-id", volume_id])
                .await
                .map(drop)
        })
    }

    fn list_volumes(&self) -> BackendFuture<'_, Vec<CloudVolume>, BackendError> {
        Box::pin(async move {
            let raw = self
                .ec2(&["describe-volumes", "--filters", "Name=tag-key,Values=Name"])
                .await?;
            let described: DescribeVolumes = Self::parse(&raw)?;
            Ok(described
                .volumes
                .into_iter()
                .filter_map(|volume| {
                    let drive_name = volume.name_tag()?.to_owned();
                    Some(volume.into_cloud(drive_name))
                })
                .collect())
        })
    }

    fn instance_for_ip<'a>(
        &'a self,
        ip: &'a str,
    ) -> BackendFuture<'a, Option<String>, BackendError> {
        Box::pin(async move {
            let filter = format!("Name=private-ip-address,Values={ip}");
            let raw = self
                .ec2(&[
                    "describe-instances",
                    "--filters",
                    &filter,
                    "--query",
                    "Reservations[].Instances[].InstanceId",
                ])
                .await?;
            let ids: Vec<String> = Self::parse(&raw)?;
            Ok(ids.into_iter().next())
        })
    }
}

/// Settings for the cloud backend.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CloudSettings {
    /// Availability zone advertised in the volume spec.
    pub availability_zone: String,
    /// Filesystem advertised in the volume spec.
    pub filesystem: String,
    /// Device attach/detach polling.
    pub poll: PollSettings,
}

impl CloudSettings {
    /// Settings for `availability_zone` with default polling.
    #[must_use]
    pub fn new(availability_zone: impl Into<String>) -> Self {
        Self {
            availability_zone: availability_zone.into(),
            filesystem: String::from(DEFAULT_FILESYSTEM),
            poll: PollSettings::default(),
        }
    }
}

/// Backend storing volumes as provider block volumes.
pub struct CloudBackend<R: CommandRunner> {
    executor: RemoteExecutor<R>,
    nodes: Arc<dyn NodeDirectory>,
    api: Arc<dyn BlockStorageApi>,
    settings: CloudSettings,
}

impl<R: CommandRunner> CloudBackend<R> {
    /// Creates a backend.
    pub fn new(
        executor: RemoteExecutor<R>,
        nodes: Arc<dyn NodeDirectory>,
        api: Arc<dyn BlockStorageApi>,
        settings: CloudSettings,
    ) -> Self {
        Self {
            executor,
            nodes,
            api,
            settings,
        }
    }

    async fn node(&self, ctx: &BackendContext) -> Result<Node, BackendError> {
        ctx.node_or_init(|| async {
            self.nodes
                .list_nodes(NodeFilter::running())
                .await?
                .into_iter()
                .next()
                .ok_or(BackendError::NoNodes {
                    backend: BackendKind::Cloud,
                })
        })
        .await
        .cloned()
    }

    async fn volume(&self, drive_name: &str) -> Result<CloudVolume, BackendError> {
        self.api
            .find_volume(drive_name)
            .await?
            .ok_or_else(|| BackendError::NotFound {
                drive_name: drive_name.to_owned(),
            })
    }

    async fn next_device(&self, host: &str) -> Result<String, BackendError> {
        let listing = self
            .executor
            .run(host, "ls -1 /dev", self.executor.default_timeout(), &[])
            .await?;
        let letter = next_device_letter(&listing).ok_or_else(|| BackendError::NoFreeDevice {
            node: host.to_owned(),
        })?;
        Ok(format!("/dev/xvd{letter}"))
    }

    async fn wait_for_device(
        &self,
        host: &str,
        device: &str,
        attached: bool,
    ) -> Result<(), BackendError> {
        let name = device.trim_start_matches("/dev/");
        let command = format!("grep -qw {} /proc/partitions", quote(name));
        let deadline = Instant::now() + self.settings.poll.timeout;
        loop {
            let present = match self
                .executor
                .run(host, &command, self.executor.default_timeout(), &[1])
                .await
            {
                Ok(_) => true,
                Err(err) if err.is_recognized() => false,
                Err(err) => return Err(err.into()),
            };
            if present == attached {
                debug!(host, device, attached, "device reached expected state");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BackendError::DeviceTimeout {
                    device: device.to_owned(),
                    state: String::from(if attached { "attached" } else { "detached" }),
                });
            }
            sleep(self.settings.poll.interval).await;
        }
    }

    async fn format_attached(
        &self,
        host: &str,
        device: &str,
        filesystem: &str,
    ) -> Result<FormatOutcome, BackendError> {
        self.wait_for_device(host, device, true).await?;
        make_fs_if_missing(&self.executor, host, device, filesystem).await
    }

    async fn detach(
        &self,
        host: &str,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<(), BackendError> {
        self.api.detach_volume(volume_id, instance_id).await?;
        self.wait_for_device(host, device, false).await
    }
}

impl<R: CommandRunner> StorageBackend for CloudBackend<R> {
    fn kind(&self) -> BackendKind {
        BackendKind::Cloud
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
        _ctx: &'a BackendContext,
        target: &'a VolumeTarget,
    ) -> BackendFuture<'a, bool, BackendError> {
        Box::pin(async move {
            Ok(self.api.find_volume(&target.drive_name).await?.is_some())
        })
    }

    fn create<'a>(
        &'a self,
        _ctx: &'a BackendContext,
        target: &'a VolumeTarget,
    ) -> BackendFuture<'a, CreateOutcome, BackendError> {
        Box::pin(async move {
            if self.api.find_volume(&target.drive_name).await?.is_some() {
                return Ok(CreateOutcome::AlreadyExists);
            }
            let volume = self
                .api
                .create_volume(&target.drive_name, target.size_gb)
                .await?;
            info!(drive_name = %target.drive_name, volume_id = %volume.id, "created cloud volume");
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
            let volume = self.volume(&target.drive_name).await?;
            if volume.is_attached() {
                return Err(BackendError::AlreadyAttached {
                    drive_name: target.drive_name.clone(),
                });
            }
            let node = self.node(ctx).await?;
            let instance_id = self
                .api
                .instance_for_ip(&node.ip)
                .await?
                .ok_or_else(|| BackendError::Provider {
                    message: format!("instance not found for node {}", node.hostname),
                })?;
            let device = self.next_device(&node.ip).await?;
            self.api
                .attach_volume(&volume.id, &instance_id, &device)
                .await?;

            let formatted = self.format_attached(&node.ip, &device, filesystem).await;
            let detached = self.detach(&node.ip, &volume.id, &instance_id, &device).await;
            match (formatted, detached) {
                (Ok(outcome), Ok(())) => Ok(outcome),
                (Ok(_), Err(err)) => Err(err),
                (Err(err), detached) => {
                    if let Err(detach_err) = detached {
                        warn!(device, error = %detach_err, "failed to detach after format error");
                    }
                    Err(err)
                }
            }
        })
    }

    fn delete<'a>(
        &'a self,
        _ctx: &'a BackendContext,
        target: &'a VolumeTarget,
    ) -> BackendFuture<'a, DeleteOutcome, BackendError> {
        Box::pin(async move {
            let Some(volume) = self.api.find_volume(&target.drive_name).await? else {
                return Ok(DeleteOutcome::Missing);
            };
            if volume.is_attached() {
                return Ok(DeleteOutcome::InUse);
            }
            self.api.delete_volume(&volume.id).await?;
            info!(drive_name = %target.drive_name, volume_id = %volume.id, "deleted cloud volume");
            Ok(DeleteOutcome::Deleted)
        })
    }

    fn list_drives<'a>(
        &'a self,
        _ctx: &'a BackendContext,
        namespace: Option<&'a str>,
    ) -> BackendFuture<'a, Vec<DriveInfo>, BackendError> {
        Box::pin(async move {
            let wanted = namespace.filter(|ns| !ns.is_empty());
            Ok(self
                .api
                .list_volumes()
                .await?
                .into_iter()
                .filter(|volume| {
                    DriveName::parse(BackendKind::Cloud, &volume.drive_name)
                        .is_ok_and(|drive| drive.namespace.as_deref() == wanted)
                })
                .filter_map(|volume| {
                    let mut info = DriveInfo::unused(
                        BackendKind::Cloud,
                        &volume.drive_name,
                        Some(volume.size_gb),
                    )?;
                    if volume.is_attached() {
                        info.in_use = true;
                        if let Some(attachment) = volume.attachment {
                            info = info.used_on(attachment.instance_id, Some(attachment.device));
                        }
                    }
                    Some(info)
                })
                .collect())
        })
    }

    fn to_wire<'a>(
        &'a self,
        _ctx: &'a BackendContext,
        target: &'a VolumeTarget,
    ) -> BackendFuture<'a, VolumeSpec, BackendError> {
        Box::pin(async move {
            Ok(VolumeSpec::ebs(
                &target.name,
                EbsVolumeSource {
                    volume_id: format!("aws://{}/", self.settings.availability_zone),
                    fs_type: self.settings.filesystem.clone(),
                    drive: target.drive_name.clone(),
                    size: target.size_gb,
                },
            ))
        })
    }

    fn from_wire(&self, spec: &VolumeSpec) -> Result<WireVolume, BackendError> {
        let source = spec
            .aws_elastic_block_store
            .as_ref()
            .ok_or_else(|| BackendError::InvalidWire {
                backend: BackendKind::Cloud,
                message: String::from("missing awsElasticBlockStore section"),
            })?;
        if source.drive.is_empty() {
            return Err(BackendError::InvalidWire {
                backend: BackendKind::Cloud,
                message: String::from("empty drive"),
            });
        }
        Ok(WireVolume {
            size: Some(source.size),
            drive_name: source.drive.clone(),
        })
    }
}

/// Picks the letter after the highest `xvd?` device in a `/dev` listing.
///
/// Returns `None` once `z` is taken.
#[must_use]
pub fn next_device_letter(listing: &str) -> Option<char> {
    let last = listing
        .lines()
        .filter_map(|line| line.trim().trim_start_matches("/dev/").strip_prefix("xvd"))
        .filter_map(|rest| rest.chars().next())
        .filter(char::is_ascii_lowercase)
        .max();
    match last {
        None => Some(FIRST_DEVICE_LETTER),
        Some('z') => None,
        Some(letter) => char::from_u32(u32::from(letter) + 1),
    }
}
