//! Orchestrator volume-spec format.
//!
//! These shapes are embedded in a workload's declared volumes and consumed by
//! the node agents, so key names and nesting must stay exactly as the
//! orchestrator expects them.

use serde::{Deserialize, Serialize};

/// A named volume in a workload definition.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    /// Volume name as referenced by container mounts.
    pub name: String,
    /// Clustered block store source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rbd: Option<RbdVolumeSource>,
    /// Cloud block volume source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_elastic_block_store: Option<EbsVolumeSource>,
    /// Node-local directory source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_storage: Option<LocalStorageVolumeSource>,
}

impl VolumeSpec {
    /// Spec backed by an rbd image.
    #[must_use]
    pub fn rbd(name: impl Into<String>, source: RbdVolumeSource) -> Self {
        Self {
            name: name.into(),
            rbd: Some(source),
            ..Self::default()
        }
    }

    /// Spec backed by a cloud block volume.
    #[must_use]
    pub fn ebs(name: impl Into<String>, source: EbsVolumeSource) -> Self {
        Self {
            name: name.into(),
            aws_elastic_block_store: Some(source),
            ..Self::default()
        }
    }

    /// Spec backed by a node-local directory.
    #[must_use]
    pub fn local(name: impl Into<String>, source: LocalStorageVolumeSource) -> Self {
        Self {
            name: name.into(),
            local_storage: Some(source),
            ..Self::default()
        }
    }
}

/// rbd image connection details.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RbdVolumeSource {
    /// Image name, i.e. the drive name.
    pub image: String,
    /// Pool holding the image.
    pub pool: String,
    /// Cluster user.
    pub user: String,
    /// Keyring path on the node.
    pub keyring: String,
    /// Filesystem created on the image.
    pub fs_type: String,
    /// Monitor endpoints.
    pub monitors: Vec<String>,
    /// Size in GB.
    pub size: u64,
}

/// Cloud block volume reference.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EbsVolumeSource {
    /// Provider reference: `aws://<availability-zone>/`. The node agent
    /// resolves the volume through the drive name tag.
    #[serde(rename = "volumeID")]
    pub volume_id: String,
    /// Filesystem created on the volume.
    pub fs_type: String,
    /// Drive name the volume is tagged with.
    pub drive: String,
    /// Size in GB.
    pub size: u64,
}

/// Node-local directory.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LocalStorageVolumeSource {
    /// Absolute path of the directory on the node.
    pub path: String,
    /// Size in GB.
    pub size: u64,
}

/// Size and drive name recovered from a [`VolumeSpec`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WireVolume {
    /// Size in GB, when the spec carries one.
    pub size: Option<u64>,
    /// Drive name.
    pub drive_name: String,
}
