//! Configuration loading via `ortho-config`.

use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::backend::{
    AwsCliApi, BackendKind, CloudBackend, CloudSettings, ClusteredBackend, ClusteredSettings,
    DEFAULT_FILESYSTEM, DEFAULT_LOCAL_STORAGE_PREFIX, LocalBackend, StorageBackend, VolumeUsage,
};
use crate::coordinator::{CoordinatorSettings, DEFAULT_VOLUME_LOCK_TTL};
use crate::executor::{
    NODE_COMMAND_TIMEOUT, ProcessCommandRunner, RemoteExecutor, SshOptions, Transport,
};
use crate::lock::{LockManager, RedisLockStore, RetryPolicy};
use crate::nodes::NodeDirectory;

/// Settings of the storage engine, merged from defaults, `pstorage.toml`,
/// `PSTORAGE_*` environment variables and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "PSTORAGE",
    discovery(
        app_name = "pstorage",
        env_var = "PSTORAGE_CONFIG_PATH",
        config_file_name = "pstorage.toml",
        dotfile_name = ".pstorage.toml",
        project_file_name = "pstorage.toml"
    )
)]
pub struct PstorageConfig {
    /// Storage backend: `clustered`, `cloud` or `local`.
    #[ortho_config(default = "local".to_owned())]
    pub backend: String,
    /// Redis URL of the shared lock store. Locks stay in-process when unset.
    pub redis_url: Option<String>,
    /// Namespace prefixed to network drive names.
    pub namespace: Option<String>,
    /// Filesystem created on block volumes.
    #[ortho_config(default = DEFAULT_FILESYSTEM.to_owned())]
    pub filesystem: String,
    /// Remote user for node commands.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// SSH port of the nodes.
    #[ortho_config(default = 22)]
    pub ssh_port: u16,
    /// Private key used to reach the nodes.
    pub ssh_identity_file: Option<String>,
    /// Default node command timeout in seconds.
    #[ortho_config(default = 60)]
    pub command_timeout_secs: u64,
    /// Lifetime of per-volume locks in seconds.
    #[ortho_config(default = 1800)]
    pub lock_ttl_secs: u64,
    /// Attempts made by `format` while the volume is busy.
    #[ortho_config(default = 5)]
    pub format_lock_attempts: u32,
    /// Period of the deletion reaper in seconds.
    #[ortho_config(default = 60)]
    pub reap_interval_secs: u64,
    /// Root directory of local volumes on the nodes.
    #[ortho_config(default = DEFAULT_LOCAL_STORAGE_PREFIX.to_owned())]
    pub local_storage_prefix: String,
    /// Default pool of the clustered backend.
    #[ortho_config(default = "rbd".to_owned())]
    pub ceph_pool: String,
    /// Cluster user of the clustered backend.
    #[ortho_config(default = "admin".to_owned())]
    pub ceph_user: String,
    /// Keyring path on the nodes.
    #[ortho_config(default = "/etc/ceph/ceph.client.admin.keyring".to_owned())]
    pub ceph_keyring: String,
    /// Comma-separated monitor endpoints; discovered on the node when unset.
    pub ceph_monitors: Option<String>,
    /// Region of the cloud backend.
    pub aws_region: Option<String>,
    /// Availability zone new cloud volumes are created in.
    pub aws_availability_zone: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to pstorage.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

impl PstorageConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("pstorage")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that provide the offending value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] describing the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let kind = self.backend_kind()?;
        for (value, field) in [
            (
                self.command_timeout_secs,
                FieldMetadata::new(
                    "node command timeout",
                    "PSTORAGE_COMMAND_TIMEOUT_SECS",
                    "command_timeout_secs",
                ),
            ),
            (
                self.lock_ttl_secs,
                FieldMetadata::new("volume lock TTL", "PSTORAGE_LOCK_TTL_SECS", "lock_ttl_secs"),
            ),
            (
                self.reap_interval_secs,
                FieldMetadata::new(
                    "reaper interval",
                    "PSTORAGE_REAP_INTERVAL_SECS",
                    "reap_interval_secs",
                ),
            ),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{} must be positive: set {} or {} in pstorage.toml",
                    field.description, field.env_var, field.toml_key
                )));
            }
        }
        if kind == BackendKind::Cloud {
            require(
                self.aws_region.as_deref(),
                &FieldMetadata::new("cloud region", "PSTORAGE_AWS_REGION", "aws_region"),
            )?;
            require(
                self.aws_availability_zone.as_deref(),
                &FieldMetadata::new(
                    "cloud availability zone",
                    "PSTORAGE_AWS_AVAILABILITY_ZONE",
                    "aws_availability_zone",
                ),
            )?;
        }
        Ok(())
    }

    /// Backend selected by the `backend` field.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unknown backend names.
    pub fn backend_kind(&self) -> Result<BackendKind, ConfigError> {
        self.backend.parse().map_err(|_| {
            ConfigError::Invalid(format!(
                "unknown storage backend {:?}: set PSTORAGE_BACKEND or backend in pstorage.toml \
                 to clustered, cloud or local",
                self.backend
            ))
        })
    }

    /// Default node command timeout.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        if self.command_timeout_secs == 0 {
            NODE_COMMAND_TIMEOUT
        } else {
            Duration::from_secs(self.command_timeout_secs)
        }
    }

    /// Period of the deletion reaper.
    #[must_use]
    pub const fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    /// Transport reaching the nodes over SSH.
    #[must_use]
    pub fn transport(&self) -> Transport {
        Transport::Ssh(SshOptions {
            user: self.ssh_user.clone(),
            port: self.ssh_port,
            identity_file: self.ssh_identity_file.as_deref().map(Utf8PathBuf::from),
            ..SshOptions::default()
        })
    }

    /// Executor running node commands through the configured transport.
    #[must_use]
    pub fn executor(&self) -> RemoteExecutor<ProcessCommandRunner> {
        RemoteExecutor::with_process_runner(self.transport(), self.command_timeout())
    }

    /// Lock manager over Redis when `redis_url` is set, in-process otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the Redis URL is malformed.
    pub fn lock_manager(&self) -> Result<LockManager, ConfigError> {
        match self.redis_url.as_deref() {
            Some(url) => RedisLockStore::open(url)
                .map(|store| LockManager::new(Arc::new(store)))
                .map_err(|err| {
                    ConfigError::Invalid(format!(
                        "{err}: check PSTORAGE_REDIS_URL or redis_url in pstorage.toml"
                    ))
                }),
            None => Ok(LockManager::in_memory()),
        }
    }

    /// Lock manager over the shared Redis store, for commands that must see
    /// the locks other processes hold.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when `redis_url` is unset and
    /// [`ConfigError::Invalid`] when it is malformed.
    pub fn shared_lock_manager(&self) -> Result<LockManager, ConfigError> {
        if self.redis_url.is_none() {
            return Err(FieldMetadata::new("shared lock store", "PSTORAGE_REDIS_URL", "redis_url")
                .missing());
        }
        self.lock_manager()
    }

    /// Coordinator tunables.
    ///
    /// On the clustered backend a namespace naming the default pool is
    /// dropped, since images of that pool carry no pool prefix.
    #[must_use]
    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        let lock_ttl = if self.lock_ttl_secs == 0 {
            DEFAULT_VOLUME_LOCK_TTL
        } else {
            Duration::from_secs(self.lock_ttl_secs)
        };
        CoordinatorSettings {
            lock_ttl,
            format_retry: RetryPolicy {
                attempts: self.format_lock_attempts.max(1),
                ..RetryPolicy::default()
            },
            namespace: self.namespace.clone().filter(|ns| {
                !ns.is_empty()
                    && !(matches!(self.backend_kind(), Ok(BackendKind::Clustered))
                        && *ns == self.ceph_pool)
            }),
            filesystem: self.filesystem.clone(),
        }
    }

    /// Clustered backend settings.
    #[must_use]
    pub fn clustered_settings(&self) -> ClusteredSettings {
        let monitors = self
            .ceph_monitors
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|monitor| !monitor.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        ClusteredSettings {
            pool: self.ceph_pool.clone(),
            user: self.ceph_user.clone(),
            keyring: self.ceph_keyring.clone(),
            monitors,
            filesystem: self.filesystem.clone(),
            ..ClusteredSettings::default()
        }
    }

    /// Builds the configured backend.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the configuration does not validate.
    pub fn build_backend(
        &self,
        nodes: Arc<dyn NodeDirectory>,
        usage: Arc<dyn VolumeUsage>,
    ) -> Result<Arc<dyn StorageBackend>, ConfigError> {
        self.validate()?;
        let backend: Arc<dyn StorageBackend> = match self.backend_kind()? {
            BackendKind::Clustered => Arc::new(ClusteredBackend::new(
                self.executor(),
                nodes,
                self.clustered_settings(),
            )),
            BackendKind::Cloud => {
                let region = self.aws_region.clone().unwrap_or_default();
                let zone = self.aws_availability_zone.clone().unwrap_or_default();
                let api = AwsCliApi::new(
                    ProcessCommandRunner,
                    "aws",
                    region,
                    zone.clone(),
                    self.command_timeout(),
                );
                let settings = CloudSettings {
                    filesystem: self.filesystem.clone(),
                    ..CloudSettings::new(zone)
                };
                Arc::new(CloudBackend::new(
                    self.executor(),
                    nodes,
                    Arc::new(api),
                    settings,
                ))
            }
            BackendKind::Local => Arc::new(LocalBackend::new(
                self.executor(),
                nodes,
                usage,
                self.local_storage_prefix.as_str(),
            )),
        };
        Ok(backend)
    }
}

impl Default for PstorageConfig {
    fn default() -> Self {
        Self {
            backend: String::from("local"),
            redis_url: None,
            namespace: None,
            filesystem: String::from(DEFAULT_FILESYSTEM),
            ssh_user: String::from("root"),
            ssh_port: 22,
            ssh_identity_file: None,
            command_timeout_secs: NODE_COMMAND_TIMEOUT.as_secs(),
            lock_ttl_secs: DEFAULT_VOLUME_LOCK_TTL.as_secs(),
            format_lock_attempts: RetryPolicy::default().attempts,
            reap_interval_secs: 60,
            local_storage_prefix: String::from(DEFAULT_LOCAL_STORAGE_PREFIX),
            ceph_pool: String::from("rbd"),
            ceph_user: String::from("admin"),
            ceph_keyring: String::from("/etc/ceph/ceph.client.admin.keyring"),
            ceph_monitors: None,
            aws_region: None,
            aws_availability_zone: None,
        }
    }
}

fn require(value: Option<&str>, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    match value {
        Some(present) if !present.trim().is_empty() => Ok(()),
        _ => Err(metadata.missing()),
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value is out of range or malformed.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
