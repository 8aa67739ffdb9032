//! Unit tests for configuration validation and derived settings.

use std::sync::Arc;

use pstorage::backend::StaticVolumeUsage;
use pstorage::config::ConfigError;
use pstorage::{BackendKind, PstorageConfig, StaticNodeDirectory};
use rstest::*;

#[fixture]
fn valid_config() -> PstorageConfig {
    PstorageConfig::default()
}

#[rstest]
fn defaults_validate(valid_config: PstorageConfig) {
    assert_eq!(valid_config.validate(), Ok(()));
    assert_eq!(valid_config.backend_kind(), Ok(BackendKind::Local));
}

#[rstest]
#[case("ceph", BackendKind::Clustered)]
#[case("aws", BackendKind::Cloud)]
#[case("localstorage", BackendKind::Local)]
fn backend_aliases_are_accepted(
    valid_config: PstorageConfig,
    #[case] raw: &str,
    #[case] expected: BackendKind,
) {
    let cfg = PstorageConfig {
        backend: String::from(raw),
        ..valid_config
    };
    assert_eq!(cfg.backend_kind(), Ok(expected));
}

#[rstest]
fn unknown_backend_error_is_actionable(valid_config: PstorageConfig) {
    let cfg = PstorageConfig {
        backend: String::from("nfs"),
        ..valid_config
    };

    let message = cfg.validate().expect_err("unknown backend").to_string();
    assert!(message.contains("PSTORAGE_BACKEND"), "{message}");
    assert!(message.contains("pstorage.toml"), "{message}");
}

/// Validation produces errors naming both the environment variable and the
/// TOML key of each required cloud setting.
#[rstest]
#[case(None, Some("eu-west-1a"), "PSTORAGE_AWS_REGION", "aws_region")]
#[case(Some("eu-west-1"), None, "PSTORAGE_AWS_AVAILABILITY_ZONE", "aws_availability_zone")]
#[case(Some(" "), Some("eu-west-1a"), "PSTORAGE_AWS_REGION", "aws_region")]
fn cloud_backend_requires_region_and_zone(
    valid_config: PstorageConfig,
    #[case] region: Option<&str>,
    #[case] zone: Option<&str>,
    #[case] env_var: &str,
    #[case] toml_key: &str,
) {
    let cfg = PstorageConfig {
        backend: String::from("cloud"),
        aws_region: region.map(String::from),
        aws_availability_zone: zone.map(String::from),
        ..valid_config
    };

    let error = cfg.validate().expect_err("cloud settings are required");
    let ConfigError::MissingField(ref message) = error else {
        panic!("expected MissingField error, got {error:?}");
    };
    assert!(message.contains(env_var), "{message}");
    assert!(message.contains(toml_key), "{message}");
    assert!(message.contains("pstorage.toml"), "{message}");
}

#[rstest]
fn zero_durations_are_rejected(valid_config: PstorageConfig) {
    let cfg = PstorageConfig {
        lock_ttl_secs: 0,
        ..valid_config
    };
    let error = cfg.validate().expect_err("zero TTL");
    assert!(matches!(error, ConfigError::Invalid(ref message) if message.contains("PSTORAGE_LOCK_TTL_SECS")));
}

#[rstest]
fn derived_settings_follow_configuration(valid_config: PstorageConfig) {
    let cfg = PstorageConfig {
        namespace: Some(String::new()),
        ceph_monitors: Some(String::from("10.0.0.1:6789, 10.0.0.2:6789,")),
        format_lock_attempts: 0,
        ..valid_config
    };

    let coordinator = cfg.coordinator_settings();
    assert_eq!(coordinator.namespace, None);
    assert_eq!(coordinator.format_retry.attempts, 1);
    assert_eq!(coordinator.lock_ttl.as_secs(), 1800);

    let clustered = cfg.clustered_settings();
    assert_eq!(clustered.monitors, vec!["10.0.0.1:6789", "10.0.0.2:6789"]);
    assert_eq!(clustered.pool, "rbd");
}

#[rstest]
fn malformed_redis_url_is_reported(valid_config: PstorageConfig) {
    let cfg = PstorageConfig {
        redis_url: Some(String::from("not a url")),
        ..valid_config
    };
    assert!(matches!(cfg.lock_manager(), Err(ConfigError::Invalid(_))));
}

#[rstest]
fn lock_commands_need_shared_store(valid_config: PstorageConfig) {
    let Err(err) = valid_config.shared_lock_manager() else {
        panic!("expected a missing field error");
    };
    assert!(matches!(err, ConfigError::MissingField(ref message)
        if message.contains("PSTORAGE_REDIS_URL") && message.contains("redis_url")));

    let cfg = PstorageConfig {
        redis_url: Some(String::from("redis://127.0.0.1:6379")),
        ..PstorageConfig::default()
    };
    assert!(cfg.shared_lock_manager().is_ok());
}

#[rstest]
#[case("clustered", "rbd", None)]
#[case("clustered", "team", Some("team"))]
#[case("local", "rbd", Some("rbd"))]
fn default_pool_namespace_is_dropped_on_clustered(
    valid_config: PstorageConfig,
    #[case] backend: &str,
    #[case] namespace: &str,
    #[case] expected: Option<&str>,
) {
    let cfg = PstorageConfig {
        backend: backend.to_owned(),
        namespace: Some(namespace.to_owned()),
        ..valid_config
    };
    assert_eq!(cfg.coordinator_settings().namespace.as_deref(), expected);
}

#[rstest]
fn builds_configured_backend(valid_config: PstorageConfig) {
    let backend = valid_config
        .build_backend(
            Arc::new(StaticNodeDirectory::default()),
            Arc::new(StaticVolumeUsage::new()),
        )
        .expect("local backend");
    assert_eq!(backend.kind(), BackendKind::Local);
}
