//! Volume specs produced by each backend parse back to the same drive name
//! and size after a trip through the orchestrator's JSON representation.

use std::sync::Arc;
use std::time::Duration;

use pstorage::backend::{
    AwsCliApi, BackendContext, CloudBackend, CloudSettings, ClusteredBackend, ClusteredSettings,
    DEFAULT_LOCAL_STORAGE_PREFIX, LocalBackend, StaticVolumeUsage, StorageBackend, VolumeSpec,
    VolumeTarget,
};
use pstorage::drive_name::DriveName;
use pstorage::executor::{NODE_COMMAND_TIMEOUT, RemoteExecutor, Transport};
use pstorage::test_support::ScriptedRunner;
use pstorage::{BackendKind, Node, StaticNodeDirectory};
use rstest::rstest;

fn executor() -> RemoteExecutor<ScriptedRunner> {
    RemoteExecutor::new(Transport::LocalShell, NODE_COMMAND_TIMEOUT, ScriptedRunner::new())
}

fn nodes() -> Arc<StaticNodeDirectory> {
    Arc::new(StaticNodeDirectory::new([
        Node::new("n1", "node-1", "10.0.0.1").with_ceph()
    ]))
}

fn backend(kind: BackendKind) -> Arc<dyn StorageBackend> {
    match kind {
        BackendKind::Clustered => Arc::new(ClusteredBackend::new(
            executor(),
            nodes(),
            ClusteredSettings {
                monitors: vec![String::from("10.0.0.1:6789")],
                ..ClusteredSettings::default()
            },
        )),
        BackendKind::Cloud => Arc::new(CloudBackend::new(
            executor(),
            nodes(),
            Arc::new(AwsCliApi::new(
                ScriptedRunner::new(),
                "aws",
                "eu-west-1",
                "eu-west-1a",
                Duration::from_secs(5),
            )),
            CloudSettings::new("eu-west-1a"),
        )),
        BackendKind::Local => Arc::new(LocalBackend::new(
            executor(),
            nodes(),
            Arc::new(StaticVolumeUsage::new()),
            DEFAULT_LOCAL_STORAGE_PREFIX,
        )),
    }
}

#[rstest]
#[tokio::test]
async fn spec_round_trips_through_json(
    #[values(BackendKind::Clustered, BackendKind::Cloud, BackendKind::Local)] kind: BackendKind,
    #[values(1, 1024, 65535)] size: u64,
    #[values("data", "with__SEPID__separator")] name: &str,
) {
    let backend = backend(kind);
    let drive_name = DriveName::compose(kind, Some("team"), 42, name).to_string();
    let target = VolumeTarget::new(name, &drive_name, size).node_id(Some(String::from("n1")));

    let spec = backend
        .to_wire(&BackendContext::new(), &target)
        .await
        .expect("describe volume");
    assert_eq!(BackendKind::of_wire(&spec), Some(kind));
    if let Some(rbd) = &spec.rbd {
        assert_eq!(rbd.pool, "team");
        assert_eq!(rbd.image, format!("{name}__SEPID__42"));
    }

    let json = serde_json::to_string(&spec).expect("serialise");
    let parsed: VolumeSpec = serde_json::from_str(&json).expect("deserialise");
    let wire = backend.from_wire(&parsed).expect("parse spec");

    assert_eq!(wire.drive_name, drive_name);
    assert_eq!(wire.size, Some(size));
    let owner = DriveName::parse(kind, &wire.drive_name).expect("drive name");
    assert_eq!(owner.owner_id, 42);
    assert_eq!(owner.name, name);
}

#[rstest]
#[case(BackendKind::Clustered)]
#[case(BackendKind::Cloud)]
#[case(BackendKind::Local)]
fn foreign_specs_are_rejected(#[case] kind: BackendKind) {
    let backend = backend(kind);
    let spec = VolumeSpec {
        name: String::from("empty"),
        ..VolumeSpec::default()
    };
    assert!(backend.from_wire(&spec).is_err());
}
