//! End-to-end lifecycle of a node-local volume, running real shell commands
//! against a temporary storage root.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use pstorage::backend::{FormatOutcome, LocalBackend, StaticVolumeUsage};
use pstorage::executor::{RemoteExecutor, Transport};
use pstorage::{
    CoordinatorSettings, InMemoryVolumeStore, LockManager, Node, ReapSummary, StaticNodeDirectory,
    TokioTaskQueue, VolumeCoordinator, VolumeError, VolumeRequest, VolumeState, VolumeStore,
};
use rstest::{fixture, rstest};
use tempfile::TempDir;

struct LocalHarness {
    root: TempDir,
    prefix: Utf8PathBuf,
    usage: StaticVolumeUsage,
    store: InMemoryVolumeStore,
    queue: Arc<TokioTaskQueue>,
    coordinator: VolumeCoordinator,
}

#[fixture]
fn harness() -> LocalHarness {
    let root = TempDir::new().expect("temp dir");
    let prefix = Utf8PathBuf::from_path_buf(root.path().join("storage")).expect("utf8 path");
    let usage = StaticVolumeUsage::new();
    let store = InMemoryVolumeStore::new();
    let queue = Arc::new(TokioTaskQueue::current());
    let backend = LocalBackend::new(
        RemoteExecutor::with_process_runner(Transport::LocalShell, Duration::from_secs(10)),
        Arc::new(StaticNodeDirectory::new([Node::new("n1", "node-1", "127.0.0.1")])),
        Arc::new(usage.clone()),
        prefix.clone(),
    );
    let coordinator = VolumeCoordinator::new(
        Arc::new(backend),
        Arc::new(store.clone()),
        LockManager::in_memory(),
        Arc::clone(&queue) as Arc<dyn pstorage::TaskQueue>,
        CoordinatorSettings::default(),
    );
    LocalHarness {
        root,
        prefix,
        usage,
        store,
        queue,
        coordinator,
    }
}

#[rstest]
#[tokio::test]
async fn local_volume_lifecycle(harness: LocalHarness) {
    let h = harness;
    let volume = h
        .coordinator
        .create(VolumeRequest::new(7, "logs", 1).node_id("n1"))
        .await
        .expect("create");
    let dir = h.prefix.join("7").join("logs");
    assert!(dir.is_dir(), "{dir} should exist");

    let outcome = h.coordinator.format(volume.id, None).await.expect("format");
    assert_eq!(outcome, FormatOutcome::AlreadyFormatted);

    let spec = h.coordinator.wire_spec(volume.id).await.expect("wire");
    let source = spec.local_storage.as_ref().expect("local source");
    assert_eq!(source.path, dir.as_str());
    assert_eq!(source.size, 1);

    h.usage.set_in_use(&volume.drive_name, true);
    h.coordinator.delete(volume.id).await.expect("delete");
    h.queue.drain().await;
    assert!(dir.is_dir(), "declared volume must survive");
    let row = h.store.get(volume.id).await.expect("get").expect("row");
    assert_eq!(row.state, VolumeState::ToDelete);

    h.usage.set_in_use(&volume.drive_name, false);
    let summary = h.coordinator.reap().await.expect("sweep");
    assert_eq!(
        summary,
        ReapSummary {
            deleted: 1,
            ..ReapSummary::default()
        }
    );
    assert!(!dir.exists());
    let row = h.store.get(volume.id).await.expect("get").expect("row");
    assert_eq!(row.state, VolumeState::Deleted);
    assert!(h.root.path().exists());
}

#[rstest]
#[tokio::test]
async fn create_of_unbound_local_volume_fails_cleanly(harness: LocalHarness) {
    let h = harness;
    let err = h
        .coordinator
        .create(VolumeRequest::new(7, "logs", 1))
        .await
        .expect_err("local volumes need a node");

    assert!(err.user_reason().contains("no nodes"));
    assert!(h.store.all().is_empty());
    assert!(!h.prefix.exists());
}

#[rstest]
#[tokio::test]
async fn nested_volume_names_cannot_share_a_directory(harness: LocalHarness) {
    let h = harness;
    let outer = h
        .coordinator
        .create(VolumeRequest::new(7, "a", 1).node_id("n1"))
        .await
        .expect("create outer");
    let sibling = h
        .coordinator
        .create(VolumeRequest::new(7, "b", 1).node_id("n1"))
        .await
        .expect("create sibling");

    let err = h
        .coordinator
        .create(VolumeRequest::new(7, "a/b", 1).node_id("n1"))
        .await
        .expect_err("nested name rejected");
    assert!(matches!(err, VolumeError::InvalidRequest { .. }));
    assert!(!h.prefix.join("7").join("a").join("b").exists());

    h.coordinator.delete(outer.id).await.expect("delete");
    h.queue.drain().await;
    assert!(!h.prefix.join("7").join("a").exists());
    assert!(h.prefix.join("7").join("b").is_dir());
    let row = h.store.get(sibling.id).await.expect("get").expect("row");
    assert_eq!(row.state, VolumeState::Created);
}
