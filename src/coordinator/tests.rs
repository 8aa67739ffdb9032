//! Unit tests for the volume lifecycle coordinator.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rstest::{fixture, rstest};

use super::*;
use crate::records::InMemoryVolumeStore;
use crate::tasks::TokioTaskQueue;
use crate::test_support::FakeBackend;

struct Harness {
    coordinator: VolumeCoordinator,
    backend: FakeBackend,
    store: InMemoryVolumeStore,
    locks: LockManager,
    queue: Arc<TokioTaskQueue>,
}

fn harness_with(settings: CoordinatorSettings) -> Harness {
    let backend = FakeBackend::new();
    let store = InMemoryVolumeStore::new();
    let locks = LockManager::in_memory();
    let queue = Arc::new(TokioTaskQueue::current());
    let coordinator = VolumeCoordinator::new(
        Arc::new(backend.clone()),
        Arc::new(store.clone()),
        locks.clone(),
        Arc::clone(&queue) as Arc<dyn TaskQueue>,
        settings,
    );
    Harness {
        coordinator,
        backend,
        store,
        locks,
        queue,
    }
}

#[fixture]
fn settings() -> CoordinatorSettings {
    CoordinatorSettings {
        format_retry: RetryPolicy {
            attempts: 100,
            pause: Duration::from_millis(5),
        },
        ..CoordinatorSettings::default()
    }
}

fn request() -> VolumeRequest {
    VolumeRequest::new(5, "data", 2).node_id("n1")
}

#[rstest]
#[tokio::test]
async fn create_records_created_volume(settings: CoordinatorSettings) {
    let h = harness_with(settings);
    let volume = h.coordinator.create(request()).await.expect("create");

    assert_eq!(volume.state, VolumeState::Created);
    assert_eq!(volume.drive_name, "5/data");
    assert_eq!(volume.node_id.as_deref(), Some("n1"));
    assert!(h.backend.has_resource("5/data"));
    assert_eq!(h.store.all(), vec![volume]);
    assert!(!h.locks.is_locked("5/data").await.expect("inspect"));
}

#[rstest]
#[tokio::test]
async fn repeated_create_returns_existing_volume(settings: CoordinatorSettings) {
    let h = harness_with(settings);
    let first = h.coordinator.create(request()).await.expect("first");
    let second = h.coordinator.create(request()).await.expect("second");

    assert_eq!(first.id, second.id);
    assert_eq!(h.backend.create_calls(), 1);
    assert_eq!(h.store.all().len(), 1);
}

#[rstest]
#[tokio::test]
async fn create_with_other_size_conflicts(settings: CoordinatorSettings) {
    let h = harness_with(settings);
    h.coordinator.create(request()).await.expect("create");

    let err = h
        .coordinator
        .create(VolumeRequest::new(5, "data", 3))
        .await
        .expect_err("size conflict");
    assert_eq!(
        err,
        VolumeError::SizeMismatch {
            name: String::from("data"),
            existing: 2,
        }
    );
}

#[rstest]
#[case(VolumeRequest::new(5, "  ", 1))]
#[case(VolumeRequest::new(5, "data", 0))]
#[case(VolumeRequest::new(5, "a/b", 1))]
#[case(VolumeRequest::new(5, "x__SEPID__1", 1))]
#[case(VolumeRequest::new(5, ".", 1))]
#[case(VolumeRequest::new(5, "..", 1))]
#[tokio::test]
async fn malformed_requests_are_rejected(
    settings: CoordinatorSettings,
    #[case] bad: VolumeRequest,
) {
    let h = harness_with(settings);
    let err = h.coordinator.create(bad).await.expect_err("rejected");
    assert!(matches!(err, VolumeError::InvalidRequest { .. }));
    assert!(h.store.all().is_empty());
}

#[rstest]
#[tokio::test]
async fn retry_resumes_matching_pending_row(settings: CoordinatorSettings) {
    let h = harness_with(settings);
    let mut pending = PersistentVolume::pending(5, "data", "5/data", 2);
    pending.node_id = Some(String::from("n1"));
    h.store.save(&pending).await.expect("seed");

    let volume = h.coordinator.create(request()).await.expect("resume");
    assert_eq!(volume.id, pending.id);
    assert_eq!(volume.state, VolumeState::Created);
}

#[rstest]
#[case(VolumeRequest::new(5, "data", 3).node_id("n1"), VolumeError::SizeMismatch {
    name: String::from("data"),
    existing: 2,
})]
#[case(VolumeRequest::new(5, "data", 2).node_id("n2"), VolumeError::NodeMismatch {
    name: String::from("data"),
    existing: String::from("n1"),
})]
#[tokio::test]
async fn retry_with_other_parameters_keeps_pending_row(
    settings: CoordinatorSettings,
    #[case] retry: VolumeRequest,
    #[case] expected: VolumeError,
) {
    let h = harness_with(settings);
    let mut pending = PersistentVolume::pending(5, "data", "5/data", 2);
    pending.node_id = Some(String::from("n1"));
    h.store.save(&pending).await.expect("seed");

    let err = h.coordinator.create(retry).await.expect_err("conflict");
    assert_eq!(err, expected);
    assert_eq!(h.backend.create_calls(), 0);
    assert_eq!(h.store.all(), vec![pending]);
    assert!(!h.locks.is_locked("5/data").await.expect("inspect"));
}

#[rstest]
#[tokio::test]
async fn failed_create_removes_pending_row(settings: CoordinatorSettings) {
    let h = harness_with(settings);
    h.backend.fail_create(true);

    let err = h.coordinator.create(request()).await.expect_err("fails");
    assert!(matches!(err, VolumeError::Backend { .. }));
    assert!(err.admin_reason().contains("simulated create failure"));
    assert!(!err.user_reason().contains("simulated"));
    assert!(h.store.all().is_empty());
    assert!(!h.locks.is_locked("5/data").await.expect("inspect"));
}

#[rstest]
#[tokio::test]
async fn create_fails_fast_while_locked(settings: CoordinatorSettings) {
    let h = harness_with(settings);
    let _held = h
        .locks
        .acquire("5/data", Duration::from_secs(60), LockPayload::new("format"))
        .await
        .expect("hold");

    let err = h.coordinator.create(request()).await.expect_err("busy");
    assert_eq!(
        err,
        VolumeError::Locked {
            drive_name: String::from("5/data"),
            operation: String::from("format"),
        }
    );
    assert_eq!(h.backend.create_calls(), 0);
    assert!(h.store.all().is_empty());
}

#[rstest]
#[tokio::test]
async fn concurrent_formats_are_serialised(settings: CoordinatorSettings) {
    let h = harness_with(settings);
    h.backend.set_format_delay(Duration::from_millis(30));
    let volume = h.coordinator.create(request()).await.expect("create");

    let (first, second) = tokio::join!(
        h.coordinator.format(volume.id, None),
        h.coordinator.format(volume.id, Some("ext4")),
    );

    assert_eq!(first.expect("first"), FormatOutcome::Formatted);
    assert_eq!(second.expect("second"), FormatOutcome::Formatted);
    assert_eq!(h.backend.max_concurrent_formats(), 1);
}

#[tokio::test]
async fn fail_fast_format_reports_busy_volume() {
    let h = harness_with(CoordinatorSettings {
        format_retry: RetryPolicy::fail_fast(),
        ..CoordinatorSettings::default()
    });
    h.backend.set_format_delay(Duration::from_millis(30));
    let volume = h.coordinator.create(request()).await.expect("create");

    let (first, second) = tokio::join!(
        h.coordinator.format(volume.id, None),
        h.coordinator.format(volume.id, None),
    );

    let busy = [&first, &second]
        .iter()
        .filter(|result| matches!(result, Err(VolumeError::Locked { .. })))
        .count();
    assert_eq!(busy, 1);
    assert_eq!(h.backend.max_concurrent_formats(), 1);
}

#[rstest]
#[tokio::test]
async fn format_of_unknown_volume_is_not_found(settings: CoordinatorSettings) {
    let h = harness_with(settings);
    let id = Uuid::new_v4();
    let err = h.coordinator.format(id, None).await.expect_err("missing");
    assert_eq!(err, VolumeError::NotFound { id });
}

#[rstest]
#[tokio::test]
async fn delete_returns_promptly_when_backend_is_down(settings: CoordinatorSettings) {
    let h = harness_with(settings);
    let volume = h.coordinator.create(request()).await.expect("create");
    h.backend.set_unreachable(true);

    let started = Instant::now();
    h.coordinator.delete(volume.id).await.expect("delete");
    assert!(started.elapsed() < Duration::from_secs(1));

    let row = h.store.get(volume.id).await.expect("get").expect("row");
    assert_eq!(row.state, VolumeState::ToDelete);

    h.queue.drain().await;
    let summary = h.coordinator.reap().await.expect("sweep");
    assert_eq!(summary.failed, 1);
    assert!(h.backend.has_resource("5/data"));

    h.backend.set_unreachable(false);
    let summary = h.coordinator.reap().await.expect("sweep");
    assert_eq!(summary.deleted, 1);
    assert!(!h.backend.has_resource("5/data"));
    let row = h.store.get(volume.id).await.expect("get").expect("row");
    assert_eq!(row.state, VolumeState::Deleted);
}

#[rstest]
#[tokio::test]
async fn deferred_delete_removes_resource(settings: CoordinatorSettings) {
    let h = harness_with(settings);
    let volume = h.coordinator.create(request()).await.expect("create");

    h.coordinator.delete(volume.id).await.expect("delete");
    h.queue.drain().await;

    assert!(!h.backend.has_resource("5/data"));
    let row = h.store.get(volume.id).await.expect("get").expect("row");
    assert_eq!(row.state, VolumeState::Deleted);
}

#[rstest]
#[tokio::test]
async fn attached_volume_survives_until_released(settings: CoordinatorSettings) {
    let h = harness_with(settings);
    let volume = h.coordinator.create(request()).await.expect("create");
    h.backend.mark_in_use("5/data", true);

    h.coordinator.delete(volume.id).await.expect("delete");
    h.queue.drain().await;
    let summary = h.coordinator.reap().await.expect("sweep");
    assert_eq!(summary.in_use, 1);
    let row = h.store.get(volume.id).await.expect("get").expect("row");
    assert_eq!(row.state, VolumeState::ToDelete);
    assert!(h.backend.has_resource("5/data"));

    h.backend.mark_in_use("5/data", false);
    let summary = h.coordinator.reap().await.expect("sweep");
    assert_eq!(
        summary,
        ReapSummary {
            deleted: 1,
            ..ReapSummary::default()
        }
    );
}

#[rstest]
#[tokio::test]
async fn reaper_skips_locked_volumes(settings: CoordinatorSettings) {
    let h = harness_with(settings);
    let volume = h.coordinator.create(request()).await.expect("create");
    let mut row = volume.clone();
    row.transition(VolumeState::ToDelete).expect("transition");
    h.store.save(&row).await.expect("save");

    let held = h
        .locks
        .acquire("5/data", Duration::from_secs(60), LockPayload::new("format"))
        .await
        .expect("hold");
    let summary = h.coordinator.reap().await.expect("sweep");
    assert_eq!(summary.skipped, 1);
    assert_eq!(h.backend.delete_calls(), 0);

    held.release().await.expect("release");
    let summary = h.coordinator.reap().await.expect("sweep");
    assert_eq!(summary.deleted, 1);
}

#[rstest]
#[tokio::test]
async fn reap_keeps_edits_made_while_backend_deletes(settings: CoordinatorSettings) {
    let h = harness_with(settings);
    let volume = h.coordinator.create(request()).await.expect("create");
    let mut row = volume.clone();
    row.transition(VolumeState::ToDelete).expect("transition");
    h.store.save(&row).await.expect("save");

    let store = h.store.clone();
    let id = volume.id;
    h.backend.on_delete(move |_| {
        store.edit(id, |row| row.pod_id = Some(String::from("pod-7")));
    });
    let outcome = h.coordinator.reap_one(volume.id).await.expect("reap");

    assert_eq!(outcome, ReapOutcome::Deleted);
    let row = h.store.get(volume.id).await.expect("get").expect("row");
    assert_eq!(row.state, VolumeState::Deleted);
    assert_eq!(row.pod_id.as_deref(), Some("pod-7"));
}

#[rstest]
#[tokio::test]
async fn reap_of_vanished_row_touches_nothing(settings: CoordinatorSettings) {
    let h = harness_with(settings);
    let volume = h.coordinator.create(request()).await.expect("create");
    h.store.delete(volume.id).await.expect("drop row");

    let outcome = h.coordinator.reap_one(volume.id).await.expect("reap");
    assert_eq!(outcome, ReapOutcome::Gone);
    assert_eq!(h.backend.delete_calls(), 0);
    assert!(h.backend.has_resource("5/data"));
}

#[rstest]
#[tokio::test]
async fn deleted_name_can_be_reused(settings: CoordinatorSettings) {
    let h = harness_with(settings);
    let old = h.coordinator.create(request()).await.expect("create");
    h.coordinator.delete(old.id).await.expect("delete");
    h.queue.drain().await;

    let fresh = h.coordinator.create(request()).await.expect("recreate");
    assert_ne!(fresh.id, old.id);
    assert_eq!(fresh.state, VolumeState::Created);
}

#[rstest]
#[tokio::test]
async fn purge_drops_only_deleted_bindings(settings: CoordinatorSettings) {
    let h = harness_with(settings);
    let kept = h.coordinator.create(request()).await.expect("create");
    let gone = h
        .coordinator
        .create(VolumeRequest::new(5, "logs", 1).node_id("n1"))
        .await
        .expect("create");
    h.coordinator.delete(gone.id).await.expect("delete");
    h.queue.drain().await;

    assert_eq!(h.coordinator.purge_node_bindings("n1").await, 1);
    assert_eq!(h.coordinator.purge_node_bindings("n2").await, 0);
    let remaining: Vec<Uuid> = h.store.all().into_iter().map(|row| row.id).collect();
    assert_eq!(remaining, vec![kept.id]);
}

#[rstest]
#[tokio::test]
async fn wire_spec_resolves_back_to_record(settings: CoordinatorSettings) {
    let h = harness_with(settings);
    let volume = h.coordinator.create(request()).await.expect("create");

    let spec = h.coordinator.wire_spec(volume.id).await.expect("wire");
    assert_eq!(spec.name, "data");
    let resolved = h.coordinator.resolve_wire(&spec).await.expect("resolve");
    assert_eq!(resolved.map(|row| row.id), Some(volume.id));
}

#[rstest]
#[tokio::test]
async fn inventory_filters_by_owner_and_mapping(settings: CoordinatorSettings) {
    let h = harness_with(settings);
    h.coordinator.create(request()).await.expect("create");
    h.coordinator
        .create(VolumeRequest::new(5, "logs", 1).node_id("n1"))
        .await
        .expect("create");
    h.coordinator
        .create(VolumeRequest::new(9, "data", 4).node_id("n1"))
        .await
        .expect("create");
    h.backend.mark_in_use("5/logs", true);

    let all = h.coordinator.drives(None).await.expect("list");
    assert_eq!(all.len(), 3);

    let owned = h.coordinator.drives(Some(5)).await.expect("list");
    let names: Vec<&str> = owned.iter().map(|drive| drive.name.as_str()).collect();
    assert_eq!(names, vec!["data", "logs"]);

    let unmapped = h.coordinator.unmapped_drives(Some(5)).await.expect("list");
    let [free] = unmapped.as_slice() else {
        panic!("expected one unmapped drive, got {unmapped:?}");
    };
    assert_eq!(free.drive_name, "5/data");
    assert_eq!(free.size_gb, Some(2));
}

#[rstest]
#[tokio::test]
async fn inventory_failure_is_reported(settings: CoordinatorSettings) {
    let h = harness_with(settings);
    h.backend.set_unreachable(true);

    let err = h.coordinator.drives(None).await.expect_err("down");
    assert!(matches!(err, VolumeError::Inventory { .. }));
    assert!(!err.user_reason().contains("simulated"));
}

#[tokio::test(start_paused = true)]
async fn spawned_reaper_sweeps_periodically() {
    let h = harness_with(CoordinatorSettings::default());
    let volume = h.coordinator.create(request()).await.expect("create");
    let mut row = volume.clone();
    row.transition(VolumeState::ToDelete).expect("transition");
    h.store.save(&row).await.expect("save");

    let reaper = h.coordinator.spawn_reaper(Duration::from_secs(30));
    tokio::time::sleep(Duration::from_secs(1)).await;
    reaper.abort();

    let row = h.store.get(volume.id).await.expect("get").expect("row");
    assert_eq!(row.state, VolumeState::Deleted);
}

#[test]
fn user_reason_hides_backend_details() {
    let err = VolumeError::Backend {
        drive_name: String::from("5/data"),
        source: BackendError::Provider {
            message: String::from("AccessDenied for key AKIA"),
        },
    };
    assert!(err.admin_reason().contains("AKIA"));
    assert!(!err.user_reason().contains("AKIA"));

    let no_nodes = VolumeError::Backend {
        drive_name: String::from("5/data"),
        source: BackendError::NoNodes {
            backend: crate::backend::BackendKind::Clustered,
        },
    };
    assert!(no_nodes.user_reason().contains("no nodes"));
}
