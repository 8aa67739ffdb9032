//! Two control-plane workers sharing a lock store and a record store never
//! run mutating backend calls against the same volume at once.

use std::sync::Arc;
use std::time::Duration;

use pstorage::backend::FormatOutcome;
use pstorage::test_support::FakeBackend;
use pstorage::{
    CoordinatorSettings, InMemoryVolumeStore, LockManager, RetryPolicy, TaskQueue, TokioTaskQueue,
    VolumeCoordinator, VolumeError, VolumeRequest, VolumeState, VolumeStore,
};

struct Cluster {
    backend: FakeBackend,
    store: InMemoryVolumeStore,
    queue: Arc<TokioTaskQueue>,
    workers: [VolumeCoordinator; 2],
}

fn cluster() -> Cluster {
    let backend = FakeBackend::new();
    let store = InMemoryVolumeStore::new();
    let locks = LockManager::in_memory();
    let queue = Arc::new(TokioTaskQueue::current());
    let settings = CoordinatorSettings {
        format_retry: RetryPolicy {
            attempts: 200,
            pause: Duration::from_millis(5),
        },
        ..CoordinatorSettings::default()
    };
    let worker = || {
        VolumeCoordinator::new(
            Arc::new(backend.clone()),
            Arc::new(store.clone()),
            locks.clone(),
            Arc::clone(&queue) as Arc<dyn TaskQueue>,
            settings.clone(),
        )
    };
    let workers = [worker(), worker()];
    Cluster {
        backend,
        store,
        queue,
        workers,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn formats_from_two_workers_never_overlap() {
    let cluster = cluster();
    cluster.backend.set_format_delay(Duration::from_millis(20));
    let [first, second] = cluster.workers.clone();
    let volume = first
        .create(VolumeRequest::new(3, "db", 10).node_id("n1"))
        .await
        .expect("create");

    let mut handles = Vec::new();
    for worker in [first, second] {
        for _ in 0..3 {
            let coordinator = worker.clone();
            handles.push(tokio::spawn(async move {
                coordinator.format(volume.id, None).await
            }));
        }
    }
    for handle in handles {
        let outcome = handle.await.expect("join").expect("format");
        assert_eq!(outcome, FormatOutcome::Formatted);
    }
    assert_eq!(cluster.backend.max_concurrent_formats(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_creates_leave_one_volume() {
    let cluster = cluster();
    let [first, second] = cluster.workers.clone();
    let request = VolumeRequest::new(3, "db", 10).node_id("n1");

    let (a, b) = tokio::join!(first.create(request.clone()), second.create(request.clone()));
    let created: Vec<_> = [a, b].into_iter().filter_map(Result::ok).collect();
    assert!(!created.is_empty());

    // A loser of the race either saw the lock or the finished row; a retry
    // always converges on the single created volume.
    let settled = first.create(request).await.expect("retry");
    assert_eq!(settled.state, VolumeState::Created);
    assert_eq!(cluster.backend.resource_count(), 1);
    let live: Vec<_> = cluster
        .store
        .all()
        .into_iter()
        .filter(|row| row.state == VolumeState::Created)
        .collect();
    assert_eq!(live.len(), 1);
}

#[tokio::test]
async fn reaper_skips_volume_busy_with_format() {
    let cluster = cluster();
    cluster.backend.set_format_delay(Duration::from_millis(200));
    let [first, second] = cluster.workers.clone();
    let volume = first
        .create(VolumeRequest::new(3, "db", 10).node_id("n1"))
        .await
        .expect("create");

    let formatting = tokio::spawn({
        let worker = first.clone();
        async move { worker.format(volume.id, None).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    second.delete(volume.id).await.expect("delete is never blocked");

    let summary = second.reap().await.expect("sweep");
    assert_eq!(summary.skipped, 1);
    formatting.await.expect("join").expect("format");

    cluster.queue.drain().await;
    let summary = second.reap().await.expect("sweep");
    assert_eq!(summary.deleted, 1);
    let row = cluster.store.get(volume.id).await.expect("get").expect("row");
    assert_eq!(row.state, VolumeState::Deleted);
}

#[tokio::test]
async fn unknown_volume_is_not_found_for_every_operation() {
    let cluster = cluster();
    let [worker, _] = cluster.workers.clone();
    let id = uuid::Uuid::new_v4();

    assert_eq!(
        worker.format(id, None).await,
        Err(VolumeError::NotFound { id })
    );
    assert!(matches!(
        worker.delete(id).await,
        Err(VolumeError::NotFound { .. })
    ));
    assert!(matches!(
        worker.wire_spec(id).await,
        Err(VolumeError::NotFound { .. })
    ));
}
