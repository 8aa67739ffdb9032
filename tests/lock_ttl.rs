//! Named locks expire on their own once their TTL elapses.

use std::time::Duration;

use pstorage::lock::{LockError, LockManager, LockPayload, RetryPolicy};

#[tokio::test]
async fn expired_lock_can_be_taken_by_another_worker() {
    let locks = LockManager::in_memory();
    let stale = locks
        .acquire("5/data", Duration::from_millis(100), LockPayload::new("format"))
        .await
        .expect("first holder");

    let busy = locks
        .acquire("5/data", Duration::from_secs(60), LockPayload::new("delete"))
        .await
        .expect_err("still held");
    assert!(matches!(busy, LockError::AlreadyLocked { .. }));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(stale.lock().is_expired());

    let fresh = locks
        .acquire("5/data", Duration::from_secs(60), LockPayload::new("delete"))
        .await
        .expect("lock expired");
    let holder = locks.inspect("5/data").await.expect("inspect").expect("held");
    assert_eq!(holder.operation, "delete");

    // The stale guard is forgotten rather than released so it cannot drop
    // the fresh holder's key.
    let _stale_lock = stale.hand_off();
    fresh.release().await.expect("release");
    assert!(!locks.is_locked("5/data").await.expect("inspect"));
}

#[tokio::test]
async fn retry_outlasts_short_lived_holder() {
    let locks = LockManager::in_memory();
    let _short = locks
        .acquire("5/data", Duration::from_millis(50), LockPayload::new("create"))
        .await
        .expect("first holder");

    let guard = locks
        .acquire_with_retry(
            "5/data",
            Duration::from_secs(60),
            LockPayload::new("format"),
            RetryPolicy {
                attempts: 20,
                pause: Duration::from_millis(20),
            },
        )
        .await
        .expect("acquired after expiry");
    assert_eq!(guard.lock().payload.operation, "format");
    guard.release().await.expect("release");
}
