//! Per-workload operation locks.
//!
//! Long workload operations (start, stop, redeploy and friends) take the lock
//! `pod.<workload_id>` so that two of them never run against the same
//! workload. The lock either covers a scoped block or is handed off to a
//! background task, which releases it when the task finishes.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::lock::{LockError, LockGuard, LockManager, LockPayload, UNKNOWN_OPERATION};
use crate::tasks::{TaskError, TaskQueue, TaskRef, job};

/// Default lifetime of an operation lock.
pub const DEFAULT_OPERATION_TTL: Duration = Duration::from_secs(600);

/// Prefix of workload lock keys.
pub const WORKLOAD_LOCK_PREFIX: &str = "pod.";

/// Workload operations guarded by an operation lock.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Operation {
    /// Workload creation.
    Create,
    /// Preparation of a workload before its first start.
    Prepare,
    /// Start.
    Start,
    /// Stop.
    Stop,
    /// Deletion.
    Delete,
    /// Edit of the workload definition.
    Edit,
    /// Restart.
    Restart,
    /// Configuration change.
    ChangeConfig,
    /// Redeploy.
    Redeploy,
    /// Release of the public IP.
    UnbindPublicIp,
    /// Stop triggered by an unpaid balance.
    StopUnpaid,
}

impl Operation {
    /// Label stored in the lock payload.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Prepare => "prepare",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Delete => "delete",
            Self::Edit => "edit",
            Self::Restart => "restart",
            Self::ChangeConfig => "change config",
            Self::Redeploy => "redeploy",
            Self::UnbindPublicIp => "unbind public IP",
            Self::StopUnpaid => "stop unpaid pod",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by operation locks.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum OperationLockError {
    /// Raised when another operation holds the workload.
    #[error("workload {workload_id} is busy: {operation} in progress")]
    WorkloadLocked {
        /// Workload id.
        workload_id: String,
        /// Operation holding the lock, or `unknown`.
        operation: String,
    },
    /// Raised when the lock store fails.
    #[error(transparent)]
    Lock(LockError),
}

/// Lock key of `workload_id`.
#[must_use]
pub fn workload_key(workload_id: &str) -> String {
    format!("{WORKLOAD_LOCK_PREFIX}{workload_id}")
}

/// Acquires operation locks over a [`LockManager`].
#[derive(Clone, Debug)]
pub struct OperationLocks {
    locks: LockManager,
    ttl: Duration,
}

impl OperationLocks {
    /// Creates operation locks with [`DEFAULT_OPERATION_TTL`].
    #[must_use]
    pub const fn new(locks: LockManager) -> Self {
        Self {
            locks,
            ttl: DEFAULT_OPERATION_TTL,
        }
    }

    /// Overrides the lock lifetime.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Locks `workload_id` for `operation`, failing immediately when busy.
    ///
    /// # Errors
    ///
    /// Returns [`OperationLockError::WorkloadLocked`] naming the current
    /// holder when the workload is busy.
    pub async fn acquire(
        &self,
        workload_id: &str,
        operation: Operation,
    ) -> Result<LockGuard, OperationLockError> {
        self.locks
            .acquire(
                &workload_key(workload_id),
                self.ttl,
                LockPayload::new(operation.as_str()),
            )
            .await
            .map_err(|err| conflict(workload_id, err))
    }

    /// Operation currently holding `workload_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`OperationLockError::Lock`] when the store fails.
    pub async fn holder(&self, workload_id: &str) -> Result<Option<LockPayload>, OperationLockError> {
        self.locks
            .inspect(&workload_key(workload_id))
            .await
            .map_err(OperationLockError::Lock)
    }

    /// Runs `body` while holding the lock, releasing it on every exit path.
    ///
    /// # Errors
    ///
    /// Returns the lock conflict converted into `E`, or the error of `body`.
    pub async fn scoped<F, Fut, T, E>(
        &self,
        workload_id: &str,
        operation: Operation,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<OperationLockError>,
    {
        let guard = self.acquire(workload_id, operation).await?;
        let result = body().await;
        if let Err(err) = guard.release().await {
            warn!(workload_id, %operation, error = %err, "failed to release operation lock");
        }
        result
    }

    /// Transfers the lock to a background task running `work`.
    ///
    /// The task records its id in the lock payload and releases the lock
    /// once `work` finishes, whether it succeeds or not.
    ///
    /// # Errors
    ///
    /// Returns [`OperationLockError::Lock`] when the lock cannot be encoded.
    /// The guard is released in that case.
    pub fn hand_off<F, Fut>(
        &self,
        guard: LockGuard,
        queue: &dyn TaskQueue,
        work: F,
    ) -> Result<TaskRef, OperationLockError>
    where
        F: FnOnce(TaskRef) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let token = guard.lock().to_token().map_err(OperationLockError::Lock)?;
        let key = guard.hand_off().key;
        let locks = self.locks.clone();
        let task = queue.submit(
            job(move |task| async move {
                let mut restored = locks.restore(&token).map_err(TaskError::failed)?;
                match restored.attach_task(&task.to_string()).await {
                    Ok(true) => debug!(%task, key = %key, "operation lock taken over"),
                    Ok(false) => warn!(%task, key = %key, "operation lock expired before hand-off"),
                    Err(err) => warn!(%task, key = %key, error = %err, "cannot record task in lock"),
                }
                let result = work(task).await;
                if let Err(err) = restored.release().await {
                    warn!(%task, key = %key, error = %err, "failed to release operation lock");
                }
                result
            }),
            None,
        );
        Ok(task)
    }
}

fn conflict(workload_id: &str, err: LockError) -> OperationLockError {
    match err {
        LockError::AlreadyLocked { holder, .. } => OperationLockError::WorkloadLocked {
            workload_id: workload_id.to_owned(),
            operation: holder.map_or_else(
                || String::from(UNKNOWN_OPERATION),
                |payload| payload.operation,
            ),
        },
        other => OperationLockError::Lock(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{LOCK_PREFIX, LockStore, MemoryLockStore};
    use crate::tasks::TokioTaskQueue;
    use rstest::rstest;
    use std::sync::Arc;

    #[rstest]
    #[case(Operation::ChangeConfig, "change config")]
    #[case(Operation::UnbindPublicIp, "unbind public IP")]
    #[case(Operation::StopUnpaid, "stop unpaid pod")]
    fn labels_match_stored_payloads(#[case] operation: Operation, #[case] label: &str) {
        assert_eq!(operation.to_string(), label);
    }

    #[tokio::test]
    async fn conflict_names_holder_operation() {
        let locks = OperationLocks::new(LockManager::in_memory());
        let _guard = locks.acquire("w1", Operation::Start).await.expect("first");

        let err = locks
            .acquire("w1", Operation::Stop)
            .await
            .expect_err("busy");
        assert_eq!(
            err,
            OperationLockError::WorkloadLocked {
                workload_id: String::from("w1"),
                operation: String::from("start"),
            }
        );
        assert!(locks.acquire("w2", Operation::Stop).await.is_ok());
    }

    #[tokio::test]
    async fn unreadable_holder_is_unknown() {
        let store = Arc::new(MemoryLockStore::new());
        let key = format!("{LOCK_PREFIX}pod.w1");
        store
            .set_if_absent(&key, "{not json", Duration::from_secs(60))
            .await
            .expect("seed");
        let locks = OperationLocks::new(LockManager::new(store));

        let err = locks
            .acquire("w1", Operation::Edit)
            .await
            .expect_err("busy");
        assert!(matches!(
            err,
            OperationLockError::WorkloadLocked { ref operation, .. } if operation == "unknown"
        ));
    }

    #[tokio::test]
    async fn scoped_releases_after_failure() {
        let locks = OperationLocks::new(LockManager::in_memory());

        let result: Result<(), OperationLockError> = locks
            .scoped("w1", Operation::Redeploy, || async {
                Err(OperationLockError::Lock(LockError::Store {
                    message: String::from("body failed"),
                }))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(locks.holder("w1").await.expect("inspect"), None);

        let value: Result<u8, OperationLockError> = locks
            .scoped("w1", Operation::Restart, || async { Ok(7) })
            .await;
        assert_eq!(value, Ok(7));
        assert_eq!(locks.holder("w1").await.expect("inspect"), None);
    }

    #[tokio::test]
    async fn handed_off_lock_is_released_by_task() {
        let locks = OperationLocks::new(LockManager::in_memory());
        let queue = TokioTaskQueue::current();
        let guard = locks.acquire("w1", Operation::Start).await.expect("lock");

        let observer = locks.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let task = locks
            .hand_off(guard, &queue, move |_| async move {
                let holder = observer.holder("w1").await.map_err(TaskError::failed)?;
                tx.send(holder).ok();
                Ok(())
            })
            .expect("hand off");

        let seen = rx.await.expect("holder").expect("lock held during task");
        assert_eq!(seen.operation, "start");
        assert_eq!(seen.task_id, Some(task.to_string()));

        queue.drain().await;
        assert_eq!(locks.holder("w1").await.expect("inspect"), None);
    }
}
