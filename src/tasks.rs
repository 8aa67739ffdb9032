//! Asynchronous task queue collaborator.
//!
//! Long-running work (reaping a deleted volume, finishing a workload
//! operation) is submitted as a job and identified by a [`TaskRef`]. An
//! optional error handler runs when the job fails. [`TokioTaskQueue`] runs
//! jobs on a tokio runtime; a distributed queue can implement [`TaskQueue`]
//! the same way.

use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error};
use uuid::Uuid;

/// Identifier of a submitted job.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TaskRef(Uuid);

impl TaskRef {
    /// Generates a fresh identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Failure reported by a job.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TaskError {
    /// The job ran and failed.
    #[error("task failed: {message}")]
    Failed {
        /// Failure description.
        message: String,
    },
}

impl TaskError {
    /// Wraps any displayable error.
    pub fn failed(err: impl fmt::Display) -> Self {
        Self::Failed {
            message: err.to_string(),
        }
    }
}

/// Future produced by a job.
pub type Job = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>>;

/// Job constructor; receives the reference the queue assigned to it.
pub type JobFn = Box<dyn FnOnce(TaskRef) -> Job + Send>;

/// Callback run when a job fails.
pub type ErrorHandler = Box<dyn FnOnce(TaskRef, &TaskError) + Send>;

/// Boxes an async closure into a [`JobFn`].
pub fn job<F, Fut>(f: F) -> JobFn
where
    F: FnOnce(TaskRef) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    Box::new(move |task| Box::pin(f(task)))
}

/// Queue accepting background jobs.
pub trait TaskQueue: Send + Sync {
    /// Schedules `job`, chaining `on_error` to run if it fails.
    fn submit(&self, job: JobFn, on_error: Option<ErrorHandler>) -> TaskRef;
}

/// Task queue that spawns each job on a tokio runtime.
#[derive(Debug)]
pub struct TokioTaskQueue {
    handle: Handle,
    running: Mutex<JoinSet<()>>,
}

impl TokioTaskQueue {
    /// Creates a queue spawning onto `handle`.
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            running: Mutex::new(JoinSet::new()),
        }
    }

    /// Creates a queue on the runtime of the caller.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Waits until every submitted job, including jobs submitted while
    /// waiting, has finished.
    pub async fn drain(&self) {
        loop {
            let mut batch =
                mem::take(&mut *self.running.lock().unwrap_or_else(PoisonError::into_inner));
            if batch.is_empty() {
                return;
            }
            while let Some(joined) = batch.join_next().await {
                log_join(joined);
            }
        }
    }

    /// Number of jobs still running. Finished jobs are collected first.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        reap_finished(&mut running);
        running.len()
    }
}

fn reap_finished(running: &mut JoinSet<()>) {
    while let Some(joined) = running.try_join_next() {
        log_join(joined);
    }
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        error!(error = %err, "task panicked or was cancelled");
    }
}

impl TaskQueue for TokioTaskQueue {
    fn submit(&self, job: JobFn, on_error: Option<ErrorHandler>) -> TaskRef {
        let task = TaskRef::generate();
        let future = job(task);
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        reap_finished(&mut running);
        running.spawn_on(
            async move {
                debug!(%task, "task started");
                match future.await {
                    Ok(()) => debug!(%task, "task finished"),
                    Err(err) => {
                        error!(%task, error = %err, "task failed");
                        if let Some(handler) = on_error {
                            handler(task, &err);
                        }
                    }
                }
            },
            &self.handle,
        );
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn runs_jobs_and_error_handlers() {
        let queue = TokioTaskQueue::current();
        let ran = Arc::new(AtomicUsize::new(0));
        let handled = Arc::new(AtomicUsize::new(0));

        let ran_ok = Arc::clone(&ran);
        queue.submit(
            job(move |_| async move {
                ran_ok.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            None,
        );

        let handled_count = Arc::clone(&handled);
        let failing = queue.submit(
            job(|_| async { Err(TaskError::failed("boom")) }),
            Some(Box::new(move |_: TaskRef, err: &TaskError| {
                assert_eq!(err, &TaskError::failed("boom"));
                handled_count.fetch_add(1, Ordering::SeqCst);
            })),
        );

        queue.drain().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(handled.load(Ordering::SeqCst), 1);
        assert_ne!(failing, TaskRef::generate());
    }

    #[tokio::test]
    async fn job_receives_its_own_reference() {
        let queue = TokioTaskQueue::current();
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        let task = queue.submit(
            job(move |me| async move {
                *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(me);
                Ok(())
            }),
            None,
        );
        queue.drain().await;
        assert_eq!(*seen.lock().unwrap_or_else(PoisonError::into_inner), Some(task));
    }

    #[tokio::test]
    async fn finished_jobs_are_not_retained() {
        let queue = TokioTaskQueue::current();
        for _ in 0..1000 {
            queue.submit(job(|_| async { Ok(()) }), None);
        }
        for _ in 0..100 {
            if queue.in_flight() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.in_flight(), 0);

        let gate = Arc::new(tokio::sync::Notify::new());
        let waiter = Arc::clone(&gate);
        queue.submit(
            job(move |_| async move {
                waiter.notified().await;
                Ok(())
            }),
            None,
        );
        assert_eq!(queue.in_flight(), 1);
        gate.notify_one();
        queue.drain().await;
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn panicking_job_is_collected_on_next_submit() {
        let queue = TokioTaskQueue::current();
        let explode = true;
        queue.submit(
            job(move |_| async move {
                assert!(!explode, "job blew up");
                Ok(())
            }),
            None,
        );
        tokio::task::yield_now().await;
        queue.submit(job(|_| async { Ok(()) }), None);
        queue.drain().await;
        assert_eq!(queue.in_flight(), 0);
    }
}
