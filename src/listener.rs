use std::{sync::Arc, time::Duration};

use crate::{error::TaskFailure, worker::Termination};

/// Receives lifecycle and task-timing notifications from a pool.
///
/// Every event is also written to the [`log`] facade; a listener is for code
/// that wants to observe the pool programmatically (metrics, tests). Methods
/// are called synchronously on the thread that produced the event, usually a
/// worker thread, so implementations should return quickly. A panic in a
/// listener method is caught and logged; the pool carries on as if the method
/// had returned.
///
/// All methods have empty default implementations.
pub trait Listener: Send + Sync {
    /// A worker thread started its consumption loop.
    fn on_worker_started(&self, _worker: &str) {}

    /// A worker took a task from the queue and is about to run it.
    fn on_task_started(&self, _worker: &str, _task_id: u64) {}

    /// A task returned normally.
    fn on_task_completed(&self, _worker: &str, _task_id: u64, _elapsed: Duration) {}

    /// A task panicked. The worker keeps running.
    fn on_task_failed(&self, _worker: &str, _failure: &TaskFailure) {}

    /// A worker left its consumption loop.
    fn on_worker_stopped(&self, _worker: &str, _termination: Termination) {}

    /// A worker did not stop within the shutdown grace period and was
    /// detached from the pool.
    fn on_worker_detached(&self, _worker: &str) {}

    /// The pool finished shutting down. `discarded` is the number of queued
    /// tasks that never ran.
    fn on_pool_destroyed(&self, _pool: &str, _discarded: usize) {}
}

impl<L: Listener + ?Sized> Listener for Arc<L> {
    fn on_worker_started(&self, worker: &str) {
        (**self).on_worker_started(worker)
    }

    fn on_task_started(&self, worker: &str, task_id: u64) {
        (**self).on_task_started(worker, task_id)
    }

    fn on_task_completed(&self, worker: &str, task_id: u64, elapsed: Duration) {
        (**self).on_task_completed(worker, task_id, elapsed)
    }

    fn on_task_failed(&self, worker: &str, failure: &TaskFailure) {
        (**self).on_task_failed(worker, failure)
    }

    fn on_worker_stopped(&self, worker: &str, termination: Termination) {
        (**self).on_worker_stopped(worker, termination)
    }

    fn on_worker_detached(&self, worker: &str) {
        (**self).on_worker_detached(worker)
    }

    fn on_pool_destroyed(&self, pool: &str, discarded: usize) {
        (**self).on_pool_destroyed(pool, discarded)
    }
}
