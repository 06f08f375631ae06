use std::{any::Any, io};

use thiserror::Error;

/// Errors returned by the worker pool.
#[derive(Debug, Error)]
pub enum Error {
    /// The pool was configured with invalid arguments and was not created.
    #[error("invalid pool configuration: {0}")]
    InvalidConfiguration(String),

    /// A task was submitted after the pool's cancellation token was set or
    /// after the pool was shut down. The task was not queued.
    #[error("worker pool is closed")]
    PoolClosed,

    /// The operating system refused to spawn a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
}

/// Result type alias for worker pool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Describes a task that panicked while running on a worker.
///
/// Submission is fire-and-forget, so a failure is never returned to the
/// submitter. It is only reported through the log and
/// [`Listener::on_task_failed`](crate::Listener::on_task_failed).
#[derive(Debug, Error)]
#[error("task {task_id} panicked: {message}")]
pub struct TaskFailure {
    task_id: u64,
    message: String,
}

impl TaskFailure {
    pub(crate) fn from_panic(task_id: u64, payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            String::from("Box<dyn Any>")
        };

        Self { task_id, message }
    }

    /// The id of the task that failed.
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    /// The panic message, if the payload was a string.
    pub fn message(&self) -> &str {
        &self.message
    }
}
