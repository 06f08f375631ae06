use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crossbeam_channel::Sender;
use log::warn;

use crate::{
    cancel::CancellationToken,
    pool::Shared,
    priority::{self, Priority},
    queue::TaskQueue,
    task::Task,
};

/// The current activity of a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for a task while watching for cancellation.
    Spinning,

    /// Running a task.
    Executing,

    /// Leaving the consumption loop.
    Terminating,

    /// The worker has exited and will never run another task.
    Stopped,
}

/// Why a worker left its consumption loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// The pool's cancellation token was observed.
    Graceful,

    /// The pool was torn down and told the worker to stop.
    Forced,

    /// The worker thread unwound outside of a task.
    Panicked,
}

/// A worker's [`WorkerState`], readable from other threads.
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(WorkerState::Spinning as u8))
    }

    pub(crate) fn get(&self) -> WorkerState {
        match self.0.load(Ordering::Acquire) {
            0 => WorkerState::Spinning,
            1 => WorkerState::Executing,
            2 => WorkerState::Terminating,
            _ => WorkerState::Stopped,
        }
    }

    fn set(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// A worker thread which belongs to a pool and executes tasks.
pub(crate) struct Worker {
    name: String,

    /// Queue of tasks shared with the pool and every other worker.
    queue: Arc<TaskQueue>,

    /// Externally owned stop signal.
    cancellation: CancellationToken,

    /// Raised by the pool during teardown.
    halt: CancellationToken,

    poll_interval: Duration,
    priority: Priority,
    state: Arc<StateCell>,
    shared: Arc<Shared>,

    /// Never sent on. Dropped together with the worker, which disconnects the
    /// pool's receiver and tells it this worker has exited.
    _exited: Sender<()>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        queue: Arc<TaskQueue>,
        cancellation: CancellationToken,
        halt: CancellationToken,
        poll_interval: Duration,
        priority: Priority,
        state: Arc<StateCell>,
        shared: Arc<Shared>,
        exited: Sender<()>,
    ) -> Self {
        Self {
            name,
            queue,
            cancellation,
            halt,
            poll_interval,
            priority,
            state,
            shared,
            _exited: exited,
        }
    }

    pub(crate) fn run(self) {
        if let Err(e) = priority::apply_to_current_thread(self.priority) {
            warn!(
                "worker {} could not apply priority {:?}: {}",
                self.name, self.priority, e
            );
        }

        self.shared.worker_started(&self.name);

        // Reports the stop even if the loop below unwinds.
        let mut exit = Exit {
            worker: &self,
            termination: Termination::Panicked,
        };

        // Main worker loop
        exit.termination = loop {
            self.state.set(WorkerState::Spinning);

            if self.cancellation.is_cancelled() {
                break Termination::Graceful;
            }

            if self.halt.is_cancelled() {
                break Termination::Forced;
            }

            if let Some(task) =
                self.queue
                    .try_dequeue(self.poll_interval, &self.cancellation, &self.halt)
            {
                self.execute(task);
            }
        };
    }

    fn execute(&self, task: Task) {
        self.state.set(WorkerState::Executing);

        let id = task.id();
        self.shared.task_started(&self.name, id);

        let start = Instant::now();
        let result = task.run();
        let elapsed = start.elapsed();

        match result {
            Ok(()) => self.shared.task_completed(&self.name, id, elapsed),
            Err(failure) => self.shared.task_failed(&self.name, &failure),
        }
    }
}

struct Exit<'a> {
    worker: &'a Worker,
    termination: Termination,
}

impl Drop for Exit<'_> {
    fn drop(&mut self) {
        let worker = self.worker;

        worker.state.set(WorkerState::Terminating);
        worker.shared.worker_stopped(&worker.name, self.termination);
        worker.state.set(WorkerState::Stopped);
    }
}
