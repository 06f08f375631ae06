//! Implementation of the worker pool itself.

use std::{
    fmt,
    mem,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
        Mutex,
        PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use log::{debug, error, trace, warn};
use once_cell::sync::Lazy;

use crate::{
    cancel::CancellationToken,
    error::{Error, Result, TaskFailure},
    listener::Listener,
    priority::Priority,
    queue::TaskQueue,
    task::{self, Task},
    worker::{StateCell, Termination, Worker, WorkerState},
};

#[cfg(target_has_atomic = "64")]
type AtomicCounter = std::sync::atomic::AtomicU64;

#[cfg(not(target_has_atomic = "64"))]
type AtomicCounter = std::sync::atomic::AtomicU32;

/// How long an idle worker waits for a task before re-checking whether it
/// should stop.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Teardown budget per worker.
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

static CORE_COUNT: Lazy<usize> = Lazy::new(|| num_cpus::get().max(1));

static POOL_COUNT: AtomicUsize = AtomicUsize::new(0);

/// A builder for constructing a customized [`WorkerPool`].
///
/// # Examples
///
/// ```
/// use fixedpool::{CancellationToken, WorkerPool};
///
/// let token = CancellationToken::new();
/// let pool = WorkerPool::builder()
///     .name("my-pool")
///     .size(2)
///     .build(token.clone())
///     .unwrap();
///
/// assert_eq!(pool.workers(), 2);
/// # token.cancel();
/// ```
pub struct Builder {
    name: Option<String>,
    size: Option<usize>,
    priority: Priority,
    stack_size: Option<usize>,
    poll_interval: Duration,
    shutdown_grace: Duration,
    listener: Option<Arc<dyn Listener>>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            name: None,
            size: None,
            priority: Priority::default(),
            stack_size: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            listener: None,
        }
    }
}

impl Builder {
    /// Set a display name for the pool. Worker threads are named
    /// `<name>-worker-<i>`.
    ///
    /// The name must not contain null bytes (`\0`).
    pub fn name<T: Into<String>>(mut self, name: T) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the number of worker threads. Must be non-zero.
    ///
    /// If not set, one worker per available CPU core is started.
    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    /// Set a scheduling priority hint for the worker threads.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the size of the stack (in bytes) for worker threads.
    ///
    /// The actual stack size may be greater than this value if the platform
    /// enforces a larger minimum stack size.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Set the longest time an idle worker waits for a task before checking
    /// whether it should stop. Must be non-zero.
    ///
    /// Cancellation wakes idle workers immediately, so this only bounds how
    /// long a missed wakeup can go unnoticed. Defaults to 100ms.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set how long teardown waits for each worker to exit before detaching
    /// it. The whole teardown is bounded by this times the number of workers.
    /// Defaults to 100ms.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set a listener to be notified of worker and task events.
    pub fn listener<L: Listener + 'static>(mut self, listener: L) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    /// Create a pool according to this configuration, observing the given
    /// cancellation token.
    ///
    /// All worker threads are started before this returns.
    pub fn build(self, cancellation: CancellationToken) -> Result<WorkerPool> {
        let size = self.size.unwrap_or(*CORE_COUNT);

        if size == 0 {
            return Err(Error::InvalidConfiguration(
                "worker count must be at least 1".into(),
            ));
        }

        if self.poll_interval == Duration::ZERO {
            return Err(Error::InvalidConfiguration(
                "poll interval must be non-zero".into(),
            ));
        }

        let name = match self.name {
            Some(name) if name.as_bytes().contains(&0) => {
                return Err(Error::InvalidConfiguration(
                    "pool name must not contain null bytes".into(),
                ));
            }
            Some(name) => name,
            None => format!("pool-{:x}", POOL_COUNT.fetch_add(1, Ordering::Relaxed)),
        };

        let pool = WorkerPool {
            queue: Arc::new(TaskQueue::new()),
            cancellation,
            halt: CancellationToken::new(),
            closed: AtomicBool::new(false),
            priority: self.priority,
            shutdown_grace: self.shutdown_grace,
            next_task_id: AtomicCounter::new(0),
            states: Vec::with_capacity(size),
            handles: Mutex::new(Vec::with_capacity(size)),
            shared: Arc::new(Shared {
                pool_name: name,
                running_tasks_count: Default::default(),
                completed_tasks_count: Default::default(),
                failed_tasks_count: Default::default(),
                listener: self.listener,
            }),
        };

        pool.start(size, self.stack_size, self.poll_interval)
    }
}

/// A fixed-size pool of worker threads draining a shared task queue.
///
/// Workers are started when the pool is created and keep taking tasks from
/// the queue, in submission order, until the pool's [`CancellationToken`] is
/// cancelled or the pool is shut down. Tasks are fire-and-forget: submission
/// returns as soon as the task is queued, and nothing is reported back to the
/// submitter.
///
/// # Shutdown
///
/// Cancelling the token stops the pool gracefully: idle workers exit
/// immediately, busy workers exit once their current task returns. Queued
/// tasks that no worker picked up are not run.
///
/// [`shutdown`](WorkerPool::shutdown), which also runs when the pool is
/// dropped, closes the pool to new submissions, tells every worker to stop,
/// and waits a bounded grace period per worker. A worker still busy after its
/// grace period is detached and left to finish on its own.
///
/// # Panics
///
/// A task that panics is reported as a failure and does not affect its
/// worker or the pool.
pub struct WorkerPool {
    queue: Arc<TaskQueue>,
    cancellation: CancellationToken,

    /// Raised at teardown to stop workers regardless of the external token.
    halt: CancellationToken,

    closed: AtomicBool,
    priority: Priority,
    shutdown_grace: Duration,
    next_task_id: AtomicCounter,
    states: Vec<Arc<StateCell>>,

    /// Only touched at construction and teardown.
    handles: Mutex<Vec<WorkerHandle>>,

    shared: Arc<Shared>,
}

struct WorkerHandle {
    name: String,
    exited: Receiver<()>,
    thread: JoinHandle<()>,
}

impl WorkerPool {
    /// Create a pool with `max_workers` threads and default settings.
    ///
    /// # Examples
    ///
    /// ```
    /// use fixedpool::{CancellationToken, WorkerPool};
    ///
    /// let token = CancellationToken::new();
    /// let pool = WorkerPool::new(4, token.clone()).unwrap();
    ///
    /// pool.submit(|| println!("hello from the pool")).unwrap();
    ///
    /// token.cancel();
    /// assert!(pool.submit(|| {}).is_err());
    /// ```
    pub fn new(max_workers: usize, cancellation: CancellationToken) -> Result<Self> {
        Self::builder().size(max_workers).build(cancellation)
    }

    /// Get a builder for creating a customized pool.
    #[inline]
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// The pool's display name.
    pub fn name(&self) -> &str {
        &self.shared.pool_name
    }

    /// The scheduling priority hint the pool was created with.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// The token this pool observes.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Get the number of worker threads the pool was created with.
    pub fn workers(&self) -> usize {
        self.states.len()
    }

    /// Get the current state of every worker, in worker index order.
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.states.iter().map(|state| state.get()).collect()
    }

    /// Get the number of tasks queued for execution, but not yet started.
    ///
    /// Note that the number returned may become immediately outdated after
    /// invocation.
    #[inline]
    pub fn queued_tasks(&self) -> usize {
        self.queue.len()
    }

    /// Get the number of tasks currently running.
    ///
    /// Note that the number returned may become immediately outdated after
    /// invocation.
    #[inline]
    pub fn running_tasks(&self) -> usize {
        self.shared.running_tasks_count.load(Ordering::Relaxed)
    }

    /// Get the number of tasks that returned normally since the pool was
    /// created.
    #[inline]
    #[allow(clippy::useless_conversion)]
    pub fn completed_tasks(&self) -> u64 {
        self.shared.completed_tasks_count.load(Ordering::Relaxed).into()
    }

    /// Get the number of tasks that have panicked since the pool was created.
    #[inline]
    #[allow(clippy::useless_conversion)]
    pub fn failed_tasks(&self) -> u64 {
        self.shared.failed_tasks_count.load(Ordering::Relaxed).into()
    }

    /// Whether [`shutdown`](WorkerPool::shutdown) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Submit a closure to be executed by one of the workers.
    ///
    /// Fails with [`Error::PoolClosed`] if the cancellation token is set or
    /// the pool has been shut down.
    pub fn submit<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Box::new(work))
    }

    /// Submit a closure together with the parameter it will be called with.
    ///
    /// # Examples
    ///
    /// ```
    /// use crossbeam_channel::unbounded;
    /// use fixedpool::{CancellationToken, WorkerPool};
    ///
    /// let token = CancellationToken::new();
    /// let pool = WorkerPool::new(2, token.clone()).unwrap();
    /// let (tx, rx) = unbounded();
    ///
    /// pool.submit_with(String::from("Message-1"), move |msg| {
    ///     tx.send(msg.len()).unwrap();
    /// })
    /// .unwrap();
    ///
    /// assert_eq!(rx.recv().unwrap(), 9);
    /// # token.cancel();
    /// ```
    pub fn submit_with<P, F>(&self, parameter: P, work: F) -> Result<()>
    where
        P: Send + 'static,
        F: FnOnce(P) + Send + 'static,
    {
        self.enqueue(task::bind(parameter, work))
    }

    fn accepting(&self) -> bool {
        !self.cancellation.is_cancelled() && !self.is_closed()
    }

    fn enqueue(&self, work: Box<dyn FnOnce() + Send + 'static>) -> Result<()> {
        if !self.accepting() {
            return Err(Error::PoolClosed);
        }

        let permit = self.queue.gate().acquire();

        // Checked again under the gate: teardown closes the pool while holding
        // it, so nothing can be queued after the queue is drained.
        if !self.accepting() {
            return Err(Error::PoolClosed);
        }

        #[allow(clippy::useless_conversion)]
        let id: u64 = self.next_task_id.fetch_add(1, Ordering::Relaxed).into();
        self.queue.push(&permit, Task::new(id, work));

        Ok(())
    }

    /// Shut down the pool.
    ///
    /// New submissions are rejected from this point on. Every worker is told
    /// to stop once its current task (if any) returns. The whole call takes at
    /// most the shutdown grace period times the number of workers: waiting
    /// for the queue gate and for each worker in turn all draw on that one
    /// budget, and no single wait exceeds the grace period. Workers that do
    /// not stop in time are detached. Tasks still in the queue are discarded.
    ///
    /// Returns `true` if every worker stopped within its grace period. Calling
    /// this more than once is harmless; later calls return `true` immediately.
    pub fn shutdown(&self) -> bool {
        // The whole teardown, including waiting for the gate, shares one
        // budget of a grace period per worker.
        let budget = self.shutdown_grace * self.workers().max(1) as u32;
        let deadline = Instant::now() + budget;

        match self.queue.gate().try_acquire(self.shutdown_grace) {
            Some(permit) => {
                let already_closed = self.closed.swap(true, Ordering::AcqRel);
                permit.release();

                if already_closed {
                    return true;
                }
            }
            None => {
                warn!(
                    "pool {} could not acquire its queue within {:?}, closing anyway",
                    self.name(),
                    self.shutdown_grace
                );

                if self.closed.swap(true, Ordering::AcqRel) {
                    return true;
                }
            }
        }

        let handles = mem::take(
            &mut *self
                .handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let stopped = self.stop_workers(handles, deadline);

        let discarded = self.queue.drain();
        if discarded > 0 {
            warn!(
                "pool {} discarded {} queued tasks at shutdown",
                self.name(),
                discarded
            );
        }

        self.shared.pool_destroyed(discarded);

        stopped
    }

    fn start(
        mut self,
        size: usize,
        stack_size: Option<usize>,
        poll_interval: Duration,
    ) -> Result<Self> {
        debug!(
            "starting pool {} with {} workers (priority hint {:?})",
            self.name(),
            size,
            self.priority
        );

        for i in 0..size {
            if let Err(e) = self.spawn_worker(i, stack_size, poll_interval) {
                error!("pool {} failed to spawn worker {}: {}", self.name(), i, e);

                // The caller never sees this pool, so stop the workers that
                // did start before returning.
                self.shutdown();

                return Err(e);
            }
        }

        Ok(self)
    }

    /// Spawn a worker thread and register its handle.
    fn spawn_worker(
        &mut self,
        index: usize,
        stack_size: Option<usize>,
        poll_interval: Duration,
    ) -> Result<()> {
        let name = format!("{}-worker-{}", self.name(), index);
        let state = Arc::new(StateCell::new());
        let (exited_tx, exited_rx) = bounded(0);

        // Configure the thread based on the pool configuration.
        let mut builder = thread::Builder::new().name(name.clone());

        if let Some(size) = stack_size {
            builder = builder.stack_size(size);
        }

        let worker = Worker::new(
            name.clone(),
            self.queue.clone(),
            self.cancellation.clone(),
            self.halt.clone(),
            poll_interval,
            self.priority,
            state.clone(),
            self.shared.clone(),
            exited_tx,
        );

        let thread = builder.spawn(move || worker.run())?;

        self.states.push(state);
        self.handles
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .push(WorkerHandle {
                name,
                exited: exited_rx,
                thread,
            });

        Ok(())
    }

    /// Halt every worker and wait for each one in turn, detaching those that
    /// outlive their grace period or the overall deadline.
    fn stop_workers(&self, handles: Vec<WorkerHandle>, deadline: Instant) -> bool {
        self.halt.cancel();

        let mut all_stopped = true;

        for handle in handles {
            let timeout = deadline
                .saturating_duration_since(Instant::now())
                .min(self.shutdown_grace);

            match handle.exited.recv_timeout(timeout) {
                Err(RecvTimeoutError::Timeout) => {
                    all_stopped = false;
                    self.shared.worker_detached(&handle.name, timeout);
                }
                _ => {
                    // The worker has dropped its end of the channel, so the
                    // thread is about to return.
                    if handle.thread.join().is_err() {
                        error!("worker {} panicked outside of a task", handle.name);
                    }
                }
            }
        }

        all_stopped
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name())
            .field("workers", &self.workers())
            .field("queued_tasks", &self.queued_tasks())
            .field("running_tasks", &self.running_tasks())
            .field("completed_tasks", &self.completed_tasks())
            .field("failed_tasks", &self.failed_tasks())
            .finish()
    }
}

/// Pool state shared by the owner and the worker threads.
///
/// Every event goes through here so it is counted, logged and forwarded to
/// the listener in one place.
pub(crate) struct Shared {
    pool_name: String,
    running_tasks_count: AtomicUsize,
    completed_tasks_count: AtomicCounter,
    failed_tasks_count: AtomicCounter,
    listener: Option<Arc<dyn Listener>>,
}

impl Shared {
    /// Forward an event to the listener, if any. A panicking listener is
    /// logged and otherwise ignored so it cannot take a worker down with it.
    fn notify<F>(&self, event: &str, f: F)
    where
        F: FnOnce(&dyn Listener),
    {
        if let Some(listener) = &self.listener {
            if catch_unwind(AssertUnwindSafe(|| f(&**listener))).is_err() {
                error!(
                    "listener of pool {} panicked while handling {}",
                    self.pool_name, event
                );
            }
        }
    }

    pub(crate) fn worker_started(&self, worker: &str) {
        debug!("worker {} started", worker);
        self.notify("worker started", |l| l.on_worker_started(worker));
    }

    pub(crate) fn task_started(&self, worker: &str, task_id: u64) {
        self.running_tasks_count.fetch_add(1, Ordering::Relaxed);
        trace!("worker {} running task {}", worker, task_id);
        self.notify("task started", |l| l.on_task_started(worker, task_id));
    }

    pub(crate) fn task_completed(&self, worker: &str, task_id: u64, elapsed: Duration) {
        self.running_tasks_count.fetch_sub(1, Ordering::Relaxed);
        self.completed_tasks_count.fetch_add(1, Ordering::Relaxed);
        trace!("worker {} completed task {} in {:?}", worker, task_id, elapsed);
        self.notify("task completed", |l| {
            l.on_task_completed(worker, task_id, elapsed)
        });
    }

    pub(crate) fn task_failed(&self, worker: &str, failure: &TaskFailure) {
        self.running_tasks_count.fetch_sub(1, Ordering::Relaxed);
        self.failed_tasks_count.fetch_add(1, Ordering::Relaxed);
        error!("worker {}: {}", worker, failure);
        self.notify("task failed", |l| l.on_task_failed(worker, failure));
    }

    pub(crate) fn worker_stopped(&self, worker: &str, termination: Termination) {
        match termination {
            Termination::Graceful => debug!("worker {} stopped after cancellation", worker),
            Termination::Forced => {
                debug!("worker {} stopped by pool {} shutdown", worker, self.pool_name)
            }
            Termination::Panicked => error!("worker {} unwound outside of a task", worker),
        }

        self.notify("worker stopped", |l| l.on_worker_stopped(worker, termination));
    }

    fn worker_detached(&self, worker: &str, waited: Duration) {
        warn!("worker {} did not stop within {:?}, detaching it", worker, waited);
        self.notify("worker detached", |l| l.on_worker_detached(worker));
    }

    fn pool_destroyed(&self, discarded: usize) {
        debug!("pool {} destroyed", self.pool_name);
        self.notify("pool destroyed", |l| {
            l.on_pool_destroyed(&self.pool_name, discarded)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_closes_pool_when_gate_is_held() {
        let grace = Duration::from_millis(50);
        let pool = WorkerPool::builder()
            .size(2)
            .shutdown_grace(grace)
            .build(CancellationToken::new())
            .unwrap();

        let permit = pool.queue.gate().acquire();
        let start = Instant::now();

        pool.shutdown();

        // Waiting for the gate counts against the same budget as the workers.
        assert!(start.elapsed() < grace * 2 + Duration::from_millis(100));
        assert!(pool.is_closed());
        assert!(matches!(pool.submit(|| {}), Err(Error::PoolClosed)));

        permit.release();
    }
}
