//! The shared task queue and the gate that arbitrates access to it.

use std::time::Duration;

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};

use crate::{cancel::CancellationToken, task::Task};

/// A single-holder gate.
///
/// The gate is a binary semaphore built from a channel with capacity one that
/// holds a single permit. Acquiring takes the permit out, and dropping the
/// returned [`Permit`] puts it back, so every exit path releases the gate.
pub(crate) struct Gate {
    release: Sender<()>,
    acquire: Receiver<()>,
}

impl Gate {
    pub(crate) fn new() -> Self {
        let (release, acquire) = bounded(1);

        // Cannot fail: the channel is empty and we hold the receiver.
        release.send(()).unwrap();

        Self { release, acquire }
    }

    /// Wait until the gate is available and take it.
    pub(crate) fn acquire(&self) -> Permit<'_> {
        // Cannot fail because we hold a reference to both ends of the channel
        // and it cannot be closed here.
        self.acquire.recv().unwrap();

        Permit { gate: self }
    }

    /// Wait up to `timeout` for the gate to become available.
    ///
    /// Returns `None` if the gate is still held by someone else when the
    /// timeout passes.
    pub(crate) fn try_acquire(&self, timeout: Duration) -> Option<Permit<'_>> {
        self.acquire
            .recv_timeout(timeout)
            .ok()
            .map(|_| Permit { gate: self })
    }
}

/// Proof that the holder currently owns the [`Gate`].
pub(crate) struct Permit<'a> {
    gate: &'a Gate,
}

impl Permit<'_> {
    /// Release the gate now instead of at the end of the scope.
    #[inline]
    pub(crate) fn release(self) {}
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        // The only permit is the one we hold, so there is always room.
        let _ = self.gate.release.try_send(());
    }
}

/// An unbounded FIFO of pending tasks shared by submitters and workers.
///
/// Tasks travel through an MPMC channel, which hands each task to exactly one
/// receiver in insertion order. Submitters additionally serialize through the
/// [`Gate`] so that the pool can check its own state and enqueue as one step.
pub(crate) struct TaskQueue {
    gate: Gate,
    sender: Sender<Task>,
    receiver: Receiver<Task>,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = unbounded();

        Self {
            gate: Gate::new(),
            sender,
            receiver,
        }
    }

    #[inline]
    pub(crate) fn gate(&self) -> &Gate {
        &self.gate
    }

    /// Append a task, waiting for the gate as long as needed.
    #[cfg(test)]
    pub(crate) fn enqueue(&self, task: Task) {
        let permit = self.gate.acquire();
        self.push(&permit, task);
    }

    /// Append a task while the caller already holds the gate.
    pub(crate) fn push(&self, _permit: &Permit<'_>, task: Task) {
        // Cannot fail because we hold a reference to both the channel sender
        // and receiver and it cannot be closed here.
        self.sender.send(task).unwrap();
    }

    /// Take the task at the head of the queue.
    ///
    /// Waits at most `poll_interval` for a task to arrive, returning early
    /// with `None` if either token is cancelled in the meantime. Never takes a
    /// task if either token is already cancelled on entry.
    pub(crate) fn try_dequeue(
        &self,
        poll_interval: Duration,
        cancellation: &CancellationToken,
        halt: &CancellationToken,
    ) -> Option<Task> {
        if cancellation.is_cancelled() || halt.is_cancelled() {
            return None;
        }

        select! {
            recv(self.receiver) -> task => task.ok(),
            recv(cancellation.signal()) -> _ => None,
            recv(halt.signal()) -> _ => None,
            default(poll_interval) => None,
        }
    }

    /// Number of tasks waiting in the queue.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Drop every task still waiting in the queue, returning how many were
    /// discarded.
    pub(crate) fn drain(&self) -> usize {
        self.receiver.try_iter().count()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
    };

    use super::*;

    fn noop(id: u64) -> Task {
        Task::new(id, Box::new(|| {}))
    }

    #[test]
    fn gate_is_exclusive() {
        let gate = Gate::new();

        let permit = gate.acquire();
        assert!(gate.try_acquire(Duration::from_millis(10)).is_none());

        permit.release();
        assert!(gate.try_acquire(Duration::from_millis(10)).is_some());
    }

    #[test]
    fn gate_released_on_drop() {
        let gate = Gate::new();

        {
            let _permit = gate.acquire();
        }

        let _permit = gate.acquire();
    }

    #[test]
    fn gate_serializes_threads() {
        let gate = Arc::new(Gate::new());
        let inside = Arc::new(AtomicUsize::new(0));

        let handles = (0..4)
            .map(|_| {
                let gate = gate.clone();
                let inside = inside.clone();

                thread::spawn(move || {
                    for _ in 0..100 {
                        let _permit = gate.acquire();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn dequeue_is_fifo() {
        let queue = TaskQueue::new();
        let token = CancellationToken::new();
        let halt = CancellationToken::new();

        for id in 0..10 {
            queue.enqueue(noop(id));
        }
        assert_eq!(queue.len(), 10);

        for id in 0..10 {
            let task = queue
                .try_dequeue(Duration::from_millis(10), &token, &halt)
                .unwrap();
            assert_eq!(task.id(), id);
        }

        assert!(queue
            .try_dequeue(Duration::from_millis(10), &token, &halt)
            .is_none());
    }

    #[test]
    fn dequeue_refuses_after_cancel() {
        let queue = TaskQueue::new();
        let token = CancellationToken::new();
        let halt = CancellationToken::new();

        queue.enqueue(noop(0));
        token.cancel();

        assert!(queue
            .try_dequeue(Duration::from_millis(10), &token, &halt)
            .is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn dequeue_wakes_on_halt() {
        let queue = Arc::new(TaskQueue::new());
        let token = CancellationToken::new();
        let halt = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let halt = halt.clone();

            thread::spawn(move || {
                let start = std::time::Instant::now();
                let task = queue.try_dequeue(Duration::from_secs(10), &token, &halt);
                (task.is_none(), start.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(20));
        halt.cancel();

        let (empty, elapsed) = waiter.join().unwrap();
        assert!(empty);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn drain_discards_pending() {
        let queue = TaskQueue::new();

        for id in 0..3 {
            queue.enqueue(noop(id));
        }

        assert_eq!(queue.drain(), 3);
        assert_eq!(queue.len(), 0);
    }
}
