use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
};

use crate::error::TaskFailure;

type Work = Box<dyn FnOnce() + Send + 'static>;

/// A unit of work waiting in the queue.
///
/// Tasks are immutable once created and are consumed by [`Task::run`], so a
/// task can only ever be executed once.
pub(crate) struct Task {
    id: u64,
    work: Work,
}

impl Task {
    pub(crate) fn new(id: u64, work: Work) -> Self {
        Self { id, work }
    }

    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Run the task on the current thread.
    ///
    /// A panic raised by the work function is caught and returned as a
    /// [`TaskFailure`] instead of unwinding into the caller.
    pub(crate) fn run(self) -> Result<(), TaskFailure> {
        let Task { id, work } = self;

        catch_unwind(AssertUnwindSafe(work)).map_err(|payload| TaskFailure::from_panic(id, payload))
    }
}

/// Box a work function together with the parameter it will be called with.
pub(crate) fn bind<P, F>(parameter: P, work: F) -> Work
where
    P: Send + 'static,
    F: FnOnce(P) + Send + 'static,
{
    Box::new(move || work(parameter))
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("id", &self.id).finish()
    }
}
