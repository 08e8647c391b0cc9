use crate::Error;
use futures_executor::ThreadPool;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Thread name prefix for pools built by [`Offload::thread_pool`].
///
/// [`Offload::thread_pool`]: enum.Offload.html#method.thread_pool
const POOL_NAME_PREFIX: &str = "connset-offload-";

/// A unit of work handed to an [`Executor`].
///
/// [`Executor`]: trait.Executor.html
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run a [`Task`] on some other execution context.
///
/// Implementations must not run the task inline on the calling thread, since
/// the caller is often an I/O thread reacting to a socket being closed.
///
/// [`Task`]: type.Task.html
pub trait Executor: Send + Sync {
    /// Schedule the task to run.
    fn execute(&self, task: Task);
}

impl Executor for ThreadPool {
    fn execute(&self, task: Task) {
        self.spawn_ok(async move { task() });
    }
}

/// Policy for where completion observers are delivered.
///
/// Close operations are frequently triggered from I/O callbacks. Delivering
/// observers through an executor keeps arbitrary downstream logic off those
/// threads. `Immediate` delivers inline and is used where a signal is already
/// offloaded once at an outer boundary.
#[derive(Clone)]
pub enum Offload {
    /// Deliver on whatever thread settles the signal (or subscribes late).
    Immediate,
    /// Deliver via an executor.
    Executor(Arc<dyn Executor>),
}

impl Offload {
    /// Inline delivery, no offloading.
    pub fn immediate() -> Self {
        Offload::Immediate
    }

    /// Deliver through the given executor.
    pub fn executor<E: Executor + 'static>(executor: E) -> Self {
        Offload::Executor(Arc::new(executor))
    }

    /// Deliver through a freshly built thread pool.
    pub fn thread_pool() -> io::Result<Self> {
        let pool = ThreadPool::builder()
            .name_prefix(POOL_NAME_PREFIX)
            .create()?;

        Ok(Offload::executor(pool))
    }

    /// Tests whether this policy delivers inline.
    pub fn is_immediate(&self) -> bool {
        matches!(self, Offload::Immediate)
    }

    pub(crate) fn dispatch(
        &self,
        observer: Box<dyn FnOnce(Result<(), Error>) + Send>,
        outcome: Result<(), Error>,
    ) {
        match self {
            Offload::Immediate => {
                // A panicking observer must not cost the others their delivery.
                if panic::catch_unwind(AssertUnwindSafe(|| observer(outcome))).is_err() {
                    warn!("Signal observer panicked");
                }
            }
            Offload::Executor(e) => e.execute(Box::new(move || observer(outcome))),
        }
    }
}

impl Default for Offload {
    fn default() -> Self {
        Offload::Immediate
    }
}

impl fmt::Debug for Offload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Offload::Immediate => write!(f, "Immediate"),
            Offload::Executor(_) => write!(f, "Executor"),
        }
    }
}
