use crate::{CompletionSignal, Error};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// A resource that can be closed asynchronously.
///
/// `close_async` must be idempotent, later calls return a signal for the same
/// eventual outcome. Resources without a notion of draining keep the default
/// `close_async_gracefully`, which is a plain `close_async`.
pub trait AsyncCloseable: Send + Sync {
    /// Close immediately, abandoning in-flight work.
    fn close_async(&self) -> CompletionSignal;

    /// Let in-flight work finish, then close.
    fn close_async_gracefully(&self) -> CompletionSignal {
        self.close_async()
    }
}

/// An [`AsyncCloseable`] that can also be observed for closure from any cause.
///
/// `on_close` returns the same signal every time, whether or not closing was
/// requested locally.
///
/// [`AsyncCloseable`]: trait.AsyncCloseable.html
pub trait ListenableAsyncCloseable: AsyncCloseable {
    /// Signal settling when the resource is closed.
    fn on_close(&self) -> CompletionSignal;
}

impl<T: AsyncCloseable + ?Sized> AsyncCloseable for Arc<T> {
    fn close_async(&self) -> CompletionSignal {
        (**self).close_async()
    }

    fn close_async_gracefully(&self) -> CompletionSignal {
        (**self).close_async_gracefully()
    }
}

impl<T: ListenableAsyncCloseable + ?Sized> ListenableAsyncCloseable for Arc<T> {
    fn on_close(&self) -> CompletionSignal {
        (**self).on_close()
    }
}

impl<T: AsyncCloseable + ?Sized> AsyncCloseable for Box<T> {
    fn close_async(&self) -> CompletionSignal {
        (**self).close_async()
    }

    fn close_async_gracefully(&self) -> CompletionSignal {
        (**self).close_async_gracefully()
    }
}

/// Closeable whose close operations only observe a signal.
///
/// Used to make a composite wait for something it does not close itself.
#[derive(Debug, Clone)]
pub struct AwaitSignal(pub CompletionSignal);

impl AsyncCloseable for AwaitSignal {
    fn close_async(&self) -> CompletionSignal {
        self.0.clone()
    }
}

impl ListenableAsyncCloseable for AwaitSignal {
    fn on_close(&self) -> CompletionSignal {
        self.0.clone()
    }
}

/// Run a close request so that a panicking participant can't stop a fan-out.
pub(crate) fn isolate<T, F>(what: &dyn std::fmt::Debug, f: F) -> Result<T, Error>
where
    F: FnOnce() -> T,
{
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|_| {
        warn!("Close of {:?} panicked", what);
        Error::Participant(format!("{:?} panicked while closing", what))
    })
}
