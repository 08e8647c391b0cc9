use crate::{Error, Offload};
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const FAILED: u8 = 2;

type Observer = Box<dyn FnOnce(Result<(), Error>) + Send>;

/// One-shot, multicast, replayable completion notification.
///
/// A signal starts out pending and settles at most once, either completed or
/// failed. The first `complete()`/`fail()` wins, later calls are dropped.
///
/// Any number of observers may [`subscribe`], also after the signal settled, in
/// which case the outcome is replayed. Observers are delivered through the
/// [`Offload`] of the view they subscribed on, see [`publish_on`].
///
/// Cloning gives another handle to the same signal.
///
/// [`subscribe`]: #method.subscribe
/// [`publish_on`]: #method.publish_on
/// [`Offload`]: enum.Offload.html
#[derive(Clone)]
pub struct CompletionSignal {
    inner: Arc<Inner>,
    offload: Offload,
}

struct Inner {
    // Gate for exactly-once settling. Only the CAS winner touches `shared.outcome`.
    state: AtomicU8,
    shared: Mutex<Shared>,
}

#[derive(Default)]
struct Shared {
    outcome: Option<Result<(), Error>>,
    observers: Vec<(Observer, Offload)>,
    wakers: Vec<Waker>,
}

impl CompletionSignal {
    /// New pending signal delivering observers inline.
    pub fn new() -> Self {
        CompletionSignal {
            inner: Arc::new(Inner {
                state: AtomicU8::new(PENDING),
                shared: Mutex::new(Shared::default()),
            }),
            offload: Offload::Immediate,
        }
    }

    /// New signal that is already completed.
    pub fn completed() -> Self {
        let s = CompletionSignal::new();
        s.complete();
        s
    }

    /// New signal that has already failed.
    pub fn failed(error: Error) -> Self {
        let s = CompletionSignal::new();
        s.fail(error);
        s
    }

    /// Complete the signal. Returns `false` if it was already settled.
    pub fn complete(&self) -> bool {
        self.settle(Ok(()))
    }

    /// Fail the signal. Returns `false` if it was already settled.
    pub fn fail(&self, error: Error) -> bool {
        self.settle(Err(error))
    }

    /// Settle the signal with an outcome. Returns `false` if it was already settled.
    pub fn settle(&self, outcome: Result<(), Error>) -> bool {
        let to = if outcome.is_ok() { COMPLETED } else { FAILED };

        if self
            .inner
            .state
            .compare_exchange(PENDING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!("Signal already settled, dropping {:?}", outcome);
            return false;
        }

        let (observers, wakers) = {
            let mut lock = self.inner.shared.lock().unwrap();

            lock.outcome = Some(outcome.clone());

            (
                mem::take(&mut lock.observers),
                mem::take(&mut lock.wakers),
            )
        };

        trace!(
            "Signal settled ({}), observers: {}, wakers: {}",
            if to == COMPLETED { "completed" } else { "failed" },
            observers.len(),
            wakers.len()
        );

        // Deliver outside the lock, observers may subscribe to this signal again.
        // Inline observers run before waiting tasks are woken.
        for (observer, offload) in observers {
            offload.dispatch(observer, outcome.clone());
        }

        for w in wakers {
            w.wake();
        }

        true
    }

    /// Register an observer that is invoked exactly once with the outcome.
    ///
    /// If the signal is already settled, the outcome is replayed straight away
    /// (through this view's offloading policy).
    pub fn subscribe<F>(&self, observer: F)
    where
        F: FnOnce(Result<(), Error>) + Send + 'static,
    {
        let mut lock = self.inner.shared.lock().unwrap();

        if let Some(outcome) = lock.outcome.clone() {
            drop(lock);
            self.offload.dispatch(Box::new(observer), outcome);
        } else {
            lock.observers.push((Box::new(observer), self.offload.clone()));
        }
    }

    /// A view of the same signal whose observers are delivered on `offload`.
    ///
    /// Settling either view settles both.
    pub fn publish_on(&self, offload: Offload) -> CompletionSignal {
        CompletionSignal {
            inner: self.inner.clone(),
            offload,
        }
    }

    /// Offloading policy of this view.
    pub fn offload(&self) -> &Offload {
        &self.offload
    }

    /// Tests whether the signal has settled.
    pub fn is_done(&self) -> bool {
        // The state flips before the outcome is stored, only report done once
        // the outcome is observable.
        self.inner.state.load(Ordering::Acquire) != PENDING
            && self.inner.shared.lock().unwrap().outcome.is_some()
    }

    /// The outcome, if settled.
    pub fn outcome(&self) -> Option<Result<(), Error>> {
        self.inner.shared.lock().unwrap().outcome.clone()
    }

    /// Tests whether `other` is a view of the same underlying signal.
    pub fn same_signal(&self, other: &CompletionSignal) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Future resolving to the outcome.
    pub fn wait(&self) -> SignalFuture {
        SignalFuture(self.inner.clone())
    }

    /// Block the current thread until settled.
    ///
    /// Meant for the outer edge of a program (a `main` or a test). Never call
    /// this from inside an async task.
    pub fn block(&self) -> Result<(), Error> {
        futures_executor::block_on(self.wait())
    }

    /// Merge signals into one that settles once all of them have settled.
    ///
    /// Completes if every input completes. Otherwise fails with the first failure
    /// observed, while still waiting for the remaining inputs. Inputs are observed
    /// without offloading, offload the returned signal once if needed.
    pub fn merge_all<I>(signals: I) -> CompletionSignal
    where
        I: IntoIterator<Item = CompletionSignal>,
    {
        let signals: Vec<_> = signals.into_iter().collect();
        let merged = CompletionSignal::new();

        if signals.is_empty() {
            merged.complete();
            return merged;
        }

        let merge = Arc::new(Merge {
            remaining: AtomicUsize::new(signals.len()),
            first_error: Mutex::new(None),
        });

        for s in signals {
            let merged = merged.clone();
            let merge = merge.clone();

            s.publish_on(Offload::Immediate).subscribe(move |outcome| {
                if let Err(e) = outcome {
                    let mut first = merge.first_error.lock().unwrap();
                    if first.is_none() {
                        *first = Some(e);
                    } else {
                        debug!("Suppressed additional close failure: {}", e);
                    }
                }

                if merge.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let first = merge.first_error.lock().unwrap().take();
                    match first {
                        Some(e) => merged.fail(e),
                        None => merged.complete(),
                    };
                }
            });
        }

        merged
    }
}

struct Merge {
    remaining: AtomicUsize,
    first_error: Mutex<Option<Error>>,
}

impl Default for CompletionSignal {
    fn default() -> Self {
        CompletionSignal::new()
    }
}

/// Future for the outcome of a [`CompletionSignal`].
///
/// [`CompletionSignal`]: struct.CompletionSignal.html
pub struct SignalFuture(Arc<Inner>);

impl Future for SignalFuture {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let mut lock = this.0.shared.lock().unwrap();

        if let Some(outcome) = &lock.outcome {
            return outcome.clone().into();
        }

        // Repeated polls of the same task keep a single waker.
        if !lock.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            lock.wakers.push(cx.waker().clone());
        }

        Poll::Pending
    }
}

impl fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.state.load(Ordering::Acquire) {
            PENDING => "Pending",
            COMPLETED => "Completed",
            _ => "Failed",
        };
        f.debug_struct("CompletionSignal")
            .field("state", &state)
            .field("offload", &self.offload)
            .finish()
    }
}

impl fmt::Debug for SignalFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignalFuture")
    }
}
