use crate::closeable::isolate;
use crate::{AsyncCloseable, CompletionSignal, Error, ListenableAsyncCloseable};
use std::collections::VecDeque;
use std::fmt;
use std::iter::FromIterator;
use std::mem;
use std::sync::Mutex;

/// Aggregates closeable participants into one.
///
/// Closing the composite issues the close request to every participant at once
/// and settles a single signal when all of them are closed. A failing (or
/// panicking) participant never keeps the others from receiving the request;
/// the first failure becomes the aggregate outcome.
///
/// The composite owns no participant, it only orchestrates. It closes once,
/// repeated close calls return the same signal without reissuing requests.
///
/// ```
/// use connset::{AsyncCloseable, AwaitSignal, CompletionSignal, CompositeCloser};
///
/// let a = CompletionSignal::new();
/// let b = CompletionSignal::new();
///
/// let closer = CompositeCloser::new();
/// closer.append(AwaitSignal(a.clone())).unwrap();
/// closer.append(AwaitSignal(b.clone())).unwrap();
///
/// let closed = closer.close_async();
/// a.complete();
/// assert!(!closed.is_done());
/// b.complete();
/// assert!(closed.outcome().unwrap().is_ok());
/// ```
pub struct CompositeCloser {
    members: Mutex<Members>,
    closed: CompletionSignal,
}

#[derive(Default)]
struct Members {
    closing: bool,
    participants: VecDeque<Box<dyn AsyncCloseable>>,
}

impl CompositeCloser {
    /// New empty composite.
    pub fn new() -> Self {
        CompositeCloser {
            members: Mutex::new(Members::default()),
            closed: CompletionSignal::new(),
        }
    }

    /// Add a participant at the end of the issue order.
    ///
    /// Errors with `Error::IllegalState` if closing has already begun.
    pub fn append<R: AsyncCloseable + 'static>(&self, resource: R) -> Result<(), Error> {
        self.add(Box::new(resource), false)
    }

    /// Add a participant at the front of the issue order.
    ///
    /// The order only decides in which order close requests are issued, they
    /// still run concurrently.
    pub fn prepend<R: AsyncCloseable + 'static>(&self, resource: R) -> Result<(), Error> {
        self.add(Box::new(resource), true)
    }

    /// Append all participants, stopping at the first error.
    pub fn append_all<I, R>(&self, resources: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = R>,
        R: AsyncCloseable + 'static,
    {
        for r in resources {
            self.append(r)?;
        }
        Ok(())
    }

    fn add(&self, resource: Box<dyn AsyncCloseable>, front: bool) -> Result<(), Error> {
        let mut lock = self.members.lock().unwrap();

        if lock.closing {
            return Err(Error::IllegalState(
                "Append to a composite that is already closing".into(),
            ));
        }

        if front {
            lock.participants.push_front(resource);
        } else {
            lock.participants.push_back(resource);
        }

        Ok(())
    }

    /// Number of participants not yet handed a close request.
    pub fn len(&self) -> usize {
        self.members.lock().unwrap().participants.len()
    }

    /// Tests whether there are no participants waiting for a close request.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tests whether closing has begun.
    pub fn is_closing(&self) -> bool {
        self.members.lock().unwrap().closing
    }

    /// Close and block the current thread until every participant is closed.
    pub fn close(&self) -> Result<(), Error> {
        self.close_async().block()
    }

    /// Gracefully close and block the current thread until every participant is closed.
    pub fn close_gracefully(&self) -> Result<(), Error> {
        self.close_async_gracefully().block()
    }

    fn close_with(&self, graceful: bool) -> CompletionSignal {
        let participants = {
            let mut lock = self.members.lock().unwrap();

            if lock.closing {
                return self.closed.clone();
            }
            lock.closing = true;

            mem::take(&mut lock.participants)
        };

        debug!(
            "Composite closing {} participants (graceful: {})",
            participants.len(),
            graceful
        );

        // No lock held from here, participants may call back into anything.
        let signals: Vec<_> = participants
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let issued = isolate(&format_args!("participant #{}", i), || {
                    if graceful {
                        p.close_async_gracefully()
                    } else {
                        p.close_async()
                    }
                });

                issued.unwrap_or_else(CompletionSignal::failed)
            })
            .collect();

        let closed = self.closed.clone();

        CompletionSignal::merge_all(signals).subscribe(move |outcome| {
            if let Err(e) = &outcome {
                warn!("Composite close failed: {}", e);
            }
            closed.settle(outcome);
        });

        self.closed.clone()
    }
}

impl AsyncCloseable for CompositeCloser {
    fn close_async(&self) -> CompletionSignal {
        self.close_with(false)
    }

    fn close_async_gracefully(&self) -> CompletionSignal {
        self.close_with(true)
    }
}

impl ListenableAsyncCloseable for CompositeCloser {
    fn on_close(&self) -> CompletionSignal {
        self.closed.clone()
    }
}

impl Default for CompositeCloser {
    fn default() -> Self {
        CompositeCloser::new()
    }
}

impl FromIterator<Box<dyn AsyncCloseable>> for CompositeCloser {
    fn from_iter<T: IntoIterator<Item = Box<dyn AsyncCloseable>>>(iter: T) -> Self {
        CompositeCloser {
            members: Mutex::new(Members {
                closing: false,
                participants: iter.into_iter().collect(),
            }),
            closed: CompletionSignal::new(),
        }
    }
}

impl fmt::Debug for CompositeCloser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lock = self.members.lock().unwrap();
        f.debug_struct("CompositeCloser")
            .field("closing", &lock.closing)
            .field("participants", &lock.participants.len())
            .field("closed", &self.closed)
            .finish()
    }
}
