use crate::closeable::isolate;
use crate::{AsyncCloseable, AwaitSignal, CompletionSignal, CompositeCloser};
use crate::{ListenableAsyncCloseable, Offload};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const GRACEFULLY_CLOSING: u8 = 2;

/// A network connection that can be tracked by a [`ConnectionSet`].
///
/// Implementors are cheap handles. The set keeps a clone of the handle for
/// tracking, the I/O itself stays with whoever registered it.
///
/// [`ConnectionSet`]: struct.ConnectionSet.html
pub trait Connection: Clone + Send + Sync + 'static {
    /// Identity of the connection.
    type Id: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static;

    /// Stable identity, unique for as long as the connection is tracked.
    fn id(&self) -> Self::Id;

    /// Force close the transport. Must be safe to call more than once.
    fn close(&self);

    /// Signal settling once when the transport becomes inactive, for any reason.
    fn close_future(&self) -> CompletionSignal;

    /// Higher level session that can drain in-flight work before closing.
    ///
    /// Connections without one are force closed also on graceful shutdown.
    fn session(&self) -> Option<Arc<dyn ListenableAsyncCloseable>> {
        None
    }
}

/// Lifecycle state of a [`ConnectionSet`].
///
/// Once out of `Open` a set never goes back.
///
/// [`ConnectionSet`]: struct.ConnectionSet.html
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseState {
    /// Accepting new connections.
    Open,
    /// Force closing.
    Closing,
    /// Draining connections before closing them.
    GracefullyClosing,
}

/// Set of live connections that can be closed as one.
///
/// Connections remove themselves from the set when their transport closes.
/// When the set is closing and the last connection leaves, [`on_close`] settles,
/// exactly once.
///
/// Cloning gives another handle to the same set.
///
/// [`on_close`]: #method.on_close
pub struct ConnectionSet<C: Connection> {
    inner: Arc<Inner<C>>,
}

struct Inner<C: Connection> {
    connections: DashMap<C::Id, C>,
    state: AtomicU8,
    /// Settled when the set is closing and empty. Observers inline.
    closed: CompletionSignal,
    /// `closed` as handed out, delivered through `offload`.
    on_close: CompletionSignal,
    offload: Offload,
}

impl<C: Connection> ConnectionSet<C> {
    /// New open set. Completion notifications are delivered through `offload`.
    pub fn new(offload: Offload) -> Self {
        let closed = CompletionSignal::new();
        let on_close = closed.publish_on(offload.clone());

        ConnectionSet {
            inner: Arc::new(Inner {
                connections: DashMap::new(),
                state: AtomicU8::new(OPEN),
                closed,
                on_close,
                offload,
            }),
        }
    }

    /// Add a connection, if its id is not already tracked.
    ///
    /// Returns `false` if the id is already present, or if the set is no longer
    /// open. In the latter case the connection is force closed.
    pub fn add(&self, conn: C) -> bool {
        let id = conn.id();

        let added = match self.inner.connections.entry(id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(conn.clone());
                true
            }
        };

        if !added {
            trace!("Connection {:?} already tracked", id);
            return false;
        }

        // The insert must happen before this check. A concurrent close either
        // sees the connection in its sweep, or we see the state here.
        let state = self.inner.state.load(Ordering::SeqCst);

        if state != OPEN {
            debug!("Reject connection {:?}, set is {:?}", id, decode(state));
            self.inner.remove(&id);
            force_close(&conn);
            return false;
        }

        trace!("Add connection {:?}", id);

        let weak: Weak<Inner<C>> = Arc::downgrade(&self.inner);

        conn.close_future()
            .publish_on(Offload::Immediate)
            .subscribe(move |_| {
                if let Some(inner) = weak.upgrade() {
                    inner.remove(&id);
                }
            });

        true
    }

    /// Force close every tracked connection.
    ///
    /// Also escalates an ongoing graceful close. Repeated calls return the same
    /// signal without sweeping the connections again.
    pub fn close_async(&self) -> CompletionSignal {
        let prev = self.inner.state.swap(CLOSING, Ordering::SeqCst);

        if prev == CLOSING {
            return self.on_close();
        }

        debug!(
            "Connection set closing ({} connections, was {:?})",
            self.inner.connections.len(),
            decode(prev)
        );

        if self.inner.connections.is_empty() {
            self.inner.closed.complete();
            return self.on_close();
        }

        for conn in self.inner.snapshot() {
            force_close(&conn);
        }

        self.on_close()
    }

    /// Drain every connection that has a session, then close it. Connections
    /// without a session are force closed straight away.
    ///
    /// Only the first close request of any kind starts a graceful close. The
    /// returned signal settles when every drain has finished and the set is
    /// empty, and fails if any drain failed.
    pub fn close_async_gracefully(&self) -> CompletionSignal {
        if self
            .inner
            .state
            .compare_exchange(OPEN, GRACEFULLY_CLOSING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return self.on_close();
        }

        debug!(
            "Connection set closing gracefully ({} connections)",
            self.inner.connections.len()
        );

        if self.inner.connections.is_empty() {
            self.inner.closed.complete();
            return self.on_close();
        }

        let mut participants: Vec<Box<dyn AsyncCloseable>> =
            vec![Box::new(AwaitSignal(self.inner.closed.clone()))];

        for conn in self.inner.snapshot() {
            match conn.session() {
                Some(session) => participants.push(Box::new(Drain { session, conn })),
                None => force_close(&conn),
            }
        }

        let composite: CompositeCloser = participants.into_iter().collect();

        // Drains are merged without offloading, this is the one offload.
        composite
            .close_async_gracefully()
            .publish_on(self.inner.offload.clone())
    }

    /// Signal settling once the set is closing and empty.
    pub fn on_close(&self) -> CompletionSignal {
        self.inner.on_close.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CloseState {
        decode(self.inner.state.load(Ordering::SeqCst))
    }

    /// Number of tracked connections.
    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    /// Tests whether no connections are tracked.
    pub fn is_empty(&self) -> bool {
        self.inner.connections.is_empty()
    }

    /// Tests whether a connection with `id` is tracked.
    pub fn contains(&self, id: &C::Id) -> bool {
        self.inner.connections.contains_key(id)
    }
}

impl<C: Connection> Inner<C> {
    fn remove(&self, id: &C::Id) {
        let removed = self.connections.remove(id).is_some();

        if !removed {
            return;
        }

        trace!("Removed connection {:?}", id);

        if self.state.load(Ordering::SeqCst) != OPEN && self.connections.is_empty() {
            // Racing removers may both get here, the signal lets one win.
            if self.closed.complete() {
                debug!("Connection set closed");
            }
        }
    }

    /// Clones of the tracked connections, so no map lock is held while closing.
    fn snapshot(&self) -> Vec<C> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }
}

fn force_close<C: Connection>(conn: &C) {
    let id = conn.id();
    isolate(&id, || conn.close()).ok();
}

fn decode(state: u8) -> CloseState {
    match state {
        OPEN => CloseState::Open,
        CLOSING => CloseState::Closing,
        _ => CloseState::GracefullyClosing,
    }
}

/// Drainable session of one connection, as a composite participant.
///
/// The connection is closed once the drain settles, whatever the outcome. A
/// session may report drained without shutting the transport.
struct Drain<C: Connection> {
    session: Arc<dyn ListenableAsyncCloseable>,
    conn: C,
}

impl<C: Connection> AsyncCloseable for Drain<C> {
    fn close_async(&self) -> CompletionSignal {
        self.session.close_async().publish_on(Offload::Immediate)
    }

    fn close_async_gracefully(&self) -> CompletionSignal {
        let drained = self
            .session
            .close_async_gracefully()
            .publish_on(Offload::Immediate);

        let conn = self.conn.clone();

        drained.subscribe(move |outcome| {
            match outcome {
                Ok(()) => trace!("Drained {:?}, closing", conn.id()),
                Err(e) => warn!("Drain of {:?} failed, force closing: {}", conn.id(), e),
            }
            force_close(&conn);
        });

        drained
    }
}

impl<C: Connection> AsyncCloseable for ConnectionSet<C> {
    fn close_async(&self) -> CompletionSignal {
        ConnectionSet::close_async(self)
    }

    fn close_async_gracefully(&self) -> CompletionSignal {
        ConnectionSet::close_async_gracefully(self)
    }
}

impl<C: Connection> ListenableAsyncCloseable for ConnectionSet<C> {
    fn on_close(&self) -> CompletionSignal {
        ConnectionSet::on_close(self)
    }
}

impl<C: Connection> Clone for ConnectionSet<C> {
    fn clone(&self) -> Self {
        ConnectionSet {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connection> fmt::Debug for ConnectionSet<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSet")
            .field("state", &self.state())
            .field("connections", &self.len())
            .field("offload", &self.inner.offload)
            .finish()
    }
}
