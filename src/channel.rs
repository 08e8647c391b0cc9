use crate::err_closed;
use crate::{CompletionSignal, Connection, ListenableAsyncCloseable};
use futures_io::{AsyncRead, AsyncWrite};
use futures_util::ready;
use futures_util::task::AtomicWaker;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process unique identifier of a [`Channel`].
///
/// [`Channel`]: struct.Channel.html
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        ChannelId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw numeric id.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Split a stream into a tracking handle and the I/O half.
///
/// The [`ChannelIo`] is what the task serving the connection reads and writes.
/// The [`Channel`] can be handed to a [`ConnectionSet`] and used to close the
/// connection from elsewhere.
///
/// A force close through the `Channel` is carried out by the task polling the
/// `ChannelIo`. Keep that task reading, or drop the `ChannelIo`, for the close
/// to take effect. A task parked on something else leaves the channel open.
///
/// [`ChannelIo`]: struct.ChannelIo.html
/// [`Channel`]: struct.Channel.html
/// [`ConnectionSet`]: struct.ConnectionSet.html
pub fn channel<S>(io: S) -> (Channel, ChannelIo<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let shared = Arc::new(Shared {
        id: ChannelId::next(),
        close_requested: AtomicBool::new(false),
        waker: AtomicWaker::new(),
        closed: CompletionSignal::new(),
        session: Mutex::new(None),
    });

    trace!("New channel {}", shared.id);

    let handle = Channel(shared.clone());
    let io = ChannelIo {
        io,
        shared,
        shut_down: false,
    };

    (handle, io)
}

/// Tracking handle of a channel.
///
/// Does not own the I/O. Cloning gives another handle to the same channel.
#[derive(Clone)]
pub struct Channel(Arc<Shared>);

struct Shared {
    id: ChannelId,
    close_requested: AtomicBool,
    waker: AtomicWaker,
    closed: CompletionSignal,
    session: Mutex<Option<Arc<dyn ListenableAsyncCloseable>>>,
}

impl Shared {
    /// Mark the transport closed. The session is dropped since there is nothing
    /// left to drain, which also breaks a session holding on to its channel.
    fn release(&self) -> bool {
        let session = self.session.lock().unwrap().take();
        drop(session);
        self.closed.complete()
    }
}

impl Channel {
    /// Identity of this channel.
    pub fn id(&self) -> ChannelId {
        self.0.id
    }

    /// Request a force close.
    ///
    /// The task driving the `ChannelIo` is woken, its next read shuts the stream
    /// down and returns EOF, writes fail.
    ///
    /// Nothing happens to the stream until that task polls the `ChannelIo` again
    /// or drops it. The channel stays active until then.
    pub fn close(&self) {
        if !self.0.close_requested.swap(true, Ordering::SeqCst) {
            trace!("Close requested for {}", self.0.id);
        }
        self.0.waker.wake();
    }

    /// Tests whether the channel is still active.
    pub fn is_active(&self) -> bool {
        !self.0.closed.is_done()
    }

    /// Signal settling once the `ChannelIo` is closed or dropped.
    pub fn close_future(&self) -> CompletionSignal {
        self.0.closed.clone()
    }

    /// Attach a higher level session used to drain the channel on graceful close.
    pub fn set_session(&self, session: Arc<dyn ListenableAsyncCloseable>) {
        *self.0.session.lock().unwrap() = Some(session);
    }

    /// The attached session, if any.
    pub fn session(&self) -> Option<Arc<dyn ListenableAsyncCloseable>> {
        self.0.session.lock().unwrap().clone()
    }
}

impl Connection for Channel {
    type Id = ChannelId;

    fn id(&self) -> ChannelId {
        Channel::id(self)
    }

    fn close(&self) {
        Channel::close(self)
    }

    fn close_future(&self) -> CompletionSignal {
        Channel::close_future(self)
    }

    fn session(&self) -> Option<Arc<dyn ListenableAsyncCloseable>> {
        Channel::session(self)
    }
}

/// The I/O half of a channel, wrapping the stream.
///
/// Expected to be driven by a single task at a time.
pub struct ChannelIo<S> {
    io: S,
    shared: Arc<Shared>,
    shut_down: bool,
}

impl<S> ChannelIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Tracking handle for this channel.
    pub fn handle(&self) -> Channel {
        Channel(self.shared.clone())
    }

    /// Access the wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.io
    }

    fn is_close_requested(&self, cx: &mut Context<'_>) -> bool {
        // Register before checking so a close() in between still wakes us.
        self.shared.waker.register(cx.waker());
        self.shared.close_requested.load(Ordering::SeqCst)
    }

    fn poll_shutdown(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.shut_down {
            let r = ready!(Pin::new(&mut self.io).poll_close(cx));

            self.shut_down = true;
            trace!("Channel {} shut down", self.shared.id);
            self.shared.release();

            r?;
        }

        Ok(()).into()
    }
}

impl<S> AsyncRead for ChannelIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.shut_down || this.is_close_requested(cx) {
            ready!(this.poll_shutdown(cx))?;
            return Ok(0).into();
        }

        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for ChannelIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.shut_down || this.is_close_requested(cx) {
            return err_closed().into();
        }

        Pin::new(&mut this.io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.shut_down {
            return err_closed().into();
        }

        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_shutdown(cx)
    }
}

impl<S> Drop for ChannelIo<S> {
    fn drop(&mut self) {
        // Dropping the stream closes it, whatever the reason we got here.
        if self.shared.release() {
            trace!("Channel {} dropped", self.shared.id);
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.0.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl<S> fmt::Debug for ChannelIo<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelIo({})", self.shared.id)
    }
}
