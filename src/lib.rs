#![warn(missing_docs, missing_debug_implementations)]
#![warn(clippy::all)]

//! Lifecycle management for sets of asynchronous network connections.
//!
//! This library provides the lower level parts needed to shut down a network
//! service: tracking every live connection, closing them all at once (force) or
//! letting each one drain in-flight work first (graceful), and telling the
//! caller exactly once when everything is closed. Which async runtime to use,
//! TCP, TLS and the protocol spoken over a connection are handled outside this
//! library.
//!
//! ## In scope
//!
//! * A one-shot, multicast, replayable [`CompletionSignal`].
//! * The [`AsyncCloseable`] contract and a [`CompositeCloser`] that turns N close
//!   operations into one.
//! * A [`ConnectionSet`] that tracks connections and drives set-wide shutdown.
//! * An [`Offload`] policy deciding where completion callbacks run, so they are
//!   kept off latency sensitive I/O threads.
//!
//! ## Out of scope
//!
//! * Request routing, HTTP parsing, TLS.
//! * Load balancing, retries, backoff.
//! * Timeouts on graceful drains. A bounded shutdown is done by racing the signal
//!   returned from [`ConnectionSet::close_async_gracefully`] against a timer and
//!   falling back to [`ConnectionSet::close_async`].
//!
//! # Layout and API
//!
//! Anything that can be tracked implements [`Connection`]. For plain
//! `futures-io` streams, [`channel()`] splits a stream into a tracking handle
//! ([`Channel`]) and the I/O half ([`ChannelIo`]) that the serving task owns.
//!
//! ```rust, no_run
//! use connset::{channel, ConnectionSet, Offload};
//! use async_std::net::TcpListener;
//! use futures_util::io::AsyncReadExt;
//!
//! #[async_std::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let set = ConnectionSet::new(Offload::thread_pool()?);
//!     let listener = TcpListener::bind("127.0.0.1:3000").await?;
//!
//!     let (tcp, _) = listener.accept().await?;
//!     let (handle, mut io) = channel(tcp);
//!
//!     if set.add(handle) {
//!         async_std::task::spawn(async move {
//!             let mut buf = vec![0; 1024];
//!             while let Ok(n) = io.read(&mut buf).await {
//!                 if n == 0 {
//!                     break;
//!                 }
//!             }
//!         });
//!     }
//!
//!     set.close_async_gracefully().wait().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! [`channel()`]: fn.channel.html

#[macro_use]
extern crate log;

mod channel;
mod closeable;
mod composite;
mod connection_set;
mod error;
mod offload;
mod signal;

pub use channel::{channel, Channel, ChannelId, ChannelIo};
pub use closeable::{AsyncCloseable, AwaitSignal, ListenableAsyncCloseable};
pub use composite::CompositeCloser;
pub use connection_set::{CloseState, Connection, ConnectionSet};
pub use error::Error;
pub use offload::{Executor, Offload, Task};
pub use signal::{CompletionSignal, SignalFuture};

pub(crate) fn err_closed<T>() -> std::io::Result<T> {
    use std::io;
    Err(io::Error::new(io::ErrorKind::NotConnected, "Channel is closed"))
}
