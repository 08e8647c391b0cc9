use std::fmt;
use std::io;
use std::sync::Arc;

/// Possible errors from this crate.
///
/// Errors are cloneable since a failed [`CompletionSignal`] replays the same
/// failure to every observer, including ones subscribing after the fact.
///
/// [`CompletionSignal`]: struct.CompletionSignal.html
#[derive(Debug, Clone)]
pub enum Error {
    /// A lifecycle ordering problem such as appending to a closer that is already closing.
    IllegalState(String),
    /// A wrapped std::io::Error from the underlying transport (socket).
    Io(Arc<io::Error>),
    /// A single participant failed, or panicked, while being closed.
    Participant(String),
}

impl Error {
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            Error::Io(e) => io::Error::new(e.kind(), e.to_string()),
            Error::IllegalState(e) => io::Error::new(io::ErrorKind::Other, e),
            Error::Participant(e) => io::Error::new(io::ErrorKind::Other, e),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::IllegalState(v) => write!(f, "illegal state: {}", v),
            Error::Io(v) => fmt::Display::fmt(v, f),
            Error::Participant(v) => write!(f, "close failed: {}", v),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        e.into_io()
    }
}
