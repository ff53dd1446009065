use std::{error::Error as StdError, fmt};

const ERR_MSG_BUFFER_FULL: &str = "publish buffer is full";
const ERR_MSG_CLOSED: &str = "already closed";
const ERR_MSG_CONFIG: &str = "invalid configuration";

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to the user of the library.
///
/// Transport-level causes are carried as [`anyhow::Error`] so the
/// opaque broker layer can attach whatever context it has without the
/// core committing to its error types.
#[derive(Debug)]
pub enum Error {
    /// The buffer was full and the producer runs the `Raise` policy.
    BufferFull,
    /// The broker could not be reached or the session died mid-operation.
    Connection(anyhow::Error),
    /// The component (or its supervisor) was closed; terminal.
    Closed,
    /// Rejected configuration value.
    Config(String),
}

impl Error {
    #[inline]
    pub fn connection(err: anyhow::Error) -> Self {
        Error::Connection(err)
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// True for the terminal closed state, where retrying is pointless.
    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BufferFull => write!(f, "{ERR_MSG_BUFFER_FULL}"),
            Error::Connection(err) => write!(f, "connection error: {err}"),
            Error::Closed => write!(f, "{ERR_MSG_CLOSED}"),
            Error::Config(msg) => write!(f, "{ERR_MSG_CONFIG}: {msg}"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Connection(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// Why a payload was discarded instead of reaching the broker.
///
/// Reported through the producer's `on_drop` hook; every dropped payload
/// carries exactly one reason.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DropReason {
    /// Evicted (or refused) because the buffer was at capacity.
    BufferFull,
    /// No connection was available and the payload could not be kept.
    Disconnected,
    /// The producer was already closed when the payload arrived.
    Closed,
    /// The payload outlived its time-to-live while buffered.
    TtlExpired,
    /// The flush loop gave up after its retry budget.
    FlushRetryExceeded,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::BufferFull => write!(f, "buffer full"),
            DropReason::Disconnected => write!(f, "disconnected"),
            DropReason::Closed => write!(f, "closed"),
            DropReason::TtlExpired => write!(f, "ttl expired"),
            DropReason::FlushRetryExceeded => write!(f, "flush retries exceeded"),
        }
    }
}
