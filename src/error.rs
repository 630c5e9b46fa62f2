//! Error types for packrpc.

use thiserror::Error;

/// Error type for packrpc operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Operation not allowed from this thread or from a callback context.
    #[error("operation not permitted in this context")]
    PermissionDenied,
    /// A caller-supplied argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Session number does not name a live session.
    #[error("session {0} not found")]
    SessionNotFound(u16),
    /// Session exists but is not in the connected state.
    #[error("session {0} is not connected")]
    SessionNotConnected(u16),
    /// All request slots of the session are in flight.
    #[error("session request window is full")]
    NoFreeSlots,
    /// The session table is full.
    #[error("session table is full")]
    TooManySessions,
    /// The packet buffer pool is exhausted.
    #[error("out of packet buffers")]
    OutOfBuffers,
    /// Message exceeds the configured maximum.
    #[error("message too large: {size} bytes, max {max} bytes")]
    MessageTooLarge { size: usize, max: usize },
    /// The transport could not accept the packet right now.
    #[error("transport would block")]
    TransportBusy,
    /// A received packet failed validation.
    #[error("invalid packet: {0}")]
    InvalidPacket(&'static str),
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// IO error from the underlying transport or SM socket.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The negative errno this error maps to at the C-flavored API boundary.
    pub fn errno(&self) -> i32 {
        match self {
            Error::PermissionDenied => -libc::EPERM,
            Error::InvalidArgument(_)
            | Error::InvalidPacket(_)
            | Error::InvalidConfig(_)
            | Error::SessionNotFound(_)
            | Error::SessionNotConnected(_) => -libc::EINVAL,
            Error::NoFreeSlots => -libc::EBUSY,
            Error::OutOfBuffers | Error::MessageTooLarge { .. } | Error::TooManySessions => {
                -libc::ENOMEM
            }
            Error::TransportBusy => -libc::EAGAIN,
            Error::Io(e) => -e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Result type for packrpc operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Abort on invariant violations when datapath checks are compiled in,
/// otherwise log and let the caller take the recovery path.
macro_rules! dp_fatal {
    ($($arg:tt)*) => {
        if cfg!(feature = "datapath-checks") {
            panic!($($arg)*);
        } else {
            log::error!($($arg)*);
        }
    };
}

pub(crate) use dp_fatal;
