use thiserror::Error;

/// Stable error taxonomy for the networking core.
///
/// Every variant doubles as both a transaction completion status and a log
/// severity hint, matching the way the original C implementation reused a
/// single negative `errno`-style code for both purposes. `WouldBlock` is
/// deliberately absent: per design, it never escapes the send/receive
/// internals — callers see either progress or one of the variants below.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("allocation failed")]
    OutOfMemory,
    #[error("peer or transaction already exists")]
    AlreadyExists,
    #[error("operation timed out")]
    Timeout,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection reset")]
    ConnectionReset,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("transaction not found")]
    NotFound,
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Maps this error onto the synthetic status code a completion callback
    /// observes (a timeout sweep or a peer reset both need to hand
    /// transactions a status without a real wire reply).
    #[must_use]
    pub fn as_status(&self) -> i32 {
        match self {
            Error::OutOfMemory => -12,
            Error::AlreadyExists => -17,
            Error::Timeout => -110,
            Error::ConnectionRefused => -111,
            Error::ConnectionReset => -104,
            Error::InvalidArgument(_) => -22,
            Error::NotFound => -2,
            Error::Fatal(_) => -5,
        }
    }
}
