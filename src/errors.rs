//! Result codes surfaced to user callbacks.

use std::io;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors delivered to user callbacks and returned from manager calls.
///
/// Operating-system errors are translated exactly once, at the point they
/// cross into the manager, via the [`From<io::Error>`] impl below. Partial
/// completions are never silently converted; a timed-out or cancelled
/// operation always reports [`Error::TimedOut`] or [`Error::Canceled`].
#[derive(Debug, Error)]
pub enum Error {
    /// The operation was cancelled, either explicitly or because the
    /// manager is shutting down.
    #[error("operation canceled")]
    Canceled,

    /// A connect or read timer expired before the operation completed.
    #[error("operation timed out")]
    TimedOut,

    /// The peer closed the connection cleanly.
    #[error("end of file")]
    Eof,

    /// The peer aborted while the connection was being established.
    #[error("peer not connected")]
    NotConnected,

    /// The TLS engine reported a protocol or certificate error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Admission control rejected the connection outright.
    #[error("connection quota reached")]
    Quota,

    /// The connection was admitted over the soft quota mark.
    #[error("connection soft quota reached")]
    SoftQuota,

    /// The operating system ran out of descriptors or buffer space.
    #[error("out of resources")]
    NoResources,

    /// The address family is not supported on this system.
    #[error("address family not supported")]
    FamilyNotSupported,

    /// The requested feature is not available on this platform.
    #[error("not implemented")]
    NotImplemented,

    /// Unclassified failure, carrying the underlying I/O error.
    #[error("network failure: {0}")]
    Failure(io::Error),

    /// A state the manager cannot recover from; indicates a caller bug.
    #[error("unexpected: {0}")]
    Unexpected(&'static str),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        use io::ErrorKind;

        match err.kind() {
            ErrorKind::TimedOut => Error::TimedOut,
            ErrorKind::UnexpectedEof => Error::Eof,
            ErrorKind::NotConnected | ErrorKind::ConnectionAborted => Error::NotConnected,
            ErrorKind::OutOfMemory => Error::NoResources,
            _ => match err.raw_os_error() {
                Some(code)
                    if code == libc::EMFILE
                        || code == libc::ENFILE
                        || code == libc::ENOBUFS
                        || code == libc::ENOMEM =>
                {
                    Error::NoResources
                }
                Some(code) if code == libc::EAFNOSUPPORT => Error::FamilyNotSupported,
                _ => Error::Failure(err),
            },
        }
    }
}
