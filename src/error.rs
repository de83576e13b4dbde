use core::fmt;

/// Errors returned by the HAP stack.
///
/// The variants mirror the error kinds exchanged across the platform boundary and are stable
/// contracts: they must not be reused with other meanings.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[non_exhaustive]
pub enum Error {
    /// An unexpected failure, typically persistent store I/O.
    ///
    /// Continuing after a store failure would risk pairing database corruption, so callers on
    /// critical paths treat this as fatal.
    Unknown,

    /// A precondition on the current state was violated.
    ///
    /// Usually recoverable by resetting the session that caused it.
    InvalidState,

    /// Wire format, UTF-8, or constraint violation in received data.
    ///
    /// Recoverable by rejecting the request.
    InvalidData,

    /// A buffer was too small or a resource table was full.
    OutOfResources,

    /// A permission, admin, or security check failed.
    NotAuthorized,

    /// Another session holds an exclusive resource (e.g. Pair Setup).
    Busy,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Error::Unknown => "unexpected failure",
            Error::InvalidState => "invalid state for operation",
            Error::InvalidData => "invalid data received",
            Error::OutOfResources => "out of resources",
            Error::NotAuthorized => "not authorized",
            Error::Busy => "resource busy",
        })
    }
}
