// SPDX-License-Identifier: MPL-2.0

use core::fmt;

/// The error types used in this crate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Errno {
    /// Invalid arguments.
    InvalidArgs,
    /// Out of space on the requested media class(es).
    NoSpace,
    /// Not found.
    NotFound,
    /// Already exists.
    Exists,
    /// Object busy (outstanding references or concurrent mutation).
    Busy,
    /// Object is being deleted.
    Gone,
    /// On-media metadata is corrupt.
    Corrupt,
    /// On-media metadata is newer than this binary supports.
    Unsupported,
    /// Recorded drive parameters do not match the discovered drive.
    ParmMismatch,
    /// A drive was offered that the metadata knows nothing about.
    Zombie,
    /// Too few healthy drives to activate.
    InsufficientGood,
    /// IO error.
    IoFailed,
    /// Record or payload too big for the target log.
    TooBig,
    /// Out of memory.
    OutOfMemory,
    /// Permission denied.
    PermissionDenied,
    /// Internal invariant broken; logged before surfacing.
    Critical,
}

/// The error with an error type and an error message used in this crate.
#[derive(Clone, Debug)]
pub struct Error {
    errno: Errno,
    msg: Option<&'static str>,
}

impl Error {
    /// Creates a new error with the given error type and no error message.
    pub const fn new(errno: Errno) -> Self {
        Error { errno, msg: None }
    }

    /// Creates a new error with the given error type and the error message.
    pub const fn with_msg(errno: Errno, msg: &'static str) -> Self {
        Error {
            errno,
            msg: Some(msg),
        }
    }

    /// Returns the error type.
    pub fn errno(&self) -> Errno {
        self.errno
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::new(errno)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

#[macro_export]
macro_rules! return_errno {
    ($errno: expr) => {
        return core::result::Result::Err($crate::Error::new($errno))
    };
}

#[macro_export]
macro_rules! return_errno_with_msg {
    ($errno: expr, $msg: expr) => {
        return core::result::Result::Err($crate::Error::with_msg($errno, $msg))
    };
}
