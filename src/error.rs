//! File system error types
//!
//! Every component boundary returns a typed error; the host layer converts
//! it into the negative errno protocol expected by the host binding.

use core::fmt;

/// File system error kinds surfaced to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// File or directory not found
    NotFound,
    /// A path component resolves to a non-directory
    NotADirectory,
    /// Directory not empty
    NotEmpty,
    /// Operation targets the reserved debug namespace
    NotPermitted,
    /// Invalid argument (negative offset, malformed input)
    InvalidArgument,
    /// Inode map exhausted or erase-block reserve would be violated
    NoSpace,
    /// Write or truncate beyond the erase-block-indirect limit
    TooLarge,
    /// Backend failure or internal consistency violation
    Io,
    /// Byte count or offset exceeds platform signed limits
    Overflow,
    /// Operation not supported
    NotSupported,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FsError::NotFound => write!(f, "No such file or directory"),
            FsError::NotADirectory => write!(f, "Not a directory"),
            FsError::NotEmpty => write!(f, "Directory not empty"),
            FsError::NotPermitted => write!(f, "Operation not permitted"),
            FsError::InvalidArgument => write!(f, "Invalid argument"),
            FsError::NoSpace => write!(f, "No space left on device"),
            FsError::TooLarge => write!(f, "File too large"),
            FsError::Io => write!(f, "Input/output error"),
            FsError::Overflow => write!(f, "Value too large for platform"),
            FsError::NotSupported => write!(f, "Operation not supported"),
        }
    }
}

impl std::error::Error for FsError {}

impl FsError {
    /// Negative errno value of the host's numeric protocol.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => -libc::ENOENT,
            FsError::NotADirectory => -libc::ENOTDIR,
            FsError::NotEmpty => -libc::ENOTEMPTY,
            FsError::NotPermitted => -libc::EPERM,
            FsError::InvalidArgument => -libc::EINVAL,
            FsError::NoSpace => -libc::ENOSPC,
            FsError::TooLarge => -libc::EFBIG,
            FsError::Io => -libc::EIO,
            FsError::Overflow => -libc::EOVERFLOW,
            FsError::NotSupported => -libc::ENOSYS,
        }
    }
}

/// File system result type
pub type FsResult<T> = Result<T, FsError>;
