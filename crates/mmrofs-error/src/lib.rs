#![forbid(unsafe_code)]
//! Error types for MMROFS.
//!
//! Defines `MmrofsError` and a `Result<T>` alias used throughout the
//! workspace. Includes errno mappings for external VFS adapters.

use thiserror::Error;

/// Unified error type for all MMROFS operations.
#[derive(Debug, Error)]
pub enum MmrofsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt entry in slot {slot}: {detail}")]
    Corrupt { slot: u16, detail: String },

    #[error("invalid on-flash layout: {0}")]
    Format(String),

    #[error("no space left on partition")]
    NoSpace,

    #[error("no free file handle")]
    NoFreeHandle,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("bad file handle")]
    BadHandle,

    #[error("handle is read-only")]
    ReadOnly,

    #[error("seek not supported on write-only handle")]
    NotSeekable,

    #[error("entry has open handles")]
    Busy,

    #[error("exact file size unknown until the writing handle closes or recovery runs")]
    SizeUnavailable,
}

impl MmrofsError {
    /// Convert this error into a POSIX errno suitable for VFS replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corrupt { .. } | Self::SizeUnavailable => libc::EIO,
            Self::Format(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::NoFreeHandle => libc::ENFILE,
            Self::NotFound(_) => libc::ENOENT,
            Self::BadHandle | Self::ReadOnly => libc::EBADF,
            Self::NotSeekable => libc::ESPIPE,
            Self::Busy => libc::EBUSY,
        }
    }
}

/// Result alias using `MmrofsError`.
pub type Result<T> = std::result::Result<T, MmrofsError>;
