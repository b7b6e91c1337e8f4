//! Error kinds surfaced across the filesystem boundary.
//!
//! VFS entry points catch these at the call boundary, log them with a
//! category and severity, and hand the code back to the caller. Operations
//! that left partial state behind roll it back before returning.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NoEntry,
    #[error("file exists")]
    Exist,
    #[error("name too long")]
    NameTooLong,
    #[error("invalid argument")]
    InvalidArg,
    #[error("operation not permitted")]
    NoPermission,
    #[error("not a directory")]
    NotDirectory,
    #[error("is a directory")]
    IsDirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("no space left on volume")]
    NoSpace,
    #[error("i/o error")]
    IoError,
    #[error("read-only filesystem")]
    ReadOnlyFilesystem,
    #[error("file too large")]
    FileTooLarge,
}

impl From<io::Error> for FsError {
    fn from(_: io::Error) -> Self {
        FsError::IoError
    }
}

pub type FsResult<T> = Result<T, FsError>;
