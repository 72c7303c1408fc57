//! Error handling and errno mapping for the media filesystem.
//!
//! Every failure that reaches a kernel callback is reduced to a POSIX error
//! code here; nothing is propagated as a panic.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::origin::OriginError;

/// Errors produced while streaming a remote file.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// The handle was closed or the process is shutting down.
    #[error("stream cancelled")]
    Cancelled,

    /// A setup or read deadline elapsed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The ranged request could not be established.
    #[error("stream setup failed: {0}")]
    Setup(Arc<OriginError>),

    /// The origin body failed or ended early.
    #[error("origin read failed: {0}")]
    Origin(Arc<io::Error>),
}

impl StreamError {
    /// Converts this error to a libc error code for FUSE.
    pub fn to_errno(&self) -> i32 {
        match self {
            StreamError::Cancelled => libc::EINTR,
            StreamError::Setup(e) if e.is_unreachable() => libc::ENETUNREACH,
            StreamError::Timeout(_) | StreamError::Setup(_) | StreamError::Origin(_) => libc::EIO,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, StreamError::Timeout(_))
    }
}

impl From<OriginError> for StreamError {
    fn from(e: OriginError) -> Self {
        StreamError::Setup(Arc::new(e))
    }
}

impl From<io::Error> for StreamError {
    fn from(e: io::Error) -> Self {
        StreamError::Origin(Arc::new(e))
    }
}

/// Errors from kernel-facing lookups.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("invalid inode: {0}")]
    InvalidInode(u64),

    #[error("no such entry: {0}")]
    NotFound(String),

    #[error("invalid file handle: {0}")]
    InvalidHandle(u64),

    #[error("not a directory: {0}")]
    NotADirectory(u64),

    #[error("is a directory: {0}")]
    IsADirectory(u64),

    #[error("read-only filesystem")]
    ReadOnly,

    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl FsError {
    /// Converts this error to a libc error code for FUSE.
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::InvalidInode(_) | FsError::NotFound(_) => libc::ENOENT,
            FsError::InvalidHandle(_) => libc::EBADF,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::ReadOnly => libc::EROFS,
            FsError::Stream(e) => e.to_errno(),
        }
    }
}

/// Result type for filesystem operations.
pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_mapping() {
        assert_eq!(StreamError::Cancelled.to_errno(), libc::EINTR);
        assert_eq!(StreamError::Timeout(Duration::from_secs(1)).to_errno(), libc::EIO);
        assert_eq!(
            StreamError::from(io::Error::other("reset")).to_errno(),
            libc::EIO
        );
    }

    #[test]
    fn test_setup_error_mapping() {
        let refused = OriginError::Io(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(StreamError::from(refused).to_errno(), libc::ENETUNREACH);

        let status = OriginError::Status(reqwest::StatusCode::FORBIDDEN);
        assert_eq!(StreamError::from(status).to_errno(), libc::EIO);
    }

    #[test]
    fn test_fs_error_mapping() {
        assert_eq!(FsError::InvalidInode(7).to_errno(), libc::ENOENT);
        assert_eq!(FsError::NotFound("x".into()).to_errno(), libc::ENOENT);
        assert_eq!(FsError::InvalidHandle(7).to_errno(), libc::EBADF);
        assert_eq!(FsError::NotADirectory(7).to_errno(), libc::ENOTDIR);
        assert_eq!(FsError::IsADirectory(7).to_errno(), libc::EISDIR);
        assert_eq!(FsError::ReadOnly.to_errno(), libc::EROFS);
        assert_eq!(FsError::from(StreamError::Cancelled).to_errno(), libc::EINTR);
    }

    #[test]
    fn test_display() {
        assert!(FsError::InvalidInode(42).to_string().contains("42"));
        assert!(StreamError::Timeout(Duration::from_secs(3)).to_string().contains("3s"));
        assert!(!StreamError::Cancelled.is_timeout());
    }
}
