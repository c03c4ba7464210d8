mod accessor;
mod client;
mod fs_types;
mod retry;
mod router;

#[cfg(any(test, feature = "test-util"))]
mod mem;

pub use accessor::FaultTolerantAccessor;
pub use client::{
    DfsConnector, DfsFileReader, DfsFileWriter, TlsBundle, WebHdfsClient, WebHdfsConfig,
    DEFAULT_REQUEST_TIMEOUT,
};
pub use fs_types::{DirEntry, DirListing, FileAttributes};
pub use retry::{RetryOp, RetryPolicy, SystemClock, WallClock};
pub use router::AccessorRouter;

#[cfg(any(test, feature = "test-util"))]
pub use mem::MemDfs;
#[cfg(any(test, feature = "test-util"))]
pub use retry::FakeClock;

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum DfsError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),
    #[error("end of file: {0}")]
    Eof(String),
    #[error("local I/O error: {0}")]
    LocalIo(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type DfsResult<T> = std::result::Result<T, DfsError>;

impl DfsError {
    pub fn from_http_status(code: StatusCode, info: String) -> Self {
        match code {
            StatusCode::NOT_FOUND => DfsError::NotFound(info),
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => DfsError::PermissionDenied(info),
            code if code.is_server_error() => DfsError::RemoteUnavailable(info),
            _ => DfsError::Invalid(format!("HTTP {}: {}", code, info)),
        }
    }

    /// Transient failures worth a reconnect-and-retry; everything else is final.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            DfsError::Transport(_) | DfsError::RemoteUnavailable(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DfsError::NotFound(_))
    }
}

impl From<std::io::Error> for DfsError {
    fn from(err: std::io::Error) -> Self {
        DfsError::LocalIo(err.to_string())
    }
}
