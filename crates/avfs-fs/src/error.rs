use thiserror::Error;

/// Errors returned by filesystem operations.
///
/// Front ends translate these at their edge: FUSE into errno values, WebDAV
/// into `dav_server` errors.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// The volume is read-only; every mutation ends here.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The handle was opened under a mount that is no longer active.
    #[error("stale or invalid file handle")]
    InvalidHandle,

    #[error("no archive is mounted")]
    NotMounted,

    #[error("failed to extract {path}")]
    ExtractionFailed {
        path: String,
        #[source]
        source: avfs_archive::Error,
    },

    #[error("failed to load archive")]
    ProviderInit(#[source] avfs_archive::Error),
}

/// Result type for filesystem operations.
pub type FsResult<T> = std::result::Result<T, FsError>;
