use thiserror::Error;

/// Errors that can occur when reading or extracting from an archive.
#[derive(Debug, Error)]
pub enum Error {
    /// The file signature does not match any supported archive format.
    #[error("unsupported archive format: {0}")]
    UnsupportedFormat(String),

    /// The archive container is malformed.
    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    /// An extraction context does not name an entry of this archive.
    #[error("invalid entry context: {0}")]
    InvalidContext(u64),

    /// A file node was asked to fill without a provider context.
    #[error("no entry context for {0}")]
    MissingContext(String),

    /// A node id does not belong to the tree.
    #[error("no such node: {0}")]
    UnknownNode(usize),

    /// The decompressed entry did not match the size recorded in the index.
    #[error("entry size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Error from the zip library.
    #[error("zip error: {0}")]
    ZipError(#[from] zip::result::ZipError),

    /// Error from the 7z library, carried as text.
    #[error("7z error: {0}")]
    SevenZip(String),

    /// I/O error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for avfs-archive operations.
pub type Result<T> = std::result::Result<T, Error>;
