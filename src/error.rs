/// The error type for store, table and snapshot operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A key, value or metadata prefix does not fit the record layout the
    /// table was configured with.
    #[error("invalid record size: {0}")]
    InvalidSize(&'static str),

    /// An epoch reference was released more times than it was acquired.
    /// This indicates a corrupted refcount and is a programming error.
    #[error("epoch {0} was released more times than it was pinned")]
    InvalidRefCount(u64),

    /// A table with the same (case-insensitive) name is already registered.
    #[error("a table named `{0}` already exists")]
    DuplicateTable(String),

    /// The requested combination of options or formats is not supported.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The epoch ring is full: the oldest epoch still has readers and the
    /// queue cannot hold another one. The advancer retries on its next
    /// cycle, so this surfaces only through logs and diagnostics.
    #[error("epoch queue is full; the oldest epoch is still referenced")]
    EpochQueueExhausted,

    /// A snapshot stream failed to read or write.
    #[error("snapshot stream error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized `Result` type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
