use std::fmt::Display;
use std::path::PathBuf;

/// A specialized error type for WAL operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum WalError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// An I/O error with file and offset context attached.
    #[error("{}: offset {offset}: {source}", path.display())]
    IoAt {
        path: PathBuf,
        offset: u64,
        #[source]
        source: std::io::Error,
    },
    /// Operation issued on a closed log.
    #[error("log is closed")]
    Closed,
    /// A prior durable-path failure invalidated the log's guarantees.
    #[error("log is poisoned by an earlier durability failure")]
    Poisoned,
    /// Attempted append at or below the committed watermark.
    #[error("append at index {index} would overwrite committed prefix (last committed {last_committed})")]
    OverwriteCommitted { index: u64, last_committed: u64 },
    /// Read or lookup outside the live range of the log.
    #[error("index {index} outside log range [{first}..{last}]")]
    OutOfRange { index: u64, first: u64, last: u64 },
    /// Checksum or format mismatch on load.
    #[error("integrity violation: {0}")]
    Integrity(String),
    /// A suspending operation observed cancellation.
    #[error("operation cancelled")]
    Cancelled,
    /// A bounded wait elapsed before the operation could proceed.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Invalid state transition or operation.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// File system operation error.
    #[error("file system error: {0}")]
    FileSystem(String),
    /// Internal error (lock poisoning, channel teardown, etc.).
    #[error("internal error: {0}")]
    Internal(String),
}

impl WalError {
    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Create an invalid state error from a displayable value.
    pub fn invalid_state<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidState(msg.to_string())
    }

    /// Create an integrity error from a displayable value.
    pub fn integrity<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Integrity(msg.to_string())
    }

    /// Create an internal error from a displayable value.
    pub fn internal<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Internal(msg.to_string())
    }

    /// Attach file and offset context to an I/O error.
    pub fn io_at(path: impl Into<PathBuf>, offset: u64, source: std::io::Error) -> Self {
        Self::IoAt {
            path: path.into(),
            offset,
            source,
        }
    }

    /// Whether the error is a cancellation outcome rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A Result type alias for WAL operations.
pub type WalResult<T> = Result<T, WalError>;
