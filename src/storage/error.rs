//! Error types for storage operations

use std::fmt;
use std::path::PathBuf;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations
#[derive(Debug)]
pub enum StorageError {
    /// I/O error (open, write, rename, etc.)
    Io(std::io::Error),

    /// Advisory lock could not be acquired
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The file does not exist (yet)
    NotFound(PathBuf),

    /// Entry serialization/deserialization error
    Serialization(String),

    /// Persisted state could not be interpreted
    CorruptState(String),
}

impl StorageError {
    /// Wrap a lock failure for `path`
    pub fn lock(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Lock {
            path: path.into(),
            source,
        }
    }

    /// Whether this error only means "no data yet"
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::NotFound(_) => true,
            StorageError::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Io(err) => write!(f, "I/O error: {}", err),
            StorageError::Lock { path, source } => {
                write!(f, "failed to lock {}: {}", path.display(), source)
            }
            StorageError::NotFound(path) => write!(f, "file not found: {}", path.display()),
            StorageError::Serialization(msg) => write!(f, "entry serialization error: {}", msg),
            StorageError::CorruptState(msg) => write!(f, "corrupt rollup state: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(err) => Some(err),
            StorageError::Lock { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
