//! Persistent buffer errors

use std::fmt;

pub type StorageResult<T> = Result<T, StorageError>;

/// Failures while spilling or reloading buffered values
#[derive(Debug)]
pub enum StorageError {
    /// The buffer file could not be opened or created
    Open { path: String, reason: String },

    /// Schema setup failed
    Migration(String),

    /// A statement against the buffer failed
    Statement(String),

    /// A stored row could not be turned back into a value
    CorruptRow(String),

    Io(std::io::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Open { path, reason } => {
                write!(f, "cannot open persistent buffer {path}: {reason}")
            }
            StorageError::Migration(reason) => {
                write!(f, "persistent buffer schema setup failed: {reason}")
            }
            StorageError::Statement(reason) => write!(f, "persistent buffer statement failed: {reason}"),
            StorageError::CorruptRow(reason) => write!(f, "corrupt buffered value: {reason}"),
            StorageError::Io(err) => write!(f, "persistent buffer I/O: {err}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        if let StorageError::Io(err) = self {
            Some(err)
        } else {
            None
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err)
    }
}

#[cfg(feature = "persistent-buffer")]
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(io) => StorageError::Io(io),
            other => StorageError::Statement(other.to_string()),
        }
    }
}

#[cfg(feature = "persistent-buffer")]
impl From<sqlx::migrate::MigrateError> for StorageError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StorageError::Migration(err.to_string())
    }
}
