//! Error types for the migration engine
//!
//! Every failure aborts the current step's transaction. Lock contention,
//! dirty state and ordering violations have dedicated variants so callers can
//! tell "try again later" apart from "an operator needs to look at this".

use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;

/// Result type alias for migration operations
pub type MigrateResult<T> = Result<T, MigrateError>;

/// Error types for migration operations
#[derive(Debug, Error)]
pub enum MigrateError {
    /// Another session holds the migration lock
    #[error("database is locked")]
    Locked,

    /// A previous attempt began but never recorded a clean completion
    #[error("database is dirty")]
    Dirty,

    /// The migration does not follow immediately from the current version
    #[error("non-contiguous migration attempted: version {version} from current version {current}")]
    OutOfOrder { version: i64, current: i64 },

    /// Driver or transport error, passed through unchanged
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// A migration unit failed for a reason other than a database error
    #[error("migration {version} failed: {message}")]
    Migration { version: i64, message: String },

    /// The set of migrations handed to the engine is malformed
    #[error("invalid migration set: {0}")]
    InvalidMigrationSet(String),

    /// No dialect exists for the connected database
    #[error("unsupported database, please add this or fix: {0}")]
    UnsupportedBackend(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A primary failure together with a cleanup failure
    #[error(transparent)]
    Multi(#[from] MultiError),
}

impl MigrateError {
    /// Build a unit failure from any displayable error
    pub fn migration(version: i64, err: impl fmt::Display) -> Self {
        MigrateError::Migration {
            version,
            message: err.to_string(),
        }
    }

    /// Whether retrying later could succeed without operator intervention
    pub fn is_retryable(&self) -> bool {
        matches!(self, MigrateError::Locked)
    }

    /// Combine a primary error with an optional cleanup error.
    ///
    /// Returns the primary error untouched when there is nothing to combine.
    pub fn with_cleanup(self, cleanup: Option<MigrateError>) -> Self {
        match cleanup {
            None => self,
            Some(cleanup) => MultiError::new([Some(self), Some(cleanup)]).into(),
        }
    }
}

/// Holds several errors raised by the same operation, in the order they occurred.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<MigrateError>,
}

impl MultiError {
    /// Collect errors, dropping `None` entries
    pub fn new<I>(errors: I) -> Self
    where
        I: IntoIterator<Item = Option<MigrateError>>,
    {
        Self {
            errors: errors.into_iter().flatten().collect(),
        }
    }

    pub fn errors(&self) -> &[MigrateError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_errors(self) -> Vec<MigrateError> {
        self.errors
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", messages.join("\n"))
    }
}

impl std::error::Error for MultiError {}
