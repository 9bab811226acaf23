//! Database Backend Abstractions
//!
//! Each supported engine family gets a [`Dialect`]: how it spells bind
//! parameters and quoted identifiers, what its "table does not exist" error
//! looks like, and how to take and release a server-side advisory lock.
//! The dialect is picked at runtime from a [`DatabaseBackendType`].

pub mod mysql;
pub mod postgres;
pub mod sqlite;

use async_trait::async_trait;
use sqlx::AnyConnection;

use crate::error::{MigrateError, MigrateResult};

pub use mysql::MySqlDialect;
pub use postgres::PostgresDialect;
pub use sqlite::SqliteDialect;

static POSTGRES: PostgresDialect = PostgresDialect;
static MYSQL: MySqlDialect = MySqlDialect;
static SQLITE: SqliteDialect = SqliteDialect;

/// Database backend type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseBackendType {
    PostgreSQL,
    MySQL,
    SQLite,
}

impl DatabaseBackendType {
    /// Detect the backend from a connection URL's scheme
    pub fn from_url(database_url: &str) -> MigrateResult<Self> {
        let parsed = url::Url::parse(database_url).map_err(|e| {
            MigrateError::UnsupportedBackend(format!("invalid database URL: {}", e))
        })?;
        parsed.scheme().parse()
    }

    /// The dialect implementation for this backend
    pub fn dialect(&self) -> &'static dyn Dialect {
        match self {
            DatabaseBackendType::PostgreSQL => &POSTGRES,
            DatabaseBackendType::MySQL => &MYSQL,
            DatabaseBackendType::SQLite => &SQLITE,
        }
    }
}

impl std::fmt::Display for DatabaseBackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseBackendType::PostgreSQL => write!(f, "postgresql"),
            DatabaseBackendType::MySQL => write!(f, "mysql"),
            DatabaseBackendType::SQLite => write!(f, "sqlite"),
        }
    }
}

impl std::str::FromStr for DatabaseBackendType {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(DatabaseBackendType::PostgreSQL),
            "mysql" | "mariadb" => Ok(DatabaseBackendType::MySQL),
            "sqlite" | "sqlite3" => Ok(DatabaseBackendType::SQLite),
            _ => Err(MigrateError::UnsupportedBackend(s.to_string())),
        }
    }
}

/// Engine-specific behavior the migration engine depends on
#[async_trait]
pub trait Dialect: Send + Sync + std::fmt::Debug {
    fn backend_type(&self) -> DatabaseBackendType;

    /// Bind parameter for the 1-based position `index`
    fn placeholder(&self, index: usize) -> String;

    fn quote_identifier(&self, ident: &str) -> String;

    /// Whether `err` means the queried table does not exist
    fn is_missing_table(&self, err: &sqlx::Error) -> bool;

    /// Try to take the advisory lock for `key` without waiting.
    ///
    /// Returns `false` when another session holds it.
    async fn try_lock(&self, conn: &mut AnyConnection, key: u32) -> MigrateResult<bool>;

    async fn unlock(&self, conn: &mut AnyConnection, key: u32) -> MigrateResult<()>;

    /// Whether the lock belongs to the database session, so that closing the
    /// connection drops it
    fn holds_session_lock(&self) -> bool {
        true
    }
}

/// Error code and message of a database error, if `err` is one
pub(crate) fn database_error_parts(err: &sqlx::Error) -> Option<(Option<String>, String)> {
    err.as_database_error()
        .map(|db| (db.code().map(|c| c.into_owned()), db.message().to_string()))
}
