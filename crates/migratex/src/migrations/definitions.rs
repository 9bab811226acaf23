//! Migration Definitions - Core types for migration units
//!
//! Defines the `Migration` trait every unit implements, SQL-text and
//! closure backed units, and the result types returned by a run.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlparser::dialect::{
    Dialect as SqlDialect, GenericDialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect,
};
use sqlparser::tokenizer::{Token, Tokenizer};
use sqlx::AnyConnection;

use crate::backends::DatabaseBackendType;
use crate::error::MigrateResult;

/// One reversible schema change.
///
/// Both operations run on the connection of the step's transaction; whatever
/// they do is committed or rolled back together with the version row.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Position in the total order of migrations; unique within a set
    fn version(&self) -> i64;

    /// Human-readable label for logs
    fn name(&self) -> &str {
        ""
    }

    async fn up(&self, conn: &mut AnyConnection) -> MigrateResult<()>;

    async fn down(&self, conn: &mut AnyConnection) -> MigrateResult<()>;
}

/// Migration direction for execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationDirection {
    /// Apply the migration (run UP statements)
    Up,
    /// Rollback the migration (run DOWN statements)
    Down,
}

impl std::fmt::Display for MigrationDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationDirection::Up => write!(f, "up"),
            MigrationDirection::Down => write!(f, "down"),
        }
    }
}

/// Result of running migrations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRunResult {
    pub direction: MigrationDirection,
    /// Versions applied (or reverted) in this run, in execution order
    pub applied_migrations: Vec<i64>,
    /// Number of migrations skipped because the store was already past them
    pub skipped_count: usize,
    /// Version recorded once the run finished
    pub final_version: i64,
    /// Total execution time in milliseconds
    pub execution_time_ms: u128,
}

impl MigrationRunResult {
    pub fn applied_count(&self) -> usize {
        self.applied_migrations.len()
    }
}

/// A migration written as plain SQL.
///
/// Each side may hold several statements separated by `;`. They run in
/// order on the step's transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlMigration {
    pub version: i64,
    pub name: String,
    pub up_sql: String,
    pub down_sql: String,
}

impl SqlMigration {
    pub fn new(
        version: i64,
        name: impl Into<String>,
        up_sql: impl Into<String>,
        down_sql: impl Into<String>,
    ) -> Self {
        Self {
            version,
            name: name.into(),
            up_sql: up_sql.into(),
            down_sql: down_sql.into(),
        }
    }

    async fn execute_script(conn: &mut AnyConnection, sql: &str) -> MigrateResult<()> {
        let backend = conn.backend_name().parse::<DatabaseBackendType>().ok();
        for statement in split_sql_statements(sql, backend) {
            sqlx::query(&statement).execute(&mut *conn).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Migration for SqlMigration {
    fn version(&self) -> i64 {
        self.version
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn up(&self, conn: &mut AnyConnection) -> MigrateResult<()> {
        Self::execute_script(conn, &self.up_sql).await
    }

    async fn down(&self, conn: &mut AnyConnection) -> MigrateResult<()> {
        Self::execute_script(conn, &self.down_sql).await
    }
}

/// Future returned by the operations of a [`FnMigration`]
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type MigrationFn =
    Box<dyn for<'c> Fn(&'c mut AnyConnection) -> BoxFuture<'c, MigrateResult<()>> + Send + Sync>;

/// A migration whose operations are closures, for changes that are not
/// plain SQL (data backfills, conditional DDL).
///
/// ```no_run
/// use migratex::{FnMigration, MigrateError};
///
/// let seed = FnMigration::new(
///     3,
///     |conn| {
///         Box::pin(async move {
///             sqlx::query("INSERT INTO settings (name) VALUES ('theme')")
///                 .execute(conn)
///                 .await?;
///             Ok::<(), MigrateError>(())
///         })
///     },
///     |conn| {
///         Box::pin(async move {
///             sqlx::query("DELETE FROM settings WHERE name = 'theme'")
///                 .execute(conn)
///                 .await?;
///             Ok::<(), MigrateError>(())
///         })
///     },
/// )
/// .with_name("seed_settings");
/// ```
pub struct FnMigration {
    version: i64,
    name: String,
    up: MigrationFn,
    down: MigrationFn,
}

impl FnMigration {
    pub fn new<U, D>(version: i64, up: U, down: D) -> Self
    where
        U: for<'c> Fn(&'c mut AnyConnection) -> BoxFuture<'c, MigrateResult<()>>
            + Send
            + Sync
            + 'static,
        D: for<'c> Fn(&'c mut AnyConnection) -> BoxFuture<'c, MigrateResult<()>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            version,
            name: String::new(),
            up: Box::new(up),
            down: Box::new(down),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl std::fmt::Debug for FnMigration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnMigration")
            .field("version", &self.version)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Migration for FnMigration {
    fn version(&self) -> i64 {
        self.version
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn up(&self, conn: &mut AnyConnection) -> MigrateResult<()> {
        (self.up)(conn).await
    }

    async fn down(&self, conn: &mut AnyConnection) -> MigrateResult<()> {
        (self.down)(conn).await
    }
}

/// Split a SQL script into statements on top-level semicolons.
///
/// Splitting is lexical, using the backend's tokenizer so semicolons inside
/// string literals, quoted identifiers, comments and dollar-quoted bodies do
/// not end a statement. Statement text is kept as written. Blank statements
/// are dropped.
pub fn split_sql_statements(sql: &str, backend: Option<DatabaseBackendType>) -> Vec<String> {
    let dialect: Box<dyn SqlDialect> = match backend {
        Some(DatabaseBackendType::PostgreSQL) => Box::new(PostgreSqlDialect {}),
        Some(DatabaseBackendType::MySQL) => Box::new(MySqlDialect {}),
        Some(DatabaseBackendType::SQLite) => Box::new(SQLiteDialect {}),
        None => Box::new(GenericDialect {}),
    };

    match Tokenizer::new(dialect.as_ref(), sql).with_unescape(false).tokenize() {
        Ok(tokens) => {
            let mut statements = Vec::new();
            let mut current = String::new();
            let mut has_content = false;

            for token in tokens {
                match token {
                    Token::SemiColon => {
                        if has_content {
                            statements.push(current.trim().to_string());
                        }
                        current.clear();
                        has_content = false;
                    }
                    Token::Whitespace(ref ws) => current.push_str(&ws.to_string()),
                    Token::EOF => {}
                    other => {
                        has_content = true;
                        current.push_str(&other.to_string());
                    }
                }
            }

            if has_content {
                statements.push(current.trim().to_string());
            }
            statements
        }
        Err(e) => {
            tracing::warn!("SQL tokenizing failed, using naive semicolon splitting: {}", e);
            sql.split(';')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect()
        }
    }
}
