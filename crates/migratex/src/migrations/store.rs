//! Version Store - the single-row record of migration progress
//!
//! The table holds at most one row. Writes replace its contents wholesale,
//! so after every committed step the row reflects exactly one state.

use serde::{Deserialize, Serialize};
use sqlx::any::AnyRow;
use sqlx::{AnyConnection, FromRow, Row};
use tracing::debug;

use crate::backends::Dialect;
use crate::error::MigrateResult;

/// Version recorded when no migration has been applied
pub const NIL_VERSION: i64 = -1;

/// Persisted migration progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionState {
    pub version: i64,
    /// A step started but never recorded a clean finish
    pub dirty: bool,
}

impl VersionState {
    pub const NIL: VersionState = VersionState {
        version: NIL_VERSION,
        dirty: false,
    };

    pub fn new(version: i64, dirty: bool) -> Self {
        Self { version, dirty }
    }

    pub fn is_nil(&self) -> bool {
        self.version == NIL_VERSION
    }
}

impl Default for VersionState {
    fn default() -> Self {
        Self::NIL
    }
}

/// Row mapping for the version table
#[derive(Debug)]
struct VersionRow {
    version: i64,
    dirty: bool,
}

impl<'r> FromRow<'r, AnyRow> for VersionRow {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        let version: i64 = row.try_get("version")?;
        let dirty: i64 = row.try_get("dirty")?;
        Ok(Self {
            version,
            dirty: dirty != 0,
        })
    }
}

impl From<VersionRow> for VersionState {
    fn from(row: VersionRow) -> Self {
        VersionState::new(row.version, row.dirty)
    }
}

/// Reads and writes the version table.
///
/// Every operation runs on the caller's transaction connection; the store
/// keeps no state of its own.
#[derive(Debug, Clone)]
pub struct VersionStore {
    dialect: &'static dyn Dialect,
    table: String,
}

impl VersionStore {
    pub fn new(dialect: &'static dyn Dialect, table: impl Into<String>) -> Self {
        Self {
            dialect,
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn quoted_table(&self) -> String {
        self.dialect.quote_identifier(&self.table)
    }

    /// SQL to create the version table
    pub fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                version bigint NOT NULL PRIMARY KEY,\n    \
                dirty boolean NOT NULL\n\
            )",
            self.quoted_table()
        )
    }

    /// SQL reading the stored row.
    ///
    /// `dirty` is read back as an integer: the Any driver cannot map
    /// SQLite `BOOLEAN` or MySQL `TINYINT(1)` columns.
    pub fn select_sql(&self) -> String {
        format!(
            "SELECT version, CASE WHEN dirty THEN 1 ELSE 0 END AS dirty FROM {} LIMIT 1",
            self.quoted_table()
        )
    }

    pub fn delete_sql(&self) -> String {
        format!("DELETE FROM {}", self.quoted_table())
    }

    pub fn insert_sql(&self) -> String {
        format!(
            "INSERT INTO {} (version, dirty) VALUES ({}, {})",
            self.quoted_table(),
            self.dialect.placeholder(1),
            self.dialect.placeholder(2)
        )
    }

    /// Create the version table if it does not exist
    pub async fn ensure_table(&self, conn: &mut AnyConnection) -> MigrateResult<()> {
        sqlx::query(&self.create_table_sql()).execute(&mut *conn).await?;
        Ok(())
    }

    /// Current state; [`VersionState::NIL`] when the table or its row is absent
    pub async fn read(&self, conn: &mut AnyConnection) -> MigrateResult<VersionState> {
        let result = sqlx::query_as::<_, VersionRow>(&self.select_sql())
            .fetch_optional(&mut *conn)
            .await;

        match result {
            Ok(Some(row)) => Ok(row.into()),
            Ok(None) => Ok(VersionState::NIL),
            Err(e) if self.dialect.is_missing_table(&e) => {
                debug!("Version table {} does not exist yet", self.table);
                Ok(VersionState::NIL)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the stored state. A negative version leaves the table empty.
    pub async fn write(
        &self,
        conn: &mut AnyConnection,
        version: i64,
        dirty: bool,
    ) -> MigrateResult<()> {
        sqlx::query(&self.delete_sql()).execute(&mut *conn).await?;

        if version >= 0 {
            sqlx::query(&self.insert_sql())
                .bind(version)
                .bind(dirty)
                .execute(&mut *conn)
                .await?;
        }

        debug!("Version table {} set to version={} dirty={}", self.table, version, dirty);
        Ok(())
    }
}
