//! SQLite dialect
//!
//! SQLite has no server-side advisory lock, so locking is a no-op and callers
//! must not run migrations against the same file from several processes at once.

use async_trait::async_trait;
use sqlx::AnyConnection;

use super::{database_error_parts, DatabaseBackendType, Dialect};
use crate::error::MigrateResult;

#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteDialect;

#[async_trait]
impl Dialect for SqliteDialect {
    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::SQLite
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn is_missing_table(&self, err: &sqlx::Error) -> bool {
        // reported as SQLITE_ERROR (1), so only the message tells
        matches!(
            database_error_parts(err),
            Some((_, message)) if message.contains("no such table")
        )
    }

    async fn try_lock(&self, _conn: &mut AnyConnection, _key: u32) -> MigrateResult<bool> {
        Ok(true)
    }

    async fn unlock(&self, _conn: &mut AnyConnection, _key: u32) -> MigrateResult<()> {
        Ok(())
    }

    fn holds_session_lock(&self) -> bool {
        false
    }
}
