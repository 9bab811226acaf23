//! PostgreSQL dialect
//!
//! Session-level advisory locks keyed by a bigint; `42P01` (undefined_table)
//! marks a missing relation.

use async_trait::async_trait;
use sqlx::AnyConnection;
use tracing::debug;

use super::{database_error_parts, DatabaseBackendType, Dialect};
use crate::error::MigrateResult;

const UNDEFINED_TABLE: &str = "42P01";

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresDialect;

#[async_trait]
impl Dialect for PostgresDialect {
    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::PostgreSQL
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn is_missing_table(&self, err: &sqlx::Error) -> bool {
        matches!(database_error_parts(err), Some((Some(code), _)) if code == UNDEFINED_TABLE)
    }

    async fn try_lock(&self, conn: &mut AnyConnection, key: u32) -> MigrateResult<bool> {
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(i64::from(key))
            .fetch_one(&mut *conn)
            .await?;
        debug!("pg_try_advisory_lock({}) -> {}", key, acquired);
        Ok(acquired)
    }

    async fn unlock(&self, conn: &mut AnyConnection, key: u32) -> MigrateResult<()> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(i64::from(key))
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}
