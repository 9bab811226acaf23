//! MySQL / MariaDB dialect

use async_trait::async_trait;
use sqlx::AnyConnection;
use tracing::debug;

use super::{database_error_parts, DatabaseBackendType, Dialect};
use crate::error::MigrateResult;

/// SQLSTATE for ER_NO_SUCH_TABLE (1146)
const NO_SUCH_TABLE: &str = "42S02";

#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlDialect;

#[async_trait]
impl Dialect for MySqlDialect {
    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::MySQL
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn is_missing_table(&self, err: &sqlx::Error) -> bool {
        matches!(database_error_parts(err), Some((Some(code), _)) if code == NO_SUCH_TABLE)
    }

    async fn try_lock(&self, conn: &mut AnyConnection, key: u32) -> MigrateResult<bool> {
        // A zero timeout turns GET_LOCK into a try-lock. NULL means the server errored.
        let granted: Option<i64> = sqlx::query_scalar("SELECT GET_LOCK(?, 0)")
            .bind(key.to_string())
            .fetch_one(&mut *conn)
            .await?;
        debug!("GET_LOCK({}) -> {:?}", key, granted);
        Ok(granted == Some(1))
    }

    async fn unlock(&self, conn: &mut AnyConnection, key: u32) -> MigrateResult<()> {
        sqlx::query("SELECT RELEASE_LOCK(?)")
            .bind(key.to_string())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}
