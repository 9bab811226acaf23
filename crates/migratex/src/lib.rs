//! # migratex
//!
//! Transactional schema migrations for PostgreSQL, MySQL and SQLite.
//!
//! Every migration runs in its own transaction while holding a server-side
//! advisory lock, so concurrent processes sharing a database never apply the
//! same step twice. Progress lives in a one-row version table whose dirty flag
//! stops further runs after an attempt that never finished cleanly.
//!
//! ```no_run
//! use migratex::{Migration, MigrationSet, Migrator, MigratorConfig, SqlMigration};
//!
//! # async fn run() -> migratex::MigrateResult<()> {
//! let migrator = Migrator::connect("postgres://localhost/app", MigratorConfig::default()).await?;
//!
//! let units: Vec<Box<dyn Migration>> = vec![
//!     Box::new(SqlMigration::new(
//!         1,
//!         "create_users",
//!         "CREATE TABLE users (id BIGINT PRIMARY KEY, name TEXT NOT NULL)",
//!         "DROP TABLE users",
//!     )),
//!     Box::new(SqlMigration::new(
//!         2,
//!         "add_email",
//!         "ALTER TABLE users ADD COLUMN email TEXT",
//!         "ALTER TABLE users DROP COLUMN email",
//!     )),
//! ];
//! let mut set = MigrationSet::new(units)?;
//!
//! let result = migrator.run_up(&mut set).await?;
//! assert_eq!(result.final_version, 2);
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod config;
pub mod error;
pub mod lock;
pub mod migrations;

pub use backends::{DatabaseBackendType, Dialect};
pub use config::{ConfigError, MigratorConfig, DEFAULT_LOCK_SALT, DEFAULT_MIGRATIONS_TABLE};
pub use error::{MigrateError, MigrateResult, MultiError};
pub use lock::{generate_lock_id, AdvisoryLock};
pub use migrations::*;
