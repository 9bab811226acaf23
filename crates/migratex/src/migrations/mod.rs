//! Migration System
//!
//! Versioned, reversible migration units, the single-row version store, and
//! the runner that applies them one locked transaction at a time.

pub mod definitions;
pub mod runner;
pub mod set;
pub mod store;

pub use definitions::{
    split_sql_statements, BoxFuture, FnMigration, Migration, MigrationDirection,
    MigrationRunResult, SqlMigration,
};
pub use runner::Migrator;
pub use set::MigrationSet;
pub use store::{VersionState, VersionStore, NIL_VERSION};
