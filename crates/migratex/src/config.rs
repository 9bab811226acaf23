//! Migrator configuration
//!
//! The version table name and the advisory lock salt are explicit values
//! handed to each `Migrator`, so several engines can coexist in one process.

use std::env;

use thiserror::Error;

/// Version table used when none is configured
pub const DEFAULT_MIGRATIONS_TABLE: &str = "schema_migrations";

/// Multiplier applied to the table-name checksum when deriving the lock key
pub const DEFAULT_LOCK_SALT: u32 = 1486364155;

const MAX_TABLE_NAME_LEN: usize = 63;

const ENV_MIGRATIONS_TABLE: &str = "MIGRATEX_MIGRATIONS_TABLE";
const ENV_LOCK_SALT: &str = "MIGRATEX_LOCK_SALT";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {field}: '{value}', expected {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },
}

/// Configuration for the migration engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigratorConfig {
    /// Table holding the single version-state row
    pub migrations_table: String,
    /// Salt for the advisory lock key
    pub lock_salt: u32,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            migrations_table: DEFAULT_MIGRATIONS_TABLE.to_string(),
            lock_salt: DEFAULT_LOCK_SALT,
        }
    }
}

impl MigratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_migrations_table(mut self, table: impl Into<String>) -> Self {
        self.migrations_table = table.into();
        self
    }

    pub fn with_lock_salt(mut self, salt: u32) -> Self {
        self.lock_salt = salt;
        self
    }

    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// Reads `MIGRATEX_MIGRATIONS_TABLE` and `MIGRATEX_LOCK_SALT`. The result is validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(table) = get_env_optional(ENV_MIGRATIONS_TABLE) {
            config.migrations_table = table;
        }

        if let Some(salt) = get_env_optional(ENV_LOCK_SALT) {
            config.lock_salt = salt.parse().map_err(|_| ConfigError::InvalidValue {
                field: ENV_LOCK_SALT.to_string(),
                value: salt.clone(),
                expected: "an unsigned 32-bit integer".to_string(),
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// The table name is spliced into DDL and DML, so it must be a plain identifier.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let name = &self.migrations_table;
        let mut chars = name.chars();

        let starts_ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
        let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

        if !starts_ok || !rest_ok || name.len() > MAX_TABLE_NAME_LEN {
            return Err(ConfigError::InvalidValue {
                field: "migrations_table".to_string(),
                value: name.clone(),
                expected: format!(
                    "1-{} ASCII letters, digits or '_', not starting with a digit",
                    MAX_TABLE_NAME_LEN
                ),
            });
        }

        Ok(())
    }
}

fn get_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}
