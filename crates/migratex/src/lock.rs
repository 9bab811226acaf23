//! Advisory Lock - cross-process mutual exclusion for migration steps
//!
//! The lock lives on the database server and is keyed by a number derived
//! from the migrations table name. If the process dies the server reaps the
//! session and the lock with it.
//!
//! NOTE: every database on a server that uses the same table name and salt
//! contends for the same key.

use sqlx::AnyConnection;
use tracing::{debug, warn};

use crate::backends::Dialect;
use crate::config::MigratorConfig;
use crate::error::{MigrateError, MigrateResult};

/// CRC-32 (IEEE 802.3, reflected) of `data`
pub fn crc32_ieee(data: &[u8]) -> u32 {
    const POLY: u32 = 0xEDB8_8320;
    let mut crc: u32 = 0xFFFF_FFFF;

    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
        }
    }

    !crc
}

/// Lock key for a migrations table: `crc32(name) * salt`, wrapping
pub fn generate_lock_id(migrations_table: &str, salt: u32) -> u32 {
    crc32_ieee(migrations_table.as_bytes()).wrapping_mul(salt)
}

/// Outcome of a body run under the lock
#[derive(Debug)]
pub struct Guarded<T> {
    /// Body result, combined with the release error when both failed
    pub result: MigrateResult<T>,
    /// The unlock call failed, so the session may still hold the lock
    pub release_failed: bool,
}

/// Advisory lock bound to one migrations table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvisoryLock {
    key: u32,
}

impl AdvisoryLock {
    pub fn new(config: &MigratorConfig) -> Self {
        Self {
            key: generate_lock_id(&config.migrations_table, config.lock_salt),
        }
    }

    pub fn key(&self) -> u32 {
        self.key
    }

    /// Take the lock or fail with [`MigrateError::Locked`]
    pub async fn acquire(
        &self,
        conn: &mut AnyConnection,
        dialect: &dyn Dialect,
    ) -> MigrateResult<()> {
        if dialect.try_lock(conn, self.key).await? {
            debug!("Advisory lock {} acquired", self.key);
            Ok(())
        } else {
            debug!("Advisory lock {} is held by another session", self.key);
            Err(MigrateError::Locked)
        }
    }

    /// Ask the server to release the lock. Safe to call when it is not held.
    pub async fn release(
        &self,
        conn: &mut AnyConnection,
        dialect: &dyn Dialect,
    ) -> MigrateResult<()> {
        dialect.unlock(conn, self.key).await?;
        debug!("Advisory lock {} released", self.key);
        Ok(())
    }

    /// Release the lock after a body ran, whatever its outcome.
    ///
    /// The body's error stays primary; a release error is appended to it, or
    /// becomes the result when the body succeeded.
    pub async fn release_after<T>(
        &self,
        conn: &mut AnyConnection,
        dialect: &dyn Dialect,
        body: MigrateResult<T>,
    ) -> Guarded<T> {
        match self.release(conn, dialect).await {
            Ok(()) => Guarded {
                result: body,
                release_failed: false,
            },
            Err(release_err) => {
                warn!("Failed to release advisory lock {}: {}", self.key, release_err);
                let result = match body {
                    Ok(_) => Err(release_err),
                    Err(body_err) => Err(body_err.with_cleanup(Some(release_err))),
                };
                Guarded {
                    result,
                    release_failed: true,
                }
            }
        }
    }
}
