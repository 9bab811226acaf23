//! Migration Runner - Executes migrations against the database
//!
//! Each pending migration runs in its own transaction on its own connection,
//! guarded by the advisory lock:
//!
//! 1. take the lock (or fail with `Locked`)
//! 2. re-read the version row; refuse if dirty
//! 3. enforce monotonicity against the freshly read version
//! 4. mark the row dirty at the target version
//! 5. run the migration
//! 6. record the new version as clean
//! 7. commit, or roll back on any error
//! 8. release the lock, keeping the step's error primary
//!
//! A run stops at the first failing step. Steps committed before it stay applied.
//!
//! On backends whose lock belongs to the session, the step's connection is
//! detached from the pool. If the run future is dropped mid-step the
//! connection is dropped with it, the session ends and the server frees the
//! lock, instead of a locked connection going back to the idle queue.

use std::ops::{Deref, DerefMut};
use std::time::Instant;

use sqlx::any::AnyPoolOptions;
use sqlx::pool::PoolConnection;
use sqlx::{Any, AnyConnection, AnyPool, Connection, Transaction};
use tracing::{debug, info, warn};

use super::definitions::{Migration, MigrationDirection, MigrationRunResult};
use super::set::MigrationSet;
use super::store::{VersionState, VersionStore, NIL_VERSION};
use crate::backends::{DatabaseBackendType, Dialect};
use crate::config::MigratorConfig;
use crate::error::{MigrateError, MigrateResult};
use crate::lock::AdvisoryLock;

/// Work done inside one locked transaction
enum StepBody<'a> {
    Apply {
        migration: &'a dyn Migration,
        direction: MigrationDirection,
        target: i64,
    },
    Force(i64),
}

/// Connection a locked step runs on
enum StepConnection {
    /// Returns to the pool when dropped
    Pooled(PoolConnection<Any>),
    /// Closed when dropped, taking any session lock with it
    Detached(AnyConnection),
}

impl StepConnection {
    async fn acquire(pool: &AnyPool, dialect: &dyn Dialect) -> MigrateResult<Self> {
        let conn = pool.acquire().await?;
        if dialect.holds_session_lock() {
            Ok(StepConnection::Detached(conn.detach()))
        } else {
            Ok(StepConnection::Pooled(conn))
        }
    }

    /// Hand the connection back once the lock is released
    async fn finish(self) {
        if let StepConnection::Detached(conn) = self {
            if let Err(e) = conn.close().await {
                debug!("Closing detached migration connection failed: {}", e);
            }
        }
    }

    /// End the session, dropping whatever the server still holds for it
    async fn close(self) -> Result<(), sqlx::Error> {
        match self {
            StepConnection::Pooled(conn) => conn.close().await,
            StepConnection::Detached(conn) => conn.close().await,
        }
    }
}

impl Deref for StepConnection {
    type Target = AnyConnection;

    fn deref(&self) -> &AnyConnection {
        match self {
            StepConnection::Pooled(conn) => &**conn,
            StepConnection::Detached(conn) => conn,
        }
    }
}

impl DerefMut for StepConnection {
    fn deref_mut(&mut self) -> &mut AnyConnection {
        match self {
            StepConnection::Pooled(conn) => &mut **conn,
            StepConnection::Detached(conn) => conn,
        }
    }
}

/// Migration engine bound to one database and one version table
pub struct Migrator {
    pool: AnyPool,
    backend: DatabaseBackendType,
    dialect: &'static dyn Dialect,
    config: MigratorConfig,
    store: VersionStore,
    lock: AdvisoryLock,
}

impl Migrator {
    /// Create a migrator over an existing pool
    pub fn new(
        pool: AnyPool,
        backend: DatabaseBackendType,
        config: MigratorConfig,
    ) -> MigrateResult<Self> {
        config.validate()?;
        let dialect = backend.dialect();
        let store = VersionStore::new(dialect, config.migrations_table.clone());
        let lock = AdvisoryLock::new(&config);

        Ok(Self {
            pool,
            backend,
            dialect,
            config,
            store,
            lock,
        })
    }

    /// Connect to `database_url`, detecting the backend from its scheme
    pub async fn connect(database_url: &str, config: MigratorConfig) -> MigrateResult<Self> {
        sqlx::any::install_default_drivers();
        let backend = DatabaseBackendType::from_url(database_url)?;
        let pool = AnyPoolOptions::new().connect(database_url).await?;
        Self::new(pool, backend, config)
    }

    #[cfg(test)]
    pub(crate) fn with_dialect(mut self, dialect: &'static dyn Dialect) -> Self {
        self.store = VersionStore::new(dialect, self.config.migrations_table.clone());
        self.dialect = dialect;
        self
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn backend(&self) -> DatabaseBackendType {
        self.backend
    }

    pub fn config(&self) -> &MigratorConfig {
        &self.config
    }

    /// Advisory lock key used by this migrator
    pub fn lock_id(&self) -> u32 {
        self.lock.key()
    }

    /// Apply every migration in `set` newer than the current version, in ascending order
    pub async fn run_up(&self, set: &mut MigrationSet) -> MigrateResult<MigrationRunResult> {
        self.run(MigrationDirection::Up, set).await
    }

    /// Revert every migration in `set` at or below the current version, in descending order
    pub async fn run_down(&self, set: &mut MigrationSet) -> MigrateResult<MigrationRunResult> {
        self.run(MigrationDirection::Down, set).await
    }

    /// Read the stored state without creating the version table
    pub async fn status(&self) -> MigrateResult<VersionState> {
        let mut tx = self.pool.begin().await?;
        let result = self.store.read(&mut tx).await;
        rollback(tx).await;
        result
    }

    /// Overwrite the stored state with `(version, dirty = false)`.
    ///
    /// This is the operator's way out of a dirty state after repairing the
    /// schema by hand. The engine never calls it. Passing [`NIL_VERSION`]
    /// empties the table.
    pub async fn force_version(&self, version: i64) -> MigrateResult<()> {
        warn!(
            "Forcing {} to version {} (dirty flag cleared)",
            self.store.table(),
            version
        );
        self.locked_step(StepBody::Force(version)).await.map(|_| ())
    }

    async fn run(
        &self,
        direction: MigrationDirection,
        set: &mut MigrationSet,
    ) -> MigrateResult<MigrationRunResult> {
        let start_time = Instant::now();

        let initial = self.initial_state().await?;
        set.sort_for(direction);

        let versions = set.versions();
        let mut current = initial.version;
        let mut applied_migrations = Vec::new();
        let mut skipped_count = 0;

        for (index, migration) in set.iter().enumerate() {
            let version = migration.version();
            let pending = match direction {
                MigrationDirection::Up => current < version,
                MigrationDirection::Down => current >= version,
            };

            if !pending {
                debug!(
                    "Skipping migration {} ({}), current version is {}",
                    version, direction, current
                );
                skipped_count += 1;
                continue;
            }

            // reverting lands on the next lower unit, or NIL past the lowest
            let target = match direction {
                MigrationDirection::Up => version,
                MigrationDirection::Down => versions.get(index + 1).copied().unwrap_or(NIL_VERSION),
            };

            info!("Running migration {} {} ({})", version, migration.name(), direction);
            match self.step(migration, direction, target).await {
                Ok(new_version) => {
                    current = new_version;
                    applied_migrations.push(version);
                }
                Err(e) => {
                    warn!("Migration {} ({}) failed: {}", version, direction, e);
                    return Err(e);
                }
            }
        }

        let result = MigrationRunResult {
            direction,
            applied_migrations,
            skipped_count,
            final_version: current,
            execution_time_ms: start_time.elapsed().as_millis(),
        };

        info!(
            "Migrated {}: {} applied, {} skipped, now at version {} ({}ms)",
            direction,
            result.applied_count(),
            result.skipped_count,
            result.final_version,
            result.execution_time_ms
        );

        Ok(result)
    }

    /// Ensure the version table exists and fail fast on a dirty store
    async fn initial_state(&self) -> MigrateResult<VersionState> {
        let mut tx = self.pool.begin().await?;

        let result = async {
            self.store.ensure_table(&mut tx).await?;
            self.store.read(&mut tx).await
        }
        .await;

        match result {
            Ok(state) if state.dirty => {
                rollback(tx).await;
                warn!("{} is dirty at version {}", self.store.table(), state.version);
                Err(MigrateError::Dirty)
            }
            Ok(state) => {
                tx.commit().await?;
                Ok(state)
            }
            Err(e) => {
                rollback(tx).await;
                Err(e)
            }
        }
    }

    /// Run one migration step in its own locked transaction, recording
    /// `target` as the new version
    pub(crate) async fn step(
        &self,
        migration: &dyn Migration,
        direction: MigrationDirection,
        target: i64,
    ) -> MigrateResult<i64> {
        self.locked_step(StepBody::Apply {
            migration,
            direction,
            target,
        })
        .await
    }

    async fn locked_step(&self, body: StepBody<'_>) -> MigrateResult<i64> {
        let dialect = self.dialect;
        let mut conn = StepConnection::acquire(&self.pool, dialect).await?;
        let mut tx = conn.begin().await?;

        let acquired = self.lock.acquire(&mut tx, dialect).await;
        if let Err(e) = acquired {
            rollback(tx).await;
            return Err(e);
        }

        // Session-level locks survive commit and rollback, so the lock is
        // released only once the outcome is durable.
        let body_result = self.run_body(&mut tx, body).await;
        let outcome = match body_result {
            Ok(new_version) => match tx.commit().await {
                Ok(()) => Ok(new_version),
                Err(e) => Err(MigrateError::from(e)),
            },
            Err(e) => {
                rollback(tx).await;
                Err(e)
            }
        };

        let committed = outcome.as_ref().ok().copied();
        let guarded = self.lock.release_after(&mut conn, dialect, outcome).await;
        if !guarded.release_failed {
            conn.finish().await;
            return guarded.result;
        }

        // the server drops session locks when the session ends
        warn!("Closing database session to drop advisory lock {}", self.lock.key());
        if let Err(e) = conn.close().await {
            warn!("Failed to close database session: {}", e);
        }

        match committed {
            Some(version) => {
                warn!(
                    "Version {} is committed; advisory lock {} went with the closed session",
                    version,
                    self.lock.key()
                );
                Ok(version)
            }
            None => guarded.result,
        }
    }

    async fn run_body(&self, conn: &mut AnyConnection, body: StepBody<'_>) -> MigrateResult<i64> {
        match body {
            StepBody::Apply {
                migration,
                direction,
                target,
            } => self.apply(conn, migration, direction, target).await,
            StepBody::Force(version) => {
                self.store.ensure_table(conn).await?;
                self.store.write(conn, version, false).await?;
                Ok(version)
            }
        }
    }

    async fn apply(
        &self,
        conn: &mut AnyConnection,
        migration: &dyn Migration,
        direction: MigrationDirection,
        target: i64,
    ) -> MigrateResult<i64> {
        // re-read inside the lock: another process may have moved the version
        let state = self.store.read(conn).await?;
        if state.dirty {
            return Err(MigrateError::Dirty);
        }

        let version = migration.version();
        let contiguous = match direction {
            MigrationDirection::Up => state.version == NIL_VERSION || version == state.version + 1,
            MigrationDirection::Down => version == state.version,
        };
        if !contiguous {
            return Err(MigrateError::OutOfOrder {
                version,
                current: state.version,
            });
        }

        self.store.write(conn, version, true).await?;

        match direction {
            MigrationDirection::Up => migration.up(conn).await?,
            MigrationDirection::Down => migration.down(conn).await?,
        }

        self.store.write(conn, target, false).await?;
        debug!("Migration {} ({}) recorded, version is now {}", version, direction, target);

        Ok(target)
    }
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("backend", &self.backend)
            .field("dialect", &self.dialect)
            .field("config", &self.config)
            .field("lock_id", &self.lock.key())
            .finish()
    }
}

async fn rollback(tx: Transaction<'_, Any>) {
    if let Err(e) = tx.rollback().await {
        warn!("Failed to roll back migration transaction: {}", e);
    }
}
