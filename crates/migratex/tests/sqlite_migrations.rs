use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use migratex::{
    DatabaseBackendType, FnMigration, MigrateError, MigrateResult, Migration, MigrationDirection,
    MigrationSet, Migrator, MigratorConfig, SqlMigration, VersionState, VersionStore, NIL_VERSION,
};
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyConnection, AnyPool};
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn sqlite_pool(dir: &TempDir) -> AnyPool {
    init_tracing();
    sqlx::any::install_default_drivers();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("app.db").display());
    AnyPoolOptions::new().max_connections(1).connect(&url).await.unwrap()
}

async fn setup() -> (TempDir, Migrator) {
    let dir = TempDir::new().unwrap();
    let pool = sqlite_pool(&dir).await;
    let migrator =
        Migrator::new(pool, DatabaseBackendType::SQLite, MigratorConfig::default()).unwrap();
    (dir, migrator)
}

async fn table_exists(pool: &AnyPool, table: &str) -> bool {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
        .fetch_one(pool)
        .await
        .unwrap();
    count == 1
}

async fn column_exists(pool: &AnyPool, table: &str, column: &str) -> bool {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?")
        .bind(table)
        .bind(column)
        .fetch_one(pool)
        .await
        .unwrap();
    count == 1
}

async fn mark_dirty(pool: &AnyPool, version: i64) {
    let store = VersionStore::new(DatabaseBackendType::SQLite.dialect(), "schema_migrations");
    let mut tx = pool.begin().await.unwrap();
    store.ensure_table(&mut tx).await.unwrap();
    store.write(&mut tx, version, true).await.unwrap();
    tx.commit().await.unwrap();
}

/// Creates table `t<version>` and counts how often each side ran
struct TrackedMigration {
    version: i64,
    fail_up: bool,
    ups: Arc<AtomicUsize>,
    downs: Arc<AtomicUsize>,
}

impl TrackedMigration {
    fn new(version: i64) -> Self {
        Self {
            version,
            fail_up: false,
            ups: Arc::new(AtomicUsize::new(0)),
            downs: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn failing(version: i64) -> Self {
        Self {
            fail_up: true,
            ..Self::new(version)
        }
    }

    fn counters(&self) -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        (self.ups.clone(), self.downs.clone())
    }
}

#[async_trait]
impl Migration for TrackedMigration {
    fn version(&self) -> i64 {
        self.version
    }

    fn name(&self) -> &str {
        "tracked"
    }

    async fn up(&self, conn: &mut AnyConnection) -> MigrateResult<()> {
        self.ups.fetch_add(1, Ordering::SeqCst);
        sqlx::query(&format!("CREATE TABLE t{} (id INTEGER PRIMARY KEY)", self.version))
            .execute(&mut *conn)
            .await?;
        if self.fail_up {
            return Err(MigrateError::migration(self.version, "injected failure"));
        }
        Ok(())
    }

    async fn down(&self, conn: &mut AnyConnection) -> MigrateResult<()> {
        self.downs.fetch_add(1, Ordering::SeqCst);
        sqlx::query(&format!("DROP TABLE t{}", self.version))
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}

fn tracked_set(versions: &[i64]) -> MigrationSet {
    let units: Vec<Box<dyn Migration>> = versions
        .iter()
        .map(|v| Box::new(TrackedMigration::new(*v)) as Box<dyn Migration>)
        .collect();
    MigrationSet::new(units).unwrap()
}

#[tokio::test]
async fn test_status_of_fresh_database_is_nil_without_creating_table() {
    let (_dir, migrator) = setup().await;

    assert_eq!(migrator.status().await.unwrap(), VersionState::NIL);
    assert!(!table_exists(migrator.pool(), "schema_migrations").await);
}

#[tokio::test]
async fn test_up_then_down_returns_to_nil() {
    let (_dir, migrator) = setup().await;
    let mut set = tracked_set(&[3, 1, 2]);

    let up = migrator.run_up(&mut set).await.unwrap();
    assert_eq!(up.direction, MigrationDirection::Up);
    assert_eq!(up.applied_migrations, vec![1, 2, 3]);
    assert_eq!(up.final_version, 3);
    assert_eq!(migrator.status().await.unwrap(), VersionState::new(3, false));
    for table in ["t1", "t2", "t3"] {
        assert!(table_exists(migrator.pool(), table).await);
    }

    let down = migrator.run_down(&mut set).await.unwrap();
    assert_eq!(down.applied_migrations, vec![3, 2, 1]);
    assert_eq!(down.final_version, -1);
    assert_eq!(migrator.status().await.unwrap(), VersionState::NIL);
    for table in ["t1", "t2", "t3"] {
        assert!(!table_exists(migrator.pool(), table).await);
    }
}

#[tokio::test]
async fn test_run_up_twice_applies_nothing_the_second_time() {
    let (_dir, migrator) = setup().await;

    let first = TrackedMigration::new(1);
    let second = TrackedMigration::new(2);
    let (ups_1, _) = first.counters();
    let (ups_2, _) = second.counters();
    let units: Vec<Box<dyn Migration>> = vec![Box::new(first), Box::new(second)];
    let mut set = MigrationSet::new(units).unwrap();

    migrator.run_up(&mut set).await.unwrap();
    let again = migrator.run_up(&mut set).await.unwrap();

    assert!(again.applied_migrations.is_empty());
    assert_eq!(again.skipped_count, 2);
    assert_eq!(again.final_version, 2);
    assert_eq!(ups_1.load(Ordering::SeqCst), 1);
    assert_eq!(ups_2.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dirty_store_refuses_every_run() {
    let (_dir, migrator) = setup().await;

    let mut applied = tracked_set(&[1]);
    migrator.run_up(&mut applied).await.unwrap();
    mark_dirty(migrator.pool(), 1).await;

    let first = TrackedMigration::new(1);
    let second = TrackedMigration::new(2);
    let (ups_2, _) = second.counters();
    let (_, downs_1) = first.counters();
    let units: Vec<Box<dyn Migration>> = vec![Box::new(first), Box::new(second)];
    let mut set = MigrationSet::new(units).unwrap();

    let err = migrator.run_up(&mut set).await.unwrap_err();
    assert!(matches!(err, MigrateError::Dirty));
    let err = migrator.run_down(&mut set).await.unwrap_err();
    assert!(matches!(err, MigrateError::Dirty));

    assert_eq!(ups_2.load(Ordering::SeqCst), 0);
    assert_eq!(downs_1.load(Ordering::SeqCst), 0);
    assert!(table_exists(migrator.pool(), "t1").await);
    assert!(!table_exists(migrator.pool(), "t2").await);
    assert_eq!(migrator.status().await.unwrap(), VersionState::new(1, true));
}

#[tokio::test]
async fn test_gap_in_set_fails_out_of_order_and_keeps_version() {
    let (_dir, migrator) = setup().await;

    migrator.run_up(&mut tracked_set(&[1])).await.unwrap();

    let err = migrator.run_up(&mut tracked_set(&[1, 3])).await.unwrap_err();
    assert!(matches!(err, MigrateError::OutOfOrder { version: 3, current: 1 }));
    assert_eq!(migrator.status().await.unwrap(), VersionState::new(1, false));
    assert!(!table_exists(migrator.pool(), "t3").await);
}

#[tokio::test]
async fn test_failed_forward_operation_rolls_back_dirty_write() {
    let (_dir, migrator) = setup().await;

    migrator.run_up(&mut tracked_set(&[1])).await.unwrap();

    let mut set = MigrationSet::new(vec![
        Box::new(TrackedMigration::new(1)) as Box<dyn Migration>,
        Box::new(TrackedMigration::failing(2)),
    ])
    .unwrap();
    let err = migrator.run_up(&mut set).await.unwrap_err();
    assert!(matches!(err, MigrateError::Migration { version: 2, .. }));

    // neither the dirty flag nor the table created before the failure survive
    assert_eq!(migrator.status().await.unwrap(), VersionState::new(1, false));
    assert!(!table_exists(migrator.pool(), "t2").await);
}

#[tokio::test]
async fn test_run_stops_at_first_failure_keeping_earlier_steps() {
    let (_dir, migrator) = setup().await;

    let third = TrackedMigration::new(3);
    let (ups_3, _) = third.counters();
    let mut set = MigrationSet::new(vec![
        Box::new(TrackedMigration::new(1)) as Box<dyn Migration>,
        Box::new(TrackedMigration::failing(2)),
        Box::new(third),
    ])
    .unwrap();

    assert!(migrator.run_up(&mut set).await.is_err());
    assert_eq!(migrator.status().await.unwrap(), VersionState::new(1, false));
    assert!(table_exists(migrator.pool(), "t1").await);
    assert_eq!(ups_3.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_column_migration_up_and_down() {
    let (_dir, migrator) = setup().await;
    sqlx::query("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
        .execute(migrator.pool())
        .await
        .unwrap();

    let mut set = MigrationSet::new(vec![Box::new(SqlMigration::new(
        1,
        "add_users_email",
        "ALTER TABLE users ADD COLUMN email TEXT",
        "ALTER TABLE users DROP COLUMN email",
    )) as Box<dyn Migration>])
    .unwrap();

    migrator.run_up(&mut set).await.unwrap();
    assert_eq!(migrator.status().await.unwrap(), VersionState::new(1, false));
    assert!(column_exists(migrator.pool(), "users", "email").await);

    migrator.run_down(&mut set).await.unwrap();
    assert_eq!(migrator.status().await.unwrap(), VersionState::NIL);
    assert!(!column_exists(migrator.pool(), "users", "email").await);
}

#[tokio::test]
async fn test_multi_statement_sql_migration() {
    let (_dir, migrator) = setup().await;

    let mut set = MigrationSet::new(vec![Box::new(SqlMigration::new(
        1,
        "create_notes",
        "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT);\n\
         INSERT INTO notes (body) VALUES ('first; with a semicolon');\n\
         CREATE INDEX idx_notes_body ON notes (body);",
        "DROP INDEX idx_notes_body; DROP TABLE notes;",
    )) as Box<dyn Migration>])
    .unwrap();

    migrator.run_up(&mut set).await.unwrap();
    let body: String = sqlx::query_scalar("SELECT body FROM notes")
        .fetch_one(migrator.pool())
        .await
        .unwrap();
    assert_eq!(body, "first; with a semicolon");

    migrator.run_down(&mut set).await.unwrap();
    assert!(!table_exists(migrator.pool(), "notes").await);
}

#[tokio::test]
async fn test_down_on_unmigrated_store_skips_everything() {
    let (_dir, migrator) = setup().await;

    let first = TrackedMigration::new(1);
    let (_, downs) = first.counters();
    let mut set = MigrationSet::new(vec![Box::new(first) as Box<dyn Migration>]).unwrap();

    let result = migrator.run_down(&mut set).await.unwrap();
    assert!(result.applied_migrations.is_empty());
    assert_eq!(result.skipped_count, 1);
    assert_eq!(downs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_partial_down_only_reverts_applied_units() {
    let (_dir, migrator) = setup().await;

    migrator.run_up(&mut tracked_set(&[1, 2])).await.unwrap();

    // the set knows about 3, but it was never applied
    let result = migrator.run_down(&mut tracked_set(&[1, 2, 3])).await.unwrap();
    assert_eq!(result.applied_migrations, vec![2, 1]);
    assert_eq!(result.skipped_count, 1);
    assert_eq!(migrator.status().await.unwrap(), VersionState::NIL);
}

#[tokio::test]
async fn test_force_version_recovers_from_dirty_state() {
    let (_dir, migrator) = setup().await;

    migrator.run_up(&mut tracked_set(&[1])).await.unwrap();
    mark_dirty(migrator.pool(), 2).await;
    assert!(matches!(
        migrator.run_up(&mut tracked_set(&[1, 2])).await.unwrap_err(),
        MigrateError::Dirty
    ));

    // operator repaired the schema by hand and resets to the last good version
    migrator.force_version(1).await.unwrap();

    let result = migrator.run_up(&mut tracked_set(&[1, 2])).await.unwrap();
    assert_eq!(result.applied_migrations, vec![2]);
    assert_eq!(migrator.status().await.unwrap(), VersionState::new(2, false));
}

#[tokio::test]
async fn test_separate_tables_track_independent_versions() {
    let dir = TempDir::new().unwrap();
    let pool = sqlite_pool(&dir).await;

    let app =
        Migrator::new(pool.clone(), DatabaseBackendType::SQLite, MigratorConfig::default())
            .unwrap();
    let plugin = Migrator::new(
        pool,
        DatabaseBackendType::SQLite,
        MigratorConfig::new().with_migrations_table("plugin_migrations"),
    )
    .unwrap();
    assert_ne!(app.lock_id(), plugin.lock_id());

    app.run_up(&mut tracked_set(&[1, 2])).await.unwrap();

    let plugin_init: Box<dyn Migration> = Box::new(SqlMigration::new(
        10,
        "plugin_init",
        "CREATE TABLE plugin_state (id INTEGER)",
        "DROP TABLE plugin_state",
    ));
    plugin
        .run_up(&mut MigrationSet::new(vec![plugin_init]).unwrap())
        .await
        .unwrap();

    assert_eq!(app.status().await.unwrap(), VersionState::new(2, false));
    assert_eq!(plugin.status().await.unwrap(), VersionState::new(10, false));
}

#[tokio::test]
async fn test_connect_detects_backend_from_url() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("connect.db").display());

    let migrator = Migrator::connect(&url, MigratorConfig::default()).await.unwrap();
    assert_eq!(migrator.backend(), DatabaseBackendType::SQLite);
    assert_eq!(migrator.lock_id(), 623036762);

    let result = migrator.run_up(&mut tracked_set(&[1])).await.unwrap();
    assert_eq!(result.final_version, 1);
}

#[tokio::test]
async fn test_closure_migration_backfills_and_reverts() {
    let (_dir, migrator) = setup().await;

    let create: Box<dyn Migration> = Box::new(SqlMigration::new(
        1,
        "create_settings",
        "CREATE TABLE settings (name TEXT PRIMARY KEY)",
        "DROP TABLE settings",
    ));
    let seed: Box<dyn Migration> = Box::new(
        FnMigration::new(
            2,
            |conn| {
                Box::pin(async move {
                    for name in ["theme", "locale"] {
                        sqlx::query("INSERT INTO settings (name) VALUES (?)")
                            .bind(name)
                            .execute(&mut *conn)
                            .await?;
                    }
                    Ok::<(), MigrateError>(())
                })
            },
            |conn| {
                Box::pin(async move {
                    sqlx::query("DELETE FROM settings").execute(conn).await?;
                    Ok::<(), MigrateError>(())
                })
            },
        )
        .with_name("seed_settings"),
    );
    let mut set = MigrationSet::new(vec![create, seed]).unwrap();

    migrator.run_up(&mut set).await.unwrap();
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM settings")
        .fetch_one(migrator.pool())
        .await
        .unwrap();
    assert_eq!(count, 2);

    let down = migrator.run_down(&mut set).await.unwrap();
    assert_eq!(down.applied_migrations, vec![2, 1]);
    assert!(!table_exists(migrator.pool(), "settings").await);
    assert_eq!(migrator.status().await.unwrap(), VersionState::NIL);
}

#[tokio::test]
async fn test_down_past_lowest_unit_records_nil() {
    let (_dir, migrator) = setup().await;

    // the first unit applied to an empty store may have any version
    migrator.run_up(&mut tracked_set(&[5, 6])).await.unwrap();
    assert_eq!(migrator.status().await.unwrap(), VersionState::new(6, false));

    let result = migrator.run_down(&mut tracked_set(&[5, 6])).await.unwrap();
    assert_eq!(result.applied_migrations, vec![6, 5]);
    assert_eq!(result.final_version, NIL_VERSION);
    assert_eq!(migrator.status().await.unwrap(), VersionState::NIL);

    let again = migrator.run_up(&mut tracked_set(&[5, 6])).await.unwrap();
    assert_eq!(again.applied_migrations, vec![5, 6]);
}
