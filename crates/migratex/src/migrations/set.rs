//! Migration Set - ordered collection of migration units

use super::definitions::{Migration, MigrationDirection};
use crate::error::{MigrateError, MigrateResult};

/// Migrations handed to the engine for one run.
///
/// Versions are unique and non-negative, which makes ordering by version a
/// strict total order. Contiguity is not checked here; gaps surface as
/// `OutOfOrder` from the step that hits them.
#[derive(Default)]
pub struct MigrationSet {
    migrations: Vec<Box<dyn Migration>>,
}

impl MigrationSet {
    pub fn new(migrations: Vec<Box<dyn Migration>>) -> MigrateResult<Self> {
        let mut set = Self::default();
        for migration in migrations {
            set.push(migration)?;
        }
        Ok(set)
    }

    /// Add a migration, rejecting negative or already-present versions
    pub fn push(&mut self, migration: Box<dyn Migration>) -> MigrateResult<()> {
        let version = migration.version();
        if version < 0 {
            return Err(MigrateError::InvalidMigrationSet(format!(
                "migration version {} is negative",
                version
            )));
        }
        if self.migrations.iter().any(|m| m.version() == version) {
            return Err(MigrateError::InvalidMigrationSet(format!(
                "duplicate migration version {}",
                version
            )));
        }
        self.migrations.push(migration);
        Ok(())
    }

    pub fn sort_ascending(&mut self) {
        self.migrations.sort_by_key(|m| m.version());
    }

    pub fn sort_descending(&mut self) {
        self.migrations.sort_by_key(|m| std::cmp::Reverse(m.version()));
    }

    /// Order for a run: ascending for up, descending for down
    pub fn sort_for(&mut self, direction: MigrationDirection) {
        match direction {
            MigrationDirection::Up => self.sort_ascending(),
            MigrationDirection::Down => self.sort_descending(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Migration> {
        self.migrations.iter().map(|m| m.as_ref())
    }

    /// Versions in the current order
    pub fn versions(&self) -> Vec<i64> {
        self.iter().map(|m| m.version()).collect()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

impl std::fmt::Debug for MigrationSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationSet")
            .field("versions", &self.versions())
            .finish()
    }
}

impl TryFrom<Vec<Box<dyn Migration>>> for MigrationSet {
    type Error = MigrateError;

    fn try_from(migrations: Vec<Box<dyn Migration>>) -> Result<Self, Self::Error> {
        Self::new(migrations)
    }
}
