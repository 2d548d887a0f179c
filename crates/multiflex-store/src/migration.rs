//! Schema migrations
//!
//! Migration scripts are numbered from 1 without gaps. Script `n` upgrades a
//! container from schema version `n - 1` to `n`, so the expected version is
//! the number of scripts found. Discovery runs once per process.

use crate::tables::Table;
use std::sync::OnceLock;

/// A single schema change
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Statement {
    /// Create a table (no-op if it exists)
    CreateTable(Table),
}

/// An ordered list of statements upgrading the schema by one version
#[derive(Debug)]
pub struct MigrationScript {
    pub name: &'static str,
    pub statements: &'static [Statement],
}

static SCRIPTS: [MigrationScript; 2] = [
    MigrationScript {
        name: "0001_meta_and_descriptors",
        statements: &[
            Statement::CreateTable(Table::Meta),
            Statement::CreateTable(Table::TrackDescriptor),
            Statement::CreateTable(Table::TrackDescriptorContent),
        ],
    },
    MigrationScript {
        name: "0002_track",
        statements: &[Statement::CreateTable(Table::Track)],
    },
];

static MIGRATIONS: OnceLock<Vec<&'static MigrationScript>> = OnceLock::new();

/// Look up the script upgrading to `version`.
fn script(version: usize) -> Option<&'static MigrationScript> {
    version.checked_sub(1).and_then(|i| SCRIPTS.get(i))
}

/// Collect scripts starting at version 1 until the first one is missing.
fn discover<F>(lookup: F) -> Vec<&'static MigrationScript>
where
    F: Fn(usize) -> Option<&'static MigrationScript>,
{
    (1..).map_while(lookup).collect()
}

/// All known migration scripts in order
pub fn migrations() -> &'static [&'static MigrationScript] {
    MIGRATIONS.get_or_init(|| discover(script))
}

/// Schema version a fully migrated container has
pub fn expected_version() -> i32 {
    // at most a handful of scripts
    migrations().len() as i32
}

/// Scripts still to be applied to a container at `from_version`.
pub fn pending(from_version: i32) -> &'static [&'static MigrationScript] {
    let all = migrations();
    let from = usize::try_from(from_version).unwrap_or(0).min(all.len());
    &all[from..]
}
