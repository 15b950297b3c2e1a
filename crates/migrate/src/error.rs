use std::fmt;

use knobs_store::{CacheError, SettingsError};

#[derive(Debug)]
pub enum MigrateError {
    /// Cache flush requested while caching is disabled.
    CacheDisabled,
    /// Two or more owner kinds share a table.
    DuplicateOwnerTables(Vec<String>),
    /// No persisted metadata and no declarations.
    NothingToMigrate,
    /// `from` references that resolve to neither a declaration nor metadata.
    UnresolvedTargets(Vec<String>),
    /// New declarations whose `from` references form a cycle.
    CircularMigration(Vec<String>),
    /// The operator declined a confirmation gate.
    Rejected(String),
    /// Manifest file could not be read or parsed.
    Manifest(String),
    /// Store or cache failure.
    Settings(SettingsError),
}

impl fmt::Display for MigrateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CacheDisabled => write!(f, "cannot flush the cache: settings cache is not enabled"),
            Self::DuplicateOwnerTables(tables) => write!(
                f,
                "{} owner tables are used by more than one owner type: {}",
                tables.len(),
                tables.join(", ")
            ),
            Self::NothingToMigrate => write!(f, "there is no metadata or declarations to migrate"),
            Self::UnresolvedTargets(names) => write!(
                f,
                "one or more migrations have non-existent targets: {}",
                names.join(", ")
            ),
            Self::CircularMigration(names) => {
                write!(f, "new settings migrate from each other in a cycle: {}", names.join(", "))
            }
            Self::Rejected(what) => write!(f, "{what} has been rejected by the user"),
            Self::Manifest(msg) => write!(f, "manifest error: {msg}"),
            Self::Settings(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for MigrateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Settings(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SettingsError> for MigrateError {
    fn from(e: SettingsError) -> Self {
        Self::Settings(e)
    }
}

impl From<CacheError> for MigrateError {
    fn from(e: CacheError) -> Self {
        Self::Settings(SettingsError::Cache(e))
    }
}
