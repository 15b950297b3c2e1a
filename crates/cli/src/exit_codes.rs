//! CLI Exit Code Registry
//!
//! This is the single source of truth for all CLI exit codes.
//! Exit codes are part of the shell contract: deploy scripts rely on them.
//!
//! | Code | Meaning                                              |
//! |------|------------------------------------------------------|
//! | 0    | Success                                              |
//! | 1    | General error (unspecified)                          |
//! | 2    | CLI usage error (bad args, unreadable manifest)      |
//! | 3    | Configuration error (missing or invalid knobs.toml)  |
//! | 4    | Integrity check failed, nothing was changed          |
//! | 5    | Operator rejected a confirmation                     |
//! | 6    | Database or cache failure                            |

use knobs_migrate::MigrateError;
use knobs_store::SettingsError;

/// Success - command completed without errors.
pub const EXIT_SUCCESS: u8 = 0;

/// General error - unspecified failure.
/// Avoid using this; prefer a specific error code.
pub const EXIT_ERROR: u8 = 1;

/// Usage error - bad arguments, missing or malformed manifest.
pub const EXIT_USAGE: u8 = 2;

/// Config file missing, unparsable or invalid.
pub const EXIT_CONFIG: u8 = 3;

/// Duplicate owner tables, unresolved `from` targets, nothing to migrate,
/// circular migrations, or a cache flush with caching disabled.
pub const EXIT_INTEGRITY: u8 = 4;

/// The operator answered no to a confirmation prompt.
pub const EXIT_REJECTED: u8 = 5;

/// SQLite or cache backend failure.
pub const EXIT_DATABASE: u8 = 6;

pub fn settings_exit_code(err: &SettingsError) -> u8 {
    match err {
        SettingsError::Database(_) | SettingsError::Cache(_) | SettingsError::Snapshot(_) => EXIT_DATABASE,
        SettingsError::InvalidIdentifier(_) | SettingsError::UnknownOwnerType(_) => EXIT_CONFIG,
        _ => EXIT_ERROR,
    }
}

pub fn migrate_exit_code(err: &MigrateError) -> u8 {
    match err {
        MigrateError::CacheDisabled
        | MigrateError::DuplicateOwnerTables(_)
        | MigrateError::NothingToMigrate
        | MigrateError::UnresolvedTargets(_)
        | MigrateError::CircularMigration(_) => EXIT_INTEGRITY,
        MigrateError::Rejected(_) => EXIT_REJECTED,
        MigrateError::Manifest(_) => EXIT_USAGE,
        MigrateError::Settings(e) => settings_exit_code(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_errors_share_a_code() {
        assert_eq!(migrate_exit_code(&MigrateError::NothingToMigrate), EXIT_INTEGRITY);
        assert_eq!(migrate_exit_code(&MigrateError::UnresolvedTargets(vec!["x".into()])), EXIT_INTEGRITY);
        assert_eq!(migrate_exit_code(&MigrateError::CacheDisabled), EXIT_INTEGRITY);
    }

    #[test]
    fn rejection_is_distinct() {
        assert_eq!(migrate_exit_code(&MigrateError::Rejected("settings migration".into())), EXIT_REJECTED);
        assert_ne!(EXIT_REJECTED, EXIT_INTEGRITY);
    }

    #[test]
    fn store_errors_map_through() {
        let err = MigrateError::Settings(SettingsError::InvalidIdentifier("a b".into()));
        assert_eq!(migrate_exit_code(&err), EXIT_CONFIG);
        let err = MigrateError::Settings(SettingsError::SettingNotFound("x".into()));
        assert_eq!(migrate_exit_code(&err), EXIT_ERROR);
    }
}
