//! Reconciles persisted settings metadata with declared settings.
//!
//! Declarations come from code ([`SettingRegistrar`]) or a TOML
//! [`Manifest`]. The [`Migrator`] creates, updates and removes metadata,
//! fills or migrates per-owner rows, and invalidates cached snapshots.

pub mod clean;
pub mod confirm;
pub mod declaration;
pub mod error;
pub mod manifest;
pub mod migrator;
pub mod registrar;

pub use clean::clean_orphaned_settings;
pub use confirm::{AssumeNo, AssumeYes, Confirm};
pub use declaration::{Declaration, Transform};
pub use error::MigrateError;
pub use manifest::{Manifest, ManifestEntry};
pub use migrator::{MigrateOptions, MigrationReport, Migrator};
pub use registrar::{DeclarationSource, SettingRegistrar};
