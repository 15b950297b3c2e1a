use knobs_store::{OwnerRegistry, SettingsStore};

use crate::error::MigrateError;

/// Deletes settings whose metadata is gone or whose owner no longer exists
/// in its table. Returns the number of rows removed.
pub fn clean_orphaned_settings(store: &SettingsStore, registry: &OwnerRegistry) -> Result<usize, MigrateError> {
    if registry.is_empty() {
        log::warn!("no owner types registered; only settings without metadata will be removed");
    }
    let tx = store.transaction()?;
    let deleted = store.delete_orphaned_settings(registry)?;
    tx.commit()?;
    log::info!("deleted {deleted} orphaned settings");
    Ok(deleted)
}
