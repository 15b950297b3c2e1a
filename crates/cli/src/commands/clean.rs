use std::path::Path;

use knobs_migrate::clean_orphaned_settings;

use super::open_manager;
use crate::CliError;

pub fn run(config_path: &Path, json: bool) -> Result<(), CliError> {
    let manager = open_manager(config_path)?;
    let deleted = clean_orphaned_settings(manager.store(), manager.registry())?;

    if json {
        println!("{}", serde_json::json!({ "deleted": deleted }));
    } else {
        println!("Deleted {deleted} orphaned settings.");
    }
    Ok(())
}
