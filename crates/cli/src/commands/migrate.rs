use std::path::{Path, PathBuf};

use knobs_migrate::{Manifest, MigrateOptions, MigrationReport, Migrator, SettingRegistrar};

use super::{base_dir, open_manager};
use crate::prompt::StdinConfirm;
use crate::CliError;

pub fn run(
    config_path: &Path,
    manifests: Vec<PathBuf>,
    refresh: bool,
    flush_cache: bool,
    force: bool,
    json: bool,
) -> Result<(), CliError> {
    let manager = open_manager(config_path)?;

    let manifests = if manifests.is_empty() {
        discover_manifests(&base_dir(config_path).join("settings"))?
    } else {
        manifests
    };

    let mut registrar = SettingRegistrar::new(manager.config().default_bag.clone());
    for path in &manifests {
        let manifest = Manifest::load(path).map_err(CliError::migrate)?;
        registrar.merge(&manifest)?;
        log::debug!("merged {} declarations from {}", manifest.settings.len(), path.display());
    }

    let mut migrator = Migrator::new(manager.store(), manager.registry(), manager.config());
    if let Some(backend) = manager.cache_backend() {
        migrator = migrator.with_cache(backend.clone());
    }

    let options = MigrateOptions { refresh, flush_cache, force };
    let report = migrator.run(&registrar, &mut StdinConfirm, options)?;

    if json {
        let out = serde_json::to_string_pretty(&report)
            .map_err(|e| CliError::usage(format!("cannot serialize report: {e}")))?;
        println!("{out}");
    } else {
        print_report(&report);
    }
    Ok(())
}

/// Every `*.toml` file directly under `dir`, sorted by name. A missing
/// directory yields no manifests.
fn discover_manifests(dir: &Path) -> Result<Vec<PathBuf>, CliError> {
    if !dir.is_dir() {
        log::warn!("no manifest directory at {}", dir.display());
        return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(dir)
        .map_err(|e| CliError::usage(format!("cannot read {}: {e}", dir.display())))?;

    let mut found = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| CliError::usage(format!("cannot read {}: {e}", dir.display())))?
            .path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "toml") {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

fn print_report(report: &MigrationReport) {
    if report.cache_flushed {
        println!("Cache store flushed.");
    }
    if report.refreshed {
        println!("All settings and metadata were deleted before migrating.");
    }
    println!(
        "Updated {} metadata, with {} settings updated.",
        report.metadata_updated, report.settings_transformed
    );
    println!(
        "Added {} new settings, with {} new setting rows.",
        report.metadata_created, report.settings_created
    );
    println!(
        "Deleted {} old settings, with {} setting rows deleted.",
        report.metadata_deleted, report.settings_deleted
    );
    if report.cache_keys_forgotten > 0 {
        println!("Forgot {} cache keys.", report.cache_keys_forgotten);
    }
    if !report.changed() {
        println!("Settings are up to date.");
    }
}
