use std::path::{Path, PathBuf};

use knobs_migrate::Confirm;

use super::base_dir;
use crate::prompt::StdinConfirm;
use crate::CliError;

pub const SAMPLE_MANIFEST: &str = r#"# Settings declared here are created, updated or deleted by `knobs migrate`.
#
# Keys per [[settings]] table:
#   name     unique setting name (required)
#   type     string | integer | float | boolean | array | collection | datetime
#   default  value new owners start with; omit for null
#   enabled  whether the setting starts enabled (default true)
#   group    free-form label for presentation (default "default")
#   bag      partition owners load from (default: default_bag in knobs.toml)
#   from     existing setting whose per-owner values seed this one

[[settings]]
name = "color"
type = "string"
default = "blue"
group = "theme"

[[settings]]
name = "notifications"
type = "boolean"
default = true

[[settings]]
name = "items_per_page"
type = "integer"
default = 25
group = "display"
"#;

pub fn run(config_path: &Path, path: Option<PathBuf>, force: bool) -> Result<(), CliError> {
    let path = path.unwrap_or_else(|| base_dir(config_path).join("settings").join("users.toml"));
    publish(&path, force, &mut StdinConfirm)
}

/// Writes the sample manifest to `path`. An existing file is replaced only
/// with `force` or the operator's confirmation.
pub fn publish(path: &Path, force: bool, confirm: &mut dyn Confirm) -> Result<(), CliError> {
    if path.exists() && !force && !confirm.confirm("A manifest file already exists. Overwrite?") {
        println!("Manifest left untouched: {}", path.display());
        return Ok(());
    }

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .map_err(|e| CliError::usage(format!("cannot create {}: {e}", dir.display())))?;
    }
    std::fs::write(path, SAMPLE_MANIFEST)
        .map_err(|e| CliError::usage(format!("cannot write {}: {e}", path.display())))?;

    println!("Manifest published. Check it at: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use knobs_migrate::{AssumeNo, AssumeYes, Manifest};

    #[test]
    fn sample_manifest_parses() {
        let manifest = Manifest::from_toml(SAMPLE_MANIFEST).unwrap();
        assert_eq!(manifest.declarations("users").unwrap().len(), 3);
    }

    #[test]
    fn creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings/users.toml");
        publish(&path, false, &mut AssumeNo).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), SAMPLE_MANIFEST);
    }

    #[test]
    fn existing_manifest_needs_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.toml");
        std::fs::write(&path, "# mine").unwrap();

        publish(&path, false, &mut AssumeNo).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# mine");

        publish(&path, false, &mut AssumeYes).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), SAMPLE_MANIFEST);
    }
}
