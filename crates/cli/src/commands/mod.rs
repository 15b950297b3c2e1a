pub mod clean;
pub mod migrate;
pub mod publish;

use std::path::{Path, PathBuf};

use knobs_store::{SettingsManager, StoreConfig};

use crate::CliError;

/// Directory that relative paths in the config resolve against.
pub fn base_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Loads and validates the config, rebasing the database and cache paths
/// onto the config file's directory.
pub fn load_config(config_path: &Path) -> Result<StoreConfig, CliError> {
    if !config_path.exists() {
        return Err(CliError::config(format!("config file not found: {}", config_path.display()))
            .with_hint("create knobs.toml or pass --config <path>"));
    }
    let mut config = StoreConfig::load(config_path)?;
    let base = base_dir(config_path);
    if config.database.is_relative() {
        config.database = base.join(&config.database);
    }
    if let Some(path) = config.cache.path.as_mut() {
        if path.is_relative() {
            *path = base.join(&*path);
        }
    }
    log::debug!("loaded config from {}", config_path.display());
    Ok(config)
}

/// Opens the configured database and cache.
pub fn open_manager(config_path: &Path) -> Result<SettingsManager, CliError> {
    let config = load_config(config_path)?;
    Ok(SettingsManager::from_config(config)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_dir_of_bare_file_is_cwd() {
        assert_eq!(base_dir(Path::new("knobs.toml")), PathBuf::from("."));
        assert_eq!(base_dir(Path::new("deploy/knobs.toml")), PathBuf::from("deploy"));
    }

    #[test]
    fn relative_paths_follow_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knobs.toml");
        std::fs::write(
            &path,
            "database = \"data/settings.db\"\n[cache]\nstore = \"sqlite\"\npath = \"cache.db\"\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.database, dir.path().join("data/settings.db"));
        assert_eq!(config.cache.path, Some(dir.path().join("cache.db")));
    }

    #[test]
    fn missing_config_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(&dir.path().join("absent.toml")).unwrap_err();
        assert_eq!(err.code, crate::exit_codes::EXIT_CONFIG);
        assert!(err.hint.is_some());
    }
}
