use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_BAG: &str = "users";
pub const DEFAULT_CACHE_PREFIX: &str = "knobs";
pub const DEFAULT_CACHE_TTL_SECS: u64 = 60 * 60 * 3;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Bag used by declarations and owners that don't name one.
    #[serde(default = "default_bag")]
    pub default_bag: String,
    /// Deployment environment. "production" turns on confirmation gates.
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Database file, resolved by the CLI relative to the config file.
    #[serde(default = "default_database")]
    pub database: PathBuf,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub owners: Vec<OwnerConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            default_bag: default_bag(),
            environment: default_environment(),
            database: default_database(),
            cache: CacheConfig::default(),
            owners: Vec::new(),
        }
    }
}

fn default_bag() -> String {
    DEFAULT_BAG.into()
}

fn default_environment() -> String {
    "production".into()
}

fn default_database() -> PathBuf {
    PathBuf::from("settings.db")
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackendKind {
    /// Process-local map. Invisible to other processes.
    #[default]
    Memory,
    /// SQLite file shared by every process pointing at the same path.
    Sqlite,
}

impl std::fmt::Display for CacheBackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Sqlite => write!(f, "sqlite"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub store: CacheBackendKind,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Regenerate the owner's cache entry when its collection goes out of scope.
    #[serde(default = "default_automatic")]
    pub automatic: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable: false,
            store: CacheBackendKind::Memory,
            path: None,
            ttl_secs: default_ttl_secs(),
            prefix: default_prefix(),
            automatic: default_automatic(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_ttl_secs() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}

fn default_prefix() -> String {
    DEFAULT_CACHE_PREFIX.into()
}

fn default_automatic() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Owners
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OwnerConfig {
    /// Discriminator stored in `settings.settable_type`.
    #[serde(rename = "type")]
    pub owner_type: String,
    pub table: String,
    #[serde(default = "default_key")]
    pub key: String,
    #[serde(default)]
    pub bags: Option<Vec<String>>,
}

fn default_key() -> String {
    "id".into()
}

// ---------------------------------------------------------------------------
// Parse + Validate
// ---------------------------------------------------------------------------

impl StoreConfig {
    pub fn from_toml(input: &str) -> Result<Self, ConfigError> {
        let config: StoreConfig =
            toml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let input = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&input)
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_bag.trim().is_empty() {
            return Err(ConfigError::Validation("default_bag cannot be empty".into()));
        }

        if self.cache.ttl_secs == 0 {
            return Err(ConfigError::Validation("cache.ttl_secs must be greater than 0".into()));
        }

        if self.cache.prefix.trim_matches('|').is_empty() {
            return Err(ConfigError::Validation("cache.prefix cannot be empty".into()));
        }

        if self.cache.store == CacheBackendKind::Sqlite && self.cache.path.is_none() {
            return Err(ConfigError::Validation(
                "cache.store = \"sqlite\" requires cache.path".into(),
            ));
        }

        for (i, owner) in self.owners.iter().enumerate() {
            if owner.owner_type.trim().is_empty() {
                return Err(ConfigError::Validation(format!("owners[{i}]: type cannot be empty")));
            }
            if !is_identifier(&owner.table) {
                return Err(ConfigError::Validation(format!(
                    "owners[{i}]: table '{}' is not a valid identifier",
                    owner.table
                )));
            }
            if !is_identifier(&owner.key) {
                return Err(ConfigError::Validation(format!(
                    "owners[{i}]: key '{}' is not a valid identifier",
                    owner.key
                )));
            }
            if let Some(bags) = &owner.bags {
                if bags.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "owners[{i}]: bags cannot be an empty list"
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Table and column names are interpolated into SQL, so only plain identifiers pass.
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
default_bag = "members"
environment = "local"
database = "data/settings.db"

[cache]
enable = true
store = "sqlite"
path = "data/cache.db"
ttl_secs = 60
prefix = "app|"
automatic = false

[[owners]]
type = "user"
table = "users"

[[owners]]
type = "admin"
table = "admins"
key = "admin_id"
bags = ["admins", "members"]
"#;

    #[test]
    fn parse_full_config() {
        let config = StoreConfig::from_toml(FULL).unwrap();
        assert_eq!(config.default_bag, "members");
        assert!(!config.is_production());
        assert_eq!(config.database, PathBuf::from("data/settings.db"));
        assert!(config.cache.enable);
        assert_eq!(config.cache.store, CacheBackendKind::Sqlite);
        assert_eq!(config.cache.ttl(), Duration::from_secs(60));
        assert!(!config.cache.automatic);
        assert_eq!(config.owners.len(), 2);
        assert_eq!(config.owners[0].key, "id");
        assert!(config.owners[0].bags.is_none());
        assert_eq!(config.owners[1].bags.as_deref(), Some(&["admins".to_string(), "members".to_string()][..]));
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = StoreConfig::from_toml("").unwrap();
        assert_eq!(config.default_bag, DEFAULT_BAG);
        assert!(config.is_production());
        assert!(!config.cache.enable);
        assert_eq!(config.cache.store, CacheBackendKind::Memory);
        assert_eq!(config.cache.ttl_secs, DEFAULT_CACHE_TTL_SECS);
        assert_eq!(config.cache.prefix, DEFAULT_CACHE_PREFIX);
        assert!(config.cache.automatic);
    }

    #[test]
    fn reject_sqlite_cache_without_path() {
        let err = StoreConfig::from_toml("[cache]\nstore = \"sqlite\"\n").unwrap_err();
        assert!(err.to_string().contains("requires cache.path"));
    }

    #[test]
    fn reject_zero_ttl() {
        let err = StoreConfig::from_toml("[cache]\nttl_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("ttl_secs"));
    }

    #[test]
    fn reject_unknown_backend() {
        let err = StoreConfig::from_toml("[cache]\nstore = \"redis\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn reject_bad_owner_table() {
        let input = "[[owners]]\ntype = \"user\"\ntable = \"users; drop table x\"\n";
        let err = StoreConfig::from_toml(input).unwrap_err();
        assert!(err.to_string().contains("not a valid identifier"));
    }

    #[test]
    fn identifiers() {
        assert!(is_identifier("users"));
        assert!(is_identifier("_tmp_1"));
        assert!(!is_identifier("1users"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("users.id"));
    }
}
