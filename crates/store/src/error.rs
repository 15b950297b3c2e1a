use std::fmt;

use crate::codec::SettingType;

#[derive(Debug)]
pub enum SettingsError {
    /// SQLite failure (query, constraint, transaction).
    Database(rusqlite::Error),
    /// Cache backend failure.
    Cache(CacheError),
    /// Write or lookup against a name missing from the loaded collection.
    SettingNotFound(String),
    /// Stored raw value cannot be read back as its declared type.
    Decode { kind: SettingType, raw: String, reason: String },
    /// In-memory value cannot be written as the declared type.
    Encode { kind: SettingType, reason: String },
    /// Persisted type name is not one of the known setting types.
    UnknownType(String),
    /// Cache snapshot could not be (de)serialized.
    Snapshot(String),
    /// Table or column name that cannot be interpolated into SQL.
    InvalidIdentifier(String),
    /// Owner type with no registered table.
    UnknownOwnerType(String),
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Database(e) => write!(f, "database error: {e}"),
            Self::Cache(e) => write!(f, "{e}"),
            Self::SettingNotFound(name) => write!(f, "the setting [{name}] doesn't exist"),
            Self::Decode { kind, raw, reason } => {
                write!(f, "cannot decode {kind} setting from '{raw}': {reason}")
            }
            Self::Encode { kind, reason } => write!(f, "cannot encode value as {kind}: {reason}"),
            Self::UnknownType(name) => write!(f, "unknown setting type '{name}'"),
            Self::Snapshot(msg) => write!(f, "settings snapshot error: {msg}"),
            Self::InvalidIdentifier(name) => write!(f, "'{name}' is not a valid SQL identifier"),
            Self::UnknownOwnerType(name) => write!(f, "owner type '{name}' is not registered"),
        }
    }
}

impl std::error::Error for SettingsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Database(e) => Some(e),
            Self::Cache(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for SettingsError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e)
    }
}

impl From<CacheError> for SettingsError {
    fn from(e: CacheError) -> Self {
        Self::Cache(e)
    }
}

#[derive(Debug)]
pub enum CacheError {
    /// The backing store rejected or failed an operation.
    Backend(String),
    /// A stored timestamp is not a valid RFC 3339 instant.
    BadTimestamp { key: String, value: String },
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend(msg) => write!(f, "cache backend error: {msg}"),
            Self::BadTimestamp { key, value } => {
                write!(f, "cache key '{key}' holds an invalid timestamp '{value}'")
            }
        }
    }
}

impl std::error::Error for CacheError {}

impl From<rusqlite::Error> for CacheError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

#[derive(Debug)]
pub enum ConfigError {
    /// TOML parse / deserialization error.
    Parse(String),
    /// Config validation error (empty bag, zero TTL, missing path, ...).
    Validation(String),
    /// Config file could not be read.
    Io(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(msg) => write!(f, "config parse error: {msg}"),
            Self::Validation(msg) => write!(f, "config validation error: {msg}"),
            Self::Io(msg) => write!(f, "IO error: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
