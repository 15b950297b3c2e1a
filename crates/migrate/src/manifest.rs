use std::path::Path;

use serde::Deserialize;
use serde_json::Value as Json;

use knobs_store::codec;
use knobs_store::{SettingType, Value};

use crate::declaration::Declaration;
use crate::error::MigrateError;

/// Declarations written as TOML:
///
/// ```toml
/// [[settings]]
/// name = "color"
/// type = "string"
/// default = "red"
/// group = "theme"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub settings: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestEntry {
    pub name: String,
    #[serde(rename = "type", default = "default_type")]
    pub kind: SettingType,
    #[serde(default)]
    pub default: Option<toml::Value>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub bag: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
}

fn default_type() -> SettingType {
    SettingType::String
}

fn default_enabled() -> bool {
    true
}

impl Manifest {
    pub fn from_toml(input: &str) -> Result<Self, MigrateError> {
        let manifest: Manifest = toml::from_str(input).map_err(|e| MigrateError::Manifest(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self, MigrateError> {
        let input = std::fs::read_to_string(path)
            .map_err(|e| MigrateError::Manifest(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&input)
    }

    fn validate(&self) -> Result<(), MigrateError> {
        for (i, entry) in self.settings.iter().enumerate() {
            if entry.name.trim().is_empty() {
                return Err(MigrateError::Manifest(format!("settings[{i}]: name cannot be empty")));
            }
            if entry.from.as_deref() == Some(entry.name.as_str()) {
                return Err(MigrateError::Manifest(format!(
                    "settings[{i}]: '{}' cannot migrate from itself",
                    entry.name
                )));
            }
        }
        Ok(())
    }

    /// Entries as declarations; entries without a bag land in `default_bag`.
    pub fn declarations(&self, default_bag: &str) -> Result<Vec<Declaration>, MigrateError> {
        self.settings.iter().map(|entry| entry.to_declaration(default_bag)).collect()
    }
}

impl ManifestEntry {
    pub fn to_declaration(&self, default_bag: &str) -> Result<Declaration, MigrateError> {
        let mut declaration = Declaration::new(&self.name, self.bag.as_deref().unwrap_or(default_bag))
            .kind(self.kind)
            .enabled(self.enabled);
        if let Some(group) = &self.group {
            declaration = declaration.group(group);
        }
        if let Some(from) = &self.from {
            declaration = declaration.from(from);
        }
        if let Some(default) = &self.default {
            let value = toml_to_value(default)
                .map_err(|reason| MigrateError::Manifest(format!("'{}': {reason}", self.name)))?;
            // Reject defaults the declared type cannot hold.
            codec::encode(self.kind, Some(&value))
                .map_err(|e| MigrateError::Manifest(format!("'{}': {e}", self.name)))?;
            declaration = declaration.default(value);
        }
        Ok(declaration)
    }
}

fn toml_to_value(value: &toml::Value) -> Result<Value, String> {
    Ok(match value {
        toml::Value::String(s) => Value::String(s.clone()),
        toml::Value::Integer(i) => Value::Integer(*i),
        toml::Value::Float(f) => Value::Float(*f),
        toml::Value::Boolean(b) => Value::Boolean(*b),
        toml::Value::Datetime(dt) => {
            let text = dt.to_string();
            Value::DateTime(codec::parse_datetime(&text).ok_or_else(|| format!("unsupported date-time '{text}'"))?)
        }
        toml::Value::Array(items) => Value::Array(items.iter().map(toml_to_json).collect::<Result<_, _>>()?),
        toml::Value::Table(_) => return Err("tables cannot be used as defaults".into()),
    })
}

fn toml_to_json(value: &toml::Value) -> Result<Json, String> {
    match value {
        toml::Value::Datetime(dt) => Ok(Json::String(dt.to_string())),
        other => serde_json::to_value(other).map_err(|e| e.to_string()),
    }
}
