use std::collections::BTreeMap;

use crate::config::{OwnerConfig, StoreConfig};
use crate::model::OwnerRef;

/// A kind of entity that owns settings, and the table its instances live in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerKind {
    pub owner_type: String,
    pub table: String,
    pub key_column: String,
    /// Bags this kind sees. `None` falls back to the configured default bag.
    pub bags: Option<Vec<String>>,
}

impl OwnerKind {
    pub fn new(owner_type: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            owner_type: owner_type.into(),
            table: table.into(),
            key_column: "id".into(),
            bags: None,
        }
    }

    pub fn with_key(mut self, key_column: impl Into<String>) -> Self {
        self.key_column = key_column.into();
        self
    }

    pub fn with_bags<I, S>(mut self, bags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bags = Some(bags.into_iter().map(Into::into).collect());
        self
    }
}

impl From<&OwnerConfig> for OwnerKind {
    fn from(config: &OwnerConfig) -> Self {
        Self {
            owner_type: config.owner_type.clone(),
            table: config.table.clone(),
            key_column: config.key.clone(),
            bags: config.bags.clone(),
        }
    }
}

/// Every owner kind known to the process. One entry per owner type.
#[derive(Debug, Clone, Default)]
pub struct OwnerRegistry {
    kinds: Vec<OwnerKind>,
}

impl OwnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        let mut registry = Self::new();
        for owner in &config.owners {
            registry.register(OwnerKind::from(owner));
        }
        registry
    }

    /// Registers a kind, replacing any earlier kind with the same owner type.
    pub fn register(&mut self, kind: OwnerKind) -> &mut Self {
        match self.kinds.iter_mut().find(|k| k.owner_type == kind.owner_type) {
            Some(existing) => *existing = kind,
            None => self.kinds.push(kind),
        }
        self
    }

    pub fn get(&self, owner_type: &str) -> Option<&OwnerKind> {
        self.kinds.iter().find(|k| k.owner_type == owner_type)
    }

    pub fn kinds(&self) -> &[OwnerKind] {
        &self.kinds
    }

    pub fn owner_types(&self) -> Vec<&str> {
        self.kinds.iter().map(|k| k.owner_type.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Tables claimed by more than one owner type, sorted.
    pub fn duplicate_tables(&self) -> Vec<String> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for kind in &self.kinds {
            *counts.entry(kind.table.as_str()).or_default() += 1;
        }
        counts
            .into_iter()
            .filter(|(_, n)| *n > 1)
            .map(|(table, _)| table.to_string())
            .collect()
    }
}

/// An entity that can own settings.
pub trait Settable {
    fn owner_type(&self) -> &str;

    fn owner_id(&self) -> i64;

    /// Instance-level bag override.
    fn bags(&self) -> Option<Vec<String>> {
        None
    }

    /// Whether settings are filled in as soon as the owner is created.
    fn should_initialize_settings(&self) -> bool {
        true
    }

    fn owner_ref(&self) -> OwnerRef {
        OwnerRef::new(self.owner_type(), self.owner_id())
    }
}

impl Settable for OwnerRef {
    fn owner_type(&self) -> &str {
        &self.owner_type
    }

    fn owner_id(&self) -> i64 {
        self.owner_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_replaces_same_type() {
        let mut registry = OwnerRegistry::new();
        registry
            .register(OwnerKind::new("user", "users"))
            .register(OwnerKind::new("user", "members").with_key("member_id"));

        assert_eq!(registry.len(), 1);
        let kind = registry.get("user").unwrap();
        assert_eq!(kind.table, "members");
        assert_eq!(kind.key_column, "member_id");
    }

    #[test]
    fn duplicate_tables_are_reported_once() {
        let mut registry = OwnerRegistry::new();
        registry
            .register(OwnerKind::new("user", "users"))
            .register(OwnerKind::new("admin", "users"))
            .register(OwnerKind::new("editor", "users"))
            .register(OwnerKind::new("team", "teams"));

        assert_eq!(registry.duplicate_tables(), vec!["users".to_string()]);
    }

    #[test]
    fn from_config_keeps_bags() {
        let config = StoreConfig::from_toml(
            "[[owners]]\ntype = \"user\"\ntable = \"users\"\nbags = [\"users\", \"beta\"]\n",
        )
        .unwrap();
        let registry = OwnerRegistry::from_config(&config);
        assert_eq!(
            registry.get("user").unwrap().bags,
            Some(vec!["users".to_string(), "beta".to_string()])
        );
        assert!(registry.get("admin").is_none());
    }

    #[test]
    fn owner_ref_is_settable() {
        let owner = OwnerRef::new("user", 7);
        assert_eq!(owner.owner_ref(), owner);
        assert!(owner.should_initialize_settings());
        assert!(Settable::bags(&owner).is_none());
    }
}
