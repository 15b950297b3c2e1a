use std::collections::BTreeMap;
use std::ops::Index;

use chrono::Utc;

use crate::codec::{self, Value};
use crate::error::SettingsError;
use crate::model::{OwnerRef, Setting, SettingId};
use crate::settings_cache::SettingsCache;
use crate::store::SettingsStore;

/// An owner's loaded settings, keyed by name.
///
/// Writes go straight to the store. When a cache is attached, the first
/// write invalidates the owner's entry and the snapshot is regenerated
/// once, when the collection is dropped or [`finish`](Self::finish)ed.
pub struct SettingsCollection<'s> {
    store: &'s SettingsStore,
    owner: OwnerRef,
    bags: Vec<String>,
    settings: BTreeMap<String, Setting>,
    cache: Option<SettingsCache>,
    regenerates_on_exit: bool,
}

impl<'s> SettingsCollection<'s> {
    pub fn new(
        store: &'s SettingsStore,
        owner: OwnerRef,
        bags: Vec<String>,
        settings: Vec<Setting>,
        cache: Option<SettingsCache>,
    ) -> Self {
        let settings = settings.into_iter().map(|s| (s.name.clone(), s)).collect();
        Self { store, owner, bags, settings, cache, regenerates_on_exit: false }
    }

    pub fn owner(&self) -> &OwnerRef {
        &self.owner
    }

    pub fn bags(&self) -> &[String] {
        &self.bags
    }

    pub fn len(&self) -> usize {
        self.settings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.settings.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Setting> {
        self.settings.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.settings.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Setting> {
        self.settings.values()
    }

    pub fn cache(&self) -> Option<&SettingsCache> {
        self.cache.as_ref()
    }

    pub fn regenerates_on_exit(&self) -> bool {
        self.regenerates_on_exit
    }

    /// Arms a regeneration when the collection goes out of scope, if the
    /// attached cache is automatic.
    pub fn regenerate_on_exit(&mut self) {
        if let Some(cache) = &self.cache {
            self.regenerates_on_exit = cache.regenerates_on_exit();
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Decoded value; `None` when the setting is missing or null. A setting
    /// loaded without its type is decoded with its metadata's stored type.
    pub fn value(&self, name: &str) -> Result<Option<Value>, SettingsError> {
        match self.settings.get(name) {
            Some(setting) => self.decode(setting),
            None => Ok(None),
        }
    }

    /// Like [`value`](Self::value), but a missing setting yields `default`.
    /// A present setting holding null still yields `None`.
    pub fn value_or(
        &self,
        name: &str,
        default: impl Into<Value>,
    ) -> Result<Option<Value>, SettingsError> {
        match self.settings.get(name) {
            Some(setting) => self.decode(setting),
            None => Ok(Some(default.into())),
        }
    }

    fn decode(&self, setting: &Setting) -> Result<Option<Value>, SettingsError> {
        codec::cast_with_context(setting.kind, setting.metadata_id, self.store, setting.value.as_deref())
    }

    pub fn is(&self, name: &str, expected: impl Into<Value>) -> Result<bool, SettingsError> {
        Ok(self.value(name)? == Some(expected.into()))
    }

    pub fn is_null(&self, name: &str) -> Result<bool, SettingsError> {
        Ok(self.value(name)?.is_none())
    }

    pub fn is_enabled(&self, name: &str) -> Result<bool, SettingsError> {
        Ok(self.require(name)?.is_enabled)
    }

    pub fn is_disabled(&self, name: &str) -> Result<bool, SettingsError> {
        Ok(!self.is_enabled(name)?)
    }

    /// Settings grouped by their metadata group.
    pub fn groups(&self) -> BTreeMap<&str, Vec<&Setting>> {
        let mut groups: BTreeMap<&str, Vec<&Setting>> = BTreeMap::new();
        for setting in self.settings.values() {
            groups.entry(setting.group.as_str()).or_default().push(setting);
        }
        groups
    }

    /// Settings whose names are in `names`. Names that don't resolve are
    /// matched against setting ids instead.
    pub fn only(&self, names: &[&str]) -> Vec<&Setting> {
        let ids = self.fallback_ids(names);
        self.settings
            .values()
            .filter(|s| names.contains(&s.name.as_str()) || ids.contains(&s.id))
            .collect()
    }

    /// Settings whose names are not in `names`, with the same id fallback
    /// as [`only`](Self::only).
    pub fn except(&self, names: &[&str]) -> Vec<&Setting> {
        let ids = self.fallback_ids(names);
        self.settings
            .values()
            .filter(|s| !names.contains(&s.name.as_str()) && !ids.contains(&s.id))
            .collect()
    }

    fn fallback_ids(&self, names: &[&str]) -> Vec<SettingId> {
        names
            .iter()
            .filter(|n| !self.settings.contains_key(**n))
            .filter_map(|n| n.parse().ok())
            .collect()
    }

    fn require(&self, name: &str) -> Result<&Setting, SettingsError> {
        self.settings
            .get(name)
            .ok_or_else(|| SettingsError::SettingNotFound(name.to_string()))
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Sets and persists a value, enabled or not. Returns whether it was
    /// written.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<bool, SettingsError> {
        self.write(name, Some(value.into()), true)
    }

    /// Sets a value only if the setting is enabled. Returns whether it was
    /// written.
    pub fn set_if_enabled(
        &mut self,
        name: &str,
        value: impl Into<Value>,
    ) -> Result<bool, SettingsError> {
        self.write(name, Some(value.into()), false)
    }

    pub fn set_null(&mut self, name: &str) -> Result<bool, SettingsError> {
        self.write(name, None, true)
    }

    /// Sets several values. Fails on the first unknown name; earlier writes
    /// stay persisted.
    pub fn set_many<I, K, V>(&mut self, values: I, force: bool) -> Result<(), SettingsError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        for (name, value) in values {
            self.write(name.as_ref(), Some(value.into()), force)?;
        }
        Ok(())
    }

    /// Encodes and persists `value`. Without `force`, a disabled setting is
    /// left untouched and `false` is returned.
    pub fn write(
        &mut self,
        name: &str,
        value: Option<Value>,
        force: bool,
    ) -> Result<bool, SettingsError> {
        let setting = self
            .settings
            .get(name)
            .ok_or_else(|| SettingsError::SettingNotFound(name.to_string()))?;
        if !force && !setting.is_enabled {
            return Ok(false);
        }

        let raw = codec::encode_with_context(setting.kind, setting.metadata_id, self.store, value.as_ref())?;
        self.persist_value(name, raw)?;
        Ok(true)
    }

    /// Restores the metadata default. The default is read from the store
    /// when it was not loaded with the setting.
    pub fn set_default(&mut self, name: &str) -> Result<(), SettingsError> {
        let setting = self.require(name)?;
        let default = match &setting.default {
            Some(default) => default.clone(),
            None => self.store.metadata_default_raw(setting.metadata_id)?.unwrap_or_default(),
        };
        if let Some(setting) = self.settings.get_mut(name) {
            setting.default = Some(default.clone());
        }
        self.persist_value(name, default)
    }

    pub fn enable(&mut self, name: &str) -> Result<(), SettingsError> {
        self.persist_enabled(name, true)
    }

    pub fn disable(&mut self, name: &str) -> Result<(), SettingsError> {
        self.persist_enabled(name, false)
    }

    fn persist_value(&mut self, name: &str, raw: Option<String>) -> Result<(), SettingsError> {
        let now = Utc::now();
        let setting = self
            .settings
            .get_mut(name)
            .ok_or_else(|| SettingsError::SettingNotFound(name.to_string()))?;
        if !self.store.update_setting_value(setting.id, raw.as_deref(), now)? {
            return Err(SettingsError::SettingNotFound(name.to_string()));
        }
        setting.value = raw;
        setting.updated_at = now;
        self.after_write()
    }

    fn persist_enabled(&mut self, name: &str, is_enabled: bool) -> Result<(), SettingsError> {
        let now = Utc::now();
        let setting = self
            .settings
            .get_mut(name)
            .ok_or_else(|| SettingsError::SettingNotFound(name.to_string()))?;
        if !self.store.update_setting_enabled(setting.id, is_enabled, now)? {
            return Err(SettingsError::SettingNotFound(name.to_string()));
        }
        setting.is_enabled = is_enabled;
        setting.updated_at = now;
        self.after_write()
    }

    fn after_write(&mut self) -> Result<(), SettingsError> {
        if let Some(cache) = self.cache.as_mut() {
            cache.invalidate_if_not_invalidated()?;
        }
        self.regenerate_on_exit();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cache
    // -----------------------------------------------------------------------

    pub fn invalidate(&mut self) -> Result<(), SettingsError> {
        match self.cache.as_mut() {
            Some(cache) => cache.invalidate(),
            None => Ok(()),
        }
    }

    pub fn invalidate_if_not_invalidated(&mut self) -> Result<bool, SettingsError> {
        match self.cache.as_mut() {
            Some(cache) => cache.invalidate_if_not_invalidated(),
            None => Ok(false),
        }
    }

    /// Writes the current snapshot to the cache. Returns whether anything
    /// was written; always `false` without a cache.
    pub fn regenerate(&self, force: bool) -> Result<bool, SettingsError> {
        match &self.cache {
            Some(cache) => {
                let snapshot: Vec<&Setting> = self.settings.values().collect();
                cache.regenerate(&snapshot, force)
            }
            None => Ok(false),
        }
    }

    /// Runs the pending end-of-scope regeneration now and reports its error.
    pub fn finish(mut self) -> Result<(), SettingsError> {
        self.flush_pending()
    }

    fn flush_pending(&mut self) -> Result<(), SettingsError> {
        if !self.regenerates_on_exit {
            return Ok(());
        }
        self.regenerates_on_exit = false;
        self.regenerate(false)?;
        Ok(())
    }
}

impl Drop for SettingsCollection<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.flush_pending() {
            log::warn!("could not regenerate settings cache for {}: {e}", self.owner);
        }
    }
}

impl Index<&str> for SettingsCollection<'_> {
    type Output = Setting;

    fn index(&self, name: &str) -> &Setting {
        match self.settings.get(name) {
            Some(setting) => setting,
            None => panic!("the setting [{name}] doesn't exist"),
        }
    }
}

impl<'a> IntoIterator for &'a SettingsCollection<'_> {
    type Item = &'a Setting;
    type IntoIter = std::collections::btree_map::Values<'a, String, Setting>;

    fn into_iter(self) -> Self::IntoIter {
        self.settings.values()
    }
}

impl std::fmt::Debug for SettingsCollection<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsCollection")
            .field("owner", &self.owner)
            .field("bags", &self.bags)
            .field("settings", &self.settings.keys().collect::<Vec<_>>())
            .finish()
    }
}
