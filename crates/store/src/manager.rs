use std::sync::Arc;

use chrono::Utc;

use crate::cache::{cache_key, open_backend, CacheStore};
use crate::codec::Value;
use crate::collection::SettingsCollection;
use crate::config::StoreConfig;
use crate::error::SettingsError;
use crate::model::{NewSetting, OwnerRef, Setting};
use crate::owner::{OwnerRegistry, Settable};
use crate::settings_cache::SettingsCache;
use crate::store::{Comparison, SettingsStore};

/// How an owner is being removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// The owner row stays around; its settings are kept.
    Soft,
    /// The owner is gone for good; its settings and cache entry go too.
    Permanent,
}

/// Entry point for owner lifecycle events and settings retrieval.
pub struct SettingsManager {
    store: SettingsStore,
    config: StoreConfig,
    registry: OwnerRegistry,
    cache: Option<Arc<dyn CacheStore>>,
}

impl SettingsManager {
    pub fn new(store: SettingsStore, config: StoreConfig) -> Self {
        let registry = OwnerRegistry::from_config(&config);
        Self { store, config, registry, cache: None }
    }

    /// Opens the configured database and cache backend.
    pub fn from_config(config: StoreConfig) -> Result<Self, SettingsError> {
        let store = SettingsStore::open(&config.database)?;
        let cache = open_backend(&config.cache)?;
        let mut manager = Self::new(store, config);
        manager.cache = cache;
        Ok(manager)
    }

    pub fn with_cache(mut self, backend: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(backend);
        self
    }

    pub fn store(&self) -> &SettingsStore {
        &self.store
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &OwnerRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut OwnerRegistry {
        &mut self.registry
    }

    pub fn cache_backend(&self) -> Option<&Arc<dyn CacheStore>> {
        self.cache.as_ref()
    }

    /// Bags visible to `owner`: its own override, then its kind's, then the
    /// default bag.
    pub fn bags_for(&self, owner: &dyn Settable) -> Vec<String> {
        owner
            .bags()
            .or_else(|| self.registry.get(owner.owner_type()).and_then(|k| k.bags.clone()))
            .unwrap_or_else(|| vec![self.config.default_bag.clone()])
    }

    /// The owner's cache entry, when caching is enabled and a backend is attached.
    pub fn cache_for(&self, owner: &OwnerRef) -> Option<SettingsCache> {
        if !self.config.cache.enable {
            return None;
        }
        self.cache
            .as_ref()
            .map(|backend| SettingsCache::for_owner(Arc::clone(backend), &self.config.cache, owner))
    }

    /// Whether the owner has as many settings as there are metadata rows.
    pub fn is_initialized(&self, owner: &dyn Settable) -> Result<bool, SettingsError> {
        let owner = owner.owner_ref();
        Ok(self.store.count_owner_settings(&owner)? == self.store.count_metadata()?)
    }

    /// Creates one setting per metadata row for `owner`, carrying each
    /// default and enabled flag. Existing settings are replaced.
    ///
    /// Returns `None` without touching anything when the owner is already
    /// initialized and `force` is off.
    pub fn initialize(
        &self,
        owner: &dyn Settable,
        force: bool,
    ) -> Result<Option<SettingsCollection<'_>>, SettingsError> {
        if !force && self.is_initialized(owner)? {
            return Ok(None);
        }

        let owner_ref = owner.owner_ref();
        let bags = self.bags_for(owner);
        let mut cache = self.cache_for(&owner_ref);
        let now = Utc::now();

        let tx = self.store.transaction()?;
        self.store.delete_owner_settings(&owner_ref)?;
        if let Some(cache) = cache.as_mut() {
            cache.invalidate()?;
        }

        let mut visible: Vec<Setting> = Vec::new();
        for metadata in self.store.all_metadata()? {
            let id = self.store.insert_setting(
                &NewSetting {
                    metadata_id: metadata.id,
                    owner: owner_ref.clone(),
                    value: metadata.default.clone(),
                    is_enabled: metadata.is_enabled,
                },
                now,
            )?;
            if bags.contains(&metadata.bag) {
                visible.push(Setting::from_metadata(id, owner_ref.clone(), &metadata, metadata.is_enabled, now));
            }
        }
        tx.commit()?;

        log::info!("initialized settings for {owner_ref}");
        Ok(Some(SettingsCollection::new(&self.store, owner_ref, bags, visible, cache)))
    }

    /// Owner was just created.
    pub fn after_create(
        &self,
        owner: &dyn Settable,
    ) -> Result<Option<SettingsCollection<'_>>, SettingsError> {
        if !owner.should_initialize_settings() {
            return Ok(None);
        }
        self.initialize(owner, false)
    }

    /// Owner was just loaded. Initializes it lazily when settings are
    /// missing, otherwise reads its settings through the cache.
    pub fn after_load(&self, owner: &dyn Settable) -> Result<SettingsCollection<'_>, SettingsError> {
        if !self.is_initialized(owner)? {
            if let Some(collection) = self.initialize(owner, true)? {
                return Ok(collection);
            }
        }
        self.settings(owner)
    }

    /// Settings accessor for owners that may not be initialized yet.
    pub fn settings_for(&self, owner: &dyn Settable) -> Result<SettingsCollection<'_>, SettingsError> {
        self.after_load(owner)
    }

    /// Owner's settings in its bags: the cached snapshot when one exists,
    /// otherwise the store. A miss arms regeneration for the end of scope.
    pub fn settings(&self, owner: &dyn Settable) -> Result<SettingsCollection<'_>, SettingsError> {
        let owner_ref = owner.owner_ref();
        let bags = self.bags_for(owner);
        let cache = self.cache_for(&owner_ref);

        let cached = match &cache {
            Some(cache) => cache.retrieve()?,
            None => None,
        };

        match cached {
            Some(snapshot) => {
                log::debug!("settings for {owner_ref} served from cache");
                let snapshot = self.resolve_kinds(snapshot)?;
                Ok(SettingsCollection::new(&self.store, owner_ref, bags, snapshot, cache))
            }
            None => {
                let rows = self.store.settings_for_owner(&owner_ref, Some(bags.as_slice()))?;
                let mut collection = SettingsCollection::new(&self.store, owner_ref, bags, rows, cache);
                collection.regenerate_on_exit();
                Ok(collection)
            }
        }
    }

    /// Fills in types missing from older snapshots. Settings whose metadata
    /// is gone keep `None` and read back as raw text.
    fn resolve_kinds(&self, mut snapshot: Vec<Setting>) -> Result<Vec<Setting>, SettingsError> {
        for setting in snapshot.iter_mut().filter(|s| s.kind.is_none()) {
            setting.kind = self.store.metadata_type(setting.metadata_id)?;
        }
        Ok(snapshot)
    }

    /// Owner is being deleted. Soft deletes keep everything; permanent
    /// deletes remove the owner's settings and forget its cache entry.
    /// Returns the number of settings removed.
    pub fn before_delete(&self, owner: &dyn Settable, mode: DeleteMode) -> Result<usize, SettingsError> {
        if mode == DeleteMode::Soft {
            return Ok(0);
        }
        let owner_ref = owner.owner_ref();
        let removed = self.store.delete_owner_settings(&owner_ref)?;
        if let Some(backend) = &self.cache {
            let key = cache_key(&self.config.cache.prefix, &owner_ref);
            backend.forget(&key)?;
            backend.forget(&format!("{key}:time"))?;
        }
        log::info!("removed {removed} settings for deleted {owner_ref}");
        Ok(removed)
    }

    /// Ids of owners of `owner_type` whose setting `name` compares true
    /// against `value`. An unknown setting name matches nobody.
    pub fn owners_where(
        &self,
        owner_type: &str,
        name: &str,
        cmp: Comparison,
        value: Option<&Value>,
    ) -> Result<Vec<i64>, SettingsError> {
        let kind = self
            .registry
            .get(owner_type)
            .ok_or_else(|| SettingsError::UnknownOwnerType(owner_type.to_string()))?;
        match self.store.metadata_by_name(name)? {
            Some(metadata) => self.store.owners_where(kind, &metadata, cmp, value),
            None => Ok(Vec::new()),
        }
    }
}
