use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use knobs_store::{
    CacheError, CacheStore, Comparison, DeleteMode, MemoryCache, MetadataShape, OwnerKind, OwnerRef,
    Settable, SettingType, SettingsCollection, SettingsError, SettingsManager, SettingsStore, StoreConfig, Value,
};

// -------------------------------------------------------------------------
// Fixtures
// -------------------------------------------------------------------------

/// Memory cache that counts the calls it sees.
#[derive(Default)]
struct CountingCache {
    inner: MemoryCache,
    writes: AtomicUsize,
    forgets: AtomicUsize,
}

impl CountingCache {
    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn forgets(&self) -> usize {
        self.forgets.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.writes.store(0, Ordering::SeqCst);
        self.forgets.store(0, Ordering::SeqCst);
    }
}

impl CacheStore for CountingCache {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value, ttl)
    }

    fn set_multiple(&self, entries: &[(&str, &str)], ttl: Duration) -> Result<(), CacheError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set_multiple(entries, ttl)
    }

    fn forget(&self, key: &str) -> Result<bool, CacheError> {
        self.forgets.fetch_add(1, Ordering::SeqCst);
        self.inner.forget(key)
    }

    fn flush(&self) -> Result<(), CacheError> {
        self.inner.flush()
    }
}

struct BetaUser(i64);

impl Settable for BetaUser {
    fn owner_type(&self) -> &str {
        "user"
    }

    fn owner_id(&self) -> i64 {
        self.0
    }

    fn bags(&self) -> Option<Vec<String>> {
        Some(vec!["beta".into()])
    }
}

struct Guest(i64);

impl Settable for Guest {
    fn owner_type(&self) -> &str {
        "user"
    }

    fn owner_id(&self) -> i64 {
        self.0
    }

    fn should_initialize_settings(&self) -> bool {
        false
    }
}

fn user(id: i64) -> OwnerRef {
    OwnerRef::new("user", id)
}

fn shape(name: &str, kind: SettingType, default: Option<&str>, group: &str, bag: &str) -> MetadataShape {
    MetadataShape {
        name: name.into(),
        kind,
        default: default.map(String::from),
        is_enabled: true,
        group: group.into(),
        bag: bag.into(),
    }
}

const CONFIG: &str = r#"
environment = "testing"

[cache]
enable = true

[[owners]]
type = "user"
table = "users"
"#;

fn setup(cache: bool) -> (SettingsManager, Arc<CountingCache>) {
    setup_with(cache, true)
}

fn setup_with(cache: bool, automatic: bool) -> (SettingsManager, Arc<CountingCache>) {
    let store = SettingsStore::open_in_memory().unwrap();
    store
        .connection()
        .execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT); INSERT INTO users (id) VALUES (1), (2), (3);")
        .unwrap();

    let now = Utc::now();
    store.insert_metadata(&shape("color", SettingType::String, Some("red"), "theme", "users"), now).unwrap();
    store.insert_metadata(&shape("volume", SettingType::Integer, Some("5"), "audio", "users"), now).unwrap();
    store.insert_metadata(&shape("preview", SettingType::Boolean, Some("1"), "default", "beta"), now).unwrap();

    let mut config = StoreConfig::from_toml(CONFIG).unwrap();
    config.cache.enable = cache;
    config.cache.automatic = automatic;
    let backend = Arc::new(CountingCache::default());
    let shared: Arc<dyn CacheStore> = backend.clone();
    let manager = SettingsManager::new(store, config).with_cache(shared);
    (manager, backend)
}

// -------------------------------------------------------------------------
// Lifecycle
// -------------------------------------------------------------------------

#[test]
fn after_create_fills_every_metadata_row() {
    let (manager, _) = setup(false);
    let settings = manager.after_create(&user(1)).unwrap().unwrap();

    // Only the owner's bag is visible, but every row exists.
    assert_eq!(settings.names().collect::<Vec<_>>(), vec!["color", "volume"]);
    assert_eq!(manager.store().count_owner_settings(&user(1)).unwrap(), 3);
    assert!(manager.is_initialized(&user(1)).unwrap());

    // Second call is a no-op.
    assert!(manager.after_create(&user(1)).unwrap().is_none());
}

#[test]
fn owners_can_opt_out_of_initialization() {
    let (manager, _) = setup(false);
    assert!(manager.after_create(&Guest(1)).unwrap().is_none());
    assert_eq!(manager.store().count_owner_settings(&user(1)).unwrap(), 0);
}

#[test]
fn after_load_initializes_lazily() {
    let (manager, _) = setup(false);
    assert!(!manager.is_initialized(&user(2)).unwrap());

    let settings = manager.after_load(&user(2)).unwrap();
    assert_eq!(settings.value("volume").unwrap(), Some(Value::Integer(5)));
    drop(settings);

    assert!(manager.is_initialized(&user(2)).unwrap());
}

#[test]
fn forced_initialize_resets_values() {
    let (manager, _) = setup(false);
    {
        let mut settings = manager.after_create(&user(1)).unwrap().unwrap();
        settings.set("color", "blue").unwrap();
    }
    let settings = manager.initialize(&user(1), true).unwrap().unwrap();
    assert_eq!(settings.value("color").unwrap(), Some(Value::from("red")));
    assert_eq!(manager.store().count_owner_settings(&user(1)).unwrap(), 3);
}

#[test]
fn bag_override_on_the_instance() {
    let (manager, _) = setup(false);
    manager.after_create(&user(1)).unwrap();

    let beta = manager.settings(&BetaUser(1)).unwrap();
    assert_eq!(beta.names().collect::<Vec<_>>(), vec!["preview"]);
    assert!(beta.is("preview", true).unwrap());
}

#[test]
fn bag_override_on_the_kind() {
    let (mut manager, _) = setup(false);
    manager
        .registry_mut()
        .register(OwnerKind::new("user", "users").with_bags(["users", "beta"]));
    manager.after_create(&user(1)).unwrap();

    let settings = manager.settings(&user(1)).unwrap();
    assert_eq!(settings.len(), 3);
}

#[test]
fn permanent_delete_removes_settings() {
    let (manager, backend) = setup(true);
    manager.after_create(&user(1)).unwrap();
    manager.settings(&user(1)).unwrap().finish().unwrap();
    assert!(backend.get("knobs|user|1").unwrap().is_some());

    assert_eq!(manager.before_delete(&user(1), DeleteMode::Soft).unwrap(), 0);
    assert_eq!(manager.store().count_owner_settings(&user(1)).unwrap(), 3);

    assert_eq!(manager.before_delete(&user(1), DeleteMode::Permanent).unwrap(), 3);
    assert_eq!(manager.store().count_owner_settings(&user(1)).unwrap(), 0);
    assert!(backend.get("knobs|user|1").unwrap().is_none());
    assert!(backend.get("knobs|user|1:time").unwrap().is_none());
}

// -------------------------------------------------------------------------
// Reads and writes
// -------------------------------------------------------------------------

#[test]
fn typed_reads() {
    let (manager, _) = setup(false);
    let settings = manager.after_create(&user(1)).unwrap().unwrap();

    assert_eq!(settings.value("color").unwrap(), Some(Value::from("red")));
    assert_eq!(settings["volume"].value().unwrap(), Some(Value::Integer(5)));
    assert_eq!(settings.value("missing").unwrap(), None);
    assert_eq!(settings.value_or("missing", 9).unwrap(), Some(Value::Integer(9)));
    assert!(settings.is_null("missing").unwrap());
    assert!(settings.is("volume", 5).unwrap());
    assert!(!settings.is("volume", 6).unwrap());
}

#[test]
fn writes_persist_through_the_store() {
    let (manager, _) = setup(false);
    {
        let mut settings = manager.after_create(&user(1)).unwrap().unwrap();
        assert!(settings.set("volume", 11).unwrap());
        settings.set_null("color").unwrap();
    }

    let settings = manager.settings(&user(1)).unwrap();
    assert_eq!(settings.value("volume").unwrap(), Some(Value::Integer(11)));
    assert_eq!(settings["volume"].raw_value(), Some("11"));
    assert!(settings.is_null("color").unwrap());
    assert_eq!(settings.value_or("color", "fallback").unwrap(), None);
}

#[test]
fn disabled_settings_ignore_conditional_writes() {
    let (manager, _) = setup(false);
    let mut settings = manager.after_create(&user(1)).unwrap().unwrap();
    settings.disable("volume").unwrap();
    assert!(settings.is_disabled("volume").unwrap());

    assert!(!settings.set_if_enabled("volume", 1).unwrap());
    assert_eq!(settings.value("volume").unwrap(), Some(Value::Integer(5)));

    assert!(settings.set("volume", 2).unwrap());
    assert_eq!(settings.value("volume").unwrap(), Some(Value::Integer(2)));

    settings.enable("volume").unwrap();
    settings.set_many([("volume", 3)], false).unwrap();
    assert_eq!(settings.value("volume").unwrap(), Some(Value::Integer(3)));
}

#[test]
fn unknown_names_are_errors_on_write() {
    let (manager, _) = setup(false);
    let mut settings = manager.after_create(&user(1)).unwrap().unwrap();

    let err = settings.set("nope", 1).unwrap_err();
    assert!(matches!(err, SettingsError::SettingNotFound(ref n) if n == "nope"));
    assert_eq!(err.to_string(), "the setting [nope] doesn't exist");
    assert!(settings.is_enabled("nope").is_err());
}

#[test]
fn writes_to_a_vanished_row_fail() {
    let (manager, _) = setup(false);
    let mut settings = manager.after_create(&user(1)).unwrap().unwrap();

    let volume = manager.store().metadata_by_name("volume").unwrap().unwrap();
    manager.store().delete_metadata(volume.id).unwrap();

    let err = settings.set("volume", 9).unwrap_err();
    assert!(matches!(err, SettingsError::SettingNotFound(ref n) if n == "volume"));
    assert_eq!(settings["volume"].raw_value(), Some("5"));

    assert!(settings.disable("volume").is_err());
    assert!(settings.is_enabled("volume").unwrap());
}

#[test]
fn untyped_settings_use_the_stored_metadata_type() {
    let (manager, _) = setup(false);
    manager.after_create(&user(1)).unwrap();

    let mut rows = manager.store().settings_for_owner(&user(1), None).unwrap();
    for row in &mut rows {
        row.kind = None;
    }
    let mut settings = SettingsCollection::new(manager.store(), user(1), vec!["users".into()], rows, None);

    assert_eq!(settings.value("volume").unwrap(), Some(Value::Integer(5)));
    assert_eq!(settings.value("preview").unwrap(), Some(Value::Boolean(true)));

    assert!(settings.set("volume", 7.8).unwrap());
    assert_eq!(settings["volume"].raw_value(), Some("7"));
    assert!(settings.set("preview", false).unwrap());
    assert_eq!(settings["preview"].raw_value(), Some("0"));
    assert!(settings.set("volume", "loud").is_err());
}

#[test]
fn groups_only_and_except() {
    let (manager, _) = setup(false);
    let settings = manager.after_create(&user(1)).unwrap().unwrap();

    let groups = settings.groups();
    assert_eq!(groups.keys().copied().collect::<Vec<_>>(), vec!["audio", "theme"]);

    let only = settings.only(&["color"]);
    assert_eq!(only.len(), 1);
    assert_eq!(only[0].name, "color");

    let except = settings.except(&["color"]);
    assert_eq!(except.len(), 1);
    assert_eq!(except[0].name, "volume");

    // Unresolved names fall back to setting ids.
    let volume_id = settings["volume"].id.to_string();
    let by_id = settings.only(&[volume_id.as_str()]);
    assert_eq!(by_id.len(), 1);
    assert_eq!(by_id[0].name, "volume");
    assert!(settings.only(&["ghost"]).is_empty());
}

#[test]
fn owners_where_filters_by_value() {
    let (manager, _) = setup(false);
    for id in 1..=3 {
        manager.after_create(&user(id)).unwrap();
    }
    manager.settings(&user(2)).unwrap().set("volume", 9).unwrap();

    let loud = manager.owners_where("user", "volume", Comparison::Gt, Some(&Value::Integer(5))).unwrap();
    assert_eq!(loud, vec![2]);
    let default = manager.owners_where("user", "volume", Comparison::Eq, Some(&Value::Integer(5))).unwrap();
    assert_eq!(default, vec![1, 3]);
    assert!(manager.owners_where("user", "ghost", Comparison::Eq, None).unwrap().is_empty());
    assert!(matches!(
        manager.owners_where("team", "volume", Comparison::Eq, None),
        Err(SettingsError::UnknownOwnerType(_))
    ));
}

// -------------------------------------------------------------------------
// Cache
// -------------------------------------------------------------------------

#[test]
fn writes_are_coalesced_into_one_regeneration() {
    let (manager, backend) = setup(true);
    manager.after_create(&user(1)).unwrap();
    backend.reset();

    {
        let mut settings = manager.settings(&user(1)).unwrap();
        settings.set("color", "green").unwrap();
        settings.set("volume", 7).unwrap();
        settings.set("volume", 8).unwrap();
        assert_eq!(backend.writes(), 0);
    }

    // One invalidation (data + time key), one combined write.
    assert_eq!(backend.forgets(), 2);
    assert_eq!(backend.writes(), 1);

    let settings = manager.settings(&user(1)).unwrap();
    assert_eq!(settings.value("color").unwrap(), Some(Value::from("green")));
    assert_eq!(settings.value("volume").unwrap(), Some(Value::Integer(8)));
    drop(settings);

    // Cache hit without writes leaves the backend alone.
    assert_eq!(backend.writes(), 1);
}

#[test]
fn write_invalidates_the_snapshot_before_regeneration() {
    let (manager, backend) = setup(true);
    manager.after_create(&user(1)).unwrap();
    manager.settings(&user(1)).unwrap().finish().unwrap();

    {
        let mut settings = manager.settings(&user(1)).unwrap();
        assert!(settings.cache().unwrap().retrieve().unwrap().is_some());

        settings.set("volume", 12).unwrap();
        assert!(settings.cache().unwrap().retrieve().unwrap().is_none());
        assert!(backend.get("knobs|user|1").unwrap().is_none());
        assert_eq!(settings.value("volume").unwrap(), Some(Value::Integer(12)));
    }

    let snapshot = manager.cache_for(&user(1)).unwrap().retrieve().unwrap().unwrap();
    let volume = snapshot.iter().find(|s| s.name == "volume").unwrap();
    assert_eq!(volume.raw_value(), Some("12"));
}

#[test]
fn cache_is_served_without_the_store() {
    let (manager, backend) = setup(true);
    manager.after_create(&user(1)).unwrap();
    manager.settings(&user(1)).unwrap().finish().unwrap();
    assert!(backend.get("knobs|user|1").unwrap().is_some());

    // Bypass the collection so only the store changes.
    let row = manager.store().settings_for_owner(&user(1), None).unwrap();
    let volume = row.iter().find(|s| s.name == "volume").unwrap();
    manager.store().update_setting_value(volume.id, Some("42"), Utc::now()).unwrap();

    let cached = manager.settings(&user(1)).unwrap();
    assert_eq!(cached.value("volume").unwrap(), Some(Value::Integer(5)));
}

#[test]
fn set_default_reads_metadata_when_not_cached() {
    let (manager, _) = setup(true);
    {
        let mut settings = manager.after_create(&user(1)).unwrap().unwrap();
        settings.set("color", "blue").unwrap();
    }
    manager.settings(&user(1)).unwrap().finish().unwrap();

    let mut cached = manager.settings(&user(1)).unwrap();
    assert_eq!(cached["color"].default_raw(), None);
    cached.set_default("color").unwrap();
    assert_eq!(cached.value("color").unwrap(), Some(Value::from("red")));
    assert_eq!(cached["color"].default_raw(), Some(Some("red")));
}

#[test]
fn disabled_cache_never_touches_the_backend() {
    let (manager, backend) = setup(false);
    {
        let mut settings = manager.after_create(&user(1)).unwrap().unwrap();
        settings.set("volume", 1).unwrap();
        assert!(settings.cache().is_none());
    }
    assert_eq!(backend.writes(), 0);
    assert_eq!(backend.forgets(), 0);
}

#[test]
fn non_automatic_cache_waits_for_explicit_regeneration() {
    let (manager, backend) = setup_with(true, false);
    manager.after_create(&user(1)).unwrap();
    backend.reset();

    {
        let mut settings = manager.settings(&user(1)).unwrap();
        settings.set("color", "blue").unwrap();
        assert!(!settings.regenerates_on_exit());
    }
    assert_eq!(backend.writes(), 0);

    let settings = manager.settings(&user(1)).unwrap();
    assert!(settings.regenerate(false).unwrap());
    assert_eq!(backend.writes(), 1);
}

#[test]
fn store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.db");
    {
        let store = SettingsStore::open(&path).unwrap();
        store
            .insert_metadata(&shape("color", SettingType::String, Some("red"), "theme", "users"), Utc::now())
            .unwrap();
    }
    let store = SettingsStore::open(&path).unwrap();
    let color = store.metadata_by_name("color").unwrap().unwrap();
    assert_eq!(color.default_value().unwrap(), Some(Value::from("red")));
}
