use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::cache::{cache_key, CacheStore};
use crate::config::CacheConfig;
use crate::error::{CacheError, SettingsError};
use crate::model::{OwnerRef, Setting};

/// One owner's cache entry: the serialized settings under `key` and the
/// instant that snapshot was taken under `key:time`.
///
/// A snapshot is stale when an in-process invalidation happened after it
/// was written, or when the time entry is missing altogether.
pub struct SettingsCache {
    backend: Arc<dyn CacheStore>,
    key: String,
    time_key: String,
    ttl: Duration,
    automatic: bool,
    invalidated_at: Option<DateTime<Utc>>,
}

impl SettingsCache {
    pub fn new(backend: Arc<dyn CacheStore>, key: String, ttl: Duration, automatic: bool) -> Self {
        let time_key = format!("{key}:time");
        Self { backend, key, time_key, ttl, automatic, invalidated_at: None }
    }

    pub fn for_owner(backend: Arc<dyn CacheStore>, config: &CacheConfig, owner: &OwnerRef) -> Self {
        Self::new(backend, cache_key(&config.prefix, owner), config.ttl(), config.automatic)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn time_key(&self) -> &str {
        &self.time_key
    }

    pub fn invalidated_at(&self) -> Option<DateTime<Utc>> {
        self.invalidated_at
    }

    /// Whether the owning collection should regenerate this entry when it
    /// goes out of scope after a write.
    pub fn regenerates_on_exit(&self) -> bool {
        self.automatic
    }

    /// The cached snapshot, if any. A snapshot that no longer parses is
    /// treated as a miss.
    pub fn retrieve(&self) -> Result<Option<Vec<Setting>>, SettingsError> {
        let Some(raw) = self.backend.get(&self.key)? else {
            return Ok(None);
        };
        match serde_json::from_str::<Vec<Setting>>(&raw) {
            Ok(settings) => Ok(Some(settings)),
            Err(e) => {
                log::warn!("discarding unreadable cache entry {}: {e}", self.key);
                Ok(None)
            }
        }
    }

    /// True when no snapshot time is stored, or this instance invalidated
    /// the entry after the stored time.
    pub fn should_regenerate(&self) -> Result<bool, SettingsError> {
        let Some(raw) = self.backend.get(&self.time_key)? else {
            return Ok(true);
        };
        let stored = DateTime::parse_from_rfc3339(&raw)
            .map_err(|_| CacheError::BadTimestamp { key: self.time_key.clone(), value: raw.clone() })?
            .with_timezone(&Utc);
        Ok(self.invalidated_at.is_some_and(|at| at > stored))
    }

    /// Writes `snapshot` and the current time together. Skipped unless
    /// `force` or [`should_regenerate`](Self::should_regenerate).
    /// Returns whether anything was written.
    pub fn regenerate(&self, snapshot: &[&Setting], force: bool) -> Result<bool, SettingsError> {
        if !force && !self.should_regenerate()? {
            return Ok(false);
        }
        let payload = serde_json::to_string(snapshot).map_err(|e| SettingsError::Snapshot(e.to_string()))?;
        let time = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        let entries = [(self.key.as_str(), payload.as_str()), (self.time_key.as_str(), time.as_str())];
        self.backend.set_multiple(&entries, self.ttl)?;
        log::debug!("regenerated cache entry {}", self.key);
        Ok(true)
    }

    /// Drops the stored entry and remembers when that happened.
    pub fn invalidate(&mut self) -> Result<(), SettingsError> {
        self.backend.forget(&self.key)?;
        self.backend.forget(&self.time_key)?;
        self.invalidated_at = Some(Utc::now());
        log::debug!("invalidated cache entry {}", self.key);
        Ok(())
    }

    /// Invalidates at most once per instance. Returns whether it did.
    pub fn invalidate_if_not_invalidated(&mut self) -> Result<bool, SettingsError> {
        if self.invalidated_at.is_some() {
            return Ok(false);
        }
        self.invalidate()?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    fn cache(backend: &Arc<MemoryCache>) -> SettingsCache {
        let backend: Arc<dyn CacheStore> = backend.clone();
        SettingsCache::new(backend, "knobs|user|1".into(), Duration::from_secs(60), true)
    }

    #[test]
    fn empty_entry_needs_regeneration() {
        let backend = Arc::new(MemoryCache::new());
        let cache = cache(&backend);
        assert!(cache.retrieve().unwrap().is_none());
        assert!(cache.should_regenerate().unwrap());
    }

    #[test]
    fn regenerate_writes_both_keys() {
        let backend = Arc::new(MemoryCache::new());
        let cache = cache(&backend);
        assert!(cache.regenerate(&[], false).unwrap());
        assert_eq!(backend.get("knobs|user|1").unwrap().as_deref(), Some("[]"));
        assert!(backend.get("knobs|user|1:time").unwrap().is_some());

        // Fresh entry, no invalidation since: nothing to do.
        assert!(!cache.should_regenerate().unwrap());
        assert!(!cache.regenerate(&[], false).unwrap());
        assert!(cache.regenerate(&[], true).unwrap());
    }

    #[test]
    fn invalidation_happens_once() {
        let backend = Arc::new(MemoryCache::new());
        let mut cache = cache(&backend);
        cache.regenerate(&[], true).unwrap();

        assert!(cache.invalidate_if_not_invalidated().unwrap());
        assert!(backend.is_empty());
        let first = cache.invalidated_at().unwrap();

        assert!(!cache.invalidate_if_not_invalidated().unwrap());
        assert_eq!(cache.invalidated_at(), Some(first));
        assert!(cache.should_regenerate().unwrap());
    }

    #[test]
    fn invalidation_after_other_snapshot_wins() {
        let backend = Arc::new(MemoryCache::new());
        let mut ours = cache(&backend);
        ours.invalidate().unwrap();

        // Another instance writes an older timestamp after our invalidation.
        backend.set("knobs|user|1", "[]", Duration::from_secs(60)).unwrap();
        backend
            .set("knobs|user|1:time", "2000-01-01T00:00:00Z", Duration::from_secs(60))
            .unwrap();
        assert!(ours.should_regenerate().unwrap());

        let theirs = cache(&backend);
        assert!(!theirs.should_regenerate().unwrap());
    }

    #[test]
    fn unreadable_snapshot_is_a_miss() {
        let backend = Arc::new(MemoryCache::new());
        backend.set("knobs|user|1", "not json", Duration::from_secs(60)).unwrap();
        assert!(cache(&backend).retrieve().unwrap().is_none());
    }

    #[test]
    fn bad_time_entry_is_an_error() {
        let backend = Arc::new(MemoryCache::new());
        backend.set("knobs|user|1:time", "yesterday", Duration::from_secs(60)).unwrap();
        let err = cache(&backend).should_regenerate().unwrap_err();
        assert!(matches!(err, SettingsError::Cache(CacheError::BadTimestamp { .. })));
    }
}
