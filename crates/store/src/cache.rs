use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::config::{CacheBackendKind, CacheConfig};
use crate::error::CacheError;
use crate::model::OwnerRef;

/// Key/value store with per-entry expiry, shared by every collection that
/// caches against it.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Writes several entries. Backends that can do this atomically should.
    fn set_multiple(&self, entries: &[(&str, &str)], ttl: Duration) -> Result<(), CacheError> {
        for (key, value) in entries {
            self.set(key, value, ttl)?;
        }
        Ok(())
    }

    /// Returns whether the key existed.
    fn forget(&self, key: &str) -> Result<bool, CacheError>;

    fn flush(&self) -> Result<(), CacheError>;
}

/// `{prefix}|{owner_type}|{owner_id}`. A prefix that already ends in `|`
/// is not doubled.
pub fn cache_key(prefix: &str, owner: &OwnerRef) -> String {
    let prefix = prefix.trim_end_matches('|');
    format!("{prefix}|{}|{}", owner.owner_type, owner.owner_id)
}

/// Opens the configured backend, or `None` when caching is disabled.
pub fn open_backend(config: &CacheConfig) -> Result<Option<Arc<dyn CacheStore>>, CacheError> {
    if !config.enable {
        return Ok(None);
    }
    let backend: Arc<dyn CacheStore> = match config.store {
        CacheBackendKind::Memory => Arc::new(MemoryCache::new()),
        CacheBackendKind::Sqlite => {
            let path = config
                .path
                .as_deref()
                .ok_or_else(|| CacheError::Backend("sqlite cache needs a path".into()))?;
            Arc::new(SqliteCache::open(path)?)
        }
    };
    log::debug!("opened {} cache backend", config.store);
    Ok(Some(backend))
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|e| e.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.set_multiple(&[(key, value)], ttl)
    }

    fn set_multiple(&self, items: &[(&str, &str)], ttl: Duration) -> Result<(), CacheError> {
        let expires_at = Instant::now() + ttl;
        let mut entries = self.entries.lock();
        for (key, value) in items {
            entries.insert((*key).to_string(), Entry { value: (*value).to_string(), expires_at });
        }
        Ok(())
    }

    fn forget(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    fn flush(&self) -> Result<(), CacheError> {
        self.entries.lock().clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
"#;

/// Cache in its own SQLite file. Processes sharing the path share entries.
pub struct SqliteCache {
    conn: Mutex<Connection>,
}

impl SqliteCache {
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, CacheError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, CacheError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(CACHE_SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn expiry_millis(ttl: Duration) -> i64 {
    now_millis().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

impl CacheStore for SqliteCache {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT value FROM cache WHERE key = ?1 AND expires_at > ?2",
                params![key, now_millis()],
                |r| r.get(0),
            )
            .optional()?)
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.set_multiple(&[(key, value)], ttl)
    }

    fn set_multiple(&self, items: &[(&str, &str)], ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.lock();
        let expires_at = expiry_millis(ttl);
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("INSERT OR REPLACE INTO cache (key, value, expires_at) VALUES (?1, ?2, ?3)")?;
            for (key, value) in items {
                stmt.execute(params![key, value, expires_at])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn forget(&self, key: &str) -> Result<bool, CacheError> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM cache WHERE key = ?1", [key])? > 0)
    }

    fn flush(&self) -> Result<(), CacheError> {
        self.conn.lock().execute("DELETE FROM cache", [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(cache: &dyn CacheStore) {
        let ttl = Duration::from_secs(60);
        assert_eq!(cache.get("a").unwrap(), None);

        cache.set("a", "1", ttl).unwrap();
        assert_eq!(cache.get("a").unwrap().as_deref(), Some("1"));

        cache.set_multiple(&[("a", "2"), ("b", "3")], ttl).unwrap();
        assert_eq!(cache.get("a").unwrap().as_deref(), Some("2"));
        assert_eq!(cache.get("b").unwrap().as_deref(), Some("3"));

        assert!(cache.forget("a").unwrap());
        assert!(!cache.forget("a").unwrap());
        assert_eq!(cache.get("a").unwrap(), None);

        cache.flush().unwrap();
        assert_eq!(cache.get("b").unwrap(), None);
    }

    #[test]
    fn memory_backend() {
        exercise(&MemoryCache::new());
    }

    #[test]
    fn sqlite_backend() {
        exercise(&SqliteCache::open_in_memory().unwrap());
    }

    #[test]
    fn expired_entries_are_misses() {
        let memory = MemoryCache::new();
        memory.set("k", "v", Duration::ZERO).unwrap();
        assert_eq!(memory.get("k").unwrap(), None);
        assert!(memory.is_empty());

        let sqlite = SqliteCache::open_in_memory().unwrap();
        sqlite.set("k", "v", Duration::ZERO).unwrap();
        assert_eq!(sqlite.get("k").unwrap(), None);
    }

    #[test]
    fn sqlite_cache_is_shared_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let first = SqliteCache::open(&path).unwrap();
        let second = SqliteCache::open(&path).unwrap();

        first.set("shared", "yes", Duration::from_secs(60)).unwrap();
        assert_eq!(second.get("shared").unwrap().as_deref(), Some("yes"));
    }

    #[test]
    fn key_format() {
        let owner = OwnerRef::new("user", 42);
        assert_eq!(cache_key("knobs", &owner), "knobs|user|42");
        assert_eq!(cache_key("knobs|", &owner), "knobs|user|42");
    }

    #[test]
    fn disabled_cache_opens_nothing() {
        let config = CacheConfig::default();
        assert!(open_backend(&config).unwrap().is_none());

        let enabled = CacheConfig { enable: true, ..CacheConfig::default() };
        assert!(open_backend(&enabled).unwrap().is_some());
    }
}
