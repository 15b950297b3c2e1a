//! Per-owner dynamic settings backed by SQLite.
//!
//! Metadata rows describe each setting (type, default, group, bag); every
//! owner gets one settings row per metadata row. Reads can go through an
//! optional cache that is invalidated on the first write and regenerated
//! once when the owner's collection goes out of scope.

pub mod cache;
pub mod codec;
pub mod collection;
pub mod config;
pub mod error;
pub mod manager;
pub mod model;
pub mod owner;
pub mod settings_cache;
pub mod store;

pub use cache::{cache_key, open_backend, CacheStore, MemoryCache, SqliteCache};
pub use codec::{Collection, SettingType, Value};
pub use collection::SettingsCollection;
pub use config::{CacheBackendKind, CacheConfig, OwnerConfig, StoreConfig};
pub use error::{CacheError, ConfigError, SettingsError};
pub use manager::{DeleteMode, SettingsManager};
pub use model::{Metadata, MetadataId, MetadataShape, NewSetting, OwnerRef, Setting, SettingId};
pub use owner::{OwnerKind, OwnerRegistry, Settable};
pub use settings_cache::SettingsCache;
pub use store::{Comparison, SettingsStore, StoreTransaction};
