use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::{self, SettingType, Value};
use crate::error::SettingsError;

pub type MetadataId = i64;
pub type SettingId = i64;

// ---------------------------------------------------------------------------
// Owner reference
// ---------------------------------------------------------------------------

/// Polymorphic owner: a type discriminator plus the owner's numeric key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerRef {
    pub owner_type: String,
    pub owner_id: i64,
}

impl OwnerRef {
    pub fn new(owner_type: impl Into<String>, owner_id: i64) -> Self {
        Self { owner_type: owner_type.into(), owner_id }
    }
}

impl std::fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.owner_type, self.owner_id)
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// One row of `settings_metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub id: MetadataId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SettingType,
    /// Raw encoded default.
    pub default: Option<String>,
    pub is_enabled: bool,
    pub group: String,
    pub bag: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Metadata {
    pub fn default_value(&self) -> Result<Option<Value>, SettingsError> {
        codec::decode(self.kind, self.default.as_deref())
    }

    /// The persisted shape, for comparison against a desired one.
    pub fn shape(&self) -> MetadataShape {
        MetadataShape {
            name: self.name.clone(),
            kind: self.kind,
            default: self.default.clone(),
            is_enabled: self.is_enabled,
            group: self.group.clone(),
            bag: self.bag.clone(),
        }
    }
}

/// Everything about a metadata row except its id and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataShape {
    pub name: String,
    pub kind: SettingType,
    pub default: Option<String>,
    pub is_enabled: bool,
    pub group: String,
    pub bag: String,
}

// ---------------------------------------------------------------------------
// Setting
// ---------------------------------------------------------------------------

/// One owner's row in `settings`, joined with the fields of its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    pub id: SettingId,
    pub metadata_id: MetadataId,
    pub owner: OwnerRef,
    /// Raw encoded value.
    pub value: Option<String>,
    pub is_enabled: bool,
    pub name: String,
    /// `None` when the row came without its metadata type (older snapshots).
    #[serde(rename = "type", default)]
    pub kind: Option<SettingType>,
    pub group: String,
    pub bag: String,
    /// Raw metadata default. Not part of cache snapshots; `None` means "not loaded".
    #[serde(skip)]
    pub(crate) default: Option<Option<String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Setting {
    /// A freshly inserted row built from its metadata.
    pub fn from_metadata(
        id: SettingId,
        owner: OwnerRef,
        metadata: &Metadata,
        is_enabled: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            metadata_id: metadata.id,
            owner,
            value: metadata.default.clone(),
            is_enabled,
            name: metadata.name.clone(),
            kind: Some(metadata.kind),
            group: metadata.group.clone(),
            bag: metadata.bag.clone(),
            default: Some(metadata.default.clone()),
            created_at: now,
            updated_at: now,
        }
    }

    /// Decoded value. Without a known type the raw text comes back unchanged.
    pub fn value(&self) -> Result<Option<Value>, SettingsError> {
        codec::decode_or_raw(self.kind, self.value.as_deref())
    }

    pub fn raw_value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    /// Raw default if it was loaded with the row.
    pub fn default_raw(&self) -> Option<Option<&str>> {
        self.default.as_ref().map(|d| d.as_deref())
    }

    pub fn is_enabled(&self) -> bool {
        self.is_enabled
    }

    pub fn is_disabled(&self) -> bool {
        !self.is_enabled
    }
}

/// Insert payload for a single `settings` row.
#[derive(Debug, Clone)]
pub struct NewSetting {
    pub metadata_id: MetadataId,
    pub owner: OwnerRef,
    pub value: Option<String>,
    pub is_enabled: bool,
}
