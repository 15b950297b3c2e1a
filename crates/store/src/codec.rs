//! Type codec: conversion between the raw text stored in `settings.value` /
//! `settings_metadata.default` and typed in-memory values.
//!
//! `None` short-circuits both directions regardless of type. The codec is the
//! only place values are stringified; the database only ever sees the output
//! of [`encode`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::SettingsError;
use crate::model::MetadataId;
use crate::store::SettingsStore;

// ---------------------------------------------------------------------------
// Setting types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingType {
    String,
    Integer,
    Float,
    Boolean,
    Array,
    Collection,
    DateTime,
}

impl SettingType {
    pub const ALL: [SettingType; 7] = [
        Self::String,
        Self::Integer,
        Self::Float,
        Self::Boolean,
        Self::Array,
        Self::Collection,
        Self::DateTime,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Collection => "collection",
            Self::DateTime => "datetime",
        }
    }
}

impl fmt::Display for SettingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettingType {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| SettingsError::UnknownType(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// Ordered collection of JSON items, the decoded form of `collection` settings.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Collection(Vec<Json>);

impl Collection {
    pub fn new(items: Vec<Json>) -> Self {
        Self(items)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Json> {
        self.0.get(index)
    }

    pub fn first(&self) -> Option<&Json> {
        self.0.first()
    }

    pub fn last(&self) -> Option<&Json> {
        self.0.last()
    }

    pub fn contains(&self, item: &Json) -> bool {
        self.0.contains(item)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Json> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Json] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<Json> {
        self.0
    }
}

impl From<Vec<Json>> for Collection {
    fn from(items: Vec<Json>) -> Self {
        Self(items)
    }
}

impl FromIterator<Json> for Collection {
    fn from_iter<I: IntoIterator<Item = Json>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Array(Vec<Json>),
    Collection(Collection),
    DateTime(DateTime<Utc>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Items of an array or collection value.
    pub fn as_items(&self) -> Option<&[Json]> {
        match self {
            Self::Array(items) => Some(items),
            Self::Collection(c) => Some(c.as_slice()),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    /// Loose truthiness used when a value is written into a boolean setting.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::String(s) => is_truthy_str(s),
            Self::Integer(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Boolean(b) => *b,
            Self::Array(items) => !items.is_empty(),
            Self::Collection(c) => !c.is_empty(),
            Self::DateTime(_) => true,
        }
    }

    /// JSON form of a single value, used when a scalar is wrapped into a list.
    pub fn to_json(&self) -> Json {
        match self {
            Self::String(s) => Json::String(s.clone()),
            Self::Integer(i) => Json::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null),
            Self::Boolean(b) => Json::Bool(*b),
            Self::Array(items) => Json::Array(items.clone()),
            Self::Collection(c) => Json::Array(c.as_slice().to_vec()),
            Self::DateTime(dt) => Json::String(format_datetime(dt)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Array(_) | Self::Collection(_) => write!(f, "{}", self.to_json()),
            Self::DateTime(dt) => f.write_str(&format_datetime(dt)),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Integer(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<Vec<Json>> for Value {
    fn from(items: Vec<Json>) -> Self {
        Self::Array(items)
    }
}

impl From<Collection> for Value {
    fn from(c: Collection) -> Self {
        Self::Collection(c)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::DateTime(dt)
    }
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Raw stored text -> typed value.
pub fn decode(kind: SettingType, raw: Option<&str>) -> Result<Option<Value>, SettingsError> {
    let Some(raw) = raw else {
        return Ok(None);
    };

    let value = match kind {
        SettingType::String => Value::String(raw.to_string()),
        SettingType::Integer => Value::Integer(
            parse_integer(raw).ok_or_else(|| decode_error(kind, raw, "not an integer"))?,
        ),
        SettingType::Float => {
            Value::Float(parse_float(raw).ok_or_else(|| decode_error(kind, raw, "not a number"))?)
        }
        SettingType::Boolean => Value::Boolean(is_truthy_str(raw)),
        SettingType::Array => Value::Array(parse_json_list(kind, raw)?),
        SettingType::Collection => Value::Collection(Collection(parse_json_list(kind, raw)?)),
        SettingType::DateTime => Value::DateTime(
            parse_datetime(raw).ok_or_else(|| decode_error(kind, raw, "not a date-time"))?,
        ),
    };

    Ok(Some(value))
}

/// Decode when the type may be unknown: without a type the raw text is
/// returned unchanged as a string.
pub fn decode_or_raw(
    kind: Option<SettingType>,
    raw: Option<&str>,
) -> Result<Option<Value>, SettingsError> {
    match kind {
        Some(kind) => decode(kind, raw),
        None => Ok(raw.map(|r| Value::String(r.to_string()))),
    }
}

/// Decode with the unknown-type fallback: the explicit type, then the type
/// of the persisted metadata row, then the raw text unchanged.
pub fn cast_with_context(
    kind: Option<SettingType>,
    metadata_id: MetadataId,
    store: &SettingsStore,
    raw: Option<&str>,
) -> Result<Option<Value>, SettingsError> {
    decode_or_raw(kind_with_context(kind, metadata_id, store)?, raw)
}

/// Encoding counterpart of [`cast_with_context`]. Without any known type the
/// value is stored as its display text.
pub fn encode_with_context(
    kind: Option<SettingType>,
    metadata_id: MetadataId,
    store: &SettingsStore,
    value: Option<&Value>,
) -> Result<Option<String>, SettingsError> {
    match kind_with_context(kind, metadata_id, store)? {
        Some(kind) => encode(kind, value),
        None => Ok(value.map(|v| v.to_string())),
    }
}

fn kind_with_context(
    kind: Option<SettingType>,
    metadata_id: MetadataId,
    store: &SettingsStore,
) -> Result<Option<SettingType>, SettingsError> {
    match kind {
        Some(kind) => Ok(Some(kind)),
        None => store.metadata_type(metadata_id),
    }
}

fn decode_error(kind: SettingType, raw: &str, reason: impl Into<String>) -> SettingsError {
    SettingsError::Decode { kind, raw: raw.to_string(), reason: reason.into() }
}

fn parse_json_list(kind: SettingType, raw: &str) -> Result<Vec<Json>, SettingsError> {
    let parsed: Json =
        serde_json::from_str(raw).map_err(|e| decode_error(kind, raw, e.to_string()))?;
    Ok(wrap_json(parsed))
}

/// Lists pass through, null becomes empty, anything else becomes a single item.
fn wrap_json(value: Json) -> Vec<Json> {
    match value {
        Json::Array(items) => items,
        Json::Null => Vec::new(),
        other => vec![other],
    }
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Typed value -> raw stored text, coercing the value into `kind`.
pub fn encode(kind: SettingType, value: Option<&Value>) -> Result<Option<String>, SettingsError> {
    let Some(value) = value else {
        return Ok(None);
    };

    let raw = match kind {
        SettingType::String => match value {
            Value::String(s) => s.clone(),
            Value::Boolean(b) => bool_raw(*b).to_string(),
            other => other.to_string(),
        },
        SettingType::Integer => encode_integer(value)?.to_string(),
        SettingType::Float => encode_float(value)?.to_string(),
        SettingType::Boolean => bool_raw(value.is_truthy()).to_string(),
        SettingType::Array | SettingType::Collection => {
            let items = match value {
                Value::Array(items) => items.clone(),
                Value::Collection(c) => c.as_slice().to_vec(),
                scalar => vec![scalar.to_json()],
            };
            serde_json::to_string(&Json::Array(items)).map_err(|e| SettingsError::Encode {
                kind,
                reason: e.to_string(),
            })?
        }
        SettingType::DateTime => format_datetime(&encode_datetime(value)?),
    };

    Ok(Some(raw))
}

fn encode_error(kind: SettingType, reason: impl Into<String>) -> SettingsError {
    SettingsError::Encode { kind, reason: reason.into() }
}

fn encode_integer(value: &Value) -> Result<i64, SettingsError> {
    let kind = SettingType::Integer;
    match value {
        Value::Integer(i) => Ok(*i),
        Value::Float(f) => {
            truncate_to_i64(*f).ok_or_else(|| encode_error(kind, format!("{f} is out of integer range")))
        }
        Value::Boolean(b) => Ok(i64::from(*b)),
        Value::String(s) => parse_integer(s).ok_or_else(|| encode_error(kind, format!("'{s}' is not an integer"))),
        Value::DateTime(dt) => Ok(dt.timestamp()),
        Value::Array(_) | Value::Collection(_) => Err(encode_error(kind, "lists cannot be stored as integers")),
    }
}

fn encode_float(value: &Value) -> Result<f64, SettingsError> {
    let kind = SettingType::Float;
    match value {
        Value::Float(f) => Ok(*f),
        Value::Integer(i) => Ok(*i as f64),
        Value::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => parse_float(s).ok_or_else(|| encode_error(kind, format!("'{s}' is not a number"))),
        Value::DateTime(dt) => Ok(dt.timestamp() as f64),
        Value::Array(_) | Value::Collection(_) => Err(encode_error(kind, "lists cannot be stored as floats")),
    }
}

fn encode_datetime(value: &Value) -> Result<DateTime<Utc>, SettingsError> {
    let kind = SettingType::DateTime;
    match value {
        Value::DateTime(dt) => Ok(*dt),
        Value::String(s) => parse_datetime(s).ok_or_else(|| encode_error(kind, format!("'{s}' is not a date-time"))),
        Value::Integer(ts) => Utc
            .timestamp_opt(*ts, 0)
            .single()
            .ok_or_else(|| encode_error(kind, format!("timestamp {ts} is out of range"))),
        other => Err(encode_error(kind, format!("{other} is not a date-time"))),
    }
}

// ---------------------------------------------------------------------------
// Scalars
// ---------------------------------------------------------------------------

fn bool_raw(b: bool) -> &'static str {
    if b {
        "1"
    } else {
        "0"
    }
}

fn is_truthy_str(s: &str) -> bool {
    !matches!(s.trim(), "" | "0" | "false")
}

fn parse_integer(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Ok(i) = s.parse::<i64>() {
        return Some(i);
    }
    s.parse::<f64>().ok().and_then(truncate_to_i64)
}

/// Truncates toward zero; `None` when the result does not fit an `i64`.
fn truncate_to_i64(f: f64) -> Option<i64> {
    // 2^63, exactly representable.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    let t = f.trunc();
    (t.is_finite() && (-LIMIT..LIMIT).contains(&t)).then_some(t as i64)
}

fn parse_float(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok()
}

/// RFC 3339 in UTC with a `Z` suffix; sub-second digits only when present.
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.f]` (read as UTC) and `YYYY-MM-DD`.
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
