use std::cell::Cell;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::types::{ToSql, Type};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::codec::{self, SettingType, Value};
use crate::config::is_identifier;
use crate::error::SettingsError;
use crate::model::{Metadata, MetadataId, MetadataShape, NewSetting, OwnerRef, Setting, SettingId};
use crate::owner::{OwnerKind, OwnerRegistry};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS settings_metadata (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    type TEXT NOT NULL,
    "default" TEXT,
    is_enabled INTEGER NOT NULL DEFAULT 1,
    "group" TEXT NOT NULL DEFAULT 'default',
    bag TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS settings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    metadata_id INTEGER NOT NULL REFERENCES settings_metadata(id) ON DELETE CASCADE,
    settable_type TEXT NOT NULL,
    settable_id INTEGER NOT NULL,
    value TEXT,
    is_enabled INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS settings_owner_metadata_unique
    ON settings (metadata_id, settable_type, settable_id);
CREATE INDEX IF NOT EXISTS settings_settable_index ON settings (settable_type, settable_id);
CREATE INDEX IF NOT EXISTS settings_metadata_id_index ON settings (metadata_id);
"#;

const METADATA_COLUMNS: &str =
    r#"id, name, type, "default", is_enabled, "group", bag, created_at, updated_at"#;

const SETTING_SELECT: &str = r#"
SELECT s.id, s.metadata_id, s.settable_type, s.settable_id, s.value, s.is_enabled,
       s.created_at, s.updated_at, m.name, m.type, m."default", m."group", m.bag
FROM settings s
JOIN settings_metadata m ON m.id = s.metadata_id"#;

/// Comparison operators accepted by [`SettingsStore::owners_where`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparison {
    fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

impl std::str::FromStr for Comparison {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "=" | "==" => Ok(Self::Eq),
            "!=" | "<>" => Ok(Self::Ne),
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::Le),
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::Ge),
            other => Err(format!("unknown comparison operator '{other}'")),
        }
    }
}

/// SQLite-backed persistence for metadata and per-owner settings.
///
/// Owner tables are expected to live in the same database file, so the
/// store can back-fill settings for every owner in one statement.
pub struct SettingsStore {
    conn: Connection,
    savepoints: Cell<u32>,
}

impl SettingsStore {
    pub fn open(path: &Path) -> Result<Self, SettingsError> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, SettingsError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    pub fn with_connection(conn: Connection) -> Result<Self, SettingsError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn, savepoints: Cell::new(0) })
    }

    /// The underlying connection, for owner tables that share the file.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Opens a transaction scope. Scopes nest; only the outermost one commits
    /// to disk. Dropping an uncommitted scope rolls it back.
    pub fn transaction(&self) -> Result<StoreTransaction<'_>, SettingsError> {
        let depth = self.savepoints.get() + 1;
        let name = format!("knobs_sp_{depth}");
        self.conn.execute_batch(&format!("SAVEPOINT {name}"))?;
        self.savepoints.set(depth);
        Ok(StoreTransaction { store: self, name, done: false })
    }

    // -----------------------------------------------------------------------
    // Metadata
    // -----------------------------------------------------------------------

    pub fn all_metadata(&self) -> Result<Vec<Metadata>, SettingsError> {
        let sql = format!("SELECT {METADATA_COLUMNS} FROM settings_metadata ORDER BY id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], metadata_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn metadata_by_name(&self, name: &str) -> Result<Option<Metadata>, SettingsError> {
        let sql = format!("SELECT {METADATA_COLUMNS} FROM settings_metadata WHERE name = ?1");
        Ok(self.conn.query_row(&sql, [name], metadata_from_row).optional()?)
    }

    pub fn count_metadata(&self) -> Result<usize, SettingsError> {
        let n: i64 = self.conn.query_row("SELECT COUNT(*) FROM settings_metadata", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    /// Type of a metadata row, or `None` if the row is gone.
    pub fn metadata_type(&self, id: MetadataId) -> Result<Option<SettingType>, SettingsError> {
        let kind: Option<String> = self
            .conn
            .query_row("SELECT type FROM settings_metadata WHERE id = ?1", [id], |r| r.get(0))
            .optional()?;
        kind.map(|k| k.parse()).transpose()
    }

    /// Raw default of a metadata row. Outer `None` when the row is gone.
    pub fn metadata_default_raw(
        &self,
        id: MetadataId,
    ) -> Result<Option<Option<String>>, SettingsError> {
        Ok(self
            .conn
            .query_row(r#"SELECT "default" FROM settings_metadata WHERE id = ?1"#, [id], |r| {
                r.get::<_, Option<String>>(0)
            })
            .optional()?)
    }

    pub fn insert_metadata(
        &self,
        shape: &MetadataShape,
        now: DateTime<Utc>,
    ) -> Result<Metadata, SettingsError> {
        let ts = codec::format_datetime(&now);
        self.conn.execute(
            r#"INSERT INTO settings_metadata (name, type, "default", is_enabled, "group", bag, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)"#,
            params![
                shape.name,
                shape.kind.as_str(),
                shape.default,
                shape.is_enabled,
                shape.group,
                shape.bag,
                ts
            ],
        )?;
        Ok(Metadata {
            id: self.conn.last_insert_rowid(),
            name: shape.name.clone(),
            kind: shape.kind,
            default: shape.default.clone(),
            is_enabled: shape.is_enabled,
            group: shape.group.clone(),
            bag: shape.bag.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn update_metadata(
        &self,
        id: MetadataId,
        shape: &MetadataShape,
        now: DateTime<Utc>,
    ) -> Result<(), SettingsError> {
        self.conn.execute(
            r#"UPDATE settings_metadata
               SET name = ?1, type = ?2, "default" = ?3, is_enabled = ?4, "group" = ?5, bag = ?6, updated_at = ?7
               WHERE id = ?8"#,
            params![
                shape.name,
                shape.kind.as_str(),
                shape.default,
                shape.is_enabled,
                shape.group,
                shape.bag,
                codec::format_datetime(&now),
                id
            ],
        )?;
        Ok(())
    }

    /// Deletes a metadata row and every setting attached to it.
    /// Returns the number of settings removed.
    pub fn delete_metadata(&self, id: MetadataId) -> Result<usize, SettingsError> {
        let settings = self.conn.execute("DELETE FROM settings WHERE metadata_id = ?1", [id])?;
        self.conn.execute("DELETE FROM settings_metadata WHERE id = ?1", [id])?;
        Ok(settings)
    }

    /// Empties both tables and resets their id sequences.
    pub fn truncate(&self) -> Result<(), SettingsError> {
        self.conn.execute_batch(
            "DELETE FROM settings;
             DELETE FROM settings_metadata;
             DELETE FROM sqlite_sequence WHERE name IN ('settings', 'settings_metadata');",
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    /// An owner's settings, restricted to `bags` when given, ordered by id.
    pub fn settings_for_owner(
        &self,
        owner: &OwnerRef,
        bags: Option<&[String]>,
    ) -> Result<Vec<Setting>, SettingsError> {
        let mut sql = format!("{SETTING_SELECT} WHERE s.settable_type = ?1 AND s.settable_id = ?2");
        let mut args: Vec<&dyn ToSql> = vec![&owner.owner_type as &dyn ToSql, &owner.owner_id];
        if let Some(bags) = bags {
            if bags.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders: Vec<String> = (0..bags.len()).map(|i| format!("?{}", i + 3)).collect();
            sql.push_str(&format!(" AND m.bag IN ({})", placeholders.join(", ")));
            for bag in bags {
                args.push(bag);
            }
        }
        sql.push_str(" ORDER BY s.id");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(args.as_slice(), setting_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// One page of a metadata row's settings, across all owners, with ids
    /// greater than `after`.
    pub fn settings_page(
        &self,
        metadata_id: MetadataId,
        after: SettingId,
        limit: usize,
    ) -> Result<Vec<Setting>, SettingsError> {
        let sql = format!("{SETTING_SELECT} WHERE s.metadata_id = ?1 AND s.id > ?2 ORDER BY s.id LIMIT ?3");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![metadata_id, after, limit as i64], setting_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn count_settings(&self, metadata_id: MetadataId) -> Result<usize, SettingsError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM settings WHERE metadata_id = ?1",
            [metadata_id],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    pub fn count_owner_settings(&self, owner: &OwnerRef) -> Result<usize, SettingsError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM settings WHERE settable_type = ?1 AND settable_id = ?2",
            params![owner.owner_type, owner.owner_id],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    pub fn insert_setting(
        &self,
        setting: &NewSetting,
        now: DateTime<Utc>,
    ) -> Result<SettingId, SettingsError> {
        self.conn.execute(
            "INSERT INTO settings (metadata_id, settable_type, settable_id, value, is_enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                setting.metadata_id,
                setting.owner.owner_type,
                setting.owner.owner_id,
                setting.value,
                setting.is_enabled,
                codec::format_datetime(&now)
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Returns whether a row was changed.
    pub fn update_setting_value(
        &self,
        id: SettingId,
        raw: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, SettingsError> {
        let n = self.conn.execute(
            "UPDATE settings SET value = ?1, updated_at = ?2 WHERE id = ?3",
            params![raw, codec::format_datetime(&now), id],
        )?;
        Ok(n > 0)
    }

    pub fn update_setting_enabled(
        &self,
        id: SettingId,
        is_enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, SettingsError> {
        let n = self.conn.execute(
            "UPDATE settings SET is_enabled = ?1, updated_at = ?2 WHERE id = ?3",
            params![is_enabled, codec::format_datetime(&now), id],
        )?;
        Ok(n > 0)
    }

    pub fn delete_owner_settings(&self, owner: &OwnerRef) -> Result<usize, SettingsError> {
        Ok(self.conn.execute(
            "DELETE FROM settings WHERE settable_type = ?1 AND settable_id = ?2",
            params![owner.owner_type, owner.owner_id],
        )?)
    }

    /// Creates one setting per row of the owner kind's table, carrying the
    /// metadata default and enabled flag. Returns the number of rows inserted.
    pub fn fill_settings(
        &self,
        metadata: &Metadata,
        kind: &OwnerKind,
        now: DateTime<Utc>,
    ) -> Result<usize, SettingsError> {
        let table = ident(&kind.table)?;
        let key = ident(&kind.key_column)?;
        let sql = format!(
            "INSERT INTO settings (metadata_id, settable_type, settable_id, value, is_enabled, created_at, updated_at)
             SELECT ?1, ?2, o.\"{key}\", ?3, ?4, ?5, ?5 FROM \"{table}\" o"
        );
        Ok(self.conn.execute(
            &sql,
            params![
                metadata.id,
                kind.owner_type,
                metadata.default,
                metadata.is_enabled,
                codec::format_datetime(&now)
            ],
        )?)
    }

    /// Duplicates every setting of `from` onto `to`, keeping owner, raw value
    /// and enabled flag. Returns the number of rows copied.
    pub fn copy_settings(
        &self,
        from: MetadataId,
        to: MetadataId,
        now: DateTime<Utc>,
    ) -> Result<usize, SettingsError> {
        Ok(self.conn.execute(
            "INSERT INTO settings (metadata_id, settable_type, settable_id, value, is_enabled, created_at, updated_at)
             SELECT ?1, settable_type, settable_id, value, is_enabled, ?2, ?2
             FROM settings WHERE metadata_id = ?3",
            params![to, codec::format_datetime(&now), from],
        )?)
    }

    /// Primary keys of every row in the owner kind's table.
    pub fn owner_ids(&self, kind: &OwnerKind) -> Result<Vec<i64>, SettingsError> {
        let table = ident(&kind.table)?;
        let key = ident(&kind.key_column)?;
        let mut stmt = self.conn.prepare(&format!("SELECT \"{key}\" FROM \"{table}\" ORDER BY \"{key}\""))?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Owners of `kind` whose setting for `metadata` compares true against
    /// `value`. Numeric types compare numerically and date-times by instant;
    /// a `None` value matches null rows for `Eq` and non-null rows for `Ne`.
    pub fn owners_where(
        &self,
        kind: &OwnerKind,
        metadata: &Metadata,
        cmp: Comparison,
        value: Option<&Value>,
    ) -> Result<Vec<i64>, SettingsError> {
        let table = ident(&kind.table)?;
        let key = ident(&kind.key_column)?;
        let raw = codec::encode(metadata.kind, value)?;

        let numeric = matches!(metadata.kind, SettingType::Integer | SettingType::Float);
        let number: Option<f64> = match (&raw, numeric) {
            (Some(r), true) => r.parse().ok(),
            _ => None,
        };

        let (condition, operand): (String, Option<&dyn ToSql>) = match (&raw, &number) {
            (None, _) => match cmp {
                Comparison::Eq => ("s.value IS NULL".into(), None),
                Comparison::Ne => ("s.value IS NOT NULL".into(), None),
                _ => return Ok(Vec::new()),
            },
            (Some(_), Some(n)) => (format!("CAST(s.value AS REAL) {} ?3", cmp.sql()), Some(n as &dyn ToSql)),
            (Some(r), None) if metadata.kind == SettingType::DateTime => (
                format!("julianday(s.value) {} julianday(?3)", cmp.sql()),
                Some(r as &dyn ToSql),
            ),
            (Some(r), None) => (format!("s.value {} ?3", cmp.sql()), Some(r as &dyn ToSql)),
        };

        let sql = format!(
            "SELECT o.\"{key}\" FROM \"{table}\" o
             WHERE EXISTS (
                 SELECT 1 FROM settings s
                 WHERE s.settable_type = ?1 AND s.settable_id = o.\"{key}\" AND s.metadata_id = ?2
                   AND {condition}
             )
             ORDER BY o.\"{key}\""
        );

        let mut args: Vec<&dyn ToSql> = vec![&kind.owner_type as &dyn ToSql, &metadata.id];
        if let Some(operand) = operand {
            args.push(operand);
        }
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(args.as_slice(), |r| r.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Removes settings whose metadata is gone, whose owner row no longer
    /// exists, or whose owner type is not registered. An empty registry only
    /// removes metadata orphans. Returns the number of rows deleted.
    pub fn delete_orphaned_settings(&self, registry: &OwnerRegistry) -> Result<usize, SettingsError> {
        let mut deleted = self.conn.execute(
            "DELETE FROM settings WHERE metadata_id NOT IN (SELECT id FROM settings_metadata)",
            [],
        )?;

        if registry.is_empty() {
            return Ok(deleted);
        }

        for kind in registry.kinds() {
            let table = ident(&kind.table)?;
            let key = ident(&kind.key_column)?;
            deleted += self.conn.execute(
                &format!(
                    "DELETE FROM settings WHERE settable_type = ?1
                     AND settable_id NOT IN (SELECT \"{key}\" FROM \"{table}\")"
                ),
                [&kind.owner_type],
            )?;
        }

        let types = registry.owner_types();
        let placeholders: Vec<String> = (1..=types.len()).map(|i| format!("?{i}")).collect();
        deleted += self.conn.execute(
            &format!("DELETE FROM settings WHERE settable_type NOT IN ({})", placeholders.join(", ")),
            rusqlite::params_from_iter(types.iter()),
        )?;

        Ok(deleted)
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// Savepoint guard returned by [`SettingsStore::transaction`].
pub struct StoreTransaction<'s> {
    store: &'s SettingsStore,
    name: String,
    done: bool,
}

impl StoreTransaction<'_> {
    pub fn commit(mut self) -> Result<(), SettingsError> {
        self.store.conn.execute_batch(&format!("RELEASE {}", self.name))?;
        self.finish();
        Ok(())
    }

    pub fn rollback(mut self) -> Result<(), SettingsError> {
        let result = self.rollback_inner();
        self.finish();
        result
    }

    fn rollback_inner(&self) -> Result<(), SettingsError> {
        self.store
            .conn
            .execute_batch(&format!("ROLLBACK TO {0}; RELEASE {0}", self.name))?;
        Ok(())
    }

    fn finish(&mut self) {
        self.done = true;
        self.store.savepoints.set(self.store.savepoints.get().saturating_sub(1));
    }
}

impl Drop for StoreTransaction<'_> {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = self.rollback_inner() {
                log::error!("rollback of {} failed: {e}", self.name);
            }
            self.finish();
        }
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn ident(name: &str) -> Result<&str, SettingsError> {
    if is_identifier(name) {
        Ok(name)
    } else {
        Err(SettingsError::InvalidIdentifier(name.to_string()))
    }
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn kind_at(row: &Row, idx: usize) -> rusqlite::Result<SettingType> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: SettingsError| conversion_error(idx, e.to_string()))
}

fn timestamp_at(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    codec::parse_datetime(&raw).ok_or_else(|| conversion_error(idx, format!("bad timestamp '{raw}'")))
}

fn metadata_from_row(row: &Row) -> rusqlite::Result<Metadata> {
    Ok(Metadata {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: kind_at(row, 2)?,
        default: row.get(3)?,
        is_enabled: row.get(4)?,
        group: row.get(5)?,
        bag: row.get(6)?,
        created_at: timestamp_at(row, 7)?,
        updated_at: timestamp_at(row, 8)?,
    })
}

fn setting_from_row(row: &Row) -> rusqlite::Result<Setting> {
    Ok(Setting {
        id: row.get(0)?,
        metadata_id: row.get(1)?,
        owner: OwnerRef::new(row.get::<_, String>(2)?, row.get(3)?),
        value: row.get(4)?,
        is_enabled: row.get(5)?,
        created_at: timestamp_at(row, 6)?,
        updated_at: timestamp_at(row, 7)?,
        name: row.get(8)?,
        kind: Some(kind_at(row, 9)?),
        default: Some(row.get(10)?),
        group: row.get(11)?,
        bag: row.get(12)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
