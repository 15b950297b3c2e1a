use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use knobs_store::{
    cache_key, CacheStore, Metadata, NewSetting, OwnerKind, OwnerRef, OwnerRegistry, SettingsStore,
    StoreConfig,
};

use crate::confirm::Confirm;
use crate::declaration::Declaration;
use crate::error::MigrateError;
use crate::registrar::DeclarationSource;

const PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrateOptions {
    /// Delete every metadata and setting row before migrating.
    pub refresh: bool,
    /// Flush the whole cache store before migrating.
    pub flush_cache: bool,
    /// Skip confirmations in production.
    pub force: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub metadata_updated: usize,
    pub metadata_created: usize,
    pub metadata_deleted: usize,
    pub settings_transformed: usize,
    pub settings_created: usize,
    pub settings_deleted: usize,
    pub cache_keys_forgotten: usize,
    pub cache_flushed: bool,
    pub refreshed: bool,
}

impl MigrationReport {
    pub fn changed(&self) -> bool {
        self.metadata_updated + self.metadata_created + self.metadata_deleted > 0 || self.refreshed
    }
}

/// State shared by the pipeline stages.
#[derive(Default)]
struct Context {
    declarations: Vec<Declaration>,
    metadata: BTreeMap<String, Metadata>,
    owners: Vec<OwnerKind>,
    invalidate_cache: bool,
    report: MigrationReport,
}

impl Context {
    fn is_declared(&self, name: &str) -> bool {
        self.declarations.iter().any(|d| d.name == name)
    }
}

/// Brings persisted metadata and settings in line with a set of declarations.
///
/// Stages run in a fixed order. Everything between loading declarations
/// and removing old metadata happens in one transaction; the cache flush
/// runs before it and the cache invalidation after it commits.
pub struct Migrator<'a> {
    store: &'a SettingsStore,
    registry: &'a OwnerRegistry,
    config: &'a StoreConfig,
    cache: Option<Arc<dyn CacheStore>>,
}

impl<'a> Migrator<'a> {
    pub fn new(store: &'a SettingsStore, registry: &'a OwnerRegistry, config: &'a StoreConfig) -> Self {
        Self { store, registry, config, cache: None }
    }

    pub fn with_cache(mut self, backend: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(backend);
        self
    }

    pub fn run(
        &self,
        source: &dyn DeclarationSource,
        confirm: &mut dyn Confirm,
        options: MigrateOptions,
    ) -> Result<MigrationReport, MigrateError> {
        let mut ctx = Context::default();
        let now = Utc::now();

        self.flush_cache(&mut ctx, confirm, options)?;

        let tx = self.store.transaction()?;
        self.load_declarations(&mut ctx, source)?;
        self.load_metadata(&mut ctx)?;
        self.find_owners(&mut ctx)?;
        self.ensure_something_to_migrate(&ctx)?;
        self.ensure_targets_exist(&ctx)?;
        self.confirm_delete(&ctx, confirm, options)?;
        self.refresh(&mut ctx, confirm, options)?;
        self.update_existing(&mut ctx, now)?;
        self.create_new(&mut ctx, now)?;
        self.remove_old(&mut ctx)?;
        tx.commit()?;

        self.invalidate_cache(&mut ctx)?;
        Ok(ctx.report)
    }

    /// Confirmations only apply in production, and `force` skips them.
    fn gated(&self, options: MigrateOptions) -> bool {
        self.config.is_production() && !options.force
    }

    // -----------------------------------------------------------------------
    // 1. Flush cache
    // -----------------------------------------------------------------------

    fn flush_cache(
        &self,
        ctx: &mut Context,
        confirm: &mut dyn Confirm,
        options: MigrateOptions,
    ) -> Result<(), MigrateError> {
        if !options.flush_cache {
            return Ok(());
        }
        let backend = match (&self.cache, self.config.cache.enable) {
            (Some(backend), true) => backend,
            _ => return Err(MigrateError::CacheDisabled),
        };
        let store = self.config.cache.store;
        if self.gated(options)
            && !confirm.confirm(&format!("The cache store {store} will be flushed completely. Proceed?"))
        {
            return Err(MigrateError::Rejected(format!("flush of the {store} cache")));
        }
        backend.flush()?;
        ctx.report.cache_flushed = true;
        log::info!("flushed the {store} cache store");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // 2-4. Load declarations, metadata, owners
    // -----------------------------------------------------------------------

    fn load_declarations(&self, ctx: &mut Context, source: &dyn DeclarationSource) -> Result<(), MigrateError> {
        for declaration in source.declarations()? {
            match ctx.declarations.iter_mut().find(|d| d.name == declaration.name) {
                Some(existing) => *existing = declaration,
                None => ctx.declarations.push(declaration),
            }
        }
        log::debug!("loaded {} declarations", ctx.declarations.len());
        Ok(())
    }

    fn load_metadata(&self, ctx: &mut Context) -> Result<(), MigrateError> {
        ctx.metadata = self
            .store
            .all_metadata()?
            .into_iter()
            .map(|m| (m.name.clone(), m))
            .collect();
        log::debug!("loaded {} existing metadata", ctx.metadata.len());
        Ok(())
    }

    fn find_owners(&self, ctx: &mut Context) -> Result<(), MigrateError> {
        let duplicated = self.registry.duplicate_tables();
        if !duplicated.is_empty() {
            return Err(MigrateError::DuplicateOwnerTables(duplicated));
        }
        ctx.owners = self.registry.kinds().to_vec();
        if ctx.owners.is_empty() {
            log::warn!("no owner types registered; new settings will not be filled for any owner");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // 5-6. Integrity checks
    // -----------------------------------------------------------------------

    fn ensure_something_to_migrate(&self, ctx: &Context) -> Result<(), MigrateError> {
        if ctx.metadata.is_empty() && ctx.declarations.is_empty() {
            return Err(MigrateError::NothingToMigrate);
        }
        Ok(())
    }

    fn ensure_targets_exist(&self, ctx: &Context) -> Result<(), MigrateError> {
        let mut absent: Vec<String> = Vec::new();
        for from in ctx.declarations.iter().filter_map(|d| d.from.as_deref()) {
            let resolves = ctx.is_declared(from) || ctx.metadata.contains_key(from);
            if !resolves && !absent.iter().any(|a| a == from) {
                absent.push(from.to_string());
            }
        }
        if absent.is_empty() {
            Ok(())
        } else {
            Err(MigrateError::UnresolvedTargets(absent))
        }
    }

    // -----------------------------------------------------------------------
    // 7-8. Confirmations
    // -----------------------------------------------------------------------

    fn confirm_delete(
        &self,
        ctx: &Context,
        confirm: &mut dyn Confirm,
        options: MigrateOptions,
    ) -> Result<(), MigrateError> {
        if !self.gated(options) {
            return Ok(());
        }
        let count = ctx.metadata.keys().filter(|name| !ctx.is_declared(name)).count();
        if count > 0
            && !confirm.confirm(&format!("There are {count} old settings that will be deleted on sync. Proceed?"))
        {
            return Err(MigrateError::Rejected("settings migration".into()));
        }
        Ok(())
    }

    fn refresh(
        &self,
        ctx: &mut Context,
        confirm: &mut dyn Confirm,
        options: MigrateOptions,
    ) -> Result<(), MigrateError> {
        if !options.refresh {
            return Ok(());
        }
        if self.gated(options) && !confirm.confirm("ALL settings will be deleted completely. Proceed?") {
            return Err(MigrateError::Rejected("settings refresh".into()));
        }
        self.store.truncate()?;
        ctx.metadata.clear();
        ctx.invalidate_cache = true;
        ctx.report.refreshed = true;
        log::info!("deleted all settings and metadata");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // 9. Update existing metadata
    // -----------------------------------------------------------------------

    fn update_existing(&self, ctx: &mut Context, now: DateTime<Utc>) -> Result<(), MigrateError> {
        let mut updated = 0;
        let mut transformed = 0;

        for declaration in &ctx.declarations {
            let Some(metadata) = ctx.metadata.get_mut(&declaration.name) else {
                continue;
            };
            let shape = declaration.to_shape()?;
            if shape == metadata.shape() {
                continue;
            }

            let old_kind = metadata.kind;
            self.store.update_metadata(metadata.id, &shape, now)?;
            if declaration.using.is_some() {
                // Transforms see each value as it was typed before the update.
                let mut after = 0;
                loop {
                    let page = self.store.settings_page(metadata.id, after, PAGE_SIZE)?;
                    let Some(last) = page.last() else {
                        break;
                    };
                    after = last.id;
                    for mut setting in page {
                        setting.kind = Some(old_kind);
                        if let Some(raw) = declaration.transform(&setting)? {
                            self.store.update_setting_value(setting.id, raw.as_deref(), now)?;
                            transformed += 1;
                        }
                    }
                }
            }

            metadata.kind = shape.kind;
            metadata.default = shape.default;
            metadata.is_enabled = shape.is_enabled;
            metadata.group = shape.group;
            metadata.bag = shape.bag;
            metadata.updated_at = now;
            updated += 1;
        }

        if updated > 0 {
            ctx.invalidate_cache = true;
        }
        ctx.report.metadata_updated = updated;
        ctx.report.settings_transformed = transformed;
        log::info!("updated {updated} metadata, with {transformed} updated settings");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // 10. Create new metadata
    // -----------------------------------------------------------------------

    fn create_new(&self, ctx: &mut Context, now: DateTime<Utc>) -> Result<(), MigrateError> {
        let pending: Vec<&Declaration> =
            ctx.declarations.iter().filter(|d| !ctx.metadata.contains_key(&d.name)).collect();
        let ordered = creation_order(&pending)?;

        let mut created_metadata: Vec<Metadata> = Vec::new();
        let mut created_settings = 0;

        for declaration in ordered {
            let metadata = self.store.insert_metadata(&declaration.to_shape()?, now)?;
            let source = declaration.from.as_deref().and_then(|from| {
                ctx.metadata
                    .get(from)
                    .or_else(|| created_metadata.iter().find(|m| m.name == from))
            });

            let rows = match source {
                None => {
                    if let Some(from) = &declaration.from {
                        log::warn!("'{}' migrates from '{from}', which no longer exists; using defaults", declaration.name);
                    }
                    let mut rows = 0;
                    for kind in &ctx.owners {
                        rows += self.store.fill_settings(&metadata, kind, now)?;
                    }
                    rows
                }
                Some(source) if declaration.using.is_none() => {
                    self.store.copy_settings(source.id, metadata.id, now)?
                }
                Some(source) => self.transform_into(declaration, source, &metadata, now)?,
            };

            log::debug!("created '{}' with {rows} settings", metadata.name);
            created_settings += rows;
            created_metadata.push(metadata);
        }

        let created = created_metadata.len();
        if created_settings > 0 {
            ctx.invalidate_cache = true;
        }
        for metadata in created_metadata {
            ctx.metadata.insert(metadata.name.clone(), metadata);
        }
        ctx.report.metadata_created = created;
        ctx.report.settings_created = created_settings;
        log::info!("added {created} new settings, with {created_settings} new setting rows");
        Ok(())
    }

    /// One new row per source row, valued by the declaration's transform.
    /// Each row keeps its owner and enabled flag.
    fn transform_into(
        &self,
        declaration: &Declaration,
        source: &Metadata,
        target: &Metadata,
        now: DateTime<Utc>,
    ) -> Result<usize, MigrateError> {
        let mut rows = 0;
        let mut after = 0;
        loop {
            let page = self.store.settings_page(source.id, after, PAGE_SIZE)?;
            let Some(last) = page.last() else {
                break;
            };
            after = last.id;
            for setting in &page {
                let value = declaration.transform(setting)?.unwrap_or_default();
                self.store.insert_setting(
                    &NewSetting {
                        metadata_id: target.id,
                        owner: setting.owner.clone(),
                        value,
                        is_enabled: setting.is_enabled,
                    },
                    now,
                )?;
                rows += 1;
            }
        }
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // 11. Remove old metadata
    // -----------------------------------------------------------------------

    fn remove_old(&self, ctx: &mut Context) -> Result<(), MigrateError> {
        let stale: Vec<String> = ctx.metadata.keys().filter(|name| !ctx.is_declared(name)).cloned().collect();

        let mut affected = 0;
        for name in &stale {
            if let Some(metadata) = ctx.metadata.remove(name) {
                affected += self.store.delete_metadata(metadata.id)?;
            }
        }

        if !stale.is_empty() {
            ctx.invalidate_cache = true;
        }
        ctx.report.metadata_deleted = stale.len();
        ctx.report.settings_deleted = affected;
        log::info!("deleted {} metadata settings, with {affected} settings deleted", stale.len());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // 12. Invalidate cache
    // -----------------------------------------------------------------------

    fn invalidate_cache(&self, ctx: &mut Context) -> Result<(), MigrateError> {
        if !ctx.invalidate_cache || ctx.report.cache_flushed || !self.config.cache.enable {
            return Ok(());
        }
        let Some(backend) = &self.cache else {
            return Ok(());
        };

        let mut forgotten = 0;
        for kind in &ctx.owners {
            for id in self.store.owner_ids(kind)? {
                let key = cache_key(&self.config.cache.prefix, &OwnerRef::new(kind.owner_type.clone(), id));
                backend.forget(&key)?;
                backend.forget(&format!("{key}:time"))?;
                forgotten += 2;
            }
        }
        ctx.report.cache_keys_forgotten = forgotten;
        log::info!("forgot {forgotten} cache keys from the {} cache store", self.config.cache.store);
        Ok(())
    }
}

/// New declarations in an order where every `from` pointing at another new
/// declaration comes after its source. Relative order is otherwise kept.
fn creation_order<'d>(pending: &[&'d Declaration]) -> Result<Vec<&'d Declaration>, MigrateError> {
    let mut remaining: Vec<&Declaration> = pending.to_vec();
    let mut ordered: Vec<&Declaration> = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let waiting: HashSet<&str> = remaining.iter().map(|d| d.name.as_str()).collect();
        let (ready, blocked): (Vec<&Declaration>, Vec<&Declaration>) = remaining
            .iter()
            .copied()
            .partition(|d| d.from.as_deref().map_or(true, |from| !waiting.contains(from)));

        if ready.is_empty() {
            let names = blocked.iter().map(|d| d.name.clone()).collect();
            return Err(MigrateError::CircularMigration(names));
        }
        ordered.extend(ready);
        remaining = blocked;
    }

    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(ordered: &[&Declaration]) -> Vec<String> {
        ordered.iter().map(|d| d.name.clone()).collect()
    }

    #[test]
    fn sources_are_created_first() {
        let c = Declaration::new("c", "users").from("b");
        let b = Declaration::new("b", "users").from("a");
        let a = Declaration::new("a", "users");
        let x = Declaration::new("x", "users").from("old");

        let ordered = creation_order(&[&c, &b, &a, &x]).unwrap();
        assert_eq!(names(&ordered), vec!["a", "x", "b", "c"]);
    }

    #[test]
    fn cycles_are_rejected() {
        let a = Declaration::new("a", "users").from("b");
        let b = Declaration::new("b", "users").from("a");
        let c = Declaration::new("c", "users");

        let err = creation_order(&[&a, &b, &c]).unwrap_err();
        match err {
            MigrateError::CircularMigration(names) => assert_eq!(names, vec!["a", "b"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn report_changed() {
        assert!(!MigrationReport::default().changed());
        let report = MigrationReport { metadata_created: 1, ..Default::default() };
        assert!(report.changed());
    }
}
