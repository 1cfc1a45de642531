//! Entity kind → cache key templates.
//!
//! A write names the kind of entity it changed and the identifiers it knows;
//! the registry renders every template registered for that kind. Keys that
//! depend on an entity are declared once here instead of at each write.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::CacheAside;
use crate::error::StoreResult;
use crate::keys::{Invalidation, KeyTemplate};
use crate::scope::Scope;
use crate::traits::KeyValueStore;

/// Values for template placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationParams(HashMap<String, String>);

impl InvalidationParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.0.insert(name.into(), value.to_string());
        self
    }

    /// `id` plus the parent column of `scope`, when known.
    pub fn for_row(scope: &Scope, id: Option<Uuid>) -> Self {
        let mut params = Self::new();
        if let Some(id) = id {
            params = params.with("id", id);
        }
        if let (Some(column), Some(parent)) = (scope.table.parent_column, scope.parent_id) {
            params = params.with(column, parent);
        }
        params
    }

    pub fn as_map(&self) -> &HashMap<String, String> {
        &self.0
    }
}

#[derive(Debug, Clone, Default)]
pub struct InvalidationRegistry {
    templates: HashMap<String, Vec<KeyTemplate>>,
}

impl InvalidationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares that keys shaped like `template` derive from `kind`.
    pub fn register(&mut self, kind: impl Into<String>, template: impl Into<KeyTemplate>) -> &mut Self {
        let template = template.into();
        let templates = self.templates.entry(kind.into()).or_default();
        if !templates.contains(&template) {
            templates.push(template);
        }
        self
    }

    pub fn with(mut self, kind: impl Into<String>, template: impl Into<KeyTemplate>) -> Self {
        self.register(kind, template);
        self
    }

    pub fn templates(&self, kind: &str) -> &[KeyTemplate] {
        self.templates.get(kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    /// Rendered invalidations for a change to `kind`, without duplicates.
    pub fn targets(&self, kind: &str, params: &InvalidationParams) -> Vec<Invalidation> {
        let mut targets: Vec<Invalidation> = Vec::new();
        for template in self.templates(kind) {
            let target = template.render(params.as_map());
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
        targets
    }

    /// Everything a write to row `id` of `scope` makes stale: the scope's
    /// ordering listing plus the templates registered for its table.
    pub fn targets_for_write(&self, scope: &Scope, id: Option<Uuid>) -> Vec<Invalidation> {
        let mut targets = vec![Invalidation::from(scope.cache_key())];
        for target in self.targets(scope.table.name, &InvalidationParams::for_row(scope, id)) {
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
        targets
    }

    /// Invalidates every key registered for `kind`. Returns how many keys were removed.
    /// Detail targets of rows in `scope` whose position changed as a side
    /// effect of a write. Only templates naming `{id}` are rendered, so the
    /// scope-wide listings are left to [`InvalidationRegistry::targets_for_write`].
    pub fn targets_for_rows(&self, scope: &Scope, ids: &[Uuid]) -> Vec<Invalidation> {
        let mut targets: Vec<Invalidation> = Vec::new();
        let per_row = self
            .templates(scope.table.name)
            .iter()
            .filter(|template| template.placeholders().contains(&"id"));
        for template in per_row {
            for id in ids {
                let params = InvalidationParams::for_row(scope, Some(*id));
                let target = template.render(params.as_map());
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
        }
        targets
    }

    pub async fn invalidate_entity<S: KeyValueStore>(
        &self,
        cache: &CacheAside<S>,
        kind: &str,
        params: &InvalidationParams,
    ) -> StoreResult<u64> {
        let targets = self.targets(kind, params);
        if targets.is_empty() {
            warn!("No cache keys registered for entity kind '{}'", kind);
            return Ok(0);
        }
        let removed = cache.invalidate_all(&targets).await?;
        debug!("Invalidated {} keys for '{}'", removed, kind);
        Ok(removed)
    }
}
