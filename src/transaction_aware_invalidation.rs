use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use postgres_unit_of_work::{TransactionAware, TransactionResult};
use tracing::debug;

use crate::cache::CacheAside;
use crate::keys::Invalidation;
use crate::registry::{InvalidationParams, InvalidationRegistry};
use crate::traits::KeyValueStore;

/// Collects cache invalidations during a transaction and applies them only
/// on commit.
pub struct TransactionAwareInvalidation<S>
where
    S: KeyValueStore,
{
    cache: Arc<CacheAside<S>>,
    staged: RwLock<Vec<Invalidation>>,
}

impl<S> TransactionAwareInvalidation<S>
where
    S: KeyValueStore,
{
    pub fn new(cache: Arc<CacheAside<S>>) -> Self {
        Self {
            cache,
            staged: RwLock::new(Vec::new()),
        }
    }

    /// Stages a key or pattern for removal on commit
    pub fn stage(&self, target: impl Into<Invalidation>) {
        let target = target.into();
        let mut staged = self.staged.write();
        if !staged.contains(&target) {
            staged.push(target);
        }
    }

    /// Stages every key the registry derives from `kind`
    pub fn stage_entity(&self, registry: &InvalidationRegistry, kind: &str, params: &InvalidationParams) {
        for target in registry.targets(kind, params) {
            self.stage(target);
        }
    }

    pub fn stage_all(&self, targets: impl IntoIterator<Item = Invalidation>) {
        for target in targets {
            self.stage(target);
        }
    }

    /// Returns the staged invalidations
    pub fn staged(&self) -> Vec<Invalidation> {
        self.staged.read().clone()
    }

    pub fn staged_count(&self) -> usize {
        self.staged.read().len()
    }

    /// Clears all staged invalidations
    pub fn clear_staged(&self) {
        self.staged.write().clear();
    }
}

#[async_trait]
impl<S> TransactionAware for TransactionAwareInvalidation<S>
where
    S: KeyValueStore + 'static,
{
    async fn on_commit(&self) -> TransactionResult<()> {
        let targets = std::mem::take(&mut *self.staged.write());
        if targets.is_empty() {
            return Ok(());
        }
        let removed = self.cache.invalidate_all(&targets).await?;
        debug!("Applied {} staged invalidations, {} keys removed", targets.len(), removed);
        Ok(())
    }

    async fn on_rollback(&self) -> TransactionResult<()> {
        self.staged.write().clear();
        Ok(())
    }
}
