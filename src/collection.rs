use std::sync::Arc;
use std::time::Duration;

use tracing::error;
use uuid::Uuid;

use crate::cache::CacheAside;
use crate::error::StoreResult;
use crate::registry::InvalidationRegistry;
use crate::reindexer::{Applied, Placement, Reindexer};
use crate::scope::Scope;
use crate::traits::{KeyValueStore, NewRow, OrderBackend, OrderedRow};
use crate::transaction_aware_invalidation::TransactionAwareInvalidation;

/// Ordered rows behind a read-through cache.
///
/// Listings are cached per scope. Every write stages the scope's listing key
/// and the registry's templates for the table, and removes them once the
/// ordering transaction commits, before the call returns. Detail keys of
/// siblings whose index the write shifted are removed right after.
pub struct OrderedCollection<B, S>
where
    B: OrderBackend,
    S: KeyValueStore + 'static,
{
    reindexer: Arc<Reindexer<B>>,
    cache: Arc<CacheAside<S>>,
    registry: Arc<InvalidationRegistry>,
    ttl: Duration,
}

impl<B, S> OrderedCollection<B, S>
where
    B: OrderBackend,
    S: KeyValueStore + 'static,
{
    pub fn new(
        reindexer: Arc<Reindexer<B>>,
        cache: Arc<CacheAside<S>>,
        registry: Arc<InvalidationRegistry>,
    ) -> Self {
        let ttl = cache.default_ttl();
        Self {
            reindexer,
            cache,
            registry,
            ttl,
        }
    }

    /// TTL of cached listings.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn reindexer(&self) -> &Reindexer<B> {
        &self.reindexer
    }

    pub fn cache(&self) -> &CacheAside<S> {
        &self.cache
    }

    pub async fn list(&self, scope: &Scope) -> StoreResult<Vec<OrderedRow>> {
        self.cache
            .get_or_compute(scope.cache_key(), self.ttl, || self.reindexer.list(scope))
            .await
    }

    pub async fn insert<R: NewRow + ?Sized>(
        &self,
        scope: &Scope,
        row: &R,
        placement: Placement,
    ) -> StoreResult<Uuid> {
        let staged = self.staged_for(scope, None);
        let applied = self
            .reindexer
            .insert_tracked(scope, row, placement, Some(&staged))
            .await?;
        Ok(self.forget_shifted(scope, applied).await)
    }

    /// Moves `id`, or with `placement = None` records an in-place update of
    /// its other fields. Both invalidate the row's cached views.
    pub async fn move_to(
        &self,
        scope: &Scope,
        id: Uuid,
        placement: Option<Placement>,
    ) -> StoreResult<i32> {
        let staged = self.staged_for(scope, Some(id));
        let applied = self
            .reindexer
            .move_to_tracked(scope, id, placement, Some(&staged))
            .await?;
        Ok(self.forget_shifted(scope, applied).await)
    }

    pub async fn delete(&self, scope: &Scope, id: Uuid) -> StoreResult<()> {
        let staged = self.staged_for(scope, Some(id));
        let applied = self.reindexer.delete_tracked(scope, id, Some(&staged)).await?;
        self.forget_shifted(scope, applied).await;
        Ok(())
    }

    fn staged_for(&self, scope: &Scope, id: Option<Uuid>) -> TransactionAwareInvalidation<S> {
        let staged = TransactionAwareInvalidation::new(self.cache.clone());
        staged.stage_all(self.registry.targets_for_write(scope, id));
        staged
    }

    /// Drops the cached details of shifted siblings. The write has committed,
    /// so a cache failure is logged and the value still returned.
    async fn forget_shifted<T>(&self, scope: &Scope, applied: Applied<T>) -> T {
        let targets = self.registry.targets_for_rows(scope, &applied.shifted);
        if !targets.is_empty() {
            if let Err(err) = self.cache.invalidate_all(&targets).await {
                error!(
                    "Failed to invalidate {} shifted rows in {}: {}",
                    applied.shifted.len(),
                    scope,
                    err
                );
            }
        }
        applied.value
    }
}
