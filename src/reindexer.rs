//! Dense positional ordering across sibling rows.
//!
//! Every operation runs in one backend transaction while holding an
//! in-process lock for its scope, so two writers on the same siblings never
//! interleave their shift statements. Targets are validated before the first
//! shift; a failed operation rolls back and leaves the scope untouched.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use postgres_unit_of_work::TransactionAware;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::scope::Scope;
use crate::traits::{NewRow, OrderBackend, OrderTransaction, OrderedRow, Shift};

/// Unit-of-work participant notified after an operation commits or rolls back.
pub type Participant<'a> = &'a (dyn TransactionAware + Send + Sync);

const LOCK_TABLE_PRUNE_AT: usize = 1024;

/// Identifies an existing sibling used as a positional reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    /// The sibling currently holding this index
    Index(i32),
    /// The sibling with this id
    Entity(Uuid),
}

/// Where a row lands relative to its siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Before(Anchor),
    After(Anchor),
    /// After the current last sibling
    Append,
}

impl Placement {
    pub fn before_index(index: i32) -> Self {
        Placement::Before(Anchor::Index(index))
    }

    pub fn after_index(index: i32) -> Self {
        Placement::After(Anchor::Index(index))
    }

    pub fn before(id: Uuid) -> Self {
        Placement::Before(Anchor::Entity(id))
    }

    pub fn after(id: Uuid) -> Self {
        Placement::After(Anchor::Entity(id))
    }
}

/// Result of a committed write: the operation's value plus every sibling
/// whose index the write shifted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied<T> {
    pub value: T,
    pub shifted: Vec<Uuid>,
}

impl<T> Applied<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            shifted: Vec::new(),
        }
    }

    fn record(&mut self, moved: Vec<Uuid>) {
        for id in moved {
            if !self.shifted.contains(&id) {
                self.shifted.push(id);
            }
        }
    }
}

/// Per-scope async mutexes.
#[derive(Default)]
struct ScopeLocks {
    locks: Mutex<HashMap<Scope, Arc<AsyncMutex<()>>>>,
}

impl ScopeLocks {
    async fn acquire(&self, scope: &Scope) -> OwnedMutexGuard<()> {
        self.handle(scope).lock_owned().await
    }

    fn handle(&self, scope: &Scope) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        if locks.len() >= LOCK_TABLE_PRUNE_AT {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks.entry(*scope).or_default().clone()
    }
}

/// Maintains the dense ordering column of one or more ordered tables.
pub struct Reindexer<B: OrderBackend> {
    backend: B,
    scope_locks: ScopeLocks,
}

impl<B: OrderBackend> Reindexer<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            scope_locks: ScopeLocks::default(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Inserts `row` at `placement` and returns its id.
    ///
    /// Fails with `NotFound` if the anchor matches no sibling; nothing is
    /// shifted or inserted in that case.
    pub async fn insert<R: NewRow + ?Sized>(
        &self,
        scope: &Scope,
        row: &R,
        placement: Placement,
    ) -> StoreResult<Uuid> {
        let applied = self.insert_tracked(scope, row, placement, None).await?;
        Ok(applied.value)
    }

    /// [`Reindexer::insert`] that reports its outcome to `participant` and
    /// returns the siblings it shifted.
    pub async fn insert_tracked<R: NewRow + ?Sized>(
        &self,
        scope: &Scope,
        row: &R,
        placement: Placement,
        participant: Option<Participant<'_>>,
    ) -> StoreResult<Applied<Uuid>> {
        let _guard = self.scope_locks.acquire(scope).await;
        let mut tx = self.backend.begin(scope).await?;
        let outcome = insert_in(&mut tx, scope, row, placement).await;
        let applied = finish(tx, outcome, participant).await?;
        debug!("Inserted {} into {} at {:?}", applied.value, scope, placement);
        Ok(applied)
    }

    /// Moves `id` to `placement` and returns its final index.
    ///
    /// With `placement = None` only the entity's presence is checked; the
    /// ordering is left as is.
    pub async fn move_to(
        &self,
        scope: &Scope,
        id: Uuid,
        placement: Option<Placement>,
    ) -> StoreResult<i32> {
        let applied = self.move_to_tracked(scope, id, placement, None).await?;
        Ok(applied.value)
    }

    /// [`Reindexer::move_to`] that reports its outcome to `participant` and
    /// returns the siblings it shifted.
    pub async fn move_to_tracked(
        &self,
        scope: &Scope,
        id: Uuid,
        placement: Option<Placement>,
        participant: Option<Participant<'_>>,
    ) -> StoreResult<Applied<i32>> {
        let _guard = self.scope_locks.acquire(scope).await;
        let mut tx = self.backend.begin(scope).await?;
        let outcome = move_in(&mut tx, scope, id, placement).await;
        let applied = finish(tx, outcome, participant).await?;
        debug!("Moved {} in {} to index {}", id, scope, applied.value);
        Ok(applied)
    }

    /// Deletes `id` and closes the gap it leaves.
    pub async fn delete(&self, scope: &Scope, id: Uuid) -> StoreResult<()> {
        self.delete_tracked(scope, id, None).await?;
        Ok(())
    }

    /// [`Reindexer::delete`] that reports its outcome to `participant` and
    /// returns the siblings it shifted.
    pub async fn delete_tracked(
        &self,
        scope: &Scope,
        id: Uuid,
        participant: Option<Participant<'_>>,
    ) -> StoreResult<Applied<()>> {
        let _guard = self.scope_locks.acquire(scope).await;
        let mut tx = self.backend.begin(scope).await?;
        let outcome = delete_in(&mut tx, scope, id).await;
        let applied = finish(tx, outcome, participant).await?;
        debug!("Deleted {} from {}", id, scope);
        Ok(applied)
    }

    /// Last committed ordering of `scope`. Does not wait for writers.
    pub async fn list(&self, scope: &Scope) -> StoreResult<Vec<OrderedRow>> {
        let mut tx = self.backend.begin_read(scope).await?;
        let outcome = tx.ordering(scope).await;
        finish(tx, outcome, None).await
    }

    /// Fails with `InvariantViolation` if `scope` is not densely ordered.
    pub async fn verify(&self, scope: &Scope) -> StoreResult<()> {
        let rows = self.list(scope).await?;
        if let Err(detail) = check_dense(scope.table.first_index, &rows) {
            error!("Ordering of {} is not dense: {}", scope, detail);
            return Err(StoreError::invariant(scope, detail));
        }
        Ok(())
    }

    /// Rewrites the indices of `scope` densely, keeping the current relative
    /// order (ties broken by id). Returns how many rows changed.
    ///
    /// A maintenance routine for repairing data written outside the reindexer.
    pub async fn renumber(&self, scope: &Scope) -> StoreResult<usize> {
        let _guard = self.scope_locks.acquire(scope).await;
        let mut tx = self.backend.begin(scope).await?;
        let outcome = renumber_in(&mut tx, scope).await;
        let changed = finish(tx, outcome, None).await?;
        if changed > 0 {
            warn!("Renumbered {} rows in {}", changed, scope);
        }
        Ok(changed)
    }
}

/// Checks that `rows` hold exactly `first, first + 1, ...` once each.
pub fn check_dense(first_index: i32, rows: &[OrderedRow]) -> Result<(), String> {
    let mut indices: Vec<i32> = rows.iter().map(|row| row.order_index).collect();
    indices.sort_unstable();
    for (expected, actual) in (first_index..).zip(&indices) {
        if *actual != expected {
            return Err(format!(
                "expected index {expected}, found {actual} (indices {indices:?})"
            ));
        }
    }
    Ok(())
}

async fn finish<T, Tx: OrderTransaction>(
    tx: Tx,
    outcome: StoreResult<T>,
    participant: Option<Participant<'_>>,
) -> StoreResult<T> {
    match outcome {
        Ok(value) => match tx.commit().await {
            Ok(()) => {
                // The write is durable; participant failures are only logged
                if let Some(participant) = participant {
                    if let Err(err) = participant.on_commit().await {
                        error!(
                            "Participant failed after commit, cached views may be stale until they expire: {}",
                            StoreError::from(err)
                        );
                    }
                }
                Ok(value)
            }
            Err(err) => {
                notify_rollback(participant).await;
                Err(err)
            }
        },
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!("Rollback after failed ordering operation failed: {}", rollback_err);
            }
            notify_rollback(participant).await;
            Err(err)
        }
    }
}

async fn notify_rollback(participant: Option<Participant<'_>>) {
    if let Some(participant) = participant {
        if let Err(err) = participant.on_rollback().await {
            warn!("Participant rollback failed: {}", StoreError::from(err));
        }
    }
}

async fn resolve<Tx: OrderTransaction>(tx: &mut Tx, scope: &Scope, anchor: Anchor) -> StoreResult<i32> {
    match anchor {
        Anchor::Index(index) => match tx.id_at(scope, index).await? {
            Some(_) => Ok(index),
            None => Err(StoreError::index_not_found(scope, index)),
        },
        Anchor::Entity(id) => tx
            .index_of(scope, id)
            .await?
            .ok_or_else(|| StoreError::entity_not_found(scope, id)),
    }
}

/// Resolves `placement`, opens its slot and returns the slot's index along
/// with the siblings shifted to open it.
async fn open_slot<Tx: OrderTransaction>(
    tx: &mut Tx,
    scope: &Scope,
    placement: Placement,
) -> StoreResult<(i32, Vec<Uuid>)> {
    match placement {
        Placement::Before(anchor) => {
            let target = resolve(tx, scope, anchor).await?;
            let moved = tx.shift(scope, Shift::open_at(target)).await?;
            Ok((target, moved))
        }
        Placement::After(anchor) => {
            let target = resolve(tx, scope, anchor).await?;
            let moved = tx.shift(scope, Shift::open_after(target)).await?;
            Ok((target + 1, moved))
        }
        Placement::Append => {
            let slot = tx
                .max_index(scope)
                .await?
                .map_or(scope.table.first_index, |max| max + 1);
            Ok((slot, Vec::new()))
        }
    }
}

async fn insert_in<Tx: OrderTransaction, R: NewRow + ?Sized>(
    tx: &mut Tx,
    scope: &Scope,
    row: &R,
    placement: Placement,
) -> StoreResult<Applied<Uuid>> {
    let (index, moved) = open_slot(tx, scope, placement).await?;
    let id = tx.insert_row(scope, row, index).await?;
    let mut applied = Applied::new(id);
    applied.record(moved);
    Ok(applied)
}

// The slot is opened while the entity still holds its old index, and the
// gap is closed against that captured index afterwards. When the new slot
// precedes the old one the entity itself was pushed to old + 1 by the first
// shift, so closing "> old" lands every sibling back in a dense run.
async fn move_in<Tx: OrderTransaction>(
    tx: &mut Tx,
    scope: &Scope,
    id: Uuid,
    placement: Option<Placement>,
) -> StoreResult<Applied<i32>> {
    let old = tx
        .index_of(scope, id)
        .await?
        .ok_or_else(|| StoreError::entity_not_found(scope, id))?;

    let Some(placement) = placement else {
        return Ok(Applied::new(old));
    };

    let (slot, opened) = open_slot(tx, scope, placement).await?;
    tx.set_index(scope, id, slot).await?;
    let closed = tx.shift(scope, Shift::close_after(old)).await?;

    let mut applied = Applied::new(if slot > old { slot - 1 } else { slot });
    // A sibling shifted up then back down ends where it started
    let moved = opened.iter().filter(|sibling| !closed.contains(sibling));
    let moved_back = closed.iter().filter(|sibling| !opened.contains(sibling));
    applied.record(
        moved
            .chain(moved_back)
            .copied()
            .filter(|sibling| *sibling != id)
            .collect(),
    );
    Ok(applied)
}

async fn delete_in<Tx: OrderTransaction>(
    tx: &mut Tx,
    scope: &Scope,
    id: Uuid,
) -> StoreResult<Applied<()>> {
    let old = tx
        .index_of(scope, id)
        .await?
        .ok_or_else(|| StoreError::entity_not_found(scope, id))?;
    tx.delete_row(scope, id).await?;
    let mut applied = Applied::new(());
    applied.record(tx.shift(scope, Shift::close_after(old)).await?);
    Ok(applied)
}

async fn renumber_in<Tx: OrderTransaction>(tx: &mut Tx, scope: &Scope) -> StoreResult<usize> {
    let rows = tx.ordering(scope).await?;
    let mut changed = 0;
    for (index, row) in (scope.table.first_index..).zip(&rows) {
        if row.order_index != index {
            tx.set_index(scope, row.id, index).await?;
            changed += 1;
        }
    }
    Ok(changed)
}
