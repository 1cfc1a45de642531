//! In-memory stores.
//!
//! `InMemoryOrderBackend` runs every write transaction against a private
//! copy of the data while holding a store-wide lock, so a transaction either
//! lands whole on commit or not at all. Readers copy the last committed
//! state without waiting for writers. `InMemoryKeyValueStore` mirrors the Redis
//! commands the cache uses, including lazy TTL expiry and glob `KEYS`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::keys::glob_regex;
use crate::scope::Scope;
use crate::traits::{KeyValueStore, NewRow, OrderBackend, OrderTransaction, OrderedRow, Shift};

type Tables = HashMap<Scope, Vec<OrderedRow>>;

/// An ordering backend that keeps rows in process memory.
#[derive(Clone, Default)]
pub struct InMemoryOrderBackend {
    tables: Arc<Mutex<Tables>>,
    committed: Arc<RwLock<Tables>>,
    fail_commits: Arc<AtomicBool>,
}

impl InMemoryOrderBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `count` rows to `scope` with consecutive indices and returns their ids.
    pub async fn seed(&self, scope: &Scope, count: usize) -> Vec<Uuid> {
        let mut tables = self.tables.lock().await;
        let rows = tables.entry(*scope).or_default();
        let start = rows
            .iter()
            .map(|row| row.order_index + 1)
            .max()
            .unwrap_or(scope.table.first_index);
        let ids = (0..count as i32)
            .map(|offset| {
                let id = Uuid::new_v4();
                rows.push(OrderedRow {
                    id,
                    parent_id: scope.parent_id,
                    order_index: start + offset,
                });
                id
            })
            .collect();
        *self.committed.write() = tables.clone();
        ids
    }

    /// Writes a row as-is, bypassing the reindexer.
    pub async fn put_raw(&self, scope: &Scope, id: Uuid, order_index: i32) {
        let mut tables = self.tables.lock().await;
        let rows = tables.entry(*scope).or_default();
        rows.retain(|row| row.id != id);
        rows.push(OrderedRow {
            id,
            parent_id: scope.parent_id,
            order_index,
        });
        *self.committed.write() = tables.clone();
    }

    /// Committed rows of `scope`, sorted by index.
    pub async fn snapshot(&self, scope: &Scope) -> Vec<OrderedRow> {
        let tables = self.tables.lock().await;
        sorted(tables.get(scope).cloned().unwrap_or_default())
    }

    /// Makes every subsequent commit fail until reset.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl OrderBackend for InMemoryOrderBackend {
    type Transaction = InMemoryOrderTransaction;

    async fn begin(&self, _scope: &Scope) -> StoreResult<Self::Transaction> {
        let guard = self.tables.clone().lock_owned().await;
        let working = (*guard).clone();
        Ok(InMemoryOrderTransaction {
            guard: Some(guard),
            committed: self.committed.clone(),
            working,
            fail_commit: self.fail_commits.load(Ordering::SeqCst),
        })
    }

    async fn begin_read(&self, scope: &Scope) -> StoreResult<Self::Transaction> {
        let rows = self.committed.read().get(scope).cloned().unwrap_or_default();
        let mut working = Tables::new();
        working.insert(*scope, rows);
        Ok(InMemoryOrderTransaction {
            guard: None,
            committed: self.committed.clone(),
            working,
            fail_commit: false,
        })
    }
}

/// A transaction over [`InMemoryOrderBackend`]. Read transactions hold no
/// guard and discard their working copy.
pub struct InMemoryOrderTransaction {
    guard: Option<OwnedMutexGuard<Tables>>,
    committed: Arc<RwLock<Tables>>,
    working: Tables,
    fail_commit: bool,
}

impl InMemoryOrderTransaction {
    fn rows(&mut self, scope: &Scope) -> &mut Vec<OrderedRow> {
        self.working.entry(*scope).or_default()
    }
}

#[async_trait]
impl OrderTransaction for InMemoryOrderTransaction {
    async fn index_of(&mut self, scope: &Scope, id: Uuid) -> StoreResult<Option<i32>> {
        Ok(self
            .rows(scope)
            .iter()
            .find(|row| row.id == id)
            .map(|row| row.order_index))
    }

    async fn id_at(&mut self, scope: &Scope, index: i32) -> StoreResult<Option<Uuid>> {
        Ok(self
            .rows(scope)
            .iter()
            .find(|row| row.order_index == index)
            .map(|row| row.id))
    }

    async fn max_index(&mut self, scope: &Scope) -> StoreResult<Option<i32>> {
        Ok(self.rows(scope).iter().map(|row| row.order_index).max())
    }

    async fn shift(&mut self, scope: &Scope, shift: Shift) -> StoreResult<Vec<Uuid>> {
        let mut moved = Vec::new();
        for row in self.rows(scope).iter_mut() {
            if shift.matches(row.order_index) {
                row.order_index += shift.delta;
                moved.push(row.id);
            }
        }
        Ok(moved)
    }

    async fn set_index(&mut self, scope: &Scope, id: Uuid, index: i32) -> StoreResult<()> {
        match self.rows(scope).iter_mut().find(|row| row.id == id) {
            Some(row) => {
                row.order_index = index;
                Ok(())
            }
            None => Err(StoreError::entity_not_found(scope, id)),
        }
    }

    async fn insert_row<R: NewRow + ?Sized>(
        &mut self,
        scope: &Scope,
        _row: &R,
        index: i32,
    ) -> StoreResult<Uuid> {
        let id = Uuid::new_v4();
        self.rows(scope).push(OrderedRow {
            id,
            parent_id: scope.parent_id,
            order_index: index,
        });
        Ok(id)
    }

    async fn delete_row(&mut self, scope: &Scope, id: Uuid) -> StoreResult<()> {
        let rows = self.rows(scope);
        let before = rows.len();
        rows.retain(|row| row.id != id);
        if rows.len() == before {
            return Err(StoreError::entity_not_found(scope, id));
        }
        Ok(())
    }

    async fn ordering(&mut self, scope: &Scope) -> StoreResult<Vec<OrderedRow>> {
        Ok(sorted(self.rows(scope).clone()))
    }

    async fn commit(mut self) -> StoreResult<()> {
        if self.fail_commit {
            return Err(StoreError::StoreUnavailable("commit rejected".to_string()));
        }
        if let Some(guard) = self.guard.as_mut() {
            let working = std::mem::take(&mut self.working);
            *self.committed.write() = working.clone();
            **guard = working;
        }
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        Ok(())
    }
}

fn sorted(mut rows: Vec<OrderedRow>) -> Vec<OrderedRow> {
    rows.sort_by_key(|row| (row.order_index, row.id));
    rows
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: DateTime<Utc>,
}

impl StoredValue {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// A key-value store kept in process memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryKeyValueStore {
    entries: Arc<RwLock<HashMap<String, StoredValue>>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `key` holds an unexpired value.
    pub fn contains(&self, key: &str) -> bool {
        let now = Utc::now();
        self.entries
            .read()
            .get(key)
            .is_some_and(|entry| entry.is_live(now))
    }

    /// Number of unexpired entries.
    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.entries
            .read()
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes expired entries and returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Utc::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        self.entries.write().remove(key);
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let expires_at = Utc::now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.entries.write().insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> StoreResult<u64> {
        let now = Utc::now();
        let mut entries = self.entries.write();
        let removed = keys
            .iter()
            .filter_map(|key| entries.remove(key))
            .filter(|entry| entry.is_live(now))
            .count();
        Ok(removed as u64)
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let matcher = glob_regex(pattern)?;
        let now = Utc::now();
        let mut keys: Vec<String> = self
            .entries
            .read()
            .iter()
            .filter(|(key, entry)| entry.is_live(now) && matcher.is_match(key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
