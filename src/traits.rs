use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::scope::Scope;

/// Query type handed to [`NewRow::bind`].
#[cfg(feature = "postgres")]
pub type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

/// A row's position within its sibling scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderedRow {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub order_index: i32,
}

/// A range update applied to every sibling at or past a boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shift {
    /// Boundary index
    pub from: i32,
    /// Whether the boundary itself moves (`>=` instead of `>`)
    pub inclusive: bool,
    /// Amount added to each matched index
    pub delta: i32,
}

impl Shift {
    /// Frees `index` by moving it and everything after it up by one.
    pub fn open_at(index: i32) -> Self {
        Self { from: index, inclusive: true, delta: 1 }
    }

    /// Frees `index + 1` by moving everything after `index` up by one.
    pub fn open_after(index: i32) -> Self {
        Self { from: index, inclusive: false, delta: 1 }
    }

    /// Closes the hole left at `index`.
    pub fn close_after(index: i32) -> Self {
        Self { from: index, inclusive: false, delta: -1 }
    }

    pub fn matches(&self, index: i32) -> bool {
        if self.inclusive {
            index >= self.from
        } else {
            index > self.from
        }
    }
}

/// Entity-specific payload of a row inserted through the reindexer.
///
/// The parent and ordering columns are written by the reindexer itself.
pub trait NewRow: Send + Sync {
    /// Payload column names, in the order [`NewRow::bind`] binds them.
    fn columns(&self) -> &'static [&'static str];

    /// Binds one value per payload column.
    #[cfg(feature = "postgres")]
    fn bind<'q>(&'q self, query: PgQuery<'q>) -> PgQuery<'q>;
}

/// A relational store able to run scope-locked ordering transactions.
#[async_trait]
pub trait OrderBackend: Send + Sync {
    type Transaction: OrderTransaction;

    /// Opens a transaction that holds the scope's lock until it ends.
    async fn begin(&self, scope: &Scope) -> StoreResult<Self::Transaction>;

    /// Opens a transaction for reading only. It takes no scope lock and
    /// sees the last committed ordering.
    async fn begin_read(&self, scope: &Scope) -> StoreResult<Self::Transaction>;
}

/// The statements the reindexer composes inside one transaction.
#[async_trait]
pub trait OrderTransaction: Send {
    /// Current index of `id` within `scope`, `None` if the row is absent or unindexed.
    async fn index_of(&mut self, scope: &Scope, id: Uuid) -> StoreResult<Option<i32>>;

    /// The sibling holding `index`, if any.
    async fn id_at(&mut self, scope: &Scope, index: i32) -> StoreResult<Option<Uuid>>;

    /// Highest index in `scope`, `None` when the scope is empty.
    async fn max_index(&mut self, scope: &Scope) -> StoreResult<Option<i32>>;

    /// Applies `shift` to every matching sibling, returning the ids that moved.
    async fn shift(&mut self, scope: &Scope, shift: Shift) -> StoreResult<Vec<Uuid>>;

    async fn set_index(&mut self, scope: &Scope, id: Uuid, index: i32) -> StoreResult<()>;

    /// Inserts a row at `index` and returns its store-assigned id.
    async fn insert_row<R: NewRow + ?Sized>(
        &mut self,
        scope: &Scope,
        row: &R,
        index: i32,
    ) -> StoreResult<Uuid>;

    async fn delete_row(&mut self, scope: &Scope, id: Uuid) -> StoreResult<()>;

    /// All indexed siblings sorted by index, ties broken by id.
    async fn ordering(&mut self, scope: &Scope) -> StoreResult<Vec<OrderedRow>>;

    async fn commit(self) -> StoreResult<()>;

    async fn rollback(self) -> StoreResult<()>;
}

/// A key-value store holding serialized cache entries.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Stores `value` under `key`, expiring after `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Deletes `keys`, returning how many existed.
    async fn del(&self, keys: &[String]) -> StoreResult<u64>;

    /// Keys matching a glob pattern.
    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>>;
}
