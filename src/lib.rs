//! # Komplex Store
//!
//! Dense sibling ordering and cache-aside invalidation for the curriculum
//! backend.
//!
//! ## Key Components
//!
//! - `Reindexer`: keeps the `order_index` column of sibling rows dense across
//!   inserts, moves and deletes, one transaction per operation
//! - `CacheAside`: read-through JSON cache with TTLs, key and pattern invalidation
//! - `InvalidationRegistry`: entity kind → cache key templates
//! - `TransactionAwareInvalidation`: stages invalidations until commit
//!   (`TransactionAware` from postgres-unit-of-work)
//! - `OrderedCollection`: cached listings over a `Reindexer`
//! - `ChangeListener`: invalidates caches for changes made outside the process
//! - `PgOrderBackend` and `RedisKeyValueStore`: the production backends

mod cache;
mod collection;
mod config;
mod curriculum;
mod error;
mod keys;
mod listener;
mod memory;
mod registry;
mod reindexer;
mod scope;
mod traits;
mod transaction_aware_invalidation;

#[cfg(feature = "postgres")]
mod db_init;
#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "redis")]
mod redis_store;

pub use cache::{CacheAside, CacheStatistics};
pub use collection::OrderedCollection;
pub use config::StoreConfig;
pub use curriculum::{
    curriculum_registry, NewGrade, NewLesson, NewSubject, NewTopic, CURRICULUM_TABLES, GRADES,
    LESSONS, SUBJECTS, TOPICS,
};
pub use error::{StoreError, StoreResult};
pub use keys::{escape_glob, glob_regex, is_pattern, CacheKey, Invalidation, KeyTemplate};
pub use memory::{InMemoryKeyValueStore, InMemoryOrderBackend, InMemoryOrderTransaction};
pub use registry::{InvalidationParams, InvalidationRegistry};
pub use reindexer::{check_dense, Anchor, Applied, Participant, Placement, Reindexer};
pub use scope::{OrderedTable, Scope};
pub use traits::{KeyValueStore, NewRow, OrderBackend, OrderTransaction, OrderedRow, Shift};
pub use transaction_aware_invalidation::TransactionAwareInvalidation;

// Re-export listener components
pub use listener::{ChangeAction, ChangeListener, ChangeNotification, DEFAULT_CHANGE_CHANNEL};

#[cfg(feature = "postgres")]
pub use db_init::{attach_change_trigger, cleanup_change_triggers, init_change_triggers};
#[cfg(feature = "postgres")]
pub use postgres::{PgOrderBackend, PgOrderTransaction};
#[cfg(feature = "postgres")]
pub use traits::PgQuery;
#[cfg(feature = "redis")]
pub use redis_store::RedisKeyValueStore;

// Re-export TransactionAware from postgres-unit-of-work for convenience
pub use postgres_unit_of_work::TransactionAware;
