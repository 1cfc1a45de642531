use std::fmt;
use std::hash::Hasher;

use twox_hash::XxHash64;
use uuid::Uuid;

use crate::keys::CacheKey;

/// Describes a table whose rows carry a dense ordering column.
///
/// Table and column names are interpolated into SQL and must be trusted
/// identifiers, never user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OrderedTable {
    /// The table name
    pub name: &'static str,
    /// The column grouping siblings, `None` when the whole table is one scope
    pub parent_column: Option<&'static str>,
    /// The ordering column
    pub index_column: &'static str,
    /// Index held by the first sibling (0 or 1)
    pub first_index: i32,
}

impl OrderedTable {
    /// A globally ordered, zero-based table using the `order_index` column.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            parent_column: None,
            index_column: "order_index",
            first_index: 0,
        }
    }

    /// Groups siblings by `column`.
    pub const fn scoped_by(self, column: &'static str) -> Self {
        Self {
            parent_column: Some(column),
            ..self
        }
    }

    /// Uses `column` as the ordering column.
    pub const fn indexed_by(self, column: &'static str) -> Self {
        Self {
            index_column: column,
            ..self
        }
    }

    /// Numbers siblings from 1 instead of 0.
    pub const fn one_based(self) -> Self {
        Self {
            first_index: 1,
            ..self
        }
    }

    /// The sibling scope under `parent_id`. Unscoped tables ignore the parent.
    pub fn scope(&self, parent_id: Option<Uuid>) -> Scope {
        Scope {
            table: *self,
            parent_id: self.parent_column.and(parent_id),
        }
    }
}

/// A set of rows sharing one parent, ordered independently of other scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Scope {
    pub table: OrderedTable,
    pub parent_id: Option<Uuid>,
}

impl Scope {
    /// 64-bit key for `pg_advisory_xact_lock`, stable across processes.
    pub fn lock_key(&self) -> i64 {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(self.table.name.as_bytes());
        match self.parent_id {
            Some(parent) => hasher.write(parent.as_bytes()),
            None => hasher.write_u8(0),
        }
        hasher.finish() as i64
    }

    /// Cache key of the scope's ordering listing.
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new("order")
            .part(self.table.name)
            .part(self.parent_label())
    }

    fn parent_label(&self) -> String {
        self.parent_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "root".to_string())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table.name, self.parent_label())
    }
}
