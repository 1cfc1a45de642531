//! PostgreSQL ordering backend.
//!
//! Each write transaction starts with `pg_advisory_xact_lock` on the scope's
//! lock key, which serializes ordering writers on the same siblings across
//! every process sharing the database. The lock is released by commit or
//! rollback. Reads take no lock: a listing is one `SELECT`, and writers only
//! publish dense orderings when they commit.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::scope::Scope;
use crate::traits::{NewRow, OrderBackend, OrderTransaction, OrderedRow, Shift};

/// Ordering backend over a PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct PgOrderBackend {
    pool: PgPool,
}

impl PgOrderBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl OrderBackend for PgOrderBackend {
    type Transaction = PgOrderTransaction;

    async fn begin(&self, scope: &Scope) -> StoreResult<Self::Transaction> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(scope.lock_key())
            .execute(&mut *tx)
            .await?;
        debug!("Locked {} for ordering", scope);
        Ok(PgOrderTransaction { tx })
    }

    async fn begin_read(&self, _scope: &Scope) -> StoreResult<Self::Transaction> {
        let tx = self.pool.begin().await?;
        Ok(PgOrderTransaction { tx })
    }
}

/// An open ordering transaction.
pub struct PgOrderTransaction {
    tx: Transaction<'static, Postgres>,
}

/// `SELECT`/`UPDATE`/`DELETE` prefix followed by the scope predicate.
fn scoped<'args>(sql: String, scope: &Scope) -> QueryBuilder<'args, Postgres> {
    let mut builder = QueryBuilder::new(sql);
    push_scope(&mut builder, scope);
    builder
}

fn push_scope(builder: &mut QueryBuilder<'_, Postgres>, scope: &Scope) {
    if let Some(column) = scope.table.parent_column {
        builder.push(" AND ").push(column);
        match scope.parent_id {
            Some(parent) => {
                builder.push(" = ").push_bind(parent);
            }
            None => {
                builder.push(" IS NULL");
            }
        }
    }
}

#[async_trait]
impl OrderTransaction for PgOrderTransaction {
    async fn index_of(&mut self, scope: &Scope, id: Uuid) -> StoreResult<Option<i32>> {
        let table = scope.table;
        let mut builder = QueryBuilder::new(format!(
            "SELECT {} FROM {} WHERE id = ",
            table.index_column, table.name
        ));
        builder.push_bind(id);
        push_scope(&mut builder, scope);

        let row: Option<(Option<i32>,)> = builder
            .build_query_as()
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.and_then(|(index,)| index))
    }

    async fn id_at(&mut self, scope: &Scope, index: i32) -> StoreResult<Option<Uuid>> {
        let table = scope.table;
        let mut builder = QueryBuilder::new(format!(
            "SELECT id FROM {} WHERE {} = ",
            table.name, table.index_column
        ));
        builder.push_bind(index);
        push_scope(&mut builder, scope);
        builder.push(" LIMIT 1");

        let row: Option<(Uuid,)> = builder
            .build_query_as()
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn max_index(&mut self, scope: &Scope) -> StoreResult<Option<i32>> {
        let table = scope.table;
        let mut builder = scoped(
            format!("SELECT MAX({}) FROM {} WHERE TRUE", table.index_column, table.name),
            scope,
        );
        let (max,): (Option<i32>,) = builder.build_query_as().fetch_one(&mut *self.tx).await?;
        Ok(max)
    }

    async fn shift(&mut self, scope: &Scope, shift: Shift) -> StoreResult<Vec<Uuid>> {
        let table = scope.table;
        let comparison = if shift.inclusive { ">=" } else { ">" };
        let mut builder = QueryBuilder::new(format!(
            "UPDATE {table} SET {column} = {column} + ",
            table = table.name,
            column = table.index_column
        ));
        builder
            .push_bind(shift.delta)
            .push(format!(" WHERE {} {} ", table.index_column, comparison))
            .push_bind(shift.from);
        push_scope(&mut builder, scope);
        builder.push(" RETURNING id");

        let moved: Vec<(Uuid,)> = builder.build_query_as().fetch_all(&mut *self.tx).await?;
        Ok(moved.into_iter().map(|(id,)| id).collect())
    }

    async fn set_index(&mut self, scope: &Scope, id: Uuid, index: i32) -> StoreResult<()> {
        let table = scope.table;
        let mut builder = QueryBuilder::new(format!(
            "UPDATE {} SET {} = ",
            table.name, table.index_column
        ));
        builder.push_bind(index).push(" WHERE id = ").push_bind(id);
        push_scope(&mut builder, scope);

        let result = builder.build().execute(&mut *self.tx).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::entity_not_found(scope, id));
        }
        Ok(())
    }

    async fn insert_row<R: NewRow + ?Sized>(
        &mut self,
        scope: &Scope,
        row: &R,
        index: i32,
    ) -> StoreResult<Uuid> {
        let table = scope.table;
        let mut columns: Vec<&str> = row.columns().to_vec();
        if let Some(parent_column) = table.parent_column {
            columns.push(parent_column);
        }
        columns.push(table.index_column);

        let placeholders: Vec<String> = (1..=columns.len()).map(|n| format!("${n}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING id",
            table.name,
            columns.join(", "),
            placeholders.join(", ")
        );

        let mut query = row.bind(sqlx::query(&sql));
        if table.parent_column.is_some() {
            query = query.bind(scope.parent_id);
        }
        let inserted = query.bind(index).fetch_one(&mut *self.tx).await?;
        Ok(inserted.try_get("id")?)
    }

    async fn delete_row(&mut self, scope: &Scope, id: Uuid) -> StoreResult<()> {
        let mut builder = QueryBuilder::new(format!("DELETE FROM {} WHERE id = ", scope.table.name));
        builder.push_bind(id);
        push_scope(&mut builder, scope);

        let result = builder.build().execute(&mut *self.tx).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::entity_not_found(scope, id));
        }
        Ok(())
    }

    async fn ordering(&mut self, scope: &Scope) -> StoreResult<Vec<OrderedRow>> {
        let table = scope.table;
        let mut builder = scoped(
            format!("SELECT id, {} FROM {} WHERE TRUE", table.index_column, table.name),
            scope,
        );
        builder.push(format!(" ORDER BY {} NULLS LAST, id", table.index_column));

        let rows: Vec<(Uuid, Option<i32>)> = builder
            .build_query_as()
            .fetch_all(&mut *self.tx)
            .await?;

        let total = rows.len();
        let ordered: Vec<OrderedRow> = rows
            .into_iter()
            .filter_map(|(id, index)| {
                index.map(|order_index| OrderedRow {
                    id,
                    parent_id: scope.parent_id,
                    order_index,
                })
            })
            .collect();
        if ordered.len() < total {
            warn!("{} rows in {} have no order index", total - ordered.len(), scope);
        }
        Ok(ordered)
    }

    async fn commit(self) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
