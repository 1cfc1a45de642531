//! Database initialization and cleanup utilities for change notification triggers
//!
//! These install the `notify_order_change()` function that [`ChangeListener`]
//! consumes, and attach it to ordered tables.
//!
//! [`ChangeListener`]: crate::ChangeListener

use sqlx::PgPool;
use tracing::debug;

use crate::scope::OrderedTable;

/// Initialize the change notification trigger function in the database
///
/// # Example
///
/// ```rust,no_run
/// use sqlx::PgPool;
/// use komplex_store::init_change_triggers;
///
/// # async fn example(pool: &PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// init_change_triggers(pool).await?;
/// # Ok(())
/// # }
/// ```
pub async fn init_change_triggers(pool: &PgPool) -> Result<(), sqlx::Error> {
    const SQL: &str = include_str!("../sql/change_notification_triggers.sql");
    sqlx::raw_sql(SQL).execute(pool).await?;
    Ok(())
}

/// Attach `notify_order_change()` to `table`, publishing on `channel`
///
/// Replaces an existing trigger of the same name, so it is safe to call on
/// every startup.
pub async fn attach_change_trigger(
    pool: &PgPool,
    table: &OrderedTable,
    channel: &str,
) -> Result<(), sqlx::Error> {
    let trigger = format!("{}_order_change", table.name);
    let parent_column = table.parent_column.unwrap_or("");
    let sql = format!(
        "DROP TRIGGER IF EXISTS {trigger} ON {table};
         CREATE TRIGGER {trigger}
         AFTER INSERT OR UPDATE OR DELETE ON {table}
         FOR EACH ROW EXECUTE FUNCTION notify_order_change({parent}, {channel});",
        trigger = trigger,
        table = table.name,
        parent = quote_literal(parent_column),
        channel = quote_literal(channel),
    );
    sqlx::raw_sql(&sql).execute(pool).await?;
    debug!("Attached {} to {}", trigger, table.name);
    Ok(())
}

/// Cleanup the change notification trigger function and every trigger
/// attached with [`attach_change_trigger`]
pub async fn cleanup_change_triggers(pool: &PgPool) -> Result<(), sqlx::Error> {
    const SQL: &str = include_str!("../cleanup/cleanup_change_notification_triggers.sql");
    sqlx::raw_sql(SQL).execute(pool).await?;
    Ok(())
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
