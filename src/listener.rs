use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use uuid::Uuid;

use crate::cache::CacheAside;
use crate::error::StoreResult;
use crate::registry::InvalidationRegistry;
use crate::scope::OrderedTable;
use crate::traits::KeyValueStore;

/// The default channel name for row change notifications
pub const DEFAULT_CHANGE_CHANNEL: &str = "order_change";

/// The kind of row change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

/// Notification payload published by `notify_order_change()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    /// The table name that was modified
    pub table: String,
    /// The action performed
    pub action: ChangeAction,
    /// The primary key of the affected row
    pub id: Uuid,
    /// The row's parent, for scoped tables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
}

/// Invalidates cached views for row changes made outside this process,
/// such as raw SQL run from the admin console.
pub struct ChangeListener<S: KeyValueStore> {
    cache: Arc<CacheAside<S>>,
    registry: Arc<InvalidationRegistry>,
    tables: HashMap<String, OrderedTable>,
    channel: String,
}

impl<S: KeyValueStore> ChangeListener<S> {
    /// Create a new listener on the default channel
    pub fn new(cache: Arc<CacheAside<S>>, registry: Arc<InvalidationRegistry>) -> Self {
        Self::with_channel(cache, registry, DEFAULT_CHANGE_CHANNEL)
    }

    /// Create a new listener with a custom channel name
    pub fn with_channel(
        cache: Arc<CacheAside<S>>,
        registry: Arc<InvalidationRegistry>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            registry,
            tables: HashMap::new(),
            channel: channel.into(),
        }
    }

    /// Watch changes to `table`
    pub fn register_table(&mut self, table: OrderedTable) {
        debug!("Watching table '{}'", table.name);
        self.tables.insert(table.name.to_string(), table);
    }

    /// Get the channel name this listener is using
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Invalidates everything derived from the changed row. Returns the
    /// number of removed keys; changes to unwatched tables are ignored.
    pub async fn handle(&self, notification: &ChangeNotification) -> StoreResult<u64> {
        let Some(table) = self.tables.get(&notification.table) else {
            debug!("No table registered for '{}'", notification.table);
            return Ok(0);
        };

        let scope = table.scope(notification.parent_id);
        let targets = self.registry.targets_for_write(&scope, Some(notification.id));
        let removed = self.cache.invalidate_all(&targets).await?;
        debug!(
            "Change {:?} on {} row {} invalidated {} keys",
            notification.action, scope, notification.id, removed
        );
        Ok(removed)
    }

    /// Process a single notification payload
    ///
    /// This method can be called from your own notification polling loop.
    pub async fn process_notification(&self, payload: &str) {
        match serde_json::from_str::<ChangeNotification>(payload) {
            Ok(notification) => {
                if let Err(e) = self.handle(&notification).await {
                    error!(
                        "Failed to invalidate cache for {} row {}: {}",
                        notification.table, notification.id, e
                    );
                }
            }
            Err(e) => {
                error!("Failed to parse change notification: {}", e);
                debug!("Payload was: {}", payload);
            }
        }
    }

    /// Listens on the configured channel and processes notifications until
    /// the connection cannot be re-established.
    ///
    /// Designed to run in a background task. On a receive error the listener
    /// waits five seconds, reconnects and resubscribes.
    #[cfg(feature = "postgres")]
    pub async fn listen(&self, pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
        let mut listener = sqlx::postgres::PgListener::connect_with(pool).await?;
        listener.listen(&self.channel).await?;
        debug!("Started listening on channel '{}'", self.channel);

        loop {
            match listener.recv().await {
                Ok(notification) => {
                    self.process_notification(notification.payload()).await;
                }
                Err(e) => {
                    error!("Error receiving notification: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;

                    match sqlx::postgres::PgListener::connect_with(pool).await {
                        Ok(new_listener) => {
                            listener = new_listener;
                            if let Err(listen_err) = listener.listen(&self.channel).await {
                                error!(
                                    "Failed to re-listen on channel '{}': {}",
                                    self.channel, listen_err
                                );
                                return Err(listen_err);
                            }
                            debug!("Reconnected and listening on channel '{}'", self.channel);
                        }
                        Err(connect_err) => {
                            error!("Failed to reconnect to database: {}", connect_err);
                        }
                    }
                }
            }
        }
    }
}
