//! Durable FIFO queue of pending emergency alerts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use offgrid_common::{Error, Result};
use offgrid_storage::{CacheGeneration, ResourceStore, StoreExt, StoreKey};

/// Well-known key of the serialized queue inside the runtime generation.
pub const QUEUE_KEY: &str = "/api/emergency/queue";

/// An alert waiting for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// Unique ID assigned at enqueue time.
    pub id: String,
    /// Alert body, opaque to the queue.
    pub payload: Value,
    /// When the item was enqueued.
    pub queued_at: DateTime<Utc>,
    /// Failed delivery attempts so far.
    #[serde(default)]
    pub attempts: u32,
}

impl QueueItem {
    fn new(payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload,
            queued_at: Utc::now(),
            attempts: 0,
        }
    }

    /// The payload's `type` field, if it has one.
    pub fn alert_type(&self) -> Option<&str> {
        self.payload.get("type").and_then(Value::as_str)
    }
}

/// Durable FIFO queue persisted as one JSON document.
///
/// All reads and writes go through a single writer lock so an append can
/// never interleave with the read-modify-write of `reconcile`.
pub struct DeliveryQueue {
    store: Arc<dyn ResourceStore>,
    key: StoreKey,
    writer: Mutex<()>,
}

impl DeliveryQueue {
    /// Create a queue stored in the given generation.
    pub fn new(store: Arc<dyn ResourceStore>, generation: &CacheGeneration) -> Self {
        Self::with_key(store, generation.key(QUEUE_KEY))
    }

    /// Create a queue stored under an explicit key.
    pub fn with_key(store: Arc<dyn ResourceStore>, key: StoreKey) -> Self {
        Self {
            store,
            key,
            writer: Mutex::new(()),
        }
    }

    /// Enqueue a payload.
    ///
    /// # Postconditions
    /// - The item is persisted at the tail with `attempts == 0`
    ///
    /// # Errors
    /// - The store could not be read or written
    pub async fn append(&self, payload: Value) -> Result<String> {
        let _writer = self.writer.lock().await;

        let mut items = self.load_for_write().await?;
        let item = QueueItem::new(payload);
        let id = item.id.clone();
        let alert_type = item.alert_type().unwrap_or("unknown").to_string();
        items.push(item);
        self.persist(&items).await?;

        info!("Emergency alert queued: {} ({})", id, alert_type);
        Ok(id)
    }

    /// Items in enqueue order.
    ///
    /// A store or decoding failure is logged and yields an empty queue.
    pub async fn list(&self) -> Vec<QueueItem> {
        let _writer = self.writer.lock().await;
        self.load().await
    }

    /// Number of queued items.
    pub async fn len(&self) -> usize {
        self.list().await.len()
    }

    /// Whether the queue holds no items.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Write back the result of a drain pass.
    ///
    /// Merges against the latest persisted state: delivered ids are
    /// dropped, survivors take the higher of their stored and post-pass
    /// attempt counters, and items appended since the pass started are
    /// kept at the tail. Survivor order is never changed.
    ///
    /// # Returns
    /// Number of items left in the queue.
    ///
    /// # Errors
    /// - The store could not be read or written; nothing is written
    pub async fn reconcile(&self, delivered: &HashSet<String>, pass: &[QueueItem]) -> Result<usize> {
        let _writer = self.writer.lock().await;

        let mut items = match self.store.get_json::<Vec<QueueItem>>(&self.key).await {
            Ok(found) => found.unwrap_or_default(),
            Err(Error::Serialization(e)) => {
                warn!("Delivery queue unreadable during reconcile, rebuilding from pass: {}", e);
                pass.to_vec()
            }
            Err(e) => return Err(e),
        };

        items.retain(|item| !delivered.contains(&item.id));
        for item in items.iter_mut() {
            if let Some(updated) = pass.iter().find(|p| p.id == item.id) {
                item.attempts = item.attempts.max(updated.attempts);
            }
        }

        self.persist(&items).await?;
        Ok(items.len())
    }

    /// Remove every item.
    pub async fn clear(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        self.store.delete(&self.key).await?;
        info!("Delivery queue cleared");
        Ok(())
    }

    /// Remove items whose attempt counter has reached `ceiling`.
    ///
    /// Drain passes never do this on their own; abandoned items stay
    /// queued until purged explicitly.
    ///
    /// # Returns
    /// The removed items.
    pub async fn purge_abandoned(&self, ceiling: u32) -> Result<Vec<QueueItem>> {
        let _writer = self.writer.lock().await;

        let items = self.load_for_write().await?;
        let (abandoned, kept): (Vec<_>, Vec<_>) =
            items.into_iter().partition(|item| item.attempts >= ceiling);

        if !abandoned.is_empty() {
            self.persist(&kept).await?;
            info!("Purged {} abandoned alerts", abandoned.len());
        }
        Ok(abandoned)
    }

    async fn load(&self) -> Vec<QueueItem> {
        match self.store.get_json::<Vec<QueueItem>>(&self.key).await {
            Ok(found) => found.unwrap_or_default(),
            Err(e) => {
                error!("Failed to get delivery queue: {}", e);
                Vec::new()
            }
        }
    }

    /// Like `load`, but only a decoding failure resets to empty; a store
    /// failure aborts so the caller cannot overwrite unread items.
    async fn load_for_write(&self) -> Result<Vec<QueueItem>> {
        match self.store.get_json::<Vec<QueueItem>>(&self.key).await {
            Ok(found) => Ok(found.unwrap_or_default()),
            Err(Error::Serialization(e)) => {
                warn!("Delivery queue unreadable, resetting: {}", e);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn persist(&self, items: &[QueueItem]) -> Result<()> {
        self.store.put_json(&self.key, items).await
    }
}
