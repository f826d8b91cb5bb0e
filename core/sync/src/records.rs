//! Capped log of background telemetry records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use offgrid_common::{Error, Result};
use offgrid_storage::{CacheGeneration, ResourceStore, StoreExt, StoreKey};

/// Well-known key of the serialized log inside the runtime generation.
pub const RECORDS_KEY: &str = "/api/background/data";

/// Default number of live records.
pub const DEFAULT_RECORD_CAP: usize = 200;

/// A write-once telemetry record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundRecord {
    pub id: String,
    /// Type tag taken from the payload's `type` field.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub payload: Value,
    pub stored_at: DateTime<Utc>,
}

impl BackgroundRecord {
    fn new(payload: Value) -> Self {
        let kind = payload.get("type").and_then(Value::as_str).map(str::to_string);
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            payload,
            stored_at: Utc::now(),
        }
    }
}

/// Append-only record log with FIFO eviction past `cap`.
pub struct BackgroundLog {
    store: Arc<dyn ResourceStore>,
    key: StoreKey,
    cap: usize,
    writer: Mutex<()>,
}

impl BackgroundLog {
    /// Create a log in the given generation with the default cap.
    pub fn new(store: Arc<dyn ResourceStore>, generation: &CacheGeneration) -> Self {
        Self::with_cap(store, generation, DEFAULT_RECORD_CAP)
    }

    /// Create a log keeping at most `cap` records.
    pub fn with_cap(store: Arc<dyn ResourceStore>, generation: &CacheGeneration, cap: usize) -> Self {
        Self {
            store,
            key: generation.key(RECORDS_KEY),
            cap: cap.max(1),
            writer: Mutex::new(()),
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Append a record, evicting the oldest entries beyond the cap.
    ///
    /// # Errors
    /// - The store could not be read or written
    pub async fn append(&self, payload: Value) -> Result<String> {
        let _writer = self.writer.lock().await;

        let mut records = match self.store.get_json::<Vec<BackgroundRecord>>(&self.key).await {
            Ok(found) => found.unwrap_or_default(),
            Err(Error::Serialization(e)) => {
                warn!("Background log unreadable, resetting: {}", e);
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let record = BackgroundRecord::new(payload);
        let id = record.id.clone();
        let kind = record.kind.clone().unwrap_or_else(|| "unknown".to_string());
        records.push(record);
        if records.len() > self.cap {
            let excess = records.len() - self.cap;
            records.drain(..excess);
        }

        self.store.put_json(&self.key, &records).await?;
        info!("Background data stored: {}", kind);
        Ok(id)
    }

    /// Records oldest first; empty on any store or decoding failure.
    pub async fn list(&self) -> Vec<BackgroundRecord> {
        match self.store.get_json::<Vec<BackgroundRecord>>(&self.key).await {
            Ok(found) => found.unwrap_or_default(),
            Err(e) => {
                error!("Failed to get background data: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.list().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove every record.
    pub async fn clear(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        self.store.delete(&self.key).await?;
        info!("Background data cleared");
        Ok(())
    }
}
