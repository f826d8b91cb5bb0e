//! Completion notifications for connected observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Event broadcast after a successful sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncEvent {
    /// A queue drain finished.
    #[serde(rename = "BACKGROUND_SYNC_COMPLETE")]
    SyncComplete {
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
    /// Periodic work finished; `processed_items` is the record log size.
    #[serde(rename = "PERIODIC_SYNC_COMPLETE")]
    PeriodicSyncComplete {
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
        #[serde(rename = "processedItems")]
        processed_items: usize,
    },
}

impl SyncEvent {
    pub fn sync_complete() -> Self {
        SyncEvent::SyncComplete {
            timestamp: Utc::now(),
        }
    }

    pub fn periodic_sync_complete(processed_items: usize) -> Self {
        SyncEvent::PeriodicSyncComplete {
            timestamp: Utc::now(),
            processed_items,
        }
    }
}

/// Fire-and-forget fan-out to every subscribed observer.
#[derive(Debug, Clone)]
pub struct Observers {
    sender: broadcast::Sender<SyncEvent>,
}

impl Observers {
    /// Create a fan-out buffering up to `capacity` events per observer.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Connect a new observer.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Send an event to every connected observer.
    ///
    /// # Returns
    /// Number of observers the event reached; zero when nobody listens.
    pub fn notify(&self, event: SyncEvent) -> usize {
        match self.sender.send(event) {
            Ok(reached) => reached,
            Err(_) => {
                debug!("No observers connected");
                0
            }
        }
    }
}

impl Default for Observers {
    fn default() -> Self {
        Self::new(16)
    }
}
