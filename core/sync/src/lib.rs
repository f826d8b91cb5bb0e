//! Offgrid alert delivery and sync scheduling
//!
//! This module provides the durable side of the offline layer:
//! - Delivery queue with bounded retries and merge-on-write reconciliation
//! - Capped background record log
//! - Queue processor with a pluggable delivery capability
//! - Sync trigger for on-demand, periodic and deferred retry runs
//! - Completion notifications for connected observers

pub mod deliver;
pub mod observer;
pub mod processor;
pub mod queue;
pub mod records;
pub mod retry;
pub mod trigger;

#[cfg(test)]
mod testing;

// Re-export main types
pub use deliver::{Deliverer, SimulatedDeliverer};
pub use observer::{Observers, SyncEvent};
pub use processor::{DrainReport, QueueProcessor};
pub use queue::{DeliveryQueue, QueueItem, QUEUE_KEY};
pub use records::{BackgroundLog, BackgroundRecord, DEFAULT_RECORD_CAP, RECORDS_KEY};
pub use retry::RetryPolicy;
pub use trigger::{
    PeriodicReport, SyncCoordinator, SyncSource, SyncTrigger, SyncTriggerHandle, TriggerConfig,
};
