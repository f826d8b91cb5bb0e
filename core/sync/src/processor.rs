//! Drain passes over the delivery queue.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use offgrid_common::Result;

use crate::deliver::Deliverer;
use crate::queue::DeliveryQueue;
use crate::retry::RetryPolicy;

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Items delivered and removed from the queue.
    pub delivered: usize,
    /// Items whose delivery failed during this pass.
    pub failed: usize,
    /// Failed items that are still below the retry ceiling.
    pub retryable: usize,
    /// Items skipped because they had already reached the ceiling.
    pub abandoned: usize,
    /// Items left in the queue after reconciliation.
    pub remaining: usize,
}

impl DrainReport {
    /// Whether a later pass could still make progress.
    pub fn needs_retry(&self) -> bool {
        self.retryable > 0
    }
}

/// Attempts delivery of every eligible queued item.
pub struct QueueProcessor {
    queue: Arc<DeliveryQueue>,
    deliverer: Arc<dyn Deliverer>,
    policy: RetryPolicy,
    pass: Mutex<()>,
}

impl QueueProcessor {
    /// Create a processor over a queue.
    pub fn new(queue: Arc<DeliveryQueue>, deliverer: Arc<dyn Deliverer>, policy: RetryPolicy) -> Self {
        Self {
            queue,
            deliverer,
            policy,
            pass: Mutex::new(()),
        }
    }

    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.queue
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run one drain pass.
    ///
    /// Items are attempted in queue order. Items at the retry ceiling are
    /// skipped and stay queued. Failures bump the item's attempt counter.
    /// The outcome is written back with [`DeliveryQueue::reconcile`], so
    /// items appended while the pass runs are kept.
    ///
    /// Passes never overlap: a second caller waits for the running pass
    /// and then drains whatever is left.
    ///
    /// # Errors
    /// - The queue could not be written back; the persisted queue is left
    ///   as it was before the pass
    pub async fn drain(&self) -> Result<DrainReport> {
        let _pass = self.pass.lock().await;

        let mut snapshot = self.queue.list().await;
        let mut delivered = HashSet::new();
        let mut report = DrainReport::default();

        debug!("Draining {} queued alerts", snapshot.len());

        for item in snapshot.iter_mut() {
            if self.policy.is_exhausted(item.attempts) {
                warn!("Alert max attempts reached, giving up: {}", item.id);
                report.abandoned += 1;
                continue;
            }

            match self.deliverer.deliver(item).await {
                Ok(()) => {
                    info!("Emergency alert sent successfully: {}", item.id);
                    delivered.insert(item.id.clone());
                }
                Err(e) => {
                    error!("Failed to send emergency alert {}: {}", item.id, e);
                    item.attempts += 1;
                    report.failed += 1;
                    if !self.policy.is_exhausted(item.attempts) {
                        report.retryable += 1;
                    }
                }
            }
        }

        report.delivered = delivered.len();
        report.remaining = self.queue.reconcile(&delivered, &snapshot).await?;

        info!(
            "Drain finished: {} delivered, {} failed, {} abandoned, {} remaining",
            report.delivered, report.failed, report.abandoned, report.remaining
        );
        Ok(report)
    }
}
