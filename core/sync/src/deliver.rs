//! Alert delivery capability.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use offgrid_common::{Error, Result};

use crate::queue::QueueItem;

/// Transport that hands a queued alert to its destination.
#[async_trait]
pub trait Deliverer: Send + Sync {
    /// Deliver one item.
    ///
    /// # Errors
    /// Any error counts as a failed attempt for the item.
    async fn deliver(&self, item: &QueueItem) -> Result<()>;
}

/// Stand-in transport with fixed latency and a random failure rate.
#[derive(Debug, Clone)]
pub struct SimulatedDeliverer {
    latency: Duration,
    failure_rate: f64,
}

impl SimulatedDeliverer {
    /// Create a deliverer; `failure_rate` is clamped to `0.0..=1.0`.
    pub fn new(latency: Duration, failure_rate: f64) -> Self {
        Self {
            latency,
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }

    pub fn failure_rate(&self) -> f64 {
        self.failure_rate
    }
}

impl Default for SimulatedDeliverer {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 0.1)
    }
}

#[async_trait]
impl Deliverer for SimulatedDeliverer {
    async fn deliver(&self, item: &QueueItem) -> Result<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if rand::random::<f64>() < self.failure_rate {
            return Err(Error::Delivery(format!(
                "Simulated network failure for {}",
                item.id
            )));
        }

        debug!("Simulated delivery of {}", item.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn item() -> QueueItem {
        QueueItem {
            id: "alert-1".to_string(),
            payload: json!({"type": "crash"}),
            queued_at: Utc::now(),
            attempts: 0,
        }
    }

    #[tokio::test]
    async fn test_never_failing() {
        let deliverer = SimulatedDeliverer::new(Duration::ZERO, 0.0);
        for _ in 0..20 {
            assert!(deliverer.deliver(&item()).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_always_failing() {
        let deliverer = SimulatedDeliverer::new(Duration::ZERO, 1.0);
        let result = deliverer.deliver(&item()).await;
        assert!(matches!(result, Err(Error::Delivery(_))));
    }

    #[test]
    fn test_failure_rate_clamped() {
        assert_eq!(SimulatedDeliverer::new(Duration::ZERO, 4.0).failure_rate(), 1.0);
        assert_eq!(SimulatedDeliverer::new(Duration::ZERO, -1.0).failure_rate(), 0.0);
    }
}
