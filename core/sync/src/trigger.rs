//! Sync scheduling: on-demand, periodic and deferred retry.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use offgrid_common::{Error, Result};

use crate::observer::{Observers, SyncEvent};
use crate::processor::{DrainReport, QueueProcessor};
use crate::records::BackgroundLog;
use crate::retry::RetryPolicy;

/// What started a drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSource {
    /// Requested right after an enqueue or by a client.
    OnDemand,
    /// Recurring periodic signal.
    Periodic,
    /// One-shot retry signal, e.g. after connectivity came back.
    DeferredRetry,
}

/// Result of the periodic handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodicReport {
    pub drain: DrainReport,
    /// Size of the background record log at the time of the run.
    pub processed_items: usize,
}

/// Handlers run by the scheduler loop; callable directly as well.
pub struct SyncCoordinator {
    processor: Arc<QueueProcessor>,
    records: Arc<BackgroundLog>,
    observers: Observers,
}

impl SyncCoordinator {
    pub fn new(processor: Arc<QueueProcessor>, records: Arc<BackgroundLog>, observers: Observers) -> Self {
        Self {
            processor,
            records,
            observers,
        }
    }

    pub fn observers(&self) -> &Observers {
        &self.observers
    }

    pub fn processor(&self) -> &Arc<QueueProcessor> {
        &self.processor
    }

    /// Drain the queue and tell every observer it finished.
    ///
    /// # Errors
    /// - The drain failed; no observer is notified
    pub async fn on_sync(&self, source: SyncSource) -> Result<DrainReport> {
        info!("Background sync triggered ({:?})", source);
        match self.processor.drain().await {
            Ok(report) => {
                self.observers.notify(SyncEvent::sync_complete());
                Ok(report)
            }
            Err(e) => {
                error!("Background sync failed: {}", e);
                Err(e)
            }
        }
    }

    /// Periodic work: drain the queue, then report the record log size.
    ///
    /// # Errors
    /// - The drain failed; no observer is notified
    pub async fn on_periodic_sync(&self) -> Result<PeriodicReport> {
        info!("Performing periodic background work");
        let drain = match self.processor.drain().await {
            Ok(report) => report,
            Err(e) => {
                error!("Periodic sync failed: {}", e);
                return Err(e);
            }
        };

        let processed_items = self.records.len().await;
        if processed_items > 0 {
            debug!("Inspected {} background records", processed_items);
        }

        self.observers
            .notify(SyncEvent::periodic_sync_complete(processed_items));
        Ok(PeriodicReport {
            drain,
            processed_items,
        })
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, Default)]
pub struct TriggerConfig {
    /// Period of the recurring signal; `None` disables it.
    pub periodic_interval: Option<Duration>,
    /// Ceiling and backoff for deferred retries.
    pub retry: RetryPolicy,
}

enum TriggerCommand {
    RunNow(oneshot::Sender<Result<DrainReport>>),
    ConnectivityRestored,
    Shutdown,
}

/// Cloneable front end of the scheduler.
#[derive(Clone)]
pub struct SyncTrigger {
    registered: Arc<Notify>,
    commands: mpsc::Sender<TriggerCommand>,
}

impl SyncTrigger {
    /// Create a trigger and the handle that runs its loop.
    pub fn new(config: TriggerConfig) -> (Self, SyncTriggerHandle) {
        let registered = Arc::new(Notify::new());
        let (commands, command_rx) = mpsc::channel(32);

        let trigger = Self {
            registered: registered.clone(),
            commands,
        };
        let handle = SyncTriggerHandle {
            config,
            registered,
            commands: command_rx,
        };
        (trigger, handle)
    }

    /// Ask for an on-demand sync.
    ///
    /// Registrations made before the loop gets to them collapse into a
    /// single drain pass.
    pub fn register(&self) {
        debug!("Background sync registered");
        self.registered.notify_one();
    }

    /// Deliver the deferred retry signal now.
    pub async fn connectivity_restored(&self) -> Result<()> {
        self.send(TriggerCommand::ConnectivityRestored).await
    }

    /// Run a drain pass and wait for its report.
    ///
    /// # Errors
    /// - The scheduler loop is not running
    /// - The drain failed
    pub async fn run_now(&self) -> Result<DrainReport> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(TriggerCommand::RunNow(reply_tx)).await?;
        reply_rx
            .await
            .map_err(|_| Error::Closed("Sync trigger dropped the request".to_string()))?
    }

    /// Stop the scheduler loop.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(TriggerCommand::Shutdown).await;
    }

    async fn send(&self, command: TriggerCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::Closed("Sync trigger not running".to_string()))
    }
}

/// The scheduler loop; spawn [`SyncTriggerHandle::run`] on the runtime.
pub struct SyncTriggerHandle {
    config: TriggerConfig,
    registered: Arc<Notify>,
    commands: mpsc::Receiver<TriggerCommand>,
}

impl SyncTriggerHandle {
    /// Run until shutdown or until every [`SyncTrigger`] is dropped.
    ///
    /// Exact firing times of the periodic and deferred signals depend on
    /// the runtime's timer; only their ordering relative to each other is
    /// guaranteed.
    pub async fn run(mut self, coordinator: Arc<SyncCoordinator>) {
        let mut periodic = self.config.periodic_interval.map(|period| {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut retry = DeferredRetry::new(self.config.retry.clone());

        info!("Sync trigger started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(TriggerCommand::RunNow(reply)) => {
                        let result = coordinator.on_sync(SyncSource::OnDemand).await;
                        retry.after(&result);
                        let _ = reply.send(result);
                    }
                    Some(TriggerCommand::ConnectivityRestored) => {
                        let result = coordinator.on_sync(SyncSource::DeferredRetry).await;
                        retry.after(&result);
                    }
                    Some(TriggerCommand::Shutdown) | None => {
                        info!("Sync trigger shutting down");
                        break;
                    }
                },

                _ = self.registered.notified() => {
                    let result = coordinator.on_sync(SyncSource::OnDemand).await;
                    retry.after(&result);
                }

                _ = wait_for_periodic(&mut periodic) => {
                    let result = coordinator.on_periodic_sync().await.map(|r| r.drain);
                    retry.after(&result);
                }

                _ = wait_until(retry.deadline) => {
                    retry.deadline = None;
                    let result = coordinator.on_sync(SyncSource::DeferredRetry).await;
                    retry.after(&result);
                }
            }
        }
    }
}

/// Deferred retry timer state.
struct DeferredRetry {
    policy: RetryPolicy,
    deadline: Option<Instant>,
    scheduled: u32,
}

impl DeferredRetry {
    fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            deadline: None,
            scheduled: 0,
        }
    }

    /// Arm or disarm the timer from the outcome of a pass.
    fn after(&mut self, result: &Result<DrainReport>) {
        let needs_retry = match result {
            Ok(report) => report.needs_retry(),
            Err(_) => true,
        };

        if !needs_retry {
            self.deadline = None;
            self.scheduled = 0;
            return;
        }

        if self.scheduled >= self.policy.max_attempts {
            warn!("Deferred retries exhausted after {} signals", self.scheduled);
            self.deadline = None;
            return;
        }

        let delay = self.policy.delay_for_attempt(self.scheduled);
        self.scheduled += 1;
        self.deadline = Some(Instant::now() + delay);
        debug!("Deferred retry {} in {:?}", self.scheduled, delay);
    }
}

async fn wait_for_periodic(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deliver::Deliverer;
    use crate::queue::DeliveryQueue;
    use crate::testing::{runtime, FlakyStore, ScriptedDeliverer};
    use offgrid_storage::{MemoryStore, ResourceStore};
    use serde_json::json;
    use tokio::sync::broadcast;
    use tokio::time::timeout;

    struct Fixture {
        queue: Arc<DeliveryQueue>,
        records: Arc<BackgroundLog>,
        coordinator: Arc<SyncCoordinator>,
    }

    fn fixture_with(store: Arc<dyn ResourceStore>, deliverer: Arc<dyn Deliverer>) -> Fixture {
        let queue = Arc::new(DeliveryQueue::new(store.clone(), &runtime()));
        let records = Arc::new(BackgroundLog::new(store, &runtime()));
        let processor = Arc::new(QueueProcessor::new(
            queue.clone(),
            deliverer,
            RetryPolicy::default(),
        ));
        let coordinator = Arc::new(SyncCoordinator::new(
            processor,
            records.clone(),
            Observers::default(),
        ));
        Fixture {
            queue,
            records,
            coordinator,
        }
    }

    fn fixture(deliverer: Arc<dyn Deliverer>) -> Fixture {
        fixture_with(Arc::new(MemoryStore::new()), deliverer)
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(3)
            .with_initial_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(50))
            .with_jitter(false)
    }

    async fn next_event(rx: &mut broadcast::Receiver<SyncEvent>) -> SyncEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .unwrap()
    }

    #[tokio::test]
    async fn test_on_sync_notifies_observers() {
        let f = fixture(Arc::new(ScriptedDeliverer::always_succeeding()));
        let mut rx = f.coordinator.observers().subscribe();
        f.queue.append(json!({"type": "crash"})).await.unwrap();

        let report = f.coordinator.on_sync(SyncSource::OnDemand).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert!(matches!(next_event(&mut rx).await, SyncEvent::SyncComplete { .. }));
    }

    #[tokio::test]
    async fn test_failed_drain_notifies_nobody() {
        let store = Arc::new(FlakyStore::new());
        let f = fixture_with(store.clone(), Arc::new(ScriptedDeliverer::always_succeeding()));
        let mut rx = f.coordinator.observers().subscribe();
        f.queue.append(json!({})).await.unwrap();

        store.fail_writes(true);
        assert!(f.coordinator.on_sync(SyncSource::OnDemand).await.is_err());
        assert!(f.coordinator.on_periodic_sync().await.is_err());
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_periodic_reports_record_count() {
        let f = fixture(Arc::new(ScriptedDeliverer::always_succeeding()));
        let mut rx = f.coordinator.observers().subscribe();
        for n in 0..4 {
            f.records.append(json!({"type": "ride", "n": n})).await.unwrap();
        }
        f.queue.append(json!({"type": "crash"})).await.unwrap();

        let report = f.coordinator.on_periodic_sync().await.unwrap();
        assert_eq!(report.processed_items, 4);
        assert_eq!(report.drain.delivered, 1);
        assert_eq!(f.records.len().await, 4);

        match next_event(&mut rx).await {
            SyncEvent::PeriodicSyncComplete { processed_items, .. } => assert_eq!(processed_items, 4),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_register_runs_a_drain() {
        let f = fixture(Arc::new(ScriptedDeliverer::always_succeeding()));
        let mut rx = f.coordinator.observers().subscribe();
        let (trigger, handle) = SyncTrigger::new(TriggerConfig::default());
        let task = tokio::spawn(handle.run(f.coordinator.clone()));

        f.queue.append(json!({"type": "crash"})).await.unwrap();
        trigger.register();

        assert!(matches!(next_event(&mut rx).await, SyncEvent::SyncComplete { .. }));
        assert!(f.queue.is_empty().await);

        trigger.shutdown().await;
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_registrations_coalesce() {
        let deliverer = Arc::new(ScriptedDeliverer::always_succeeding());
        let f = fixture(deliverer.clone());
        let (trigger, handle) = SyncTrigger::new(TriggerConfig::default());

        f.queue.append(json!({})).await.unwrap();
        for _ in 0..5 {
            trigger.register();
        }

        let mut rx = f.coordinator.observers().subscribe();
        let task = tokio::spawn(handle.run(f.coordinator.clone()));
        next_event(&mut rx).await;

        // The queued run_now is served after the single coalesced pass.
        let report = trigger.run_now().await.unwrap();
        assert_eq!(report.delivered, 0);
        assert_eq!(deliverer.calls(), 1);

        trigger.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_now_returns_report() {
        let f = fixture(Arc::new(ScriptedDeliverer::always_succeeding()));
        let (trigger, handle) = SyncTrigger::new(TriggerConfig::default());
        let task = tokio::spawn(handle.run(f.coordinator.clone()));

        f.queue.append(json!({})).await.unwrap();
        f.queue.append(json!({})).await.unwrap();
        let report = trigger.run_now().await.unwrap();
        assert_eq!(report.delivered, 2);

        trigger.shutdown().await;
        task.await.unwrap();
        assert!(matches!(trigger.run_now().await, Err(Error::Closed(_))));
    }

    #[tokio::test]
    async fn test_periodic_signal_fires() {
        let f = fixture(Arc::new(ScriptedDeliverer::always_succeeding()));
        let mut rx = f.coordinator.observers().subscribe();
        let config = TriggerConfig {
            periodic_interval: Some(Duration::from_millis(20)),
            retry: RetryPolicy::default(),
        };
        let (trigger, handle) = SyncTrigger::new(config);
        let task = tokio::spawn(handle.run(f.coordinator.clone()));

        assert!(matches!(
            next_event(&mut rx).await,
            SyncEvent::PeriodicSyncComplete { processed_items: 0, .. }
        ));

        trigger.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_deferred_retry_until_delivered() {
        // Fails twice, then succeeds: one register plus two deferred retries.
        let deliverer = Arc::new(ScriptedDeliverer::failing_first(2));
        let f = fixture(deliverer.clone());
        let mut rx = f.coordinator.observers().subscribe();
        let config = TriggerConfig {
            periodic_interval: None,
            retry: fast_retry(),
        };
        let (trigger, handle) = SyncTrigger::new(config);
        let task = tokio::spawn(handle.run(f.coordinator.clone()));

        f.queue.append(json!({"type": "crash"})).await.unwrap();
        trigger.register();

        for _ in 0..3 {
            next_event(&mut rx).await;
        }
        assert!(f.queue.is_empty().await);
        assert_eq!(deliverer.calls(), 3);

        trigger.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_connectivity_restored_drains() {
        let f = fixture(Arc::new(ScriptedDeliverer::always_succeeding()));
        let mut rx = f.coordinator.observers().subscribe();
        let (trigger, handle) = SyncTrigger::new(TriggerConfig::default());
        let task = tokio::spawn(handle.run(f.coordinator.clone()));

        f.queue.append(json!({})).await.unwrap();
        trigger.connectivity_restored().await.unwrap();

        next_event(&mut rx).await;
        assert!(f.queue.is_empty().await);

        trigger.shutdown().await;
        task.await.unwrap();
    }

    #[test]
    fn test_deferred_retry_is_bounded() {
        let mut retry = DeferredRetry::new(fast_retry());
        let failing = Ok(DrainReport {
            failed: 1,
            retryable: 1,
            remaining: 1,
            ..Default::default()
        });

        for _ in 0..3 {
            retry.after(&failing);
            assert!(retry.deadline.is_some());
        }
        retry.after(&failing);
        assert!(retry.deadline.is_none());

        retry.after(&Ok(DrainReport::default()));
        assert_eq!(retry.scheduled, 0);
        retry.after(&Err(Error::Storage("down".to_string())));
        assert!(retry.deadline.is_some());
    }
}
