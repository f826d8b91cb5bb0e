//! The offline worker: routing, ingestion and lifecycle.

use futures::future::try_join_all;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use offgrid_cache::{CacheStrategy, Fetcher, Request, Resolution, Route, RoutePolicy};
use offgrid_common::{Error, Result};
use offgrid_storage::{sweep_generations, CacheGeneration, CachedResponse, ResourceStore};
use offgrid_sync::{
    BackgroundLog, BackgroundRecord, Deliverer, DeliveryQueue, Observers, QueueProcessor,
    SyncCoordinator, SyncEvent, SyncTrigger, SyncTriggerHandle,
};

use crate::config::WorkerConfig;
use crate::messages::{ControlMessage, ControlReply};

/// What the worker did with an intercepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Not intercepted; the caller performs the request itself.
    Passthrough,
    /// Answered by the worker.
    Response(CachedResponse),
    /// Intercepted, but neither network nor store could answer.
    Unavailable,
}

impl From<Resolution> for FetchOutcome {
    fn from(resolution: Resolution) -> Self {
        match resolution.into_response() {
            Some(response) => FetchOutcome::Response(response),
            None => FetchOutcome::Unavailable,
        }
    }
}

/// One worker instance with every component it owns.
///
/// Components share state only through the handles passed in here; there
/// is no process-wide state.
pub struct OfflineWorker {
    config: WorkerConfig,
    store: Arc<dyn ResourceStore>,
    fetcher: Arc<dyn Fetcher>,
    routes: RoutePolicy,
    strategy: CacheStrategy,
    static_generation: CacheGeneration,
    runtime_generation: CacheGeneration,
    queue: Arc<DeliveryQueue>,
    records: Arc<BackgroundLog>,
    coordinator: Arc<SyncCoordinator>,
    trigger: SyncTrigger,
}

impl OfflineWorker {
    /// Wire up a worker.
    ///
    /// # Returns
    /// The worker and the scheduler loop; the caller spawns
    /// `handle.run(worker.coordinator())`.
    ///
    /// # Errors
    /// - The configuration is invalid
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn ResourceStore>,
        fetcher: Arc<dyn Fetcher>,
        deliverer: Arc<dyn Deliverer>,
    ) -> Result<(Self, SyncTriggerHandle)> {
        config.validate()?;

        let static_generation = config.static_generation()?;
        let runtime_generation = config.runtime_generation()?;
        let routes = config.route_policy()?;

        let queue = Arc::new(DeliveryQueue::new(store.clone(), &runtime_generation));
        let records = Arc::new(BackgroundLog::with_cap(
            store.clone(),
            &runtime_generation,
            config.record_cap,
        ));
        let processor = Arc::new(QueueProcessor::new(
            queue.clone(),
            deliverer,
            config.retry_policy(),
        ));
        let coordinator = Arc::new(SyncCoordinator::new(
            processor,
            records.clone(),
            Observers::default(),
        ));
        let (trigger, handle) = SyncTrigger::new(config.trigger_config());

        let worker = Self {
            strategy: CacheStrategy::new(store.clone(), fetcher.clone()),
            config,
            store,
            fetcher,
            routes,
            static_generation,
            runtime_generation,
            queue,
            records,
            coordinator,
            trigger,
        };
        Ok((worker, handle))
    }

    /// Precache the configured manifest into the static generation.
    ///
    /// All-or-nothing: every entry is fetched first, and nothing is
    /// written unless all of them answered 2xx.
    ///
    /// # Returns
    /// Number of entries stored.
    ///
    /// # Errors
    /// - Any manifest entry failed to fetch or answered non-2xx
    /// - The store rejected a write
    pub async fn install(&self) -> Result<usize> {
        let requests = self
            .config
            .precache_urls()?
            .into_iter()
            .map(|url| Request::new(http::Method::GET, url))
            .collect::<Result<Vec<_>>>()?;

        let responses = try_join_all(requests.iter().map(|request| self.precache_one(request)))
            .await
            .inspect_err(|e| error!("Install failed: {}", e))?;

        for (request, response) in requests.iter().zip(responses) {
            let key = self.static_generation.key(request.key().as_str());
            self.store.put(&key, response).await?;
        }

        info!(
            "Installed {} resources into {}",
            requests.len(),
            self.static_generation
        );
        Ok(requests.len())
    }

    async fn precache_one(&self, request: &Request) -> Result<CachedResponse> {
        let response = self.fetcher.fetch(request).await?;
        if !response.is_ok() {
            return Err(Error::Network(format!(
                "Precache of {} answered {}",
                request.url(),
                response.status
            )));
        }
        Ok(response)
    }

    /// Retire stale generations and request a first sync.
    ///
    /// # Returns
    /// Number of store entries removed by the sweep.
    pub async fn activate(&self) -> Result<usize> {
        let active = [self.static_generation.clone(), self.runtime_generation.clone()];
        let removed = sweep_generations(self.store.as_ref(), &active).await?;
        self.trigger.register();
        info!("Worker activated ({} stale entries removed)", removed);
        Ok(removed)
    }

    /// Handle an intercepted request.
    pub async fn handle_fetch(&self, request: &Request) -> FetchOutcome {
        let route = self.routes.classify(request);
        debug!("{} {} -> {:?}", request.method(), request.url(), route);

        match route {
            Route::BackgroundIngest => {
                FetchOutcome::Response(self.ingest_background(request.body()).await)
            }
            Route::AlertIngest => FetchOutcome::Response(self.ingest_alert(request.body()).await),
            Route::Passthrough => FetchOutcome::Passthrough,
            Route::CacheFirst => self
                .strategy
                .cache_first(request, &self.static_generation)
                .await
                .into(),
            Route::NetworkFirst => self
                .strategy
                .network_first(request, &self.runtime_generation)
                .await
                .into(),
        }
    }

    /// Background-data ingestion endpoint.
    ///
    /// Answers 200 `{"success":true}`, or 500 `{"error":..}` when the body
    /// is not JSON or the record could not be stored.
    pub async fn ingest_background(&self, body: &[u8]) -> CachedResponse {
        let stored = match serde_json::from_slice::<Value>(body) {
            Ok(payload) => self.store_background_data(payload).await,
            Err(e) => Err(e.into()),
        };
        match stored {
            Ok(_) => json_response(200, json!({"success": true})),
            Err(e) => json_response(500, json!({"error": e.to_string()})),
        }
    }

    /// Emergency-alert ingestion endpoint.
    ///
    /// Answers 200 `{"success":true,"queued":true}`, or 500 `{"error":..}`.
    pub async fn ingest_alert(&self, body: &[u8]) -> CachedResponse {
        let queued = match serde_json::from_slice::<Value>(body) {
            Ok(payload) => self.queue_emergency_alert(payload).await,
            Err(e) => Err(e.into()),
        };
        match queued {
            Ok(_) => json_response(200, json!({"success": true, "queued": true})),
            Err(e) => json_response(500, json!({"error": e.to_string()})),
        }
    }

    pub async fn store_background_data(&self, payload: Value) -> Result<String> {
        self.records.append(payload).await
    }

    /// Queue an alert and request an on-demand sync.
    pub async fn queue_emergency_alert(&self, payload: Value) -> Result<String> {
        let id = self.queue.append(payload).await?;
        self.trigger.register();
        Ok(id)
    }

    pub async fn background_data(&self) -> Vec<BackgroundRecord> {
        self.records.list().await
    }

    pub async fn clear_background_data(&self) -> Result<()> {
        self.records.clear().await
    }

    /// Answer a control message. Every message gets exactly one reply.
    pub async fn handle_message(&self, message: ControlMessage) -> ControlReply {
        match message {
            ControlMessage::StoreBackgroundData { payload } => {
                match self.store_background_data(payload).await {
                    Ok(_) => ControlReply::ok(),
                    Err(e) => ControlReply::failed(e),
                }
            }
            ControlMessage::QueueEmergencyAlert { payload } => {
                match self.queue_emergency_alert(payload).await {
                    Ok(_) => ControlReply::ok(),
                    Err(e) => ControlReply::failed(e),
                }
            }
            ControlMessage::GetBackgroundData => {
                match serde_json::to_value(self.background_data().await) {
                    Ok(data) => ControlReply::with_data(data),
                    Err(e) => ControlReply::failed(e),
                }
            }
            ControlMessage::ClearBackgroundData => match self.clear_background_data().await {
                Ok(()) => ControlReply::ok(),
                Err(e) => ControlReply::failed(e),
            },
            ControlMessage::TriggerBackgroundSync => {
                self.trigger.register();
                info!("Manual background sync triggered");
                ControlReply::ok()
            }
        }
    }

    /// Connect an observer for sync completion events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.coordinator.observers().subscribe()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
        &self.fetcher
    }

    pub fn strategy(&self) -> &CacheStrategy {
        &self.strategy
    }

    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.queue
    }

    pub fn records(&self) -> &Arc<BackgroundLog> {
        &self.records
    }

    pub fn coordinator(&self) -> Arc<SyncCoordinator> {
        self.coordinator.clone()
    }

    pub fn trigger(&self) -> &SyncTrigger {
        &self.trigger
    }

    pub fn static_generation(&self) -> &CacheGeneration {
        &self.static_generation
    }

    pub fn runtime_generation(&self) -> &CacheGeneration {
        &self.runtime_generation
    }
}

fn json_response(status: u16, body: Value) -> CachedResponse {
    CachedResponse::json(status, &body).unwrap_or_else(|e| {
        error!("Failed to encode response body: {}", e);
        CachedResponse::new(status, Vec::new(), Vec::new())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use offgrid_cache::ScriptedFetcher;
    use offgrid_storage::{MemoryStore, StoreKey};
    use offgrid_sync::SimulatedDeliverer;
    use std::time::Duration;
    use tokio::time::timeout;

    const ORIGIN: &str = "https://app.test";

    struct Fixture {
        store: Arc<MemoryStore>,
        fetcher: Arc<ScriptedFetcher>,
        worker: Arc<OfflineWorker>,
        handle: Option<SyncTriggerHandle>,
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            origin: ORIGIN.to_string(),
            precache: vec!["/".to_string(), "/js/app.js".to_string()],
            ..Default::default()
        }
    }

    fn fixture_with(config: WorkerConfig, failure_rate: f64) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(ScriptedFetcher::new());
        let deliverer = Arc::new(SimulatedDeliverer::new(Duration::ZERO, failure_rate));
        let (worker, handle) =
            OfflineWorker::new(config, store.clone(), fetcher.clone(), deliverer).unwrap();
        Fixture {
            store,
            fetcher,
            worker: Arc::new(worker),
            handle: Some(handle),
        }
    }

    fn fixture() -> Fixture {
        fixture_with(config(), 0.0)
    }

    impl Fixture {
        fn spawn_trigger(&mut self) -> tokio::task::JoinHandle<()> {
            let handle = self.handle.take().unwrap();
            tokio::spawn(handle.run(self.worker.coordinator()))
        }

        fn script_manifest(&self) {
            self.fetcher.respond("https://app.test/", 200, "<html>");
            self.fetcher.respond("https://app.test/js/app.js", 200, "app()");
        }
    }

    fn body_json(outcome: FetchOutcome) -> (u16, Value) {
        match outcome {
            FetchOutcome::Response(response) => (response.status, response.json_body().unwrap()),
            other => panic!("expected a response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_install_stores_manifest() {
        let f = fixture();
        f.script_manifest();

        assert_eq!(f.worker.install().await.unwrap(), 2);

        let key = f.worker.static_generation().key("GET https://app.test/js/app.js");
        let stored = f.store.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.body, b"app()");
    }

    #[tokio::test]
    async fn test_install_is_all_or_nothing() {
        let f = fixture();
        f.fetcher.respond("https://app.test/", 200, "<html>");
        // app.js is not scripted and answers 404

        assert!(f.worker.install().await.is_err());
        assert!(f.store.is_empty());

        f.script_manifest();
        f.fetcher.set_online(false);
        assert!(matches!(f.worker.install().await, Err(Error::Network(_))));
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_activate_sweeps_and_registers() {
        let mut f = fixture();
        let response = CachedResponse::new(200, vec![], b"old".to_vec());
        f.store
            .put(&StoreKey::new("mfb-static-v2", "GET https://app.test/"), response.clone())
            .await
            .unwrap();
        f.store
            .put(&StoreKey::new("other-app", "GET https://app.test/"), response)
            .await
            .unwrap();
        f.worker.queue().append(json!({"type": "crash"})).await.unwrap();

        let mut events = f.worker.subscribe();
        let task = f.spawn_trigger();

        assert_eq!(f.worker.activate().await.unwrap(), 1);
        assert_eq!(f.store.len(), 2);

        let event = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        assert!(matches!(event, SyncEvent::SyncComplete { .. }));
        assert!(f.worker.queue().is_empty().await);

        f.worker.trigger().shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_routes_static_and_volatile() {
        let f = fixture();
        f.script_manifest();
        f.worker.install().await.unwrap();
        f.fetcher.respond("https://app.test/tile/1/2/3.png", 200, "tile");
        f.fetcher.set_online(false);

        // Precached resource still served offline.
        let outcome = f.worker.handle_fetch(&Request::get("https://app.test/js/app.js").unwrap()).await;
        assert!(matches!(outcome, FetchOutcome::Response(r) if r.body == b"app()"));

        // Tile never fetched before: nothing to fall back to.
        let tile = Request::get("https://app.test/tile/1/2/3.png").unwrap();
        assert_eq!(f.worker.handle_fetch(&tile).await, FetchOutcome::Unavailable);

        f.fetcher.set_online(true);
        let outcome = f.worker.handle_fetch(&tile).await;
        assert!(matches!(outcome, FetchOutcome::Response(r) if r.body == b"tile"));

        let key = f.worker.runtime_generation().key(tile.key().as_str());
        assert!(f.store.get(&key).await.unwrap().is_some());

        f.fetcher.set_online(false);
        let outcome = f.worker.handle_fetch(&tile).await;
        assert!(matches!(outcome, FetchOutcome::Response(r) if r.body == b"tile"));
        f.worker.strategy().settle().await;
    }

    #[tokio::test]
    async fn test_passthrough() {
        let f = fixture();
        let foreign = Request::get("https://tracker.example/pixel").unwrap();
        assert_eq!(f.worker.handle_fetch(&foreign).await, FetchOutcome::Passthrough);

        let put = Request::new(http::Method::PUT, url::Url::parse("https://app.test/x").unwrap()).unwrap();
        assert_eq!(f.worker.handle_fetch(&put).await, FetchOutcome::Passthrough);
        assert_eq!(f.fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_background_ingestion() {
        let f = fixture();
        let request =
            Request::post_json("https://app.test/api/background/ride", &json!({"type": "ride"})).unwrap();

        let (status, body) = body_json(f.worker.handle_fetch(&request).await);
        assert_eq!(status, 200);
        assert_eq!(body, json!({"success": true}));

        let records = f.worker.background_data().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind.as_deref(), Some("ride"));
    }

    #[tokio::test]
    async fn test_alert_ingestion() {
        let f = fixture();
        let request =
            Request::post_json("https://app.test/api/emergency/", &json!({"type": "crash"})).unwrap();

        let (status, body) = body_json(f.worker.handle_fetch(&request).await);
        assert_eq!(status, 200);
        assert_eq!(body, json!({"success": true, "queued": true}));
        assert_eq!(f.worker.queue().len().await, 1);
    }

    #[tokio::test]
    async fn test_malformed_ingestion_body() {
        let f = fixture();
        let request = Request::new(
            http::Method::POST,
            url::Url::parse("https://app.test/api/emergency/").unwrap(),
        )
        .unwrap()
        .with_body(b"{oops".to_vec());

        let (status, body) = body_json(f.worker.handle_fetch(&request).await);
        assert_eq!(status, 500);
        assert!(body["error"].is_string());
        assert!(f.worker.queue().is_empty().await);
    }

    #[tokio::test]
    async fn test_control_messages() {
        let f = fixture();

        let reply = f
            .worker
            .handle_message(ControlMessage::StoreBackgroundData {
                payload: json!({"type": "ride", "km": 3}),
            })
            .await;
        assert!(reply.success);

        let reply = f.worker.handle_message(ControlMessage::GetBackgroundData).await;
        let data = reply.data.unwrap();
        assert_eq!(data.as_array().unwrap().len(), 1);
        assert_eq!(data[0]["payload"]["km"], 3);

        let reply = f
            .worker
            .handle_message(ControlMessage::QueueEmergencyAlert {
                payload: json!({"type": "crash"}),
            })
            .await;
        assert!(reply.success);
        assert_eq!(f.worker.queue().len().await, 1);

        let reply = f.worker.handle_message(ControlMessage::ClearBackgroundData).await;
        assert!(reply.success);
        assert!(f.worker.background_data().await.is_empty());
        assert_eq!(f.worker.queue().len().await, 1);

        let reply = f.worker.handle_message(ControlMessage::TriggerBackgroundSync).await;
        assert_eq!(reply, ControlReply::ok());
    }

    #[tokio::test]
    async fn test_control_channel_round_trip() {
        let mut f = fixture_with(config(), 1.0);
        let task = f.spawn_trigger();
        let (client, server) = crate::messages::control_channel(8);
        let serving = tokio::spawn(server.serve(f.worker.clone()));
        let mut events = f.worker.subscribe();

        let reply = client
            .request(ControlMessage::QueueEmergencyAlert {
                payload: json!({"type": "theft"}),
            })
            .await
            .unwrap();
        assert!(reply.success);

        // Delivery always fails here: the alert stays queued with one attempt.
        timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        let items = f.worker.queue().list().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].attempts >= 1);

        drop(client);
        timeout(Duration::from_secs(2), serving).await.unwrap().unwrap();
        f.worker.trigger().shutdown().await;
        task.await.unwrap();
    }
}
