//! Network fetch capability.

use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

use offgrid_common::{Error, Result};
use offgrid_storage::CachedResponse;

use crate::request::Request;

/// Network fetch capability used by the cache strategies.
///
/// A non-2xx response is still a successful fetch; only transport
/// failures (no connectivity, timeout) return `Error::Network`.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform the request against the network.
    async fn fetch(&self, request: &Request) -> Result<CachedResponse>;
}

/// Fetcher backed by a reqwest client.
pub struct HttpFetcher {
    http: Client,
}

impl HttpFetcher {
    /// Create a new fetcher with a per-request timeout.
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<CachedResponse> {
        let mut builder = self
            .http
            .request(request.method().clone(), request.url().clone());
        for (name, value) in request.headers() {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body().is_empty() {
            builder = builder.body(request.body().to_vec());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Network(format!("{}: {}", request.url(), e)))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Network(format!("{}: {}", request.url(), e)))?;

        debug!("Fetched {} -> {} ({} bytes)", request.url(), status, body.len());
        Ok(CachedResponse::new(status, headers, body.to_vec()))
    }
}

/// In-memory fetcher with scripted responses.
///
/// Useful for testing and offline demos. Unknown URLs answer 404; while
/// offline every fetch fails with `Error::Network`.
pub struct ScriptedFetcher {
    responses: RwLock<HashMap<String, CachedResponse>>,
    online: AtomicBool,
    latency: Duration,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    /// Create an online fetcher with no scripted responses.
    pub fn new() -> Self {
        Self {
            responses: RwLock::new(HashMap::new()),
            online: AtomicBool::new(true),
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Delay every fetch by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Script the response for a URL.
    pub fn respond(&self, url: &str, status: u16, body: impl Into<Vec<u8>>) {
        let response = CachedResponse::new(status, Vec::new(), body.into());
        if let Ok(mut responses) = self.responses.write() {
            responses.insert(url.to_string(), response);
        }
    }

    /// Toggle connectivity.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Number of fetches attempted so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &Request) -> Result<CachedResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if !self.online.load(Ordering::SeqCst) {
            return Err(Error::Network(format!("offline: {}", request.url())));
        }

        let responses = self
            .responses
            .read()
            .map_err(|_| Error::Network("Scripted fetcher lock poisoned".to_string()))?;
        let response = match responses.get(request.url().as_str()) {
            Some(scripted) => CachedResponse::new(
                scripted.status,
                scripted.headers.clone(),
                scripted.body.clone(),
            ),
            None => CachedResponse::new(404, Vec::new(), Vec::new()),
        };
        Ok(response)
    }
}
