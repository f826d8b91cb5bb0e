//! Worker configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

use offgrid_cache::RoutePolicy;
use offgrid_common::{Error, Result};
use offgrid_storage::CacheGeneration;
use offgrid_sync::{RetryPolicy, TriggerConfig};

/// Settings for one worker instance.
///
/// Every field has a default, so a config file only needs the values it
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Prefix shared by every cache generation name.
    pub cache_prefix: String,
    /// Version tag of the active generations; bumping it retires old ones.
    pub version: String,
    /// The application's own origin.
    pub origin: String,
    /// External hosts whose resources are cached.
    pub allowed_hosts: Vec<String>,
    /// Path fragments served network-first.
    pub volatile_patterns: Vec<String>,
    /// Path fragment of the background-data ingestion endpoint.
    pub background_path: String,
    /// Path fragment of the emergency-alert ingestion endpoint.
    pub alert_path: String,
    /// Per-alert delivery attempt ceiling.
    pub max_attempts: u32,
    /// Maximum number of live background records.
    pub record_cap: usize,
    /// Period of the recurring sync signal; `None` disables it.
    pub periodic_interval_secs: Option<u64>,
    /// First deferred retry delay.
    pub retry_initial_delay_secs: u64,
    /// Cap on the deferred retry delay.
    pub retry_max_delay_secs: u64,
    /// Network timeout per fetch.
    pub fetch_timeout_secs: u64,
    /// Latency of the simulated delivery transport.
    pub delivery_latency_ms: u64,
    /// Failure probability of the simulated delivery transport.
    pub delivery_failure_rate: f64,
    /// Resources stored at install time; relative entries resolve
    /// against `origin`.
    pub precache: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_prefix: "mfb".to_string(),
            version: "v3".to_string(),
            origin: "http://localhost:8080".to_string(),
            allowed_hosts: vec!["unpkg.com".to_string(), "cdn.jsdelivr.net".to_string()],
            volatile_patterns: vec!["/tile/".to_string(), "data:image".to_string()],
            background_path: "/api/background/".to_string(),
            alert_path: "/api/emergency/".to_string(),
            max_attempts: 3,
            record_cap: 200,
            periodic_interval_secs: None,
            retry_initial_delay_secs: 5,
            retry_max_delay_secs: 300,
            fetch_timeout_secs: 30,
            delivery_latency_ms: 1000,
            delivery_failure_rate: 0.1,
            precache: [
                "/",
                "/index.html",
                "/manifest.json",
                "/css/style.css",
                "/js/app.js",
                "/icons/icon-192.png",
                "/icons/icon-512.png",
                "https://unpkg.com/leaflet@1.9.4/dist/leaflet.css",
                "https://unpkg.com/leaflet@1.9.4/dist/leaflet.js",
                "https://cdn.jsdelivr.net/npm/chart.js@4.4.0/dist/chart.umd.js",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl WorkerConfig {
    /// Read a JSON config file and validate it.
    ///
    /// # Errors
    /// - The file cannot be read
    /// - The file is not valid JSON for this structure
    /// - Validation fails
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<()> {
        self.origin_url()?;
        self.static_generation()?;
        if self.max_attempts == 0 {
            return Err(Error::InvalidInput("max_attempts must be at least 1".to_string()));
        }
        if self.record_cap == 0 {
            return Err(Error::InvalidInput("record_cap must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.delivery_failure_rate) {
            return Err(Error::InvalidInput(format!(
                "delivery_failure_rate must be within 0..=1: {}",
                self.delivery_failure_rate
            )));
        }
        for path in [&self.background_path, &self.alert_path] {
            if path.len() < 2 || !path.starts_with('/') || !path.ends_with('/') {
                return Err(Error::InvalidInput(format!(
                    "Ingestion path must look like /segment/: {:?}",
                    path
                )));
            }
        }
        self.precache_urls()?;
        Ok(())
    }

    pub fn origin_url(&self) -> Result<Url> {
        Url::parse(&self.origin)
            .map_err(|e| Error::InvalidInput(format!("Invalid origin {}: {}", self.origin, e)))
    }

    /// Generation holding precached and cache-first resources.
    pub fn static_generation(&self) -> Result<CacheGeneration> {
        CacheGeneration::new(&self.cache_prefix, "static", &self.version)
    }

    /// Generation holding network-first resources, the queue and the log.
    pub fn runtime_generation(&self) -> Result<CacheGeneration> {
        CacheGeneration::new(&self.cache_prefix, "runtime", &self.version)
    }

    pub fn route_policy(&self) -> Result<RoutePolicy> {
        Ok(RoutePolicy::new(&self.origin_url()?)
            .with_allowed_hosts(self.allowed_hosts.iter().cloned())
            .with_volatile_patterns(self.volatile_patterns.iter().cloned())
            .with_ingest_paths(&self.background_path, &self.alert_path))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts)
            .with_initial_delay(Duration::from_secs(self.retry_initial_delay_secs))
            .with_max_delay(Duration::from_secs(self.retry_max_delay_secs))
    }

    pub fn trigger_config(&self) -> TriggerConfig {
        TriggerConfig {
            periodic_interval: self.periodic_interval_secs.map(Duration::from_secs),
            retry: self.retry_policy(),
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn delivery_latency(&self) -> Duration {
        Duration::from_millis(self.delivery_latency_ms)
    }

    /// Precache manifest as absolute URLs.
    pub fn precache_urls(&self) -> Result<Vec<Url>> {
        let origin = self.origin_url()?;
        self.precache
            .iter()
            .map(|entry| {
                origin
                    .join(entry)
                    .map_err(|e| Error::InvalidInput(format!("Invalid precache entry {}: {}", entry, e)))
            })
            .collect()
    }
}
