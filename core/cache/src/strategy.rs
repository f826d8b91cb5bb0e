//! Cache-first and network-first resolution.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use offgrid_storage::{CacheGeneration, CachedResponse, ResourceStore, StoreKey};

use crate::fetcher::Fetcher;
use crate::request::Request;

/// Outcome of resolving a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Served from the store.
    Cached(CachedResponse),
    /// Served from the network (possibly a non-2xx response).
    Network(CachedResponse),
    /// Network failed and nothing usable was stored.
    Unavailable,
}

impl Resolution {
    /// The response, if any.
    pub fn response(&self) -> Option<&CachedResponse> {
        match self {
            Resolution::Cached(r) | Resolution::Network(r) => Some(r),
            Resolution::Unavailable => None,
        }
    }

    /// Consume into the response, if any.
    pub fn into_response(self) -> Option<CachedResponse> {
        match self {
            Resolution::Cached(r) | Resolution::Network(r) => Some(r),
            Resolution::Unavailable => None,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Resolution::Unavailable)
    }
}

/// Resolution policies over a resource store and a network fetcher.
///
/// Only 2xx network responses are written to the store. Store failures
/// are logged and never change the response returned to the caller.
pub struct CacheStrategy {
    store: Arc<dyn ResourceStore>,
    fetcher: Arc<dyn Fetcher>,
    refreshes: Mutex<JoinSet<()>>,
}

impl CacheStrategy {
    /// Create a new strategy engine.
    pub fn new(store: Arc<dyn ResourceStore>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            store,
            fetcher,
            refreshes: Mutex::new(JoinSet::new()),
        }
    }

    /// Serve from the store when present, refreshing it in the background.
    ///
    /// # Postconditions
    /// - On a hit the stored value is returned unchanged; the refresh only
    ///   affects later lookups
    /// - On a miss the network result is returned (and stored if 2xx)
    pub async fn cache_first(&self, request: &Request, generation: &CacheGeneration) -> Resolution {
        let key = generation.key(request.key().as_str());

        if let Some(cached) = self.lookup(&key).await {
            debug!("Cache hit for {}", key);
            self.spawn_refresh(request.clone(), key);
            return Resolution::Cached(cached);
        }

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.is_ok() {
                    store_response(self.store.as_ref(), &key, &response).await;
                }
                Resolution::Network(response)
            }
            Err(e) => {
                debug!("Cache miss and network failed for {}: {}", key, e);
                Resolution::Unavailable
            }
        }
    }

    /// Fetch from the network, falling back to the store on transport failure.
    ///
    /// # Postconditions
    /// - A 2xx network response is returned and stored under the key
    /// - A non-2xx network response is returned without falling back
    pub async fn network_first(&self, request: &Request, generation: &CacheGeneration) -> Resolution {
        let key = generation.key(request.key().as_str());

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.is_ok() {
                    store_response(self.store.as_ref(), &key, &response).await;
                }
                Resolution::Network(response)
            }
            Err(e) => {
                debug!("Network failed for {}, falling back to cache: {}", key, e);
                match self.lookup(&key).await {
                    Some(cached) => Resolution::Cached(cached),
                    None => Resolution::Unavailable,
                }
            }
        }
    }

    /// Wait for every in-flight background refresh to finish.
    pub async fn settle(&self) {
        let mut refreshes = std::mem::take(
            &mut *self.refreshes.lock().unwrap_or_else(PoisonError::into_inner),
        );
        while refreshes.join_next().await.is_some() {}
    }

    /// Number of background refreshes not yet reaped.
    pub fn pending_refreshes(&self) -> usize {
        self.refreshes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn lookup(&self, key: &StoreKey) -> Option<CachedResponse> {
        match self.store.get(key).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Cache read failed for {}: {}", key, e);
                None
            }
        }
    }

    fn spawn_refresh(&self, request: Request, key: StoreKey) {
        let store = self.store.clone();
        let fetcher = self.fetcher.clone();

        let mut refreshes = self.refreshes.lock().unwrap_or_else(PoisonError::into_inner);
        while refreshes.try_join_next().is_some() {}
        refreshes.spawn(async move {
            match fetcher.fetch(&request).await {
                Ok(response) if response.is_ok() => {
                    store_response(store.as_ref(), &key, &response).await;
                }
                Ok(response) => debug!("Refresh of {} returned {}", key, response.status),
                Err(e) => debug!("Refresh of {} failed: {}", key, e),
            }
        });
    }
}

async fn store_response(store: &dyn ResourceStore, key: &StoreKey, response: &CachedResponse) {
    if let Err(e) = store.put(key, response.clone()).await {
        warn!("Failed to cache {}: {}", key, e);
    }
}
