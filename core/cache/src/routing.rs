//! Request classification.

use http::Method;
use url::{Origin, Url};

use crate::request::Request;

/// How an intercepted request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// POST to the background-data ingestion path.
    BackgroundIngest,
    /// POST to the emergency-alert ingestion path.
    AlertIngest,
    /// Not intercepted; the host performs the request untouched.
    Passthrough,
    /// Served from the static generation, refreshed in the background.
    CacheFirst,
    /// Fetched from the network, runtime generation as fallback.
    NetworkFirst,
}

/// Routing predicate over method, origin and path.
#[derive(Debug, Clone)]
pub struct RoutePolicy {
    origin: Origin,
    allowed_hosts: Vec<String>,
    volatile_patterns: Vec<String>,
    background_path: String,
    alert_path: String,
}

impl RoutePolicy {
    /// Create a policy for the application's own origin.
    ///
    /// No external hosts are allowed and no path is volatile until
    /// configured.
    pub fn new(origin: &Url) -> Self {
        Self {
            origin: origin.origin(),
            allowed_hosts: Vec::new(),
            volatile_patterns: Vec::new(),
            background_path: "/api/background/".to_string(),
            alert_path: "/api/emergency/".to_string(),
        }
    }

    /// External hosts whose resources are cached (exact or sub-domain match).
    pub fn with_allowed_hosts(mut self, hosts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.allowed_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Path fragments that mark live content (map tiles, generated images).
    pub fn with_volatile_patterns(
        mut self,
        patterns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.volatile_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Path fragments of the two ingestion endpoints.
    pub fn with_ingest_paths(
        mut self,
        background: impl Into<String>,
        alert: impl Into<String>,
    ) -> Self {
        self.background_path = background.into();
        self.alert_path = alert.into();
        self
    }

    /// Classify a request.
    pub fn classify(&self, request: &Request) -> Route {
        let url = request.url();
        let path = url.path();

        if *request.method() == Method::POST {
            if path.contains(&self.background_path) {
                return Route::BackgroundIngest;
            }
            if path.contains(&self.alert_path) {
                return Route::AlertIngest;
            }
        }

        if !request.is_read() || !self.is_cacheable_origin(url) {
            return Route::Passthrough;
        }

        if self.volatile_patterns.iter().any(|p| path.contains(p.as_str())) {
            Route::NetworkFirst
        } else {
            Route::CacheFirst
        }
    }

    fn is_cacheable_origin(&self, url: &Url) -> bool {
        if url.origin() == self.origin {
            return true;
        }
        let Some(host) = url.host_str() else {
            return false;
        };
        self.allowed_hosts.iter().any(|allowed| {
            host == allowed.as_str()
                || host
                    .strip_suffix(allowed.as_str())
                    .is_some_and(|rest| rest.ends_with('.'))
        })
    }
}
