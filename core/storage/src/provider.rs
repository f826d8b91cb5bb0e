//! Resource store trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use offgrid_common::Result;

/// Address of a stored value: the cache (generation) name plus the entry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreKey {
    /// Name of the cache the entry lives in (e.g. `mfb-runtime-v3`).
    pub cache: String,
    /// Entry key within the cache.
    pub key: String,
}

impl StoreKey {
    /// Create a new store key.
    pub fn new(cache: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            cache: cache.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.cache, self.key)
    }
}

/// A stored response: status, headers and body bytes.
///
/// There is no expiry field; freshness is decided by the strategy that
/// reads the entry, never by a TTL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers in arrival order.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Response body.
    #[serde(with = "body_encoding")]
    pub body: Vec<u8>,
    /// When this value was produced.
    pub stored_at: DateTime<Utc>,
}

impl CachedResponse {
    /// Create a new response value.
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
            stored_at: Utc::now(),
        }
    }

    /// Create a JSON response with the matching content type.
    pub fn json<T: Serialize + ?Sized>(status: u16, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(Self::new(
            status,
            vec![("content-type".to_string(), "application/json".to_string())],
            body,
        ))
    }

    /// Whether the status is in the 2xx range.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Look up a header value, ignoring name case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Parse the body as JSON.
    pub fn json_body<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

mod body_encoding {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Key-value store for cached responses and serialized collections.
///
/// Implementations must make `put` atomic from the perspective of
/// concurrent readers: a reader sees either the old or the new value,
/// never a partially written one.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "local").
    fn name(&self) -> &str;

    /// Read a value.
    ///
    /// # Returns
    /// `None` if no value is stored under the key.
    async fn get(&self, key: &StoreKey) -> Result<Option<CachedResponse>>;

    /// Store a value, replacing any previous one.
    ///
    /// # Postconditions
    /// - A subsequent `get` returns exactly `value`
    async fn put(&self, key: &StoreKey, value: CachedResponse) -> Result<()>;

    /// Delete a value.
    ///
    /// # Returns
    /// Whether a value was present.
    async fn delete(&self, key: &StoreKey) -> Result<bool>;

    /// Enumerate every key across all caches.
    async fn keys(&self) -> Result<Vec<StoreKey>>;
}

/// JSON helpers over any resource store.
///
/// Collections such as the delivery queue are stored as one JSON document
/// under a single key and always rewritten whole.
#[async_trait]
pub trait StoreExt: ResourceStore {
    /// Read and deserialize a JSON value.
    async fn get_json<T>(&self, key: &StoreKey) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            Some(response) => Ok(Some(response.json_body()?)),
            None => Ok(None),
        }
    }

    /// Serialize and store a JSON value.
    async fn put_json<T>(&self, key: &StoreKey, value: &T) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let response = CachedResponse::json(200, value)?;
        self.put(key, response).await
    }
}

impl<S: ResourceStore + ?Sized> StoreExt for S {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cached_response_serialization() {
        let response = CachedResponse::new(
            200,
            vec![("Content-Type".to_string(), "text/css".to_string())],
            b"body { margin: 0 }".to_vec(),
        );

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("Ym9keSB7IG1hcmdpbjogMCB9"));

        let restored: CachedResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, response);
    }

    #[test]
    fn test_status_and_headers() {
        let ok = CachedResponse::new(204, vec![], vec![]);
        let missing = CachedResponse::new(404, vec![], vec![]);
        assert!(ok.is_ok());
        assert!(!missing.is_ok());

        let json = CachedResponse::json(200, &serde_json::json!({"success": true})).unwrap();
        assert_eq!(json.header("Content-Type"), Some("application/json"));
        let value: serde_json::Value = json.json_body().unwrap();
        assert_eq!(value["success"], true);
    }

    #[test]
    fn test_store_key_display() {
        let key = StoreKey::new("mfb-runtime-v3", "/api/emergency/queue");
        assert_eq!(key.to_string(), "mfb-runtime-v3::/api/emergency/queue");
    }
}
