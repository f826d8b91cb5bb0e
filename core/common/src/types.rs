//! Common types used throughout offgrid.

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Canonical identity of an intercepted request.
///
/// Two requests that differ only in method casing or URL fragment map to
/// the same key, so they share one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey(String);

impl RequestKey {
    /// Build a key from a method and URL.
    ///
    /// # Preconditions
    /// - `method` must be non-empty and contain no whitespace
    ///
    /// # Postconditions
    /// - Method is upper-cased, fragment is stripped
    ///
    /// # Errors
    /// - Returns error if the method is invalid
    pub fn new(method: &str, url: &Url) -> crate::Result<Self> {
        if method.is_empty() || method.chars().any(char::is_whitespace) {
            return Err(crate::Error::InvalidInput(format!(
                "Invalid request method: {:?}",
                method
            )));
        }
        let mut url = url.clone();
        url.set_fragment(None);
        Ok(Self(format!("{} {}", method.to_ascii_uppercase(), url)))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
