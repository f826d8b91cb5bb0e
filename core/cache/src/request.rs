//! Intercepted request representation.

use http::Method;
use serde::Serialize;
use url::Url;

use offgrid_common::{Error, RequestKey, Result};

/// A request seen by the interception layer.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: Url,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    key: RequestKey,
}

impl Request {
    /// Create a request with an empty body.
    pub fn new(method: Method, url: Url) -> Result<Self> {
        let key = RequestKey::new(method.as_str(), &url)?;
        Ok(Self {
            method,
            url,
            headers: Vec::new(),
            body: Vec::new(),
            key,
        })
    }

    /// Create a GET request from a URL string.
    pub fn get(url: &str) -> Result<Self> {
        Self::new(Method::GET, parse_url(url)?)
    }

    /// Create a POST request carrying a JSON body.
    pub fn post_json<T: Serialize + ?Sized>(url: &str, body: &T) -> Result<Self> {
        let request = Self::new(Method::POST, parse_url(url)?)?
            .with_header("content-type", "application/json")
            .with_body(serde_json::to_vec(body)?);
        Ok(request)
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replace the body.
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Canonical cache identity.
    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    /// Whether this is a read (GET) request, the only kind that is cached.
    pub fn is_read(&self) -> bool {
        self.method == Method::GET
    }
}

fn parse_url(url: &str) -> Result<Url> {
    Url::parse(url).map_err(|e| Error::InvalidInput(format!("Invalid URL {}: {}", url, e)))
}
