//! HTTP front end for the worker.
//!
//! The two ingestion endpoints are mounted under the configured paths.
//! Every other request is resolved through [`OfflineWorker::handle_fetch`]
//! against the configured origin, so the server acts as an offline-first
//! proxy for the application.

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use offgrid_cache::{Fetcher, Request};
use offgrid_common::{Error, Result};
use offgrid_storage::CachedResponse;

use crate::worker::{FetchOutcome, OfflineWorker};

const HOP_BY_HOP: &[&str] = &["connection", "content-length", "transfer-encoding", "host"];

/// Build the router for a worker.
pub fn router(worker: Arc<OfflineWorker>) -> Router {
    let background = worker.config().background_path.clone();
    let alert = worker.config().alert_path.clone();

    Router::new()
        .route(&background, post(background_data))
        .route(&format!("{}{{*rest}}", background), post(background_data))
        .route(&alert, post(emergency_alert))
        .route(&format!("{}{{*rest}}", alert), post(emergency_alert))
        .fallback(intercept)
        .with_state(worker)
}

async fn background_data(State(worker): State<Arc<OfflineWorker>>, body: Bytes) -> Response {
    into_http(worker.ingest_background(&body).await)
}

async fn emergency_alert(State(worker): State<Arc<OfflineWorker>>, body: Bytes) -> Response {
    into_http(worker.ingest_alert(&body).await)
}

async fn intercept(
    State(worker): State<Arc<OfflineWorker>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = match build_request(&worker, method, &uri, &headers, body) {
        Ok(request) => request,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    match worker.handle_fetch(&request).await {
        FetchOutcome::Response(response) => into_http(response),
        FetchOutcome::Unavailable => {
            debug!("Unavailable: {}", request.url());
            error_response(StatusCode::SERVICE_UNAVAILABLE, "Offline and not cached")
        }
        FetchOutcome::Passthrough => match worker.fetcher().fetch(&request).await {
            Ok(response) => into_http(response),
            Err(e) => {
                warn!("Passthrough of {} failed: {}", request.url(), e);
                error_response(StatusCode::BAD_GATEWAY, e)
            }
        },
    }
}

fn build_request(
    worker: &OfflineWorker,
    method: Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Request> {
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let url = worker
        .config()
        .origin_url()?
        .join(path)
        .map_err(|e| Error::InvalidInput(format!("Invalid path {}: {}", path, e)))?;

    let mut request = Request::new(method, url)?;
    for (name, value) in headers {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            request = request.with_header(name.as_str(), value);
        }
    }
    Ok(request.with_body(body.to_vec()))
}

fn into_http(response: CachedResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in &response.headers {
        if !HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str()) {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }
    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e))
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (status, Json(json!({"error": error.to_string()}))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use offgrid_cache::ScriptedFetcher;
    use offgrid_storage::MemoryStore;
    use offgrid_sync::SimulatedDeliverer;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn serve() -> (String, Arc<OfflineWorker>, Arc<ScriptedFetcher>) {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let config = WorkerConfig {
            origin: "https://app.test".to_string(),
            precache: vec!["/js/app.js".to_string()],
            ..Default::default()
        };
        let (worker, _handle) = OfflineWorker::new(
            config,
            Arc::new(MemoryStore::new()),
            fetcher.clone(),
            Arc::new(SimulatedDeliverer::new(Duration::ZERO, 0.0)),
        )
        .unwrap();
        let worker = Arc::new(worker);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(worker.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}", addr), worker, fetcher)
    }

    #[tokio::test]
    async fn test_background_endpoint() {
        let (base, worker, _fetcher) = serve().await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/api/background/ride", base))
            .json(&json!({"type": "ride", "km": 40}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body, json!({"success": true}));
        assert_eq!(worker.background_data().await.len(), 1);
    }

    #[tokio::test]
    async fn test_emergency_endpoint() {
        let (base, worker, _fetcher) = serve().await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/api/emergency/", base))
            .json(&json!({"type": "crash"}))
            .send()
            .await
            .unwrap();
        let body: Value = response.json().await.unwrap();
        assert_eq!(body, json!({"success": true, "queued": true}));
        assert_eq!(worker.queue().len().await, 1);

        let response = client
            .post(format!("{}/api/emergency/crash", base))
            .body("not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 500);
        let body: Value = response.json().await.unwrap();
        assert!(body["error"].is_string());
        assert_eq!(worker.queue().len().await, 1);
    }

    #[tokio::test]
    async fn test_fallback_serves_cached_resources() {
        let (base, worker, fetcher) = serve().await;
        fetcher.respond("https://app.test/js/app.js", 200, "app()");
        worker.install().await.unwrap();
        fetcher.set_online(false);

        let response = reqwest::get(format!("{}/js/app.js", base)).await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(response.text().await.unwrap(), "app()");

        let response = reqwest::get(format!("{}/tile/1/1/1.png", base)).await.unwrap();
        assert_eq!(response.status().as_u16(), 503);
    }
}
