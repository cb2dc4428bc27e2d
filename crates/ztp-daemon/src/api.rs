//! REST API handlers

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use ztp_core::DiscoveryCache;
use ztp_discovery::{DiscoveryError, ProvisionToggles};

use crate::state::AppState;

/// API error response
#[derive(Serialize)]
struct ApiError {
    error: String,
}

impl ApiError {
    fn new(msg: impl Into<String>) -> Self {
        Self { error: msg.into() }
    }
}

/// Discovery request body
#[derive(Debug, Default, Deserialize)]
pub struct DiscoveryRequest {
    /// Range to scan; the configured default when absent
    #[serde(default)]
    pub range: Option<String>,
    /// Post-provision toggles; the configured defaults when absent
    #[serde(default)]
    pub toggles: Option<ProvisionToggles>,
}

/// Entries of a completed pass, with the reason they were not persisted
#[derive(Debug, Serialize)]
pub struct DiscoveryResponse {
    #[serde(flatten)]
    pub cache: DiscoveryCache,
    pub cache_error: Option<String>,
}

/// Run one discovery pass and return its entries.
///
/// The pass runs on its own task and completes even if the client goes
/// away. A pass whose cache write failed answers 500 with the entries and
/// `cache_error` set.
pub async fn run_discovery(
    State(state): State<Arc<AppState>>,
    body: Option<Json<DiscoveryRequest>>,
) -> impl IntoResponse {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let range = req
        .range
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| state.config.discovery.range.clone());
    let toggles = req.toggles.unwrap_or(state.config.provision.toggles);

    info!(range = %range, toggles = ?toggles, "Discovery requested");

    let scanner = state.scanner.clone();
    let pass = tokio::spawn(async move { scanner.run_discovery(&range, toggles).await });

    match pass.await {
        Ok(Ok(outcome)) => {
            let status = match &outcome.cache_error {
                Some(err) => {
                    warn!(error = %err, "Discovery pass not persisted");
                    StatusCode::INTERNAL_SERVER_ERROR
                }
                None => StatusCode::OK,
            };
            let response = DiscoveryResponse {
                cache: outcome.cache,
                cache_error: outcome.cache_error,
            };
            (status, Json(response)).into_response()
        }
        Ok(Err(e @ DiscoveryError::PassInProgress)) => {
            (StatusCode::CONFLICT, Json(ApiError::new(e.to_string()))).into_response()
        }
        Ok(Err(e)) => {
            (StatusCode::BAD_REQUEST, Json(ApiError::new(e.to_string()))).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiError::new(format!("Discovery pass aborted: {}", e))),
        )
            .into_response(),
    }
}

/// Return the last pass with its staleness flag
pub async fn get_discovery(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.scanner.read_cache() {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiError::new(format!("Failed to read discovery cache: {}", e))),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::server::router;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;
    use ztp_discovery::{ArpEntry, DiscoveryScanner, NeighborTable, Prober};
    use ztp_ssh::{SshChannel, SshConfig};

    /// Nothing answers; each probe takes `delay`
    struct SilentFabric {
        delay: Duration,
    }

    #[async_trait]
    impl Prober for SilentFabric {
        async fn probe(&self, _ip: Ipv4Addr) -> bool {
            tokio::time::sleep(self.delay).await;
            false
        }
    }

    impl NeighborTable for SilentFabric {
        fn entries(&self) -> anyhow::Result<Vec<ArpEntry>> {
            Ok(Vec::new())
        }
    }

    fn test_state(dir: &TempDir, cache_path: PathBuf, delay: Duration) -> Arc<AppState> {
        let mut config = Config::default();
        config.stores.bindings = dir.path().join("bindings.json");
        config.stores.identities = dir.path().join("devices.json");
        config.cache.path = cache_path;
        config.cache.elevated_writes = false;
        config.discovery.probe_pacing_ms = 0;

        let fabric = Arc::new(SilentFabric { delay });
        let scanner = DiscoveryScanner::with_backends(
            config.to_scanner_config(Vec::new()),
            fabric.clone(),
            fabric,
            Arc::new(SshChannel::new(SshConfig::default())),
        );
        AppState::with_scanner(Arc::new(scanner), config)
    }

    fn post(body: &'static str) -> Request<Body> {
        Request::post("/api/discovery")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_get_discovery_without_cache() {
        let dir = TempDir::new().unwrap();
        let app = router(test_state(&dir, dir.path().join("discovery.json"), Duration::ZERO));

        let response = app
            .oneshot(Request::get("/api/discovery").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["stale"], true);
        assert_eq!(json["entries"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_run_discovery_persists() {
        let dir = TempDir::new().unwrap();
        let app = router(test_state(&dir, dir.path().join("discovery.json"), Duration::ZERO));

        let response = app.oneshot(post(r#"{"range": "192.0.2.1-192.0.2.3"}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["range"], "192.0.2.1-192.0.2.3");
        assert_eq!(json["entries"].as_array().unwrap().len(), 3);
        assert_eq!(json["entries"][0]["class"], "unreachable");
        assert!(json["cache_error"].is_null());
    }

    #[tokio::test]
    async fn test_unsaved_pass_reports_cache_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        let app = router(test_state(&dir, blocker.join("discovery.json"), Duration::ZERO));

        let response = app.oneshot(post(r#"{"range": "192.0.2.1"}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let json = body_json(response).await;
        assert!(json["cache_error"].is_string());
        assert_eq!(json["entries"].as_array().unwrap().len(), 1);
        assert_eq!(json["entries"][0]["ip"], "192.0.2.1");
    }

    #[tokio::test]
    async fn test_pass_survives_client_disconnect() {
        let dir = TempDir::new().unwrap();
        let state = test_state(
            &dir,
            dir.path().join("discovery.json"),
            Duration::from_millis(200),
        );
        let app = router(state.clone());

        let request = app.oneshot(post(r#"{"range": "10.0.0.1-10.0.0.5"}"#));
        assert!(tokio::time::timeout(Duration::from_millis(20), request)
            .await
            .is_err());

        let mut entries = 0;
        for _ in 0..100 {
            entries = state.scanner.read_cache().unwrap().cache.entries.len();
            if entries > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(entries, 5);
    }

    #[tokio::test]
    async fn test_invalid_range_is_bad_request() {
        let dir = TempDir::new().unwrap();
        let app = router(test_state(&dir, dir.path().join("discovery.json"), Duration::ZERO));

        let response = app.oneshot(post(r#"{"range": "banana"}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn test_oversized_range_is_bad_request() {
        let dir = TempDir::new().unwrap();
        let app = router(test_state(&dir, dir.path().join("discovery.json"), Duration::ZERO));

        let response = app
            .oneshot(post(r#"{"range": "10.0.0.0-10.0.255.255"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_request_defaults() {
        let req: DiscoveryRequest = serde_json::from_str("{}").unwrap();
        assert!(req.range.is_none());
        assert!(req.toggles.is_none());

        let req: DiscoveryRequest =
            serde_json::from_str(r#"{"toggles": {"set_hostname": false}}"#).unwrap();
        let toggles = req.toggles.unwrap();
        assert!(toggles.push_config);
        assert!(!toggles.set_hostname);
    }
}
