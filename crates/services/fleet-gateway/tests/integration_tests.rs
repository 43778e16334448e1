//! End-to-end tests for the fleet gateway
//!
//! Local axum servers stand in for the instance metadata service and the
//! configuration store; relays are `sh` processes.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, Request, StatusCode},
    response::IntoResponse,
    routing::{get, put},
    Router,
};
use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tower::ServiceExt;

use camfleet_gateway::api::{build_router, AppState};
use camfleet_gateway::credentials::{CredentialProvider, CredentialSource, Credentials, ImdsCredentialSource};
use camfleet_gateway::loader::{AppConfigSource, ConfigRequest, ConfigSource, FleetConfigLoader, RawConfiguration};
#[cfg(unix)]
use camfleet_gateway::supervisor::ProcessState;
use camfleet_gateway::supervisor::{ProcessSupervisor, RelayCommand, RelayInvocation, SupervisorSettings};
use camfleet_gateway::{CameraStreamSpec, Error, FleetConfiguration, GatewayRuntime, Result};

async fn spawn_server(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

struct StaticCredentials;

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn fetch(&self) -> Result<Credentials> {
        Ok(Credentials {
            access_key: "AKIDEXAMPLE".to_string(),
            secret_key: "secret".to_string(),
            session_token: "session-token".to_string(),
            issued_at: Utc::now(),
            expires_at: Some(Utc::now() + chrono::Duration::hours(6)),
        })
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// Relays run `sh`; sources containing "unreachable" exit like a failed
/// RTSP connect, everything else keeps streaming.
struct ShellRelay;

impl RelayCommand for ShellRelay {
    fn build(&self, camera: &CameraStreamSpec, credentials: &Credentials) -> RelayInvocation {
        let script = if camera.source_uri.contains("unreachable") {
            "echo 'Could not open resource for reading and writing' >&2; exit 1"
        } else {
            "sleep 30"
        };
        RelayInvocation {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: credentials.to_env(),
        }
    }
}

fn request() -> ConfigRequest {
    ConfigRequest::new("computer-vision", "production", "camera-config", "host-test-1")
}

fn runtime_with(dir: &std::path::Path, store: Arc<dyn ConfigSource>) -> GatewayRuntime {
    GatewayRuntime::new(
        CredentialProvider::new(Arc::new(StaticCredentials)),
        FleetConfigLoader::new(store, dir.join("fleet-snapshot.json")),
        ProcessSupervisor::new(
            Arc::new(ShellRelay),
            SupervisorSettings::under(dir, Duration::from_millis(150)),
        ),
        request(),
    )
}

// ---------------------------------------------------------------------------
// Instance metadata service
// ---------------------------------------------------------------------------

const IMDS_TOKEN: &str = "imds-session-token";

fn metadata_server(code: &'static str) -> Router {
    async fn token(headers: HeaderMap) -> impl IntoResponse {
        if headers.get("X-aws-ec2-metadata-token-ttl-seconds").is_none() {
            return (StatusCode::BAD_REQUEST, String::new());
        }
        (StatusCode::OK, IMDS_TOKEN.to_string())
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get("X-aws-ec2-metadata-token")
            .and_then(|v| v.to_str().ok())
            == Some(IMDS_TOKEN)
    }

    async fn roles(headers: HeaderMap) -> impl IntoResponse {
        if !authorized(&headers) {
            return (StatusCode::UNAUTHORIZED, String::new());
        }
        (StatusCode::OK, "gateway-role\n".to_string())
    }

    async fn role(
        State(code): State<&'static str>,
        Path(role): Path<String>,
        headers: HeaderMap,
    ) -> impl IntoResponse {
        if !authorized(&headers) || role != "gateway-role" {
            return (StatusCode::NOT_FOUND, String::new());
        }
        let body = serde_json::json!({
            "Code": code,
            "LastUpdated": "2024-05-01T10:00:00Z",
            "Type": "AWS-HMAC",
            "AccessKeyId": "ASIAEXAMPLE",
            "SecretAccessKey": "imds-secret",
            "Token": "imds-token",
            "Expiration": "2024-05-01T16:00:00Z"
        });
        (StatusCode::OK, body.to_string())
    }

    Router::new()
        .route("/latest/api/token", put(token))
        .route("/latest/meta-data/iam/security-credentials/", get(roles))
        .route("/latest/meta-data/iam/security-credentials/:role", get(role))
        .with_state(code)
}

#[tokio::test]
async fn test_imds_credentials_flow() {
    let endpoint = spawn_server(metadata_server("Success")).await;
    let source = ImdsCredentialSource::new(endpoint, Duration::from_secs(2)).unwrap();

    let creds = source.fetch().await.unwrap();

    assert_eq!(creds.access_key, "ASIAEXAMPLE");
    assert_eq!(creds.secret_key, "imds-secret");
    assert_eq!(creds.session_token, "imds-token");
    assert_eq!(creds.issued_at.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    assert_eq!(
        creds.remaining(creds.issued_at),
        Some(chrono::Duration::hours(6))
    );
}

#[tokio::test]
async fn test_imds_failure_code_is_unavailable() {
    let endpoint = spawn_server(metadata_server("Failed")).await;
    let source = ImdsCredentialSource::new(endpoint, Duration::from_secs(2)).unwrap();

    let err = source.fetch().await.unwrap_err();
    assert!(matches!(err, Error::CredentialUnavailable(_)));
    assert!(err.to_string().contains("Failed"));
}

#[tokio::test]
async fn test_imds_unreachable_is_unavailable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let source = ImdsCredentialSource::new(format!("http://{}", addr), Duration::from_millis(500)).unwrap();
    let err = source.fetch().await.unwrap_err();
    assert!(matches!(err, Error::CredentialUnavailable(_)));
}

// ---------------------------------------------------------------------------
// Configuration store
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct StoreState {
    /// (status, body, version)
    response: Arc<StdMutex<(StatusCode, String, String)>>,
    last_authorization: Arc<StdMutex<Option<String>>>,
    last_client_id: Arc<StdMutex<Option<String>>>,
}

impl StoreState {
    fn serving(body: &str, version: &str) -> Self {
        let state = Self::default();
        state.set(StatusCode::OK, body, version);
        state
    }

    fn set(&self, status: StatusCode, body: &str, version: &str) {
        *self.response.lock().unwrap() = (status, body.to_string(), version.to_string());
    }
}

#[derive(serde::Deserialize)]
struct ClientQuery {
    client_id: String,
}

fn appconfig_server(state: StoreState) -> Router {
    async fn get_configuration(
        State(state): State<StoreState>,
        Path((application, environment, profile)): Path<(String, String, String)>,
        Query(query): Query<ClientQuery>,
        headers: HeaderMap,
    ) -> impl IntoResponse {
        *state.last_authorization.lock().unwrap() = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        *state.last_client_id.lock().unwrap() = Some(query.client_id);

        if (application.as_str(), environment.as_str(), profile.as_str())
            != ("computer-vision", "production", "camera-config")
        {
            return (StatusCode::NOT_FOUND, [("Configuration-Version", String::new())], String::new());
        }

        let (status, body, version) = state.response.lock().unwrap().clone();
        (status, [("Configuration-Version", version)], body)
    }

    Router::new()
        .route(
            "/applications/:application/environments/:environment/configurations/:profile",
            get(get_configuration),
        )
        .with_state(state)
}

const THREE_CAMERAS: &str = r#"[
    {"source_uri": "rtsp://10.0.0.11/live", "sink_stream_id": "store-1-entrance", "label": "Entrance"},
    {"source_uri": "rtsp://10.0.0.12/live", "sink_stream_id": "store-1-registers"},
    {"source_uri": "rtsp://10.0.0.13/live", "sink_stream_id": "store-1-stockroom", "fps": 15}
]"#;

#[tokio::test]
async fn test_appconfig_fetch_is_signed_and_versioned() {
    let state = StoreState::serving(THREE_CAMERAS, "7");
    let endpoint = spawn_server(appconfig_server(state.clone())).await;
    let dir = tempfile::tempdir().unwrap();

    let source = AppConfigSource::new("us-east-1", Some(endpoint.as_str()), Duration::from_secs(2)).unwrap();
    let loader = FleetConfigLoader::new(Arc::new(source), dir.path().join("fleet-snapshot.json"));
    let creds = StaticCredentials.fetch().await.unwrap();

    let config = loader.load(&request(), &creds).await.unwrap();

    assert_eq!(config.version, "7");
    assert_eq!(config.len(), 3);
    assert_eq!(config.cameras[0].label, "Entrance");
    assert_eq!(config.cameras[2].frame_rate, Some(15));

    let authorization = state.last_authorization.lock().unwrap().clone().unwrap();
    assert!(authorization.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
    assert!(authorization.contains("/us-east-1/appconfig/aws4_request"));
    assert!(authorization.contains("x-amz-security-token"));
    assert_eq!(state.last_client_id.lock().unwrap().as_deref(), Some("host-test-1"));

    let snapshot = FleetConfiguration::read_snapshot(loader.snapshot_path()).unwrap();
    assert_eq!(snapshot, config);
}

#[tokio::test]
async fn test_appconfig_error_status_is_fetch_error() {
    let state = StoreState::default();
    state.set(StatusCode::FORBIDDEN, r#"{"Message":"not authorized"}"#, "");
    let endpoint = spawn_server(appconfig_server(state)).await;

    let source = AppConfigSource::new("us-east-1", Some(endpoint.as_str()), Duration::from_secs(2)).unwrap();
    let creds = StaticCredentials.fetch().await.unwrap();

    let err = source.fetch(&request(), &creds).await.unwrap_err();
    assert!(matches!(err, Error::ConfigFetch(_)));
    assert!(err.to_string().contains("403"));
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

#[cfg(unix)]
#[tokio::test]
async fn test_boot_three_cameras_then_stop() {
    let state = StoreState::serving(THREE_CAMERAS, "1");
    let endpoint = spawn_server(appconfig_server(state)).await;
    let dir = tempfile::tempdir().unwrap();
    let source = AppConfigSource::new("us-east-1", Some(endpoint.as_str()), Duration::from_secs(2)).unwrap();
    let runtime = runtime_with(dir.path(), Arc::new(source));

    let status = runtime.apply().await.unwrap();

    assert_eq!(status.version.as_deref(), Some("1"));
    assert_eq!(status.processes.len(), 3);
    assert_eq!(status.running, 3);
    let ids: Vec<&str> = status.processes.iter().map(|p| p.sink_stream_id.as_str()).collect();
    assert_eq!(ids, vec!["store-1-entrance", "store-1-registers", "store-1-stockroom"]);

    assert_eq!(runtime.shutdown().await, 3);
    assert!(runtime.status().processes.is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn test_unreachable_camera_is_isolated() {
    let body = r#"[
        {"source_uri": "rtsp://10.0.0.11/live", "sink_stream_id": "cam-1"},
        {"source_uri": "rtsp://unreachable.invalid/live", "sink_stream_id": "cam-2"},
        {"source_uri": "rtsp://10.0.0.13/live", "sink_stream_id": "cam-3"}
    ]"#;
    let state = StoreState::serving(body, "1");
    let endpoint = spawn_server(appconfig_server(state)).await;
    let dir = tempfile::tempdir().unwrap();
    let source = AppConfigSource::new("us-east-1", Some(endpoint.as_str()), Duration::from_secs(2)).unwrap();
    let runtime = runtime_with(dir.path(), Arc::new(source));

    let status = runtime.apply().await.unwrap();

    assert_eq!(status.running, 2);
    let failed = status.processes.iter().find(|p| p.sink_stream_id == "cam-2").unwrap();
    assert_eq!(failed.state, ProcessState::Exited { code: Some(1) });

    // the fleet is applied, the failed camera is reported
    let last_error = status.last_error.as_ref().unwrap();
    assert_eq!(last_error.kind, "stream_launch_failure");
    assert!(last_error.message.contains("cam-2"));

    let log = std::fs::read_to_string(dir.path().join("logs").join("cam-2.log")).unwrap();
    assert!(log.contains("Could not open resource"));

    let metrics = runtime.metrics().snapshot();
    assert_eq!(metrics.launches_succeeded, 2);
    assert_eq!(metrics.launches_failed, 1);

    runtime.shutdown().await;
}

/// Blocks the first fetch until released
struct GatedStore {
    entered: Notify,
    release: Notify,
}

impl GatedStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: Notify::new(),
            release: Notify::new(),
        })
    }
}

#[async_trait]
impl ConfigSource for GatedStore {
    async fn fetch(&self, _request: &ConfigRequest, _credentials: &Credentials) -> Result<RawConfiguration> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(RawConfiguration {
            content: br#"[{"source_uri": "rtsp://a", "sink_stream_id": "cam-a"}]"#.to_vec(),
            version: Some("2".to_string()),
        })
    }
}

#[tokio::test]
async fn test_second_trigger_is_rejected_while_refreshing() {
    let dir = tempfile::tempdir().unwrap();
    let store = GatedStore::new();
    let runtime = Arc::new(runtime_with(dir.path(), store.clone()));

    let in_flight = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.refresh().await })
    };
    store.entered.notified().await;

    assert!(matches!(runtime.refresh().await, Err(Error::ReconfigurationInProgress)));
    assert!(matches!(runtime.apply().await, Err(Error::ReconfigurationInProgress)));
    assert!(runtime.status().reconfiguring);

    store.release.notify_one();
    let status = in_flight.await.unwrap().unwrap();
    assert_eq!(status.version.as_deref(), Some("2"));
    assert!(!runtime.status().reconfiguring);
    assert_eq!(runtime.metrics().snapshot().triggers_rejected, 2);

    runtime.shutdown().await;
}

// ---------------------------------------------------------------------------
// Trigger API
// ---------------------------------------------------------------------------

async fn send(app: &Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, body)
}

#[cfg(unix)]
#[tokio::test]
async fn test_api_apply_status_and_refresh_errors() {
    let state = StoreState::serving(THREE_CAMERAS, "1");
    let endpoint = spawn_server(appconfig_server(state.clone())).await;
    let dir = tempfile::tempdir().unwrap();
    let source = AppConfigSource::new("us-east-1", Some(endpoint.as_str()), Duration::from_secs(2)).unwrap();
    let runtime = Arc::new(runtime_with(dir.path(), Arc::new(source)));
    let app = build_router(AppState::new(runtime.clone()));

    let (status, body) = send(&app, "POST", "/api/fleet/apply").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], "1");
    assert_eq!(body["running"], 3);

    let (status, body) = send(&app, "GET", "/api/fleet/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processes"][0]["state"], "running");
    assert_eq!(body["reconfiguring"], false);

    // duplicate sink id: rejected, fleet left stopped
    state.set(
        StatusCode::OK,
        r#"[{"source_uri": "rtsp://a", "sink_stream_id": "dup"},
            {"source_uri": "rtsp://b", "sink_stream_id": "dup"}]"#,
        "2",
    );
    let (status, body) = send(&app, "POST", "/api/fleet/refresh").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "config_parse_error");
    assert!(body["message"].as_str().unwrap().contains("dup"));

    let (_, body) = send(&app, "GET", "/api/fleet/status").await;
    assert_eq!(body["version"], serde_json::Value::Null);
    assert_eq!(body["last_error"]["kind"], "config_parse_error");

    state.set(StatusCode::INTERNAL_SERVER_ERROR, "", "");
    let (status, body) = send(&app, "POST", "/api/fleet/refresh").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "config_fetch_error");

    let (status, body) = send(&app, "GET", "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reconfigurations_failed"], 2);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_api_rejects_concurrent_refresh_with_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let store = GatedStore::new();
    let runtime = Arc::new(runtime_with(dir.path(), store.clone()));
    let app = build_router(AppState::new(runtime.clone()));

    let first = {
        let app = app.clone();
        tokio::spawn(async move { send(&app, "POST", "/api/fleet/refresh").await })
    };
    store.entered.notified().await;

    let (status, body) = send(&app, "POST", "/api/fleet/refresh").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "reconfiguration_in_progress");

    let (status, body) = send(&app, "GET", "/api/fleet/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reconfiguring"], true);

    store.release.notify_one();
    let (status, body) = first.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], "2");

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_api_health() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(runtime_with(dir.path(), GatedStore::new()));
    let app = build_router(AppState::new(runtime));

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"OK");
}
