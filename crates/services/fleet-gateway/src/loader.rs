//! Fleet configuration loading
//!
//! [`FleetConfigLoader`] pulls the camera list from a [`ConfigSource`]
//! (AWS AppConfig in production), validates it, and persists the canonical
//! snapshot before handing it back.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::fleet::FleetConfiguration;
use crate::sigv4::{self, SigningRequest};

/// Identifies the configuration to fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRequest {
    pub application: String,
    pub environment: String,
    pub profile: String,
    /// Stable per-host id for session-consistent polling
    pub client_id: String,
}

impl ConfigRequest {
    /// Create a request
    pub fn new(
        application: impl Into<String>,
        environment: impl Into<String>,
        profile: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            application: application.into(),
            environment: environment.into(),
            profile: profile.into(),
            client_id: client_id.into(),
        }
    }
}

/// Unparsed configuration as returned by the store
#[derive(Debug, Clone)]
pub struct RawConfiguration {
    pub content: Vec<u8>,
    /// Version reported by the store, if any
    pub version: Option<String>,
}

/// A remote configuration store
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Fetch the current document for `request`
    async fn fetch(&self, request: &ConfigRequest, credentials: &Credentials) -> Result<RawConfiguration>;
}

/// AWS AppConfig `GetConfiguration`
pub struct AppConfigSource {
    client: reqwest::Client,
    endpoint: url::Url,
    region: String,
}

impl AppConfigSource {
    /// Create a source for `region`, optionally against a custom endpoint
    pub fn new(region: impl Into<String>, endpoint: Option<&str>, timeout: Duration) -> Result<Self> {
        let region = region.into();
        let endpoint = match endpoint {
            Some(e) => e.to_string(),
            None => format!("https://appconfig.{}.amazonaws.com", region),
        };
        let endpoint = url::Url::parse(&endpoint)
            .map_err(|e| Error::Settings(format!("invalid appconfig endpoint {}: {}", endpoint, e)))?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Settings(format!("failed to build appconfig client: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            region,
        })
    }

    fn host(&self) -> Result<String> {
        let host = self
            .endpoint
            .host_str()
            .ok_or_else(|| Error::Settings(format!("appconfig endpoint {} has no host", self.endpoint)))?;
        Ok(match self.endpoint.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        })
    }
}

#[async_trait]
impl ConfigSource for AppConfigSource {
    async fn fetch(&self, request: &ConfigRequest, credentials: &Credentials) -> Result<RawConfiguration> {
        let segments = [
            "applications",
            request.application.as_str(),
            "environments",
            request.environment.as_str(),
            "configurations",
            request.profile.as_str(),
        ];
        let query = [("client_id", request.client_id.as_str())];
        let host = self.host()?;

        let signed = sigv4::sign(
            &SigningRequest {
                method: "GET",
                host: &host,
                path_segments: &segments,
                query: &query,
                region: &self.region,
                service: "appconfig",
            },
            credentials,
            Utc::now(),
        );

        let url = format!(
            "{}://{}{}?{}",
            self.endpoint.scheme(),
            host,
            sigv4::encode_path(&segments),
            sigv4::encode_query(&query)
        );

        let mut req = self
            .client
            .get(&url)
            .header("Authorization", signed.authorization)
            .header("X-Amz-Date", signed.amz_date);
        if let Some(token) = signed.security_token {
            req = req.header("X-Amz-Security-Token", token);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::ConfigFetch(format!("configuration store timed out: {}", url))
            } else {
                Error::ConfigFetch(format!("configuration store unreachable: {}", e))
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::ConfigFetch(format!(
                "configuration store returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let version = resp
            .headers()
            .get("Configuration-Version")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let content = resp
            .bytes()
            .await
            .map_err(|e| Error::ConfigFetch(format!("configuration body unreadable: {}", e)))?
            .to_vec();

        Ok(RawConfiguration { content, version })
    }
}

/// Fetches, validates and persists the authoritative camera list
pub struct FleetConfigLoader {
    source: Arc<dyn ConfigSource>,
    snapshot_path: PathBuf,
}

impl FleetConfigLoader {
    /// Create a loader persisting snapshots at `snapshot_path`
    pub fn new(source: Arc<dyn ConfigSource>, snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            source,
            snapshot_path: snapshot_path.into(),
        }
    }

    /// Where the last successfully loaded configuration is written
    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Fetch and validate without persisting
    pub async fn peek(&self, request: &ConfigRequest, credentials: &Credentials) -> Result<FleetConfiguration> {
        let raw = self.source.fetch(request, credentials).await?;
        FleetConfiguration::from_document(&raw.content, raw.version.as_deref())
    }

    /// Fetch, validate and persist the snapshot
    pub async fn load(&self, request: &ConfigRequest, credentials: &Credentials) -> Result<FleetConfiguration> {
        let config = match self.peek(request, credentials).await {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(
                    application = %request.application,
                    environment = %request.environment,
                    profile = %request.profile,
                    error = %e,
                    "Fleet configuration load failed"
                );
                return Err(e);
            }
        };

        config.write_snapshot(&self.snapshot_path)?;

        tracing::info!(
            version = %config.version,
            cameras = config.len(),
            enabled = config.enabled_cameras().count(),
            snapshot = %self.snapshot_path.display(),
            "Fleet configuration loaded"
        );

        Ok(config)
    }
}
