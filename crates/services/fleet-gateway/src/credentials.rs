//! Short-lived access credentials
//!
//! Credentials are fetched from the instance metadata service (IMDSv2) or
//! from the process environment, held by [`CredentialProvider`] only, and
//! handed to the config loader and relay processes as explicit values.
//! They are never written to disk.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Access credentials scoped to the gateway's execution role
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    /// Empty for long-lived keys
    pub session_token: String,
    pub issued_at: DateTime<Utc>,
    /// `None` for keys without an expiry
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    /// Remaining validity at `now`, `None` when the keys do not expire
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.expires_at.map(|exp| exp - now)
    }

    /// Whether the credentials should be re-acquired at `now`
    ///
    /// True once the remaining validity drops to `refresh_fraction` of the
    /// original lifetime, or when already expired.
    pub fn needs_refresh(&self, now: DateTime<Utc>, refresh_fraction: f64) -> bool {
        let Some(expires_at) = self.expires_at else {
            return false;
        };

        let lifetime = (expires_at - self.issued_at).num_milliseconds();
        let remaining = (expires_at - now).num_milliseconds();

        if remaining <= 0 || lifetime <= 0 {
            return true;
        }

        (remaining as f64) <= lifetime as f64 * refresh_fraction
    }

    /// Environment for a child process that talks to the sink
    pub fn to_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("AWS_ACCESS_KEY_ID".to_string(), self.access_key.clone()),
            ("AWS_SECRET_ACCESS_KEY".to_string(), self.secret_key.clone()),
        ];
        if !self.session_token.is_empty() {
            env.push(("AWS_SESSION_TOKEN".to_string(), self.session_token.clone()));
        }
        env
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Where credentials come from
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Fetch a fresh set of credentials
    async fn fetch(&self) -> Result<Credentials>;

    /// Source name for logging
    fn name(&self) -> &'static str;
}

const IMDS_TOKEN_TTL_SECONDS: u32 = 21600;
const CREDENTIALS_PATH: &str = "/latest/meta-data/iam/security-credentials/";

/// Instance metadata service (IMDSv2) credentials for the instance role
pub struct ImdsCredentialSource {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImdsCredentialsDocument {
    code: String,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
    access_key_id: String,
    secret_access_key: String,
    token: String,
    expiration: DateTime<Utc>,
}

impl ImdsCredentialSource {
    /// Create a source for `endpoint` (e.g. `http://169.254.169.254`)
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Settings(format!("failed to build metadata client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    async fn session_token(&self) -> Result<String> {
        let url = format!("{}/latest/api/token", self.endpoint);
        let resp = self
            .client
            .put(&url)
            .header("X-aws-ec2-metadata-token-ttl-seconds", IMDS_TOKEN_TTL_SECONDS.to_string())
            .send()
            .await
            .map_err(|e| unavailable("metadata token request failed", e))?;

        if !resp.status().is_success() {
            return Err(Error::CredentialUnavailable(format!(
                "metadata token request returned {}",
                resp.status()
            )));
        }

        resp.text()
            .await
            .map_err(|e| unavailable("metadata token unreadable", e))
    }

    async fn get(&self, path: &str, token: &str) -> Result<String> {
        let url = format!("{}{}", self.endpoint, path);
        let resp = self
            .client
            .get(&url)
            .header("X-aws-ec2-metadata-token", token)
            .send()
            .await
            .map_err(|e| unavailable("metadata request failed", e))?;

        if !resp.status().is_success() {
            return Err(Error::CredentialUnavailable(format!(
                "metadata {} returned {}",
                path,
                resp.status()
            )));
        }

        resp.text()
            .await
            .map_err(|e| unavailable("metadata response unreadable", e))
    }
}

#[async_trait]
impl CredentialSource for ImdsCredentialSource {
    async fn fetch(&self) -> Result<Credentials> {
        let token = self.session_token().await?;

        let roles = self.get(CREDENTIALS_PATH, &token).await?;
        let role = roles
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| Error::CredentialUnavailable("no instance role attached".to_string()))?
            .to_string();

        let body = self.get(&format!("{}{}", CREDENTIALS_PATH, role), &token).await?;
        let doc: ImdsCredentialsDocument = serde_json::from_str(&body).map_err(|e| {
            Error::CredentialUnavailable(format!("malformed credentials for role {}: {}", role, e))
        })?;

        if doc.code != "Success" {
            return Err(Error::CredentialUnavailable(format!(
                "metadata service reported {} for role {}",
                doc.code, role
            )));
        }

        tracing::debug!(role = %role, expires_at = %doc.expiration, "Fetched instance role credentials");

        Ok(Credentials {
            access_key: doc.access_key_id,
            secret_key: doc.secret_access_key,
            session_token: doc.token,
            issued_at: doc.last_updated.unwrap_or_else(Utc::now),
            expires_at: Some(doc.expiration),
        })
    }

    fn name(&self) -> &'static str {
        "imds"
    }
}

fn unavailable(context: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::CredentialUnavailable(format!("{}: timed out", context))
    } else {
        Error::CredentialUnavailable(format!("{}: {}", context, e))
    }
}

/// Keys from `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` / `AWS_SESSION_TOKEN`
#[derive(Debug, Default)]
pub struct EnvCredentialSource;

#[async_trait]
impl CredentialSource for EnvCredentialSource {
    async fn fetch(&self) -> Result<Credentials> {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        let access_key = var("AWS_ACCESS_KEY_ID")
            .ok_or_else(|| Error::CredentialUnavailable("AWS_ACCESS_KEY_ID not set".to_string()))?;
        let secret_key = var("AWS_SECRET_ACCESS_KEY").ok_or_else(|| {
            Error::CredentialUnavailable("AWS_SECRET_ACCESS_KEY not set".to_string())
        })?;

        Ok(Credentials {
            access_key,
            secret_key,
            session_token: var("AWS_SESSION_TOKEN").unwrap_or_default(),
            issued_at: Utc::now(),
            expires_at: None,
        })
    }

    fn name(&self) -> &'static str {
        "env"
    }
}

/// Owns the current credentials and re-acquires them before expiry
pub struct CredentialProvider {
    source: Arc<dyn CredentialSource>,
    refresh_fraction: f64,
    cached: Mutex<Option<Credentials>>,
}

impl CredentialProvider {
    /// Default share of the lifetime left at which credentials are refreshed
    pub const DEFAULT_REFRESH_FRACTION: f64 = 0.2;

    /// Create a provider with the default refresh policy
    pub fn new(source: Arc<dyn CredentialSource>) -> Self {
        Self::with_refresh_fraction(source, Self::DEFAULT_REFRESH_FRACTION)
    }

    /// Create a provider refreshing at `refresh_fraction` of remaining lifetime
    pub fn with_refresh_fraction(source: Arc<dyn CredentialSource>, refresh_fraction: f64) -> Self {
        Self {
            source,
            refresh_fraction: refresh_fraction.clamp(0.0, 1.0),
            cached: Mutex::new(None),
        }
    }

    /// Whether `credentials` are inside the refresh window now
    pub fn is_due(&self, credentials: &Credentials) -> bool {
        credentials.needs_refresh(Utc::now(), self.refresh_fraction)
    }

    /// Fetch fresh credentials from the source, replacing the cached ones
    pub async fn acquire(&self) -> Result<Credentials> {
        let mut cached = self.cached.lock().await;
        self.fetch_into(&mut cached).await
    }

    /// Cached credentials, re-acquired first when inside the refresh window
    pub async fn current(&self) -> Result<Credentials> {
        let mut cached = self.cached.lock().await;

        if let Some(creds) = cached.as_ref() {
            if !creds.needs_refresh(Utc::now(), self.refresh_fraction) {
                return Ok(creds.clone());
            }
            tracing::info!(source = self.source.name(), "Credentials inside refresh window, re-acquiring");
        }

        self.fetch_into(&mut cached).await
    }

    async fn fetch_into(&self, cached: &mut Option<Credentials>) -> Result<Credentials> {
        match self.source.fetch().await {
            Ok(creds) => {
                tracing::info!(
                    source = self.source.name(),
                    expires_at = ?creds.expires_at,
                    "Acquired credentials"
                );
                *cached = Some(creds.clone());
                Ok(creds)
            }
            Err(e) => {
                tracing::error!(source = self.source.name(), error = %e, "Credential acquisition failed");
                Err(e)
            }
        }
    }
}
