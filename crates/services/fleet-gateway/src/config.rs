//! Configuration for the fleet gateway
//!
//! Settings are loaded from a TOML file when one exists, then overlaid with
//! `FLEET_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use camfleet_capacity_planner::{CapacityTier, TierTable};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::runtime::RetryPolicy;

/// Main configuration for the fleet gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Trigger API server
    #[serde(default)]
    pub server: ServerConfig,

    /// Remote configuration store
    #[serde(default)]
    pub appconfig: AppConfigSettings,

    #[serde(default)]
    pub credentials: CredentialSettings,

    #[serde(default)]
    pub relay: RelaySettings,

    /// Local persisted state
    #[serde(default)]
    pub state: StateSettings,

    /// Scheduled reconfiguration trigger
    #[serde(default)]
    pub poll: PollSettings,

    /// Boot retry while credentials are unavailable
    #[serde(default)]
    pub boot: BootSettings,

    /// Capacity tiers, smallest first; empty means the standard table
    #[serde(default)]
    pub tiers: Vec<CapacityTier>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8090
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

/// AppConfig location of the camera list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfigSettings {
    #[serde(default = "default_application")]
    pub application: String,

    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default = "default_profile")]
    pub profile: String,

    /// Stable per-host id; generated and persisted when unset
    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default = "default_region")]
    pub region: String,

    /// Endpoint override, e.g. a local emulator
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_appconfig_timeout")]
    pub timeout_seconds: u64,
}

fn default_application() -> String {
    "computer-vision".to_string()
}

fn default_environment() -> String {
    "production".to_string()
}

fn default_profile() -> String {
    "camera-config".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_appconfig_timeout() -> u64 {
    10
}

impl Default for AppConfigSettings {
    fn default() -> Self {
        Self {
            application: default_application(),
            environment: default_environment(),
            profile: default_profile(),
            client_id: None,
            region: default_region(),
            endpoint: None,
            timeout_seconds: default_appconfig_timeout(),
        }
    }
}

/// Where credentials come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialSourceKind {
    /// Instance metadata service
    #[default]
    Imds,
    /// Process environment
    Env,
}

impl std::str::FromStr for CredentialSourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "imds" => Ok(Self::Imds),
            "env" => Ok(Self::Env),
            other => Err(Error::Settings(format!("unknown credential source: {}", other))),
        }
    }
}

/// Credential acquisition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialSettings {
    #[serde(default)]
    pub source: CredentialSourceKind,

    #[serde(default = "default_imds_endpoint")]
    pub imds_endpoint: String,

    #[serde(default = "default_credentials_timeout")]
    pub timeout_seconds: u64,

    /// Share of lifetime left at which credentials are re-acquired
    #[serde(default = "default_refresh_fraction")]
    pub refresh_fraction: f64,

    /// How often the running fleet's credentials are checked for expiry
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,
}

fn default_imds_endpoint() -> String {
    "http://169.254.169.254".to_string()
}

fn default_credentials_timeout() -> u64 {
    5
}

fn default_refresh_fraction() -> f64 {
    0.2
}

fn default_check_interval() -> u64 {
    60
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            source: CredentialSourceKind::default(),
            imds_endpoint: default_imds_endpoint(),
            timeout_seconds: default_credentials_timeout(),
            refresh_fraction: default_refresh_fraction(),
            check_interval_seconds: default_check_interval(),
        }
    }
}

/// Relay process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    #[serde(default = "default_relay_program")]
    pub program: String,

    /// Sink buffer size hint
    #[serde(default = "default_storage_size_mb")]
    pub storage_size_mb: u32,

    /// Sink region; defaults to the AppConfig region
    #[serde(default)]
    pub region: Option<String>,

    /// Wait before the one-shot liveness check
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

fn default_relay_program() -> String {
    "gst-launch-1.0".to_string()
}

fn default_storage_size_mb() -> u32 {
    512
}

fn default_settle_delay_ms() -> u64 {
    2000
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            program: default_relay_program(),
            storage_size_mb: default_storage_size_mb(),
            region: None,
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

/// Local state directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSettings {
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/camfleet")
}

impl Default for StateSettings {
    fn default() -> Self {
        Self { dir: default_state_dir() }
    }
}

impl StateSettings {
    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join("fleet-snapshot.json")
    }

    pub fn client_id_path(&self) -> PathBuf {
        self.dir.join("client-id")
    }
}

/// Scheduled polling
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollSettings {
    /// 0 disables polling
    #[serde(default)]
    pub interval_seconds: u64,
}

/// Boot retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30000
}

impl Default for BootSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Settings(format!("cannot read {}: {}", path.display(), e)))?;
        toml::from_str(&content).map_err(|e| Error::Settings(format!("cannot parse {}: {}", path.display(), e)))
    }

    /// Defaults overlaid with environment variables
    pub fn from_env() -> Self {
        let mut settings = Settings::default();
        settings.apply_overrides(|name| std::env::var(name).ok());
        settings
    }

    /// Load from file if it exists, then overlay the environment and validate
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut settings = match path {
            Some(p) if p.as_ref().exists() => Self::from_file(p)?,
            Some(p) => {
                tracing::warn!(path = %p.as_ref().display(), "Settings file not found, using defaults");
                Settings::default()
            }
            None => Settings::default(),
        };
        settings.apply_overrides(|name| std::env::var(name).ok());
        settings.validate()?;
        Ok(settings)
    }

    /// Overlay `FLEET_*` variables resolved through `lookup`
    ///
    /// Unparseable numeric values are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());

        fn parsed<T: std::str::FromStr>(name: &str, value: Option<String>, target: &mut T) {
            if let Some(value) = value {
                match value.parse() {
                    Ok(v) => *target = v,
                    Err(_) => tracing::warn!(variable = name, value = %value, "Ignoring invalid override"),
                }
            }
        }

        // Server
        if let Some(host) = var("FLEET_HOST") {
            self.server.host = host;
        }
        parsed("FLEET_HTTP_PORT", var("FLEET_HTTP_PORT"), &mut self.server.http_port);

        // AppConfig
        if let Some(v) = var("FLEET_APPCONFIG_APPLICATION") {
            self.appconfig.application = v;
        }
        if let Some(v) = var("FLEET_APPCONFIG_ENVIRONMENT") {
            self.appconfig.environment = v;
        }
        if let Some(v) = var("FLEET_APPCONFIG_PROFILE") {
            self.appconfig.profile = v;
        }
        if let Some(v) = var("FLEET_APPCONFIG_ENDPOINT") {
            self.appconfig.endpoint = Some(v);
        }
        if let Some(v) = var("FLEET_CLIENT_ID") {
            self.appconfig.client_id = Some(v);
        }
        if let Some(v) = var("FLEET_REGION") {
            self.appconfig.region = v;
        }

        // Credentials
        if let Some(v) = var("FLEET_CREDENTIALS_SOURCE") {
            match v.parse() {
                Ok(kind) => self.credentials.source = kind,
                Err(e) => tracing::warn!(error = %e, "Ignoring invalid override"),
            }
        }
        if let Some(v) = var("FLEET_IMDS_ENDPOINT") {
            self.credentials.imds_endpoint = v;
        }
        parsed(
            "FLEET_CREDENTIALS_CHECK_INTERVAL",
            var("FLEET_CREDENTIALS_CHECK_INTERVAL"),
            &mut self.credentials.check_interval_seconds,
        );

        // Relay
        if let Some(v) = var("FLEET_RELAY_PROGRAM") {
            self.relay.program = v;
        }
        parsed(
            "FLEET_STORAGE_SIZE_MB",
            var("FLEET_STORAGE_SIZE_MB"),
            &mut self.relay.storage_size_mb,
        );
        parsed(
            "FLEET_SETTLE_DELAY_MS",
            var("FLEET_SETTLE_DELAY_MS"),
            &mut self.relay.settle_delay_ms,
        );

        // State and polling
        if let Some(v) = var("FLEET_STATE_DIR") {
            self.state.dir = PathBuf::from(v);
        }
        parsed(
            "FLEET_POLL_INTERVAL",
            var("FLEET_POLL_INTERVAL"),
            &mut self.poll.interval_seconds,
        );
    }

    /// Reject settings the gateway cannot run with
    pub fn validate(&self) -> Result<()> {
        if !(self.credentials.refresh_fraction > 0.0 && self.credentials.refresh_fraction < 1.0) {
            return Err(Error::Settings(format!(
                "credentials.refresh_fraction must be between 0 and 1, got {}",
                self.credentials.refresh_fraction
            )));
        }
        if self.credentials.check_interval_seconds == 0 {
            return Err(Error::Settings(
                "credentials.check_interval_seconds must be at least 1".to_string(),
            ));
        }
        if self.boot.max_attempts == 0 {
            return Err(Error::Settings("boot.max_attempts must be at least 1".to_string()));
        }
        for (name, value) in [
            ("appconfig.application", &self.appconfig.application),
            ("appconfig.environment", &self.appconfig.environment),
            ("appconfig.profile", &self.appconfig.profile),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Settings(format!("{} must not be empty", name)));
            }
        }
        self.tier_table()?;
        Ok(())
    }

    /// Configured tier table, or the standard one
    pub fn tier_table(&self) -> Result<TierTable> {
        if self.tiers.is_empty() {
            return Ok(TierTable::standard());
        }
        Ok(TierTable::new(self.tiers.clone())?)
    }

    /// Region used by the relay sink
    pub fn relay_region(&self) -> &str {
        self.relay.region.as_deref().unwrap_or(&self.appconfig.region)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.relay.settle_delay_ms)
    }

    /// `None` when polling is disabled
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll.interval_seconds > 0).then(|| Duration::from_secs(self.poll.interval_seconds))
    }

    pub fn credential_check_interval(&self) -> Duration {
        Duration::from_secs(self.credentials.check_interval_seconds)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.boot.max_attempts,
            initial_backoff: Duration::from_millis(self.boot.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.boot.max_backoff_ms),
        }
    }

    /// Configured client id, else the persisted one, else a new persisted UUID
    pub fn resolve_client_id(&self) -> Result<String> {
        if let Some(id) = self.appconfig.client_id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
            return Ok(id.to_string());
        }

        let path = self.state.client_id_path();
        match std::fs::read_to_string(&path) {
            Ok(content) if !content.trim().is_empty() => return Ok(content.trim().to_string()),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let id = uuid::Uuid::new_v4().to_string();
        std::fs::create_dir_all(&self.state.dir)?;
        std::fs::write(&path, format!("{}\n", id))?;
        tracing::info!(client_id = %id, path = %path.display(), "Generated client id");
        Ok(id)
    }
}
