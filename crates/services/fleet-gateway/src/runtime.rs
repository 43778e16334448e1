//! Gateway runtime
//!
//! [`GatewayRuntime`] owns the reconfiguration lock, the process registry
//! (through the [`ProcessSupervisor`]) and the active configuration. Boot and
//! refresh are the only operations that change the fleet and both take the
//! lock with `try_lock`: a trigger arriving while another is in flight is
//! rejected, never queued.
//!
//! Refresh is all-stop-then-all-start. If loading the new configuration
//! fails after the old fleet was stopped, the fleet stays stopped and the
//! error is surfaced; the old configuration is not restarted.
//!
//! Relays keep the credentials they were launched with, so the runtime
//! watches those credentials and refreshes the whole fleet once they enter
//! the refresh window.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, MutexGuard};

use crate::config::{CredentialSourceKind, Settings};
use crate::credentials::{
    CredentialProvider, CredentialSource, Credentials, EnvCredentialSource, ImdsCredentialSource,
};
use crate::error::{Error, Result};
use crate::fleet::FleetConfiguration;
use crate::loader::{AppConfigSource, ConfigRequest, FleetConfigLoader};
use crate::metrics::Metrics;
use crate::supervisor::{
    GstKvsRelay, LaunchFailure, ProcessSnapshot, ProcessState, ProcessSupervisor, SupervisorSettings,
};

/// State guarded by the reconfiguration lock
struct FleetState {
    supervisor: ProcessSupervisor,
    active: Option<FleetConfiguration>,
    /// Credentials handed to the running relays
    launched_with: Option<Credentials>,
    last_error: Option<LastError>,
    last_reconfigured_at: Option<DateTime<Utc>>,
}

/// Most recent fleet-level failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastError {
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl From<&Error> for LastError {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
            at: Utc::now(),
        }
    }
}

/// Externally visible fleet state
#[derive(Debug, Clone, Serialize)]
pub struct FleetStatus {
    /// Version of the active configuration, `None` when no fleet is up
    pub version: Option<String>,
    /// A boot or refresh holds the lock; processes are not listed
    pub reconfiguring: bool,
    pub running: usize,
    pub processes: Vec<ProcessSnapshot>,
    pub last_error: Option<LastError>,
    pub last_reconfigured_at: Option<DateTime<Utc>>,
}

impl FleetStatus {
    fn reconfiguring() -> Self {
        Self {
            version: None,
            reconfiguring: true,
            running: 0,
            processes: Vec::new(),
            last_error: None,
            last_reconfigured_at: None,
        }
    }
}

/// Caller-side retry of boot while credentials are unavailable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(30000),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based), doubling each time
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Owns the fleet and serializes every change to it
pub struct GatewayRuntime {
    credentials: CredentialProvider,
    loader: FleetConfigLoader,
    request: ConfigRequest,
    fleet: Mutex<FleetState>,
    metrics: Arc<Metrics>,
}

impl GatewayRuntime {
    /// Create a runtime with no fleet running
    pub fn new(
        credentials: CredentialProvider,
        loader: FleetConfigLoader,
        supervisor: ProcessSupervisor,
        request: ConfigRequest,
    ) -> Self {
        Self {
            credentials,
            loader,
            request,
            fleet: Mutex::new(FleetState {
                supervisor,
                active: None,
                launched_with: None,
                last_error: None,
                last_reconfigured_at: None,
            }),
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Wire the production components described by `settings`
    ///
    /// Resolves (and on first boot persists) the client id.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let credential_source: Arc<dyn CredentialSource> = match settings.credentials.source {
            CredentialSourceKind::Imds => Arc::new(ImdsCredentialSource::new(
                settings.credentials.imds_endpoint.clone(),
                Duration::from_secs(settings.credentials.timeout_seconds),
            )?),
            CredentialSourceKind::Env => Arc::new(EnvCredentialSource),
        };
        let credentials =
            CredentialProvider::with_refresh_fraction(credential_source, settings.credentials.refresh_fraction);

        let store = AppConfigSource::new(
            settings.appconfig.region.clone(),
            settings.appconfig.endpoint.as_deref(),
            Duration::from_secs(settings.appconfig.timeout_seconds),
        )?;
        let loader = FleetConfigLoader::new(Arc::new(store), settings.state.snapshot_path());

        let relay = GstKvsRelay::new(
            settings.relay.program.clone(),
            settings.relay.storage_size_mb,
            settings.relay_region(),
        );
        let supervisor = ProcessSupervisor::new(
            Arc::new(relay),
            SupervisorSettings::under(&settings.state.dir, settings.settle_delay()),
        );

        let request = ConfigRequest::new(
            settings.appconfig.application.clone(),
            settings.appconfig.environment.clone(),
            settings.appconfig.profile.clone(),
            settings.resolve_client_id()?,
        );

        tracing::info!(
            credential_source = ?settings.credentials.source,
            application = %request.application,
            environment = %request.environment,
            profile = %request.profile,
            client_id = %request.client_id,
            state_dir = %settings.state.dir.display(),
            "Gateway runtime configured"
        );

        Ok(Self::new(credentials, loader, supervisor, request))
    }

    /// Shared metrics collector
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Identifies the configuration this runtime loads
    pub fn request(&self) -> &ConfigRequest {
        &self.request
    }

    fn lock_for_reconfiguration(&self, trigger: &'static str) -> Result<MutexGuard<'_, FleetState>> {
        self.fleet.try_lock().map_err(|_| {
            self.metrics.trigger_rejected();
            tracing::warn!(trigger = trigger, "Reconfiguration already in progress, rejecting trigger");
            Error::ReconfigurationInProgress
        })
    }

    /// Apply the current configuration (boot)
    ///
    /// Credentials, then configuration, then launch. A failure in either of
    /// the first two steps starts nothing. When a fleet is already active
    /// this only reports its status.
    pub async fn apply(&self) -> Result<FleetStatus> {
        let mut fleet = self.lock_for_reconfiguration("apply")?;

        if let Some(active) = &fleet.active {
            tracing::info!(version = %active.version, "Fleet already applied");
            return Ok(Self::status_of(&mut fleet));
        }

        tracing::info!(
            application = %self.request.application,
            environment = %self.request.environment,
            profile = %self.request.profile,
            "Applying fleet configuration"
        );
        self.metrics.reconfiguration_started();

        let result = self.boot(&mut fleet).await;
        self.finish(&mut fleet, result)
    }

    /// Reload the configuration and restart the whole fleet
    ///
    /// Credentials are acquired before anything is stopped, so a credential
    /// outage leaves the running fleet untouched.
    pub async fn refresh(&self) -> Result<FleetStatus> {
        let mut fleet = self.lock_for_reconfiguration("refresh")?;

        tracing::info!(
            active_version = ?fleet.active.as_ref().map(|c| c.version.as_str()),
            "Refreshing fleet configuration"
        );
        self.metrics.reconfiguration_started();

        let result = self.reconfigure(&mut fleet).await;
        self.finish(&mut fleet, result)
    }

    async fn boot(&self, fleet: &mut FleetState) -> Result<Vec<LaunchFailure>> {
        let credentials = self.acquire_credentials().await?;
        let config = self.loader.load(&self.request, &credentials).await?;
        self.start(fleet, config, &credentials).await
    }

    async fn reconfigure(&self, fleet: &mut FleetState) -> Result<Vec<LaunchFailure>> {
        let credentials = self.acquire_credentials().await?;

        let stopped = fleet.supervisor.stop_all();
        self.metrics.processes_stopped(stopped);
        let previous = fleet.active.take();
        fleet.launched_with = None;

        let config = match self.loader.load(&self.request, &credentials).await {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(
                    previous_version = ?previous.as_ref().map(|c| c.version.as_str()),
                    stopped = stopped,
                    error = %e,
                    "Reload failed after the fleet was stopped; fleet stays down until the next successful trigger"
                );
                return Err(e);
            }
        };

        self.start(fleet, config, &credentials).await
    }

    async fn start(
        &self,
        fleet: &mut FleetState,
        config: FleetConfiguration,
        credentials: &Credentials,
    ) -> Result<Vec<LaunchFailure>> {
        let report = fleet.supervisor.start_all(&config, credentials).await?;
        self.metrics.launches(report.running.len(), report.failed.len());

        fleet.active = Some(config);
        fleet.launched_with = Some(credentials.clone());
        fleet.last_reconfigured_at = Some(Utc::now());
        Ok(report.failed)
    }

    async fn acquire_credentials(&self) -> Result<Credentials> {
        self.metrics.credential_fetched();
        self.credentials.acquire().await
    }

    /// Record the outcome; a fleet with failed cameras still counts as applied
    fn finish(&self, fleet: &mut FleetState, result: Result<Vec<LaunchFailure>>) -> Result<FleetStatus> {
        match result {
            Ok(failures) => {
                self.metrics.reconfiguration_succeeded();
                fleet.last_error = failures
                    .into_iter()
                    .last()
                    .map(|failure| LastError::from(&Error::from(failure)));
                Ok(Self::status_of(fleet))
            }
            Err(e) => {
                self.metrics.reconfiguration_failed();
                fleet.last_error = Some(LastError::from(&e));
                Err(e)
            }
        }
    }

    /// Current fleet state; never waits on the reconfiguration lock
    pub fn status(&self) -> FleetStatus {
        match self.fleet.try_lock() {
            Ok(mut fleet) => Self::status_of(&mut fleet),
            Err(_) => FleetStatus::reconfiguring(),
        }
    }

    fn status_of(fleet: &mut FleetState) -> FleetStatus {
        let processes = fleet.supervisor.snapshot();
        FleetStatus {
            version: fleet.active.as_ref().map(|c| c.version.clone()),
            reconfiguring: false,
            running: processes.iter().filter(|p| p.state == ProcessState::Running).count(),
            processes,
            last_error: fleet.last_error.clone(),
            last_reconfigured_at: fleet.last_reconfigured_at,
        }
    }

    /// Stop the fleet, waiting for any in-flight reconfiguration first
    pub async fn shutdown(&self) -> usize {
        let mut fleet = self.fleet.lock().await;
        let stopped = fleet.supervisor.stop_all();
        self.metrics.processes_stopped(stopped);
        fleet.active = None;
        fleet.launched_with = None;
        tracing::info!(stopped = stopped, "Fleet shut down");
        stopped
    }

    /// Boot, retrying with exponential backoff while credentials are unavailable
    pub async fn boot_with_retry(&self, policy: &RetryPolicy) -> Result<FleetStatus> {
        let mut attempt = 1;
        loop {
            match self.apply().await {
                Ok(status) => return Ok(status),
                Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    tracing::warn!(
                        attempt = attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Boot failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(attempt = attempt, error = %e, "Boot failed");
                    return Err(e);
                }
            }
        }
    }

    /// Boot unless `shutdown` resolves first
    ///
    /// When the signal wins, the partially started fleet is stopped and
    /// `None` is returned.
    pub async fn boot_or_shutdown<F>(&self, policy: &RetryPolicy, shutdown: F) -> Result<Option<FleetStatus>>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.boot_with_retry(policy) => result.map(Some),
            _ = shutdown => {
                tracing::info!("Shutdown requested during boot, stopping launched relays");
                self.shutdown().await;
                Ok(None)
            }
        }
    }

    /// Refresh the fleet when the credentials its relays hold are due
    ///
    /// Returns whether a refresh ran. Skips while another reconfiguration
    /// holds the lock or no fleet is active.
    pub async fn renew_credentials_if_due(&self) -> Result<bool> {
        let remaining = {
            let Ok(fleet) = self.fleet.try_lock() else {
                return Ok(false);
            };
            if fleet.active.is_none() {
                return Ok(false);
            }
            let Some(creds) = fleet.launched_with.as_ref().filter(|c| self.credentials.is_due(c)) else {
                return Ok(false);
            };
            creds.remaining(Utc::now())
        };

        tracing::info!(
            remaining_secs = ?remaining.map(|r| r.num_seconds()),
            "Fleet credentials inside refresh window, restarting relays with fresh credentials"
        );
        self.metrics.credential_renewal();

        match self.refresh().await {
            Ok(_) => Ok(true),
            Err(Error::ReconfigurationInProgress) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Check the fleet credentials every `interval` until shutdown
    pub async fn run_credential_watch(self: Arc<Self>, interval: Duration, mut shutdown_rx: broadcast::Receiver<()>) {
        tracing::info!("Credential watch started (interval: {}s)", interval.as_secs());

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.renew_credentials_if_due().await {
                        tracing::warn!(error = %e, "Credential renewal failed");
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Credential watch shutting down");
                    break;
                }
            }
        }
    }

    /// Check the store once and refresh when the version changed
    ///
    /// Returns whether a refresh ran. Skips silently while another
    /// reconfiguration holds the lock.
    pub async fn poll_once(&self) -> Result<bool> {
        let active_version = match self.fleet.try_lock() {
            Ok(fleet) => fleet.active.as_ref().map(|c| c.version.clone()),
            Err(_) => {
                tracing::debug!("Reconfiguration in progress, skipping poll");
                return Ok(false);
            }
        };

        let credentials = self.credentials.current().await?;
        let candidate = self.loader.peek(&self.request, &credentials).await?;

        if active_version.as_deref() == Some(candidate.version.as_str()) {
            tracing::debug!(version = %candidate.version, "Configuration unchanged");
            return Ok(false);
        }

        tracing::info!(
            active_version = ?active_version,
            new_version = %candidate.version,
            "Configuration version changed"
        );

        match self.refresh().await {
            Ok(_) => Ok(true),
            Err(Error::ReconfigurationInProgress) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Run the scheduled trigger until shutdown
    pub async fn run_poll_loop(self: Arc<Self>, interval: Duration, mut shutdown_rx: broadcast::Receiver<()>) {
        tracing::info!("Configuration poll task started (interval: {}s)", interval.as_secs());

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.poll_once().await {
                        tracing::warn!(error = %e, "Configuration poll failed");
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Configuration poll task shutting down");
                    break;
                }
            }
        }
    }
}
