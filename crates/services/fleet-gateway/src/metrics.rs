//! Metrics collection for the fleet gateway
//!
//! Counters for reconfigurations and relay launches, exposed on `/metrics`.

use std::sync::atomic::{AtomicU64, Ordering};

/// Gateway metrics collector
#[derive(Default)]
pub struct Metrics {
    /// Boots and refreshes that took the reconfiguration lock
    reconfigurations_started: AtomicU64,

    reconfigurations_succeeded: AtomicU64,

    reconfigurations_failed: AtomicU64,

    /// Triggers rejected with `ReconfigurationInProgress`
    triggers_rejected: AtomicU64,

    /// Relays that survived the liveness check
    launches_succeeded: AtomicU64,

    /// Relays that failed to spawn or died during the settle delay
    launches_failed: AtomicU64,

    /// Registry entries removed by stop_all
    processes_stopped: AtomicU64,

    credential_fetches: AtomicU64,

    /// Refreshes triggered because the fleet's credentials neared expiry
    credential_renewals: AtomicU64,

    /// Startup timestamp (unix seconds)
    startup_time: AtomicU64,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            startup_time: AtomicU64::new(unix_now()),
            ..Default::default()
        }
    }

    pub fn reconfiguration_started(&self) {
        self.reconfigurations_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconfiguration_succeeded(&self) {
        self.reconfigurations_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconfiguration_failed(&self) {
        self.reconfigurations_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn trigger_rejected(&self) {
        self.triggers_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of one start_all
    pub fn launches(&self, succeeded: usize, failed: usize) {
        self.launches_succeeded.fetch_add(succeeded as u64, Ordering::Relaxed);
        self.launches_failed.fetch_add(failed as u64, Ordering::Relaxed);
    }

    pub fn processes_stopped(&self, count: usize) {
        self.processes_stopped.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn credential_fetched(&self) {
        self.credential_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn credential_renewal(&self) {
        self.credential_renewals.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime_secs = unix_now().saturating_sub(self.startup_time.load(Ordering::Relaxed));

        MetricsSnapshot {
            reconfigurations_started: self.reconfigurations_started.load(Ordering::Relaxed),
            reconfigurations_succeeded: self.reconfigurations_succeeded.load(Ordering::Relaxed),
            reconfigurations_failed: self.reconfigurations_failed.load(Ordering::Relaxed),
            triggers_rejected: self.triggers_rejected.load(Ordering::Relaxed),
            launches_succeeded: self.launches_succeeded.load(Ordering::Relaxed),
            launches_failed: self.launches_failed.load(Ordering::Relaxed),
            processes_stopped: self.processes_stopped.load(Ordering::Relaxed),
            credential_fetches: self.credential_fetches.load(Ordering::Relaxed),
            credential_renewals: self.credential_renewals.load(Ordering::Relaxed),
            uptime_secs,
        }
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Snapshot of current metrics
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    pub reconfigurations_started: u64,
    pub reconfigurations_succeeded: u64,
    pub reconfigurations_failed: u64,
    pub triggers_rejected: u64,
    pub launches_succeeded: u64,
    pub launches_failed: u64,
    pub processes_stopped: u64,
    pub credential_fetches: u64,
    pub credential_renewals: u64,
    pub uptime_secs: u64,
}

impl MetricsSnapshot {
    /// Share of relay launches that survived the liveness check
    pub fn launch_success_rate(&self) -> f64 {
        let total = self.launches_succeeded + self.launches_failed;
        if total == 0 {
            1.0
        } else {
            self.launches_succeeded as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let snapshot = Metrics::new().snapshot();

        assert_eq!(snapshot.reconfigurations_started, 0);
        assert_eq!(snapshot.launches_succeeded, 0);
        assert_eq!(snapshot.launch_success_rate(), 1.0);
    }

    #[test]
    fn test_reconfiguration_tracking() {
        let metrics = Metrics::new();

        metrics.reconfiguration_started();
        metrics.reconfiguration_succeeded();
        metrics.reconfiguration_started();
        metrics.reconfiguration_failed();
        metrics.trigger_rejected();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.reconfigurations_started, 2);
        assert_eq!(snapshot.reconfigurations_succeeded, 1);
        assert_eq!(snapshot.reconfigurations_failed, 1);
        assert_eq!(snapshot.triggers_rejected, 1);
    }

    #[test]
    fn test_launch_tracking() {
        let metrics = Metrics::new();

        metrics.launches(3, 1);
        metrics.processes_stopped(4);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.launches_succeeded, 3);
        assert_eq!(snapshot.launches_failed, 1);
        assert_eq!(snapshot.processes_stopped, 4);
        assert!((snapshot.launch_success_rate() - 0.75).abs() < 0.01);
    }
}
