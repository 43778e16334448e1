//! Error types for the fleet gateway

use camfleet_capacity_planner::CapacityError;
use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the fleet gateway
#[derive(Debug, Error)]
pub enum Error {
    /// No capacity tier can hold the fleet (provisioning time)
    #[error(transparent)]
    CapacityExceeded(#[from] CapacityError),

    /// Credentials could not be obtained from the identity endpoint
    #[error("Credentials unavailable: {0}")]
    CredentialUnavailable(String),

    /// Configuration store unreachable or returned an error
    #[error("Configuration fetch failed: {0}")]
    ConfigFetch(String),

    /// Configuration document violates the fleet schema
    #[error("Configuration rejected: {0}")]
    ConfigParse(String),

    /// A single relay failed to launch
    #[error("Stream launch failed for {sink_stream_id}: {reason}")]
    StreamLaunch {
        sink_stream_id: String,
        reason: String,
    },

    /// Another reconfiguration holds the fleet lock
    #[error("Reconfiguration already in progress")]
    ReconfigurationInProgress,

    /// Fleet start requested while processes are still registered
    #[error("Fleet still has {0} registered processes; stop it first")]
    FleetActive(usize),

    /// Invalid process state transition
    #[error("Invalid state transition for {sink_stream_id} from {from} to {to}")]
    InvalidStateTransition {
        sink_stream_id: String,
        from: String,
        to: String,
    },

    /// Gateway settings error
    #[error("Settings error: {0}")]
    Settings(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable snake_case code for API responses and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Error::CapacityExceeded(_) => "capacity_exceeded",
            Error::CredentialUnavailable(_) => "credential_unavailable",
            Error::ConfigFetch(_) => "config_fetch_error",
            Error::ConfigParse(_) => "config_parse_error",
            Error::StreamLaunch { .. } => "stream_launch_failure",
            Error::ReconfigurationInProgress => "reconfiguration_in_progress",
            Error::FleetActive(_) => "fleet_active",
            Error::InvalidStateTransition { .. } => "invalid_state_transition",
            Error::Settings(_) => "settings_error",
            Error::Io(_) => "io_error",
            Error::Json(_) => "json_error",
        }
    }

    /// Whether the trigger caller may retry with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::CredentialUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_error_is_transparent() {
        let err: Error = CapacityError::CapacityExceeded {
            camera_count: 9,
            largest_capacity: Some(8),
        }
        .into();
        assert_eq!(err.kind(), "capacity_exceeded");
        assert_eq!(err.to_string(), "Capacity exceeded: 9 cameras, largest tier holds 8");
    }

    #[test]
    fn test_only_credentials_are_retryable() {
        assert!(Error::CredentialUnavailable("timeout".into()).is_retryable());
        assert!(!Error::ConfigFetch("timeout".into()).is_retryable());
        assert!(!Error::ReconfigurationInProgress.is_retryable());
    }
}
