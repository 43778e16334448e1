//! Fleet trigger handlers

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use super::AppState;
use crate::error::Error;
use crate::runtime::FleetStatus;

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// HTTP status for a fleet-level error
pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::ReconfigurationInProgress => StatusCode::CONFLICT,
        Error::CredentialUnavailable(_) | Error::ConfigFetch(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::ConfigParse(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: &Error) -> Response {
    (
        status_for(error),
        Json(ErrorResponse {
            error: error.kind().to_string(),
            message: error.to_string(),
        }),
    )
        .into_response()
}

fn trigger_response(result: Result<crate::error::Result<FleetStatus>, tokio::task::JoinError>) -> Response {
    match result {
        Ok(Ok(status)) => Json(status).into_response(),
        Ok(Err(e)) => error_response(&e),
        Err(e) => {
            tracing::error!(error = %e, "Reconfiguration task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "internal_error".to_string(),
                    message: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

// Reconfigurations run on their own task so a client disconnect cannot
// cancel one between stopping the old fleet and starting the new one.

/// Apply the current configuration
///
/// POST /api/fleet/apply
pub async fn apply(State(state): State<AppState>) -> Response {
    let runtime = state.runtime.clone();
    trigger_response(tokio::spawn(async move { runtime.apply().await }).await)
}

/// Reload the configuration and restart the fleet
///
/// POST /api/fleet/refresh
pub async fn refresh(State(state): State<AppState>) -> Response {
    let runtime = state.runtime.clone();
    trigger_response(tokio::spawn(async move { runtime.refresh().await }).await)
}

/// GET /api/fleet/status
pub async fn status(State(state): State<AppState>) -> Json<FleetStatus> {
    Json(state.runtime.status())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(status_for(&Error::ReconfigurationInProgress), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&Error::CredentialUnavailable("down".to_string())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&Error::ConfigFetch("timeout".to_string())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&Error::ConfigParse("duplicate sink_stream_id cam-1".to_string())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(status_for(&Error::FleetActive(2)), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
