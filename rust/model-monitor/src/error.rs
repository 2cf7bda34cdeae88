use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, MonitorError>;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed")]
    Auth,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store write failed: {0}")]
    StoreWrite(String),

    #[error("store read failed: {0}")]
    StoreRead(String),

    #[error("probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    #[error("probe failed: {0}")]
    Probe(String),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl MonitorError {
    /// Transient failures are absorbed by the monitor loop instead of halting it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MonitorError::StoreWrite(_)
                | MonitorError::StoreRead(_)
                | MonitorError::ProbeTimeout(_)
                | MonitorError::Probe(_)
        )
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for MonitorError {
    fn into_response(self) -> Response {
        let status = match self {
            MonitorError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            MonitorError::Auth => StatusCode::UNAUTHORIZED,
            MonitorError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            MonitorError::NotFound(_) => StatusCode::NOT_FOUND,
            MonitorError::StoreWrite(_) | MonitorError::StoreRead(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            MonitorError::ProbeTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            MonitorError::Probe(_) => StatusCode::BAD_GATEWAY,
            MonitorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!(error = %self, "request failed");
        }

        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
