//! Relay error taxonomy.
//!
//! Every failure a relay operation can surface is terminal for the HTTP
//! exchange that triggered it and maps directly to a status code at the
//! boundary — no internal retries. Authorization failures deliberately
//! collapse into [`RelayError::NotFound`] so callers cannot probe for the
//! existence of tunnels or requests they don't own.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Terminal errors for a single relay operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Tunnel or request missing — or the caller isn't authorized to see it.
    NotFound,
    /// Tunnel exists but has been deactivated.
    Gone,
    /// Owner (or the anonymous slot) is at its active-tunnel capacity.
    QuotaExceeded,
    /// Tunnel exceeded its requests-per-minute budget.
    RateLimited,
    /// Request or response exceeds the payload ceiling.
    PayloadTooLarge,
    /// No response arrived within the wait budget.
    GatewayTimeout,
    /// The agent reported (or the relay inferred) a failed upstream call.
    BadGateway,
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Gone => StatusCode::GONE,
            Self::QuotaExceeded => StatusCode::FORBIDDEN,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::BadGateway => StatusCode::BAD_GATEWAY,
        }
    }

    /// Human-readable detail included in the JSON error body.
    pub fn message(&self) -> &'static str {
        match self {
            Self::NotFound => "Tunnel not found",
            Self::Gone => "Tunnel is no longer active",
            Self::QuotaExceeded => "Active tunnel limit reached",
            Self::RateLimited => "Tunnel request budget exceeded, slow down",
            Self::PayloadTooLarge => "Payload exceeds the size ceiling",
            Self::GatewayTimeout => {
                "The tunnel did not respond in time. Make sure your agent is running."
            }
            Self::BadGateway => "The tunnel agent could not complete the request",
        }
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for RelayError {}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error = status
            .canonical_reason()
            .unwrap_or("Error");
        (status, Json(json!({"error": error, "message": self.message()}))).into_response()
    }
}
