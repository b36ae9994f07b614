#[cfg(feature = "http")]
use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
#[cfg(feature = "http")]
use serde::Serialize;

/// The main error type for pacekeeper operations.
///
/// Security rejections (`InvalidCredential`, `ReuseInGrace`, `TokenTheft`,
/// `Unauthorized`) carry enough detail for server-side logs, but all of them
/// render to clients as the same generic message.
#[derive(Debug, thiserror::Error)]
pub enum PacekeeperError {
    /// Not found, expired or already used. Callers never learn which.
    #[error("Invalid or expired credential")]
    InvalidCredential,

    #[error("Refresh token replayed within grace period (family {family_id})")]
    ReuseInGrace { family_id: String },

    #[error(
        "Refresh token reuse detected (family {family_id}, {sessions_invalidated} sessions invalidated)"
    )]
    TokenTheft {
        family_id: String,
        sessions_invalidated: u64,
    },

    #[error("Too many failed attempts, locked until {until}")]
    LockedOut { until: DateTime<Utc> },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Why a single-use credential lookup failed.
///
/// Only ever logged. Callers see the same `None` or
/// [`PacekeeperError::InvalidCredential`] for all three.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    NotFound,
    Expired,
    AlreadyUsed,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Expired => "expired",
            Self::AlreadyUsed => "already_used",
        }
    }
}

/// Response body for API errors.
#[cfg(feature = "http")]
#[derive(Serialize)]
pub struct ErrorResponse {
    error: String,
    error_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<i64>,
}

impl PacekeeperError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error is a rejection of presented credentials.
    pub fn is_security_rejection(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredential
                | Self::ReuseInGrace { .. }
                | Self::TokenTheft { .. }
                | Self::Unauthorized(_)
        )
    }

    /// Whether this error comes from infrastructure rather than the request.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::Config(_) | Self::Internal(_) | Self::Anyhow(_)
        )
    }

    /// HTTP status this error maps to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidCredential
            | Self::ReuseInGrace { .. }
            | Self::TokenTheft { .. }
            | Self::Unauthorized(_) => 401,
            Self::LockedOut { .. } => 429,
            Self::BadRequest(_) => 400,
            Self::Conflict(_) => 409,
            Self::Storage(_) | Self::Config(_) | Self::Internal(_) | Self::Anyhow(_) => 500,
        }
    }

    /// Returns a message that is safe to show to clients.
    ///
    /// Security rejections collapse into one message so the response cannot be
    /// used as an oracle. Server errors never expose their details.
    pub fn safe_message(&self) -> String {
        match self {
            Self::InvalidCredential
            | Self::ReuseInGrace { .. }
            | Self::TokenTheft { .. }
            | Self::Unauthorized(_) => "Invalid or expired credentials".to_string(),
            Self::LockedOut { .. } => "Too many failed attempts, try again later".to_string(),
            Self::BadRequest(msg) => format!("Bad request: {}", msg),
            Self::Conflict(msg) => format!("Conflict: {}", msg),
            Self::Storage(_) | Self::Config(_) | Self::Internal(_) | Self::Anyhow(_) => {
                "Internal server error".to_string()
            }
        }
    }

    /// Seconds until a lockout lifts, if this is a lockout.
    pub fn retry_after_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        match self {
            Self::LockedOut { until } => Some((*until - now).num_seconds().max(1)),
            _ => None,
        }
    }

    #[cfg(feature = "http")]
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

#[cfg(feature = "http")]
impl IntoResponse for PacekeeperError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_id = uuid::Uuid::new_v4().to_string();
        let retry_after = self.retry_after_seconds(Utc::now());

        if self.is_infrastructure() {
            tracing::error!(
                status = status.as_u16(),
                error_id = %error_id,
                error = %self,
                "Request failed"
            );
        } else {
            tracing::debug!(
                status = status.as_u16(),
                error_id = %error_id,
                error = %self,
                "Request rejected"
            );
        }

        let body = Json(ErrorResponse {
            error: self.safe_message(),
            error_id,
            retry_after_seconds: retry_after,
        });

        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Result type alias for pacekeeper operations
pub type Result<T> = std::result::Result<T, PacekeeperError>;
