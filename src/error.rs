use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Unified error type for the shop-credentials service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    // ── Caller / configuration ──────────────────────────────────────────
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("{0} not found")]
    NotFound(String),

    // ── Marketplace exchange ────────────────────────────────────────────
    #[error("Marketplace rejected credentials: {0}")]
    Auth(String),

    #[error("Auth gateway unreachable: {0}")]
    Network(String),

    #[error("Token refresh failed for shop {shop_id}: {cause}")]
    Refresh {
        shop_id: i64,
        #[source]
        cause: Box<ServiceError>,
    },

    // ── Sync state machine ──────────────────────────────────────────────
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid transition for shop {shop_id}: cannot {action} while {state}")]
    InvalidTransition {
        shop_id: i64,
        action: &'static str,
        state: &'static str,
    },

    // ── Internal ────────────────────────────────────────────────────────
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn refresh(shop_id: i64, cause: ServiceError) -> Self {
        match cause {
            // never nest refresh errors
            already @ ServiceError::Refresh { .. } => already,
            cause => ServiceError::Refresh {
                shop_id,
                cause: Box::new(cause),
            },
        }
    }

    /// Whether retrying on the next scheduled run can succeed without user action.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Network(_) | ServiceError::Database(_) => true,
            ServiceError::Refresh { cause, .. } => cause.is_retryable(),
            _ => false,
        }
    }

    /// The innermost error, unwrapping `Refresh`.
    pub fn root(&self) -> &ServiceError {
        match self {
            ServiceError::Refresh { cause, .. } => cause.root(),
            other => other,
        }
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ServiceError::Config(_) => (StatusCode::SERVICE_UNAVAILABLE, "config_error"),
            ServiceError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            ServiceError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ServiceError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            // The dashboard turns this code into a "reconnect shop" prompt.
            ServiceError::Auth(_) => (StatusCode::UNAUTHORIZED, "reauthorization_required"),
            ServiceError::Network(_) => (StatusCode::BAD_GATEWAY, "gateway_unavailable"),
            ServiceError::Refresh { cause, .. } => cause.status_and_code(),
            ServiceError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ServiceError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
            ServiceError::Encryption(_) => (StatusCode::INTERNAL_SERVER_ERROR, "encryption_error"),
            ServiceError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
            ServiceError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }

    pub fn code(&self) -> &'static str {
        self.status_and_code().1
    }
}

impl From<sqlx::Error> for ServiceError {
    fn from(e: sqlx::Error) -> Self {
        tracing::error!("Database error: {e}");
        ServiceError::Database(e.to_string())
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(e: anyhow::Error) -> Self {
        ServiceError::Internal(e.to_string())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        let body = json!({
            "error": self.to_string(),
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T, E = ServiceError> = std::result::Result<T, E>;
