use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::security::audit_log::AuditLogger;

/// Missing or invalid settings. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("reading config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("parsing config file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("not authenticated: {0}")]
    NotAuthenticated(String),

    #[error("invalid credential")]
    InvalidCredential(#[source] UpstreamError),

    #[error("login state mismatch")]
    StateMismatch,

    #[error("no pending login for this principal")]
    NoPendingLogin,

    #[error("login request expired, start a new login")]
    LoginExpired,

    #[error("re-authentication required for {0}")]
    ReauthenticationRequired(String),

    #[error("device authorization failed: {0}")]
    DeviceFlow(String),
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream returned status {0}")]
    Status(u16),

    #[error("unexpected upstream response: {0}")]
    Response(String),

    #[error("authorization server error: {0}")]
    OAuth(#[from] crate::auth::oauth::OAuthError),
}

/// Persistence and at-rest encryption failures. Never used for "record absent".
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to decrypt credential for user {user_id} / org {org_name} (key mismatch or corrupted record)")]
    Decryption { user_id: String, org_name: String },

    #[error("failed to decrypt delegated token set for {0} (key mismatch or corrupted record)")]
    TokenSetDecryption(String),

    #[error("failed to encrypt credential")]
    Encryption,

    #[error("stored credential is corrupt: {0}")]
    Corrupt(String),

    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfirmationError {
    #[error("invalid token format")]
    Malformed,

    #[error("invalid token signature")]
    BadSignature,

    #[error("token has expired")]
    Expired,

    #[error("token has already been used")]
    AlreadyUsed,

    #[error("too many outstanding confirmations, try again later")]
    CapacityExceeded,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Confirmation(#[from] ConfirmationError),

    #[error(transparent)]
    Context(#[from] crate::security::request_context::ContextError),
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Confirmation(ConfirmationError::CapacityExceeded) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Confirmation(_) => StatusCode::BAD_REQUEST,
            GatewayError::Storage(_) | GatewayError::Config(_) | GatewayError::Context(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            AuditLogger::new().internal_error(&self.to_string());
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
