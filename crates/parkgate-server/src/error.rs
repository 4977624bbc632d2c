use axum::http::StatusCode;
use parkgate_kernel::CryptoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("envelope corrupt: {0}")]
    EnvelopeCorrupt(String),
    #[error("access token rejected by platform (errcode {0})")]
    TokenExpired(i64),
    #[error("rate limited by platform (errcode {0})")]
    RateLimited(i64),
    #[error("platform error {code}: {msg}")]
    Platform { code: i64, msg: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::AuthenticationFailed => StatusCode::UNAUTHORIZED,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::Invalid(_) | GatewayError::EnvelopeCorrupt(_) => StatusCode::BAD_REQUEST,
            GatewayError::TokenExpired(_)
            | GatewayError::RateLimited(_)
            | GatewayError::Platform { .. }
            | GatewayError::Transient(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Non-zero code for the agent-facing `{code, msg}` envelope.
    pub fn code(&self) -> i32 {
        i32::from(self.status().as_u16())
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(e: rusqlite::Error) -> Self {
        GatewayError::Storage(e.to_string())
    }
}

impl From<CryptoError> for GatewayError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::AuthenticationFailed => GatewayError::AuthenticationFailed,
            CryptoError::EnvelopeCorrupt(reason) => GatewayError::EnvelopeCorrupt(reason),
            CryptoError::InvalidKey(reason) => GatewayError::Invalid(reason),
        }
    }
}
