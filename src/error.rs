//! Application-wide error types.
//!
//! Every error that can cross the gateway boundary maps to exactly one of
//! three HTTP statuses (401, 400, 500) plus a machine-readable code — see
//! [`GatewayError::http_status`] and [`GatewayError::code`]. Internal callers
//! get the full variant; external callers only ever see the mapped envelope.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Missing/malformed bearer key, or no active registration matches
    /// `(id, key)`. Key mismatch and unknown id are indistinguishable to the
    /// caller to avoid registration-id enumeration.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Malformed request body (bad JSON, empty `messages`, bad base64 file).
    #[error("validation error: {0}")]
    Validation(String),

    /// No configuration matched the resolution request.
    #[error("configuration not found: {0}")]
    ConfigurationNotFound(String),

    /// A stored provider-kind string is outside the closed set.
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),

    /// Configuration settings could not be decoded into a JSON object.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    /// Malformed ciphertext or authentication-tag failure. Swallowed by the
    /// settings layer (plaintext fallback) but surfaced to direct callers.
    #[error("decryption error: {0}")]
    Decryption(String),

    /// Upstream backend failure; `status` is the upstream HTTP status when
    /// one was received. Terminal for the current request — no retries.
    #[error("provider error{}: {message}", status.map(|s| format!(" (upstream {s})")).unwrap_or_default())]
    Provider {
        status: Option<u16>,
        message: String,
    },

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// The only three statuses the external boundary emits.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::Authentication(_) => 401,
            GatewayError::Validation(_) => 400,
            _ => 500,
        }
    }

    /// Machine-readable code for the external error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Authentication(_) => "invalid_api_key",
            GatewayError::Validation(_) => "invalid_request_error",
            GatewayError::ConfigurationNotFound(_)
            | GatewayError::UnsupportedProvider(_)
            | GatewayError::InvalidSettings(_) => "configuration_error",
            GatewayError::Provider { .. } => "provider_error",
            _ => "internal_error",
        }
    }

    /// Coarse category for the envelope's `type` field, mirroring the wire
    /// format the envelope is compatible with.
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Authentication(_) => "authentication_error",
            GatewayError::Validation(_) => "invalid_request_error",
            _ => "api_error",
        }
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(e: rusqlite::Error) -> Self {
        GatewayError::Store(e.to_string())
    }
}

impl From<r2d2::Error> for GatewayError {
    fn from(e: r2d2::Error) -> Self {
        GatewayError::Store(format!("pool: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_maps_to_401() {
        let e = GatewayError::Authentication("bad key".into());
        assert_eq!(e.http_status(), 401);
        assert_eq!(e.code(), "invalid_api_key");
        assert!(e.to_string().contains("bad key"));
    }

    #[test]
    fn validation_maps_to_400() {
        let e = GatewayError::Validation("messages must not be empty".into());
        assert_eq!(e.http_status(), 400);
        assert_eq!(e.code(), "invalid_request_error");
    }

    #[test]
    fn everything_else_maps_to_500() {
        let errors = [
            GatewayError::ConfigurationNotFound("cfg-1".into()),
            GatewayError::UnsupportedProvider("mystery".into()),
            GatewayError::Decryption("tag mismatch".into()),
            GatewayError::Provider { status: Some(502), message: "upstream down".into() },
            GatewayError::Internal("boom".into()),
        ];
        for e in errors {
            assert_eq!(e.http_status(), 500, "unexpected status for {e}");
        }
    }

    #[test]
    fn provider_error_includes_upstream_status() {
        let e = GatewayError::Provider { status: Some(429), message: "rate limited".into() };
        assert!(e.to_string().contains("429"));
        assert!(e.to_string().contains("rate limited"));
        assert_eq!(e.code(), "provider_error");
    }

    #[test]
    fn provider_error_without_status() {
        let e = GatewayError::Provider { status: None, message: "connect refused".into() };
        assert!(!e.to_string().contains("upstream"));
    }
}
