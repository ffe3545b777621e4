//! Error types for authkit

use thiserror::Error;

/// Result type alias for authkit
pub type Result<T> = std::result::Result<T, Error>;

/// Authentication and authorization errors
#[derive(Error, Debug)]
pub enum Error {
    /// Input fails a structural check (token shape, API-key format, schema)
    #[error("Malformed input: {0}")]
    Malformed(String),

    /// Required option missing (client secret, redirect URI, endpoint)
    #[error("Misconfigured: {0}")]
    Misconfigured(String),

    /// Non-2xx response from the identity provider or the store
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Deadline exceeded talking to the identity provider or the store
    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// Credential exists but has been revoked
    #[error("Credential revoked: {0}")]
    Revoked(String),

    /// Credential exists but has expired
    #[error("Credential expired: {0}")]
    Expired(String),

    /// Credential exists but is not active
    #[error("Credential inactive: {0}")]
    Inactive(String),

    /// JWT `(jti, iat)` pair already seen
    #[error("Token replay detected")]
    Replay,

    /// Cache envelope checksum mismatch
    #[error("Cache integrity violation: {0}")]
    Integrity(String),

    /// Secure randomness unusable
    #[error("Entropy failure: {0}")]
    EntropyFailure(String),

    /// Duplicate key identifier / unique violation on write
    #[error("Conflict: {0}")]
    Conflict(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JWT verification error
    #[error("JWT verification failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Phrases that are safe to surface verbatim at the API boundary.
///
/// Any error message that does not start with one of these is replaced by a
/// generic fallback so internals (connection strings, row contents, bcrypt
/// details) never leak to callers.
const SAFE_PREFIXES: &[&str] = &[
    "Malformed input",
    "Misconfigured",
    "Credential revoked",
    "Credential expired",
    "Credential inactive",
    "Token replay detected",
    "Upstream timeout",
    "Authentication failed",
    "Invalid API key format",
    "Token validation failed",
];

/// Generic fallback used when a message is not on the allow-list.
pub const GENERIC_AUTH_FAILURE: &str = "Authentication failed";

impl Error {
    /// Message suitable for the API boundary.
    ///
    /// Returns the error's own message when it starts with an allow-listed
    /// phrase, otherwise [`GENERIC_AUTH_FAILURE`].
    #[must_use]
    pub fn sanitized_message(&self) -> String {
        sanitize_message(&self.to_string())
    }

    /// Whether the error marks a credential that exists but is unusable.
    #[must_use]
    pub fn is_credential_failure(&self) -> bool {
        matches!(
            self,
            Self::Revoked(_) | Self::Expired(_) | Self::Inactive(_) | Self::Replay
        )
    }
}

/// Sanitize an arbitrary message against the allow-list.
#[must_use]
pub fn sanitize_message(message: &str) -> String {
    if SAFE_PREFIXES.iter().any(|p| message.starts_with(p)) {
        message.to_string()
    } else {
        GENERIC_AUTH_FAILURE.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_messages_pass_through() {
        let err = Error::Revoked("key k1".to_string());
        assert_eq!(err.sanitized_message(), "Credential revoked: key k1");
    }

    #[test]
    fn unsafe_messages_are_replaced() {
        let err = Error::Internal("postgres://user:pass@db/keys".to_string());
        assert_eq!(err.sanitized_message(), GENERIC_AUTH_FAILURE);
    }

    #[test]
    fn replay_is_credential_failure() {
        assert!(Error::Replay.is_credential_failure());
        assert!(!Error::Internal("x".into()).is_credential_failure());
    }
}
