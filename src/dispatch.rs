//! Credential dispatch — classify a bearer credential and route it.
//!
//! JWTs (three dot-separated base64url segments) go through the resilient
//! OIDC validator; everything else is treated as an API key. Both paths
//! yield the same normalized [`AuthenticationResult`].

use std::sync::Arc;

use crate::apikey::ApiKeyOperations;
use crate::claims::AuthenticationResult;
use crate::oidc::ResilientOidcClient;
use crate::Result;

/// What a presented credential looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// Three base64url segments: a JWT
    Jwt,
    /// Anything else: a first-party API key
    ApiKey,
}

/// Classify a bearer credential by shape.
#[must_use]
pub fn classify(credential: &str) -> CredentialKind {
    let segments: Vec<&str> = credential.split('.').collect();
    let is_jwt = segments.len() == 3
        && segments.iter().all(|s| {
            !s.is_empty()
                && s.bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        });
    if is_jwt {
        CredentialKind::Jwt
    } else {
        CredentialKind::ApiKey
    }
}

/// Routes credentials to the matching validator.
pub struct AuthDispatcher {
    oidc: Arc<ResilientOidcClient>,
    api_keys: Arc<ApiKeyOperations>,
}

impl AuthDispatcher {
    /// Create a dispatcher over the two validation paths.
    #[must_use]
    pub fn new(oidc: Arc<ResilientOidcClient>, api_keys: Arc<ApiKeyOperations>) -> Self {
        Self { oidc, api_keys }
    }

    /// Validate a bearer credential (an optional `Bearer ` prefix is
    /// stripped first).
    pub async fn authenticate(&self, credential: &str) -> Result<AuthenticationResult> {
        let credential = credential
            .strip_prefix("Bearer ")
            .or_else(|| credential.strip_prefix("bearer "))
            .unwrap_or(credential)
            .trim();

        match classify(credential) {
            CredentialKind::Jwt => self.oidc.validate_token(credential).await,
            CredentialKind::ApiKey => self.api_keys.validate(credential).await,
        }
    }
}
