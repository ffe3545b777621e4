//! Admin-token provider — cached client-credentials token with pre-expiry
//! refresh.
//!
//! Holds at most one token. Refreshes are single-flight: concurrent callers
//! during a refresh await the same in-flight grant instead of issuing N
//! parallel token requests.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::config::AdminConfig;
use crate::oidc::OidcClient;
use crate::Result;

/// Assumed lifetime when the IdP omits `expires_in`.
const DEFAULT_LIFETIME_SECS: i64 = 60;

struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

/// Cached client-credentials token for admin-API calls.
pub struct AdminTokenProvider {
    oidc: Arc<OidcClient>,
    config: AdminConfig,
    token: RwLock<Option<CachedToken>>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl AdminTokenProvider {
    /// Create a provider backed by `oidc` (a confidential client).
    #[must_use]
    pub fn new(oidc: Arc<OidcClient>, config: AdminConfig) -> Self {
        Self {
            oidc,
            config,
            token: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn cached_if_fresh(&self) -> Option<String> {
        let margin = Duration::seconds(self.config.refresh_margin_secs as i64);
        let guard = self.token.read();
        guard
            .as_ref()
            .filter(|t| Utc::now() < t.expires_at - margin)
            .map(|t| t.access_token.clone())
    }

    /// Return a token guaranteed to outlive the refresh margin.
    ///
    /// Refreshes via the client-credentials grant when the cached token is
    /// absent or within the margin of its expiry.
    pub async fn valid_token(&self) -> Result<String> {
        if let Some(token) = self.cached_if_fresh() {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;
        // A concurrent caller may have refreshed while we waited.
        if let Some(token) = self.cached_if_fresh() {
            return Ok(token);
        }

        debug!("refreshing admin token via client-credentials grant");
        let response = self
            .oidc
            .authenticate_client_credentials(Some(&self.config.required_scopes))
            .await?;

        let lifetime = response
            .expires_in
            .map_or(DEFAULT_LIFETIME_SECS, |secs| secs as i64);
        let cached = CachedToken {
            access_token: response.access_token.clone(),
            expires_at: Utc::now() + Duration::seconds(lifetime),
        };
        *self.token.write() = Some(cached);
        Ok(response.access_token)
    }

    /// Drop the cached token; the next call refreshes.
    pub fn invalidate(&self) {
        *self.token.write() = None;
    }
}
