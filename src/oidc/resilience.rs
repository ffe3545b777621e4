//! Offline fallback — serve previously validated tokens when the IdP is down.
//!
//! Wraps an [`OidcClient`]. Successful validations are remembered; when the
//! IdP becomes unreachable, a remembered result is served for up to the
//! configured validity window. Unknown tokens get the anonymous result when
//! anonymous mode is on, otherwise the upstream failure propagates.
//! Recovery is detected by rate-limited health probes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use telemetry_metrics::counter;
use tracing::{info, warn};

use super::client::OidcClient;
use crate::claims::{AuthenticationResult, UserInfo};
use crate::config::ResilienceConfig;
use crate::{Error, Result};

struct CachedValidation {
    result: AuthenticationResult,
    cached_at: Instant,
}

/// Resilience wrapper around an [`OidcClient`].
pub struct ResilientOidcClient {
    inner: Arc<OidcClient>,
    config: ResilienceConfig,
    validations: DashMap<String, CachedValidation>,
    offline: AtomicBool,
    last_probe: Mutex<Option<Instant>>,
}

impl ResilientOidcClient {
    /// Wrap `inner` with the given offline-fallback policy.
    #[must_use]
    pub fn new(inner: Arc<OidcClient>, config: ResilienceConfig) -> Self {
        Self {
            inner,
            config,
            validations: DashMap::new(),
            offline: AtomicBool::new(false),
            last_probe: Mutex::new(None),
        }
    }

    /// The wrapped client.
    #[must_use]
    pub fn inner(&self) -> &Arc<OidcClient> {
        &self.inner
    }

    /// Whether the wrapper currently believes the IdP is unreachable.
    #[must_use]
    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Relaxed)
    }

    fn validity(&self) -> Duration {
        Duration::from_secs(self.config.offline_token_validity_mins * 60)
    }

    /// Validate with offline fallback.
    ///
    /// Credential failures pass straight through; infrastructure failures
    /// consult the fallback cache and anonymous mode before propagating.
    pub async fn validate_token(&self, token: &str) -> Result<AuthenticationResult> {
        match self.inner.validate_token(token).await {
            Ok(result) => {
                if self.offline.swap(false, Ordering::Relaxed) {
                    info!("identity provider reachable again, leaving offline mode");
                }
                if result.success {
                    self.validations.insert(
                        token.to_string(),
                        CachedValidation {
                            result: result.clone(),
                            cached_at: Instant::now(),
                        },
                    );
                }
                Ok(result)
            }
            Err(e) => {
                // Credential failures are not outages: a replayed or forged
                // token must never flip offline mode or earn the anonymous
                // fallback.
                if e.is_credential_failure() {
                    return Err(e);
                }

                self.note_unreachable(&e);
                self.probe_if_due().await;

                if let Some(cached) = self.validations.get(token) {
                    if cached.cached_at.elapsed() < self.validity() {
                        counter!("keycloak.offline.cache_served").increment(1);
                        return Ok(cached.result.clone().cached());
                    }
                    drop(cached);
                    self.validations.remove(token);
                }

                if self.config.anonymous_mode {
                    counter!("keycloak.offline.anonymous_served").increment(1);
                    return Ok(self.anonymous_result());
                }

                Err(e)
            }
        }
    }

    /// Health of the wrapped client; clears the offline flag on success.
    pub async fn health_check(&self) -> Result<()> {
        match self.inner.health_check().await {
            Ok(()) => {
                if self.offline.swap(false, Ordering::Relaxed) {
                    info!("identity provider recovered");
                }
                Ok(())
            }
            Err(e) => {
                self.offline.store(true, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Drop remembered validations older than the validity window.
    pub fn evict_stale(&self) -> usize {
        let validity = self.validity();
        let before = self.validations.len();
        self.validations
            .retain(|_, cached| cached.cached_at.elapsed() < validity);
        before.saturating_sub(self.validations.len())
    }

    fn note_unreachable(&self, e: &Error) {
        if !self.offline.swap(true, Ordering::Relaxed) {
            warn!(error = %e, "identity provider unreachable, entering offline mode");
        }
    }

    async fn probe_if_due(&self) {
        let due = {
            let mut last = self.last_probe.lock();
            if last.is_none_or(|at| at.elapsed() >= Duration::from_secs(self.config.probe_interval_secs))
            {
                *last = Some(Instant::now());
                true
            } else {
                false
            }
        };
        if due && self.inner.probe_idp().await.is_ok() {
            self.offline.store(false, Ordering::Relaxed);
            info!("identity provider recovered");
        }
    }

    fn anonymous_result(&self) -> AuthenticationResult {
        let user = UserInfo {
            id: "anonymous".to_string(),
            username: "anonymous".to_string(),
            permissions: self.config.anonymous_permissions.clone(),
            ..UserInfo::default()
        };
        let mut result = AuthenticationResult::ok(user, None);
        result.from_cache = true;
        result
    }
}
