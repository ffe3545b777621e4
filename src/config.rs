//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Audiences the multi-client factory knows how to wire from the environment.
pub const KNOWN_AUDIENCES: &[&str] = &["frontend", "service", "websocket", "admin", "tracker"];

/// Audiences that must carry a client secret (confidential clients).
const CONFIDENTIAL_AUDIENCES: &[&str] = &["service", "admin"];

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Identity provider base URL, e.g. `https://iam.example.com`
    pub server_url: String,
    /// Realm (IdP logical tenant; part of the issuer URL)
    pub realm: String,
    /// Named client configurations, keyed by audience
    pub clients: HashMap<String, ClientConfig>,
    /// Token validation configuration
    pub validation: ValidationConfig,
    /// Discovery document / JWKS configuration
    pub discovery: DiscoveryConfig,
    /// Outbound HTTP configuration
    pub http: HttpConfig,
    /// Admin-token provider configuration
    pub admin: AdminConfig,
    /// API-key subsystem configuration
    pub api_key: ApiKeyConfig,
    /// Usage tracking and health monitoring configuration
    pub monitor: MonitorConfig,
    /// Entropy self-test configuration
    pub entropy: EntropyConfig,
    /// Offline-fallback configuration
    pub resilience: ResilienceConfig,
}

/// Per-audience OIDC client configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ClientConfig {
    /// OAuth2 `client_id`
    pub client_id: String,
    /// OAuth2 `client_secret` (absent for public clients)
    pub client_secret: Option<String>,
    /// Redirect URI recorded for the authorization-code flow
    pub redirect_uri: Option<String>,
    /// Scopes requested on grants
    pub scopes: Vec<String>,
}

impl ClientConfig {
    /// Whether this client carries a secret (confidential client).
    #[must_use]
    pub fn is_confidential(&self) -> bool {
        self.client_secret.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// Token validation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Clock-skew tolerance for `exp`/`iat`/`nbf` checks
    pub clock_skew_secs: u64,
    /// Reject tokens whose `iss` does not match the discovered issuer
    pub validate_issuer: bool,
    /// Upper bound on accepted token length
    pub max_token_length: usize,
    /// Enable the `(jti, iat)` replay cache
    pub replay_cache: bool,
    /// TTL for cached userinfo responses
    pub userinfo_cache_secs: u64,
    /// How long a negative introspection result is cached
    pub introspection_negative_cache_secs: u64,
    /// Upper bound on cached validation results
    pub max_cache_entries: usize,
    /// Fraction of `max_cache_entries` that schedules a cleanup
    pub cleanup_threshold: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            clock_skew_secs: 30,
            validate_issuer: false,
            max_token_length: 8192,
            replay_cache: true,
            userinfo_cache_secs: 300,
            introspection_negative_cache_secs: 60,
            max_cache_entries: 10_000,
            cleanup_threshold: 0.8,
        }
    }
}

/// Discovery and JWKS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// TTL for the cached discovery document
    pub ttl_secs: u64,
    /// Minimum interval between forced JWKS refreshes (unknown `kid`)
    pub jwks_cooldown_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            jwks_cooldown_secs: 30,
        }
    }
}

/// Outbound HTTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Deadline for IdP calls (discovery, token, introspection, admin)
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

impl HttpConfig {
    /// Deadline as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Admin-token provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Scopes requested on the client-credentials grant
    pub required_scopes: Vec<String>,
    /// Refresh this many seconds before the token expires
    pub refresh_margin_secs: u64,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            required_scopes: vec![
                "manage-users".to_string(),
                "manage-realm".to_string(),
                "view-users".to_string(),
                "view-realm".to_string(),
            ],
            refresh_margin_secs: 30,
        }
    }
}

/// API-key subsystem configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKeyConfig {
    /// Default key prefix when the caller supplies none
    pub default_prefix: String,
    /// Persistence retry attempts
    pub retry_attempts: u32,
    /// Base delay for linear retry backoff
    pub retry_delay_secs: u64,
    /// TTL for cached key rows
    pub cache_ttl_secs: u64,
    /// Upper bound on live cache entries
    pub max_cache_entries: usize,
    /// Fraction of `max_cache_entries` that schedules a cleanup
    pub cleanup_threshold: f64,
    /// Deadline for the validation-path repository lookup
    pub validation_timeout_secs: u64,
    /// Recent-usage count above which a key is considered high-risk
    pub usage_threshold: u64,
    /// Days after which rotation is recommended
    pub max_rotation_days: i64,
}

impl Default for ApiKeyConfig {
    fn default() -> Self {
        Self {
            default_prefix: "ak".to_string(),
            retry_attempts: 3,
            retry_delay_secs: 1,
            cache_ttl_secs: 300,
            max_cache_entries: 10_000,
            cleanup_threshold: 0.8,
            validation_timeout_secs: 5,
            usage_threshold: 100,
            max_rotation_days: 90,
        }
    }
}

/// Usage tracking and health monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Batch usage updates instead of writing per call
    pub async_updates: bool,
    /// Flush immediately once this many distinct keys are pending
    pub max_batch_size: usize,
    /// Timer-driven flush interval
    pub batch_interval_secs: u64,
    /// Continuous health-check interval
    pub health_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            async_updates: true,
            max_batch_size: 100,
            batch_interval_secs: 5,
            health_interval_secs: 30,
        }
    }
}

/// Entropy self-test configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntropyConfig {
    /// Independent generations per self-test
    pub test_count: u32,
    /// Quality score (percent) below which the source is degraded
    pub quality_threshold: f64,
    /// Average generation time above which the source is degraded
    pub max_generation_time_ms: u64,
}

impl Default for EntropyConfig {
    fn default() -> Self {
        Self {
            test_count: 5,
            quality_threshold: 80.0,
            max_generation_time_ms: 100,
        }
    }
}

/// Offline-fallback configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// How long a cached validation may be served while the IdP is down
    pub offline_token_validity_mins: u64,
    /// Minimum interval between liveness probes while offline
    pub probe_interval_secs: u64,
    /// Serve an anonymous result for unknown tokens while offline
    pub anonymous_mode: bool,
    /// Permissions granted to the anonymous result
    pub anonymous_permissions: Vec<String>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            offline_token_validity_mins: 15,
            probe_interval_secs: 30,
            anonymous_mode: false,
            anonymous_permissions: vec!["read:public".to_string()],
        }
    }
}

impl Config {
    /// Load configuration from an optional YAML file merged with
    /// `AUTHKIT_*` environment variables (nested keys split on `__`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed("AUTHKIT_").split("__"))
            .extract()
            .map_err(|e| Error::Misconfigured(format!("config parse failed: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from `KEYCLOAK_*` environment variables.
    ///
    /// Reads `KEYCLOAK_SERVER_URL`, `KEYCLOAK_REALM`, and one
    /// `KEYCLOAK_<AUDIENCE>_CLIENT_ID` / `_CLIENT_SECRET` pair per known
    /// audience. `FRONTEND_URL` and `API_BASE_URL` seed redirect URIs for
    /// the frontend and service clients. Audiences with no client ID in the
    /// environment are skipped.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let server_url = env::var("KEYCLOAK_SERVER_URL")
            .map_err(|_| Error::Misconfigured("KEYCLOAK_SERVER_URL is required".to_string()))?;
        let realm = env::var("KEYCLOAK_REALM")
            .map_err(|_| Error::Misconfigured("KEYCLOAK_REALM is required".to_string()))?;

        let frontend_url = env::var("FRONTEND_URL").ok();
        let api_base_url = env::var("API_BASE_URL").ok();

        let mut clients = HashMap::new();
        for audience in KNOWN_AUDIENCES {
            let upper = audience.to_uppercase();
            let Ok(client_id) = env::var(format!("KEYCLOAK_{upper}_CLIENT_ID")) else {
                continue;
            };
            let client_secret = env::var(format!("KEYCLOAK_{upper}_CLIENT_SECRET")).ok();
            let redirect_uri = match *audience {
                "frontend" => frontend_url.as_ref().map(|u| format!("{u}/auth/callback")),
                "service" => api_base_url.as_ref().map(|u| format!("{u}/auth/callback")),
                _ => None,
            };

            clients.insert(
                (*audience).to_string(),
                ClientConfig {
                    client_id,
                    client_secret,
                    redirect_uri,
                    scopes: vec!["openid".to_string(), "profile".to_string(), "email".to_string()],
                },
            );
        }

        let config = Self {
            server_url,
            realm,
            clients,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Expected issuer URL for this configuration.
    #[must_use]
    pub fn expected_issuer(&self) -> String {
        format!("{}/realms/{}", self.server_url.trim_end_matches('/'), self.realm)
    }

    /// Check required fields and confidential-client secrets.
    pub fn validate(&self) -> Result<()> {
        if self.server_url.is_empty() {
            return Err(Error::Misconfigured("server_url is required".to_string()));
        }
        if self.realm.is_empty() {
            return Err(Error::Misconfigured("realm is required".to_string()));
        }
        if self.clients.is_empty() {
            return Err(Error::Misconfigured(
                "at least one client must be configured".to_string(),
            ));
        }
        for audience in CONFIDENTIAL_AUDIENCES {
            if let Some(client) = self.clients.get(*audience) {
                if !client.is_confidential() {
                    return Err(Error::Misconfigured(format!(
                        "client '{audience}' is confidential and must carry a secret"
                    )));
                }
            }
        }
        Ok(())
    }
}
