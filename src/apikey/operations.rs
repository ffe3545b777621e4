//! API-key validation, revocation, and security analysis.
//!
//! # Validation flow
//!
//! 1. Format check (10–200 chars, base64url charset plus `_`).
//! 2. Positive-result cache lookup by key hash.
//! 3. Repository lookup by key identifier, under a hard deadline.
//! 4. bcrypt comparison — **always**, against a fixed dummy hash when no
//!    row matched, so "unknown key" and "wrong key" are indistinguishable
//!    by timing.
//! 5. Active / revoked / expiry checks.
//! 6. Fire-and-forget usage tracking; build the normalized result.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use telemetry_metrics::counter;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::generator::{self, GeneratedKey};
use super::monitor::UsageTracker;
use super::repository::ApiKeyRecord;
use super::storage::ApiKeyStorage;
use crate::cache::{CacheService, get_sealed, namespaced_key, set_sealed};
use crate::claims::{AuthenticationResult, UserInfo, normalize};
use crate::config::ApiKeyConfig;
use crate::error::GENERIC_AUTH_FAILURE;
use crate::{Error, Result};

/// Accepted key shape: 10–200 chars of `[A-Za-z0-9_-]`.
static KEY_FORMAT: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[A-Za-z0-9_-]{10,200}$").unwrap()
});

/// Structurally valid bcrypt hash compared against when no row matches.
/// Keeps the lookup path constant-time; the preimage is irrelevant because
/// a missing row always fails regardless of the comparison outcome.
const DUMMY_HASH: &str = "$2a$10$N9qo8uLOickgx2ZMRZoMyeIjZAgcfl7p92ldGxad68LJZdL17lhWy";

/// Positive validation result plus the row id, so cache hits still feed the
/// usage tracker.
#[derive(Serialize, Deserialize)]
struct CachedValidation {
    key_id: Uuid,
    result: AuthenticationResult,
}

/// Parameters for issuing a new key.
#[derive(Debug, Clone, Default)]
pub struct CreateKeyRequest {
    /// Human-readable key name
    pub name: String,
    /// Owning user id
    pub user_id: String,
    /// Key prefix (defaults to the configured one)
    pub prefix: Option<String>,
    /// Granted scopes
    pub scopes: Vec<String>,
    /// Granted permissions
    pub permissions: Vec<String>,
    /// Expiry, if any (must be in the future)
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Free-form metadata
    pub metadata: Option<Value>,
}

/// A freshly issued key: the persisted row plus the plaintext shown once.
#[derive(Debug, Clone)]
pub struct IssuedKey {
    /// The persisted row
    pub record: ApiKeyRecord,
    /// The full key string — not recoverable after this
    pub key: String,
}

/// Parameters for revoking a key.
#[derive(Debug, Clone)]
pub struct RevocationRequest {
    /// Row id
    pub key_id: Uuid,
    /// Who is revoking
    pub revoked_by: String,
    /// Why
    pub reason: Option<String>,
    /// Extra metadata merged into the row
    pub metadata: Option<Value>,
}

/// Overall threat grading of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    /// Nothing noteworthy
    Low,
    /// Worth reviewing
    Medium,
    /// Rotation or revocation advised
    High,
    /// Immediate revocation advised
    Critical,
}

/// Security posture of a single key.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityAnalysis {
    /// Row id
    pub key_id: Uuid,
    /// Age in days
    pub age_days: i64,
    /// Lifetime usage counter
    pub usage_count: u64,
    /// Days since last use, if ever used
    pub days_since_last_use: Option<i64>,
    /// Weighted risk score feeding the threat level
    pub risk_score: u32,
    /// Overall grading
    pub threat_level: ThreatLevel,
    /// Operator guidance
    pub recommendations: Vec<String>,
}

/// Validation, revocation, and analysis over the key storage.
pub struct ApiKeyOperations {
    storage: Arc<ApiKeyStorage>,
    cache: Arc<dyn CacheService>,
    tracker: Arc<UsageTracker>,
    config: ApiKeyConfig,
}

impl ApiKeyOperations {
    /// Create the operations façade.
    #[must_use]
    pub fn new(
        storage: Arc<ApiKeyStorage>,
        cache: Arc<dyn CacheService>,
        tracker: Arc<UsageTracker>,
        config: ApiKeyConfig,
    ) -> Self {
        Self {
            storage,
            cache,
            tracker,
            config,
        }
    }

    /// Issue a new key: generate, hash, persist.
    pub async fn create_key(&self, request: CreateKeyRequest) -> Result<IssuedKey> {
        if request.name.is_empty() || request.user_id.is_empty() {
            return Err(Error::Malformed(
                "key name and owner are required".to_string(),
            ));
        }

        let GeneratedKey {
            key,
            key_identifier,
            key_preview,
            degraded,
        } = generator::generate(request.prefix.as_deref(), &self.config.default_prefix);
        if degraded {
            counter!("apikey.generated_degraded").increment(1);
        }

        let key_hash = hash_key(key.clone()).await?;

        let now = Utc::now();
        let record = ApiKeyRecord {
            id: Uuid::new_v4(),
            name: request.name,
            key_hash,
            key_identifier,
            key_preview,
            user_id: request.user_id,
            store_id: None,
            permissions: normalize(request.permissions),
            scopes: normalize(request.scopes),
            last_used_at: None,
            usage_count: 0,
            is_active: true,
            expires_at: request.expires_at,
            created_at: now,
            updated_at: now,
            revoked_at: None,
            revoked_by: None,
            metadata: request.metadata,
        };

        let record = self.storage.create(record).await?;
        info!(key_id = %record.id, user_id = %record.user_id, preview = %record.key_preview, "api key issued");
        Ok(IssuedKey { record, key })
    }

    /// Validate a presented API key.
    ///
    /// Credential failures come back as a failed [`AuthenticationResult`];
    /// repository timeouts and outages come back as `Err`.
    pub async fn validate(&self, key: &str) -> Result<AuthenticationResult> {
        if !KEY_FORMAT.is_match(key) {
            return Ok(AuthenticationResult::failed("Invalid API key format"));
        }

        let cache_key = namespaced_key("apikey:valid", key);
        if let Some(cached) = get_sealed::<CachedValidation>(self.cache.as_ref(), &cache_key).await
        {
            counter!("apikey.validation_cache_hit").increment(1);
            // a cache-served validation is still a use of the key
            self.tracker.track_usage(cached.key_id);
            return Ok(cached.result.cached());
        }

        let identifier = generator::key_identifier(key);
        let lookup = tokio::time::timeout(
            Duration::from_secs(self.config.validation_timeout_secs),
            self.storage.get_by_identifier(&identifier),
        )
        .await;
        let record = match lookup {
            Ok(result) => result?,
            Err(_) => {
                counter!("apikey.validation_timeout").increment(1);
                return Err(Error::UpstreamTimeout(
                    "key lookup exceeded deadline".to_string(),
                ));
            }
        };

        // Constant-time discipline: the bcrypt comparison always runs, even
        // when the identifier matched nothing.
        let hash = record
            .as_ref()
            .map_or_else(|| DUMMY_HASH.to_string(), |r| r.key_hash.clone());
        let matches = verify_key(key.to_string(), hash).await?;

        let Some(record) = record else {
            return Ok(AuthenticationResult::failed(GENERIC_AUTH_FAILURE));
        };
        if !matches {
            return Ok(AuthenticationResult::failed(GENERIC_AUTH_FAILURE));
        }

        if !record.is_active || record.revoked_at.is_some() {
            return Ok(AuthenticationResult::failed(format!(
                "Credential revoked: key {}",
                record.key_preview
            )));
        }
        if record.is_expired() {
            return Ok(AuthenticationResult::failed(format!(
                "Credential expired: key {}",
                record.key_preview
            )));
        }

        // Fire-and-forget; the tracker batches the actual write.
        self.tracker.track_usage(record.id);

        let user = UserInfo {
            id: record.user_id.clone(),
            username: record.name.clone(),
            roles: record.scopes.clone(),
            permissions: record.permissions.clone(),
            metadata: None,
            ..UserInfo::default()
        };
        let mut result = AuthenticationResult::ok(user, record.expires_at);
        result.scopes = Some(record.scopes.clone());

        let ttl = match record.expires_at {
            Some(expires_at) => {
                let remaining = (expires_at - Utc::now()).num_seconds().max(0) as u64;
                remaining.min(self.config.cache_ttl_secs)
            }
            None => self.config.cache_ttl_secs,
        };
        if ttl > 0 {
            let cached = CachedValidation {
                key_id: record.id,
                result: result.clone(),
            };
            set_sealed(
                self.cache.as_ref(),
                &cache_key,
                &cached,
                Duration::from_secs(ttl),
            )
            .await;
        }

        Ok(result)
    }

    /// Revoke a key. Idempotent: a second call fails with
    /// [`Error::Revoked`] and changes nothing.
    pub async fn revoke(&self, request: RevocationRequest) -> Result<()> {
        let metadata = match (&request.reason, request.metadata.clone()) {
            (Some(reason), Some(mut extra)) => {
                if let Value::Object(map) = &mut extra {
                    map.insert("revocation_reason".to_string(), json!(reason));
                }
                Some(extra)
            }
            (Some(reason), None) => Some(json!({ "revocation_reason": reason })),
            (None, extra) => extra,
        };

        let revoked = self
            .storage
            .revoke(request.key_id, &request.revoked_by, metadata)
            .await?;
        if !revoked {
            return Err(Error::Revoked(format!(
                "key {} already revoked or unknown",
                request.key_id
            )));
        }

        counter!("apikey.revoked").increment(1);
        warn!(
            event_type = "revocation",
            severity = "medium",
            key_id = %request.key_id,
            revoked_by = %request.revoked_by,
            reason = request.reason.as_deref().unwrap_or("unspecified"),
            "security event: api key revoked"
        );
        Ok(())
    }

    /// Analyze the security posture of a key. `None` when the key is unknown.
    pub async fn analyze_security(&self, key_id: Uuid) -> Result<Option<SecurityAnalysis>> {
        let Some(record) = self.storage.get_by_id(key_id).await? else {
            return Ok(None);
        };

        let age_days = record.age_days();
        let days_since_last_use = record.days_since_last_use();

        let mut risk_score = 0u32;
        if age_days > 365 {
            risk_score += 2;
        } else if age_days > 180 {
            risk_score += 1;
        }
        if record.usage_count > self.config.usage_threshold {
            risk_score += 2;
        }
        if days_since_last_use.is_some_and(|d| d > 90) {
            risk_score += 1;
        }

        let threat_level = match risk_score {
            4.. => ThreatLevel::Critical,
            3 => ThreatLevel::High,
            2 => ThreatLevel::Medium,
            _ => ThreatLevel::Low,
        };

        let mut recommendations = Vec::new();
        if matches!(threat_level, ThreatLevel::High | ThreatLevel::Critical) {
            recommendations.push("revoke this key immediately and issue a replacement".to_string());
        }
        if age_days > self.config.max_rotation_days {
            recommendations.push(format!(
                "rotate: key is {age_days} days old (policy is {} days)",
                self.config.max_rotation_days
            ));
        }
        if days_since_last_use.is_some_and(|d| d > 90) {
            recommendations.push("key is dormant; revoke if no longer needed".to_string());
        }
        if record.usage_count > self.config.usage_threshold {
            recommendations.push(format!(
                "usage ({}) exceeds the review threshold ({})",
                record.usage_count, self.config.usage_threshold
            ));
        }

        debug!(key_id = %key_id, risk_score, ?threat_level, "key security analyzed");
        Ok(Some(SecurityAnalysis {
            key_id,
            age_days,
            usage_count: record.usage_count,
            days_since_last_use,
            risk_score,
            threat_level,
            recommendations,
        }))
    }
}

/// bcrypt-hash a key off the async runtime.
async fn hash_key(key: String) -> Result<String> {
    tokio::task::spawn_blocking(move || bcrypt::hash(key, bcrypt::DEFAULT_COST))
        .await
        .map_err(|e| Error::Internal(format!("hash task failed: {e}")))?
        .map_err(|e| Error::Internal(format!("bcrypt hash failed: {e}")))
}

/// bcrypt-verify off the async runtime (CPU-bound by design).
async fn verify_key(key: String, hash: String) -> Result<bool> {
    tokio::task::spawn_blocking(move || bcrypt::verify(key, &hash))
        .await
        .map_err(|e| Error::Internal(format!("verify task failed: {e}")))?
        .map_err(|e| Error::Internal(format!("bcrypt verify failed: {e}")))
}
