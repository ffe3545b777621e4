//! API-key storage — persistent repository plus a write-through cache.
//!
//! Writes persist first (with bounded linear-backoff retries) and then
//! invalidate the affected cache entries. Reads go cache-first through the
//! integrity envelope; a malformed or tampered envelope is a miss, never an
//! error. Cache keys: `apikey:key:<sha256(id)[..16]>` for rows,
//! `user_keys:<userId>` for per-user listings.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use super::repository::{ApiKeyRecord, ApiKeyRepository};
use crate::cache::{CacheService, get_sealed, namespaced_key, set_sealed};
use crate::config::ApiKeyConfig;
use crate::{Error, Result};

/// Row-cache namespace.
const KEY_NAMESPACE: &str = "apikey:key";

/// Write-through API-key storage.
pub struct ApiKeyStorage {
    repository: Arc<dyn ApiKeyRepository>,
    cache: Arc<dyn CacheService>,
    config: ApiKeyConfig,
}

impl ApiKeyStorage {
    /// Create storage over a repository and cache.
    #[must_use]
    pub fn new(
        repository: Arc<dyn ApiKeyRepository>,
        cache: Arc<dyn CacheService>,
        config: ApiKeyConfig,
    ) -> Self {
        Self {
            repository,
            cache,
            config,
        }
    }

    /// The underlying repository.
    #[must_use]
    pub fn repository(&self) -> &Arc<dyn ApiKeyRepository> {
        &self.repository
    }

    fn row_cache_key(id: Uuid) -> String {
        namespaced_key(KEY_NAMESPACE, &id.to_string())
    }

    fn user_cache_key(user_id: &str) -> String {
        format!("user_keys:{user_id}")
    }

    fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.config.cache_ttl_secs)
    }

    /// Persist a new key row and invalidate the owner's listing cache.
    pub async fn create(&self, record: ApiKeyRecord) -> Result<ApiKeyRecord> {
        validate_record(&record)?;

        let stored = record.clone();
        self.with_retry("apikey.insert", || {
            let record = record.clone();
            async { self.repository.insert(record).await }
        })
        .await?;

        self.cache
            .invalidate(&Self::user_cache_key(&stored.user_id))
            .await;
        debug!(key_id = %stored.id, user_id = %stored.user_id, "api key persisted");
        Ok(stored)
    }

    /// Fetch a row by id, cache-first.
    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<ApiKeyRecord>> {
        let cache_key = Self::row_cache_key(id);
        if let Some(record) = get_sealed::<ApiKeyRecord>(self.cache.as_ref(), &cache_key).await {
            return Ok(Some(record));
        }

        let record = self
            .with_retry("apikey.find_by_id", || async {
                self.repository.find_by_id(id).await
            })
            .await?;

        if let Some(record) = &record {
            set_sealed(self.cache.as_ref(), &cache_key, record, self.cache_ttl()).await;
        }
        Ok(record)
    }

    /// Fetch a row by key identifier (validation path; no caching here —
    /// the validation layer caches positive results by token hash).
    pub async fn get_by_identifier(&self, identifier: &str) -> Result<Option<ApiKeyRecord>> {
        self.with_retry("apikey.find_by_identifier", || async {
            self.repository.find_by_key_identifier(identifier).await
        })
        .await
    }

    /// All rows for a user, cache-first.
    pub async fn get_by_user(&self, user_id: &str) -> Result<Vec<ApiKeyRecord>> {
        let cache_key = Self::user_cache_key(user_id);
        if let Some(records) = get_sealed::<Vec<ApiKeyRecord>>(self.cache.as_ref(), &cache_key).await
        {
            return Ok(records);
        }

        let records = self
            .with_retry("apikey.find_by_user", || async {
                self.repository.find_by_user(user_id).await
            })
            .await?;

        set_sealed(self.cache.as_ref(), &cache_key, &records, self.cache_ttl()).await;
        Ok(records)
    }

    /// Usable rows for a user (straight from the repository).
    pub async fn get_active_by_user(&self, user_id: &str) -> Result<Vec<ApiKeyRecord>> {
        self.with_retry("apikey.find_active_by_user", || async {
            self.repository.find_active_by_user(user_id).await
        })
        .await
    }

    /// Replace a row and invalidate its cache entries.
    pub async fn update(&self, record: ApiKeyRecord) -> Result<()> {
        validate_record(&record)?;
        let id = record.id;
        let user_id = record.user_id.clone();

        self.with_retry("apikey.update", || {
            let record = record.clone();
            async { self.repository.update(record).await }
        })
        .await?;

        self.invalidate_row(id, &user_id).await;
        Ok(())
    }

    /// Soft-delete a row and invalidate its cache entries.
    ///
    /// Returns `false` when the row is missing or already inactive.
    pub async fn revoke(
        &self,
        id: Uuid,
        revoked_by: &str,
        metadata: Option<Value>,
    ) -> Result<bool> {
        let revoked = self
            .with_retry("apikey.revoke", || {
                let metadata = metadata.clone();
                async { self.repository.revoke_by_id(id, revoked_by, metadata).await }
            })
            .await?;

        if revoked {
            if let Some(record) = self.repository.find_by_id(id).await? {
                self.invalidate_row(id, &record.user_id).await;
            } else {
                self.cache.invalidate(&Self::row_cache_key(id)).await;
            }
        }
        Ok(revoked)
    }

    async fn invalidate_row(&self, id: Uuid, user_id: &str) {
        self.cache.invalidate(&Self::row_cache_key(id)).await;
        self.cache.invalidate(&Self::user_cache_key(user_id)).await;
    }

    /// Run `f` with up to `retry_attempts` tries and linear backoff
    /// (`retry_delay × attempt`). Structural errors are never retried.
    async fn with_retry<T, F, Fut>(&self, name: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if !is_retryable(&e) => return Err(e),
                Err(e) if attempt >= self.config.retry_attempts.max(1) => {
                    warn!(operation = name, attempts = attempt, error = %e, "retries exhausted");
                    return Err(e);
                }
                Err(e) => {
                    let delay = Duration::from_secs(self.config.retry_delay_secs * u64::from(attempt));
                    debug!(
                        operation = name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after backoff"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

fn is_retryable(e: &Error) -> bool {
    matches!(
        e,
        Error::Upstream(_) | Error::UpstreamTimeout(_) | Error::Io(_) | Error::Internal(_)
    )
}

fn validate_record(record: &ApiKeyRecord) -> Result<()> {
    if record.name.is_empty() {
        return Err(Error::Malformed("key name must not be empty".to_string()));
    }
    if record.user_id.is_empty() {
        return Err(Error::Malformed("key owner must not be empty".to_string()));
    }
    if record.key_hash.is_empty() {
        return Err(Error::Malformed("key hash must not be empty".to_string()));
    }
    if record.key_identifier.len() != 32 {
        return Err(Error::Malformed(
            "key identifier must be 32 characters".to_string(),
        ));
    }
    if let Some(expires_at) = record.expires_at {
        if expires_at <= Utc::now() && record.revoked_at.is_none() && record.is_active {
            return Err(Error::Malformed(
                "expiry must be in the future at issue time".to_string(),
            ));
        }
    }
    Ok(())
}
