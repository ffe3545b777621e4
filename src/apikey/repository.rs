//! API-key persistence capability.
//!
//! The [`ApiKeyRepository`] trait abstracts over storage backends. The
//! bundled [`InMemoryApiKeyRepository`] keeps two `DashMap` indices:
//!
//! - `by_id`:         row id        → record           (O(1) CRUD)
//! - `by_identifier`: key identifier → row id          (O(1) validation)
//!
//! Implementations must offer linearizable single-row semantics — the
//! revocation path relies on it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{Error, Result};

/// Persisted API-key row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    /// Row id
    pub id: Uuid,
    /// Human-readable key name
    pub name: String,
    /// bcrypt hash of the full key
    pub key_hash: String,
    /// Deterministic lookup identifier (indexed, unique among active keys)
    pub key_identifier: String,
    /// Redacted display form
    pub key_preview: String,
    /// Owning user id
    pub user_id: String,
    /// Optional tenant/store association
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_id: Option<String>,
    /// Granted permissions
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Granted scopes
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Last validation that flushed through the usage tracker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    /// Total validations flushed for this key
    #[serde(default)]
    pub usage_count: u64,
    /// Active flag; `false` implies `revoked_at` is set
    pub is_active: bool,
    /// Expiry, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
    /// Revocation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    /// Who revoked the key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_by: Option<String>,
    /// Free-form metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ApiKeyRecord {
    /// Whether the key is past its expiry.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }

    /// Whether the key can authenticate right now.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.is_active && self.revoked_at.is_none() && !self.is_expired()
    }

    /// Age in whole days.
    #[must_use]
    pub fn age_days(&self) -> i64 {
        (Utc::now() - self.created_at).num_days()
    }

    /// Days since last use, if ever used.
    #[must_use]
    pub fn days_since_last_use(&self) -> Option<i64> {
        self.last_used_at.map(|at| (Utc::now() - at).num_days())
    }
}

/// Aggregate key counts.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ApiKeyStats {
    /// All rows
    pub total: u64,
    /// Usable rows
    pub active: u64,
    /// Soft-deleted rows
    pub revoked: u64,
    /// Past-expiry rows
    pub expired: u64,
}

/// Usage aggregates derived from row state.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct UsageAnalyticsSummary {
    /// All rows
    pub total_keys: u64,
    /// Sum of usage counters
    pub total_usage: u64,
    /// Keys whose last use was today (UTC)
    pub validations_today: u64,
    /// Mean usage per key
    pub average_usage: f64,
    /// Keys unused for more than 90 days
    pub dormant_keys: u64,
}

/// Storage capability for API-key rows.
#[async_trait::async_trait]
pub trait ApiKeyRepository: Send + Sync + 'static {
    /// Insert a new row.
    ///
    /// Fails with [`Error::Conflict`] when an active row already holds the
    /// same key identifier.
    async fn insert(&self, record: ApiKeyRecord) -> Result<()>;

    /// Fetch by row id.
    async fn find_by_id(&self, id: Uuid) -> Result<Option<ApiKeyRecord>>;

    /// Fetch by key identifier (validation path).
    async fn find_by_key_identifier(&self, identifier: &str) -> Result<Option<ApiKeyRecord>>;

    /// All rows for a user.
    async fn find_by_user(&self, user_id: &str) -> Result<Vec<ApiKeyRecord>>;

    /// Usable rows for a user.
    async fn find_active_by_user(&self, user_id: &str) -> Result<Vec<ApiKeyRecord>>;

    /// Replace a row.
    async fn update(&self, record: ApiKeyRecord) -> Result<()>;

    /// Hard-delete a row. Returns whether it existed.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Atomically bump a usage counter and `last_used_at`.
    async fn increment_usage(&self, id: Uuid, by: u64) -> Result<()>;

    /// Apply one atomic increment per `(id, by)` pair.
    async fn batch_increment_usage(&self, increments: &[(Uuid, u64)]) -> Result<()>;

    /// Soft-delete: clear `is_active`, stamp `revoked_at`/`revoked_by`,
    /// merge metadata. Returns `false` when the row is missing or already
    /// inactive.
    async fn revoke_by_id(&self, id: Uuid, revoked_by: &str, metadata: Option<Value>)
    -> Result<bool>;

    /// Stamp `last_used_at` without touching the counter.
    async fn update_last_used(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Aggregate key counts.
    async fn stats(&self) -> Result<ApiKeyStats>;

    /// Usage aggregates derived from row state.
    async fn usage_analytics_summary(&self) -> Result<UsageAnalyticsSummary>;

    /// Top `limit` rows by usage counter, descending.
    async fn most_used(&self, limit: usize) -> Result<Vec<ApiKeyRecord>>;

    /// Bottom `limit` rows by usage counter, ascending.
    async fn least_used(&self, limit: usize) -> Result<Vec<ApiKeyRecord>>;

    /// Row count (also the database liveness probe).
    async fn count(&self) -> Result<u64>;
}

/// In-memory repository backed by two `DashMap` indices.
pub struct InMemoryApiKeyRepository {
    by_id: DashMap<Uuid, ApiKeyRecord>,
    by_identifier: DashMap<String, Uuid>,
}

impl InMemoryApiKeyRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
            by_identifier: DashMap::new(),
        }
    }

    fn dormant_cutoff() -> DateTime<Utc> {
        Utc::now() - chrono::Duration::days(90)
    }
}

impl Default for InMemoryApiKeyRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ApiKeyRepository for InMemoryApiKeyRepository {
    async fn insert(&self, record: ApiKeyRecord) -> Result<()> {
        if let Some(existing_id) = self.by_identifier.get(&record.key_identifier) {
            let duplicate_active = self
                .by_id
                .get(&existing_id)
                .is_some_and(|existing| existing.is_active);
            if duplicate_active {
                return Err(Error::Conflict(
                    "an active key with this identifier already exists".to_string(),
                ));
            }
        }
        self.by_identifier
            .insert(record.key_identifier.clone(), record.id);
        self.by_id.insert(record.id, record);
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ApiKeyRecord>> {
        Ok(self.by_id.get(&id).map(|r| r.clone()))
    }

    async fn find_by_key_identifier(&self, identifier: &str) -> Result<Option<ApiKeyRecord>> {
        let Some(id) = self.by_identifier.get(identifier) else {
            return Ok(None);
        };
        Ok(self.by_id.get(&id).map(|r| r.clone()))
    }

    async fn find_by_user(&self, user_id: &str) -> Result<Vec<ApiKeyRecord>> {
        Ok(self
            .by_id
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| entry.clone())
            .collect())
    }

    async fn find_active_by_user(&self, user_id: &str) -> Result<Vec<ApiKeyRecord>> {
        Ok(self
            .by_id
            .iter()
            .filter(|entry| entry.user_id == user_id && entry.is_usable())
            .map(|entry| entry.clone())
            .collect())
    }

    async fn update(&self, record: ApiKeyRecord) -> Result<()> {
        self.by_identifier
            .insert(record.key_identifier.clone(), record.id);
        self.by_id.insert(record.id, record);
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let Some((_, removed)) = self.by_id.remove(&id) else {
            return Ok(false);
        };
        self.by_identifier.remove(&removed.key_identifier);
        Ok(true)
    }

    async fn increment_usage(&self, id: Uuid, by: u64) -> Result<()> {
        if let Some(mut record) = self.by_id.get_mut(&id) {
            record.usage_count += by;
            record.last_used_at = Some(Utc::now());
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn batch_increment_usage(&self, increments: &[(Uuid, u64)]) -> Result<()> {
        for (id, by) in increments {
            self.increment_usage(*id, *by).await?;
        }
        Ok(())
    }

    async fn revoke_by_id(
        &self,
        id: Uuid,
        revoked_by: &str,
        metadata: Option<Value>,
    ) -> Result<bool> {
        let Some(mut record) = self.by_id.get_mut(&id) else {
            return Ok(false);
        };
        if !record.is_active {
            return Ok(false);
        }
        record.is_active = false;
        record.revoked_at = Some(Utc::now());
        record.revoked_by = Some(revoked_by.to_string());
        record.updated_at = Utc::now();
        if let Some(extra) = metadata {
            record.metadata = Some(merge_metadata(record.metadata.take(), extra));
        }
        Ok(true)
    }

    async fn update_last_used(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        if let Some(mut record) = self.by_id.get_mut(&id) {
            record.last_used_at = Some(at);
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn stats(&self) -> Result<ApiKeyStats> {
        let mut stats = ApiKeyStats {
            total: 0,
            active: 0,
            revoked: 0,
            expired: 0,
        };
        for entry in &self.by_id {
            stats.total += 1;
            if entry.revoked_at.is_some() {
                stats.revoked += 1;
            } else if entry.is_expired() {
                stats.expired += 1;
            } else if entry.is_active {
                stats.active += 1;
            }
        }
        Ok(stats)
    }

    async fn usage_analytics_summary(&self) -> Result<UsageAnalyticsSummary> {
        let today = Utc::now().date_naive();
        let cutoff = Self::dormant_cutoff();
        let mut summary = UsageAnalyticsSummary {
            total_keys: 0,
            total_usage: 0,
            validations_today: 0,
            average_usage: 0.0,
            dormant_keys: 0,
        };
        for entry in &self.by_id {
            summary.total_keys += 1;
            summary.total_usage += entry.usage_count;
            match entry.last_used_at {
                Some(at) if at.date_naive() == today => summary.validations_today += 1,
                Some(at) if at < cutoff => summary.dormant_keys += 1,
                None if entry.created_at < cutoff => summary.dormant_keys += 1,
                _ => {}
            }
        }
        #[allow(clippy::cast_precision_loss)]
        if summary.total_keys > 0 {
            summary.average_usage = summary.total_usage as f64 / summary.total_keys as f64;
        }
        Ok(summary)
    }

    async fn most_used(&self, limit: usize) -> Result<Vec<ApiKeyRecord>> {
        let mut rows: Vec<ApiKeyRecord> = self.by_id.iter().map(|entry| entry.clone()).collect();
        rows.sort_by(|a, b| b.usage_count.cmp(&a.usage_count));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn least_used(&self, limit: usize) -> Result<Vec<ApiKeyRecord>> {
        let mut rows: Vec<ApiKeyRecord> = self.by_id.iter().map(|entry| entry.clone()).collect();
        rows.sort_by(|a, b| a.usage_count.cmp(&b.usage_count));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.by_id.len() as u64)
    }
}

/// Shallow-merge `extra` object fields over `base`.
fn merge_metadata(base: Option<Value>, extra: Value) -> Value {
    match (base, extra) {
        (Some(Value::Object(mut base)), Value::Object(extra)) => {
            for (k, v) in extra {
                base.insert(k, v);
            }
            Value::Object(base)
        }
        (_, extra) => extra,
    }
}
