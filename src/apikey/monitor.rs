//! Usage tracking and health monitoring.
//!
//! # Usage tracking
//!
//! [`UsageTracker::track_usage`] is the hot-path entry: in async mode
//! (default) it coalesces updates into an in-memory map keyed by row id.
//! A timer flushes every `batch_interval`; hitting `max_batch_size`
//! distinct keys flushes immediately. Each flush turns N tracked calls for
//! a key into a single increment-by-N through the repository's batch
//! interface, so the persisted counter moves by exactly the number of
//! tracked calls.
//!
//! # Health monitoring
//!
//! [`HealthMonitor::perform_health_check`] probes the database (repository
//! `count()`), the entropy source, and the cache in parallel, then
//! aggregates component states into a [`SystemHealth`] with deterministic
//! recommendations.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use telemetry_metrics::counter;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::repository::ApiKeyRepository;
use crate::cache::{CacheStatsSnapshot, InMemoryCache};
use crate::config::{EntropyConfig, MonitorConfig};
use crate::entropy::{self, EntropyStatus, EntropyTestReport};

/// How many pending updates are re-queued after a failed flush.
const REQUEUE_LIMIT: usize = 10;

/// Attempts for the final shutdown flush.
const SHUTDOWN_FLUSH_ATTEMPTS: u32 = 3;

/// A coalesced usage update awaiting flush.
#[derive(Debug, Clone)]
struct PendingUsage {
    count: u64,
    last_enqueued: DateTime<Utc>,
    operation_id: Uuid,
}

/// Batched usage-counter tracker.
pub struct UsageTracker {
    repository: Arc<dyn ApiKeyRepository>,
    config: MonitorConfig,
    pending: DashMap<Uuid, PendingUsage>,
    flush_lock: tokio::sync::Mutex<()>,
    flush_trigger: Notify,
    shutdown_signal: Notify,
    flushed_total: AtomicU64,
    flush_failures: AtomicU64,
}

impl UsageTracker {
    /// Create a tracker over the repository.
    #[must_use]
    pub fn new(repository: Arc<dyn ApiKeyRepository>, config: MonitorConfig) -> Self {
        Self {
            repository,
            config,
            pending: DashMap::new(),
            flush_lock: tokio::sync::Mutex::new(()),
            flush_trigger: Notify::new(),
            shutdown_signal: Notify::new(),
            flushed_total: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
        }
    }

    /// Record one use of a key. Fast; never blocks on the repository.
    pub fn track_usage(&self, key_id: Uuid) {
        if !self.config.async_updates {
            // Synchronous mode still keeps the hot path non-blocking: the
            // single-increment write happens on a detached task.
            let repository = Arc::clone(&self.repository);
            tokio::spawn(async move {
                if let Err(e) = repository.increment_usage(key_id, 1).await {
                    warn!(key_id = %key_id, error = %e, "direct usage increment failed");
                }
            });
            return;
        }

        self.pending
            .entry(key_id)
            .and_modify(|p| {
                p.count += 1;
                p.last_enqueued = Utc::now();
            })
            .or_insert_with(|| PendingUsage {
                count: 1,
                last_enqueued: Utc::now(),
                operation_id: Uuid::new_v4(),
            });

        if self.pending.len() >= self.config.max_batch_size {
            self.flush_trigger.notify_one();
        }
    }

    /// Flush pending updates: one atomic increment-by-N per key.
    ///
    /// Returns how many keys were flushed. Failures re-queue a bounded
    /// number of updates and are counted, not propagated.
    pub async fn flush(&self) -> usize {
        let _guard = self.flush_lock.lock().await;

        let keys: Vec<Uuid> = self.pending.iter().map(|entry| *entry.key()).collect();
        if keys.is_empty() {
            return 0;
        }

        let mut drained: Vec<(Uuid, PendingUsage)> = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((id, pending)) = self.pending.remove(&key) {
                drained.push((id, pending));
            }
        }

        let increments: Vec<(Uuid, u64)> = drained.iter().map(|(id, p)| (*id, p.count)).collect();
        debug!(keys = increments.len(), "flushing usage batch");

        match self.repository.batch_increment_usage(&increments).await {
            Ok(()) => {
                self.flushed_total
                    .fetch_add(increments.len() as u64, Ordering::Relaxed);
                increments.len()
            }
            Err(e) => {
                self.flush_failures.fetch_add(1, Ordering::Relaxed);
                counter!("apikey.usage.flush_failure").increment(1);
                warn!(error = %e, keys = increments.len(), "usage flush failed, re-queueing bounded subset");

                for (id, pending) in drained.into_iter().take(REQUEUE_LIMIT) {
                    self.pending
                        .entry(id)
                        .and_modify(|p| p.count += pending.count)
                        .or_insert(pending);
                }
                0
            }
        }
    }

    /// Run the flush loop until [`shutdown`](Self::shutdown) is called.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(tracker.config.batch_interval_secs.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        tracker.flush().await;
                    }
                    () = tracker.flush_trigger.notified() => {
                        tracker.flush().await;
                    }
                    () = tracker.shutdown_signal.notified() => {
                        debug!("usage tracker loop stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the flush loop and run a final best-effort flush.
    pub async fn shutdown(&self) {
        self.shutdown_signal.notify_waiters();
        for attempt in 1..=SHUTDOWN_FLUSH_ATTEMPTS {
            self.flush().await;
            if self.pending.is_empty() {
                break;
            }
            warn!(attempt, remaining = self.pending.len(), "shutdown flush left pending updates");
            tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
        }
        info!(flushed_total = self.flushed_total(), "usage tracker shut down");
    }

    /// Keys currently awaiting flush.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Keys flushed since construction.
    #[must_use]
    pub fn flushed_total(&self) -> u64 {
        self.flushed_total.load(Ordering::Relaxed)
    }

    /// Failed flush attempts since construction.
    #[must_use]
    pub fn flush_failure_count(&self) -> u64 {
        self.flush_failures.load(Ordering::Relaxed)
    }
}

/// Health of a single component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Fully operational
    Healthy,
    /// Operational with reduced quality
    Degraded,
    /// Not operational
    Unhealthy,
}

/// System-wide health grading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemStatus {
    /// All components healthy
    Healthy,
    /// Reduced quality somewhere
    Degraded,
    /// Majority of components failing
    Unhealthy,
    /// A load-bearing component (database, entropy) is unavailable
    Critical,
}

/// Point-in-time component report.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    /// Component name (`database`, `entropy`, `cache`)
    pub name: &'static str,
    /// Grading
    pub status: HealthStatus,
    /// Human-readable detail
    pub message: String,
    /// Probe latency
    pub latency_ms: u64,
}

/// Aggregated system health.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    /// Overall grading
    pub status: SystemStatus,
    /// Per-component reports
    pub components: Vec<ComponentHealth>,
    /// Metrics snapshot (pending updates, flush failures, cache stats)
    pub metrics: serde_json::Value,
    /// Operator guidance derived from the metrics
    pub recommendations: Vec<String>,
    /// When the check ran
    pub checked_at: DateTime<Utc>,
}

/// Aggregated health checks over the API-key subsystem.
pub struct HealthMonitor {
    repository: Arc<dyn ApiKeyRepository>,
    tracker: Arc<UsageTracker>,
    cache: Arc<InMemoryCache>,
    entropy_config: EntropyConfig,
    config: MonitorConfig,
    shutdown_signal: Notify,
}

impl HealthMonitor {
    /// Create a monitor over the subsystem's components.
    #[must_use]
    pub fn new(
        repository: Arc<dyn ApiKeyRepository>,
        tracker: Arc<UsageTracker>,
        cache: Arc<InMemoryCache>,
        entropy_config: EntropyConfig,
        config: MonitorConfig,
    ) -> Self {
        Self {
            repository,
            tracker,
            cache,
            entropy_config,
            config,
            shutdown_signal: Notify::new(),
        }
    }

    /// Probe all components in parallel and aggregate.
    pub async fn perform_health_check(&self) -> SystemHealth {
        let entropy_config = self.entropy_config.clone();
        let (database, entropy_report) = tokio::join!(
            self.check_database(),
            tokio::task::spawn_blocking(move || entropy::test_entropy_source(&entropy_config)),
        );
        let entropy_report = entropy_report.unwrap_or_else(|e| {
            warn!(error = %e, "entropy self-test task failed");
            EntropyTestReport {
                status: EntropyStatus::Failed,
                test_runs: 0,
                successful_runs: 0,
                quality_score: 0.0,
                avg_generation_time_ms: 0.0,
                recommendations: vec!["entropy self-test task failed to run".to_string()],
            }
        });

        let entropy_component = ComponentHealth {
            name: "entropy",
            status: match entropy_report.status {
                EntropyStatus::Healthy => HealthStatus::Healthy,
                EntropyStatus::Degraded => HealthStatus::Degraded,
                EntropyStatus::Failed => HealthStatus::Unhealthy,
            },
            message: format!(
                "quality {:.0}%, avg {:.1}ms",
                entropy_report.quality_score, entropy_report.avg_generation_time_ms
            ),
            latency_ms: entropy_report.avg_generation_time_ms as u64,
        };

        let cache_stats = self.cache.stats();
        let cache_component = ComponentHealth {
            name: "cache",
            status: HealthStatus::Healthy,
            message: format!(
                "{} entries, hit rate {:.0}%",
                cache_stats.size,
                cache_stats.hit_rate * 100.0
            ),
            latency_ms: 0,
        };

        let components = vec![database.clone(), entropy_component, cache_component];
        let status = aggregate_status(&components, &database, entropy_report.status);

        let metrics = json!({
            "pending_usage_updates": self.tracker.pending_count(),
            "flushed_total": self.tracker.flushed_total(),
            "flush_failures": self.tracker.flush_failure_count(),
            "cache": cache_stats,
        });
        let recommendations =
            self.recommendations(&components, &entropy_report, &cache_stats);

        SystemHealth {
            status,
            components,
            metrics,
            recommendations,
            checked_at: Utc::now(),
        }
    }

    async fn check_database(&self) -> ComponentHealth {
        let started = Instant::now();
        match self.repository.count().await {
            Ok(count) => ComponentHealth {
                name: "database",
                status: HealthStatus::Healthy,
                message: format!("{count} key rows"),
                latency_ms: started.elapsed().as_millis() as u64,
            },
            Err(e) => ComponentHealth {
                name: "database",
                status: HealthStatus::Unhealthy,
                message: format!("count probe failed: {e}"),
                latency_ms: started.elapsed().as_millis() as u64,
            },
        }
    }

    fn recommendations(
        &self,
        components: &[ComponentHealth],
        entropy_report: &EntropyTestReport,
        cache_stats: &CacheStatsSnapshot,
    ) -> Vec<String> {
        let mut recommendations = Vec::new();

        if components
            .iter()
            .any(|c| c.name == "database" && c.status == HealthStatus::Unhealthy)
        {
            recommendations
                .push("database unreachable; key validation is failing open to cache".to_string());
        }
        recommendations.extend(entropy_report.recommendations.iter().cloned());

        let pending = self.tracker.pending_count();
        if pending > self.config.max_batch_size {
            recommendations.push(format!(
                "usage-update backlog ({pending}) exceeds batch size; check repository write latency"
            ));
        }
        if self.tracker.flush_failure_count() > 0 {
            recommendations.push(format!(
                "{} usage flushes have failed; usage counters may lag",
                self.tracker.flush_failure_count()
            ));
        }
        if cache_stats.hits + cache_stats.misses > 100 && cache_stats.hit_rate < 0.5 {
            recommendations
                .push("cache hit rate below 50%; consider raising the entry TTL".to_string());
        }

        recommendations
    }

    /// Run the check every `health_interval` until shutdown.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                monitor.config.health_interval_secs.max(1),
            ));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let health = monitor.perform_health_check().await;
                        if health.status != SystemStatus::Healthy {
                            warn!(status = ?health.status, "continuous health check not healthy");
                        }
                    }
                    () = monitor.shutdown_signal.notified() => {
                        debug!("health monitor loop stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the continuous monitoring loop.
    pub fn shutdown(&self) {
        self.shutdown_signal.notify_waiters();
    }
}

/// Aggregate component states into the system grading.
fn aggregate_status(
    components: &[ComponentHealth],
    database: &ComponentHealth,
    entropy: EntropyStatus,
) -> SystemStatus {
    let total = components.len().max(1);
    let unhealthy = components
        .iter()
        .filter(|c| c.status == HealthStatus::Unhealthy)
        .count();
    let degraded = components
        .iter()
        .filter(|c| c.status == HealthStatus::Degraded)
        .count();

    if database.status == HealthStatus::Unhealthy || entropy == EntropyStatus::Failed {
        return SystemStatus::Critical;
    }
    #[allow(clippy::cast_precision_loss)]
    let unhealthy_share = unhealthy as f64 / total as f64;
    #[allow(clippy::cast_precision_loss)]
    let degraded_share = degraded as f64 / total as f64;

    if unhealthy_share > 0.5 {
        SystemStatus::Unhealthy
    } else if unhealthy > 0
        || degraded_share > 0.3
        || database.status != HealthStatus::Healthy
        || entropy != EntropyStatus::Healthy
    {
        SystemStatus::Degraded
    } else {
        SystemStatus::Healthy
    }
}
