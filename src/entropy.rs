//! Entropy generation and statistical qualification.
//!
//! All secret material (API keys, session identifiers) flows through
//! [`secure_bytes`], which rejects obviously broken randomness before it can
//! become a credential. Hard failures (all-zero, all-identical, long runs)
//! drop to a hashed fallback; if even that path fails the caller receives an
//! `emergency_` marker and a loud metric, never a silent weak key.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::Rng;
use sha2::{Digest, Sha256};
use telemetry_metrics::counter;
use tracing::{debug, error, warn};

use crate::config::EntropyConfig;
use crate::{Error, Result};

/// Maximum run of identical consecutive bytes before a sample is rejected.
const MAX_IDENTICAL_RUN: usize = 5;

/// Chi-square bounds for 32-byte samples (exclusive on both ends).
const CHI_SQUARE_LOW: f64 = 100.0;
const CHI_SQUARE_HIGH: f64 = 400.0;

/// Length of the fallback key material in base64url characters.
const FALLBACK_LEN: usize = 43;

fn process_start() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

/// Statistical assessment of a random sample.
#[derive(Debug, Clone)]
pub struct QualityReport {
    /// Hard-check failure, if any (sample must not be used)
    pub hard_failure: Option<&'static str>,
    /// Soft-check warnings (sample usable, quality suspect)
    pub warnings: Vec<String>,
    /// Distinct byte values observed
    pub unique_bytes: usize,
    /// Chi-square statistic over the byte distribution (32-byte samples only)
    pub chi_square: Option<f64>,
}

impl QualityReport {
    /// Whether the sample passed every hard and soft check.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.hard_failure.is_none() && self.warnings.is_empty()
    }

    /// Whether the sample is usable at all.
    #[must_use]
    pub fn usable(&self) -> bool {
        self.hard_failure.is_none()
    }
}

/// Assess a random sample against the pattern and distribution rules.
#[must_use]
pub fn assess_quality(bytes: &[u8]) -> QualityReport {
    let mut warnings = Vec::new();

    let hard_failure = if bytes.is_empty() {
        Some("empty sample")
    } else if bytes.iter().all(|&b| b == 0) {
        Some("all bytes zero")
    } else if bytes.iter().all(|&b| b == bytes[0]) {
        Some("all bytes identical")
    } else if longest_run(bytes) >= MAX_IDENTICAL_RUN {
        Some("run of identical bytes")
    } else {
        None
    };

    let unique_bytes = {
        let mut seen = [false; 256];
        for &b in bytes {
            seen[b as usize] = true;
        }
        seen.iter().filter(|&&s| s).count()
    };

    let min_unique = (bytes.len().min(128) as f64 * 0.5).floor() as usize;
    if hard_failure.is_none() && unique_bytes < min_unique {
        warnings.push(format!(
            "low byte diversity: {unique_bytes} unique of {} (want >= {min_unique})",
            bytes.len()
        ));
    }

    let chi_square = (bytes.len() == 32).then(|| chi_square_statistic(bytes));
    if let Some(chi) = chi_square {
        if chi <= CHI_SQUARE_LOW || chi >= CHI_SQUARE_HIGH {
            warnings.push(format!("chi-square {chi:.1} outside ({CHI_SQUARE_LOW}, {CHI_SQUARE_HIGH})"));
        }
    }

    QualityReport {
        hard_failure,
        warnings,
        unique_bytes,
        chi_square,
    }
}

/// Generate `len` qualified random bytes.
///
/// # Errors
///
/// Returns [`Error::EntropyFailure`] if the sample fails a hard check; the
/// caller is expected to drop to [`fallback_material`].
pub fn secure_bytes(len: usize) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);

    if bytes.len() != len {
        return Err(Error::EntropyFailure("short read from generator".to_string()));
    }

    let quality = assess_quality(&bytes);
    if let Some(reason) = quality.hard_failure {
        return Err(Error::EntropyFailure(reason.to_string()));
    }
    for warning in &quality.warnings {
        warn!(warning = %warning, "entropy sample quality warning");
    }

    Ok(bytes)
}

/// Derive fallback key material when the primary source fails hard checks.
///
/// Hashes a mix of wall-clock time, process id, process uptime, and whatever
/// the generator still produces, then truncates the base64url digest to 43
/// characters (the width of 32 encoded bytes).
#[must_use]
pub fn fallback_material() -> String {
    counter!("entropy.fallback").increment(1);
    warn!("primary entropy failed hard checks, using hashed fallback");

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let uptime = process_start().elapsed().as_nanos();
    let mut weak = [0u8; 16];
    rand::rng().fill_bytes(&mut weak);

    let mut hasher = Sha256::new();
    hasher.update(nanos.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(uptime.to_le_bytes());
    hasher.update(weak);
    let digest = hasher.finalize();

    let mut material = URL_SAFE_NO_PAD.encode(digest);
    material.truncate(FALLBACK_LEN);
    material
}

/// Last-resort key material when even the fallback path is unusable.
#[must_use]
pub fn emergency_material() -> String {
    counter!("entropy.emergency").increment(1);
    error!("entropy fallback unusable, issuing emergency key material");

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let mix = nanos ^ u128::from(std::process::id()) ^ process_start().elapsed().as_nanos();
    format!("emergency_{mix:032x}")
}

/// Health status shared by component and system reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntropyStatus {
    /// Source passes quality and latency thresholds
    Healthy,
    /// Source works but quality or latency is below threshold
    Degraded,
    /// Source produced no successful generation
    Failed,
}

/// Outcome of an entropy self-test run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EntropyTestReport {
    /// Overall grading
    pub status: EntropyStatus,
    /// Generations attempted
    pub test_runs: u32,
    /// Generations that produced usable bytes
    pub successful_runs: u32,
    /// Percent of successful runs that also passed quality checks
    pub quality_score: f64,
    /// Mean generation latency in milliseconds
    pub avg_generation_time_ms: f64,
    /// Operator guidance derived from the metrics
    pub recommendations: Vec<String>,
}

/// Run independent 32-byte generations and grade the entropy source.
#[must_use]
pub fn test_entropy_source(config: &EntropyConfig) -> EntropyTestReport {
    let mut successful = 0u32;
    let mut quality_passes = 0u32;
    let mut total_ms = 0.0f64;

    for _ in 0..config.test_count {
        let started = Instant::now();
        let Ok(bytes) = secure_bytes(32) else {
            continue;
        };
        total_ms += started.elapsed().as_secs_f64() * 1000.0;
        successful += 1;
        if assess_quality(&bytes).passed() {
            quality_passes += 1;
        }
    }

    let quality_score = if successful == 0 {
        0.0
    } else {
        f64::from(quality_passes) / f64::from(successful) * 100.0
    };
    let avg_ms = if successful == 0 {
        0.0
    } else {
        total_ms / f64::from(successful)
    };

    let status = if successful == 0 {
        EntropyStatus::Failed
    } else if quality_score < config.quality_threshold
        || avg_ms > config.max_generation_time_ms as f64
    {
        EntropyStatus::Degraded
    } else {
        EntropyStatus::Healthy
    };

    let mut recommendations = Vec::new();
    match status {
        EntropyStatus::Failed => {
            recommendations
                .push("entropy source produced no usable samples; check OS RNG availability".to_string());
        }
        EntropyStatus::Degraded => {
            if quality_score < config.quality_threshold {
                recommendations.push(format!(
                    "quality score {quality_score:.0}% below threshold {:.0}%; investigate RNG health",
                    config.quality_threshold
                ));
            }
            if avg_ms > config.max_generation_time_ms as f64 {
                recommendations.push(format!(
                    "average generation time {avg_ms:.1}ms exceeds {}ms; host may be entropy-starved",
                    config.max_generation_time_ms
                ));
            }
        }
        EntropyStatus::Healthy => {}
    }

    debug!(
        runs = config.test_count,
        successful,
        quality_score,
        avg_ms,
        "entropy self-test complete"
    );

    EntropyTestReport {
        status,
        test_runs: config.test_count,
        successful_runs: successful,
        quality_score,
        avg_generation_time_ms: avg_ms,
        recommendations,
    }
}

/// Longest run of identical consecutive bytes.
fn longest_run(bytes: &[u8]) -> usize {
    let mut longest = 0;
    let mut current = 0;
    let mut previous = None;
    for &b in bytes {
        if previous == Some(b) {
            current += 1;
        } else {
            current = 1;
            previous = Some(b);
        }
        longest = longest.max(current);
    }
    longest
}

/// Chi-square statistic over the byte-value distribution.
fn chi_square_statistic(bytes: &[u8]) -> f64 {
    let mut observed = [0u32; 256];
    for &b in bytes {
        observed[b as usize] += 1;
    }
    let expected = bytes.len() as f64 / 256.0;
    observed
        .iter()
        .map(|&o| {
            let diff = f64::from(o) - expected;
            diff * diff / expected
        })
        .sum()
}
