//! Adaptive per-endpoint latency baselines.
//!
//! An EWMA over window means of successful-request latency. "Normal" drifts
//! with traffic patterns, so static thresholds are never configured; the
//! learner folds each pass's window into the running baseline with weight
//! alpha.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::AnalysisConfig;
use crate::storage::TelemetryStore;

/// Learned latency baseline for one endpoint.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Baseline {
    /// Current EWMA of successful-request latency.
    pub latency_ms: f64,
    /// Total successful observations folded in so far.
    pub sample_count: u64,
    pub updated_at: DateTime<Utc>,
}

/// Endpoint -> baseline. Published by the engine via atomic `Arc` swap;
/// never mutated in place after publication.
pub type BaselineMap = HashMap<String, Baseline>;

/// Run one learner pass and return the next baseline map.
///
/// Endpoints with fewer than `min_baseline_samples` successful records in the
/// window stay unlearned (or keep their previous baseline untouched).
/// Baselines are never deleted; an endpoint whose traffic stops keeps its
/// last value, which is what the silence detector keys off.
pub fn learn_baselines(
    store: &TelemetryStore,
    prev: &BaselineMap,
    cfg: &AnalysisConfig,
    now: DateTime<Utc>,
) -> Result<BaselineMap> {
    let since = now - Duration::seconds(cfg.baseline_window_secs as i64);
    let mut next = prev.clone();

    for endpoint in store.distinct_endpoints(since)? {
        let records = store.query_endpoint_window(&endpoint, since, now)?;
        let latencies: Vec<f64> = records
            .iter()
            .filter(|r| r.is_success())
            .map(|r| r.latency_ms)
            .collect();

        if latencies.len() < cfg.min_baseline_samples {
            continue;
        }

        let window_count = latencies.len() as u64;
        let mut window_mean = mean(&latencies);

        match prev.get(&endpoint) {
            Some(old) => {
                // One trim round: drop outliers beyond 5x the window mean,
                // then recompute. Skipped for unlearned endpoints, where a
                // spike cannot yet be told apart from the norm.
                let kept: Vec<f64> = latencies
                    .iter()
                    .copied()
                    .filter(|v| *v <= 5.0 * window_mean)
                    .collect();
                if !kept.is_empty() {
                    window_mean = mean(&kept);
                }

                let ewma = cfg.ewma_alpha * window_mean + (1.0 - cfg.ewma_alpha) * old.latency_ms;
                next.insert(
                    endpoint,
                    Baseline {
                        latency_ms: ewma,
                        sample_count: old.sample_count + window_count,
                        updated_at: now,
                    },
                );
            }
            None => {
                // First learned value is the plain window mean.
                next.insert(
                    endpoint,
                    Baseline {
                        latency_ms: window_mean,
                        sample_count: window_count,
                        updated_at: now,
                    },
                );
            }
        }
    }

    Ok(next)
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}
