//! Multi-dimensional anomaly detection over the analysis window.
//!
//! Three detectors run per endpoint with a learned baseline: latency (window
//! mean vs baseline multiple), error spike (5xx ratio), and silence (traffic
//! then nothing). The detector keeps no state between passes; everything it
//! needs is the store and the baseline snapshot.

use std::collections::BTreeSet;
use std::fmt;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::baseline::BaselineMap;
use crate::config::AnalysisConfig;
use crate::storage::TelemetryStore;
use crate::telemetry::TelemetryRecord;

/// Number of recent error messages attached to an error-spike anomaly.
const MAX_SAMPLE_ERRORS: usize = 5;

/// Window mean at or above this is critical regardless of the ratio.
const CRITICAL_LATENCY_MS: f64 = 10_000.0;

/// Severity levels, ordered so `max()` picks the worst.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// What kind of deviation a detector observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    Latency,
    ErrorSpike,
    Silence,
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AnomalyKind::Latency => "Latency spike",
            AnomalyKind::ErrorSpike => "Error spike",
            AnomalyKind::Silence => "Silence",
        };
        f.write_str(s)
    }
}

/// One atomic detection for one endpoint in one pass.
#[derive(Debug, Clone, Serialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub endpoint: String,
    pub severity: Severity,
    /// Baseline the latency detector compared against.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_ms: Option<f64>,
    /// 5xx ratio observed by the error-spike detector.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_rate: Option<f64>,
    /// Most recent record before the endpoint went silent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    /// Current window aggregate: mean latency, error count, or zero for
    /// silence.
    pub observed_value: f64,
    /// Trace ids of the records that made this anomaly trigger.
    pub trace_ids: BTreeSet<String>,
    /// Up to five most recent error messages (error spikes only).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sample_errors: Vec<String>,
    pub detected_at: DateTime<Utc>,
}

/// Run one detector pass. Output order is deterministic (endpoints sorted,
/// latency before error-spike before silence per endpoint).
pub fn detect_anomalies(
    store: &TelemetryStore,
    baselines: &BaselineMap,
    cfg: &AnalysisConfig,
    now: DateTime<Utc>,
) -> Result<Vec<Anomaly>> {
    let window_start = now - Duration::seconds(cfg.analysis_window_secs as i64);
    let silence_start = now - Duration::seconds(cfg.silence_threshold_secs as i64);
    let baseline_start = now - Duration::seconds(cfg.baseline_window_secs as i64);

    let mut endpoints: Vec<&String> = baselines.keys().collect();
    endpoints.sort();

    let mut anomalies = Vec::new();

    for endpoint in endpoints {
        let baseline = baselines[endpoint.as_str()];
        // A zero or non-finite baseline cannot be compared against.
        if !baseline.latency_ms.is_finite() || baseline.latency_ms <= 0.0 {
            continue;
        }

        let records = store.query_endpoint_window(endpoint, window_start, now)?;

        if !records.is_empty() {
            if let Some(a) = check_latency(endpoint, &records, baseline.latency_ms, cfg, now) {
                anomalies.push(a);
            }
            if let Some(a) = check_error_spike(endpoint, &records, cfg, now) {
                anomalies.push(a);
            }
        }

        // Silence: nothing in the silence window, but traffic existed before
        // it within the baseline window. Checked independently of the
        // analysis window, which may be configured wider or narrower.
        let recent = store.count_in_window(endpoint, silence_start, now)?;
        if recent == 0 {
            let prior = store.count_in_window(endpoint, baseline_start, silence_start)?;
            if prior > 0 {
                anomalies.push(Anomaly {
                    kind: AnomalyKind::Silence,
                    endpoint: endpoint.clone(),
                    severity: Severity::High,
                    baseline_ms: None,
                    error_rate: None,
                    last_seen: store.last_seen(endpoint)?,
                    observed_value: 0.0,
                    trace_ids: BTreeSet::new(),
                    sample_errors: Vec::new(),
                    detected_at: now,
                });
            }
        }
    }

    Ok(anomalies)
}

/// Latency severity from the window/baseline ratio, with an absolute
/// escape hatch for means that are catastrophic no matter the baseline.
fn latency_severity(ratio: f64, mean_ms: f64) -> Severity {
    if ratio >= 20.0 || mean_ms >= CRITICAL_LATENCY_MS {
        Severity::Critical
    } else if ratio >= 10.0 {
        Severity::High
    } else if ratio >= 5.0 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

fn check_latency(
    endpoint: &str,
    records: &[TelemetryRecord],
    baseline_ms: f64,
    cfg: &AnalysisConfig,
    now: DateTime<Utc>,
) -> Option<Anomaly> {
    // Deliberately includes error responses: slow-failure modes should
    // count toward the window mean.
    if records.len() < cfg.min_analysis_samples {
        return None;
    }
    let mean = records.iter().map(|r| r.latency_ms).sum::<f64>() / records.len() as f64;
    if mean <= baseline_ms * cfg.latency_multiplier {
        return None;
    }

    Some(Anomaly {
        kind: AnomalyKind::Latency,
        endpoint: endpoint.to_string(),
        severity: latency_severity(mean / baseline_ms, mean),
        baseline_ms: Some(baseline_ms),
        error_rate: None,
        last_seen: None,
        observed_value: mean,
        trace_ids: records.iter().map(|r| r.trace_id.clone()).collect(),
        sample_errors: Vec::new(),
        detected_at: now,
    })
}

fn check_error_spike(
    endpoint: &str,
    records: &[TelemetryRecord],
    cfg: &AnalysisConfig,
    now: DateTime<Utc>,
) -> Option<Anomaly> {
    if records.len() < cfg.min_analysis_samples {
        return None;
    }
    let errors: Vec<&TelemetryRecord> = records.iter().filter(|r| r.is_server_error()).collect();
    let rate = errors.len() as f64 / records.len() as f64;
    if rate <= cfg.error_rate_threshold {
        return None;
    }

    // Most recent messages first; records arrive chronologically.
    let sample_errors: Vec<String> = errors
        .iter()
        .rev()
        .filter_map(|r| r.error_message.clone())
        .take(MAX_SAMPLE_ERRORS)
        .collect();

    let severity = if rate > 0.5 {
        Severity::Critical
    } else {
        Severity::High
    };

    Some(Anomaly {
        kind: AnomalyKind::ErrorSpike,
        endpoint: endpoint.to_string(),
        severity,
        baseline_ms: None,
        error_rate: Some(rate),
        last_seen: None,
        observed_value: errors.len() as f64,
        trace_ids: errors.iter().map(|r| r.trace_id.clone()).collect(),
        sample_errors,
        detected_at: now,
    })
}
