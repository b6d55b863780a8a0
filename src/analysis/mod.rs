//! Self-learning analysis: baseline learning and anomaly detection.
//!
//! Both passes are pure over a snapshot of the store and the current
//! baselines: they return fresh values and mutate nothing, which is what
//! lets the scheduler compute a whole pass locally before publishing any of
//! it.

pub mod baseline;
pub mod detector;

pub use baseline::{learn_baselines, Baseline, BaselineMap};
pub use detector::{detect_anomalies, Anomaly, AnomalyKind, Severity};

/// Derived per-endpoint health score in [0, 100].
///
/// `100 - 50 * error_rate - 30 * max(0, avg/baseline - 1) / 9`, clamped.
/// Without a learned baseline only the error term applies.
pub fn health_score(error_rate: f64, avg_latency_ms: f64, baseline_ms: Option<f64>) -> f64 {
    let mut score = 100.0 - 50.0 * error_rate;
    if let Some(baseline) = baseline_ms {
        if baseline > 0.0 && baseline.is_finite() && avg_latency_ms > 0.0 {
            let overage = (avg_latency_ms / baseline - 1.0).max(0.0);
            score -= 30.0 * overage / 9.0;
        }
    }
    score.clamp(0.0, 100.0)
}

/// Bucket a health score into the reported status string.
pub fn health_status(score: f64) -> &'static str {
    if score >= 90.0 {
        "healthy"
    } else if score >= 60.0 {
        "degraded"
    } else {
        "unhealthy"
    }
}
