//! Trace-correlated root cause analysis.
//!
//! In a trace like checkout -> payment -> inventory, a payment failure makes
//! checkout fail too. This module walks every trace touched by the pass's
//! anomalies, finds the first failure in each, and elects the root endpoint
//! by majority vote, so the incident points at payment rather than at every
//! endpoint that fell over downstream.

pub mod registry;

pub use registry::{IncidentFilter, IncidentRegistry, RegistryError};

use std::collections::{BTreeSet, HashMap};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::baseline::BaselineMap;
use crate::analysis::{Anomaly, AnomalyKind, Severity};
use crate::config::AnalysisConfig;
use crate::storage::TelemetryStore;
use crate::telemetry::TelemetryRecord;

/// Sample traces retained on an incident.
const MAX_SAMPLE_TRACES: usize = 5;

/// Incident lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Active,
    Acknowledged,
    Resolved,
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IncidentStatus::Active => "active",
            IncidentStatus::Acknowledged => "acknowledged",
            IncidentStatus::Resolved => "resolved",
        };
        f.write_str(s)
    }
}

/// The elected root of an incident.
#[derive(Debug, Clone, Serialize)]
pub struct RootCause {
    pub endpoint: String,
    pub description: String,
    /// Fraction of failing traces that voted for this endpoint.
    pub confidence: f64,
}

/// One reconstructed example trace.
#[derive(Debug, Clone, Serialize)]
pub struct TraceSample {
    pub trace_id: String,
    pub root_endpoint: String,
    pub root_status: u16,
    pub affected_chain: Vec<String>,
}

/// Trace evidence attached to an incident.
#[derive(Debug, Clone, Serialize)]
pub struct TraceCorrelation {
    pub total_traces: usize,
    pub sample_traces: Vec<TraceSample>,
}

/// A deduplicated, correlated grouping of anomalies with lifecycle state.
#[derive(Debug, Clone, Serialize)]
pub struct Incident {
    pub id: String,
    pub title: String,
    pub severity: Severity,
    pub status: IncidentStatus,
    pub root_cause: RootCause,
    pub affected_endpoints: Vec<String>,
    pub anomalies: Vec<Anomaly>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_correlation: Option<TraceCorrelation>,
    pub first_detected: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// A root-caused grouping before the registry assigns an id (or merges it
/// into an existing incident).
#[derive(Debug, Clone)]
pub struct IncidentDraft {
    pub title: String,
    pub severity: Severity,
    pub root_cause: RootCause,
    pub affected_endpoints: Vec<String>,
    pub anomalies: Vec<Anomaly>,
    pub trace_correlation: Option<TraceCorrelation>,
    pub detected_at: DateTime<Utc>,
}

/// Correlate one pass's anomalies into incident drafts.
///
/// Reads the store and baselines only; registry consultation (merge vs
/// create) happens later so a storage error here can abort the pass without
/// having touched any shared state.
pub fn correlate(
    store: &TelemetryStore,
    anomalies: &[Anomaly],
    baselines: &BaselineMap,
    cfg: &AnalysisConfig,
    now: DateTime<Utc>,
) -> Result<Vec<IncidentDraft>> {
    if anomalies.is_empty() {
        return Ok(Vec::new());
    }

    // Union of trace ids across all anomalies; BTreeSet keeps the walk
    // order deterministic.
    let trace_ids: BTreeSet<&String> = anomalies.iter().flat_map(|a| a.trace_ids.iter()).collect();

    if trace_ids.is_empty() {
        // No trace correlation possible: one incident per anomaly.
        return Ok(anomalies.iter().map(|a| simple_draft(a, now)).collect());
    }

    let mut outcomes: Vec<TraceOutcome> = Vec::new();
    for trace_id in &trace_ids {
        let records = store.query_by_trace(trace_id)?;
        if records.is_empty() {
            continue;
        }
        // Records arrive sorted by timestamp then id, so the first match is
        // the earliest failure with the tie already broken.
        let first_failure = records
            .iter()
            .find(|r| is_failure(r, baselines, cfg))
            .cloned();
        let Some(first_failure) = first_failure else {
            continue; // No failure in this trace: skip it.
        };

        let mut chain: Vec<String> = Vec::new();
        for r in &records {
            if !chain.contains(&r.endpoint) {
                chain.push(r.endpoint.clone());
            }
        }
        outcomes.push(TraceOutcome {
            trace_id: (*trace_id).clone(),
            first_failure,
            chain,
        });
    }

    if outcomes.is_empty() {
        // Every trace was clean; fall back to per-anomaly incidents.
        return Ok(anomalies.iter().map(|a| simple_draft(a, now)).collect());
    }

    // Vote: highest first-failure count wins, ties broken by the earliest
    // first-failure timestamp observed for the candidate.
    let mut votes: HashMap<&str, (usize, DateTime<Utc>)> = HashMap::new();
    for o in &outcomes {
        let entry = votes
            .entry(o.first_failure.endpoint.as_str())
            .or_insert((0, o.first_failure.timestamp));
        entry.0 += 1;
        if o.first_failure.timestamp < entry.1 {
            entry.1 = o.first_failure.timestamp;
        }
    }
    let (root_endpoint, (root_votes, _)) = votes
        .iter()
        .map(|(ep, v)| (*ep, *v))
        .max_by(|a, b| {
            (a.1 .0, std::cmp::Reverse(a.1 .1), std::cmp::Reverse(a.0))
                .cmp(&(b.1 .0, std::cmp::Reverse(b.1 .1), std::cmp::Reverse(b.0)))
        })
        .unwrap_or((anomalies[0].endpoint.as_str(), (0, now)));
    let root_endpoint = root_endpoint.to_string();
    let confidence = root_votes as f64 / outcomes.len() as f64;

    // Affected endpoints: union over traces rooted at the candidate, in
    // first-appearance order.
    let mut affected: Vec<String> = Vec::new();
    for o in outcomes
        .iter()
        .filter(|o| o.first_failure.endpoint == root_endpoint)
    {
        for ep in &o.chain {
            if !affected.contains(ep) {
                affected.push(ep.clone());
            }
        }
    }

    let (absorbed, leftover): (Vec<&Anomaly>, Vec<&Anomaly>) = anomalies
        .iter()
        .partition(|a| affected.contains(&a.endpoint));

    let severity = absorbed
        .iter()
        .map(|a| a.severity)
        .max()
        .unwrap_or_else(|| {
            anomalies
                .iter()
                .map(|a| a.severity)
                .max()
                .unwrap_or(Severity::Medium)
        });

    let dominant = dominant_anomaly(&absorbed, &root_endpoint);
    let title = match dominant {
        Some(a) => format!("{} detected in {}", a.kind, root_endpoint),
        None => format!("Service degradation detected in {root_endpoint}"),
    };
    let description = match dominant {
        Some(a) => describe(a),
        None => format!("First failure across correlated traces is {root_endpoint}"),
    };

    let sample_traces: Vec<TraceSample> = outcomes
        .iter()
        .take(MAX_SAMPLE_TRACES)
        .map(|o| TraceSample {
            trace_id: o.trace_id.clone(),
            root_endpoint: o.first_failure.endpoint.clone(),
            root_status: o.first_failure.status_code,
            affected_chain: o.chain.clone(),
        })
        .collect();

    let mut drafts = vec![IncidentDraft {
        title,
        severity,
        root_cause: RootCause {
            endpoint: root_endpoint,
            description,
            confidence,
        },
        affected_endpoints: affected,
        anomalies: absorbed.into_iter().cloned().collect(),
        trace_correlation: Some(TraceCorrelation {
            total_traces: trace_ids.len(),
            sample_traces,
        }),
        detected_at: now,
    }];

    // Anomalies on endpoints outside the correlated blast radius still
    // deserve an incident of their own.
    drafts.extend(leftover.into_iter().map(|a| simple_draft(a, now)));

    Ok(drafts)
}

struct TraceOutcome {
    trace_id: String,
    first_failure: TelemetryRecord,
    chain: Vec<String>,
}

/// A record counts as a failure when it is a 5xx, or when it ran past the
/// latency threshold for its endpoint's learned baseline.
fn is_failure(record: &TelemetryRecord, baselines: &BaselineMap, cfg: &AnalysisConfig) -> bool {
    if record.is_server_error() {
        return true;
    }
    match baselines.get(&record.endpoint) {
        Some(b) if b.latency_ms.is_finite() && b.latency_ms > 0.0 => {
            record.latency_ms > b.latency_ms * cfg.latency_multiplier
        }
        _ => false,
    }
}

/// Pick the anomaly that names the incident: the one on the root endpoint,
/// preferring error spikes over latency over silence.
fn dominant_anomaly<'a>(absorbed: &[&'a Anomaly], root: &str) -> Option<&'a Anomaly> {
    let on_root: Vec<&&Anomaly> = absorbed.iter().filter(|a| a.endpoint == root).collect();
    for kind in [AnomalyKind::ErrorSpike, AnomalyKind::Latency, AnomalyKind::Silence] {
        if let Some(a) = on_root.iter().find(|a| a.kind == kind) {
            return Some(**a);
        }
    }
    None
}

fn describe(anomaly: &Anomaly) -> String {
    match anomaly.kind {
        AnomalyKind::Latency => {
            let baseline = anomaly.baseline_ms.unwrap_or(0.0);
            let ratio = if baseline > 0.0 {
                anomaly.observed_value / baseline
            } else {
                0.0
            };
            format!(
                "Latency spike: {:.0}ms (baseline: {:.0}ms, {:.1}x slower)",
                anomaly.observed_value, baseline, ratio
            )
        }
        AnomalyKind::ErrorSpike => format!(
            "Error spike: {:.0}% error rate ({:.0} failures)",
            anomaly.error_rate.unwrap_or(0.0) * 100.0,
            anomaly.observed_value
        ),
        AnomalyKind::Silence => "Endpoint stopped responding".to_string(),
    }
}

/// Incident for a single anomaly when trace correlation is not possible.
fn simple_draft(anomaly: &Anomaly, now: DateTime<Utc>) -> IncidentDraft {
    IncidentDraft {
        title: format!("{} detected in {}", anomaly.kind, anomaly.endpoint),
        severity: anomaly.severity,
        root_cause: RootCause {
            endpoint: anomaly.endpoint.clone(),
            description: describe(anomaly),
            confidence: 1.0,
        },
        affected_endpoints: vec![anomaly.endpoint.clone()],
        anomalies: vec![anomaly.clone()],
        trace_correlation: None,
        detected_at: now,
    }
}
