//! In-memory incident registry with TTL expiration and lifecycle
//! transitions.
//!
//! One mutex guards the map; every operation is O(active incidents), which
//! stays small because incidents deduplicate by root endpoint. All reads
//! hand out clones, so callers see a consistent snapshot.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::analysis::Severity;
use crate::rca::{Incident, IncidentDraft, IncidentStatus};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("incident not found: {0}")]
    NotFound(String),
    #[error("incident {id} is resolved and can no longer be acknowledged")]
    AlreadyResolved { id: String },
}

/// Filter for incident listings. `None` fields match everything; by default
/// resolved incidents are hidden unless explicitly requested.
#[derive(Debug, Clone, Default)]
pub struct IncidentFilter {
    pub severity: Option<Severity>,
    pub status: Option<IncidentStatus>,
    pub endpoint: Option<String>,
}

#[derive(Default)]
struct RegistryInner {
    incidents: HashMap<String, Incident>,
    serial: u64,
}

/// Owner of all incidents. Single writer at a time (analysis pass or command
/// surface); reads are snapshot-consistent clones.
#[derive(Default)]
pub struct IncidentRegistry {
    inner: Mutex<RegistryInner>,
}

impl IncidentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a draft into the registry: merge into an active incident with the
    /// same root endpoint touched within `correlation_window`, otherwise open
    /// a new incident. Returns the stored state.
    pub fn upsert(
        &self,
        draft: IncidentDraft,
        correlation_window: Duration,
        now: DateTime<Utc>,
    ) -> Incident {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let merge_target = inner
            .incidents
            .values_mut()
            .find(|i| {
                i.status == IncidentStatus::Active
                    && i.root_cause.endpoint == draft.root_cause.endpoint
                    && now - i.last_updated <= correlation_window
            });

        if let Some(existing) = merge_target {
            existing.severity = existing.severity.max(draft.severity);
            for ep in draft.affected_endpoints {
                if !existing.affected_endpoints.contains(&ep) {
                    existing.affected_endpoints.push(ep);
                }
            }
            existing.anomalies.extend(draft.anomalies);
            existing.root_cause.description = draft.root_cause.description;
            existing.root_cause.confidence = draft.root_cause.confidence;
            if draft.trace_correlation.is_some() {
                existing.trace_correlation = draft.trace_correlation;
            }
            existing.last_updated = now;
            return existing.clone();
        }

        inner.serial += 1;
        let id = format!("INC-{}-{}", now.timestamp(), inner.serial);
        let incident = Incident {
            id: id.clone(),
            title: draft.title,
            severity: draft.severity,
            status: IncidentStatus::Active,
            root_cause: draft.root_cause,
            affected_endpoints: draft.affected_endpoints,
            anomalies: draft.anomalies,
            trace_correlation: draft.trace_correlation,
            first_detected: draft.detected_at,
            last_updated: now,
            resolution_note: None,
            resolved_at: None,
        };
        inner.incidents.insert(id.clone(), incident.clone());
        incident
    }

    /// Incidents matching the filter, worst severity first, oldest first
    /// within a severity. Resolved incidents only appear when asked for.
    pub fn list(&self, filter: &IncidentFilter) -> Vec<Incident> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut incidents: Vec<Incident> = inner
            .incidents
            .values()
            .filter(|i| match filter.status {
                Some(status) => i.status == status,
                None => i.status != IncidentStatus::Resolved,
            })
            .filter(|i| filter.severity.map_or(true, |s| i.severity == s))
            .filter(|i| {
                filter
                    .endpoint
                    .as_ref()
                    .map_or(true, |ep| i.root_cause.endpoint == *ep)
            })
            .cloned()
            .collect();
        incidents.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(a.first_detected.cmp(&b.first_detected))
                .then(a.id.cmp(&b.id))
        });
        incidents
    }

    pub fn get(&self, id: &str) -> Option<Incident> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.incidents.get(id).cloned()
    }

    /// active -> acknowledged. Acknowledging twice is a no-op.
    pub fn acknowledge(&self, id: &str, now: DateTime<Utc>) -> Result<Incident, RegistryError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let incident = inner
            .incidents
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        match incident.status {
            IncidentStatus::Resolved => Err(RegistryError::AlreadyResolved { id: id.to_string() }),
            IncidentStatus::Acknowledged => Ok(incident.clone()),
            IncidentStatus::Active => {
                incident.status = IncidentStatus::Acknowledged;
                incident.last_updated = now;
                Ok(incident.clone())
            }
        }
    }

    /// Mark resolved. The incident stays retrievable until the next analysis
    /// pass sweeps it out.
    pub fn resolve(
        &self,
        id: &str,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Incident, RegistryError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let incident = inner
            .incidents
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if incident.status != IncidentStatus::Resolved {
            incident.status = IncidentStatus::Resolved;
            incident.resolution_note = note;
            incident.resolved_at = Some(now);
            incident.last_updated = now;
        }
        Ok(incident.clone())
    }

    /// Per-pass expiration: auto-close active incidents idle past the TTL
    /// and sweep out incidents resolved before this pass. Acknowledged
    /// incidents never expire; they must be resolved explicitly.
    /// Returns (auto_closed, swept).
    pub fn expire(&self, now: DateTime<Utc>, ttl: Duration) -> (usize, usize) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = inner.incidents.len();
        let mut auto_closed = 0;
        inner.incidents.retain(|_, i| match i.status {
            IncidentStatus::Acknowledged => true,
            IncidentStatus::Resolved => false,
            IncidentStatus::Active => {
                if now - i.last_updated > ttl {
                    auto_closed += 1;
                    false
                } else {
                    true
                }
            }
        });
        let swept = before - inner.incidents.len() - auto_closed;
        (auto_closed, swept)
    }

    /// Number of unresolved incidents.
    pub fn active_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .incidents
            .values()
            .filter(|i| i.status != IncidentStatus::Resolved)
            .count()
    }
}
