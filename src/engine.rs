//! The composite engine value threaded through the instrumentation hook,
//! the scheduler, and the command handlers. No process-wide globals.
//!
//! Shared-state discipline: the store serializes writers internally;
//! baselines are published by atomic `Arc` swap so the detector always reads
//! a consistent snapshot; the registry sits behind its own mutex; the
//! injector behind a read-mostly lock. A failed pass never mutates any of
//! them: everything fallible is computed first, publication is infallible.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::analysis::baseline::BaselineMap;
use crate::analysis::{detect_anomalies, learn_baselines, Anomaly};
use crate::config::Config;
use crate::inject::{FailureInjector, InjectionDecision};
use crate::rca::{correlate, Incident, IncidentRegistry};
use crate::storage::{Pool, TelemetryStore};
use crate::telemetry::RequestContext;

/// How long after the last failed insert the storage path stays flagged.
const STORAGE_DEGRADED_WINDOW_SECS: i64 = 300;

/// What one analysis pass produced.
#[derive(Debug, Serialize)]
pub struct PassReport {
    pub timestamp: DateTime<Utc>,
    pub anomalies: Vec<Anomaly>,
    pub incidents: Vec<Incident>,
    pub auto_closed: usize,
    /// Endpoint -> learned baseline latency after this pass.
    pub baselines: std::collections::BTreeMap<String, f64>,
}

/// Storage-path health as reported on the health endpoint.
#[derive(Debug, Serialize)]
pub struct StorageHealth {
    pub insert_failures: u64,
    pub degraded: bool,
}

/// Everything the analysis pipeline owns, constructed once at startup.
pub struct OpsEngine {
    config: Config,
    store: TelemetryStore,
    injector: FailureInjector,
    registry: IncidentRegistry,
    baselines: RwLock<Arc<BaselineMap>>,
    insert_failures: AtomicU64,
    last_insert_failure_ms: AtomicI64,
}

impl OpsEngine {
    pub fn new(pool: Pool, config: Config) -> Self {
        Self {
            config,
            store: TelemetryStore::new(pool),
            injector: FailureInjector::new(),
            registry: IncidentRegistry::new(),
            baselines: RwLock::new(Arc::new(BaselineMap::new())),
            insert_failures: AtomicU64::new(0),
            last_insert_failure_ms: AtomicI64::new(0),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &TelemetryStore {
        &self.store
    }

    pub fn injector(&self) -> &FailureInjector {
        &self.injector
    }

    pub fn registry(&self) -> &IncidentRegistry {
        &self.registry
    }

    /// Consistent snapshot of the current baselines.
    pub fn baselines(&self) -> Arc<BaselineMap> {
        self.baselines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn publish_baselines(&self, next: BaselineMap) {
        let mut slot = self.baselines.write().unwrap_or_else(|e| e.into_inner());
        *slot = Arc::new(next);
    }

    // -- instrumentation hook ------------------------------------------------

    /// Open a request context, adopting a forwarded trace id if present.
    pub fn begin_request(
        &self,
        endpoint: &str,
        method: &str,
        incoming_trace_id: Option<&str>,
    ) -> RequestContext {
        RequestContext::begin(endpoint, method, incoming_trace_id)
    }

    /// Faults this request must realize, captured at its start.
    pub fn check_injection(&self, endpoint: &str) -> Option<InjectionDecision> {
        self.injector.plan(endpoint)
    }

    /// Record the request outcome. Telemetry is best-effort from the
    /// monitored service's point of view: an insert failure is logged and
    /// flagged on the health endpoint, never surfaced to the request. An
    /// invariant-violating record is logged and dropped.
    pub fn finish_request(
        &self,
        ctx: RequestContext,
        status_code: u16,
        error_message: Option<String>,
    ) {
        let record = ctx.finish(&self.config.server.service_name, status_code, error_message);
        if let Err(e) = record.validate() {
            warn!(endpoint = %record.endpoint, error = %e, "dropping invalid telemetry record");
            return;
        }
        if let Err(e) = self.store.insert(&record) {
            self.insert_failures.fetch_add(1, Ordering::Relaxed);
            self.last_insert_failure_ms
                .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
            error!(endpoint = %record.endpoint, error = %e, "telemetry insert failed");
        }
    }

    /// Storage-path health for the health endpoint.
    pub fn storage_health(&self) -> StorageHealth {
        let failures = self.insert_failures.load(Ordering::Relaxed);
        let last_ms = self.last_insert_failure_ms.load(Ordering::Relaxed);
        let degraded = last_ms != 0
            && Utc::now().timestamp_millis() - last_ms < STORAGE_DEGRADED_WINDOW_SECS * 1000;
        StorageHealth {
            insert_failures: failures,
            degraded,
        }
    }

    // -- analysis ------------------------------------------------------------

    /// Run one full analysis pass: learn baselines, detect anomalies,
    /// correlate into incidents, expire stale incidents.
    ///
    /// Two-phase: every fallible store read happens before the first shared
    /// mutation, so a storage error aborts the pass with baselines and
    /// registry untouched; the next pass simply retries.
    pub fn run_analysis(&self, now: DateTime<Utc>) -> Result<PassReport> {
        let cfg = &self.config.analysis;

        // Phase 1: compute locally.
        let prev = self.baselines();
        let next = learn_baselines(&self.store, &prev, cfg, now)?;
        let anomalies = detect_anomalies(&self.store, &next, cfg, now)?;
        let drafts = correlate(&self.store, &anomalies, &next, cfg, now)?;

        // Phase 2: publish. Nothing below can fail.
        self.publish_baselines(next);

        let correlation_window =
            Duration::seconds(self.config.incidents.correlation_window_secs as i64);
        let incidents: Vec<Incident> = drafts
            .into_iter()
            .map(|d| self.registry.upsert(d, correlation_window, now))
            .collect();

        let ttl = Duration::seconds(self.config.incidents.ttl_secs as i64);
        let (auto_closed, swept) = self.registry.expire(now, ttl);

        if !incidents.is_empty() {
            for inc in &incidents {
                info!(id = %inc.id, severity = %inc.severity, title = %inc.title, "incident upserted");
            }
        }
        if auto_closed > 0 || swept > 0 {
            debug!(auto_closed, swept, "registry expiration");
        }

        let baselines = self
            .baselines()
            .iter()
            .map(|(k, v)| (k.clone(), v.latency_ms))
            .collect();

        Ok(PassReport {
            timestamp: now,
            anomalies,
            incidents,
            auto_closed,
            baselines,
        })
    }

    /// Prune telemetry past the retention window. The cutoff never reaches
    /// into the baseline window (which contains the analysis window), no
    /// matter how small retention is configured.
    pub fn prune_telemetry(&self, now: DateTime<Utc>) -> Result<usize> {
        let retention = Duration::hours(self.config.storage.retention_hours as i64);
        let guard = Duration::seconds(self.config.analysis.baseline_window_secs as i64);
        let cutoff = std::cmp::min(now - retention, now - guard);
        let removed = self.store.prune_before(cutoff)?;
        if removed > 0 {
            debug!(removed, "pruned telemetry records");
        }
        Ok(removed)
    }
}
