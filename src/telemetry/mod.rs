//! Telemetry record model and the request instrumentation hook.
//!
//! The monitored service calls [`RequestContext::begin`] when a request
//! enters, and hands the context back through the engine when the request
//! finishes on any exit path. Failure is a data value here (a 5xx status with
//! an error message), never control flow escaping the hook.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Header used to propagate the trace id across service hops.
pub const TRACE_HEADER: &str = "X-Trace-Id";

/// Invariant violations that cause a record to be dropped at the door.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("latency must be non-negative, got {0}")]
    NegativeLatency(f64),
    #[error("status code out of range [100, 599]: {0}")]
    StatusOutOfRange(u16),
    #[error("trace id must be non-empty")]
    EmptyTraceId,
}

/// A telemetry record as persisted in the store. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub id: i64,
    pub service_name: String,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub latency_ms: f64,
    pub error_message: Option<String>,
    pub trace_id: String,
    pub timestamp: DateTime<Utc>,
}

impl TelemetryRecord {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn is_server_error(&self) -> bool {
        self.status_code >= 500
    }
}

/// A record prior to insertion; the store assigns the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRecord {
    pub service_name: String,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub latency_ms: f64,
    pub error_message: Option<String>,
    pub trace_id: String,
    pub timestamp: DateTime<Utc>,
}

impl NewRecord {
    /// Check the store invariants before insertion.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.latency_ms < 0.0 || self.latency_ms.is_nan() {
            return Err(RecordError::NegativeLatency(self.latency_ms));
        }
        if !(100..=599).contains(&self.status_code) {
            return Err(RecordError::StatusOutOfRange(self.status_code));
        }
        if self.trace_id.is_empty() {
            return Err(RecordError::EmptyTraceId);
        }
        Ok(())
    }
}

/// Generate a fresh trace id: 128 random bits, hex-encoded.
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Per-request instrumentation context.
///
/// Carries the resolved trace id (forwarded from the caller or freshly
/// generated) and the start timestamps. Latency is measured on the monotonic
/// clock; the wall-clock instant is what gets persisted.
#[derive(Debug)]
pub struct RequestContext {
    pub trace_id: String,
    pub endpoint: String,
    pub method: String,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl RequestContext {
    /// Open a context at request ingress. A non-empty incoming `X-Trace-Id`
    /// is adopted; otherwise a fresh id is generated.
    pub fn begin(endpoint: &str, method: &str, incoming_trace_id: Option<&str>) -> Self {
        let trace_id = match incoming_trace_id {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => new_trace_id(),
        };
        Self {
            trace_id,
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// Build the record for this request's outcome. Microsecond precision of
    /// the elapsed time is preserved in `latency_ms`.
    pub fn finish(
        self,
        service_name: &str,
        status_code: u16,
        error_message: Option<String>,
    ) -> NewRecord {
        let latency_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        NewRecord {
            service_name: service_name.to_string(),
            endpoint: self.endpoint,
            method: self.method,
            status_code,
            latency_ms,
            error_message,
            trace_id: self.trace_id,
            timestamp: self.started_at,
        }
    }
}
