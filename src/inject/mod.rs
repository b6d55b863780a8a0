//! Deterministic failure injection for exercising the detectors.
//!
//! A process-wide table maps endpoint -> fault rule. The instrumentation
//! layer consults [`FailureInjector::plan`] once at request start, so an
//! in-flight request keeps the configuration it saw even if an operator
//! changes the table mid-request. Injected errors become ordinary telemetry
//! (HTTP 500 with a canned message), not process errors.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Error messages attached to injected failures.
const CANNED_ERRORS: &[&str] = &[
    "Database connection timeout",
    "Downstream service unavailable",
    "Out of memory error",
    "Circuit breaker open",
    "Rate limit exceeded",
];

/// Fault configuration for one endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InjectionRule {
    /// Artificial latency applied before the handler runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    /// Probability in [0, 1] that the request short-circuits with HTTP 500.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_rate: Option<f64>,
}

/// The faults a single request must realize, captured at request start.
/// Delay is applied first, then the forced error (if the draw hit).
#[derive(Debug, Clone, Default)]
pub struct InjectionDecision {
    pub delay: Option<Duration>,
    pub fail_with: Option<String>,
}

/// Process-wide fault table, read on every request.
#[derive(Default)]
pub struct FailureInjector {
    rules: RwLock<HashMap<String, InjectionRule>>,
}

impl FailureInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge fault settings into the endpoint's rule. A `None` field leaves
    /// the existing setting untouched; `error_rate` is clamped to [0, 1].
    pub fn set(&self, endpoint: &str, delay_ms: Option<u64>, error_rate: Option<f64>) {
        let mut rules = self.rules.write().unwrap_or_else(|e| e.into_inner());
        let rule = rules.entry(endpoint.to_string()).or_default();
        if let Some(d) = delay_ms {
            rule.delay_ms = Some(d);
        }
        if let Some(r) = error_rate {
            rule.error_rate = Some(r.clamp(0.0, 1.0));
        }
    }

    /// Remove the rule for one endpoint.
    pub fn clear_endpoint(&self, endpoint: &str) {
        self.rules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(endpoint);
    }

    /// Empty the whole table.
    pub fn clear_all(&self) {
        self.rules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Capture the faults this request must realize. The random error draw
    /// happens here, once, so the decision is stable for the request's
    /// lifetime.
    pub fn plan(&self, endpoint: &str) -> Option<InjectionDecision> {
        let rule = {
            let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());
            rules.get(endpoint).copied()?
        };

        let mut rng = rand::thread_rng();
        let fail_with = match rule.error_rate {
            Some(rate) if rng.gen::<f64>() < rate => {
                let msg = CANNED_ERRORS
                    .choose(&mut rng)
                    .copied()
                    .unwrap_or("Injected failure");
                Some(format!("Simulated failure: {msg}"))
            }
            _ => None,
        };

        Some(InjectionDecision {
            delay: rule.delay_ms.map(Duration::from_millis),
            fail_with,
        })
    }

    /// Current table, sorted by endpoint for stable output.
    pub fn snapshot(&self) -> BTreeMap<String, InjectionRule> {
        self.rules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_merges_fields() {
        let inj = FailureInjector::new();
        inj.set("/payment", Some(2000), None);
        inj.set("/payment", None, Some(0.5));

        let snap = inj.snapshot();
        let rule = snap.get("/payment").unwrap();
        assert_eq!(rule.delay_ms, Some(2000));
        assert_eq!(rule.error_rate, Some(0.5));
    }

    #[test]
    fn test_error_rate_clamped() {
        let inj = FailureInjector::new();
        inj.set("/a", None, Some(1.7));
        inj.set("/b", None, Some(-0.3));
        let snap = inj.snapshot();
        assert_eq!(snap.get("/a").unwrap().error_rate, Some(1.0));
        assert_eq!(snap.get("/b").unwrap().error_rate, Some(0.0));
    }

    #[test]
    fn test_plan_unconfigured_endpoint_is_none() {
        let inj = FailureInjector::new();
        assert!(inj.plan("/payment").is_none());
    }

    #[test]
    fn test_plan_applies_delay() {
        let inj = FailureInjector::new();
        inj.set("/payment", Some(250), None);
        let decision = inj.plan("/payment").unwrap();
        assert_eq!(decision.delay, Some(Duration::from_millis(250)));
        assert!(decision.fail_with.is_none());
    }

    #[test]
    fn test_full_error_rate_always_fails() {
        let inj = FailureInjector::new();
        inj.set("/inventory", None, Some(1.0));
        for _ in 0..20 {
            let decision = inj.plan("/inventory").unwrap();
            let msg = decision.fail_with.expect("rate 1.0 must always fail");
            assert!(msg.starts_with("Simulated failure: "));
        }
    }

    #[test]
    fn test_zero_error_rate_never_fails() {
        let inj = FailureInjector::new();
        inj.set("/inventory", None, Some(0.0));
        for _ in 0..20 {
            assert!(inj.plan("/inventory").unwrap().fail_with.is_none());
        }
    }

    #[test]
    fn test_clear() {
        let inj = FailureInjector::new();
        inj.set("/a", Some(10), None);
        inj.set("/b", None, Some(0.1));

        inj.clear_endpoint("/a");
        assert!(inj.plan("/a").is_none());
        assert!(inj.plan("/b").is_some());

        inj.clear_all();
        assert!(inj.snapshot().is_empty());
    }
}
