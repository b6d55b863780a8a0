//! End-to-end scenarios for the analysis pipeline: telemetry in, incidents
//! out. Every test pins `now` explicitly so simulated time is under control.

use chrono::{DateTime, Duration, Utc};
use opspulse::analysis::{AnomalyKind, Severity};
use opspulse::config::Config;
use opspulse::engine::OpsEngine;
use opspulse::rca::{IncidentFilter, IncidentStatus};
use opspulse::storage::open_pool;
use opspulse::telemetry::NewRecord;

fn test_engine() -> (tempfile::TempDir, OpsEngine) {
    let dir = tempfile::TempDir::new().unwrap();
    let pool = open_pool(dir.path().join("pipeline.db").to_str().unwrap()).unwrap();
    (dir, OpsEngine::new(pool, Config::default()))
}

fn insert(
    engine: &OpsEngine,
    endpoint: &str,
    status: u16,
    latency: f64,
    trace: &str,
    ts: DateTime<Utc>,
) {
    engine
        .store()
        .insert(&NewRecord {
            service_name: "api-service".into(),
            endpoint: endpoint.into(),
            method: "POST".into(),
            status_code: status,
            latency_ms: latency,
            error_message: if status >= 500 {
                Some("Database connection timeout".into())
            } else {
                None
            },
            trace_id: trace.into(),
            timestamp: ts,
        })
        .unwrap();
}

/// Warm up an endpoint with successful traffic and learn its baseline.
fn warm_baseline(engine: &OpsEngine, endpoint: &str, latency: f64, at: DateTime<Utc>) {
    for i in 0..20 {
        insert(engine, endpoint, 200, latency, &format!("warm-{endpoint}-{i}"), at);
    }
    engine.run_analysis(at + Duration::minutes(1)).unwrap();
    assert!(engine.baselines().contains_key(endpoint));
}

// ---------------------------------------------------------------------------
// Scenario: latency spike
// ---------------------------------------------------------------------------

#[test]
fn test_latency_spike_produces_single_high_incident() {
    let (_dir, engine) = test_engine();
    let t0 = Utc::now() - Duration::minutes(30);

    // Baseline ~180ms learned from 20 successful requests at 150-207ms.
    for i in 0..20 {
        insert(
            &engine,
            "/payment",
            200,
            150.0 + 3.0 * i as f64,
            &format!("warm-{i}"),
            t0,
        );
    }
    engine.run_analysis(t0 + Duration::minutes(1)).unwrap();
    let learned = engine.baselines()["/payment"].latency_ms;
    assert!((learned - 178.5).abs() < 1e-9);

    // Spike: 8 requests around 2.9s, still HTTP 200.
    let now = t0 + Duration::minutes(20);
    for i in 0..8 {
        insert(
            &engine,
            "/payment",
            200,
            2860.0 + 10.0 * i as f64,
            &format!("spike-{i}"),
            now - Duration::minutes(1),
        );
    }

    let report = engine.run_analysis(now).unwrap();

    assert_eq!(report.anomalies.len(), 1);
    let anomaly = &report.anomalies[0];
    assert_eq!(anomaly.kind, AnomalyKind::Latency);
    assert_eq!(anomaly.endpoint, "/payment");

    assert_eq!(report.incidents.len(), 1);
    let incident = &report.incidents[0];
    assert_eq!(incident.root_cause.endpoint, "/payment");
    assert_eq!(incident.severity, Severity::High);
    assert_eq!(
        engine.registry().list(&IncidentFilter::default()).len(),
        1,
        "no other incidents"
    );
}

// ---------------------------------------------------------------------------
// Scenario: error-spike deduplication
// ---------------------------------------------------------------------------

#[test]
fn test_error_spike_deduplicates_across_passes() {
    let (_dir, engine) = test_engine();
    let t0 = Utc::now() - Duration::minutes(30);
    warm_baseline(&engine, "/inventory", 50.0, t0);

    // 20 requests at an 80% failure rate.
    let now = t0 + Duration::minutes(20);
    for i in 0..20 {
        let status = if i % 5 == 0 { 200 } else { 500 };
        insert(
            &engine,
            "/inventory",
            status,
            50.0,
            &format!("req-{i}"),
            now - Duration::minutes(2),
        );
    }

    let report = engine.run_analysis(now).unwrap();
    assert_eq!(report.incidents.len(), 1);
    let incident = &report.incidents[0];
    assert_eq!(incident.root_cause.endpoint, "/inventory");
    assert!(matches!(incident.severity, Severity::High | Severity::Critical));
    let spikes: Vec<_> = incident
        .anomalies
        .iter()
        .filter(|a| a.kind == AnomalyKind::ErrorSpike && a.endpoint == "/inventory")
        .collect();
    assert_eq!(spikes.len(), 1);
    assert!((spikes[0].error_rate.unwrap() - 0.8).abs() < 1e-9);

    // Re-running analysis within the correlation window merges instead of
    // opening a second incident.
    let report2 = engine.run_analysis(now + Duration::seconds(30)).unwrap();
    assert_eq!(report2.incidents.len(), 1);
    assert_eq!(report2.incidents[0].id, incident.id);
    assert_eq!(engine.registry().list(&IncidentFilter::default()).len(), 1);
}

// ---------------------------------------------------------------------------
// Scenario: cascading failure RCA
// ---------------------------------------------------------------------------

#[test]
fn test_cascading_failure_blames_payment() {
    let (_dir, engine) = test_engine();
    let t0 = Utc::now() - Duration::minutes(40);
    warm_baseline(&engine, "/payment", 100.0, t0);
    warm_baseline(&engine, "/checkout", 150.0, t0 + Duration::minutes(1));

    // 10 checkout requests, each internally calling payment with the same
    // trace id. Payment fails first in every trace.
    let now = t0 + Duration::minutes(30);
    for i in 0..10 {
        let trace = format!("cascade-{i}");
        let t = now - Duration::minutes(2) + Duration::seconds(i);
        insert(&engine, "/payment", 500, 40.0, &trace, t);
        insert(&engine, "/checkout", 500, 90.0, &trace, t + Duration::milliseconds(60));
    }

    let report = engine.run_analysis(now).unwrap();

    // Error spikes fire on both endpoints, but they correlate into one
    // incident rooted at the upstream failure.
    assert_eq!(report.incidents.len(), 1);
    let incident = &report.incidents[0];
    assert_eq!(incident.root_cause.endpoint, "/payment");
    assert!((incident.root_cause.confidence - 1.0).abs() < 1e-9);
    assert!(incident.affected_endpoints.contains(&"/payment".to_string()));
    assert!(incident.affected_endpoints.contains(&"/checkout".to_string()));

    let correlation = incident.trace_correlation.as_ref().unwrap();
    assert_eq!(correlation.total_traces, 10);
    assert!(!correlation.sample_traces.is_empty());
    assert!(correlation.sample_traces.len() <= 5);
    for sample in &correlation.sample_traces {
        assert_eq!(sample.root_endpoint, "/payment");
        assert_eq!(sample.root_status, 500);
        assert_eq!(sample.affected_chain, vec!["/payment".to_string(), "/checkout".to_string()]);
    }
}

// ---------------------------------------------------------------------------
// Scenario: baseline adaptation without alerts
// ---------------------------------------------------------------------------

#[test]
fn test_gradual_ramp_adapts_without_alerting() {
    let (_dir, engine) = test_engine();
    let t0 = Utc::now() - Duration::hours(6);

    // Learn the starting 50ms baseline.
    for i in 0..20 {
        insert(&engine, "/inventory", 200, 50.0, &format!("seed-{i}"), t0 - Duration::minutes(1));
    }
    engine.run_analysis(t0).unwrap();
    assert!((engine.baselines()["/inventory"].latency_ms - 50.0).abs() < 1e-9);

    // Ramp: every 6 minutes a pass preceded by 20 records whose mean climbs
    // 60, 70, ... 150ms; then hold at 150ms until the EWMA converges.
    for pass in 1i64..=40 {
        let mean = (50.0 + 10.0 * pass as f64).min(150.0);
        let pass_time = t0 + Duration::minutes(6 * pass);
        for i in 0..20 {
            // Symmetric spread around the mean keeps the batch mean exact.
            let jitter = (i as f64 - 9.5) * 0.2;
            insert(
                &engine,
                "/inventory",
                200,
                mean + jitter,
                &format!("ramp-{pass}-{i}"),
                pass_time - Duration::minutes(1),
            );
        }
        let report = engine.run_analysis(pass_time).unwrap();
        assert!(
            report.anomalies.is_empty(),
            "pass {pass} (mean {mean}ms) should not alert, got {:?}",
            report.anomalies
        );
    }

    let final_baseline = engine.baselines()["/inventory"].latency_ms;
    assert!(
        (final_baseline - 150.0).abs() <= 150.0 * 0.05,
        "final baseline {final_baseline} not within 5% of 150"
    );
}

// ---------------------------------------------------------------------------
// Scenario: silence
// ---------------------------------------------------------------------------

#[test]
fn test_silence_detected_after_traffic_stops() {
    let (_dir, engine) = test_engine();
    let stop = Utc::now() - Duration::minutes(10);

    // Steady traffic for 30 minutes, one request a minute.
    for i in 0..30 {
        insert(
            &engine,
            "/payment",
            200,
            100.0,
            &format!("steady-{i}"),
            stop - Duration::minutes(30) + Duration::minutes(i),
        );
    }
    let report = engine.run_analysis(stop + Duration::minutes(1)).unwrap();
    assert!(report.anomalies.is_empty());
    assert!(engine.baselines().contains_key("/payment"));

    // Seven minutes of nothing.
    let report = engine.run_analysis(stop + Duration::minutes(7)).unwrap();
    assert_eq!(report.anomalies.len(), 1);
    let anomaly = &report.anomalies[0];
    assert_eq!(anomaly.kind, AnomalyKind::Silence);
    assert_eq!(anomaly.endpoint, "/payment");
    assert_eq!(anomaly.severity, Severity::High);
    assert!(anomaly.last_seen.is_some());

    assert_eq!(report.incidents.len(), 1);
    assert_eq!(report.incidents[0].root_cause.endpoint, "/payment");
    assert_eq!(report.incidents[0].title, "Silence detected in /payment");
}

#[test]
fn test_silence_boundary_conditions() {
    let (_dir, engine) = test_engine();
    let now = Utc::now();

    // Traffic old enough to fall outside the baseline window entirely:
    // no baseline, no silence.
    for i in 0..20 {
        insert(&engine, "/stale", 200, 50.0, &format!("s-{i}"), now - Duration::hours(2));
    }
    let report = engine.run_analysis(now).unwrap();
    assert!(report.anomalies.is_empty());
}

// ---------------------------------------------------------------------------
// Scenario: acknowledge survives expiration
// ---------------------------------------------------------------------------

#[test]
fn test_acknowledged_incident_survives_ttl() {
    let (_dir, engine) = test_engine();
    let t0 = Utc::now() - Duration::hours(2);
    warm_baseline(&engine, "/inventory", 50.0, t0);

    let now = t0 + Duration::minutes(20);
    for i in 0..20 {
        insert(&engine, "/inventory", 500, 50.0, &format!("err-{i}"), now - Duration::minutes(1));
    }
    let report = engine.run_analysis(now).unwrap();
    let id = report.incidents[0].id.clone();

    engine.registry().acknowledge(&id, now).unwrap();

    // Well past the 30-minute TTL.
    let later = now + Duration::minutes(45);
    engine.run_analysis(later).unwrap();

    let incident = engine.registry().get(&id).expect("acknowledged incident must survive TTL");
    assert_eq!(incident.status, IncidentStatus::Acknowledged);

    // Resolving removes it from the active list on the next pass.
    engine.registry().resolve(&id, Some("fixed".into()), later).unwrap();
    engine.run_analysis(later + Duration::seconds(30)).unwrap();
    assert!(engine.registry().get(&id).is_none());
    assert!(engine
        .registry()
        .list(&IncidentFilter::default())
        .iter()
        .all(|i| i.id != id));
}

#[test]
fn test_unacknowledged_incident_expires_after_ttl() {
    let (_dir, engine) = test_engine();
    let t0 = Utc::now() - Duration::hours(3);
    warm_baseline(&engine, "/inventory", 50.0, t0);

    let now = t0 + Duration::minutes(20);
    for i in 0..20 {
        insert(&engine, "/inventory", 500, 50.0, &format!("err-{i}"), now - Duration::minutes(1));
    }
    let report = engine.run_analysis(now).unwrap();
    let id = report.incidents[0].id.clone();

    // Far enough that the telemetry has left the baseline window too, so
    // the pass produces nothing new and the TTL sweep can run clean.
    let later = now + Duration::minutes(80);
    engine.run_analysis(later).unwrap();
    assert!(engine.registry().get(&id).is_none());
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[test]
fn test_back_to_back_passes_are_idempotent() {
    let (_dir, engine) = test_engine();
    let t0 = Utc::now() - Duration::minutes(30);
    warm_baseline(&engine, "/payment", 100.0, t0);

    let now = t0 + Duration::minutes(20);
    for i in 0..10 {
        insert(&engine, "/payment", 500, 40.0, &format!("e-{i}"), now - Duration::minutes(1));
    }

    let first = engine.run_analysis(now).unwrap();
    let second = engine.run_analysis(now + Duration::seconds(1)).unwrap();

    assert_eq!(first.incidents.len(), 1);
    assert_eq!(second.incidents.len(), 1);
    assert_eq!(first.incidents[0].id, second.incidents[0].id);
    assert_eq!(
        first.incidents[0].root_cause.endpoint,
        second.incidents[0].root_cause.endpoint
    );
    assert_eq!(first.incidents[0].severity, second.incidents[0].severity);
    assert_eq!(engine.registry().list(&IncidentFilter::default()).len(), 1);
}

#[test]
fn test_learner_pass_postcondition() {
    let (_dir, engine) = test_engine();
    let now = Utc::now();

    // 10 successes: learned. 9 successes: not. 15 errors: not.
    for i in 0..10 {
        insert(&engine, "/enough", 200, 10.0, &format!("a{i}"), now - Duration::minutes(3));
    }
    for i in 0..9 {
        insert(&engine, "/sparse", 200, 10.0, &format!("b{i}"), now - Duration::minutes(3));
    }
    for i in 0..15 {
        insert(&engine, "/broken", 500, 10.0, &format!("c{i}"), now - Duration::minutes(3));
    }

    engine.run_analysis(now).unwrap();
    let baselines = engine.baselines();
    assert!(baselines.contains_key("/enough"));
    assert!(!baselines.contains_key("/sparse"));
    assert!(!baselines.contains_key("/broken"));
}

// ---------------------------------------------------------------------------
// Injection-driven end to end
// ---------------------------------------------------------------------------

#[test]
fn test_injected_errors_flow_through_to_incident() {
    let (_dir, engine) = test_engine();
    let t0 = Utc::now() - Duration::minutes(20);
    warm_baseline(&engine, "/inventory", 50.0, t0);

    engine.injector().set("/inventory", None, Some(1.0));

    // Drive the instrumentation hook the way a host middleware would.
    for i in 0..20 {
        let ctx = engine.begin_request("/inventory", "GET", Some(&format!("inj-{i}")));
        match engine.check_injection("/inventory") {
            Some(decision) if decision.fail_with.is_some() => {
                engine.finish_request(ctx, 500, decision.fail_with);
            }
            _ => engine.finish_request(ctx, 200, None),
        }
    }

    let report = engine.run_analysis(Utc::now()).unwrap();
    assert_eq!(report.incidents.len(), 1);
    let incident = &report.incidents[0];
    assert_eq!(incident.root_cause.endpoint, "/inventory");
    assert_eq!(incident.severity, Severity::Critical);

    let spike = incident
        .anomalies
        .iter()
        .find(|a| a.kind == AnomalyKind::ErrorSpike)
        .unwrap();
    assert!((spike.error_rate.unwrap() - 1.0).abs() < 1e-9);
    assert!(spike
        .sample_errors
        .iter()
        .all(|m| m.starts_with("Simulated failure: ")));

    engine.injector().clear_all();
    assert!(engine.injector().snapshot().is_empty());
}
