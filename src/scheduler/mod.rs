//! Background analysis loop.
//!
//! One long-running task drives learner -> detector -> RCA at a fixed
//! cadence. The pass itself is synchronous SQLite work, so each tick runs it
//! on the blocking pool. Errors are logged and the loop keeps going; a
//! cancelled loop finishes its in-flight pass before exiting.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::OpsEngine;

/// Run the analysis loop until `shutdown` fires.
pub async fn run_analysis_loop(engine: Arc<OpsEngine>, shutdown: CancellationToken) {
    let cadence = std::time::Duration::from_secs(engine.config().analysis.cadence_secs);
    let soft_deadline =
        std::time::Duration::from_secs(engine.config().analysis.pass_soft_deadline_secs);

    let mut interval = tokio::time::interval(cadence);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of a tokio interval fires immediately; skip it so the
    // loop waits one full cadence before its first pass.
    interval.tick().await;

    info!(cadence_secs = cadence.as_secs(), "analysis loop started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                run_tick(&engine, soft_deadline).await;
            }
        }
    }

    info!("analysis loop stopped");
}

async fn run_tick(engine: &Arc<OpsEngine>, soft_deadline: std::time::Duration) {
    let started = Instant::now();
    let pass_engine = engine.clone();

    let result =
        tokio::task::spawn_blocking(move || pass_engine.run_analysis(Utc::now())).await;

    match result {
        Ok(Ok(report)) => {
            debug!(
                anomalies = report.anomalies.len(),
                incidents = report.incidents.len(),
                "analysis pass complete"
            );
        }
        Ok(Err(e)) => {
            // Registry and baselines were not touched; next tick retries.
            error!(error = %e, "analysis pass failed");
        }
        Err(e) => {
            error!(error = %e, "analysis task panicked");
        }
    }

    let elapsed = started.elapsed();
    if elapsed > soft_deadline {
        warn!(
            elapsed_ms = elapsed.as_millis() as u64,
            deadline_ms = soft_deadline.as_millis() as u64,
            "analysis pass exceeded soft deadline"
        );
    }

    let prune_engine = engine.clone();
    if let Ok(Err(e)) =
        tokio::task::spawn_blocking(move || prune_engine.prune_telemetry(Utc::now())).await
    {
        warn!(error = %e, "telemetry prune failed");
    }
}
