//! opspulse -- embedded operations intelligence for HTTP services.
//!
//! This crate provides the core library: a telemetry store, an adaptive
//! baseline learner, multi-dimensional anomaly detection, trace-correlated
//! root cause analysis, an incident registry, and the background scheduler
//! that drives them.

pub mod analysis;
pub mod api;
pub mod config;
pub mod engine;
pub mod inject;
pub mod rca;
pub mod scheduler;
pub mod storage;
pub mod telemetry;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::api::AppState;
use crate::config::Config;
use crate::engine::OpsEngine;
use crate::storage::Pool;

/// Start the opspulse daemon: API server plus the background analysis loop.
///
/// Blocks until ctrl-c. The analysis loop is cancelled on shutdown and its
/// in-flight pass runs to completion before the process exits.
pub async fn serve(pool: Pool, config: Config, addr: SocketAddr) -> Result<()> {
    let engine = Arc::new(OpsEngine::new(pool, config));

    let shutdown = CancellationToken::new();
    let loop_handle = tokio::spawn(scheduler::run_analysis_loop(
        engine.clone(),
        shutdown.clone(),
    ));

    let app = api::router(AppState { engine });

    tracing::info!(%addr, "opspulse listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    let server_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_token.cancelled().await })
        .await
        .context("server error")?;

    // Let the analysis loop finish its in-flight pass.
    shutdown.cancel();
    let _ = loop_handle.await;

    Ok(())
}
