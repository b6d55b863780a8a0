use std::net::SocketAddr;
use std::path::PathBuf;

use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};

use opspulse::analysis::{health_score, health_status};
use opspulse::config::Config;
use opspulse::engine::OpsEngine;
use opspulse::storage::{open_pool, TelemetryStore};

/// Exit code for configuration errors at startup.
const EXIT_CONFIG: i32 = 1;
/// Exit code for storage initialization failures.
const EXIT_STORAGE: i32 = 2;

#[derive(Parser)]
#[command(
    name = "opspulse",
    about = "Embedded operations intelligence: anomaly detection and root cause analysis",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file (overrides OPSPULSE_CONFIG and defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + background analysis loop)
    Serve {
        /// Bind address (overrides config)
        #[arg(long)]
        bind: Option<String>,

        /// Database path (overrides config)
        #[arg(long)]
        db: Option<String>,
    },

    /// Run one analysis pass against a database and print the report as JSON
    Analyze {
        /// Database path (overrides config)
        #[arg(long)]
        db: Option<String>,
    },

    /// Print per-endpoint metrics from a database
    Metrics {
        /// Database path (overrides config)
        #[arg(long)]
        db: Option<String>,

        /// Aggregation window in minutes
        #[arg(long, default_value = "60")]
        window_minutes: i64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let config = match load_config(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return EXIT_CONFIG;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .init();

    match cli.command {
        Commands::Serve { bind, db } => {
            let mut config = config;
            if let Some(bind) = bind {
                config.server.listen_address = bind;
            }
            if let Some(db) = db {
                config.storage.db_path = db;
            }

            let addr: SocketAddr = match config.server.listen_address.parse() {
                Ok(a) => a,
                Err(e) => {
                    eprintln!(
                        "configuration error: invalid listen address '{}': {e}",
                        config.server.listen_address
                    );
                    return EXIT_CONFIG;
                }
            };

            tracing::info!(%addr, db = %config.storage.db_path, "starting opspulse daemon");
            let pool = match open_pool(&config.storage.db_path) {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!(error = ?e, "storage initialization failed");
                    return EXIT_STORAGE;
                }
            };

            if let Err(e) = opspulse::serve(pool, config, addr).await {
                tracing::error!(error = ?e, "daemon exited with error");
                return EXIT_CONFIG;
            }
            0
        }

        Commands::Analyze { db } => {
            let mut config = config;
            if let Some(db) = db {
                config.storage.db_path = db;
            }
            let pool = match open_pool(&config.storage.db_path) {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!(error = ?e, "storage initialization failed");
                    return EXIT_STORAGE;
                }
            };

            let engine = OpsEngine::new(pool, config);
            match engine.run_analysis(Utc::now()) {
                Ok(report) => {
                    match serde_json::to_string_pretty(&report) {
                        Ok(json) => println!("{json}"),
                        Err(e) => {
                            eprintln!("failed to serialize report: {e}");
                            return EXIT_CONFIG;
                        }
                    }
                    0
                }
                Err(e) => {
                    tracing::error!(error = ?e, "analysis pass failed");
                    EXIT_CONFIG
                }
            }
        }

        Commands::Metrics { db, window_minutes } => {
            let mut config = config;
            if let Some(db) = db {
                config.storage.db_path = db;
            }
            let pool = match open_pool(&config.storage.db_path) {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!(error = ?e, "storage initialization failed");
                    return EXIT_STORAGE;
                }
            };

            match print_metrics(&TelemetryStore::new(pool), window_minutes) {
                Ok(()) => 0,
                Err(e) => {
                    tracing::error!(error = ?e, "metrics query failed");
                    EXIT_CONFIG
                }
            }
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<Config> {
    match path {
        Some(p) => Config::load(p),
        None => Config::load_or_default(),
    }
}

fn print_metrics(store: &TelemetryStore, window_minutes: i64) -> anyhow::Result<()> {
    let now = Utc::now();
    let since = now - Duration::minutes(window_minutes);

    let endpoints = store.distinct_endpoints(since)?;
    if endpoints.is_empty() {
        println!("No telemetry in the last {window_minutes} minutes.");
        return Ok(());
    }

    println!(
        "{:<25} | {:>8} | {:>12} | {:>10} | {:>7} | Status",
        "Endpoint", "Requests", "Avg Latency", "Error Rate", "Health"
    );
    println!(
        "{:-<25}-|-{:-<8}-|-{:-<12}-|-{:-<10}-|-{:-<7}-|-{:-<10}",
        "", "", "", "", "", ""
    );
    for endpoint in endpoints {
        let agg = store.aggregate(&endpoint, since, now)?;
        // The one-shot CLI has no learned baselines; only the error term
        // feeds the score here.
        let score = health_score(agg.error_rate(), agg.avg_latency_ms, None);
        println!(
            "{:<25} | {:>8} | {:>9.1} ms | {:>9.1}% | {:>7.1} | {}",
            endpoint,
            agg.count,
            agg.avg_latency_ms,
            agg.error_rate() * 100.0,
            score,
            health_status(score)
        );
    }
    Ok(())
}
