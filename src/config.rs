//! TOML configuration for the opspulse engine.
//!
//! Layered model: compiled-in defaults, optional config file at
//! `/etc/opspulse/opspulse.toml`, path override via the `OPSPULSE_CONFIG`
//! environment variable. CLI flags override the listen address and database
//! path on top of whatever the file provides.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the opspulse process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub analysis: AnalysisConfig,
    pub incidents: IncidentConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in the `OPSPULSE_CONFIG` environment variable (hard error
    ///    if set but unreadable: an operator asked for that exact file).
    /// 2. `/etc/opspulse/opspulse.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Result<Self> {
        if let Ok(env_path) = std::env::var("OPSPULSE_CONFIG") {
            let path = Path::new(&env_path);
            return Self::load(path)
                .with_context(|| format!("OPSPULSE_CONFIG points at {}", path.display()));
        }

        let system_path = Path::new("/etc/opspulse/opspulse.toml");
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        let a = &self.analysis;
        if !(0.0 < a.ewma_alpha && a.ewma_alpha <= 1.0) {
            anyhow::bail!("analysis.ewma_alpha must be in (0, 1], got {}", a.ewma_alpha);
        }
        if a.latency_multiplier <= 1.0 {
            anyhow::bail!(
                "analysis.latency_multiplier must be > 1.0, got {}",
                a.latency_multiplier
            );
        }
        if !(0.0 < a.error_rate_threshold && a.error_rate_threshold < 1.0) {
            anyhow::bail!(
                "analysis.error_rate_threshold must be in (0, 1), got {}",
                a.error_rate_threshold
            );
        }
        if a.analysis_window_secs == 0 || a.baseline_window_secs == 0 {
            anyhow::bail!("analysis windows must be non-zero");
        }
        if a.baseline_window_secs <= a.analysis_window_secs {
            anyhow::bail!("analysis.baseline_window_secs must exceed analysis_window_secs");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port for the query/command API.
    pub listen_address: String,
    /// Service name stamped on every telemetry record this process writes.
    pub service_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:7600".to_string(),
            service_name: "api-service".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// SQLite storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the SQLite database file.
    pub db_path: String,
    /// Telemetry retention window in hours. Records older than this are
    /// pruned after each analysis pass, but never records still inside the
    /// analysis or baseline windows.
    pub retention_hours: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "data/opspulse.db".to_string(),
            retention_hours: 24,
        }
    }
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// Baseline learning and anomaly detection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Window the learner folds into the EWMA baseline (seconds).
    pub baseline_window_secs: u64,
    /// Window the detector inspects for anomalies (seconds).
    pub analysis_window_secs: u64,
    /// Minimum successful samples before an endpoint gets a baseline.
    pub min_baseline_samples: usize,
    /// Minimum records in the analysis window before an anomaly may fire.
    pub min_analysis_samples: usize,
    /// EWMA smoothing factor: weight of the newest window mean.
    pub ewma_alpha: f64,
    /// Latency anomaly threshold as a multiple of the baseline.
    pub latency_multiplier: f64,
    /// 5xx ratio above which an error spike fires.
    pub error_rate_threshold: f64,
    /// An endpoint with a baseline but no records for this long is silent.
    pub silence_threshold_secs: u64,
    /// Cadence of the background analysis loop (seconds).
    pub cadence_secs: u64,
    /// Soft deadline for one pass; exceeding it logs a warning (seconds).
    pub pass_soft_deadline_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            baseline_window_secs: 3600,
            analysis_window_secs: 300,
            min_baseline_samples: 10,
            min_analysis_samples: 5,
            ewma_alpha: 0.1,
            latency_multiplier: 3.0,
            error_rate_threshold: 0.20,
            silence_threshold_secs: 300,
            cadence_secs: 30,
            pass_soft_deadline_secs: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Incidents
// ---------------------------------------------------------------------------

/// Incident lifecycle parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentConfig {
    /// Active incidents untouched for this long are auto-closed (seconds).
    /// Acknowledged incidents are exempt.
    pub ttl_secs: u64,
    /// A new detection with the same root endpoint within this window merges
    /// into the existing incident instead of opening a new one (seconds).
    pub correlation_window_secs: u64,
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 1800,
            correlation_window_secs: 300,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
