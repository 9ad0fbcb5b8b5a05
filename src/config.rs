//! Runtime configuration for the Lap Indexer / Lap Saver core
//! (SPEC_FULL.md §2 ambient layer).
//!
//! The hot path (frame ingestion, classification) takes no config beyond
//! what's injected at construction; this module covers the handful of
//! externally-tunable knobs around it.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::indexer::IndexerConfig;
use crate::saver::LapSaverConfig;

/// CLI/env-sourced knobs for the core, following the teacher's
/// `CliArgs` pattern (`clap::Parser` derive with `env` fallbacks).
#[derive(Parser, Debug, Clone)]
#[command(name = "lap-core")]
#[command(author = "Racing Coach Team")]
#[command(version = "0.1.0")]
#[command(about = "Lap indexing and durable persistence core")]
pub struct CliArgs {
    /// Seconds to wait for deferred lap-timing data before falling back
    /// to a calculated duration.
    #[arg(long, env = "TIMING_DELAY_SECS", default_value = "3.0")]
    pub timing_delay_secs: f64,

    /// Frame ring buffer capacity (≈ 2x expected telemetry fps).
    #[arg(long, env = "FRAME_RING_CAPACITY", default_value = "120")]
    pub frame_ring_capacity: usize,

    /// Consecutive transient failures allowed before a lap's save is
    /// abandoned.
    #[arg(long, env = "MAX_RETRY_ATTEMPTS", default_value = "3")]
    pub max_retry_attempts: u32,

    /// Worker restarts allowed before the Supervisor permanently
    /// switches to direct-save mode.
    #[arg(long, env = "MAX_WORKER_RESTARTS", default_value = "3")]
    pub max_worker_restarts: u32,

    /// Health-probe cadence, in seconds.
    #[arg(long, env = "HEALTH_PROBE_INTERVAL_SECS", default_value = "30")]
    pub health_probe_interval_secs: u64,

    /// Save queue capacity before laps fall back to direct-save.
    #[arg(long, env = "SAVE_QUEUE_CAPACITY", default_value = "100")]
    pub save_queue_capacity: usize,

    /// Directory fallback-persisted laps are written to.
    #[arg(long, env = "DISK_FALLBACK_DIR")]
    pub disk_fallback_dir: Option<PathBuf>,

    /// Persist laps below the minimum frame-count/coverage threshold
    /// instead of discarding them via disk fallback only.
    #[arg(long, env = "PERSIST_INVALID_LAPS", default_value = "false")]
    pub persist_invalid_laps: bool,

    /// Telemetry batch size for bulk point inserts.
    #[arg(long, env = "TELEMETRY_BATCH_SIZE", default_value = "100")]
    pub telemetry_batch_size: usize,

    /// Per-batch telemetry insert retry ceiling.
    #[arg(long, env = "TELEMETRY_BATCH_RETRIES", default_value = "3")]
    pub telemetry_batch_retries: usize,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Whether the database client is enabled (spec §6.2). When false,
    /// the host is expected to supply `NullDatabaseClient`.
    #[arg(long, env = "DATABASE_ENABLED", default_value = "true")]
    pub database_enabled: bool,
}

impl CliArgs {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timing_delay_secs <= 0.0 {
            return Err(ConfigError::InvalidTimingDelay(self.timing_delay_secs));
        }
        if self.frame_ring_capacity == 0 {
            return Err(ConfigError::InvalidFrameRingCapacity);
        }
        if self.max_retry_attempts == 0 {
            return Err(ConfigError::InvalidRetryAttempts);
        }
        Ok(())
    }
}

/// Resolved application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub indexer: IndexerConfigSettings,
    pub saver: SaverConfigSettings,
    pub max_retry_attempts: u32,
    pub max_worker_restarts: u32,
    pub health_probe_interval: Duration,
    pub save_queue_capacity: usize,
    pub log_level: String,
    pub database_enabled: bool,
}

/// Plain-data mirror of `IndexerConfig`'s tunables, kept separate so
/// `config.rs` doesn't need to know how to default-construct the
/// indexer's internal rate-limiter state.
#[derive(Debug, Clone)]
pub struct IndexerConfigSettings {
    pub frame_ring_capacity: usize,
    pub timing_delay_secs: f64,
}

#[derive(Debug, Clone)]
pub struct SaverConfigSettings {
    pub disk_fallback_dir: PathBuf,
    pub persist_invalid_laps: bool,
    pub telemetry_batch_size: usize,
    pub telemetry_batch_retries: usize,
}

impl Config {
    pub fn from_args(args: CliArgs) -> Result<Self, ConfigError> {
        args.validate()?;

        let disk_fallback_dir = args
            .disk_fallback_dir
            .unwrap_or_else(|| std::env::temp_dir().join("lap-core-fallback"));

        Ok(Self {
            indexer: IndexerConfigSettings {
                frame_ring_capacity: args.frame_ring_capacity,
                timing_delay_secs: args.timing_delay_secs,
            },
            saver: SaverConfigSettings {
                disk_fallback_dir,
                persist_invalid_laps: args.persist_invalid_laps,
                telemetry_batch_size: args.telemetry_batch_size,
                telemetry_batch_retries: args.telemetry_batch_retries,
            },
            max_retry_attempts: args.max_retry_attempts,
            max_worker_restarts: args.max_worker_restarts,
            health_probe_interval: Duration::from_secs(args.health_probe_interval_secs),
            save_queue_capacity: args.save_queue_capacity,
            log_level: args.log_level,
            database_enabled: args.database_enabled,
        })
    }

    /// Load configuration from environment (`.env` if present) and CLI.
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let args = CliArgs::parse();
        Self::from_args(args)
    }

    pub fn indexer_config(&self) -> IndexerConfig {
        let mut cfg = IndexerConfig::default();
        cfg.frame_ring_capacity = self.indexer.frame_ring_capacity;
        cfg.timing_delay_secs = self.indexer.timing_delay_secs;
        cfg
    }

    pub fn saver_config(&self) -> LapSaverConfig {
        LapSaverConfig {
            disk_fallback_dir: self.saver.disk_fallback_dir.clone(),
            persist_invalid_laps: self.saver.persist_invalid_laps,
            telemetry_batch_size: self.saver.telemetry_batch_size,
            telemetry_batch_retries: self.saver.telemetry_batch_retries,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_args(CliArgs {
            timing_delay_secs: 3.0,
            frame_ring_capacity: 120,
            max_retry_attempts: 3,
            max_worker_restarts: 3,
            health_probe_interval_secs: 30,
            save_queue_capacity: 100,
            disk_fallback_dir: None,
            persist_invalid_laps: false,
            telemetry_batch_size: 100,
            telemetry_batch_retries: 3,
            log_level: "info".to_string(),
            database_enabled: true,
        })
        .expect("default CliArgs are always valid")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid timing delay: {0}. Must be positive")]
    InvalidTimingDelay(f64),

    #[error("frame ring capacity must be at least 1")]
    InvalidFrameRingCapacity,

    #[error("max retry attempts must be at least 1")]
    InvalidRetryAttempts,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_args() -> CliArgs {
        CliArgs {
            timing_delay_secs: 3.0,
            frame_ring_capacity: 120,
            max_retry_attempts: 3,
            max_worker_restarts: 3,
            health_probe_interval_secs: 30,
            save_queue_capacity: 100,
            disk_fallback_dir: None,
            persist_invalid_laps: false,
            telemetry_batch_size: 100,
            telemetry_batch_retries: 3,
            log_level: "info".to_string(),
            database_enabled: true,
        }
    }

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.max_retry_attempts, 3);
        assert!(config.database_enabled);
    }

    #[test]
    fn rejects_zero_timing_delay() {
        let mut args = valid_args();
        args.timing_delay_secs = 0.0;
        assert!(matches!(args.validate(), Err(ConfigError::InvalidTimingDelay(_))));
    }

    #[test]
    fn rejects_zero_frame_ring_capacity() {
        let mut args = valid_args();
        args.frame_ring_capacity = 0;
        assert!(matches!(args.validate(), Err(ConfigError::InvalidFrameRingCapacity)));
    }

    #[test]
    fn disk_fallback_dir_defaults_under_temp() {
        let config = Config::from_args(valid_args()).unwrap();
        assert!(config.saver.disk_fallback_dir.ends_with("lap-core-fallback"));
    }
}
