//! Configuration module
//!
//! Environment-driven configuration for the ingest API and the pipeline worker:
//! database, storage root, external toolchain locations and worker retry policy.

use std::env;
use std::path::PathBuf;

// Common constants
const MAX_CONNECTIONS: u32 = 20;
const CONNECTION_TIMEOUT_SECS: u64 = 30;

const MIN_BITRATE_KBPS: u32 = 32;
const MAX_BITRATE_KBPS: u32 = 320;

/// Console log output format
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }
}

/// Server-level settings
#[derive(Clone, Debug)]
pub struct BaseConfig {
    pub server_port: u16,
    pub cors_origins: Vec<String>,
    pub db_max_connections: u32,
    pub db_timeout_seconds: u64,
    pub environment: String,
    pub log_format: LogFormat,
}

/// Pipeline worker pool and retry policy
#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub max_concurrency: usize,
    /// Capacity of the wake-up channel between dispatch and the worker pool.
    pub queue_capacity: usize,
    /// Extra attempts after the first one, for transient faults only.
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub soft_time_limit_secs: u64,
    /// How often the pool looks for due QUEUED rows without a wake-up.
    pub poll_interval_ms: u64,
    /// Interval between runs of the stale job reaper. 0 disables it.
    pub stale_job_reap_interval_secs: u64,
    /// Added to the soft time limit before a RUNNING row counts as abandoned.
    pub stale_job_grace_period_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            queue_capacity: 1024,
            max_retries: 2,
            retry_delay_secs: 30,
            soft_time_limit_secs: 3600,
            poll_interval_ms: 1000,
            stale_job_reap_interval_secs: 60,
            stale_job_grace_period_secs: 300,
        }
    }
}

/// Ingest service configuration
#[derive(Clone, Debug)]
pub struct IngestConfig {
    pub base: BaseConfig,
    pub database_url: String,
    /// Shared filesystem root holding every studio directory.
    pub studios_root: PathBuf,
    pub ffmpeg_path: Option<String>,
    pub ffprobe_path: Option<String>,
    pub default_target_bitrate_kbps: u32,
    pub max_upload_size_bytes: u64,
    /// Size of each bounded read while appending a chunk body.
    pub chunk_read_size: usize,
    pub worker: WorkerSettings,
}

/// Application configuration.
#[derive(Clone, Debug)]
pub struct Config(pub Box<IngestConfig>);

impl Config {
    fn as_ingest(&self) -> &IngestConfig {
        &self.0
    }

    /// Check if the application is running in production mode
    pub fn is_production(&self) -> bool {
        let env = self.as_ingest().base.environment.to_lowercase();
        env == "production" || env == "prod"
    }

    pub fn from_env() -> Result<Self, anyhow::Error> {
        let config = IngestConfig::from_env()?;
        Ok(Config(Box::new(config)))
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        self.as_ingest().validate()
    }

    pub fn server_port(&self) -> u16 {
        self.as_ingest().base.server_port
    }

    pub fn cors_origins(&self) -> &[String] {
        &self.as_ingest().base.cors_origins
    }

    pub fn db_max_connections(&self) -> u32 {
        self.as_ingest().base.db_max_connections
    }

    pub fn db_timeout_seconds(&self) -> u64 {
        self.as_ingest().base.db_timeout_seconds
    }

    pub fn environment(&self) -> &str {
        &self.as_ingest().base.environment
    }

    pub fn log_format(&self) -> LogFormat {
        self.as_ingest().base.log_format
    }

    pub fn database_url(&self) -> &str {
        &self.as_ingest().database_url
    }

    pub fn studios_root(&self) -> &std::path::Path {
        &self.as_ingest().studios_root
    }

    pub fn ffmpeg_path(&self) -> Option<&str> {
        self.as_ingest().ffmpeg_path.as_deref()
    }

    pub fn ffprobe_path(&self) -> Option<&str> {
        self.as_ingest().ffprobe_path.as_deref()
    }

    pub fn default_target_bitrate_kbps(&self) -> u32 {
        self.as_ingest().default_target_bitrate_kbps
    }

    pub fn max_upload_size_bytes(&self) -> u64 {
        self.as_ingest().max_upload_size_bytes
    }

    pub fn chunk_read_size(&self) -> usize {
        self.as_ingest().chunk_read_size
    }

    pub fn worker(&self) -> &WorkerSettings {
        &self.as_ingest().worker
    }
}

impl IngestConfig {
    /// Configuration with defaults for everything but the database and the storage root.
    pub fn new(database_url: impl Into<String>, studios_root: impl Into<PathBuf>) -> Self {
        Self {
            base: BaseConfig {
                server_port: 4000,
                cors_origins: vec!["*".to_string()],
                db_max_connections: MAX_CONNECTIONS,
                db_timeout_seconds: CONNECTION_TIMEOUT_SECS,
                environment: "development".to_string(),
                log_format: LogFormat::Compact,
            },
            database_url: database_url.into(),
            studios_root: studios_root.into(),
            ffmpeg_path: None,
            ffprobe_path: None,
            default_target_bitrate_kbps: 128,
            max_upload_size_bytes: 1024 * 1024 * 1024,
            chunk_read_size: 1024 * 1024,
            worker: WorkerSettings::default(),
        }
    }

    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        const DEFAULT_TARGET_BITRATE_KBPS: u32 = 128;
        const MAX_UPLOAD_SIZE_MB: u64 = 1024;
        const CHUNK_READ_SIZE_BYTES: usize = 1024 * 1024;
        let worker_defaults = WorkerSettings::default();

        let environment = env::var("ENVIRONMENT")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string());

        let cors_origins_str = env::var("CORS_ORIGINS").unwrap_or_else(|_| "*".to_string());
        let is_production =
            environment.to_lowercase() == "production" || environment.to_lowercase() == "prod";
        if is_production && cors_origins_str.trim() == "*" {
            return Err(anyhow::anyhow!(
                "CORS_ORIGINS cannot be '*' in production. Please specify explicit origins."
            ));
        }

        let cors_origins: Vec<String> = cors_origins_str
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let base = BaseConfig {
            server_port: env::var("PORT")
                .unwrap_or_else(|_| "4000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number"))?,
            cors_origins,
            db_max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| MAX_CONNECTIONS.to_string())
                .parse()
                .unwrap_or(MAX_CONNECTIONS),
            db_timeout_seconds: env::var("DB_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| CONNECTION_TIMEOUT_SECS.to_string())
                .parse()
                .unwrap_or(CONNECTION_TIMEOUT_SECS),
            environment,
            log_format: LogFormat::parse(
                &env::var("LOG_FORMAT").unwrap_or_else(|_| "compact".to_string()),
            ),
        };

        let worker = WorkerSettings {
            max_concurrency: env::var("WORKER_MAX_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(worker_defaults.max_concurrency),
            queue_capacity: env::var("WORKER_QUEUE_CAPACITY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(worker_defaults.queue_capacity),
            max_retries: env::var("WORKER_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(worker_defaults.max_retries),
            retry_delay_secs: env::var("WORKER_RETRY_DELAY_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(worker_defaults.retry_delay_secs),
            soft_time_limit_secs: env::var("WORKER_SOFT_TIME_LIMIT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(worker_defaults.soft_time_limit_secs),
            poll_interval_ms: env::var("WORKER_POLL_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(worker_defaults.poll_interval_ms),
            stale_job_reap_interval_secs: env::var("WORKER_STALE_JOB_REAP_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(worker_defaults.stale_job_reap_interval_secs),
            stale_job_grace_period_secs: env::var("WORKER_STALE_JOB_GRACE_PERIOD_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(worker_defaults.stale_job_grace_period_secs),
        };

        let config = IngestConfig {
            base,
            database_url: env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?,
            studios_root: env::var("RADIO_STUDIOS_ROOT")
                .map(PathBuf::from)
                .map_err(|_| anyhow::anyhow!("RADIO_STUDIOS_ROOT must be set"))?,
            ffmpeg_path: env::var("FFMPEG_PATH").ok().filter(|s| !s.is_empty()),
            ffprobe_path: env::var("FFPROBE_PATH").ok().filter(|s| !s.is_empty()),
            default_target_bitrate_kbps: env::var("DEFAULT_TARGET_BITRATE_KBPS")
                .unwrap_or_else(|_| DEFAULT_TARGET_BITRATE_KBPS.to_string())
                .parse()
                .unwrap_or(DEFAULT_TARGET_BITRATE_KBPS),
            max_upload_size_bytes: env::var("MAX_UPLOAD_SIZE_MB")
                .unwrap_or_else(|_| MAX_UPLOAD_SIZE_MB.to_string())
                .parse::<u64>()
                .unwrap_or(MAX_UPLOAD_SIZE_MB)
                * 1024
                * 1024,
            chunk_read_size: env::var("CHUNK_READ_SIZE_BYTES")
                .unwrap_or_else(|_| CHUNK_READ_SIZE_BYTES.to_string())
                .parse()
                .unwrap_or(CHUNK_READ_SIZE_BYTES),
            worker,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if !(self.database_url.starts_with("postgres://")
            || self.database_url.starts_with("postgresql://"))
        {
            return Err(anyhow::anyhow!(
                "DATABASE_URL must be a valid PostgreSQL connection string"
            ));
        }

        if self.studios_root.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("RADIO_STUDIOS_ROOT must not be empty"));
        }

        if !(MIN_BITRATE_KBPS..=MAX_BITRATE_KBPS).contains(&self.default_target_bitrate_kbps) {
            return Err(anyhow::anyhow!(
                "DEFAULT_TARGET_BITRATE_KBPS must be between {} and {}",
                MIN_BITRATE_KBPS,
                MAX_BITRATE_KBPS
            ));
        }

        if self.chunk_read_size == 0 {
            return Err(anyhow::anyhow!("CHUNK_READ_SIZE_BYTES must be positive"));
        }

        if self.worker.max_concurrency == 0 || self.worker.queue_capacity == 0 {
            return Err(anyhow::anyhow!(
                "WORKER_MAX_CONCURRENCY and WORKER_QUEUE_CAPACITY must be positive"
            ));
        }

        if self.worker.soft_time_limit_secs == 0 {
            return Err(anyhow::anyhow!(
                "WORKER_SOFT_TIME_LIMIT_SECS must be positive"
            ));
        }

        if self.worker.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("WORKER_POLL_INTERVAL_MS must be positive"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> IngestConfig {
        IngestConfig::new("postgres://localhost/onair", "/srv/studios")
    }

    #[test]
    fn defaults_are_valid() {
        let config = sample();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_target_bitrate_kbps, 128);
        assert_eq!(config.worker.max_retries, 2);
        assert_eq!(config.worker.retry_delay_secs, 30);
        assert_eq!(config.worker.soft_time_limit_secs, 3600);
        assert_eq!(config.worker.poll_interval_ms, 1000);
        assert_eq!(config.worker.stale_job_grace_period_secs, 300);
    }

    #[test]
    fn rejects_zero_poll_interval() {
        let mut config = sample();
        config.worker.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_non_postgres_url() {
        let mut config = sample();
        config.database_url = "mysql://localhost/onair".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_bitrate() {
        let mut config = sample();
        config.default_target_bitrate_kbps = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_root() {
        let mut config = sample();
        config.studios_root = PathBuf::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn log_format_parsing() {
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Compact);
    }

    #[test]
    fn production_detection() {
        let mut config = sample();
        config.base.environment = "Production".to_string();
        assert!(Config(Box::new(config)).is_production());
    }
}
