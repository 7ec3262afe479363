//! Configuration types — env-var driven with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

/// Pipeline-wide configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path to the libSQL database file.
    pub db_path: PathBuf,
    /// Port for the approval gate HTTP/WS server.
    pub gate_port: u16,
    /// Directory for daily-rolling file logs. None disables file logging.
    pub log_dir: Option<PathBuf>,
    /// How often the planner drains Intake and promotes Planned items.
    pub planner_interval: Duration,
    /// Executor loop settings.
    pub executor: ExecutorConfig,
    /// Local drop folder channel, enabled when the directory is set.
    pub local_drop: Option<LocalDropConfig>,
}

/// Executor retry and leasing settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// How often the executor scans for claimable items.
    pub poll_interval: Duration,
    /// Maximum attempts per approval before the Item fails.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_max: Duration,
    /// Hard timeout on a single capability dispatch.
    pub dispatch_timeout: Duration,
    /// Lease TTL — a crashed executor's claim expires after this.
    pub lease_ttl: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(300),
            dispatch_timeout: Duration::from_secs(60),
            lease_ttl: Duration::from_secs(120),
        }
    }
}

/// Local drop folder channel configuration.
#[derive(Debug, Clone)]
pub struct LocalDropConfig {
    /// Directory watched for dropped files.
    pub drop_dir: PathBuf,
    /// Directory the archive capability files payloads into.
    pub archive_dir: PathBuf,
    /// Poll interval in seconds.
    pub poll_interval_secs: u64,
}

impl LocalDropConfig {
    /// Build config from environment variables.
    /// Returns `None` if `OPS_ASSIST_DROP_DIR` is not set (channel disabled).
    pub fn from_env() -> Option<Self> {
        let drop_dir = PathBuf::from(std::env::var("OPS_ASSIST_DROP_DIR").ok()?);

        let archive_dir = std::env::var("OPS_ASSIST_ARCHIVE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| drop_dir.join("archive"));

        let poll_interval_secs: u64 = std::env::var("OPS_ASSIST_DROP_POLL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        Some(Self {
            drop_dir,
            archive_dir,
            poll_interval_secs,
        })
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/ops-assist.db"),
            gate_port: 8090,
            log_dir: None,
            planner_interval: Duration::from_secs(10),
            executor: ExecutorConfig::default(),
            local_drop: None,
        }
    }
}

impl PipelineConfig {
    /// Build config from environment variables, with defaults for anything unset.
    pub fn from_env() -> Self {
        let db_path = std::env::var("OPS_ASSIST_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/ops-assist.db"));

        let gate_port: u16 = std::env::var("OPS_ASSIST_GATE_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8090);

        let log_dir = std::env::var("OPS_ASSIST_LOG_DIR").ok().map(PathBuf::from);

        let planner_interval = Duration::from_secs(
            std::env::var("OPS_ASSIST_PLANNER_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
        );

        let mut executor = ExecutorConfig::default();
        if let Some(n) = std::env::var("OPS_ASSIST_MAX_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            executor.max_attempts = n;
        }
        if let Some(secs) = std::env::var("OPS_ASSIST_DISPATCH_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            executor.dispatch_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = std::env::var("OPS_ASSIST_LEASE_TTL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            executor.lease_ttl = Duration::from_secs(secs);
        }

        Self {
            db_path,
            gate_port,
            log_dir,
            planner_interval,
            executor,
            local_drop: LocalDropConfig::from_env(),
        }
    }
}
