/// Agent-wide configuration constants
pub struct AgentConfig;

impl AgentConfig {
    // Exit codes of the data-movement CLI
    pub const EXIT_SERVICE_UNREACHABLE: i32 = 10;
    pub const EXIT_RATE_LIMITED: i32 = 75;

    // Exit codes of this agent
    pub const EXIT_FAILURE: i32 = 1;
    pub const EXIT_INVALID_INPUT: i32 = 2;
    pub const EXIT_DOWNLOAD_FAILED: i32 = 3;
    pub const EXIT_UPLOAD_FAILED: i32 = 4;
    pub const EXIT_INTERRUPTED: i32 = 130;

    // Retry policy
    pub const MAX_RETRIES: u32 = 5;
    pub const HEALTH_POLL_INTERVAL_SECS: u64 = 10;
    pub const IDLE_TIMEOUT_SECS: u64 = 600;
    pub const BACKOFF_UNIT_MS: u64 = 1000;
    pub const BACKOFF_MAX_EXPONENT: u32 = 5;
    pub const RATE_LIMIT_NOTICE_EVERY: u32 = 5;

    // Mounting
    pub const MOUNT_ATTEMPTS: u32 = 3;
    pub const MOUNT_BINARY: &'static str = "mount-s3";
    pub const UNMOUNT_BINARY: &'static str = "fusermount";

    // Data-movement CLI
    pub const DATA_CLI_BINARY: &'static str = "osmo";

    // Manifest resolution
    pub const MANIFEST_QUEUE_DEPTH: usize = 1000;

    // Background tasks
    pub const CHECKPOINT_STOP_TICK_MS: u64 = 100;
    pub const SYNC_LIVENESS_INTERVAL_SECS: u64 = 5;
    pub const WATCHDOG_PROBE_INTERVAL_SECS: u64 = 10;
    pub const WATCHDOG_PROBE_TIMEOUT_SECS: u64 = 5;
}

/// Environment-derived configuration
pub struct EnvConfig;

impl EnvConfig {
    /// Worker count for manifest passes and transfer processes.
    pub fn default_parallelism() -> usize {
        num_cpus::get().max(1)
    }

    /// Exponential backoff for rate-limited calls, in backoff units.
    ///
    /// `1 + jitter * (2^min(count, cap) - 1)` with `jitter` in `[0, 1)`.
    pub fn rate_limit_backoff_units(backoff_count: u32, jitter: f64) -> f64 {
        let exponent = backoff_count.min(AgentConfig::BACKOFF_MAX_EXPONENT);
        1.0 + jitter * ((1u64 << exponent) as f64 - 1.0)
    }
}
