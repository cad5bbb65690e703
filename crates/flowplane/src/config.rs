//! Runtime configuration.
//!
//! Defaults suit local development; production overrides come from
//! `FLOWPLANE_*` environment variables (loaded from `.env` by the host via
//! dotenvy before construction).

use std::time::Duration;

/// Worker pool and maintenance configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stable worker identifier recorded on job leases.
    pub worker_id: String,
    /// Concurrent jobs one worker processes.
    pub concurrency: usize,
    /// Jobs leased per poll.
    pub batch_size: usize,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Lease age after which a job counts as stuck.
    pub stuck_timeout: Duration,
    /// Interval between stuck-job recovery sweeps.
    pub recovery_interval: Duration,
    /// Interval between finished-job cleanup sweeps.
    pub cleanup_interval: Duration,
    /// Age past which finished jobs are purged.
    pub cleanup_retention: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4().simple()),
            concurrency: 4,
            batch_size: 10,
            poll_interval: Duration::from_millis(500),
            stuck_timeout: Duration::from_secs(300),
            recovery_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(3600),
            cleanup_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl WorkerConfig {
    /// Build from `FLOWPLANE_*` environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_id: std::env::var("FLOWPLANE_WORKER_ID").unwrap_or(defaults.worker_id),
            concurrency: env_parse("FLOWPLANE_WORKER_CONCURRENCY", defaults.concurrency),
            batch_size: env_parse("FLOWPLANE_WORKER_BATCH_SIZE", defaults.batch_size),
            poll_interval: Duration::from_millis(env_parse(
                "FLOWPLANE_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )),
            stuck_timeout: Duration::from_secs(env_parse(
                "FLOWPLANE_STUCK_TIMEOUT_SECS",
                defaults.stuck_timeout.as_secs(),
            )),
            recovery_interval: Duration::from_secs(env_parse(
                "FLOWPLANE_RECOVERY_INTERVAL_SECS",
                defaults.recovery_interval.as_secs(),
            )),
            cleanup_interval: Duration::from_secs(env_parse(
                "FLOWPLANE_CLEANUP_INTERVAL_SECS",
                defaults.cleanup_interval.as_secs(),
            )),
            cleanup_retention: Duration::from_secs(env_parse(
                "FLOWPLANE_CLEANUP_RETENTION_SECS",
                defaults.cleanup_retention.as_secs(),
            )),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
