//! Engine configuration, loaded once at startup from the environment.
//!
//! Mirrors the ten-option configuration surface plus the process-wide
//! settings (store/broker connection strings, admin bind address).

use std::time::Duration;

/// Immutable configuration snapshot read at startup.
///
/// Held by the Orchestrator, propagated to Worker Processes at spawn time,
/// and read by the Consumer and Circuit Breaker. Never mutated from an
/// execution hot path; an "explicit reload" means reconstructing this value
/// and restarting the affected component, not a background poll.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Max concurrent executions per Worker Process.
    pub thread_pool_size: usize,
    /// Minimum Worker Processes kept warm.
    pub min_workers: usize,
    /// Hard ceiling on total tracked processes (Active+Draining+PendingKill).
    pub max_workers: usize,
    /// Default per-execution timeout.
    pub execution_timeout: Duration,
    /// Grace period before declaring an execution Stuck.
    pub cancel_grace: Duration,
    /// Max wait before force-terminating residuals at shutdown.
    pub graceful_shutdown: Duration,
    /// Proactively recycle a process after N completions; 0 = never.
    pub recycle_after_executions: u64,
    /// Heartbeat publish cadence.
    pub heartbeat_interval: Duration,
    /// Stuck events within the window before auto-blacklisting a workflow.
    pub stuck_threshold: u32,
    /// Width of the circuit breaker's sliding window.
    pub stuck_window: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            thread_pool_size: 4,
            min_workers: 2,
            max_workers: 10,
            execution_timeout: Duration::from_secs(300),
            cancel_grace: Duration::from_secs(10),
            graceful_shutdown: Duration::from_secs(5),
            recycle_after_executions: 0,
            heartbeat_interval: Duration::from_secs(10),
            stuck_threshold: 5,
            stuck_window: Duration::from_secs(60 * 60),
        }
    }
}

impl EngineConfig {
    /// Load from environment variables, falling back to defaults for
    /// anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            thread_pool_size: env_usize("THREAD_POOL_SIZE", defaults.thread_pool_size),
            min_workers: env_usize("MIN_WORKERS", defaults.min_workers),
            max_workers: env_usize("MAX_WORKERS", defaults.max_workers),
            execution_timeout: env_secs(
                "EXECUTION_TIMEOUT_SECONDS",
                defaults.execution_timeout,
            ),
            cancel_grace: env_secs("CANCEL_GRACE_SECONDS", defaults.cancel_grace),
            graceful_shutdown: env_secs(
                "GRACEFUL_SHUTDOWN_SECONDS",
                defaults.graceful_shutdown,
            ),
            recycle_after_executions: env_u64(
                "RECYCLE_AFTER_EXECUTIONS",
                defaults.recycle_after_executions,
            ),
            heartbeat_interval: env_secs(
                "HEARTBEAT_INTERVAL_SECONDS",
                defaults.heartbeat_interval,
            ),
            stuck_threshold: env_u32("STUCK_THRESHOLD", defaults.stuck_threshold),
            stuck_window: env_mins("STUCK_WINDOW_MINUTES", defaults.stuck_window),
        }
    }
}

/// Process-wide settings that aren't part of the engine's own ten-option
/// surface but are required to actually run the service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub admin_bind_addr: String,
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            redis_url: std::env::var("REDIS_URL").ok(),
            admin_bind_addr: std::env::var("ADMIN_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:9100".to_string()),
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_mins(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(|m: u64| Duration::from_secs(m * 60))
        .unwrap_or(default)
}
