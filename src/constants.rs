//! Application-wide constants for netprobe-agent.
//!
//! This module centralizes all magic numbers and configuration defaults
//! to improve maintainability and discoverability. Constants are grouped
//! by domain with documentation explaining their purpose.
//!
//! # Categories
//!
//! - **Identity**: User-Agent and version strings
//! - **Control channel**: heartbeat and reconnect cadence
//! - **Executor**: concurrency, timeout and retry defaults
//! - **Collector**: result batching windows
//! - **Update**: OTA polling and install limits

use std::time::Duration;

// ============================================================================
// Identity
// ============================================================================

/// The current agent version, derived from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// User-Agent header sent on the WebSocket upgrade request and all HTTP
/// requests to the update origin.
pub fn user_agent() -> String {
    format!("NetworkProbeAgent/{}", VERSION)
}

// ============================================================================
// Control channel
// ============================================================================

/// Interval between heartbeat messages to the control plane.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Staleness threshold for the heartbeat monitor. If the sender has not
/// managed to put a heartbeat on the wire within this window, the monitor
/// counts a miss.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

/// Consecutive heartbeat misses that mark the session unhealthy and force
/// a reconnect.
pub const MAX_MISSED_HEARTBEATS: u32 = 3;

/// Delay between reconnection attempts after a connection loss.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Reconnection attempts before the agent gives up and surfaces a fatal
/// error. Reset to zero on any successful authenticated session.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Timeout for the `auth` request/response exchange during connect.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for request/response exchanges over the channel.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Depth of the outbound write queue. Sends block (briefly) when the single
/// writer falls this far behind rather than buffering without bound.
pub const WRITE_QUEUE_DEPTH: usize = 100;

// ============================================================================
// Executor
// ============================================================================

/// Maximum probe tasks in flight at once.
pub const MAX_CONCURRENT_TASKS: usize = 10;

/// Per-task deadline applied when the job does not carry its own.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);

/// Retries for a failed (not timed-out, not cancelled) task.
pub const MAX_TASK_RETRIES: u32 = 3;

/// Ceiling for the exponential retry backoff: 2, 4, 8, ... capped here.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60);

// ============================================================================
// Collector
// ============================================================================

/// Results buffered before an immediate batch flush.
pub const RESULT_BATCH_SIZE: usize = 10;

/// Flush interval for a partially filled batch buffer.
pub const RESULT_BATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on spooled (unsent) batches kept on disk while the channel
/// is down. Oldest batches past this count are pruned at append time.
pub const SPOOL_MAX_BATCHES: usize = 1000;

/// Spooled batches older than this are dropped during replay.
pub const SPOOL_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// ============================================================================
// Supervisor
// ============================================================================

/// Cadence of the connection monitor's liveness poll.
pub const CONNECTION_MONITOR_INTERVAL: Duration = Duration::from_secs(10);

/// Default cadence of resource usage reports.
pub const RESOURCE_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Cadence of the supervisor's background-task health sweep.
pub const TASK_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Update
// ============================================================================

/// Default interval between automatic update checks.
pub const UPDATE_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Hard limit for the post-install script.
pub const INSTALL_SCRIPT_TIMEOUT: Duration = Duration::from_secs(300);

/// HTTP timeout for update origin requests (check, package, signature).
pub const UPDATE_HTTP_TIMEOUT: Duration = Duration::from_secs(300);

/// Delay written into the restart script before the new process comes up.
pub const RESTART_DELAY: Duration = Duration::from_secs(5);

/// Backups retained by `cleanup_old_backups` by default.
pub const BACKUP_KEEP_COUNT: usize = 5;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_timeout_exceeds_interval() {
        // The monitor wakes on the send cadence; a timeout shorter than the
        // interval would count a miss on every tick.
        assert!(HEARTBEAT_TIMEOUT > HEARTBEAT_INTERVAL);
    }

    #[test]
    fn test_user_agent_includes_version() {
        let ua = user_agent();
        assert!(ua.starts_with("NetworkProbeAgent/"));
        assert!(ua.contains(VERSION));
    }

    #[test]
    fn test_backoff_cap_bounds_exponential_schedule() {
        // 2^6 = 64 exceeds the cap, so the schedule must flatten at 60s.
        assert_eq!(MAX_RETRY_BACKOFF.as_secs(), 60);
        assert!(2u64.pow(MAX_TASK_RETRIES) < MAX_RETRY_BACKOFF.as_secs());
    }
}
