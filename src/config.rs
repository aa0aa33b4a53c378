//! # Manager configuration.
//!
//! [`ManagerConfig`] collects every tunable the manager consults at runtime:
//! timeouts, keepalive cadence, transfer-rate assumptions, overcommit, and
//! wait-loop behavior. Most fields can also be adjusted after creation
//! through [`Manager::tune`](crate::Manager::tune) using the string knob
//! names listed on each field.

use std::time::Duration;

use crate::scheduler::SchedulePolicy;

/// Seconds between updates to the catalog.
pub const UPDATE_INTERVAL: u64 = 60;

/// Default keepalive interval in seconds.
pub const DEFAULT_KEEPALIVE_INTERVAL: u64 = 120;

/// Default keepalive timeout in seconds.
pub const DEFAULT_KEEPALIVE_TIMEOUT: u64 = 900;

/// Maximum number of workers to accept in a single wait turn before dealing
/// with other matters.
pub const MAX_NEW_WORKERS: usize = 10;

/// How frequently to check for ready tasks that do not fit any worker.
pub const LARGE_TASK_CHECK_INTERVAL: Duration = Duration::from_secs(180);

/// Default timeout before a blocked slow worker may come back to the pool.
pub const BLOCKLIST_SLOW_WORKERS_TIMEOUT: i64 = 900;

/// Global configuration for a [`Manager`](crate::Manager).
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Port to listen on; 0 picks an ephemeral port (the `DS_PORT`
    /// environment variable is consulted first when 0).
    pub port: u16,
    /// Deadline for control-line sends and receives (`short-timeout`).
    pub short_timeout: Duration,
    /// Deadline for slow auxiliary reads such as cache-invalid payloads
    /// (`long-timeout`).
    pub long_timeout: Duration,
    /// Seconds between keepalive checks; 0 disables keepalives
    /// (`keepalive-interval`).
    pub keepalive_interval: u64,
    /// Seconds without a keepalive response before a worker is removed
    /// (`keepalive-timeout`).
    pub keepalive_timeout: u64,
    /// Multiplier applied to cores/memory/gpus totals when admitting tasks;
    /// never applied to disk (`resource-submit-multiplier`).
    pub resource_submit_multiplier: f64,
    /// Floor for any bulk transfer deadline, in seconds
    /// (`min-transfer-timeout`).
    pub minimum_transfer_timeout: u64,
    /// Reject transfers this many times slower than the observed rate
    /// (`transfer-outlier-factor`).
    pub transfer_outlier_factor: f64,
    /// Assumed bytes/second before any transfer has been observed
    /// (`default-transfer-rate`).
    pub default_transfer_rate: f64,
    /// Outbound bandwidth cap in bytes/second; 0 means unlimited. Seeded
    /// from `DS_BANDWIDTH` when present.
    pub bandwidth_limit: f64,
    /// Queue is always hungry below this many waiting tasks
    /// (`hungry-minimum`).
    pub hungry_minimum: usize,
    /// Dispatch no tasks until this many workers are connected
    /// (`wait-for-workers`).
    pub wait_for_workers: usize,
    /// Let a single `wait` call hand back more than one completion
    /// (`wait-retrieve-many`).
    pub wait_retrieve_many: bool,
    /// Divide every worker proportionally even for categories with fixed
    /// allocations (`force-proportional-resources`).
    pub force_proportional_resources: bool,
    /// Worker-selection policy.
    pub scheduler: SchedulePolicy,
    /// Seconds a slow worker stays blocked after fast-abort removal.
    pub blocklist_slow_workers_timeout: i64,
    /// Upper bound on captured stdout per task; longer output is truncated
    /// with a marker.
    pub max_stdout_storage: u64,
    /// Whether tasks run under an external resource monitor, enabling the
    /// exit-code translations below and monitor-output retrieval.
    pub monitor: bool,
    /// Exit code the resource monitor uses for a resource overflow.
    pub monitor_exit_overflow: i64,
    /// Exit code the resource monitor uses for an expired time limit.
    pub monitor_exit_time_expire: i64,
}

impl Default for ManagerConfig {
    /// Provides the stock configuration:
    /// - `short_timeout = 5s`, `long_timeout = 1h`
    /// - `keepalive_interval = 120s`, `keepalive_timeout = 900s`
    /// - `resource_submit_multiplier = 1.0` (no overcommit)
    /// - `minimum_transfer_timeout = 60s`, `transfer_outlier_factor = 10`
    /// - `default_transfer_rate = 1 MB/s`
    /// - `hungry_minimum = 10`, `wait_for_workers = 0`
    /// - scheduler = [`SchedulePolicy::Time`]
    fn default() -> Self {
        Self {
            port: 0,
            short_timeout: Duration::from_secs(5),
            long_timeout: Duration::from_secs(3600),
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            resource_submit_multiplier: 1.0,
            minimum_transfer_timeout: 60,
            transfer_outlier_factor: 10.0,
            default_transfer_rate: 1_000_000.0,
            bandwidth_limit: 0.0,
            hungry_minimum: 10,
            wait_for_workers: 0,
            wait_retrieve_many: false,
            force_proportional_resources: false,
            scheduler: SchedulePolicy::Time,
            blocklist_slow_workers_timeout: BLOCKLIST_SLOW_WORKERS_TIMEOUT,
            max_stdout_storage: 1 << 30,
            monitor: false,
            monitor_exit_overflow: 147,
            monitor_exit_time_expire: 148,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ManagerConfig::default();
        assert_eq!(cfg.short_timeout, Duration::from_secs(5));
        assert_eq!(cfg.keepalive_interval, 120);
        assert_eq!(cfg.keepalive_timeout, 900);
        assert_eq!(cfg.minimum_transfer_timeout, 60);
        assert_eq!(cfg.hungry_minimum, 10);
        assert_eq!(cfg.max_stdout_storage, 1 << 30);
        assert!(!cfg.wait_retrieve_many);
    }
}
