//! # Manager statistics.
//!
//! One [`ManagerStats`] instance accumulates over the life of the manager;
//! another is kept per category, and a third collects the totals of workers
//! that have already disconnected. [`Manager::stats`](crate::Manager::stats)
//! returns a snapshot with the derived fields filled in.

use serde::Serialize;

/// Counters and gauges describing the manager.
///
/// Times are in microseconds, sizes in bytes, memory/disk capacities in MB.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ManagerStats {
    // Tasks.
    pub tasks_waiting: u64,
    pub tasks_on_workers: u64,
    pub tasks_running: u64,
    pub tasks_with_results: u64,
    pub tasks_submitted: u64,
    pub tasks_dispatched: u64,
    pub tasks_done: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub tasks_exhausted_attempts: u64,

    // Workers.
    pub workers_connected: u64,
    pub workers_init: u64,
    pub workers_idle: u64,
    pub workers_busy: u64,
    pub workers_able: u64,
    pub workers_joined: u64,
    pub workers_removed: u64,
    pub workers_released: u64,
    pub workers_idled_out: u64,
    pub workers_fast_aborted: u64,
    pub workers_blocked: u64,
    pub workers_lost: u64,

    // Manager timeline.
    pub time_when_started: u64,
    pub time_send: u64,
    pub time_receive: u64,
    pub time_send_good: u64,
    pub time_receive_good: u64,
    pub time_status_msgs: u64,
    pub time_internal: u64,
    pub time_polling: u64,
    pub time_application: u64,

    // Work done remotely.
    pub time_workers_execute: u64,
    pub time_workers_execute_good: u64,
    pub time_workers_execute_exhaustion: u64,

    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub bandwidth: f64,

    // Capacity estimates.
    pub capacity_tasks: i64,
    pub capacity_cores: i64,
    pub capacity_memory: i64,
    pub capacity_disk: i64,
    pub capacity_gpus: i64,
    pub capacity_instantaneous: i64,
    pub capacity_weighted: i64,
    pub manager_load: f64,

    // Aggregate pool resources.
    pub total_cores: i64,
    pub total_memory: i64,
    pub total_disk: i64,
    pub total_gpus: i64,
    pub committed_cores: i64,
    pub committed_memory: i64,
    pub committed_disk: i64,
    pub committed_gpus: i64,
    pub min_cores: i64,
    pub max_cores: i64,
    pub min_memory: i64,
    pub max_memory: i64,
    pub min_disk: i64,
    pub max_disk: i64,
    pub min_gpus: i64,
    pub max_gpus: i64,
}
