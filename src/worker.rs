//! # Worker records.
//!
//! One [`Worker`] exists per accepted connection, keyed by a [`WorkerKey`]
//! handle. A connection starts as [`WorkerType::Unknown`] until its
//! handshake promotes it to a real worker; status queries reclassify it as
//! [`WorkerType::Status`] and disconnect after one response.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::Serialize;

use crate::link::Link;
use crate::resources::{ResourceBox, WorkerResources};
use crate::task::TaskId;

/// Handle for one worker connection, usable as a table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct WorkerKey(pub u64);

impl std::fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// What a connection turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerType {
    /// Connected but not yet identified.
    Unknown,
    /// A real worker able to run tasks.
    Worker,
    /// A short-lived status query.
    Status,
}

/// Why a worker was removed; recorded for stats and the transaction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DisconnectReason {
    /// Released or told to exit by the manager.
    Explicit,
    /// A status query that was answered and closed.
    Status,
    /// The worker reported it was idling out.
    IdleOut,
    /// Removed for repeatedly running tasks too slowly.
    FastAbort,
    /// Transport or protocol failure.
    Failure,
}

impl DisconnectReason {
    pub fn as_label(self) -> &'static str {
        match self {
            DisconnectReason::Explicit => "explicit",
            DisconnectReason::Status => "status",
            DisconnectReason::IdleOut => "idle_out",
            DisconnectReason::FastAbort => "fast_abort",
            DisconnectReason::Failure => "failure",
        }
    }
}

/// Counters a worker reports about itself via `info` lines.
#[derive(Debug, Default, Clone, Serialize)]
pub struct WorkerReportedStats {
    pub workers_joined: u64,
    pub workers_removed: u64,
    pub time_send: u64,
    pub time_receive: u64,
    pub time_workers_execute: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub tasks_waiting: u64,
    pub tasks_running: u64,
}

/// What the manager knows about one remotely cached file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RemoteFileInfo {
    pub size: i64,
    pub transfer_time: u64,
}

/// One connected worker (or would-be worker).
#[derive(Debug)]
pub struct Worker {
    pub key: WorkerKey,
    pub link: Link,
    /// `host:port` of the remote end.
    pub addrport: String,
    /// Unset until the handshake arrives.
    pub hostname: Option<String>,
    pub os: String,
    pub arch: String,
    pub version: String,
    /// Assigned by the worker itself on first heartbeat.
    pub workerid: Option<String>,
    pub factory_name: Option<String>,
    pub kind: WorkerType,
    pub resources: WorkerResources,
    pub features: HashSet<String>,
    /// Remote cache contents, by cache name.
    pub current_files: HashMap<String, RemoteFileInfo>,
    /// Tasks currently owned by this worker.
    pub current_tasks: BTreeSet<TaskId>,
    /// Resource boxes allocated to those tasks.
    pub current_boxes: BTreeMap<TaskId, ResourceBox>,
    /// Peer-transfer endpoint, when advertised.
    pub transfer_addr: Option<(String, u16)>,

    // Liveness, in microseconds since the epoch.
    pub start_time: u64,
    pub last_msg_recv_time: u64,
    pub last_update_msg_time: u64,
    /// Worker-announced end of life, seconds since the epoch; 0 when unset.
    pub end_time: i64,

    pub draining: bool,
    pub fast_abort_alarm: bool,

    pub stats: WorkerReportedStats,
    pub total_transfer_time: u64,
    pub total_bytes_transferred: u64,
    pub total_tasks_complete: u64,
    /// Execution time accumulated over completed tasks, microseconds.
    pub total_task_time: u64,
    pub finished_tasks: i64,
}

impl Worker {
    pub fn new(key: WorkerKey, link: Link, addrport: String, now: u64) -> Self {
        Self {
            key,
            link,
            addrport,
            hostname: None,
            os: String::new(),
            arch: String::new(),
            version: String::new(),
            workerid: None,
            factory_name: None,
            kind: WorkerType::Unknown,
            resources: WorkerResources::default(),
            features: HashSet::new(),
            current_files: HashMap::new(),
            current_tasks: BTreeSet::new(),
            current_boxes: BTreeMap::new(),
            transfer_addr: None,
            start_time: now,
            last_msg_recv_time: 0,
            last_update_msg_time: 0,
            end_time: 0,
            draining: false,
            fast_abort_alarm: false,
            stats: WorkerReportedStats::default(),
            total_transfer_time: 0,
            total_bytes_transferred: 0,
            total_tasks_complete: 0,
            total_task_time: 0,
            finished_tasks: 0,
        }
    }

    /// Hostname for logs; `"unknown"` until the handshake.
    pub fn host_label(&self) -> &str {
        self.hostname.as_deref().unwrap_or("unknown")
    }

    /// Average observed transfer rate in bytes/second, when enough data
    /// has moved to trust it.
    pub fn observed_transfer_rate(&self) -> Option<f64> {
        if self.total_transfer_time > 1_000_000 {
            Some(1_000_000.0 * self.total_bytes_transferred as f64 / self.total_transfer_time as f64)
        } else {
            None
        }
    }

    /// Average task completion time in microseconds; used by the TIME
    /// scheduling policy.
    pub fn average_task_time(&self) -> u64 {
        if self.total_tasks_complete == 0 {
            0
        } else {
            self.total_task_time / self.total_tasks_complete
        }
    }
}
