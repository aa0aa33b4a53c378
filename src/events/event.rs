use std::sync::Arc;
use std::time::SystemTime;

use crate::stats::ManagerStats;
use crate::task::{TaskId, TaskState};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ManagerStart,
    ManagerEnd,
    TaskStateChange,
    WorkerConnected,
    WorkerJoined,
    WorkerRemoved,
    WorkerResources,
    CategoryChanged,
    HostBlocked,
    HostUnblocked,
    /// Periodic statistics snapshot, carrying [`Event::stats`].
    PerfSnapshot,
}

/// One lifecycle event with optional context fields.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub at: SystemTime,
    pub taskid: Option<TaskId>,
    pub state: Option<TaskState>,
    pub worker: Option<String>,
    pub host: Option<String>,
    pub category: Option<String>,
    pub reason: Option<String>,
    pub stats: Option<Arc<ManagerStats>>,
}

impl Event {
    pub fn now(kind: EventKind) -> Self {
        Self {
            kind,
            at: SystemTime::now(),
            taskid: None,
            state: None,
            worker: None,
            host: None,
            category: None,
            reason: None,
            stats: None,
        }
    }

    pub fn with_task(mut self, taskid: TaskId, state: TaskState) -> Self {
        self.taskid = Some(taskid);
        self.state = Some(state);
        self
    }

    pub fn with_worker(mut self, addrport: impl Into<String>) -> Self {
        self.worker = Some(addrport.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_stats(mut self, stats: ManagerStats) -> Self {
        self.stats = Some(Arc::new(stats));
        self
    }
}
