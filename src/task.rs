//! # Task definition and lifecycle state.
//!
//! A [`Task`] carries an immutable-ish specification (command, files,
//! environment, resource request) plus the dynamic state the manager
//! maintains across attempts. Once a task reaches a terminal state it is
//! handed back to the submitter by value; resubmitting it keeps the
//! specification and resets the per-attempt bookkeeping.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::resources::{ResourceBox, ResourceRequest};
use crate::worker::WorkerKey;

/// Unique task identifier, assigned at first submission.
pub type TaskId = u64;

/// Lifecycle states of a task inside the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    /// Not known to the manager.
    Unknown,
    /// Waiting in the ready queue for dispatch.
    Ready,
    /// Committed to a worker.
    Running,
    /// The worker reported completion; outputs not yet fetched.
    WaitingRetrieval,
    /// Outputs fetched; waiting to be handed back via `wait`.
    Retrieved,
    /// Returned to the submitter.
    Done,
    /// Cancelled before completion.
    Canceled,
}

impl TaskState {
    /// Terminal states remove the task from the manager's tables.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Canceled | TaskState::Unknown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Unknown => "UNKNOWN",
            TaskState::Ready => "READY",
            TaskState::Running => "RUNNING",
            TaskState::WaitingRetrieval => "WAITING_RETRIEVAL",
            TaskState::Retrieved => "RETRIEVED",
            TaskState::Done => "DONE",
            TaskState::Canceled => "CANCELED",
        }
    }
}

/// The kind of completion (or failure) of a task attempt.
///
/// Wire codes follow the worker protocol: the three missing-file kinds are
/// low bits, everything else is a distinct value in the upper bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskResult {
    Success,
    InputMissing,
    OutputMissing,
    StdoutMissing,
    Signal,
    ResourceExhaustion,
    TaskTimeout,
    Unknown,
    Forsaken,
    MaxRetries,
    MaxWallTime,
    DiskFull,
    MonitorError,
    OutputTransferError,
}

impl TaskResult {
    /// Numeric code used in `result` lines.
    pub fn code(self) -> i64 {
        match self {
            TaskResult::Success => 0,
            TaskResult::InputMissing => 1,
            TaskResult::OutputMissing => 2,
            TaskResult::StdoutMissing => 4,
            TaskResult::Signal => 1 << 3,
            TaskResult::ResourceExhaustion => 2 << 3,
            TaskResult::TaskTimeout => 3 << 3,
            TaskResult::Unknown => 4 << 3,
            TaskResult::Forsaken => 5 << 3,
            TaskResult::MaxRetries => 6 << 3,
            TaskResult::MaxWallTime => 7 << 3,
            TaskResult::DiskFull => 8 << 3,
            TaskResult::MonitorError => 9 << 3,
            TaskResult::OutputTransferError => 10 << 3,
        }
    }

    /// Decodes a wire status; unrecognized codes map to `Unknown`.
    pub fn from_code(code: i64) -> TaskResult {
        match code {
            0 => TaskResult::Success,
            1 => TaskResult::InputMissing,
            2 => TaskResult::OutputMissing,
            4 => TaskResult::StdoutMissing,
            8 => TaskResult::Signal,
            16 => TaskResult::ResourceExhaustion,
            24 => TaskResult::TaskTimeout,
            40 => TaskResult::Forsaken,
            48 => TaskResult::MaxRetries,
            56 => TaskResult::MaxWallTime,
            64 => TaskResult::DiskFull,
            72 => TaskResult::MonitorError,
            80 => TaskResult::OutputTransferError,
            _ => TaskResult::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskResult::Success => "SUCCESS",
            TaskResult::InputMissing => "INPUT_MISS",
            TaskResult::OutputMissing => "OUTPUT_MISS",
            TaskResult::StdoutMissing => "STDOUT_MISS",
            TaskResult::Signal => "SIGNAL",
            TaskResult::ResourceExhaustion => "RESOURCE_EXHAUSTION",
            TaskResult::TaskTimeout => "END_TIME",
            TaskResult::Unknown => "UNKNOWN",
            TaskResult::Forsaken => "FORSAKEN",
            TaskResult::MaxRetries => "MAX_RETRIES",
            TaskResult::MaxWallTime => "MAX_WALL_TIME",
            TaskResult::DiskFull => "DISK_FULL",
            TaskResult::MonitorError => "MONITOR_ERROR",
            TaskResult::OutputTransferError => "OUTPUT_TRANSFER_ERROR",
        }
    }
}

/// Which allocation class a task runs under within its category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AllocationLabel {
    /// The category's first-allocation guess.
    First,
    /// The category's maximum allocation.
    Max,
}

/// What a task file is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileKind {
    File,
    Directory,
}

/// Per-file transfer flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FileFlags {
    /// Keep the file in the worker cache across tasks.
    pub cache: bool,
    /// Stream appended output back while the task runs.
    pub watch: bool,
}

impl FileFlags {
    pub fn bits(self) -> u32 {
        (self.cache as u32) | ((self.watch as u32) << 1)
    }
}

/// One input or output file of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileSpec {
    /// Path on the manager side.
    pub source: String,
    /// Name in the worker's cache.
    pub cached_name: String,
    /// Name visible to the task in its sandbox.
    pub remote_name: String,
    pub kind: FileKind,
    pub flags: FileFlags,
}

fn cached_name_for(source: &str) -> String {
    let safe: String = source
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    format!("file-{}", safe.trim_start_matches('_'))
}

/// A unit of work submitted to the manager.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    /// Unique id; 0 until first submitted.
    pub taskid: TaskId,
    /// Optional opaque tag for application-side lookup.
    pub tag: Option<String>,
    /// Category name; defaults to `"default"`.
    pub category: String,
    /// The command line to execute.
    pub command: String,
    /// Optional coprocess command started alongside the task.
    pub coprocess: Option<String>,
    /// Ordered `KEY=VALUE` environment entries.
    pub env: Vec<String>,
    pub input_files: Vec<FileSpec>,
    pub output_files: Vec<FileSpec>,
    /// Features the hosting worker must advertise.
    pub required_features: BTreeSet<String>,
    pub resources_requested: ResourceRequest,
    /// Allocation class for the next attempt.
    pub resource_request: AllocationLabel,
    /// Higher runs first.
    pub priority: f64,
    /// Attempt limit; 0 means unlimited.
    pub max_retries: u32,

    // Dynamic state, owned by the manager between submit and wait.
    pub state: TaskState,
    pub result: TaskResult,
    pub exit_code: i64,
    pub try_count: u32,
    pub fast_abort_count: u32,
    pub exhausted_attempts: u32,
    #[serde(skip)]
    pub worker: Option<WorkerKey>,
    /// Hostname of the last worker the task ran on.
    pub hostname: Option<String>,
    /// Address of the last worker the task ran on.
    pub addrport: Option<String>,
    /// Captured stdout, bounded by the configured storage limit.
    #[serde(skip)]
    pub output: Vec<u8>,
    /// Resources allocated at the last commit.
    pub resources_allocated: Option<ResourceBox>,
    /// Resources measured by an external monitor, when one runs.
    pub resources_measured: Option<ResourceBox>,

    // Timestamps in microseconds since the epoch; 0 until set.
    pub time_when_submitted: u64,
    pub time_when_commit_start: u64,
    pub time_when_commit_end: u64,
    pub time_when_retrieval: u64,
    pub time_when_done: u64,

    // Execution-time accounting in microseconds.
    pub time_workers_execute_last: u64,
    pub time_workers_execute_all: u64,
    pub time_workers_execute_failure: u64,
    pub time_workers_execute_exhaustion: u64,

    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl Task {
    /// Creates a task running `command` in the default category.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            taskid: 0,
            tag: None,
            category: "default".to_string(),
            command: command.into(),
            coprocess: None,
            env: Vec::new(),
            input_files: Vec::new(),
            output_files: Vec::new(),
            required_features: BTreeSet::new(),
            resources_requested: ResourceRequest::default(),
            resource_request: AllocationLabel::First,
            priority: 0.0,
            max_retries: 0,
            state: TaskState::Unknown,
            result: TaskResult::Unknown,
            exit_code: -1,
            try_count: 0,
            fast_abort_count: 0,
            exhausted_attempts: 0,
            worker: None,
            hostname: None,
            addrport: None,
            output: Vec::new(),
            resources_allocated: None,
            resources_measured: None,
            time_when_submitted: 0,
            time_when_commit_start: 0,
            time_when_commit_end: 0,
            time_when_retrieval: 0,
            time_when_done: 0,
            time_workers_execute_last: 0,
            time_workers_execute_all: 0,
            time_workers_execute_failure: 0,
            time_workers_execute_exhaustion: 0,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_coprocess(mut self, command: impl Into<String>) -> Self {
        self.coprocess = Some(command.into());
        self
    }

    /// Appends an environment entry; order is preserved on the wire.
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push(format!("{key}={value}"));
        self
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_cores(mut self, cores: i64) -> Self {
        self.resources_requested.cores = Some(cores);
        self
    }

    pub fn with_memory(mut self, mb: i64) -> Self {
        self.resources_requested.memory = Some(mb);
        self
    }

    pub fn with_disk(mut self, mb: i64) -> Self {
        self.resources_requested.disk = Some(mb);
        self
    }

    pub fn with_gpus(mut self, gpus: i64) -> Self {
        self.resources_requested.gpus = Some(gpus);
        self
    }

    /// Sets an absolute deadline, seconds since the epoch.
    pub fn with_end_time(mut self, end: i64) -> Self {
        self.resources_requested.end = Some(end);
        self
    }

    pub fn with_wall_time(mut self, seconds: i64) -> Self {
        self.resources_requested.wall_time = Some(seconds);
        self
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.required_features.insert(feature.into());
        self
    }

    /// Declares an input file staged into the worker cache.
    pub fn with_input_file(mut self, source: &str, remote_name: &str, flags: FileFlags) -> Self {
        self.input_files.push(FileSpec {
            source: source.to_string(),
            cached_name: cached_name_for(source),
            remote_name: remote_name.to_string(),
            kind: FileKind::File,
            flags,
        });
        self
    }

    /// Declares a directory to be created in the task sandbox.
    pub fn with_input_directory(mut self, remote_name: &str) -> Self {
        self.input_files.push(FileSpec {
            source: remote_name.to_string(),
            cached_name: cached_name_for(remote_name),
            remote_name: remote_name.to_string(),
            kind: FileKind::Directory,
            flags: FileFlags::default(),
        });
        self
    }

    /// Declares an output file fetched back after the task runs.
    pub fn with_output_file(mut self, source: &str, remote_name: &str, flags: FileFlags) -> Self {
        self.output_files.push(FileSpec {
            source: source.to_string(),
            cached_name: cached_name_for(source),
            remote_name: remote_name.to_string(),
            kind: FileKind::File,
            flags,
        });
        self
    }

    /// Clears the state accumulated during one attempt so the task can run
    /// again. A full clean also resets the cross-attempt counters, which is
    /// what resubmission after a terminal state does.
    pub fn clean(&mut self, full: bool) {
        self.output.clear();
        self.hostname = None;
        self.addrport = None;
        self.time_when_commit_start = 0;
        self.time_when_commit_end = 0;
        self.time_when_retrieval = 0;
        self.resources_allocated = None;
        self.resources_measured = None;

        if full {
            self.state = TaskState::Unknown;
            self.result = TaskResult::Unknown;
            self.exit_code = -1;
            self.try_count = 0;
            self.fast_abort_count = 0;
            self.exhausted_attempts = 0;
            self.resource_request = AllocationLabel::First;
            self.time_when_submitted = 0;
            self.time_when_done = 0;
            self.time_workers_execute_last = 0;
            self.time_workers_execute_all = 0;
            self.time_workers_execute_failure = 0;
            self.time_workers_execute_exhaustion = 0;
            self.bytes_sent = 0;
            self.bytes_received = 0;
        }
    }

    /// True when the tag matches; two missing tags match each other.
    pub fn tag_matches(&self, tag: Option<&str>) -> bool {
        match (self.tag.as_deref(), tag) {
            (None, None) => true,
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_definition() {
        let t = Task::new("/bin/echo hi")
            .with_category("render")
            .with_cores(2)
            .with_memory(512)
            .with_env("A", "1")
            .with_priority(3.0)
            .with_feature("nvme");
        assert_eq!(t.category, "render");
        assert_eq!(t.resources_requested.cores, Some(2));
        assert_eq!(t.env, vec!["A=1".to_string()]);
        assert!(t.required_features.contains("nvme"));
        assert_eq!(t.state, TaskState::Unknown);
    }

    #[test]
    fn result_codes_round_trip() {
        for r in [
            TaskResult::Success,
            TaskResult::InputMissing,
            TaskResult::OutputMissing,
            TaskResult::StdoutMissing,
            TaskResult::Signal,
            TaskResult::ResourceExhaustion,
            TaskResult::TaskTimeout,
            TaskResult::Forsaken,
            TaskResult::MaxRetries,
            TaskResult::MaxWallTime,
            TaskResult::DiskFull,
            TaskResult::MonitorError,
            TaskResult::OutputTransferError,
        ] {
            assert_eq!(TaskResult::from_code(r.code()), r);
        }
        assert_eq!(TaskResult::from_code(9999), TaskResult::Unknown);
    }

    #[test]
    fn full_clean_resets_attempt_state() {
        let mut t = Task::new("true");
        t.try_count = 4;
        t.exit_code = 1;
        t.output = b"old".to_vec();
        t.resource_request = AllocationLabel::Max;
        t.clean(true);
        assert_eq!(t.try_count, 0);
        assert!(t.output.is_empty());
        assert_eq!(t.resource_request, AllocationLabel::First);
    }

    #[test]
    fn partial_clean_keeps_counters() {
        let mut t = Task::new("true");
        t.try_count = 2;
        t.output = b"old".to_vec();
        t.clean(false);
        assert_eq!(t.try_count, 2);
        assert!(t.output.is_empty());
    }

    #[test]
    fn tags_compare_like_the_wire() {
        let t = Task::new("true").with_tag("alpha");
        assert!(t.tag_matches(Some("alpha")));
        assert!(!t.tag_matches(Some("beta")));
        assert!(!t.tag_matches(None));
        assert!(Task::new("true").tag_matches(None));
    }

    #[test]
    fn file_flags_encode() {
        let f = FileFlags { cache: true, watch: false };
        assert_eq!(f.bits(), 1);
        let f = FileFlags { cache: true, watch: true };
        assert_eq!(f.bits(), 3);
    }
}
