//! # Error types used by the manager and its transport.
//!
//! This module defines the main error enums:
//!
//! - [`ManagerError`] errors raised by the manager itself (bind, submit, tuning).
//! - [`LinkError`] errors raised by the line-oriented worker transport.
//! - [`StageError`] errors raised by the file staging seam.
//!
//! [`FailureKind`] classifies a failure along the recovery axis: a worker
//! failure is recovered locally by removing the worker and requeueing its
//! tasks, while an application failure is surfaced to the submitter.

use std::time::Duration;

use thiserror::Error;

use crate::task::TaskResult;

/// Errors produced by the manager itself.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ManagerError {
    /// The listening socket could not be created.
    #[error("could not serve on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// A task was submitted while still in a non-terminal state.
    #[error("task {taskid} has already been submitted and is not in any final state")]
    AlreadySubmitted { taskid: u64 },

    /// An unknown tuning parameter name was given to `tune`.
    #[error("tuning parameter '{name}' not recognized")]
    UnknownParameter { name: String },

    /// A log file could not be opened for appending.
    #[error("couldn't open logfile {path}: {source}")]
    LogOpen {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ManagerError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ManagerError::Bind { .. } => "manager_bind",
            ManagerError::AlreadySubmitted { .. } => "manager_already_submitted",
            ManagerError::UnknownParameter { .. } => "manager_unknown_parameter",
            ManagerError::LogOpen { .. } => "manager_log_open",
        }
    }
}

/// Errors produced by the worker link transport.
///
/// Any of these on a worker connection means the worker is lost: the caller
/// removes it and requeues its tasks.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LinkError {
    /// The remote side closed the connection.
    #[error("connection closed by remote side")]
    Closed,

    /// The operation did not finish before its deadline.
    #[error("timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// An incoming line exceeded the protocol line limit.
    #[error("line longer than {limit} bytes")]
    LineTooLong { limit: usize },

    /// Any other socket error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            LinkError::Closed => "link_closed",
            LinkError::Timeout { .. } => "link_timeout",
            LinkError::LineTooLong { .. } => "link_line_too_long",
            LinkError::Io(_) => "link_io",
        }
    }
}

/// Errors produced by the file staging seam.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum StageError {
    /// The worker connection failed mid-transfer; the worker must be removed.
    #[error("worker transfer failure: {0}")]
    Worker(String),

    /// A task input could not be produced for shipping.
    #[error("missing input: {0}")]
    MissingInput(String),

    /// A task output was not present on the worker.
    #[error("missing output: {0}")]
    MissingOutput(String),

    /// An output transfer started but did not complete.
    #[error("output transfer error: {0}")]
    Transfer(String),
}

impl StageError {
    /// Classifies the staging error along the recovery axis.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            StageError::Worker(_) => FailureKind::Worker,
            StageError::MissingInput(_) => FailureKind::App(TaskResult::InputMissing),
            StageError::MissingOutput(_) => FailureKind::App(TaskResult::OutputMissing),
            StageError::Transfer(_) => FailureKind::App(TaskResult::OutputTransferError),
        }
    }
}

/// Who owns the recovery of a failure.
///
/// Worker failures remove the worker and requeue its tasks with their try
/// counts preserved. Application failures mark the task with the given result
/// and hand it back to the submitter at the next `wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Worker,
    App(TaskResult),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_errors_classify() {
        assert_eq!(
            StageError::MissingInput("a".into()).failure_kind(),
            FailureKind::App(TaskResult::InputMissing)
        );
        assert_eq!(StageError::Worker("b".into()).failure_kind(), FailureKind::Worker);
    }

    #[test]
    fn labels_are_stable() {
        assert_eq!(LinkError::Closed.as_label(), "link_closed");
        assert_eq!(
            ManagerError::UnknownParameter { name: "x".into() }.as_label(),
            "manager_unknown_parameter"
        );
    }
}
