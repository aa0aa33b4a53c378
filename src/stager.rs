//! # File staging seam.
//!
//! Shipping task inputs to a worker and fetching outputs back is delegated
//! to a [`Stager`]. The manager only cares about success or failure and the
//! transfer accounting; how bytes move (manager link, peer transfers, a
//! shared filesystem) is the stager's business. The default stager moves
//! nothing and always succeeds, which is the right behavior for workers
//! that share storage with the manager.

use async_trait::async_trait;

use crate::error::StageError;
use crate::task::Task;

/// Where the files go, described without handing out the control link.
#[derive(Debug, Clone)]
pub struct StageTarget {
    pub hostname: String,
    pub addrport: String,
    /// Peer-transfer endpoint, when the worker advertised one.
    pub transfer_addr: Option<(String, u16)>,
}

/// Transfer accounting returned by a staging operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct StageReport {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Wall time spent transferring, microseconds.
    pub transfer_time: u64,
}

/// Moves task files between the manager and a worker.
#[async_trait]
pub trait Stager: Send + Sync {
    /// Ships the task's input files into the worker's cache.
    async fn put_inputs(&self, target: &StageTarget, task: &Task) -> Result<StageReport, StageError>;

    /// Fetches the task's output files back to their local sources.
    async fn get_outputs(&self, target: &StageTarget, task: &Task)
        -> Result<StageReport, StageError>;

    /// Fetches only the monitor summary of a resource-exhausted task.
    async fn get_monitor_output(
        &self,
        target: &StageTarget,
        task: &Task,
    ) -> Result<StageReport, StageError>;
}

/// A stager that transfers nothing and always succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStager;

#[async_trait]
impl Stager for NullStager {
    async fn put_inputs(&self, _: &StageTarget, _: &Task) -> Result<StageReport, StageError> {
        Ok(StageReport::default())
    }

    async fn get_outputs(&self, _: &StageTarget, _: &Task) -> Result<StageReport, StageError> {
        Ok(StageReport::default())
    }

    async fn get_monitor_output(
        &self,
        _: &StageTarget,
        _: &Task,
    ) -> Result<StageReport, StageError> {
        Ok(StageReport::default())
    }
}
