//! # dataswarm
//!
//! **dataswarm** is the manager (coordinator) side of a distributed worker
//! pool: applications submit tasks, a dynamic set of remote workers runs
//! them, and the manager tracks every task from submission through
//! dispatch, execution, retrieval, and completion, recovering from worker
//! failures along the way.
//!
//! ## Features
//!
//! | Area            | Description                                                         | Key types / traits                          |
//! |-----------------|---------------------------------------------------------------------|---------------------------------------------|
//! | **Tasks**       | Define commands, files, environment, and resource requests.         | [`Task`], [`FileFlags`], [`ResourceRequest`] |
//! | **Lifecycle**   | Submit, wait, cancel; at-least-once retries on worker failure.      | [`Manager`], [`TaskState`], [`TaskResult`]  |
//! | **Scheduling**  | Policy-driven worker choice and category-driven allocation sizing.  | [`SchedulePolicy`], [`AllocationMode`]      |
//! | **Events**      | Typed lifecycle events with file-backed log subscribers.            | [`Subscriber`], [`TxnLogWriter`]            |
//! | **Seams**       | File staging and catalog discovery stay outside the crate.          | [`Stager`], [`CatalogClient`]               |
//! | **Errors**      | Typed errors split along the recovery axis.                         | [`ManagerError`], [`LinkError`]             |
//!
//! ```no_run
//! use std::time::Duration;
//! use dataswarm::{Manager, ManagerConfig, Task};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut manager = Manager::bind(ManagerConfig::default()).await?;
//!     println!("listening on port {}", manager.port());
//!
//!     manager.submit(Task::new("/bin/echo hello").with_cores(1))?;
//!
//!     while !manager.empty() {
//!         if let Some(task) = manager.wait(Some(Duration::from_secs(5))).await {
//!             println!("task {} finished: {:?}", task.taskid, task.result);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! The manager is deliberately single-threaded: one [`Manager`] value owns
//! every table and connection, and all state changes happen on the task
//! driving [`Manager::wait`]. Workers may come and go at any time; tasks
//! assigned to a vanished worker go back to the ready queue with their try
//! counts intact.
//!
//! ---

#![recursion_limit = "256"]

mod blocklist;
mod capacity;
mod catalog;
mod category;
mod config;
mod error;
mod events;
mod factory;
mod link;
mod manager;
mod protocol;
mod registry;
mod resources;
mod scheduler;
mod stager;
mod stats;
mod subscribers;
mod task;
mod worker;

// ---- Public re-exports ----

pub use catalog::CatalogClient;
pub use category::AllocationMode;
pub use config::ManagerConfig;
pub use error::{FailureKind, LinkError, ManagerError, StageError};
pub use events::{Event, EventKind};
pub use factory::{FactoryInfo, FactoryUpdate};
pub use manager::Manager;
pub use resources::{Resource, ResourceBox, ResourceRequest, WorkerResources};
pub use scheduler::SchedulePolicy;
pub use stager::{NullStager, StageReport, StageTarget, Stager};
pub use stats::ManagerStats;
pub use subscribers::{PerfLogWriter, Subscriber, TxnLogWriter};
pub use task::{
    AllocationLabel, FileFlags, FileKind, FileSpec, Task, TaskId, TaskResult, TaskState,
};
pub use worker::{DisconnectReason, WorkerKey, WorkerType};
