//! # Event subscribers.
//!
//! A [`Subscriber`] consumes lifecycle [`Event`](crate::events::Event)s
//! from the manager's broadcast stream in its own task, so logging never
//! stalls the wait loop. Two file-backed subscribers ship with the crate:
//!
//! - [`TxnLogWriter`] appends one line per event, bracketed by
//!   `MANAGER START` / `MANAGER END`.
//! - [`PerfLogWriter`] appends a tabular stats snapshot whenever the task
//!   mix changes.

mod perf_log;
mod subscriber;
mod txn_log;

pub use perf_log::PerfLogWriter;
pub use subscriber::Subscriber;
pub use txn_log::TxnLogWriter;
