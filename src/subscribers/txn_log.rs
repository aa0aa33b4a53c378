//! # Transaction log.
//!
//! [`TxnLogWriter`] appends one line per lifecycle event to a file,
//! bracketed by `MANAGER START` and `MANAGER END`. The format is one event
//! per line, microsecond timestamp first, so the log can be replayed or
//! grepped without any tooling.

use std::path::Path;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::events::{Event, EventKind};
use crate::subscribers::Subscriber;

/// Appends lifecycle events to a transaction log file.
pub struct TxnLogWriter {
    file: Mutex<File>,
}

impl TxnLogWriter {
    /// Opens (or creates) the log for appending, writing the header and
    /// the `MANAGER START` bookend. `MANAGER END` arrives as an event when
    /// the manager shuts down.
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(b"# time manager_pid MANAGER|WORKER|CATEGORY|TASK details\n")
            .await?;
        let writer = Self {
            file: Mutex::new(file),
        };
        writer.handle(&Event::now(EventKind::ManagerStart)).await;
        Ok(writer)
    }

    fn format(event: &Event) -> Option<String> {
        let us = event
            .at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros())
            .unwrap_or(0);
        let pid = std::process::id();

        let body = match event.kind {
            EventKind::ManagerStart => "MANAGER START".to_string(),
            EventKind::ManagerEnd => "MANAGER END".to_string(),
            EventKind::TaskStateChange => format!(
                "TASK {} {}",
                event.taskid.unwrap_or(0),
                event.state.map(|s| s.as_str()).unwrap_or("UNKNOWN"),
            ),
            EventKind::WorkerConnected => format!(
                "WORKER {} CONNECTION",
                event.worker.as_deref().unwrap_or("?"),
            ),
            EventKind::WorkerJoined => format!(
                "WORKER {} JOINED {}",
                event.worker.as_deref().unwrap_or("?"),
                event.host.as_deref().unwrap_or("unknown"),
            ),
            EventKind::WorkerRemoved => format!(
                "WORKER {} DISCONNECTION {}",
                event.worker.as_deref().unwrap_or("?"),
                event.reason.as_deref().unwrap_or("unknown"),
            ),
            EventKind::WorkerResources => format!(
                "WORKER {} RESOURCES {}",
                event.worker.as_deref().unwrap_or("?"),
                event.reason.as_deref().unwrap_or(""),
            ),
            EventKind::CategoryChanged => {
                format!("CATEGORY {}", event.category.as_deref().unwrap_or("default"))
            }
            EventKind::HostBlocked => {
                format!("HOST {} BLOCKED", event.host.as_deref().unwrap_or("?"))
            }
            EventKind::HostUnblocked => {
                format!("HOST {} UNBLOCKED", event.host.as_deref().unwrap_or("?"))
            }
            EventKind::PerfSnapshot => return None,
        };

        Some(format!("{us} {pid} {body}\n"))
    }
}

#[async_trait]
impl Subscriber for TxnLogWriter {
    async fn handle(&self, event: &Event) {
        let Some(line) = Self::format(event) else {
            return;
        };
        let mut file = self.file.lock().await;
        let _ = file.write_all(line.as_bytes()).await;
        let _ = file.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskState;

    #[tokio::test]
    async fn log_lines_have_the_documented_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("txn.log");
        let writer = TxnLogWriter::open(&path).await.unwrap();

        writer
            .handle(&Event::now(EventKind::TaskStateChange).with_task(7, TaskState::Ready))
            .await;
        writer
            .handle(
                &Event::now(EventKind::WorkerRemoved)
                    .with_worker("10.0.0.9:9123")
                    .with_reason("fast_abort"),
            )
            .await;
        writer.handle(&Event::now(EventKind::ManagerEnd)).await;

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with('#'));
        assert!(lines[1].ends_with("MANAGER START"));
        assert!(lines[2].ends_with("TASK 7 READY"));
        assert!(lines[3].ends_with("WORKER 10.0.0.9:9123 DISCONNECTION fast_abort"));
        assert!(lines[4].ends_with("MANAGER END"));
    }

    #[tokio::test]
    async fn snapshots_are_not_logged_here() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("txn.log");
        let writer = TxnLogWriter::open(&path).await.unwrap();
        writer.handle(&Event::now(EventKind::PerfSnapshot)).await;
        let text = std::fs::read_to_string(&path).unwrap();
        // Just the header and the start bookend.
        assert_eq!(text.lines().count(), 2);
    }
}
