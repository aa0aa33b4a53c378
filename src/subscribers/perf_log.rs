//! # Performance log.
//!
//! [`PerfLogWriter`] consumes [`EventKind::PerfSnapshot`] events and
//! appends one tab-separated row of counters per snapshot, with a header
//! row naming the columns, ready for plotting.

use std::path::Path;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::events::{Event, EventKind};
use crate::stats::ManagerStats;
use crate::subscribers::Subscriber;

const COLUMNS: &[&str] = &[
    "timestamp",
    "tasks_waiting",
    "tasks_running",
    "tasks_done",
    "tasks_failed",
    "workers_connected",
    "workers_busy",
    "workers_joined",
    "workers_removed",
    "bytes_sent",
    "bytes_received",
    "capacity_tasks",
    "capacity_weighted",
    "manager_load",
];

/// Appends stats snapshots to a tabular log file.
pub struct PerfLogWriter {
    file: Mutex<File>,
}

impl PerfLogWriter {
    /// Opens (or creates) the log for appending and writes the header row.
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let mut header = String::from("#");
        for c in COLUMNS {
            header.push(' ');
            header.push_str(c);
        }
        header.push('\n');
        file.write_all(header.as_bytes()).await?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn format_row(at_us: u128, s: &ManagerStats) -> String {
        format!(
            "{at_us}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{:.4}\n",
            s.tasks_waiting,
            s.tasks_running,
            s.tasks_done,
            s.tasks_failed,
            s.workers_connected,
            s.workers_busy,
            s.workers_joined,
            s.workers_removed,
            s.bytes_sent,
            s.bytes_received,
            s.capacity_tasks,
            s.capacity_weighted,
            s.manager_load,
        )
    }
}

#[async_trait]
impl Subscriber for PerfLogWriter {
    async fn handle(&self, event: &Event) {
        if event.kind != EventKind::PerfSnapshot {
            return;
        }
        let Some(stats) = event.stats.as_deref() else {
            return;
        };
        let at_us = event
            .at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros())
            .unwrap_or(0);
        let row = Self::format_row(at_us, stats);
        let mut file = self.file.lock().await;
        let _ = file.write_all(row.as_bytes()).await;
        let _ = file.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rows_follow_the_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf.log");
        let writer = PerfLogWriter::open(&path).await.unwrap();

        let mut stats = ManagerStats::default();
        stats.tasks_waiting = 3;
        stats.workers_connected = 2;
        writer
            .handle(&Event::now(EventKind::PerfSnapshot).with_stats(stats))
            .await;

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("# timestamp"));
        let fields: Vec<&str> = lines[1].split('\t').collect();
        assert_eq!(fields.len(), COLUMNS.len());
        assert_eq!(fields[1], "3");
        assert_eq!(fields[5], "2");
    }

    #[tokio::test]
    async fn other_events_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf.log");
        let writer = PerfLogWriter::open(&path).await.unwrap();
        writer.handle(&Event::now(EventKind::ManagerStart)).await;
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 1);
    }
}
