//! # Capacity estimation.
//!
//! The manager keeps a rolling window of recent task reports and derives
//! from it how many tasks (and how much of each resource) the pool could
//! sustain, for the catalog and for factories deciding whether to spawn
//! more workers.

use std::collections::VecDeque;

use serde::Serialize;

use crate::resources::ResourceBox;

/// The capacity reported before any task has completed. The defaults also
/// imply 1 core, 512 MB memory and 1024 MB disk per task.
pub const DEFAULT_CAPACITY_TASKS: i64 = 10;

/// Minimum number of task reports kept in the window.
pub const MIN_REPORTS: usize = 50;

/// Exponential weight of the newest instantaneous sample.
const ALPHA: f64 = 0.05;

/// Timing record of one completed task.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TaskReport {
    /// Input shipping plus output retrieval, microseconds.
    pub transfer_time: i64,
    /// Remote execution, microseconds.
    pub exec_time: i64,
    /// Manager-side overhead, microseconds.
    pub manager_time: i64,
    /// Resources the task was allocated.
    pub resources: ResourceBox,
}

/// Derived capacity numbers.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct Capacity {
    pub tasks: i64,
    pub cores: i64,
    pub memory: i64,
    pub disk: i64,
    pub gpus: i64,
    pub instantaneous: i64,
    pub weighted: i64,
}

/// Rolling window of task reports with an EWMA of instantaneous capacity.
#[derive(Debug)]
pub struct CapacityEstimator {
    reports: VecDeque<TaskReport>,
    /// Window size; grows with the number of tasks on workers and never
    /// shrinks back below its high-water mark.
    keep: usize,
    weighted: i64,
}

impl CapacityEstimator {
    pub fn new() -> Self {
        Self {
            reports: VecDeque::new(),
            keep: MIN_REPORTS,
            weighted: DEFAULT_CAPACITY_TASKS,
        }
    }

    /// Appends one report, trimming the window to at least [`MIN_REPORTS`]
    /// entries and at least twice the number of tasks currently on workers.
    pub fn add_report(&mut self, report: TaskReport, tasks_on_workers: usize) {
        self.reports.push_back(report);
        self.keep = self.keep.max(2 * tasks_on_workers);
        while self.reports.len() >= self.keep {
            self.reports.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    /// Computes the current capacity estimate and advances the EWMA.
    pub fn compute(&mut self) -> Capacity {
        let mut cap = Capacity::default();

        if self.reports.is_empty() {
            cap.tasks = DEFAULT_CAPACITY_TASKS;
            cap.cores = 1;
            cap.memory = 512;
            cap.disk = 1024;
            cap.gpus = 0;
            cap.instantaneous = DEFAULT_CAPACITY_TASKS;
            self.weighted = DEFAULT_CAPACITY_TASKS;
            cap.weighted = self.weighted;
            return cap;
        }

        let mut transfer: i64 = 0;
        let mut exec: i64 = 0;
        let mut manager: i64 = 0;
        let mut cores: i64 = 0;
        let mut memory: i64 = 0;
        let mut disk: i64 = 0;
        let mut gpus: i64 = 0;

        for r in &self.reports {
            transfer += r.transfer_time;
            exec += r.exec_time;
            manager += r.manager_time;
            cores += r.resources.cores;
            memory += r.resources.memory;
            disk += r.resources.disk;
            gpus += r.resources.gpus;
        }

        let last = self.reports.back().expect("nonempty window");
        if last.transfer_time > 0 {
            let instantaneous = div_round_up(last.exec_time, last.transfer_time + last.manager_time);
            cap.instantaneous = instantaneous;
            self.weighted =
                (ALPHA * instantaneous as f64 + (1.0 - ALPHA) * self.weighted as f64).ceil() as i64;
        }
        cap.weighted = self.weighted;

        // Floor every time to one microsecond to avoid dividing by zero.
        let transfer = transfer.max(1);
        let exec = exec.max(1);
        let manager = manager.max(1);

        let count = self.reports.len() as i64;
        let ratio = DEFAULT_CAPACITY_TASKS.max(div_round_up(exec, transfer + manager));

        cap.tasks = ratio;
        cap.cores = div_round_up(cores * ratio, count);
        cap.memory = div_round_up(memory * ratio, count);
        cap.disk = div_round_up(disk * ratio, count);
        cap.gpus = div_round_up(gpus * ratio, count);
        cap
    }
}

impl Default for CapacityEstimator {
    fn default() -> Self {
        Self::new()
    }
}

fn div_round_up(a: i64, b: i64) -> i64 {
    if b <= 0 {
        return a;
    }
    (a + b - 1) / b
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(transfer: i64, exec: i64, manager: i64) -> TaskReport {
        TaskReport {
            transfer_time: transfer,
            exec_time: exec,
            manager_time: manager,
            resources: ResourceBox {
                cores: 1,
                memory: 512,
                disk: 1024,
                gpus: 0,
                ..Default::default()
            },
        }
    }

    #[test]
    fn empty_window_reports_defaults() {
        let mut est = CapacityEstimator::new();
        let cap = est.compute();
        assert_eq!(cap.tasks, 10);
        assert_eq!(cap.cores, 1);
        assert_eq!(cap.memory, 512);
        assert_eq!(cap.disk, 1024);
        assert_eq!(cap.weighted, 10);
    }

    #[test]
    fn capacity_floors_at_default() {
        let mut est = CapacityEstimator::new();
        // Tasks slower to transfer than to run: ratio would be 1.
        est.add_report(report(1_000_000, 1_000_000, 10), 0);
        let cap = est.compute();
        assert_eq!(cap.tasks, 10);
        assert!(cap.weighted >= 10);
    }

    #[test]
    fn fast_tasks_raise_capacity() {
        let mut est = CapacityEstimator::new();
        for _ in 0..10 {
            // 100x more execution than transfer+manager overhead.
            est.add_report(report(10_000, 1_000_000, 0), 4);
        }
        let cap = est.compute();
        assert_eq!(cap.tasks, 100);
        assert_eq!(cap.cores, 100);
        assert!(cap.instantaneous >= 100);
    }

    #[test]
    fn weighted_moves_slowly() {
        let mut est = CapacityEstimator::new();
        est.add_report(report(10_000, 10_000_000, 0), 0);
        let cap = est.compute();
        // One sample of 1000 against a prior of 10: ceil(0.05*1000 + 0.95*10).
        assert_eq!(cap.weighted, 60);
    }

    #[test]
    fn window_trims_but_keeps_high_water_mark() {
        let mut est = CapacityEstimator::new();
        for _ in 0..200 {
            est.add_report(report(1, 1, 1), 100);
        }
        assert!(est.len() >= MIN_REPORTS);
        assert!(est.len() < 201);
        // High-water mark: window stays at 2*100 even after load drops.
        for _ in 0..10 {
            est.add_report(report(1, 1, 1), 0);
        }
        assert!(est.len() > MIN_REPORTS);
    }
}
