//! # Status reporting.
//!
//! Everything observable about the manager: the stats snapshot, the JSON
//! payloads served over the status/HTTP responders, and the records sent
//! to the catalog.

use serde_json::{json, Value};

use crate::events::{Event, EventKind};
use crate::protocol::VERSION;
use crate::resources::{ResourceBox, ResourceRequest, WorkerResources};
use crate::stats::ManagerStats;
use crate::task::{AllocationLabel, TaskState};
use crate::worker::WorkerType;

use super::{timestamp, Manager};

/// Minimum gap between perf snapshots, microseconds.
const PERF_SNAPSHOT_INTERVAL: u64 = 15_000_000;

impl Manager {
    /// A full statistics snapshot with all derived fields computed.
    pub fn stats(&mut self) -> ManagerStats {
        let mut s = self.stats.clone();

        s.workers_connected = self.workers.count(WorkerType::Worker) as u64;
        s.workers_init = self.workers.count(WorkerType::Unknown) as u64;
        s.workers_busy = self.workers.count_with_tasks() as u64;
        s.workers_idle = s.workers_connected.saturating_sub(s.workers_busy);

        s.tasks_waiting = self.task_state_count(None, TaskState::Ready) as u64;
        s.tasks_with_results = self.task_state_count(None, TaskState::WaitingRetrieval) as u64;
        s.tasks_on_workers =
            self.task_state_count(None, TaskState::Running) as u64 + s.tasks_with_results;

        // Worker-reported running counts arrive with heartbeats and can
        // run ahead of our own tables; clamp them.
        let reported: u64 = self.workers.iter().map(|(_, w)| w.stats.tasks_running).sum();
        s.tasks_running = reported.min(s.tasks_on_workers);

        let cap = self.capacity.compute();
        s.capacity_tasks = cap.tasks;
        s.capacity_cores = cap.cores;
        s.capacity_memory = cap.memory;
        s.capacity_disk = cap.disk;
        s.capacity_gpus = cap.gpus;
        s.capacity_instantaneous = cap.instantaneous;
        s.capacity_weighted = cap.weighted;

        s.bandwidth = self.effective_bandwidth();

        let r = self.aggregate_worker_resources();
        s.total_cores = r.cores.total;
        s.total_memory = r.memory.total;
        s.total_disk = r.disk.total;
        s.total_gpus = r.gpus.total;
        s.committed_cores = r.cores.inuse;
        s.committed_memory = r.memory.inuse;
        s.committed_disk = r.disk.inuse;
        s.committed_gpus = r.gpus.inuse;
        s.min_cores = r.cores.smallest;
        s.max_cores = r.cores.largest;
        s.min_memory = r.memory.smallest;
        s.max_memory = r.memory.largest;
        s.min_disk = r.disk.smallest;
        s.max_disk = r.disk.largest;
        s.min_gpus = r.gpus.smallest;
        s.max_gpus = r.gpus.largest;

        let largest = self.largest_seen_resources(None);
        s.workers_able = self.count_workers_able(&largest);

        s
    }

    /// Statistics restricted to one category.
    pub fn stats_category(&mut self, category: &str) -> ManagerStats {
        let mut s = self
            .categories
            .lookup_or_create(category)
            .stats
            .clone();

        s.tasks_waiting = self.task_state_count(Some(category), TaskState::Ready) as u64;
        s.tasks_running = self.task_state_count(Some(category), TaskState::Running) as u64;
        s.tasks_with_results =
            self.task_state_count(Some(category), TaskState::WaitingRetrieval) as u64;
        s.tasks_on_workers = s.tasks_running + s.tasks_with_results;
        let total = self
            .categories
            .get(category)
            .map(|c| c.total_tasks)
            .unwrap_or(0);
        s.tasks_submitted = total + s.tasks_waiting + s.tasks_on_workers;

        let largest = self.largest_seen_resources(Some(category));
        s.workers_able = self.count_workers_able(&largest);
        s
    }

    /// The JSON answer to a named status request, `None` for unknown ones.
    pub(crate) fn construct_status_message(&mut self, request: &str) -> Option<Value> {
        match request {
            "queue_status" | "queue" | "resources_status" => {
                Some(Value::Array(vec![self.queue_to_json()]))
            }
            "task_status" | "tasks" => {
                let tasks: Vec<Value> = self
                    .tasks
                    .values()
                    .map(|t| {
                        json!({
                            "taskid": t.taskid,
                            "tag": t.tag,
                            "category": t.category,
                            "command": t.command,
                            "state": t.state.as_str(),
                            "result": t.result.as_str(),
                            "priority": t.priority,
                            "try_count": t.try_count,
                            "host": t.hostname,
                            "address_port": t.addrport,
                            "cores": t.resources_requested.cores,
                            "memory": t.resources_requested.memory,
                            "disk": t.resources_requested.disk,
                            "gpus": t.resources_requested.gpus,
                        })
                    })
                    .collect();
                Some(Value::Array(tasks))
            }
            "worker_status" | "workers" => {
                let workers: Vec<Value> = self
                    .workers
                    .iter()
                    .filter(|&(_, w)| w.hostname.is_some())
                    .map(|(_, w)| {
                        json!({
                            "hostname": w.host_label(),
                            "address_port": w.addrport,
                            "os": w.os,
                            "arch": w.arch,
                            "version": w.version,
                            "workerid": w.workerid,
                            "draining": w.draining,
                            "cores_total": w.resources.cores.total,
                            "cores_inuse": w.resources.cores.inuse,
                            "memory_total": w.resources.memory.total,
                            "memory_inuse": w.resources.memory.inuse,
                            "disk_total": w.resources.disk.total,
                            "disk_inuse": w.resources.disk.inuse,
                            "gpus_total": w.resources.gpus.total,
                            "gpus_inuse": w.resources.gpus.inuse,
                            "tasks_running": w.current_tasks.len(),
                            "total_tasks_complete": w.total_tasks_complete,
                        })
                    })
                    .collect();
                Some(Value::Array(workers))
            }
            "wable_status" | "categories" => Some(self.categories_to_json()),
            _ => None,
        }
    }

    /// The JSON answer as a string, `[]` for unknown requests.
    pub fn status(&mut self, request: &str) -> Value {
        self.construct_status_message(request)
            .unwrap_or_else(|| json!([]))
    }

    /// The full manager description advertised to the catalog and served
    /// for `queue_status`.
    pub(crate) fn queue_to_json(&mut self) -> Value {
        let info = self.stats();
        let categories = self.categories_to_json();
        let mut j = json!({
            "type": "ds_master",
            "starttime": info.time_when_started / 1_000_000,
            "owner": whoami(),
            "version": VERSION,
            "port": self.port,
            "priority": self.priority,
            "ssl": false,

            "workers": info.workers_connected,
            "workers_connected": info.workers_connected,
            "workers_init": info.workers_init,
            "workers_idle": info.workers_idle,
            "workers_busy": info.workers_busy,
            "workers_able": info.workers_able,
            "workers_joined": info.workers_joined,
            "workers_removed": info.workers_removed,
            "workers_released": info.workers_released,
            "workers_idled_out": info.workers_idled_out,
            "workers_fast_aborted": info.workers_fast_aborted,
            "workers_lost": info.workers_lost,

            "tasks_waiting": info.tasks_waiting,
            "tasks_on_workers": info.tasks_on_workers,
            "tasks_running": info.tasks_running,
            "tasks_with_results": info.tasks_with_results,
            "tasks_left": self.num_tasks_left,
            "tasks_submitted": info.tasks_submitted,
            "tasks_dispatched": info.tasks_dispatched,
            "tasks_done": info.tasks_done,
            "tasks_failed": info.tasks_failed,
            "tasks_cancelled": info.tasks_cancelled,
            "tasks_exhausted_attempts": info.tasks_exhausted_attempts,
            "tasks_complete": info.tasks_done,

            "time_when_started": info.time_when_started,
            "time_send": info.time_send,
            "time_receive": info.time_receive,
            "time_send_good": info.time_send_good,
            "time_receive_good": info.time_receive_good,
            "time_status_msgs": info.time_status_msgs,
            "time_internal": info.time_internal,
            "time_polling": info.time_polling,
            "time_application": info.time_application,
            "time_workers_execute": info.time_workers_execute,
            "time_workers_execute_good": info.time_workers_execute_good,
            "time_workers_execute_exhaustion": info.time_workers_execute_exhaustion,

            "bytes_sent": info.bytes_sent,
            "bytes_received": info.bytes_received,

            "capacity_tasks": info.capacity_tasks,
            "capacity_cores": info.capacity_cores,
            "capacity_memory": info.capacity_memory,
            "capacity_disk": info.capacity_disk,
            "capacity_gpus": info.capacity_gpus,
            "capacity_instantaneous": info.capacity_instantaneous,
            "capacity_weighted": info.capacity_weighted,
            "manager_load": info.manager_load,

            "total_cores": info.total_cores,
            "total_memory": info.total_memory,
            "total_disk": info.total_disk,
            "total_gpus": info.total_gpus,
            "committed_cores": info.committed_cores,
            "committed_memory": info.committed_memory,
            "committed_disk": info.committed_disk,
            "committed_gpus": info.committed_gpus,

            "categories": categories,
        });

        if let Some(name) = &self.name {
            j["project"] = json!(name);
        }
        let blocked = self.blocklist.blocked_hosts();
        if !blocked.is_empty() {
            j["workers_blocked"] = json!(blocked);
        }

        let total = self.total_resources_needed();
        j["tasks_total_cores"] = json!(total.cores);
        j["tasks_total_memory"] = json!(total.memory);
        j["tasks_total_disk"] = json!(total.disk);
        j["tasks_total_gpus"] = json!(total.gpus);

        j
    }

    /// The minimum record the catalog, status tools, and factories need;
    /// sent when the full record is rejected for size.
    pub(crate) fn queue_lean_to_json(&mut self) -> Value {
        let info = self.stats();
        let mut j = json!({
            "type": "ds_master",
            "version": VERSION,
            "port": self.port,
            "owner": whoami(),
            "starttime": info.time_when_started / 1_000_000,
            "ssl": false,

            "tasks_waiting": info.tasks_waiting,
            "tasks_running": info.tasks_running,
            "tasks_complete": info.tasks_done,
            "tasks_on_workers": info.tasks_on_workers,
            "tasks_left": self.num_tasks_left,

            "capacity_tasks": info.capacity_tasks,
            "capacity_cores": info.capacity_cores,
            "capacity_memory": info.capacity_memory,
            "capacity_disk": info.capacity_disk,
            "capacity_gpus": info.capacity_gpus,
            "capacity_weighted": info.capacity_weighted,
            "manager_load": info.manager_load,

            "tasks_total_cores": 0,
            "tasks_total_memory": 0,
            "tasks_total_disk": 0,
            "tasks_total_gpus": 0,

            "workers": info.workers_connected,
            "workers_connected": info.workers_connected,
        });

        if let Some(name) = &self.name {
            j["project"] = json!(name);
        }
        let total = self.total_resources_needed();
        j["tasks_total_cores"] = json!(total.cores);
        j["tasks_total_memory"] = json!(total.memory);
        j["tasks_total_disk"] = json!(total.disk);
        j["tasks_total_gpus"] = json!(total.gpus);
        let blocked = self.blocklist.blocked_hosts();
        if !blocked.is_empty() {
            j["workers_blocked"] = json!(blocked);
        }

        j
    }

    /// Every category with any activity, as a JSON array.
    pub(crate) fn categories_to_json(&mut self) -> Value {
        let names: Vec<String> = self.categories.iter().map(|(n, _)| n.clone()).collect();
        let mut out = Vec::new();
        for name in names {
            if let Some(j) = self.category_to_json(&name) {
                out.push(j);
            }
        }
        Value::Array(out)
    }

    fn category_to_json(&mut self, name: &str) -> Option<Value> {
        let s = self.stats_category(name);
        if s.tasks_waiting + s.tasks_on_workers + s.tasks_done < 1 {
            return None;
        }

        let c = self.categories.get(name)?;
        let max_allocation = c.max_allocation;
        let max_seen = c.max_resources_seen;
        let first_label = c.dynamic_max(&ResourceRequest::default(), AllocationLabel::First);

        Some(json!({
            "category": name,
            "tasks_waiting": s.tasks_waiting,
            "tasks_running": s.tasks_running,
            "tasks_on_workers": s.tasks_on_workers,
            "tasks_dispatched": s.tasks_dispatched,
            "tasks_done": s.tasks_done,
            "tasks_failed": s.tasks_failed,
            "tasks_cancelled": s.tasks_cancelled,
            "workers_able": s.workers_able,
            "max_cores": max_allocation.cores,
            "max_memory": max_allocation.memory,
            "max_disk": max_allocation.disk,
            "max_gpus": max_allocation.gpus,
            "max_seen_cores": max_seen.cores,
            "max_seen_memory": max_seen.memory,
            "max_seen_disk": max_seen.disk,
            "max_seen_gpus": max_seen.gpus,
            "first_allocation": {
                "cores": first_label.cores,
                "memory": first_label.memory,
                "disk": first_label.disk,
                "gpus": first_label.gpus,
            },
        }))
    }

    /// Number of tasks in `state`, optionally restricted to a category.
    pub(crate) fn task_state_count(&self, category: Option<&str>, state: TaskState) -> usize {
        self.tasks
            .values()
            .filter(|t| t.state == state)
            .filter(|t| category.map(|c| t.category == c).unwrap_or(true))
            .count()
    }

    /// Sums the resource reports of every worker that has completed one.
    pub(crate) fn aggregate_worker_resources(&self) -> WorkerResources {
        let mut total = WorkerResources::default();
        for (_, w) in self.workers.iter() {
            if w.resources.tag < 0 {
                continue;
            }
            total.add(&w.resources);
        }
        total
    }

    /// What the waiting tasks would ask for plus what the running ones
    /// already hold.
    pub(crate) fn total_resources_needed(&self) -> ResourceBox {
        let mut total = ResourceBox::default();

        for id in self.ready_list.iter() {
            if let Some(t) = self.tasks.get(id) {
                let min = self.task_min_resources(t);
                total.cores += min.cores.unwrap_or(0);
                total.memory += min.memory.unwrap_or(0);
                total.disk += min.disk.unwrap_or(0);
                total.gpus += min.gpus.unwrap_or(0);
            }
        }

        for (_, w) in self.workers.iter() {
            if w.resources.tag < 0 {
                continue;
            }
            total.cores += w.resources.cores.inuse;
            total.memory += w.resources.memory.inuse;
            total.disk += w.resources.disk.inuse;
            total.gpus += w.resources.gpus.inuse;
        }

        total
    }

    /// The largest resource request seen, per category or overall.
    pub(crate) fn largest_seen_resources(&self, category: Option<&str>) -> ResourceRequest {
        match category {
            Some(name) => self
                .categories
                .get(name)
                .map(|c| c.max_allocation)
                .unwrap_or_default(),
            None => {
                let mut largest = self.max_task_resources_requested;
                for (_, c) in self.categories.iter() {
                    largest.grow_to(&c.max_allocation);
                }
                largest
            }
        }
    }

    /// How many worker slots could run a task with this request.
    pub(crate) fn count_workers_able(&self, request: &ResourceRequest) -> u64 {
        let mut able = 0;
        for (_, w) in self.workers.iter() {
            let r = &w.resources;
            if r.workers.total < 1 {
                continue;
            }
            if request.cores.unwrap_or(0) <= r.cores.largest
                && request.memory.unwrap_or(0) <= r.memory.largest
                && request.disk.unwrap_or(0) <= r.disk.largest
                && request.gpus.unwrap_or(0) <= r.gpus.largest
            {
                able += r.workers.total as u64;
            }
        }
        able
    }

    /// Buckets connected workers by hostname and shape, for reporting.
    pub fn summarize_workers(&self) -> Value {
        use std::collections::BTreeMap;
        let mut buckets: BTreeMap<(String, i64, i64, i64), u64> = BTreeMap::new();
        for (_, w) in self.workers.iter() {
            let Some(host) = w.hostname.clone() else { continue };
            let r = &w.resources;
            *buckets
                .entry((host, r.cores.total, r.memory.total, r.disk.total))
                .or_insert(0) += 1;
        }

        Value::Array(
            buckets
                .into_iter()
                .map(|((host, cores, memory, disk), workers)| {
                    json!({
                        "hostname": host,
                        "cores": cores,
                        "memory": memory,
                        "disk": disk,
                        "workers": workers,
                    })
                })
                .collect(),
        )
    }

    /// Publishes a stats snapshot event, throttled unless forced.
    pub(crate) fn publish_perf_snapshot(&mut self, force: bool) {
        let now = timestamp();
        if !force && now.saturating_sub(self.last_perf_snapshot) < PERF_SNAPSHOT_INTERVAL {
            return;
        }
        self.last_perf_snapshot = now;
        let snapshot = self.stats();
        self.emit(Event::now(EventKind::PerfSnapshot).with_stats(snapshot));
    }
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
