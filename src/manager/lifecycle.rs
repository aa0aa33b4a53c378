//! # Task lifecycle engine.
//!
//! State transitions, commit and reap, failure recovery, keepalives,
//! fast-abort, expiry, and worker retirement. Every function here runs on
//! the wait-loop task; worker I/O is the only thing awaited.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::capacity::TaskReport;
use crate::error::{FailureKind, LinkError};
use crate::events::{Event, EventKind};
use crate::factory::FactoryUpdate;
use crate::protocol::url_encode;
use crate::scheduler::{choose_resources, choose_worker};
use crate::stager::StageTarget;
use crate::task::{AllocationLabel, FileKind, Task, TaskId, TaskResult, TaskState};
use crate::worker::{DisconnectReason, WorkerKey, WorkerType};

use super::{timestamp, timestamp_s, Manager};

/// Which output files to scrub from a worker's cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputScrub {
    /// Every output, cached or not.
    All,
    /// Only outputs not marked for caching.
    Uncacheable,
    /// Leave outputs alone.
    None,
}

impl Manager {
    /// Moves a task to a new state, maintaining the ready queue and the
    /// task table. Terminal transitions remove the task and return it.
    pub(crate) fn change_task_state(&mut self, taskid: TaskId, new_state: TaskState) -> Option<Task> {
        let old_state = {
            let t = self.tasks.get_mut(&taskid)?;
            let old = t.state;
            t.state = new_state;
            old
        };

        if old_state == TaskState::Ready {
            self.ready_list.retain(|id| *id != taskid);
        }

        debug!(
            taskid,
            from = TaskState::as_str(old_state),
            to = new_state.as_str(),
            "task state change"
        );

        self.emit(Event::now(EventKind::TaskStateChange).with_task(taskid, new_state));

        let removed = match new_state {
            TaskState::Ready => {
                self.push_task_to_ready_list(taskid);
                None
            }
            TaskState::Done | TaskState::Canceled => self.tasks.remove(&taskid),
            _ => None,
        };

        self.publish_perf_snapshot(false);
        removed
    }

    /// Puts a task on the ready queue by priority, except that a task
    /// resubmitted after resource exhaustion goes to the head so up-sized
    /// attempts are not starved behind repeatedly-too-small ones.
    fn push_task_to_ready_list(&mut self, taskid: TaskId) {
        let (priority, exhausted) = match self.tasks.get_mut(&taskid) {
            Some(t) => {
                let exhausted = t.result == TaskResult::ResourceExhaustion;
                t.result = TaskResult::Unknown;
                t.clean(false);
                (t.priority, exhausted)
            }
            None => return,
        };

        if exhausted {
            self.ready_list.push_front(taskid);
            return;
        }

        let pos = self
            .ready_list
            .iter()
            .position(|id| {
                self.tasks
                    .get(id)
                    .map(|t| t.priority < priority)
                    .unwrap_or(true)
            })
            .unwrap_or(self.ready_list.len());
        self.ready_list.insert(pos, taskid);
    }

    /// Sends one control line to a worker, recording the send time used by
    /// keepalive bookkeeping.
    pub(crate) async fn send_to_worker(&mut self, key: WorkerKey, line: &str) -> Result<(), LinkError> {
        let timeout = self.config.short_timeout;
        let Some(w) = self.workers.get_mut(key) else {
            return Err(LinkError::Closed);
        };
        debug!(worker = %w.addrport, host = w.host_label(), tx = line.trim_end(), "tx");
        w.link.send(line.as_bytes(), timeout).await?;
        self.stats.bytes_sent += line.len() as u64;
        Ok(())
    }

    /// Pool-wide observed transfer rate in bytes/second, falling back to
    /// the conservative default before any transfer has been seen.
    pub(crate) fn queue_transfer_rate(&self) -> f64 {
        let bytes = (self.stats.bytes_sent + self.stats.bytes_received) as f64;
        let time = (self.stats.time_send + self.stats.time_receive) as f64;
        if time > 1_000_000.0 {
            1_000_000.0 * bytes / time
        } else {
            self.config.default_transfer_rate
        }
    }

    /// Deadline for transferring `length` bytes with this worker, derived
    /// from observed bandwidth and floored at the configured minimum.
    pub(crate) fn transfer_wait_time(&self, key: WorkerKey, length: u64) -> Duration {
        let rate = self
            .workers
            .get(key)
            .and_then(|w| w.observed_transfer_rate())
            .unwrap_or_else(|| self.queue_transfer_rate());

        let tolerable = rate / self.config.transfer_outlier_factor;
        let mut timeout = if tolerable > 0.0 {
            (length as f64 / tolerable) as u64
        } else {
            0
        };
        timeout = timeout.max(self.config.minimum_transfer_timeout);
        Duration::from_secs(timeout)
    }

    /// Ships the task to the worker and updates every table that tracks
    /// the assignment. Failures route through [`Manager::handle_failure`].
    pub(crate) async fn commit_task_to_worker(&mut self, key: WorkerKey, taskid: TaskId) {
        {
            let Some(w) = self.workers.get(key) else { return };
            let host = w.host_label().to_string();
            let addrport = w.addrport.clone();
            let Some(t) = self.tasks.get_mut(&taskid) else { return };
            t.hostname = Some(host);
            t.addrport = Some(addrport);
            t.time_when_commit_start = timestamp();
        }

        let result = self.start_one_task(key, taskid).await;

        if let Some(t) = self.tasks.get_mut(&taskid) {
            t.time_when_commit_end = timestamp();
            t.worker = Some(key);
            t.try_count += 1;
        }
        if let Some(w) = self.workers.get_mut(key) {
            w.current_tasks.insert(taskid);
        }

        self.change_task_state(taskid, TaskState::Running);
        self.stats.tasks_dispatched += 1;
        self.count_worker_resources(key);

        if let Err(kind) = result {
            debug!(taskid, worker = %key, "failed to send task to worker");
            self.handle_failure(key, Some(taskid), kind).await;
        }
    }

    /// Chooses the resource box, stages inputs, and sends the task block.
    async fn start_one_task(&mut self, key: WorkerKey, taskid: TaskId) -> Result<(), FailureKind> {
        let force_proportional = self.config.force_proportional_resources;
        let monitor = self.config.monitor;

        let (task_box, target) = {
            let Some(w) = self.workers.get(key) else {
                return Err(FailureKind::Worker);
            };
            let Some(t) = self.tasks.get(&taskid) else {
                return Err(FailureKind::Worker);
            };
            let c = self.categories.lookup_or_create(&t.category);
            let task_box = choose_resources(w, c, t, force_proportional);
            let target = StageTarget {
                hostname: w.host_label().to_string(),
                addrport: w.addrport.clone(),
                transfer_addr: w.transfer_addr.clone(),
            };
            (task_box, target)
        };

        let stager = Arc::clone(&self.stager);
        let report = {
            let t = self.tasks.get(&taskid).expect("task exists");
            stager
                .put_inputs(&target, t)
                .await
                .map_err(|e| e.failure_kind())?
        };
        self.stats.bytes_sent += report.bytes_sent;
        self.stats.time_send += report.transfer_time;

        let message = {
            let t = self.tasks.get_mut(&taskid).expect("task exists");
            t.resources_allocated = Some(task_box);
            Self::render_task_block(t, &task_box, monitor)
        };

        if let Some(w) = self.workers.get_mut(key) {
            w.current_boxes.insert(taskid, task_box);
            w.total_transfer_time += report.transfer_time;
            w.total_bytes_transferred += report.bytes_sent + report.bytes_received;
            // Register the cacheable inputs so later cache-update messages
            // have something to annotate.
            let inputs: Vec<String> = self
                .tasks
                .get(&taskid)
                .map(|t| {
                    t.input_files
                        .iter()
                        .filter(|f| f.flags.cache)
                        .map(|f| f.cached_name.clone())
                        .collect()
                })
                .unwrap_or_default();
            for name in inputs {
                w.current_files
                    .entry(name)
                    .or_insert(crate::worker::RemoteFileInfo {
                        size: 0,
                        transfer_time: 0,
                    });
            }
        }

        let t0 = timestamp();
        let sent = self.send_to_worker(key, &message).await;
        self.stats.time_send += timestamp() - t0;

        match sent {
            Ok(()) => {
                if let (Some(w), Some(t)) = (self.workers.get(key), self.tasks.get(&taskid)) {
                    debug!(worker = %w.addrport, host = w.host_label(), cmd = %t.command, "busy");
                }
                Ok(())
            }
            Err(_) => Err(FailureKind::Worker),
        }
    }

    /// The full `task ... end` wire block.
    fn render_task_block(t: &Task, task_box: &crate::resources::ResourceBox, monitor: bool) -> String {
        let mut m = String::with_capacity(256);
        m.push_str(&format!("task {}\n", t.taskid));
        m.push_str(&format!("cmd {}\n", t.command.len()));
        m.push_str(&t.command);
        if let Some(cop) = &t.coprocess {
            m.push_str(&format!("coprocess {}\n", cop.len()));
            m.push_str(cop);
        }
        m.push_str(&format!("category {}\n", t.category));
        m.push_str(&format!("cores {}\n", task_box.cores));
        m.push_str(&format!("gpus {}\n", task_box.gpus));
        m.push_str(&format!("memory {}\n", task_box.memory));
        m.push_str(&format!("disk {}\n", task_box.disk));

        // With a monitor watching the task, the limits are its business.
        if !monitor {
            if task_box.end > 0 {
                m.push_str(&format!("end_time {}\n", task_box.end));
            }
            if task_box.wall_time > 0 {
                m.push_str(&format!("wall_time {}\n", task_box.wall_time));
            }
        }

        for var in &t.env {
            m.push_str(&format!("env {}\n{}\n", var.len(), var));
        }

        for f in &t.input_files {
            match f.kind {
                FileKind::Directory => m.push_str(&format!("dir {}\n", f.remote_name)),
                FileKind::File => m.push_str(&format!(
                    "infile {} {} {}\n",
                    f.cached_name,
                    url_encode(&f.remote_name),
                    f.flags.bits()
                )),
            }
        }
        for f in &t.output_files {
            m.push_str(&format!(
                "outfile {} {} {}\n",
                f.cached_name,
                url_encode(&f.remote_name),
                f.flags.bits()
            ));
        }

        m.push_str("end\n");
        m
    }

    /// Recomputes a worker's in-use counters from its allocated boxes.
    pub(crate) fn count_worker_resources(&mut self, key: WorkerKey) {
        if let Some(w) = self.workers.get_mut(key) {
            w.resources.cores.inuse = 0;
            w.resources.memory.inuse = 0;
            w.resources.disk.inuse = 0;
            w.resources.gpus.inuse = 0;

            if w.resources.workers.total >= 1 {
                for b in w.current_boxes.values() {
                    w.resources.cores.inuse += b.cores;
                    w.resources.memory.inuse += b.memory;
                    w.resources.disk.inuse += b.disk;
                    w.resources.gpus.inuse += b.gpus;
                }
            }
        }
        self.workers.update_max_worker(key);
    }

    /// Releases a task from its worker's bookkeeping and advances its
    /// state. Terminal transitions return the task.
    pub(crate) fn reap_task_from_worker(
        &mut self,
        key: WorkerKey,
        taskid: TaskId,
        new_state: TaskState,
    ) -> Option<Task> {
        let execute_last = self
            .tasks
            .get(&taskid)
            .map(|t| t.time_workers_execute_last)
            .unwrap_or(0);

        if let Some(w) = self.workers.get_mut(key) {
            if self.tasks.get(&taskid).and_then(|t| t.worker) == Some(key) {
                w.total_task_time += execute_last;
            } else {
                debug!(taskid, worker = %key, "reaping task not owned by this worker");
            }
            w.current_boxes.remove(&taskid);
            w.current_tasks.remove(&taskid);
        }

        if let Some(t) = self.tasks.get_mut(&taskid) {
            t.worker = None;
        }

        let out = self.change_task_state(taskid, new_state);
        self.count_worker_resources(key);
        out
    }

    /// Routes a failure along the recovery axis of the failure kind.
    pub(crate) async fn handle_failure(
        &mut self,
        key: WorkerKey,
        taskid: Option<TaskId>,
        kind: FailureKind,
    ) {
        match (kind, taskid) {
            (FailureKind::App(result), Some(taskid)) => {
                self.handle_app_failure(key, taskid, result).await
            }
            _ => self.handle_worker_failure(key).await,
        }
    }

    /// An application-level failure: surface the task to the submitter and
    /// scrub its outputs from the worker, since a resubmission may produce
    /// different ones.
    async fn handle_app_failure(&mut self, key: WorkerKey, taskid: TaskId, result: TaskResult) {
        let committed = {
            let Some(t) = self.tasks.get_mut(&taskid) else { return };
            t.result = result;
            t.time_when_commit_end > 0
        };

        self.reap_task_from_worker(key, taskid, TaskState::Retrieved);

        if committed {
            self.delete_task_files(key, taskid, false, OutputScrub::All).await;
        }
    }

    /// A transport failure: drop the worker and let its tasks be
    /// rescheduled elsewhere.
    pub(crate) async fn handle_worker_failure(&mut self, key: WorkerKey) {
        self.remove_worker(key, DisconnectReason::Failure).await;
    }

    /// Removes a worker, requeueing every task it owned with try counts
    /// preserved.
    pub(crate) async fn remove_worker(&mut self, key: WorkerKey, reason: DisconnectReason) {
        let Some(w) = self.workers.remove(key) else { return };

        debug!(worker = %w.addrport, host = w.host_label(), reason = reason.as_label(), "worker removed");

        if w.kind == WorkerType::Worker {
            self.stats.workers_removed += 1;
        }

        self.emit(
            Event::now(EventKind::WorkerRemoved)
                .with_worker(w.addrport.clone())
                .with_host(w.host_label())
                .with_reason(reason.as_label()),
        );

        let now = timestamp();
        for taskid in w.current_tasks.iter().copied() {
            if let Some(t) = self.tasks.get_mut(&taskid) {
                if t.time_when_commit_end >= t.time_when_commit_start && t.time_when_commit_end > 0 {
                    let delta = now.saturating_sub(t.time_when_commit_end);
                    t.time_workers_execute_failure += delta;
                    t.time_workers_execute_all += delta;
                }
                t.worker = None;
            }
            self.change_task_state(taskid, TaskState::Ready);
        }

        // Fold the departed worker's self-reported counters into the
        // disconnected-workers totals.
        let ds = &mut self.stats_disconnected;
        ds.workers_joined += w.stats.workers_joined;
        ds.workers_removed += w.stats.workers_joined;
        ds.time_send += w.stats.time_send;
        ds.time_receive += w.stats.time_receive;
        ds.time_workers_execute += w.stats.time_workers_execute;
        ds.bytes_sent += w.stats.bytes_sent;
        ds.bytes_received += w.stats.bytes_received;

        if let Some(factory) = &w.factory_name {
            if let Some(f) = self.factories.get_mut(factory) {
                f.connected_workers -= 1;
            }
        }

        debug!(
            connected = self.workers.count(WorkerType::Worker),
            "workers connected now"
        );
    }

    /// Gently releases one worker.
    pub(crate) async fn release_worker(&mut self, key: WorkerKey) {
        let _ = self.send_to_worker(key, "release\n").await;
        self.remove_worker(key, DisconnectReason::Explicit).await;
        self.stats.workers_released += 1;
    }

    /// Forcibly shuts one worker down.
    pub(crate) async fn shut_down_worker(&mut self, key: WorkerKey) {
        let _ = self.send_to_worker(key, "exit\n").await;
        self.remove_worker(key, DisconnectReason::Explicit).await;
        self.stats.workers_released += 1;
    }

    /// Advances the system by dispatching one ready task, in priority
    /// order, to the best worker that fits it.
    pub(crate) async fn send_one_task(&mut self) -> bool {
        let now = timestamp();
        let ready: Vec<TaskId> = self.ready_list.iter().copied().collect();

        for taskid in ready {
            let pick = {
                let Some(t) = self.tasks.get(&taskid) else { continue };
                if t.resources_requested
                    .start
                    .map(|s| s as u64 > now)
                    .unwrap_or(false)
                {
                    continue;
                }
                let min = self.task_min_resources(t);
                choose_worker(
                    &self.workers,
                    &self.blocklist,
                    self.config.scheduler,
                    t,
                    &min,
                    self.config.resource_submit_multiplier,
                )
            };

            if let Some(key) = pick {
                self.commit_task_to_worker(key, taskid).await;
                return true;
            }
        }
        false
    }

    /// Minimum resources a task needs on a worker. First attempts are
    /// clamped to the largest worker seen so one observed outlier does not
    /// keep new tasks from being scheduled at all.
    pub(crate) fn task_min_resources(&self, t: &Task) -> crate::resources::ResourceRequest {
        let c = self.categories.get(&t.category);
        let mut min = match c {
            Some(c) => c.dynamic_min(&t.resources_requested),
            None => t.resources_requested,
        };

        if t.resource_request == AllocationLabel::First {
            let mw = &self.workers.current_max_worker;
            let clamp = |v: &mut Option<i64>, cap: i64, requested: Option<i64>| {
                if requested.is_none() && cap > 0 {
                    if let Some(x) = v {
                        *x = (*x).min(cap);
                    }
                }
            };
            clamp(&mut min.cores, mw.cores, t.resources_requested.cores);
            clamp(&mut min.memory, mw.memory, t.resources_requested.memory);
            clamp(&mut min.disk, mw.disk, t.resources_requested.disk);
            clamp(&mut min.gpus, mw.gpus, t.resources_requested.gpus);
        }
        min
    }

    /// Advances the system by fetching the outputs of one task waiting for
    /// retrieval.
    pub(crate) async fn receive_one_task(&mut self) -> bool {
        let next = self
            .tasks
            .values()
            .find(|t| t.state == TaskState::WaitingRetrieval)
            .and_then(|t| t.worker.map(|w| (t.taskid, w)));

        let Some((taskid, key)) = next else {
            return false;
        };

        self.fetch_output_from_worker(key, taskid).await;

        // A factory worker that just went idle while its factory is over
        // capacity is retired on the spot.
        let retire = self.workers.get(key).and_then(|w| {
            let factory = w.factory_name.clone()?;
            let idle = w.current_tasks.is_empty();
            let over = self.factories.get(&factory).map(|f| f.over_capacity())?;
            (idle && over).then_some(())
        });
        if retire.is_some() {
            debug!(worker = %key, "final task received from over-capacity factory worker; shutting down");
            self.shut_down_worker(key).await;
        }

        true
    }

    /// Fetches everything a completed task left on its worker and settles
    /// the completion: accounting, exhaustion retry, capacity report.
    pub(crate) async fn fetch_output_from_worker(&mut self, key: WorkerKey, taskid: TaskId) {
        if !self.tasks.contains_key(&taskid) {
            debug!(taskid, worker = %key, "failed to find task at worker");
            self.handle_worker_failure(key).await;
            return;
        }

        let (target, exhausted) = {
            let Some(w) = self.workers.get(key) else {
                self.handle_worker_failure(key).await;
                return;
            };
            let t = self.tasks.get_mut(&taskid).expect("checked above");
            t.time_when_retrieval = timestamp();
            (
                StageTarget {
                    hostname: w.host_label().to_string(),
                    addrport: w.addrport.clone(),
                    transfer_addr: w.transfer_addr.clone(),
                },
                t.result == TaskResult::ResourceExhaustion,
            )
        };

        let stager = Arc::clone(&self.stager);
        let staged = {
            let t = self.tasks.get(&taskid).expect("checked above");
            if exhausted {
                stager.get_monitor_output(&target, t).await
            } else {
                stager.get_outputs(&target, t).await
            }
        };

        match staged {
            Ok(report) => {
                self.stats.bytes_received += report.bytes_received;
                self.stats.time_receive += report.transfer_time;
                if let Some(w) = self.workers.get_mut(key) {
                    w.total_transfer_time += report.transfer_time;
                    w.total_bytes_transferred += report.bytes_sent + report.bytes_received;
                }
            }
            Err(e) => {
                debug!(taskid, worker = %key, error = %e, "failed to receive output from worker");
                let kind = e.failure_kind();
                if kind == FailureKind::Worker {
                    if let Some(t) = self.tasks.get_mut(&taskid) {
                        t.time_when_done = timestamp();
                    }
                    self.handle_worker_failure(key).await;
                    return;
                }
                // Application failure: keep settling the task below with
                // the failure result in place.
                if let (FailureKind::App(result), Some(t)) = (kind, self.tasks.get_mut(&taskid)) {
                    t.result = result;
                }
            }
        }

        self.delete_task_files(key, taskid, true, OutputScrub::Uncacheable)
            .await;

        if let Some(t) = self.tasks.get_mut(&taskid) {
            t.time_when_done = timestamp();
        }

        self.accumulate_task(taskid);
        self.reap_task_from_worker(key, taskid, TaskState::Retrieved);

        if let Some(w) = self.workers.get_mut(key) {
            w.finished_tasks -= 1;
            w.total_tasks_complete += 1;
            // Evidence that the worker is not slow after all.
            w.fast_abort_alarm = false;
        }

        let result = self.tasks.get(&taskid).map(|t| t.result);
        if result == Some(TaskResult::ResourceExhaustion) {
            let (label, category) = {
                let t = self.tasks.get(&taskid).expect("still retrieved");
                (t.resource_request, t.category.clone())
            };
            let next = self
                .categories
                .lookup_or_create(&category)
                .next_label(label);
            match next {
                None => {
                    debug!(taskid, "task failed given max resource exhaustion");
                }
                Some(next) => {
                    debug!(taskid, "task resubmitted with a larger allocation");
                    if let Some(t) = self.tasks.get_mut(&taskid) {
                        t.resource_request = next;
                    }
                    self.change_task_state(taskid, TaskState::Ready);
                    return;
                }
            }
        }

        self.warn_short_run(taskid);
        self.add_task_report(taskid);

        if let (Some(w), Some(t)) = (self.workers.get(key), self.tasks.get(&taskid)) {
            if w.total_tasks_complete > 0 {
                debug!(
                    worker = %w.addrport,
                    host = w.host_label(),
                    total_s = (t.time_when_done - t.time_when_commit_start) as f64 / 1e6,
                    tasks = w.total_tasks_complete,
                    avg_s = w.total_task_time as f64 / w.total_tasks_complete as f64 / 1e6,
                    "task done"
                );
            }
        }
    }

    /// A successful task that exited almost immediately with one of the
    /// well-known shell failure codes usually means a broken command.
    fn warn_short_run(&self, taskid: TaskId) {
        let Some(t) = self.tasks.get(&taskid) else { return };
        if t.result != TaskResult::Success || t.time_workers_execute_last >= 1_000_000 {
            return;
        }
        match t.exit_code {
            126 => warn!(
                taskid,
                "task exited immediately with code 126: the command is likely not executable"
            ),
            127 => warn!(
                taskid,
                "task exited immediately with code 127: the command (or a shared library it needs) was likely not found on the worker"
            ),
            139 => warn!(
                taskid,
                "task exited immediately with code 139: the command segfaulted"
            ),
            _ => {}
        }
    }

    /// Folds one finished attempt into the manager and category totals.
    fn accumulate_task(&mut self, taskid: TaskId) {
        let (category, result, exec_last, send_delta, receive_delta, bytes_sent, bytes_received, footprint) = {
            let Some(t) = self.tasks.get(&taskid) else { return };
            (
                t.category.clone(),
                t.result,
                t.time_workers_execute_last,
                t.time_when_commit_end.saturating_sub(t.time_when_commit_start),
                t.time_when_done.saturating_sub(t.time_when_retrieval),
                t.bytes_sent,
                t.bytes_received,
                t.resources_measured.or(t.resources_allocated),
            )
        };

        self.stats.tasks_done += 1;

        if result == TaskResult::Success {
            self.stats.time_workers_execute_good += exec_last;
            self.stats.time_send_good += send_delta;
            self.stats.time_receive_good += receive_delta;
        } else if result == TaskResult::ResourceExhaustion {
            self.stats.time_workers_execute_exhaustion += exec_last;
            self.stats.tasks_exhausted_attempts += 1;
            if let Some(t) = self.tasks.get_mut(&taskid) {
                t.time_workers_execute_exhaustion += exec_last;
                t.exhausted_attempts += 1;
            }
        }

        let c = self.categories.lookup_or_create(&category);
        c.total_tasks += 1;
        c.stats.bytes_sent += bytes_sent;
        c.stats.bytes_received += bytes_received;
        c.stats.time_workers_execute += exec_last;
        c.stats.time_send += send_delta;
        c.stats.time_receive += receive_delta;
        c.stats.bandwidth = (1_000_000.0 * (c.stats.bytes_sent + c.stats.bytes_received) as f64)
            / (c.stats.time_send + c.stats.time_receive + 1) as f64;

        if result == TaskResult::Success {
            c.stats.tasks_done += 1;
            c.stats.time_workers_execute_good += exec_last;
            c.stats.time_send_good += send_delta;
            c.stats.time_receive_good += receive_delta;
        } else {
            c.stats.tasks_failed += 1;
            if result == TaskResult::ResourceExhaustion {
                c.stats.time_workers_execute_exhaustion += exec_last;
            }
        }

        // Only results that reflect a real execution teach us anything
        // about the category's footprint.
        let meaningful = matches!(
            result,
            TaskResult::Success
                | TaskResult::Signal
                | TaskResult::ResourceExhaustion
                | TaskResult::MaxWallTime
                | TaskResult::DiskFull
                | TaskResult::OutputTransferError
        );
        if meaningful {
            if let Some(seen) = footprint {
                if c.accumulate_seen(&seen) {
                    let name = c.name.clone();
                    self.emit(Event::now(EventKind::CategoryChanged).with_category(name));
                }
            }
        }
    }

    /// Appends this completion to the capacity window.
    fn add_task_report(&mut self, taskid: TaskId) {
        let Some(t) = self.tasks.get(&taskid) else { return };
        let Some(resources) = t.resources_allocated else { return };

        let transfer_time = (t.time_when_commit_end.saturating_sub(t.time_when_commit_start)
            + t.time_when_done.saturating_sub(t.time_when_retrieval)) as i64;
        let exec_time = t.time_workers_execute_last as i64;
        let manager_time =
            (t.time_when_done.saturating_sub(t.time_when_commit_start)) as i64 - transfer_time - exec_time;

        let on_workers = self
            .tasks
            .values()
            .filter(|t| matches!(t.state, TaskState::Running | TaskState::WaitingRetrieval))
            .count();

        self.capacity.add_report(
            TaskReport {
                transfer_time,
                exec_time,
                manager_time,
                resources,
            },
            on_workers,
        );
    }

    /// Cancels ready tasks that ran out of time or retries. Returns how
    /// many were expired.
    pub(crate) fn expire_waiting_tasks(&mut self) -> usize {
        let now_s = timestamp_s() as i64;
        let ready: Vec<TaskId> = self.ready_list.iter().copied().collect();
        let mut expired = 0;

        for taskid in ready {
            let verdict = {
                let Some(t) = self.tasks.get(&taskid) else { continue };
                if t.resources_requested.end.map(|e| e > 0 && e <= now_s) == Some(true) {
                    Some(TaskResult::TaskTimeout)
                } else if t.max_retries > 0 && t.try_count > t.max_retries {
                    Some(TaskResult::MaxRetries)
                } else {
                    None
                }
            };

            if let Some(result) = verdict {
                if let Some(t) = self.tasks.get_mut(&taskid) {
                    t.result = result;
                }
                self.change_task_state(taskid, TaskState::Retrieved);
                expired += 1;
            }
        }
        expired
    }

    /// Sends keepalive checks and removes workers that stopped answering.
    pub(crate) async fn ask_for_workers_updates(&mut self) {
        if self.config.keepalive_interval == 0 {
            return;
        }
        let now = timestamp();
        let interval_us = self.config.keepalive_interval * 1_000_000;
        let timeout_us = self.config.keepalive_timeout * 1_000_000;

        for key in self.workers.keys() {
            enum Action {
                Remove(&'static str),
                Check,
                Nothing,
            }

            let action = {
                let Some(w) = self.workers.get(key) else { continue };
                if w.hostname.is_none() {
                    if now.saturating_sub(w.start_time) >= timeout_us {
                        Action::Remove("hasn't sent its initialization")
                    } else {
                        Action::Nothing
                    }
                } else if w.last_msg_recv_time > w.last_update_msg_time {
                    if now.saturating_sub(w.last_update_msg_time) >= interval_us {
                        Action::Check
                    } else {
                        Action::Nothing
                    }
                } else if self.link_poll_end > w.last_update_msg_time
                    && self.link_poll_end - w.last_update_msg_time >= timeout_us
                {
                    Action::Remove("hasn't responded to keepalive check")
                } else {
                    Action::Nothing
                }
            };

            match action {
                Action::Remove(why) => {
                    debug!(worker = %key, why, timeout = self.config.keepalive_timeout, "removing worker");
                    self.handle_worker_failure(key).await;
                }
                Action::Check => {
                    if self.send_to_worker(key, "check\n").await.is_ok() {
                        if let Some(w) = self.workers.get_mut(key) {
                            w.last_update_msg_time = now;
                        }
                    } else {
                        debug!(worker = %key, "failed to send keepalive check");
                        self.handle_worker_failure(key).await;
                    }
                }
                Action::Nothing => {}
            }
        }
    }

    /// Cancels tasks running far beyond their category average, and
    /// removes workers that trigger twice in a row. Returns the number of
    /// removed workers.
    pub(crate) async fn abort_slow_workers(&mut self) -> usize {
        // Refresh averages; bail early when no category wants fast abort.
        let mut any_enabled = false;
        for (_, c) in self.categories.iter_mut() {
            c.update_average_task_time();
            if c.fast_abort > 0.0 {
                any_enabled = true;
            }
        }
        if !any_enabled {
            return 0;
        }

        let now = timestamp();
        let mut removed = 0;

        let candidates: Vec<(TaskId, WorkerKey, u64)> = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Running)
            .filter_map(|t| {
                let key = t.worker?;
                let multiplier = self.categories.effective_fast_abort(&t.category)?;
                let average = self.categories.get(&t.category)?.average_task_time;
                if average < 1 {
                    return None;
                }
                let runtime = now.saturating_sub(t.time_when_commit_start);
                let threshold =
                    (average as f64 * (multiplier + t.fast_abort_count as f64)) as u64;
                (runtime >= threshold).then_some((t.taskid, key, runtime))
            })
            .collect();

        for (taskid, key, runtime) in candidates {
            let is_worker = self
                .workers
                .get(key)
                .map(|w| w.kind == WorkerType::Worker)
                .unwrap_or(false);
            if !is_worker {
                continue;
            }

            debug!(taskid, "task is taking too long, removing from worker");
            self.cancel_task_on_worker(taskid, TaskState::Ready).await;
            let count = {
                let Some(t) = self.tasks.get_mut(&taskid) else { continue };
                t.fast_abort_count += 1;
                t.fast_abort_count
            };

            // One task cannot mark two different workers as suspect.
            if count > 1 {
                continue;
            }

            let alarmed = self
                .workers
                .get(key)
                .map(|w| w.fast_abort_alarm)
                .unwrap_or(false);
            if alarmed {
                // Second trigger in a row: the worker is slow, not the task.
                let host = self
                    .workers
                    .get(key)
                    .and_then(|w| w.hostname.clone());
                if let Some(host) = host {
                    debug!(worker = %key, host = %host, runtime_s = runtime as f64 / 1e6, "removing slow worker");
                    self.block_host_with_timeout(&host, self.config.blocklist_slow_workers_timeout);
                }
                self.remove_worker(key, DisconnectReason::FastAbort).await;
                self.stats.workers_fast_aborted += 1;
                removed += 1;
            } else if let Some(w) = self.workers.get_mut(key) {
                w.fast_abort_alarm = true;
            }
        }

        removed
    }

    /// Shuts down draining workers that have emptied out.
    pub(crate) async fn abort_drained_workers(&mut self) -> usize {
        let mut removed = 0;
        for key in self.workers.keys() {
            let done_draining = self
                .workers
                .get(key)
                .map(|w| w.draining && w.current_tasks.is_empty())
                .unwrap_or(false);
            if done_draining {
                self.shut_down_worker(key).await;
                removed += 1;
            }
        }
        removed
    }

    /// Cancels a specific task, killing it remotely when it is running.
    /// Terminal `new_state`s return the task.
    pub(crate) async fn cancel_task_on_worker(
        &mut self,
        taskid: TaskId,
        new_state: TaskState,
    ) -> Option<Task> {
        let key = self.tasks.get(&taskid).and_then(|t| t.worker);

        match key {
            Some(key) => {
                let _ = self.send_to_worker(key, &format!("kill {taskid}\n")).await;
                debug!(taskid, worker = %key, "task aborted at worker");
                self.delete_task_files(key, taskid, true, OutputScrub::All).await;
                self.reap_task_from_worker(key, taskid, new_state)
            }
            None => self.change_task_state(taskid, new_state),
        }
    }

    /// Unlinks task files from the worker cache: the non-cacheable inputs
    /// when `inputs`, plus outputs per the scrub mode (outputs of an
    /// aborted or failed run are never worth keeping).
    pub(crate) async fn delete_task_files(
        &mut self,
        key: WorkerKey,
        taskid: TaskId,
        inputs: bool,
        outputs: OutputScrub,
    ) {
        let names: Vec<String> = {
            let Some(t) = self.tasks.get(&taskid) else { return };
            let mut names = Vec::new();
            if inputs {
                names.extend(
                    t.input_files
                        .iter()
                        .filter(|f| !f.flags.cache)
                        .map(|f| f.cached_name.clone()),
                );
            }
            let keep_cached = matches!(outputs, OutputScrub::Uncacheable);
            if !matches!(outputs, OutputScrub::None) {
                names.extend(
                    t.output_files
                        .iter()
                        .filter(|f| !(keep_cached && f.flags.cache))
                        .map(|f| f.cached_name.clone()),
                );
            }
            names
        };

        for name in names {
            let _ = self.send_to_worker(key, &format!("unlink {name}\n")).await;
            if let Some(w) = self.workers.get_mut(key) {
                w.current_files.remove(&name);
            }
        }
    }

    /// Applies one factory description from the catalog.
    pub(crate) async fn update_factory(&mut self, update: FactoryUpdate) {
        let f = self
            .factories
            .entry(update.factory_name.clone())
            .or_insert_with(|| crate::factory::FactoryInfo::new(update.factory_name.clone()));
        f.seen_at_catalog = true;

        let Some(max) = update.max_workers else { return };
        let old_max = f.max_workers;
        f.max_workers = max;
        if max < old_max {
            self.factory_trim_workers(&update.factory_name).await;
        }
    }

    /// Scales a factory down by retiring idle workers only; busy workers
    /// are never cancelled. Returns how many were trimmed.
    pub(crate) async fn factory_trim_workers(&mut self, factory: &str) -> usize {
        let Some(f) = self.factories.get(factory) else { return 0 };
        let excess = f.connected_workers - f.max_workers;
        if excess <= 0 {
            return 0;
        }

        let idle: Vec<WorkerKey> = self
            .workers
            .iter()
            .filter(|&(_, w)| {
                w.factory_name.as_deref() == Some(factory) && w.current_tasks.is_empty()
            })
            .map(|(k, _)| *k)
            .take(excess as usize)
            .collect();

        let mut trimmed = 0;
        for key in idle {
            self.shut_down_worker(key).await;
            trimmed += 1;
        }
        debug!(factory, trimmed, "trimmed factory workers");
        trimmed
    }

    /// Warns about ready tasks that no connected worker could ever fit.
    pub(crate) fn check_for_large_tasks(&self) {
        if self.workers.is_empty() {
            return;
        }
        for taskid in self.ready_list.iter() {
            let Some(t) = self.tasks.get(taskid) else { continue };
            let min = self.task_min_resources(t);
            let fits_somewhere = self.workers.iter().any(|(_, w)| {
                let r = &w.resources;
                r.workers.total >= 1
                    && min.cores.unwrap_or(0) <= r.cores.largest
                    && min.memory.unwrap_or(0) <= r.memory.largest
                    && min.disk.unwrap_or(0) <= r.disk.largest
                    && min.gpus.unwrap_or(0) <= r.gpus.largest
            });
            if !fits_somewhere {
                warn!(
                    taskid = t.taskid,
                    category = %t.category,
                    "task does not fit any currently connected worker"
                );
            }
        }
    }
}
