//! # The wait loop.
//!
//! `wait` runs one turn at a time: hand back a finished task if one is
//! ready, service the network, retrieve one completion, dispatch one ready
//! task, then do the slow housekeeping (keepalives, fast-abort, draining,
//! admission of new workers). A turn that did nothing lets the next poll
//! sleep up to a second instead of busy-waiting.

use std::future::Future;
use std::net::SocketAddr;
use std::task::Poll;
use std::time::Duration;

use futures::FutureExt;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{LARGE_TASK_CHECK_INTERVAL, MAX_NEW_WORKERS, UPDATE_INTERVAL};
use crate::events::{Event, EventKind};
use crate::link::Link;
use crate::task::{Task, TaskResult, TaskState};
use crate::worker::WorkerKey;

use super::{timestamp, timestamp_s, Manager};

impl Manager {
    pub(crate) async fn wait_internal(
        &mut self,
        tag: Option<String>,
        timeout: Option<Duration>,
    ) -> Option<Task> {
        let t_start = timestamp();
        // Time since the last wait returned belongs to the application.
        if self.time_last_wait > 0 {
            self.stats.time_application += t_start.saturating_sub(self.time_last_wait);
        } else {
            self.stats.time_application +=
                t_start.saturating_sub(self.stats.time_when_started);
        }

        self.print_visibility_warning();

        let deadline = timeout.map(|d| {
            // A zero timeout still runs the loop once.
            let d = if d.is_zero() { Duration::from_secs(1) } else { d };
            Instant::now() + d
        });

        let mut events = 0u32;
        let mut found: Option<Task> = None;

        loop {
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    break;
                }
            }

            if found.is_none() {
                let t0 = timestamp();
                let id = self
                    .tasks
                    .values()
                    .find(|t| t.state == TaskState::Retrieved && t.tag_matches(tag.as_deref()))
                    .map(|t| t.taskid);
                if let Some(id) = id {
                    if self
                        .tasks
                        .get(&id)
                        .map(|t| t.result != TaskResult::Success)
                        .unwrap_or(false)
                    {
                        self.stats.tasks_failed += 1;
                    }
                    found = self.change_task_state(id, TaskState::Done);
                    events += 1;
                    self.stats.time_internal += timestamp().saturating_sub(t0);
                    if !self.config.wait_retrieve_many {
                        break;
                    }
                } else {
                    self.stats.time_internal += timestamp().saturating_sub(t0);
                }
            }

            if self.name.is_some() {
                self.update_catalog(false).await;
            }

            if self.poll_active_workers(deadline).await > 0 {
                // At least one worker was removed. Keep going: returning
                // and retrieving tasks has top priority.
                events += 1;
            }

            self.busy_waiting = false;

            let t0 = timestamp();
            let received = self.receive_one_task().await;
            self.stats.time_receive += timestamp().saturating_sub(t0);
            if received {
                events += 1;
                self.compute_manager_load(true);
                continue;
            }

            let t0 = timestamp();
            let expired = self.expire_waiting_tasks();
            self.stats.time_internal += timestamp().saturating_sub(t0);
            if expired > 0 {
                events += 1;
                self.compute_manager_load(true);
                continue;
            }

            self.compute_manager_load(false);

            if self.workers.len() >= self.config.wait_for_workers {
                if self.config.wait_for_workers > 0 {
                    debug!(
                        wanted = self.config.wait_for_workers,
                        "target number of workers reached"
                    );
                    self.config.wait_for_workers = 0;
                }
                let t0 = timestamp();
                let sent = self.send_one_task().await;
                self.stats.time_send += timestamp().saturating_sub(t0);
                if sent {
                    events += 1;
                    self.compute_manager_load(true);
                    continue;
                }
            }

            let t0 = timestamp();
            self.ask_for_workers_updates().await;
            self.stats.time_status_msgs += timestamp().saturating_sub(t0);

            let t0 = timestamp();
            let mut retired = self.abort_slow_workers().await;
            retired += self.abort_drained_workers().await;
            for host in self.blocklist.unblock_expired(timestamp_s()) {
                self.emit(Event::now(EventKind::HostUnblocked).with_host(host));
            }
            self.stats.time_internal += timestamp().saturating_sub(t0);
            if retired > 0 {
                events += 1;
                continue;
            }

            let accepted = self
                .connect_new_workers(deadline, MAX_NEW_WORKERS.max(self.config.wait_for_workers))
                .await;
            if accepted > 0 {
                events += 1;
                continue;
            }

            if let Some(check) = &self.process_pending_check {
                if check() {
                    events += 1;
                    break;
                }
            }

            // With nothing left in flight and something already delivered,
            // give control back to the application.
            if events > 0 {
                let live = self.tasks.values().any(|t| {
                    matches!(
                        t.state,
                        TaskState::Ready | TaskState::Running | TaskState::WaitingRetrieval
                    )
                });
                if !live {
                    break;
                }
            }

            let now = timestamp();
            if now.saturating_sub(self.last_large_task_check)
                >= LARGE_TASK_CHECK_INTERVAL.as_micros() as u64
            {
                self.last_large_task_check = now;
                self.check_for_large_tasks();
            }

            // No events this turn: let the next poll sleep.
            self.busy_waiting = true;
        }

        if events > 0 {
            self.publish_perf_snapshot(true);
        }
        self.time_last_wait = timestamp();
        found
    }

    /// Polls every link, services the ready ones, and drains workers that
    /// announced available results. Returns how many workers failed.
    pub(crate) async fn poll_active_workers(&mut self, deadline: Option<Instant>) -> usize {
        let t0 = timestamp();
        let msec: u64 = if self.busy_waiting { 1000 } else { 0 };
        let (ready, _) = self.poll_links(msec, deadline).await;
        self.link_poll_end = timestamp();
        self.stats.time_polling += self.link_poll_end.saturating_sub(t0);

        let t0 = timestamp();
        let mut failed = 0;
        for key in ready {
            if self.workers.get(key).is_none() {
                continue;
            }
            if !self.handle_worker(key).await {
                failed += 1;
            }
        }

        if !self.workers.with_available_results.is_empty() {
            let keys: Vec<WorkerKey> = self
                .workers
                .with_available_results
                .iter()
                .copied()
                .collect();
            for key in keys {
                self.workers.with_available_results.remove(&key);
                if self.workers.get(key).is_some() {
                    self.get_available_results(key).await;
                }
            }
        }
        self.stats.time_status_msgs += timestamp().saturating_sub(t0);
        failed
    }

    /// Waits up to `msec` (clamped by the caller deadline) for any link to
    /// become readable or a connection to arrive.
    async fn poll_links(
        &mut self,
        msec: u64,
        deadline: Option<Instant>,
    ) -> (Vec<WorkerKey>, bool) {
        let mut wait = Duration::from_millis(msec);
        if let Some(d) = deadline {
            wait = wait.min(d.saturating_duration_since(Instant::now()));
        }
        let sleep = tokio::time::sleep(wait);
        tokio::pin!(sleep);

        let listener = &self.listener;
        let workers = &mut self.workers;
        let pending = &mut self.pending_conns;

        futures::future::poll_fn(move |cx| {
            let mut ready = Vec::new();
            let mut accepted = false;

            while pending.len() < MAX_NEW_WORKERS {
                match listener.poll_accept(cx) {
                    Poll::Ready(Ok(conn)) => {
                        pending.push(conn);
                        accepted = true;
                    }
                    Poll::Ready(Err(_)) | Poll::Pending => break,
                }
            }

            for (k, w) in workers.iter_mut() {
                if w.link.poll_recv_ready(cx).is_ready() {
                    ready.push(*k);
                }
            }

            if !ready.is_empty() || accepted {
                return Poll::Ready((ready, accepted));
            }
            match sleep.as_mut().poll(cx) {
                Poll::Ready(()) => Poll::Ready((Vec::new(), false)),
                Poll::Pending => Poll::Pending,
            }
        })
        .await
    }

    /// Admits up to `max` pending connections as fresh (unidentified)
    /// workers.
    pub(crate) async fn connect_new_workers(
        &mut self,
        deadline: Option<Instant>,
        max: usize,
    ) -> usize {
        let t0 = timestamp();
        let mut admitted = 0;

        while admitted < max {
            let conn = if !self.pending_conns.is_empty() {
                Some(self.pending_conns.remove(0))
            } else {
                match self.listener.accept().now_or_never() {
                    Some(Ok(conn)) => Some(conn),
                    _ => None,
                }
            };
            let Some((stream, addr)) = conn else { break };

            if self.add_worker(stream, addr).await {
                admitted += 1;
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    break;
                }
            }
        }

        self.stats.time_status_msgs += timestamp().saturating_sub(t0);
        admitted
    }

    /// Registers one accepted connection, applying the password gate when
    /// one is configured. Gate failures drop the connection silently.
    async fn add_worker(&mut self, stream: TcpStream, addr: SocketAddr) -> bool {
        debug!(%addr, "worker connected");
        let mut link = Link::new(stream, addr);

        if let Some(pw) = self.password.clone() {
            let short = self.config.short_timeout;
            debug!(%addr, "authenticating");
            match link.recv_line(short).await {
                Ok(line) if line == format!("auth {pw}") => {
                    if link.send(b"ok\n", short).await.is_err() {
                        return false;
                    }
                }
                _ => {
                    warn!(%addr, "connection presented the wrong password");
                    return false;
                }
            }
        }

        self.workers.insert(link, addr.to_string(), timestamp());
        self.emit(Event::now(EventKind::WorkerConnected).with_worker(addr.to_string()));
        true
    }

    /// Exchanges state with the catalog at most once per update interval.
    pub(crate) async fn update_catalog(&mut self, force: bool) {
        let now = timestamp_s();
        if !force && now.saturating_sub(self.catalog_last_update) < UPDATE_INTERVAL {
            return;
        }
        self.catalog_last_update = now;
        let Some(client) = self.catalog.clone() else {
            return;
        };

        if self.name.is_some() {
            debug!("advertising manager status to the catalog");
            let record = self.queue_to_json();
            if !client.send_update(&record).await {
                // Rejected for size; fall back to the lean record.
                let lean = self.queue_lean_to_json();
                let _ = client.send_update(&lean).await;
            }
        }

        if self.fetch_factory {
            let names: Vec<String> = self.factories.keys().cloned().collect();
            for f in self.factories.values_mut() {
                f.seen_at_catalog = false;
            }
            for update in client.fetch_factories(&names).await {
                self.update_factory(update).await;
            }
            let stale: Vec<String> = self
                .factories
                .iter()
                .filter(|(_, f)| !f.seen_at_catalog && f.connected_workers < 1)
                .map(|(name, _)| name.clone())
                .collect();
            for name in stale {
                self.factories.remove(&name);
            }
        }
    }

    /// EWMA of whether recent turns had work to do.
    pub(crate) fn compute_manager_load(&mut self, task_activity: bool) {
        let alpha = 0.05;
        let sample = if task_activity { 1.0 } else { 0.0 };
        self.stats.manager_load = self.stats.manager_load * (1.0 - alpha) + sample * alpha;
    }

    /// One-time note that a named manager without a password is reachable
    /// by anyone who can see the catalog.
    fn print_visibility_warning(&mut self) {
        if self.warned_visibility {
            return;
        }
        self.warned_visibility = true;
        if self.password.is_none() && self.name.is_some() {
            warn!("this manager is visible to the public; consider setting a password");
        }
    }
}
