//! # Inbound message handling.
//!
//! One line is received and dispatched at a time. Status updates are
//! handled silently. The `result` and `update` data lines are normally
//! consumed by an explicit `send_results` exchange, though workers may also
//! volunteer them on the main loop; a line that parses as nothing at all
//! costs the sender its connection.

use tracing::{debug, warn};

use crate::protocol::{self, WorkerMessage, PROTOCOL_VERSION};
use crate::task::{TaskResult, TaskState};
use crate::worker::{DisconnectReason, RemoteFileInfo, WorkerKey, WorkerType};

use super::lifecycle::OutputScrub;
use super::{timestamp, Manager};

/// Outcome of receiving and dispatching one line.
#[derive(Debug)]
pub(crate) enum Dispatch {
    /// A status update was consumed.
    Handled,
    /// A status query was answered; the connection must close now.
    HandledDisconnect,
    /// A data line valid only inside an explicit exchange.
    Data(WorkerMessage),
    /// A line matching no protocol verb.
    Unparsed(String),
    /// The link failed mid-receive.
    Failed,
}

impl Manager {
    /// Services one ready worker link from the wait loop.
    ///
    /// Returns `true` when the worker survived the message.
    pub(crate) async fn handle_worker(&mut self, key: WorkerKey) -> bool {
        match self.recv_and_dispatch(key).await {
            Dispatch::Handled => true,
            Dispatch::HandledDisconnect => {
                self.remove_worker(key, DisconnectReason::Status).await;
                true
            }
            // Workers may volunteer results without a send_results round.
            Dispatch::Data(WorkerMessage::TaskResult {
                status,
                exit_code,
                output_length,
                execution_time,
                taskid,
            }) => {
                if self
                    .get_result(key, status, exit_code, output_length, execution_time, taskid)
                    .await
                {
                    true
                } else {
                    self.stats.workers_lost += 1;
                    self.remove_worker(key, DisconnectReason::Failure).await;
                    false
                }
            }
            Dispatch::Data(WorkerMessage::Update {
                taskid,
                path,
                offset,
                length,
            }) => {
                if self.get_update(key, taskid, &path, offset, length).await {
                    true
                } else {
                    self.stats.workers_lost += 1;
                    self.remove_worker(key, DisconnectReason::Failure).await;
                    false
                }
            }
            Dispatch::Data(WorkerMessage::End) => true,
            Dispatch::Data(_) | Dispatch::Unparsed(_) => {
                if let Some(w) = self.workers.get(key) {
                    debug!(worker = %w.addrport, host = w.host_label(), "invalid message from worker");
                }
                self.stats.workers_lost += 1;
                self.remove_worker(key, DisconnectReason::Failure).await;
                false
            }
            Dispatch::Failed => {
                if let Some(w) = self.workers.get(key) {
                    debug!(worker = %w.addrport, host = w.host_label(), "failed to read from worker");
                }
                self.stats.workers_lost += 1;
                self.remove_worker(key, DisconnectReason::Failure).await;
                false
            }
        }
    }

    /// Receives one line and routes it to its handler.
    pub(crate) async fn recv_and_dispatch(&mut self, key: WorkerKey) -> Dispatch {
        let short = self.config.short_timeout;
        let line = {
            let Some(w) = self.workers.get_mut(key) else {
                return Dispatch::Failed;
            };
            match w.link.recv_line(short).await {
                Ok(line) => {
                    w.last_msg_recv_time = timestamp();
                    debug!(worker = %w.addrport, host = w.host_label(), rx = %line, "rx");
                    line
                }
                Err(_) => return Dispatch::Failed,
            }
        };

        let Some(msg) = protocol::parse(&line) else {
            return Dispatch::Unparsed(line);
        };

        match msg {
            WorkerMessage::Alive => Dispatch::Handled,
            WorkerMessage::Handshake {
                protocol,
                hostname,
                os,
                arch,
                version,
            } => self.handle_handshake(key, protocol, hostname, os, arch, version),
            WorkerMessage::StatusRequest(kind) => self.handle_status_request(key, &kind).await,
            WorkerMessage::AvailableResults => {
                self.workers.with_available_results.insert(key);
                Dispatch::Handled
            }
            WorkerMessage::Resource {
                kind,
                total,
                smallest,
                largest,
            } => {
                if let Some(w) = self.workers.get_mut(key) {
                    w.resources.update_kind(&kind, total, smallest, largest);
                }
                Dispatch::Handled
            }
            WorkerMessage::ResourceTag(tag) => {
                if let Some(w) = self.workers.get_mut(key) {
                    w.resources.tag = tag;
                }
                Dispatch::Handled
            }
            WorkerMessage::Feature(name) => {
                if let Some(w) = self.workers.get_mut(key) {
                    debug!(feature = %name, "feature found");
                    w.features.insert(name);
                }
                Dispatch::Handled
            }
            WorkerMessage::Auth => {
                if let Some(w) = self.workers.get(key) {
                    warn!(worker = %w.addrport, "worker attempted password auth, but no password is set");
                }
                Dispatch::Failed
            }
            WorkerMessage::NameQuery => {
                let name = self.name.clone().unwrap_or_default();
                if let Some(w) = self.workers.get(key) {
                    debug!(worker = %w.addrport, "sending project name to worker");
                }
                match self.send_to_worker(key, &format!("{name}\n")).await {
                    Ok(()) => Dispatch::Handled,
                    Err(_) => Dispatch::Failed,
                }
            }
            WorkerMessage::Info { field, value } => self.handle_info(key, &field, &value).await,
            WorkerMessage::CacheUpdate {
                cachename,
                size,
                transfer_time,
            } => {
                if let Some(w) = self.workers.get_mut(key) {
                    w.current_files.insert(
                        cachename,
                        RemoteFileInfo {
                            size,
                            transfer_time,
                        },
                    );
                }
                Dispatch::Handled
            }
            WorkerMessage::CacheInvalid { cachename, length } => {
                self.handle_cache_invalid(key, &cachename, length).await
            }
            WorkerMessage::TransferAddress { host, port } => {
                if let Some(w) = self.workers.get_mut(key) {
                    w.transfer_addr = Some((host, port));
                }
                Dispatch::Handled
            }
            msg @ (WorkerMessage::TaskResult { .. }
            | WorkerMessage::Update { .. }
            | WorkerMessage::End) => Dispatch::Data(msg),
            WorkerMessage::HttpGet(path) => self.handle_http_request(key, &path).await,
        }
    }

    /// The handshake that promotes a connection into a worker.
    fn handle_handshake(
        &mut self,
        key: WorkerKey,
        protocol: i64,
        hostname: String,
        os: String,
        arch: String,
        version: String,
    ) -> Dispatch {
        if protocol != PROTOCOL_VERSION {
            if let Some(w) = self.workers.get(key) {
                warn!(
                    worker = %w.addrport,
                    theirs = protocol,
                    ours = PROTOCOL_VERSION,
                    "rejecting worker speaking a different protocol"
                );
            }
            self.block_host(&hostname);
            return Dispatch::Failed;
        }

        if self.blocklist.is_blocked(&hostname) {
            debug!(host = %hostname, "rejecting connection from blocked host");
            return Dispatch::Failed;
        }

        let addrport = {
            let Some(w) = self.workers.get_mut(key) else {
                return Dispatch::Failed;
            };
            w.hostname = Some(hostname.clone());
            w.os = os;
            w.arch = arch;
            w.version = version.clone();
            w.kind = WorkerType::Worker;
            w.addrport.clone()
        };

        self.stats.workers_joined += 1;
        debug!(
            connected = self.workers.count(WorkerType::Worker),
            host = %hostname,
            version = %version,
            "worker is ready"
        );
        if version != protocol::VERSION {
            debug!(
                host = %hostname,
                worker_version = %version,
                manager_version = protocol::VERSION,
                "potential worker version mismatch"
            );
        }

        self.emit(
            crate::events::Event::now(crate::events::EventKind::WorkerJoined)
                .with_worker(addrport)
                .with_host(hostname),
        );

        Dispatch::Handled
    }

    /// Key/value metrics and directives; unknown fields are tolerated.
    async fn handle_info(&mut self, key: WorkerKey, field: &str, value: &str) -> Dispatch {
        let as_u64 = value.parse::<u64>().unwrap_or(0);

        match field {
            "idle-disconnecting" => {
                self.remove_worker(key, DisconnectReason::IdleOut).await;
                self.stats.workers_idled_out += 1;
            }
            "end_of_resource_update" => {
                self.count_worker_resources(key);
                if let Some(w) = self.workers.get(key) {
                    self.emit(
                        crate::events::Event::now(crate::events::EventKind::WorkerResources)
                            .with_worker(w.addrport.clone()),
                    );
                }
            }
            "from-factory" => {
                self.fetch_factory = true;
                let factory = value.to_string();
                if let Some(w) = self.workers.get_mut(key) {
                    w.factory_name = Some(factory.clone());
                }
                let over = {
                    let f = self
                        .factories
                        .entry(factory.clone())
                        .or_insert_with(|| crate::factory::FactoryInfo::new(factory));
                    f.connected_workers += 1;
                    f.over_capacity()
                };
                if over {
                    self.shut_down_worker(key).await;
                }
            }
            _ => {
                if let Some(w) = self.workers.get_mut(key) {
                    match field {
                        "workers_joined" => w.stats.workers_joined = as_u64,
                        "workers_removed" => w.stats.workers_removed = as_u64,
                        "time_send" => w.stats.time_send = as_u64,
                        "time_receive" => w.stats.time_receive = as_u64,
                        "time_execute" => w.stats.time_workers_execute = as_u64,
                        "bytes_sent" => w.stats.bytes_sent = as_u64,
                        "bytes_received" => w.stats.bytes_received = as_u64,
                        "tasks_waiting" => w.stats.tasks_waiting = as_u64,
                        "tasks_running" => w.stats.tasks_running = as_u64,
                        "worker-id" => w.workerid = Some(value.to_string()),
                        "worker-end-time" => {
                            w.end_time = value.parse::<i64>().unwrap_or(0).max(0)
                        }
                        _ => {}
                    }
                }
            }
        }

        // Info messages are optional; always mark them processed.
        Dispatch::Handled
    }

    /// The worker lost a cached file; read the explanation and forget it.
    async fn handle_cache_invalid(
        &mut self,
        key: WorkerKey,
        cachename: &str,
        length: u64,
    ) -> Dispatch {
        let long = self.config.long_timeout;
        let Some(w) = self.workers.get_mut(key) else {
            return Dispatch::Failed;
        };
        let message = match w.link.recv_exact(length as usize, long).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => return Dispatch::Failed,
        };
        debug!(
            worker = %w.addrport,
            host = w.host_label(),
            cachename,
            error = %message,
            "worker invalidated cached file"
        );
        w.current_files.remove(cachename);
        Dispatch::Handled
    }

    /// Asks one worker for everything it has finished, consuming `result`
    /// and `update` lines until `end`.
    pub(crate) async fn get_available_results(&mut self, key: WorkerKey) {
        if self.send_to_worker(key, "send_results -1\n").await.is_err() {
            self.handle_worker_failure(key).await;
            return;
        }
        if let Some(w) = self.workers.get(key) {
            debug!(worker = %w.addrport, host = w.host_label(), "reading results");
        }

        loop {
            match self.recv_and_dispatch(key).await {
                Dispatch::Handled => continue,
                Dispatch::Data(WorkerMessage::TaskResult {
                    status,
                    exit_code,
                    output_length,
                    execution_time,
                    taskid,
                }) => {
                    if !self
                        .get_result(key, status, exit_code, output_length, execution_time, taskid)
                        .await
                    {
                        self.handle_worker_failure(key).await;
                        return;
                    }
                }
                Dispatch::Data(WorkerMessage::Update {
                    taskid,
                    path,
                    offset,
                    length,
                }) => {
                    if !self.get_update(key, taskid, &path, offset, length).await {
                        self.handle_worker_failure(key).await;
                        return;
                    }
                }
                Dispatch::Data(WorkerMessage::End) => return,
                _ => {
                    if let Some(w) = self.workers.get(key) {
                        debug!(worker = %w.addrport, "invalid response to send_results");
                    }
                    self.handle_worker_failure(key).await;
                    return;
                }
            }
        }
    }

    /// One `result` header plus its stdout payload.
    ///
    /// Returns false on a transport failure; storage problems on our side
    /// are absorbed so output retrieval can continue.
    async fn get_result(
        &mut self,
        key: WorkerKey,
        status: i64,
        exit_code: i64,
        output_length: i64,
        execution_time: i64,
        taskid: u64,
    ) -> bool {
        let output_length = output_length.max(0) as u64;

        let known = self
            .workers
            .get(key)
            .map(|w| w.current_tasks.contains(&taskid))
            .unwrap_or(false);

        if !known {
            if let Some(w) = self.workers.get(key) {
                debug!(worker = %w.addrport, taskid, "result for unassigned task; draining and ignoring");
            }
            let wait = self.transfer_wait_time(key, output_length);
            let Some(w) = self.workers.get_mut(key) else { return false };
            return w.link.soak(output_length, wait).await.is_ok();
        }

        if TaskResult::from_code(status) == TaskResult::Forsaken {
            // Returned un-run; resubmit without touching execution stats.
            self.delete_task_files(key, taskid, true, OutputScrub::None).await;
            self.reap_task_from_worker(key, taskid, TaskState::Ready);
            return true;
        }

        let now = timestamp();
        let commit_end = self
            .tasks
            .get(&taskid)
            .map(|t| t.time_when_commit_end)
            .unwrap_or(0);
        let observed = now.saturating_sub(commit_end);
        let reported = execution_time.max(0) as u64;
        let execute_last = observed.min(reported);

        // Bound what we keep; the tail of an oversized stdout is dropped.
        let cap = self.config.max_stdout_storage;
        let keep = output_length.min(cap);
        let mut truncated = false;
        if output_length > cap {
            warn!(
                taskid,
                output_length, cap, "task stdout exceeds storage limit; truncating"
            );
            truncated = true;
        }

        let mut output: Vec<u8> = Vec::new();
        if keep > 0 {
            let wait = self.transfer_wait_time(key, keep);
            let Some(w) = self.workers.get_mut(key) else { return false };
            debug!(taskid, bytes = keep, "receiving stdout");
            match w.link.recv_exact(keep as usize, wait).await {
                Ok(bytes) => output = bytes.to_vec(),
                Err(_) => return false,
            }
        }
        if output_length > keep {
            let wait = self.transfer_wait_time(key, output_length - keep);
            let Some(w) = self.workers.get_mut(key) else { return false };
            if w.link.soak(output_length - keep, wait).await.is_err() {
                return false;
            }
        }

        if truncated {
            let marker = format!(
                "\n>>>>>> STDOUT TRUNCATED AFTER THIS POINT.\n>>>>>> MAXIMUM OF {} BYTES REACHED, {} BYTES TRUNCATED.",
                cap,
                output_length - keep
            );
            let bytes = marker.as_bytes();
            if output.len() >= bytes.len() {
                let at = output.len() - bytes.len();
                output[at..].copy_from_slice(bytes);
            }
        }

        // An outbound bandwidth cap is simulated by pacing retrievals.
        if self.config.bandwidth_limit > 0.0 {
            let effective =
                (output_length as f64 / self.config.bandwidth_limit * 1e6) as u64 + now;
            let current = timestamp();
            if effective > current {
                tokio::time::sleep(std::time::Duration::from_micros(effective - current)).await;
            }
        }

        {
            let Some(t) = self.tasks.get_mut(&taskid) else { return true };
            t.output = output;
            t.result = TaskResult::from_code(status);
            if truncated && t.result == TaskResult::Success {
                t.result = TaskResult::StdoutMissing;
            }
            t.exit_code = exit_code;
            t.time_workers_execute_last = execute_last;
            t.time_workers_execute_all += execute_last;
            t.bytes_received += keep;
        }
        self.stats.time_workers_execute += execute_last;
        self.stats.bytes_received += keep;

        if let Some(w) = self.workers.get_mut(key) {
            w.finished_tasks += 1;
        }

        // Translate monitor exit codes into their real meaning.
        if self.config.monitor {
            let (overflow, expired) = (
                self.config.monitor_exit_overflow,
                self.config.monitor_exit_time_expire,
            );
            if let Some(t) = self.tasks.get_mut(&taskid) {
                if t.exit_code == overflow {
                    t.result = TaskResult::ResourceExhaustion;
                } else if t.exit_code == expired {
                    t.result = TaskResult::TaskTimeout;
                }
            }
        }

        self.change_task_state(taskid, TaskState::WaitingRetrieval);
        true
    }

    /// One watched-file `update`: splice the bytes into the local copy at
    /// the given offset and truncate it there. Stale updates are drained.
    async fn get_update(
        &mut self,
        key: WorkerKey,
        taskid: u64,
        path: &str,
        offset: u64,
        length: u64,
    ) -> bool {
        let wait = self.transfer_wait_time(key, length);

        let local = {
            let owned = self
                .workers
                .get(key)
                .map(|w| w.current_tasks.contains(&taskid))
                .unwrap_or(false);
            if !owned {
                None
            } else {
                self.tasks.get(&taskid).and_then(|t| {
                    t.output_files
                        .iter()
                        .find(|f| f.remote_name == path && f.flags.watch)
                        .map(|f| f.source.clone())
                })
            }
        };

        let Some(local) = local else {
            if let Some(w) = self.workers.get(key) {
                debug!(worker = %w.addrport, taskid, path, "update for unknown or unwatched file; draining");
            }
            let Some(w) = self.workers.get_mut(key) else { return false };
            return w.link.soak(length, wait).await.is_ok();
        };

        use tokio::io::{AsyncSeekExt, AsyncWriteExt};
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&local)
            .await;

        let Ok(mut file) = file else {
            debug!(path = %local, "unable to update watched file; draining");
            let Some(w) = self.workers.get_mut(key) else { return false };
            return w.link.soak(length, wait).await.is_ok();
        };

        if file.seek(std::io::SeekFrom::Start(offset)).await.is_err() {
            let Some(w) = self.workers.get_mut(key) else { return false };
            return w.link.soak(length, wait).await.is_ok();
        }

        let mut remaining = length;
        while remaining > 0 {
            let chunk = remaining.min(64 * 1024) as usize;
            let bytes = {
                let Some(w) = self.workers.get_mut(key) else { return false };
                match w.link.recv_exact(chunk, wait).await {
                    Ok(b) => b,
                    Err(_) => return false,
                }
            };
            if file.write_all(&bytes).await.is_err() {
                // Local write failed; drain what the worker still has.
                let Some(w) = self.workers.get_mut(key) else { return false };
                return w.link.soak(remaining - chunk as u64, wait).await.is_ok();
            }
            remaining -= chunk as u64;
        }

        let _ = file.set_len(offset + length).await;
        let _ = file.flush().await;
        true
    }

    /// A named status query over the worker protocol. The sender is
    /// reclassified as a status connection and disconnected afterwards.
    async fn handle_status_request(&mut self, key: WorkerKey, request: &str) -> Dispatch {
        let Some(payload) = self.construct_status_message(request) else {
            debug!(request, "unknown status request");
            return Dispatch::Failed;
        };

        if let Some(w) = self.workers.get_mut(key) {
            w.kind = WorkerType::Status;
            w.hostname = Some("QUEUE_STATUS".to_string());
        }

        let body = payload.to_string();
        match self.send_to_worker(key, &format!("{body}\n")).await {
            Ok(()) => Dispatch::HandledDisconnect,
            Err(_) => Dispatch::Failed,
        }
    }

    /// A plain HTTP GET on the worker port: a browser asking for status.
    async fn handle_http_request(&mut self, key: WorkerKey, path: &str) -> Dispatch {
        // Consume and ignore the remainder of the request headers.
        let short = self.config.short_timeout;
        loop {
            let Some(w) = self.workers.get_mut(key) else {
                return Dispatch::Failed;
            };
            match w.link.recv_line(short).await {
                Ok(line) if line.is_empty() => break,
                Ok(_) => continue,
                Err(_) => return Dispatch::Failed,
            }
        }

        if self
            .send_to_worker(key, "HTTP/1.1 200 OK\nConnection: close\n")
            .await
            .is_err()
        {
            return Dispatch::Failed;
        }

        if path == "/" {
            let index = concat!(
                "Content-type: text/html\n\n",
                "<h1>Dataswarm Data API</h1>",
                "<ul>\n",
                "<li> <a href=\"/queue_status\">Queue Status</a>\n",
                "<li> <a href=\"/task_status\">Task Status</a>\n",
                "<li> <a href=\"/worker_status\">Worker Status</a>\n",
                "<li> <a href=\"/resources_status\">Resources Status</a>\n",
                "</ul>\n",
            );
            if self.send_to_worker(key, index).await.is_err() {
                return Dispatch::Failed;
            }
            Dispatch::HandledDisconnect
        } else {
            if self
                .send_to_worker(key, "Access-Control-Allow-Origin: *\nContent-type: text/plain\n\n")
                .await
                .is_err()
            {
                return Dispatch::Failed;
            }
            self.handle_status_request(key, path.trim_start_matches('/'))
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{feed_lines, join_worker, manager_with_connection};
    use crate::task::{Task, TaskState};
    use crate::worker::WorkerType;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn handshake_promotes_connection_to_worker() {
        let (mut m, mut client) = manager_with_connection().await;
        assert_eq!(m.workers.count(WorkerType::Unknown), 1);

        join_worker(&mut m, &mut client, "host1").await;

        assert_eq!(m.workers.count(WorkerType::Worker), 1);
        let key = m.workers.keys()[0];
        let w = m.workers.get(key).unwrap();
        assert_eq!(w.hostname.as_deref(), Some("host1"));
        assert_eq!(w.resources.cores.total, 4);
        assert_eq!(m.workers.current_max_worker.cores, 4);
        assert_eq!(m.stats.workers_joined, 1);
    }

    #[tokio::test]
    async fn protocol_mismatch_blocks_the_host() {
        let (mut m, mut client) = manager_with_connection().await;
        feed_lines(&mut m, &mut client, "dataswarm 9 badhost linux x86_64 1.0\n").await;

        assert!(m.blocklist.is_blocked("badhost"));
        assert_eq!(m.workers.len(), 0);

        // A fresh connection from the same host cannot register either.
        let mut again = tokio::net::TcpStream::connect(("127.0.0.1", m.port()))
            .await
            .unwrap();
        while m.connect_new_workers(None, 1).await == 0 {
            tokio::task::yield_now().await;
        }
        feed_lines(&mut m, &mut again, "dataswarm 10 badhost linux x86_64 7.7.7\n").await;
        assert_eq!(m.workers.count(WorkerType::Worker), 0);
    }

    #[tokio::test]
    async fn cache_update_and_invalid_round_trip() {
        let (mut m, mut client) = manager_with_connection().await;
        join_worker(&mut m, &mut client, "host1").await;
        let key = m.workers.keys()[0];

        feed_lines(&mut m, &mut client, "cache-update foo 100 50\n").await;
        let info = *m.workers.get(key).unwrap().current_files.get("foo").unwrap();
        assert_eq!(info.size, 100);
        assert_eq!(info.transfer_time, 50);

        client
            .write_all(b"cache-invalid foo 4\noops")
            .await
            .unwrap();
        m.busy_waiting = true;
        m.poll_active_workers(None).await;
        assert!(!m.workers.get(key).unwrap().current_files.contains_key("foo"));
    }

    #[tokio::test]
    async fn features_are_url_decoded() {
        let (mut m, mut client) = manager_with_connection().await;
        join_worker(&mut m, &mut client, "host1").await;
        feed_lines(&mut m, &mut client, "feature tensor%20rt\n").await;

        let key = m.workers.keys()[0];
        assert!(m.workers.get(key).unwrap().features.contains("tensor rt"));
    }

    #[tokio::test]
    async fn garbled_line_costs_the_connection() {
        let (mut m, mut client) = manager_with_connection().await;
        join_worker(&mut m, &mut client, "host1").await;

        feed_lines(&mut m, &mut client, "gibberish 1 2 3\n").await;
        assert_eq!(m.workers.len(), 0);
        assert_eq!(m.stats.workers_lost, 1);
    }

    #[tokio::test]
    async fn forsaken_result_requeues_without_accounting() {
        let (mut m, mut client) = manager_with_connection().await;
        join_worker(&mut m, &mut client, "host1").await;

        let id = m.submit(Task::new("/bin/true")).unwrap();
        assert!(m.send_one_task().await);
        assert_eq!(m.task_state(id), TaskState::Running);

        // 40 is the FORSAKEN wire code: returned un-run.
        feed_lines(&mut m, &mut client, "result 40 0 0 0 1\n").await;

        assert_eq!(m.task_state(id), TaskState::Ready);
        let t = m.tasks.get(&id).unwrap();
        assert_eq!(t.try_count, 1);
        assert_eq!(t.time_workers_execute_all, 0);
        assert_eq!(m.stats.tasks_done, 0);
    }

    #[tokio::test]
    async fn result_for_unassigned_task_is_drained() {
        let (mut m, mut client) = manager_with_connection().await;
        join_worker(&mut m, &mut client, "host1").await;

        client
            .write_all(b"result 0 0 5 100 99\nhello")
            .await
            .unwrap();
        m.busy_waiting = true;
        m.poll_active_workers(None).await;

        // Worker survives, payload is gone.
        assert_eq!(m.workers.count(WorkerType::Worker), 1);
    }

    #[tokio::test]
    async fn status_request_reclassifies_and_disconnects() {
        let (mut m, mut client) = manager_with_connection().await;
        join_worker(&mut m, &mut client, "host1").await;

        let mut status_conn = tokio::net::TcpStream::connect(("127.0.0.1", m.port()))
            .await
            .unwrap();
        while m.connect_new_workers(None, 1).await == 0 {
            tokio::task::yield_now().await;
        }
        status_conn.write_all(b"queue_status\n").await.unwrap();
        m.busy_waiting = true;
        m.poll_active_workers(None).await;

        // The status connection was answered and removed; the real worker
        // stays.
        assert_eq!(m.workers.len(), 1);
        assert_eq!(m.workers.count(WorkerType::Worker), 1);

        use tokio::io::AsyncReadExt;
        let mut body = Vec::new();
        status_conn.read_to_end(&mut body).await.unwrap();
        let text = String::from_utf8_lossy(&body);
        let v: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(v[0]["type"], "ds_master");
    }

    #[tokio::test]
    async fn worker_counters_arrive_via_info() {
        let (mut m, mut client) = manager_with_connection().await;
        join_worker(&mut m, &mut client, "host1").await;
        feed_lines(
            &mut m,
            &mut client,
            "info tasks_running 3\ninfo worker-id worker-xyz\ninfo unknown-field whatever\n",
        )
        .await;

        let key = m.workers.keys()[0];
        let w = m.workers.get(key).unwrap();
        assert_eq!(w.stats.tasks_running, 3);
        assert_eq!(w.workerid.as_deref(), Some("worker-xyz"));
    }
}
