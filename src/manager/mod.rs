//! # The manager.
//!
//! One [`Manager`] value owns every table and every connection; all state
//! changes happen on the caller's task, with awaits as the only suspension
//! points. There are no locks anywhere in the engine.
//!
//! Submodules split the engine along its seams:
//!
//! - [`lifecycle`]: task state machine, commit/reap, failure recovery,
//!   keepalives, fast-abort, expiry, draining.
//! - [`dispatch`]: inbound message handling, including result retrieval and
//!   the status/HTTP responders.
//! - [`wait`]: the wait loop itself, link polling, and worker admission.
//! - [`status`]: JSON status and catalog records, stats snapshots.

mod dispatch;
mod lifecycle;
mod status;
mod wait;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blocklist::{Blocklist, BLOCK_FOREVER};
use crate::capacity::CapacityEstimator;
use crate::catalog::CatalogClient;
use crate::category::{AllocationMode, CategoryTable};
use crate::config::ManagerConfig;
use crate::error::ManagerError;
use crate::events::{Event, EventKind};
use crate::factory::FactoryInfo;
use crate::registry::WorkerTable;
use crate::resources::{overcommitted, ResourceRequest};
use crate::scheduler::SchedulePolicy;
use crate::stager::{NullStager, Stager};
use crate::stats::ManagerStats;
use crate::subscribers::Subscriber;
use crate::task::{Task, TaskId, TaskState};

/// Microseconds since the epoch.
pub(crate) fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Seconds since the epoch.
pub(crate) fn timestamp_s() -> u64 {
    timestamp() / 1_000_000
}

/// Coordinator of a distributed pool of workers.
///
/// Applications submit [`Task`]s, drive [`Manager::wait`] to collect
/// completions, and otherwise leave the pool to manage itself: workers
/// connect on their own initiative, failures requeue work, and slow or
/// drained workers are retired.
pub struct Manager {
    pub(crate) listener: TcpListener,
    pub(crate) port: u16,
    pub(crate) config: ManagerConfig,
    pub(crate) name: Option<String>,
    pub(crate) priority: i64,
    pub(crate) num_tasks_left: i64,
    pub(crate) password: Option<String>,

    pub(crate) next_taskid: TaskId,
    pub(crate) tasks: HashMap<TaskId, Task>,
    /// Task ids in state READY, highest priority first.
    pub(crate) ready_list: VecDeque<TaskId>,
    pub(crate) workers: WorkerTable,
    pub(crate) blocklist: Blocklist,
    pub(crate) factories: HashMap<String, FactoryInfo>,
    pub(crate) fetch_factory: bool,
    pub(crate) categories: CategoryTable,
    pub(crate) capacity: CapacityEstimator,
    pub(crate) stats: ManagerStats,
    pub(crate) stats_disconnected: ManagerStats,
    pub(crate) max_task_resources_requested: ResourceRequest,

    pub(crate) events_tx: broadcast::Sender<Event>,
    pub(crate) subscriber_shutdown: CancellationToken,
    pub(crate) stager: Arc<dyn Stager>,
    pub(crate) catalog: Option<Arc<dyn CatalogClient>>,
    pub(crate) process_pending_check: Option<Box<dyn Fn() -> bool + Send + Sync>>,

    pub(crate) pending_conns: Vec<(tokio::net::TcpStream, std::net::SocketAddr)>,
    pub(crate) busy_waiting: bool,
    /// When the last link poll finished, microseconds.
    pub(crate) link_poll_end: u64,
    pub(crate) catalog_last_update: u64,
    pub(crate) last_large_task_check: u64,
    pub(crate) last_perf_snapshot: u64,
    pub(crate) time_last_wait: u64,
    pub(crate) warned_visibility: bool,
}

impl Manager {
    /// Binds the listening socket and returns a running manager.
    ///
    /// A configured port of 0 consults `DS_PORT`, then the
    /// `DS_LOW_PORT`/`DS_HIGH_PORT` range, and finally lets the kernel pick.
    pub async fn bind(config: ManagerConfig) -> Result<Self, ManagerError> {
        let mut port = config.port;
        if port == 0 {
            if let Ok(p) = std::env::var("DS_PORT") {
                port = p.trim().parse().unwrap_or(0);
            }
        }

        let listener = if port == 0 {
            match Self::bind_port_range().await {
                Some(listener) => listener,
                None => TcpListener::bind(("0.0.0.0", 0))
                    .await
                    .map_err(|source| ManagerError::Bind { port, source })?,
            }
        } else {
            TcpListener::bind(("0.0.0.0", port))
                .await
                .map_err(|source| ManagerError::Bind { port, source })?
        };
        let port = listener
            .local_addr()
            .map_err(|source| ManagerError::Bind { port, source })?
            .port();

        let mut config = config;
        if let Ok(bw) = std::env::var("DS_BANDWIDTH") {
            config.bandwidth_limit = parse_metric_rate(&bw).max(0.0);
        }

        // Sized for bursts of state changes; a lagging subscriber skips
        // events instead of holding the wait loop hostage.
        let (events_tx, _) = broadcast::channel(1024);
        let _ = events_tx.send(Event::now(EventKind::ManagerStart));

        let now = timestamp();
        let mut stats = ManagerStats::default();
        stats.time_when_started = now;

        info!(port, "manager is listening");

        Ok(Self {
            listener,
            port,
            config,
            name: None,
            priority: 0,
            num_tasks_left: 0,
            password: None,
            next_taskid: 1,
            tasks: HashMap::new(),
            ready_list: VecDeque::new(),
            workers: WorkerTable::new(),
            blocklist: Blocklist::new(),
            factories: HashMap::new(),
            fetch_factory: false,
            categories: CategoryTable::new(),
            capacity: CapacityEstimator::new(),
            stats,
            stats_disconnected: ManagerStats::default(),
            max_task_resources_requested: ResourceRequest::default(),
            events_tx,
            subscriber_shutdown: CancellationToken::new(),
            stager: Arc::new(NullStager),
            catalog: None,
            process_pending_check: None,
            pending_conns: Vec::new(),
            busy_waiting: false,
            link_poll_end: now,
            catalog_last_update: 0,
            last_large_task_check: now,
            last_perf_snapshot: 0,
            time_last_wait: 0,
            warned_visibility: false,
        })
    }

    async fn bind_port_range() -> Option<TcpListener> {
        let low: u16 = std::env::var("DS_LOW_PORT").ok()?.trim().parse().ok()?;
        let high: u16 = std::env::var("DS_HIGH_PORT")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(low);
        for p in low..=high {
            if let Ok(listener) = TcpListener::bind(("0.0.0.0", p)).await {
                return Some(listener);
            }
        }
        None
    }

    /// The port workers should connect to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The project name advertised to workers and the catalog.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Sets the project name and exports it for child processes.
    pub fn set_name(&mut self, name: Option<&str>) {
        self.name = name.map(str::to_string);
        if let Some(n) = &self.name {
            std::env::set_var("DS_NAME", n);
        }
    }

    /// Requires workers to present this password before registering.
    pub fn set_password(&mut self, password: impl Into<String>) {
        self.password = Some(password.into());
    }

    pub fn set_priority(&mut self, priority: i64) {
        self.priority = priority;
    }

    /// Advertises how many tasks remain overall, for factories sizing the
    /// pool; values below 1 clear the hint.
    pub fn set_num_tasks_left(&mut self, n: i64) {
        self.num_tasks_left = n.max(0);
    }

    /// Sets the catalog endpoints and exports them for child processes.
    pub fn set_catalog_servers(&mut self, hosts: &str, client: Arc<dyn CatalogClient>) {
        std::env::set_var("CATALOG_HOST", hosts);
        self.catalog = Some(client);
    }

    pub fn set_stager(&mut self, stager: Arc<dyn Stager>) {
        self.stager = stager;
    }

    pub fn set_scheduler(&mut self, policy: SchedulePolicy) {
        self.config.scheduler = policy;
    }

    /// Installs a callback consulted each wait turn; returning true makes
    /// `wait` hand control back to the application.
    pub fn set_process_pending_check(&mut self, check: impl Fn() -> bool + Send + Sync + 'static) {
        self.process_pending_check = Some(Box::new(check));
    }

    /// Hands one lifecycle event to whoever subscribed. Nobody listening
    /// is fine; the manager never waits on its audience.
    pub(crate) fn emit(&self, event: Event) {
        let _ = self.events_tx.send(event);
    }

    /// Attaches a subscriber consuming lifecycle events in the background.
    pub fn add_subscriber(&mut self, subscriber: Arc<dyn Subscriber>) {
        let mut rx = self.events_tx.subscribe();
        let token = self.subscriber_shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    ev = rx.recv() => match ev {
                        Ok(ev) => subscriber.handle(&ev).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    },
                }
            }
        });
    }

    /// Raises the floor for assigned task ids; returns the next id.
    pub fn set_min_taskid(&mut self, minid: TaskId) -> TaskId {
        if minid > self.next_taskid {
            self.next_taskid = minid;
        }
        self.next_taskid
    }

    /// Adjusts a named tunable. Unknown names are an error.
    pub fn tune(&mut self, name: &str, value: f64) -> Result<(), ManagerError> {
        match name {
            "resource-submit-multiplier" | "asynchrony-multiplier" => {
                self.config.resource_submit_multiplier = value.max(1.0);
            }
            "min-transfer-timeout" => self.config.minimum_transfer_timeout = value as u64,
            "default-transfer-rate" => self.config.default_transfer_rate = value,
            "transfer-outlier-factor" => self.config.transfer_outlier_factor = value,
            "fast-abort-multiplier" => self.activate_fast_abort(value),
            "keepalive-interval" => self.config.keepalive_interval = value.max(0.0) as u64,
            "keepalive-timeout" => self.config.keepalive_timeout = value.max(0.0) as u64,
            "short-timeout" => {
                self.config.short_timeout = Duration::from_secs((value.max(1.0)) as u64)
            }
            "long-timeout" => {
                self.config.long_timeout = Duration::from_secs((value.max(1.0)) as u64)
            }
            "hungry-minimum" => self.config.hungry_minimum = (value.max(1.0)) as usize,
            "wait-for-workers" => self.config.wait_for_workers = (value.max(0.0)) as usize,
            "wait-retrieve-many" => self.config.wait_retrieve_many = value > 0.0,
            "force-proportional-resources" => {
                self.config.force_proportional_resources = value > 0.0
            }
            _ => {
                warn!(name, "tuning parameter not recognized");
                return Err(ManagerError::UnknownParameter { name: name.into() });
            }
        }
        Ok(())
    }

    /// Submits a task, assigning its id on first submission.
    ///
    /// A task that already ran to a terminal state may be submitted again:
    /// its definition is kept and its per-attempt state reset.
    pub fn submit(&mut self, mut task: Task) -> Result<TaskId, ManagerError> {
        if task.taskid > 0 {
            if task.state.is_terminal() {
                task.clean(true);
            } else {
                return Err(ManagerError::AlreadySubmitted { taskid: task.taskid });
            }
        }

        task.taskid = self.next_taskid;
        self.next_taskid += 1;

        let taskid = task.taskid;
        task.time_when_submitted = timestamp();
        self.max_task_resources_requested
            .grow_to(&task.resources_requested);
        self.categories.lookup_or_create(&task.category);

        self.tasks.insert(taskid, task);
        self.change_task_state(taskid, TaskState::Ready);
        self.stats.tasks_submitted += 1;

        Ok(taskid)
    }

    /// State of a submitted task; `Unknown` once it has been handed back.
    pub fn task_state(&self, taskid: TaskId) -> TaskState {
        self.tasks
            .get(&taskid)
            .map(|t| t.state)
            .unwrap_or(TaskState::Unknown)
    }

    /// True when no task is owned by the manager in any live state.
    pub fn empty(&self) -> bool {
        !self.tasks.values().any(|t| {
            matches!(
                t.state,
                TaskState::Ready
                    | TaskState::Running
                    | TaskState::WaitingRetrieval
                    | TaskState::Retrieved
            )
        })
    }

    /// Whether the pool could absorb more submissions right now.
    ///
    /// A queue with fewer than `hungry_minimum` waiting tasks is always
    /// hungry; otherwise the demand of the waiting tasks is compared with
    /// the (overcommitted) unused capacity of the pool.
    pub fn hungry(&self) -> bool {
        let waiting: Vec<&Task> = self
            .ready_list
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .collect();
        if waiting.len() < self.config.hungry_minimum {
            return true;
        }

        let total = self.aggregate_worker_resources();
        let m = self.config.resource_submit_multiplier;
        let avail_cores = overcommitted(total.cores.total, m) - total.cores.inuse;
        let avail_memory = overcommitted(total.memory.total, m) - total.memory.inuse;
        let avail_gpus = overcommitted(total.gpus.total, m) - total.gpus.inuse;
        let avail_disk = total.disk.total - total.disk.inuse;

        let mut need_cores = 0i64;
        let mut need_memory = 0i64;
        let mut need_disk = 0i64;
        let mut need_gpus = 0i64;
        for t in waiting {
            let r = &t.resources_requested;
            need_cores += r.cores.unwrap_or(1).max(1);
            need_memory += r.memory.unwrap_or(0);
            need_disk += r.disk.unwrap_or(0);
            need_gpus += r.gpus.unwrap_or(0);
        }

        need_cores <= avail_cores
            && need_memory <= avail_memory
            && need_disk <= avail_disk
            && need_gpus <= avail_gpus
    }

    /// Blocks a hostname forever.
    pub fn block_host(&mut self, host: &str) {
        self.block_host_with_timeout(host, BLOCK_FOREVER);
    }

    /// Blocks a hostname; negative timeouts block forever.
    pub fn block_host_with_timeout(&mut self, host: &str, timeout_s: i64) {
        self.blocklist.block(host, timeout_s, timestamp_s());
        self.stats.workers_blocked += 1;
        self.emit(Event::now(EventKind::HostBlocked).with_host(host));
        debug!(host, timeout_s, "host blocked");
    }

    pub fn unblock_host(&mut self, host: &str) {
        self.blocklist.unblock(host);
        self.emit(Event::now(EventKind::HostUnblocked).with_host(host));
    }

    pub fn unblock_all(&mut self) {
        self.blocklist.unblock_all();
    }

    /// Marks every worker on `host` as draining (or not). Draining workers
    /// finish their current tasks, receive no new ones, and are shut down
    /// once idle. Returns how many workers were updated.
    pub fn specify_draining_by_hostname(&mut self, host: &str, drain: bool) -> usize {
        let mut updated = 0;
        for (_, w) in self.workers.iter_mut() {
            if w.hostname.as_deref() == Some(host) {
                w.draining = drain;
                updated += 1;
            }
        }
        updated
    }

    /// Enables fast abort for the default category; a multiplier of 0
    /// disables it, negative restores the default behavior.
    pub fn activate_fast_abort(&mut self, multiplier: f64) {
        self.activate_fast_abort_category("default", multiplier);
    }

    /// Enables fast abort for one category.
    pub fn activate_fast_abort_category(&mut self, category: &str, multiplier: f64) {
        let c = self.categories.lookup_or_create(category);
        if multiplier >= 1.0 {
            debug!(category, multiplier, "enabling fast abort");
            c.fast_abort = multiplier;
        } else if multiplier == 0.0 {
            debug!(category, "disabling fast abort");
            c.fast_abort = 0.0;
        } else {
            debug!(category, "using default fast abort multiplier");
            c.fast_abort = crate::category::FAST_ABORT_USE_DEFAULT;
        }
    }

    /// Sets the allocation mode of one category, or the default mode for
    /// new categories when `category` is `None`.
    pub fn set_category_mode(&mut self, category: Option<&str>, mode: AllocationMode) {
        match category {
            None => self.categories.default_mode = mode,
            Some(name) => {
                let c = self.categories.lookup_or_create(name);
                c.mode = mode;
                let name = name.to_string();
                self.emit(Event::now(EventKind::CategoryChanged).with_category(name));
            }
        }
    }

    pub fn set_category_max_resources(&mut self, category: &str, max: ResourceRequest) {
        self.categories.lookup_or_create(category).max_allocation = max;
    }

    pub fn set_category_min_resources(&mut self, category: &str, min: ResourceRequest) {
        self.categories.lookup_or_create(category).min_allocation = min;
    }

    pub fn set_category_first_allocation_guess(&mut self, category: &str, first: ResourceRequest) {
        self.categories.lookup_or_create(category).first_allocation = first;
    }

    /// Cancels a task wherever it is; returns it once removed.
    pub async fn cancel_by_taskid(&mut self, taskid: TaskId) -> Option<Task> {
        if !self.tasks.contains_key(&taskid) {
            debug!(taskid, "cancel: task not found");
            return None;
        }
        let t = self.cancel_task_on_worker(taskid, TaskState::Canceled).await;
        self.stats.tasks_cancelled += 1;
        t
    }

    /// Cancels any one task carrying the tag.
    pub async fn cancel_by_tag(&mut self, tag: &str) -> Option<Task> {
        let id = self
            .tasks
            .values()
            .find(|t| t.tag_matches(Some(tag)))
            .map(|t| t.taskid)?;
        self.cancel_by_taskid(id).await
    }

    /// Cancels everything, broadcasting `kill -1` to every worker.
    pub async fn cancel_all(&mut self) -> Vec<Task> {
        let mut out = Vec::new();

        for key in self.workers.keys() {
            let _ = self.send_to_worker(key, "kill -1\n").await;
        }

        let ids: Vec<TaskId> = self.tasks.keys().copied().collect();
        for id in ids {
            let t = self.cancel_task_on_worker(id, TaskState::Canceled).await;
            self.stats.tasks_cancelled += 1;
            out.extend(t);
        }
        self.workers.with_available_results.clear();
        out
    }

    /// Invalidates a cached file everywhere: tasks using it are requeued
    /// and every worker holding it is told to unlink it.
    pub async fn invalidate_cached_file(&mut self, cached_name: &str) {
        let holders: Vec<_> = self
            .workers
            .iter()
            .filter(|&(_, w)| w.current_files.contains_key(cached_name))
            .map(|(k, _)| *k)
            .collect();

        for key in holders {
            let victims: Vec<TaskId> = {
                let Some(w) = self.workers.get(key) else { continue };
                w.current_tasks
                    .iter()
                    .copied()
                    .filter(|id| {
                        self.tasks.get(id).is_some_and(|t| {
                            t.input_files
                                .iter()
                                .chain(t.output_files.iter())
                                .any(|f| f.cached_name == cached_name)
                        })
                    })
                    .collect()
            };
            for id in victims {
                self.cancel_task_on_worker(id, TaskState::Ready).await;
            }
            let _ = self
                .send_to_worker(key, &format!("unlink {cached_name}\n"))
                .await;
            if let Some(w) = self.workers.get_mut(key) {
                w.current_files.remove(cached_name);
            }
        }
    }

    /// Applies factory descriptions, as a catalog update would. A factory
    /// whose ceiling dropped below its connected count has idle workers
    /// trimmed immediately; busy workers are never cancelled.
    pub async fn update_factories(&mut self, updates: Vec<crate::factory::FactoryUpdate>) {
        for update in updates {
            self.update_factory(update).await;
        }
    }

    /// Tells up to `n` idle workers to exit; `n < 1` means all of them.
    pub async fn shut_down_workers(&mut self, n: usize) -> usize {
        let limit = if n < 1 { self.workers.len() } else { n };
        let mut shut = 0;
        for key in self.workers.keys() {
            if shut >= limit {
                break;
            }
            let idle = self
                .workers
                .get(key)
                .map(|w| w.current_tasks.is_empty())
                .unwrap_or(false);
            if idle {
                self.shut_down_worker(key).await;
                shut += 1;
            }
        }
        shut
    }

    /// Gently releases every connected worker.
    pub async fn release_all_workers(&mut self) {
        for key in self.workers.keys() {
            self.release_worker(key).await;
        }
    }

    /// Releases workers, sends the final catalog update, and closes the
    /// event stream.
    pub async fn shutdown(mut self) {
        self.release_all_workers().await;
        self.publish_perf_snapshot(true);
        if self.name.is_some() {
            self.update_catalog(true).await;
        }
        self.emit(Event::now(EventKind::ManagerEnd));
        // Let subscribers drain before their tasks are cancelled.
        tokio::task::yield_now().await;
        self.subscriber_shutdown.cancel();
    }

    /// Effective pool bandwidth in MB/s, from observed transfers.
    pub fn effective_bandwidth(&self) -> f64 {
        self.queue_transfer_rate() / 1_000_000.0
    }

    /// Blocks until a task completes, the timeout passes, or the
    /// process-pending callback fires.
    ///
    /// `None` waits forever. A zero timeout still runs one full turn.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Option<Task> {
        self.wait_internal(None, timeout).await
    }

    /// Like [`Manager::wait`], considering only tasks with the given tag.
    pub async fn wait_for_tag(&mut self, tag: &str, timeout: Option<Duration>) -> Option<Task> {
        self.wait_internal(Some(tag.to_string()), timeout).await
    }
}

/// Parses a human-readable rate such as `100M` or `2.5G` into bytes/second.
fn parse_metric_rate(s: &str) -> f64 {
    let s = s.trim();
    let (digits, suffix) = match s.find(|c: char| !c.is_ascii_digit() && c != '.' && c != '-') {
        Some(i) => s.split_at(i),
        None => (s, ""),
    };
    let value: f64 = digits.parse().unwrap_or(0.0);
    let scale = match suffix.trim().chars().next() {
        Some('k') | Some('K') => 1e3,
        Some('m') | Some('M') => 1e6,
        Some('g') | Some('G') => 1e9,
        Some('t') | Some('T') => 1e12,
        _ => 1.0,
    };
    value * scale
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    /// A manager with tight timeouts plus one raw client connection,
    /// already admitted as an unidentified worker.
    pub(crate) async fn manager_with_connection() -> (Manager, TcpStream) {
        let mut cfg = ManagerConfig::default();
        cfg.short_timeout = Duration::from_millis(500);
        let mut m = Manager::bind(cfg).await.unwrap();
        let client = TcpStream::connect(("127.0.0.1", m.port())).await.unwrap();
        while m.connect_new_workers(None, 1).await == 0 {
            tokio::task::yield_now().await;
        }
        (m, client)
    }

    /// Writes protocol lines and lets the manager service them all. Each
    /// poll blocks until the next line is actually readable.
    pub(crate) async fn feed_lines(m: &mut Manager, client: &mut TcpStream, lines: &str) {
        client.write_all(lines.as_bytes()).await.unwrap();
        let n = lines.matches('\n').count();
        for _ in 0..n {
            m.busy_waiting = true;
            m.poll_active_workers(None).await;
        }
    }

    /// The canonical handshake plus a full resource report.
    pub(crate) async fn join_worker(m: &mut Manager, client: &mut TcpStream, host: &str) {
        let lines = format!(
            "dataswarm 10 {host} linux x86_64 7.7.7\n\
             resource workers 1 1 1\n\
             resource cores 4 4 4\n\
             resource memory 4096 4096 4096\n\
             resource disk 40960 40960 40960\n\
             resource gpus 0 0 0\n\
             info end_of_resource_update 0\n"
        );
        feed_lines(m, client, &lines).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_rates_parse() {
        assert_eq!(parse_metric_rate("1000"), 1000.0);
        assert_eq!(parse_metric_rate("100M"), 1e8);
        assert_eq!(parse_metric_rate("2.5G"), 2.5e9);
        assert_eq!(parse_metric_rate("-1"), -1.0);
        assert_eq!(parse_metric_rate("junk"), 0.0);
    }

    #[tokio::test]
    async fn bind_picks_a_port() {
        let m = Manager::bind(ManagerConfig::default()).await.unwrap();
        assert!(m.port() > 0);
    }

    #[tokio::test]
    async fn submit_assigns_increasing_ids() {
        let mut m = Manager::bind(ManagerConfig::default()).await.unwrap();
        let a = m.submit(Task::new("true")).unwrap();
        let b = m.submit(Task::new("true")).unwrap();
        assert!(b > a);
        assert_eq!(m.task_state(a), TaskState::Ready);
        assert!(!m.empty());
    }

    #[tokio::test]
    async fn resubmitting_live_task_is_rejected() {
        let mut m = Manager::bind(ManagerConfig::default()).await.unwrap();
        let id = m.submit(Task::new("true")).unwrap();
        let mut dup = Task::new("true");
        dup.taskid = id;
        dup.state = TaskState::Ready;
        assert!(matches!(
            m.submit(dup),
            Err(ManagerError::AlreadySubmitted { .. })
        ));
    }

    #[tokio::test]
    async fn resubmitting_terminal_task_keeps_definition() {
        let mut m = Manager::bind(ManagerConfig::default()).await.unwrap();
        let id = m.submit(Task::new("true").with_tag("keep")).unwrap();
        let mut done = m.tasks.remove(&id).unwrap();
        m.ready_list.retain(|x| *x != id);
        done.state = TaskState::Done;
        done.try_count = 3;

        let new_id = m.submit(done).unwrap();
        assert!(new_id > id);
        let t = m.tasks.get(&new_id).unwrap();
        assert_eq!(t.tag.as_deref(), Some("keep"));
        assert_eq!(t.try_count, 0);
    }

    #[tokio::test]
    async fn tune_rejects_unknown_knob() {
        let mut m = Manager::bind(ManagerConfig::default()).await.unwrap();
        assert!(m.tune("hungry-minimum", 5.0).is_ok());
        assert_eq!(m.config.hungry_minimum, 5);
        assert!(m.tune("no-such-knob", 1.0).is_err());
    }

    #[tokio::test]
    async fn empty_queue_is_hungry() {
        let m = Manager::bind(ManagerConfig::default()).await.unwrap();
        assert!(m.hungry());
    }
}
