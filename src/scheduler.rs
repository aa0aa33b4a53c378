//! # Task-to-worker scheduling.
//!
//! Two decisions are made here: which worker runs a ready task
//! ([`choose_worker`]), and how large a resource box the task gets on that
//! worker ([`choose_resources`]). Worker choice is policy-driven and
//! deterministic for a given table order; box choice is a pure function of
//! the category state, the task request, and the worker's reported shape.

use rand::Rng;

use crate::blocklist::Blocklist;
use crate::category::{AllocationMode, Category};
use crate::registry::WorkerTable;
use crate::resources::{overcommitted, ResourceBox, ResourceRequest};
use crate::task::Task;
use crate::worker::{Worker, WorkerKey, WorkerType};

/// Worker-selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulePolicy {
    /// First worker that fits, in table order.
    Fcfs,
    /// Worker already caching the most input bytes for the task.
    Files,
    /// Worker with the best observed completion time.
    Time,
    /// Uniformly random among fitting workers.
    Random,
    /// Worker with the most unused capacity.
    WorstFit,
}

/// True when this worker could run the task right now.
fn worker_fits(
    w: &Worker,
    blocklist: &Blocklist,
    task: &Task,
    min: &ResourceRequest,
    multiplier: f64,
) -> bool {
    if w.kind != WorkerType::Worker || w.draining {
        return false;
    }
    let Some(hostname) = w.hostname.as_deref() else {
        return false;
    };
    if blocklist.is_blocked(hostname) {
        return false;
    }

    let r = &w.resources;
    if r.workers.total < 1 {
        return false;
    }

    // The task's minimum must fit in the largest sub-worker.
    if min.cores.unwrap_or(0) > r.cores.largest
        || min.memory.unwrap_or(0) > r.memory.largest
        || min.disk.unwrap_or(0) > r.disk.largest
        || min.gpus.unwrap_or(0) > r.gpus.largest
    {
        return false;
    }

    if !task.required_features.iter().all(|f| w.features.contains(f)) {
        return false;
    }

    // Admission against what is currently unused. A task with no explicit
    // request still consumes at least one core unless it is gpu-only.
    let need_cores = min
        .cores
        .unwrap_or(if min.gpus.unwrap_or(0) > 0 { 0 } else { 1 });
    if r.cores.inuse + need_cores > overcommitted(r.cores.total, multiplier) {
        return false;
    }
    if r.memory.inuse + min.memory.unwrap_or(0) > overcommitted(r.memory.total, multiplier) {
        return false;
    }
    if r.gpus.inuse + min.gpus.unwrap_or(0) > overcommitted(r.gpus.total, multiplier) {
        return false;
    }
    // Disk is never overcommitted.
    if r.disk.inuse + min.disk.unwrap_or(0) > r.disk.total {
        return false;
    }

    true
}

/// Bytes of the task's cacheable inputs already present on the worker.
fn cached_input_bytes(w: &Worker, task: &Task) -> i64 {
    task.input_files
        .iter()
        .filter(|f| f.flags.cache)
        .filter_map(|f| w.current_files.get(&f.cached_name))
        .map(|info| info.size.max(0))
        .sum()
}

/// Picks a worker for the task, or `None` when nothing fits.
pub fn choose_worker(
    table: &WorkerTable,
    blocklist: &Blocklist,
    policy: SchedulePolicy,
    task: &Task,
    min: &ResourceRequest,
    multiplier: f64,
) -> Option<WorkerKey> {
    let fitting = || {
        table
            .iter()
            .filter(move |&(_, w)| worker_fits(w, blocklist, task, min, multiplier))
    };

    match policy {
        SchedulePolicy::Fcfs => fitting().next().map(|(k, _)| *k),
        SchedulePolicy::Files => fitting()
            .max_by_key(|&(k, w)| (cached_input_bytes(w, task), std::cmp::Reverse(*k)))
            .map(|(k, _)| *k),
        SchedulePolicy::Time => {
            let with_history = fitting()
                .filter(|&(_, w)| w.total_tasks_complete > 0)
                .min_by_key(|&(k, w)| (w.average_task_time(), *k))
                .map(|(k, _)| *k);
            with_history.or_else(|| fitting().next().map(|(k, _)| *k))
        }
        SchedulePolicy::Random => {
            let candidates: Vec<WorkerKey> = fitting().map(|(k, _)| *k).collect();
            if candidates.is_empty() {
                None
            } else {
                let i = rand::thread_rng().gen_range(0..candidates.len());
                Some(candidates[i])
            }
        }
        SchedulePolicy::WorstFit => fitting()
            .max_by_key(|&(k, w)| {
                let r = &w.resources;
                (
                    r.cores.total - r.cores.inuse,
                    r.memory.total - r.memory.inuse,
                    std::cmp::Reverse(*k),
                )
            })
            .map(|(k, _)| *k),
    }
}

/// Decides the concrete resource box for `task` on `worker`.
///
/// Starting from the category's dynamic maximum, either divide the worker
/// proportionally (fixed categories and `force_proportional`), or hand out
/// the whole worker when nothing is specified or any specified dimension
/// already covers it. The result is finally raised to the category minimum.
pub fn choose_resources(
    worker: &Worker,
    category: &Category,
    task: &Task,
    force_proportional: bool,
) -> ResourceBox {
    let r = &worker.resources;
    let mut limits = category.dynamic_max(&task.resources_requested, task.resource_request);

    let mut use_whole_worker = true;

    if force_proportional || category.mode == AllocationMode::Fixed {
        let mut max_proportion = -1.0f64;
        if r.cores.largest > 0 {
            if let Some(c) = limits.cores {
                max_proportion = max_proportion.max(c as f64 / r.cores.largest as f64);
            }
        }
        if r.memory.largest > 0 {
            if let Some(m) = limits.memory {
                max_proportion = max_proportion.max(m as f64 / r.memory.largest as f64);
            }
        }
        if r.disk.largest > 0 {
            if let Some(d) = limits.disk {
                max_proportion = max_proportion.max(d as f64 / r.disk.largest as f64);
            }
        }
        if r.gpus.largest > 0 {
            if let Some(g) = limits.gpus {
                max_proportion = max_proportion.max(g as f64 / r.gpus.largest as f64);
            }
        }

        if max_proportion > 1.0 {
            // The task does not fit this worker for its specified resources;
            // leave the unspecified ones at the whole worker so the
            // cannot-fit warning logic sees the true shape.
            use_whole_worker = true;
        } else if max_proportion > 0.0 {
            use_whole_worker = false;

            // Round so that an integer number of tasks fills the worker.
            let mut p = max_proportion;
            if force_proportional {
                p = 1.0 / (1.0 / p).floor();
            }

            if force_proportional || limits.cores.is_none() {
                limits.cores = if limits.gpus.unwrap_or(0) > 0 {
                    Some(0)
                } else {
                    Some(((r.cores.largest as f64 * p).floor() as i64).max(1))
                };
            }
            if limits.gpus.is_none() {
                limits.gpus = Some(0);
            }
            if force_proportional || limits.memory.is_none() {
                limits.memory = Some(((r.memory.largest as f64 * p).floor() as i64).max(1));
            }
            if force_proportional || limits.disk.is_none() {
                limits.disk = Some(((r.disk.largest as f64 * p).floor() as i64).max(1));
            }
        }
    }

    let under = |v: Option<i64>| v.unwrap_or(0) < 1;
    if under(limits.cores) && under(limits.gpus) && under(limits.memory) && under(limits.disk) {
        use_whole_worker = true;
    }

    let covers = |v: Option<i64>, largest: i64| v.unwrap_or(0) > 0 && v.unwrap_or(0) >= largest;
    if covers(limits.cores, r.cores.largest)
        || covers(limits.gpus, r.gpus.largest)
        || covers(limits.memory, r.memory.largest)
        || covers(limits.disk, r.disk.largest)
    {
        use_whole_worker = true;
    }

    if use_whole_worker {
        if limits.cores.unwrap_or(0) <= 0 {
            limits.cores = if limits.gpus.unwrap_or(0) > 0 {
                Some(0)
            } else {
                Some(r.cores.largest)
            };
        }
        if limits.gpus.unwrap_or(0) <= 0 {
            limits.gpus = Some(0);
        }
        if limits.memory.unwrap_or(0) <= 0 {
            limits.memory = Some(r.memory.largest);
        }
        if limits.disk.unwrap_or(0) <= 0 {
            limits.disk = Some(r.disk.largest);
        }
    }

    // Never go below the category minimum.
    let min = category.dynamic_min(&task.resources_requested);
    limits.grow_to(&min);

    ResourceBox {
        cores: limits.cores.unwrap_or(0),
        memory: limits.memory.unwrap_or(0),
        disk: limits.disk.unwrap_or(0),
        gpus: limits.gpus.unwrap_or(0),
        end: limits.end.unwrap_or(0),
        wall_time: limits.wall_time.unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Link;
    use tokio::net::{TcpListener, TcpStream};

    async fn add_worker(table: &mut WorkerTable, cores: i64, memory: i64, disk: i64) -> WorkerKey {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        let key = table.insert(Link::new(server, peer), format!("{peer}"), 0);
        let w = table.get_mut(key).unwrap();
        w.kind = WorkerType::Worker;
        w.hostname = Some(format!("host{}", key.0));
        w.resources.update_kind("workers", 1, 1, 1);
        w.resources.update_kind("cores", cores, cores, cores);
        w.resources.update_kind("memory", memory, memory, memory);
        w.resources.update_kind("disk", disk, disk, disk);
        w.resources.update_kind("gpus", 0, 0, 0);
        key
    }

    fn plain_category() -> Category {
        Category::new("default", AllocationMode::Fixed)
    }

    #[tokio::test]
    async fn fcfs_takes_first_fit() {
        let mut table = WorkerTable::new();
        let small = add_worker(&mut table, 1, 512, 1024).await;
        let _big = add_worker(&mut table, 16, 8192, 10240).await;

        let task = Task::new("true");
        let min = ResourceRequest::default();
        let pick = choose_worker(
            &table,
            &Blocklist::new(),
            SchedulePolicy::Fcfs,
            &task,
            &min,
            1.0,
        );
        assert_eq!(pick, Some(small));
    }

    #[tokio::test]
    async fn blocked_hosts_are_skipped() {
        let mut table = WorkerTable::new();
        let a = add_worker(&mut table, 4, 4096, 4096).await;
        let b = add_worker(&mut table, 4, 4096, 4096).await;

        let mut blocklist = Blocklist::new();
        let host_a = table.get(a).unwrap().hostname.clone().unwrap();
        blocklist.block(&host_a, -1, 0);

        let task = Task::new("true");
        let pick = choose_worker(
            &table,
            &blocklist,
            SchedulePolicy::Fcfs,
            &task,
            &ResourceRequest::default(),
            1.0,
        );
        assert_eq!(pick, Some(b));
    }

    #[tokio::test]
    async fn minimum_must_fit_largest() {
        let mut table = WorkerTable::new();
        let _small = add_worker(&mut table, 2, 1024, 1024).await;

        let task = Task::new("true").with_cores(8);
        let min = ResourceRequest {
            cores: Some(8),
            ..Default::default()
        };
        let pick = choose_worker(
            &table,
            &Blocklist::new(),
            SchedulePolicy::Fcfs,
            &task,
            &min,
            1.0,
        );
        assert_eq!(pick, None);
    }

    #[tokio::test]
    async fn busy_worker_is_not_double_booked() {
        let mut table = WorkerTable::new();
        let key = add_worker(&mut table, 4, 4096, 4096).await;
        table.get_mut(key).unwrap().resources.cores.inuse = 4;

        let task = Task::new("true");
        let pick = choose_worker(
            &table,
            &Blocklist::new(),
            SchedulePolicy::Fcfs,
            &task,
            &ResourceRequest::default(),
            1.0,
        );
        assert_eq!(pick, None);

        // Overcommitting cores re-admits the task.
        let pick = choose_worker(
            &table,
            &Blocklist::new(),
            SchedulePolicy::Fcfs,
            &task,
            &ResourceRequest::default(),
            2.0,
        );
        assert_eq!(pick, Some(key));
    }

    #[tokio::test]
    async fn required_features_filter_workers() {
        let mut table = WorkerTable::new();
        let plain = add_worker(&mut table, 4, 4096, 4096).await;
        let gpu = add_worker(&mut table, 4, 4096, 4096).await;
        table.get_mut(gpu).unwrap().features.insert("a100".into());

        let task = Task::new("true").with_feature("a100");
        let pick = choose_worker(
            &table,
            &Blocklist::new(),
            SchedulePolicy::Fcfs,
            &task,
            &ResourceRequest::default(),
            1.0,
        );
        assert_eq!(pick, Some(gpu));
        assert_ne!(pick, Some(plain));
    }

    #[tokio::test]
    async fn time_policy_prefers_fast_history() {
        let mut table = WorkerTable::new();
        let slow = add_worker(&mut table, 4, 4096, 4096).await;
        let fast = add_worker(&mut table, 4, 4096, 4096).await;
        {
            let w = table.get_mut(slow).unwrap();
            w.total_tasks_complete = 10;
            w.total_task_time = 100_000_000;
        }
        {
            let w = table.get_mut(fast).unwrap();
            w.total_tasks_complete = 10;
            w.total_task_time = 10_000_000;
        }

        let task = Task::new("true");
        let pick = choose_worker(
            &table,
            &Blocklist::new(),
            SchedulePolicy::Time,
            &task,
            &ResourceRequest::default(),
            1.0,
        );
        assert_eq!(pick, Some(fast));
    }

    #[tokio::test]
    async fn files_policy_prefers_cached_inputs() {
        let mut table = WorkerTable::new();
        let cold = add_worker(&mut table, 4, 4096, 4096).await;
        let warm = add_worker(&mut table, 4, 4096, 4096).await;

        let task = Task::new("true").with_input_file(
            "data.bin",
            "data.bin",
            crate::task::FileFlags {
                cache: true,
                watch: false,
            },
        );
        let cached = task.input_files[0].cached_name.clone();
        table.get_mut(warm).unwrap().current_files.insert(
            cached,
            crate::worker::RemoteFileInfo {
                size: 1 << 20,
                transfer_time: 10,
            },
        );

        let pick = choose_worker(
            &table,
            &Blocklist::new(),
            SchedulePolicy::Files,
            &task,
            &ResourceRequest::default(),
            1.0,
        );
        assert_eq!(pick, Some(warm));
        assert_ne!(pick, Some(cold));
    }

    #[tokio::test]
    async fn unspecified_task_takes_whole_worker() {
        let mut table = WorkerTable::new();
        let key = add_worker(&mut table, 8, 4096, 10240).await;
        let w = table.get(key).unwrap();

        let task = Task::new("true");
        let cat = plain_category();
        let b = choose_resources(w, &cat, &task, false);
        assert_eq!(b.cores, 8);
        assert_eq!(b.memory, 4096);
        assert_eq!(b.disk, 10240);
        assert_eq!(b.gpus, 0);
    }

    #[tokio::test]
    async fn fixed_category_divides_worker_proportionally() {
        let mut table = WorkerTable::new();
        let key = add_worker(&mut table, 8, 4096, 10240).await;
        let w = table.get(key).unwrap();

        // Two cores out of eight: a quarter of the worker.
        let task = Task::new("true").with_cores(2);
        let cat = plain_category();
        let b = choose_resources(w, &cat, &task, false);
        assert_eq!(b.cores, 2);
        assert_eq!(b.memory, 1024);
        assert_eq!(b.disk, 2560);
    }

    #[tokio::test]
    async fn specified_dim_covering_worker_takes_it_whole() {
        let mut table = WorkerTable::new();
        let key = add_worker(&mut table, 8, 4096, 10240).await;
        let w = table.get(key).unwrap();

        let task = Task::new("true").with_cores(8);
        let cat = plain_category();
        let b = choose_resources(w, &cat, &task, false);
        assert_eq!(b.cores, 8);
        assert_eq!(b.memory, 4096);
        assert_eq!(b.disk, 10240);
    }

    #[tokio::test]
    async fn gpu_task_defaults_to_zero_cores() {
        let mut table = WorkerTable::new();
        let key = add_worker(&mut table, 8, 4096, 10240).await;
        {
            let w = table.get_mut(key).unwrap();
            w.resources.update_kind("gpus", 4, 4, 4);
        }
        let w = table.get(key).unwrap();

        let task = Task::new("train").with_gpus(4);
        let cat = plain_category();
        let b = choose_resources(w, &cat, &task, false);
        assert_eq!(b.gpus, 4);
        assert_eq!(b.cores, 0);
    }

    #[tokio::test]
    async fn box_is_raised_to_category_minimum() {
        let mut table = WorkerTable::new();
        let key = add_worker(&mut table, 8, 4096, 10240).await;
        let w = table.get(key).unwrap();

        let task = Task::new("true").with_cores(1);
        let mut cat = plain_category();
        cat.min_allocation.memory = Some(2048);
        let b = choose_resources(w, &cat, &task, false);
        assert_eq!(b.cores, 1);
        assert!(b.memory >= 2048);
    }
}
