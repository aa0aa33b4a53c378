//! # Worker resource accounting.
//!
//! Each worker reports four counters per resource kind; the manager owns the
//! `inuse` component and preserves it across worker updates. The resource
//! kinds are a closed set, so the records are fixed-layout structs rather
//! than maps.

use serde::Serialize;

/// Sentinel tag meaning a worker has not completed a resource report yet.
pub const TAG_UNSET: i64 = -1;

/// One resource kind on one worker.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resource {
    /// Capacity reported by the worker.
    pub total: i64,
    /// Allocated by the manager; preserved across worker updates.
    pub inuse: i64,
    /// Smallest sub-worker share.
    pub smallest: i64,
    /// Largest sub-worker share.
    pub largest: i64,
}

impl Resource {
    /// Folds another worker's report into an aggregate.
    pub fn add(&mut self, other: &Resource) {
        self.total += other.total;
        self.inuse += other.inuse;
        self.smallest = if self.smallest == 0 {
            other.smallest
        } else {
            self.smallest.min(other.smallest)
        };
        self.largest = self.largest.max(other.largest);
    }

    /// Installs a fresh worker report, keeping the manager-owned `inuse`.
    pub fn update(&mut self, total: i64, smallest: i64, largest: i64) {
        let inuse = self.inuse;
        *self = Resource {
            total,
            inuse,
            smallest,
            largest,
        };
    }
}

/// The full resource report of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerResources {
    pub workers: Resource,
    pub cores: Resource,
    pub memory: Resource,
    pub disk: Resource,
    pub gpus: Resource,
    /// Worker-chosen report tag; negative until the first complete report.
    pub tag: i64,
}

impl Default for WorkerResources {
    fn default() -> Self {
        Self {
            workers: Resource::default(),
            cores: Resource::default(),
            memory: Resource::default(),
            disk: Resource::default(),
            gpus: Resource::default(),
            tag: TAG_UNSET,
        }
    }
}

impl WorkerResources {
    /// Routes one `resource <kind> ...` report; unknown kinds are ignored.
    pub fn update_kind(&mut self, kind: &str, total: i64, smallest: i64, largest: i64) {
        match kind {
            "workers" => self.workers.update(total, smallest, largest),
            "cores" => self.cores.update(total, smallest, largest),
            "memory" => self.memory.update(total, smallest, largest),
            "disk" => self.disk.update(total, smallest, largest),
            "gpus" => self.gpus.update(total, smallest, largest),
            _ => {}
        }
    }

    /// Folds a worker report into a pool-wide aggregate.
    pub fn add(&mut self, other: &WorkerResources) {
        self.workers.add(&other.workers);
        self.cores.add(&other.cores);
        self.memory.add(&other.memory);
        self.disk.add(&other.disk);
        self.gpus.add(&other.gpus);
    }
}

/// A concrete allocation of resources for one task on one worker, or any
/// other fully-resolved resource quadruple (such as the componentwise
/// largest worker seen).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceBox {
    pub cores: i64,
    pub memory: i64,
    pub disk: i64,
    pub gpus: i64,
    /// Absolute end time in seconds since the epoch; 0 when unset.
    pub end: i64,
    /// Wall-time limit in seconds; 0 when unset.
    pub wall_time: i64,
}

impl ResourceBox {
    /// Componentwise maximum over the four core dimensions.
    pub fn grow_to(&mut self, other: &ResourceBox) {
        self.cores = self.cores.max(other.cores);
        self.memory = self.memory.max(other.memory);
        self.disk = self.disk.max(other.disk);
        self.gpus = self.gpus.max(other.gpus);
    }
}

/// A task's resource request; `None` dimensions are left for the manager to
/// decide when the task is matched to a worker.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceRequest {
    pub cores: Option<i64>,
    pub memory: Option<i64>,
    pub disk: Option<i64>,
    pub gpus: Option<i64>,
    /// Absolute end time in seconds since the epoch.
    pub end: Option<i64>,
    /// Wall-time limit in seconds.
    pub wall_time: Option<i64>,
    /// Earliest dispatch time, in microseconds since the epoch.
    pub start: Option<i64>,
}

impl ResourceRequest {
    /// Fills every unset dimension from `other`.
    pub fn or_else(&self, other: &ResourceRequest) -> ResourceRequest {
        ResourceRequest {
            cores: self.cores.or(other.cores),
            memory: self.memory.or(other.memory),
            disk: self.disk.or(other.disk),
            gpus: self.gpus.or(other.gpus),
            end: self.end.or(other.end),
            wall_time: self.wall_time.or(other.wall_time),
            start: self.start.or(other.start),
        }
    }

    /// Componentwise maximum of the specified dimensions.
    pub fn grow_to(&mut self, other: &ResourceRequest) {
        fn max_opt(a: Option<i64>, b: Option<i64>) -> Option<i64> {
            match (a, b) {
                (Some(x), Some(y)) => Some(x.max(y)),
                (x, y) => x.or(y),
            }
        }
        self.cores = max_opt(self.cores, other.cores);
        self.memory = max_opt(self.memory, other.memory);
        self.disk = max_opt(self.disk, other.disk);
        self.gpus = max_opt(self.gpus, other.gpus);
        self.end = max_opt(self.end, other.end);
        self.wall_time = max_opt(self.wall_time, other.wall_time);
    }

    /// True when none of the four schedulable dimensions is specified.
    pub fn is_unspecified(&self) -> bool {
        self.cores.is_none() && self.memory.is_none() && self.disk.is_none() && self.gpus.is_none()
    }
}

/// Rounds a capacity up by the overcommit multiplier.
///
/// Applied to cores, memory and gpus when deciding whether to admit more
/// tasks; never to disk.
pub fn overcommitted(total: i64, multiplier: f64) -> i64 {
    if total == 0 {
        0
    } else {
        (total as f64 * multiplier).ceil() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_preserves_inuse() {
        let mut r = Resource::default();
        r.inuse = 3;
        r.update(16, 8, 8);
        assert_eq!(r.total, 16);
        assert_eq!(r.inuse, 3);
        assert_eq!(r.largest, 8);
    }

    #[test]
    fn aggregate_sums_and_bounds() {
        let mut total = Resource::default();
        total.add(&Resource {
            total: 4,
            inuse: 1,
            smallest: 4,
            largest: 4,
        });
        total.add(&Resource {
            total: 16,
            inuse: 2,
            smallest: 2,
            largest: 8,
        });
        assert_eq!(total.total, 20);
        assert_eq!(total.inuse, 3);
        assert_eq!(total.smallest, 2);
        assert_eq!(total.largest, 8);
    }

    #[test]
    fn overcommit_never_touches_zero() {
        assert_eq!(overcommitted(0, 2.0), 0);
        assert_eq!(overcommitted(4, 1.5), 6);
        assert_eq!(overcommitted(5, 1.1), 6);
    }

    #[test]
    fn request_grow_to_takes_componentwise_max() {
        let mut a = ResourceRequest {
            cores: Some(2),
            memory: None,
            ..Default::default()
        };
        a.grow_to(&ResourceRequest {
            cores: Some(1),
            memory: Some(512),
            ..Default::default()
        });
        assert_eq!(a.cores, Some(2));
        assert_eq!(a.memory, Some(512));
    }
}
