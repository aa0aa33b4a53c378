//! # Task categories.
//!
//! A category is a named equivalence class of tasks sharing an allocation
//! policy and statistics. The category decides how large a resource box a
//! task gets (its allocation label), whether an exhausted task may retry
//! with a larger box, and the average completion time that drives
//! fast-abort.

use std::collections::HashMap;

use serde::Serialize;

use crate::resources::{ResourceBox, ResourceRequest};
use crate::stats::ManagerStats;
use crate::task::AllocationLabel;

/// How a category sizes task allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AllocationMode {
    /// Tasks get exactly what they asked for; exhaustion is final.
    Fixed,
    /// Every attempt runs under the category maximum.
    Max,
    /// Grow from a first guess, preferring allocations that waste least.
    MinWaste,
    /// Grow from a first guess, preferring allocations that maximize
    /// throughput.
    MaxThroughput,
}

/// Fast-abort multiplier sentinel: use the default category's setting.
pub const FAST_ABORT_USE_DEFAULT: f64 = -1.0;

/// One category.
#[derive(Debug, Clone, Serialize)]
pub struct Category {
    pub name: String,
    pub mode: AllocationMode,
    /// `> 0` enables fast abort with that multiplier, `0` disables it,
    /// `< 0` defers to the default category.
    pub fast_abort: f64,
    pub max_allocation: ResourceRequest,
    pub min_allocation: ResourceRequest,
    /// Guess used for the first attempt under growing modes.
    pub first_allocation: ResourceRequest,
    /// Componentwise maximum of resources seen consumed by this category.
    pub max_resources_seen: ResourceBox,
    /// Mean of execute + send + receive time over completed tasks,
    /// microseconds; 0 until ten tasks have completed.
    pub average_task_time: u64,
    /// Tasks completed and handed back in this category.
    pub total_tasks: u64,
    pub stats: ManagerStats,
}

impl Category {
    pub fn new(name: impl Into<String>, mode: AllocationMode) -> Self {
        Self {
            name: name.into(),
            mode,
            fast_abort: FAST_ABORT_USE_DEFAULT,
            max_allocation: ResourceRequest::default(),
            min_allocation: ResourceRequest::default(),
            first_allocation: ResourceRequest::default(),
            max_resources_seen: ResourceBox::default(),
            average_task_time: 0,
            total_tasks: 0,
            stats: ManagerStats::default(),
        }
    }

    /// The largest request this task may be granted under its current
    /// allocation label.
    ///
    /// First attempts run the task's own request, with unspecified
    /// dimensions drawn from the first-allocation guess (or the category
    /// maximum). Once a task is promoted to the maximum label its box comes
    /// from the category maximum: the original request was too small, that
    /// is why it is here.
    pub fn dynamic_max(&self, requested: &ResourceRequest, label: AllocationLabel) -> ResourceRequest {
        match (label, self.mode) {
            (_, AllocationMode::Fixed) => requested.or_else(&self.max_allocation),
            (AllocationLabel::First, _) => {
                if self.first_allocation.is_unspecified() {
                    requested.or_else(&self.max_allocation)
                } else {
                    requested.or_else(&self.first_allocation)
                }
            }
            (AllocationLabel::Max, _) => self.max_allocation.or_else(requested),
        }
    }

    /// The smallest box this task may run in: its own request raised to the
    /// category minimum.
    pub fn dynamic_min(&self, requested: &ResourceRequest) -> ResourceRequest {
        let mut min = *requested;
        min.grow_to(&self.min_allocation);
        min
    }

    /// Decides the next allocation label after a resource exhaustion.
    ///
    /// `None` means the category cannot grow the task any further and the
    /// exhaustion is final.
    pub fn next_label(&self, current: AllocationLabel) -> Option<AllocationLabel> {
        match (self.mode, current) {
            (AllocationMode::Fixed, _) => None,
            (_, AllocationLabel::First) => Some(AllocationLabel::Max),
            (_, AllocationLabel::Max) => None,
        }
    }

    /// Folds one observed task footprint into `max_resources_seen`;
    /// returns true when the record grew.
    pub fn accumulate_seen(&mut self, seen: &ResourceBox) -> bool {
        let before = self.max_resources_seen;
        self.max_resources_seen.grow_to(seen);
        self.max_resources_seen != before
    }

    /// Recomputes the average completion time; meaningless (and left 0)
    /// below ten completed tasks.
    pub fn update_average_task_time(&mut self) {
        if self.stats.tasks_done < 10 {
            self.average_task_time = 0;
            return;
        }
        self.average_task_time = (self.stats.time_workers_execute_good
            + self.stats.time_send_good
            + self.stats.time_receive_good)
            / self.stats.tasks_done;
    }
}

/// All categories, created on first reference.
#[derive(Debug)]
pub struct CategoryTable {
    categories: HashMap<String, Category>,
    /// Mode given to newly created categories.
    pub default_mode: AllocationMode,
}

impl CategoryTable {
    pub fn new() -> Self {
        Self {
            categories: HashMap::new(),
            default_mode: AllocationMode::Fixed,
        }
    }

    pub fn lookup_or_create(&mut self, name: &str) -> &mut Category {
        let mode = self.default_mode;
        self.categories
            .entry(name.to_string())
            .or_insert_with(|| Category::new(name, mode))
    }

    pub fn get(&self, name: &str) -> Option<&Category> {
        self.categories.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Category)> {
        self.categories.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Category)> {
        self.categories.iter_mut()
    }

    /// The fast-abort multiplier in effect for `name`, resolving the
    /// use-default sentinel against the default category. `None` disables
    /// fast abort for the category.
    pub fn effective_fast_abort(&self, name: &str) -> Option<f64> {
        let own = self.get(name).map(|c| c.fast_abort).unwrap_or(FAST_ABORT_USE_DEFAULT);
        if own > 0.0 {
            return Some(own);
        }
        if own == 0.0 {
            return None;
        }
        let def = self.get("default").map(|c| c.fast_abort).unwrap_or(0.0);
        if def > 0.0 {
            Some(def)
        } else {
            None
        }
    }
}

impl Default for CategoryTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(cores: i64, memory: i64) -> ResourceRequest {
        ResourceRequest {
            cores: Some(cores),
            memory: Some(memory),
            ..Default::default()
        }
    }

    #[test]
    fn fixed_mode_never_grows() {
        let c = Category::new("fixed", AllocationMode::Fixed);
        assert_eq!(c.next_label(AllocationLabel::First), None);
        assert_eq!(c.next_label(AllocationLabel::Max), None);
    }

    #[test]
    fn growing_modes_step_first_to_max_then_fail() {
        for mode in [
            AllocationMode::Max,
            AllocationMode::MinWaste,
            AllocationMode::MaxThroughput,
        ] {
            let c = Category::new("grow", mode);
            assert_eq!(c.next_label(AllocationLabel::First), Some(AllocationLabel::Max));
            assert_eq!(c.next_label(AllocationLabel::Max), None);
        }
    }

    #[test]
    fn dynamic_max_grows_from_first_guess_to_category_max() {
        let mut c = Category::new("a", AllocationMode::MaxThroughput);
        c.max_allocation = req(4, 8192);
        c.first_allocation = req(1, 1024);

        let task_req = ResourceRequest {
            cores: Some(2),
            ..Default::default()
        };
        let first = c.dynamic_max(&task_req, AllocationLabel::First);
        assert_eq!(first.cores, Some(2));
        assert_eq!(first.memory, Some(1024));

        // Promoted to the maximum label, the category bound wins even over
        // the task's own (too small) request.
        let max = c.dynamic_max(&task_req, AllocationLabel::Max);
        assert_eq!(max.cores, Some(4));
        assert_eq!(max.memory, Some(8192));
    }

    #[test]
    fn dynamic_min_clamps_up() {
        let mut c = Category::new("a", AllocationMode::Fixed);
        c.min_allocation = req(2, 512);
        let min = c.dynamic_min(&ResourceRequest {
            cores: Some(1),
            memory: Some(2048),
            ..Default::default()
        });
        assert_eq!(min.cores, Some(2));
        assert_eq!(min.memory, Some(2048));
    }

    #[test]
    fn average_needs_ten_tasks() {
        let mut c = Category::new("a", AllocationMode::Fixed);
        c.stats.tasks_done = 9;
        c.stats.time_workers_execute_good = 9_000_000;
        c.update_average_task_time();
        assert_eq!(c.average_task_time, 0);

        c.stats.tasks_done = 10;
        c.stats.time_workers_execute_good = 10_000_000;
        c.update_average_task_time();
        assert_eq!(c.average_task_time, 1_000_000);
    }

    #[test]
    fn fast_abort_resolution_uses_default_category() {
        let mut table = CategoryTable::new();
        table.lookup_or_create("default").fast_abort = 2.0;
        table.lookup_or_create("inherits");
        table.lookup_or_create("disabled").fast_abort = 0.0;
        table.lookup_or_create("custom").fast_abort = 5.0;

        assert_eq!(table.effective_fast_abort("inherits"), Some(2.0));
        assert_eq!(table.effective_fast_abort("disabled"), None);
        assert_eq!(table.effective_fast_abort("custom"), Some(5.0));

        table.lookup_or_create("default").fast_abort = 0.0;
        assert_eq!(table.effective_fast_abort("inherits"), None);
    }
}
