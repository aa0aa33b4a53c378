//! # Factory bookkeeping.
//!
//! A factory is an external process that spawns workers for this manager
//! under a named label with a maximum count. The manager learns about
//! factories from workers (`info from-factory`) and from catalog updates,
//! and trims idle workers when a factory shrinks below its connected count.

use serde::Serialize;

/// What the manager knows about one factory.
#[derive(Debug, Clone, Serialize)]
pub struct FactoryInfo {
    pub name: String,
    /// Desired ceiling; workers above it are trimmed when idle.
    pub max_workers: i64,
    pub connected_workers: i64,
    /// Set while the factory is still advertised at the catalog.
    pub seen_at_catalog: bool,
}

impl FactoryInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_workers: i64::MAX,
            connected_workers: 0,
            seen_at_catalog: false,
        }
    }

    /// True when more workers are connected than the factory wants.
    pub fn over_capacity(&self) -> bool {
        self.connected_workers > self.max_workers
    }
}

/// A factory description received from the catalog.
#[derive(Debug, Clone)]
pub struct FactoryUpdate {
    pub factory_name: String,
    pub max_workers: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_check() {
        let mut f = FactoryInfo::new("batch");
        assert!(!f.over_capacity());
        f.max_workers = 2;
        f.connected_workers = 3;
        assert!(f.over_capacity());
        f.connected_workers = 2;
        assert!(!f.over_capacity());
    }
}
