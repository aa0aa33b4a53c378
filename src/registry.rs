//! # Worker table.
//!
//! Maps connection handles to [`Worker`] records in a deterministic order,
//! tracks which workers have results waiting, and maintains the
//! componentwise-largest worker seen, which the category allocator uses to
//! size first allocations.

use std::collections::{BTreeMap, HashSet};

use crate::link::Link;
use crate::resources::ResourceBox;
use crate::worker::{Worker, WorkerKey, WorkerType};

/// All connected workers, keyed by connection handle.
#[derive(Debug, Default)]
pub struct WorkerTable {
    workers: BTreeMap<WorkerKey, Worker>,
    next_key: u64,
    /// Componentwise maximum of `largest` across workers with at least one
    /// worker slot.
    pub current_max_worker: ResourceBox,
    /// Workers that announced completed results since the last drain.
    pub with_available_results: HashSet<WorkerKey>,
}

impl WorkerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection and returns its handle.
    pub fn insert(&mut self, link: Link, addrport: String, now: u64) -> WorkerKey {
        self.next_key += 1;
        let key = WorkerKey(self.next_key);
        self.workers.insert(key, Worker::new(key, link, addrport, now));
        key
    }

    pub fn get(&self, key: WorkerKey) -> Option<&Worker> {
        self.workers.get(&key)
    }

    pub fn get_mut(&mut self, key: WorkerKey) -> Option<&mut Worker> {
        self.workers.get_mut(&key)
    }

    /// Removes the record; the caller settles tasks and stats first.
    pub fn remove(&mut self, key: WorkerKey) -> Option<Worker> {
        self.with_available_results.remove(&key);
        let w = self.workers.remove(&key);
        if w.is_some() {
            self.find_max_worker();
        }
        w
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn keys(&self) -> Vec<WorkerKey> {
        self.workers.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&WorkerKey, &Worker)> {
        self.workers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&WorkerKey, &mut Worker)> {
        self.workers.iter_mut()
    }

    /// Number of connections of the given type.
    pub fn count(&self, kind: WorkerType) -> usize {
        self.workers.values().filter(|w| w.kind == kind).count()
    }

    /// Number of identified workers currently running at least one task.
    pub fn count_with_tasks(&self) -> usize {
        self.workers
            .values()
            .filter(|w| w.hostname.is_some() && !w.current_tasks.is_empty())
            .count()
    }

    /// Folds one worker's `largest` values into the running maximum.
    pub fn update_max_worker(&mut self, key: WorkerKey) {
        if let Some(w) = self.workers.get(&key) {
            if w.resources.workers.total < 1 {
                return;
            }
            let r = &w.resources;
            let m = &mut self.current_max_worker;
            m.cores = m.cores.max(r.cores.largest);
            m.memory = m.memory.max(r.memory.largest);
            m.disk = m.disk.max(r.disk.largest);
            m.gpus = m.gpus.max(r.gpus.largest);
        }
    }

    /// Recomputes the maximum from scratch; used after a removal, where the
    /// incremental update cannot shrink the record.
    pub fn find_max_worker(&mut self) {
        self.current_max_worker = ResourceBox::default();
        let keys = self.keys();
        for key in keys {
            self.update_max_worker(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn test_link() -> Link {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        Link::new(server, peer)
    }

    #[tokio::test]
    async fn keys_are_unique_and_ordered() {
        let mut table = WorkerTable::new();
        let a = table.insert(test_link().await, "a:1".into(), 0);
        let b = table.insert(test_link().await, "b:2".into(), 0);
        assert_ne!(a, b);
        assert_eq!(table.keys(), vec![a, b]);
    }

    #[tokio::test]
    async fn max_worker_tracks_largest_and_shrinks_on_removal() {
        let mut table = WorkerTable::new();
        let a = table.insert(test_link().await, "a:1".into(), 0);
        let b = table.insert(test_link().await, "b:2".into(), 0);

        {
            let w = table.get_mut(a).unwrap();
            w.resources.update_kind("workers", 1, 1, 1);
            w.resources.update_kind("cores", 4, 4, 4);
            w.resources.update_kind("memory", 1024, 1024, 1024);
        }
        table.update_max_worker(a);
        {
            let w = table.get_mut(b).unwrap();
            w.resources.update_kind("workers", 1, 1, 1);
            w.resources.update_kind("cores", 16, 16, 16);
        }
        table.update_max_worker(b);

        assert_eq!(table.current_max_worker.cores, 16);
        assert_eq!(table.current_max_worker.memory, 1024);

        table.remove(b);
        assert_eq!(table.current_max_worker.cores, 4);
    }

    #[tokio::test]
    async fn workers_without_slots_do_not_count() {
        let mut table = WorkerTable::new();
        let a = table.insert(test_link().await, "a:1".into(), 0);
        {
            let w = table.get_mut(a).unwrap();
            w.resources.update_kind("cores", 64, 64, 64);
        }
        table.update_max_worker(a);
        assert_eq!(table.current_max_worker.cores, 0);
    }
}
