//! # Hostname blocklist.
//!
//! Blocked hosts cannot register workers and are skipped by the scheduler.
//! A block carries an optional expiry; expired blocks are lifted once per
//! wait turn.

use std::collections::HashMap;

/// Blocks forever when passed as the timeout.
pub const BLOCK_FOREVER: i64 = -1;

#[derive(Debug, Clone)]
struct BlockEntry {
    blocked: bool,
    /// Absolute lift time in seconds since the epoch; `None` means forever.
    release_at: Option<u64>,
    times_blocked: u64,
}

/// Hostname bans with expiry.
#[derive(Debug, Default)]
pub struct Blocklist {
    hosts: HashMap<String, BlockEntry>,
}

impl Blocklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks `host` for `timeout_s` seconds from `now`; a negative timeout
    /// blocks forever.
    pub fn block(&mut self, host: &str, timeout_s: i64, now_s: u64) {
        let release_at = if timeout_s < 0 {
            None
        } else {
            Some(now_s + timeout_s as u64)
        };
        let entry = self.hosts.entry(host.to_string()).or_insert(BlockEntry {
            blocked: false,
            release_at: None,
            times_blocked: 0,
        });
        entry.blocked = true;
        entry.release_at = release_at;
        entry.times_blocked += 1;
    }

    pub fn unblock(&mut self, host: &str) {
        if let Some(entry) = self.hosts.get_mut(host) {
            entry.blocked = false;
            entry.release_at = None;
        }
    }

    pub fn unblock_all(&mut self) {
        for entry in self.hosts.values_mut() {
            entry.blocked = false;
            entry.release_at = None;
        }
    }

    pub fn is_blocked(&self, host: &str) -> bool {
        self.hosts.get(host).map(|e| e.blocked).unwrap_or(false)
    }

    /// Lifts every block whose expiry has passed; returns the hosts lifted.
    pub fn unblock_expired(&mut self, now_s: u64) -> Vec<String> {
        let mut lifted = Vec::new();
        for (host, entry) in self.hosts.iter_mut() {
            if entry.blocked && entry.release_at.map(|t| t <= now_s).unwrap_or(false) {
                entry.blocked = false;
                entry.release_at = None;
                lifted.push(host.clone());
            }
        }
        lifted
    }

    /// Currently blocked hostnames, for status reports.
    pub fn blocked_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .hosts
            .iter()
            .filter(|(_, e)| e.blocked)
            .map(|(h, _)| h.clone())
            .collect();
        hosts.sort();
        hosts
    }
}
