// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Lock-ownership map and deadlock monitor.
//!
//! Mutex users are created in pairs that share two locks. The map records,
//! per process, which lock it takes first and which second. The monitor
//! walks the pairs looking for the classic cycle where each member holds
//! one lock and waits for the other.

use std::collections::HashSet;

use crate::lock::LockTable;
use crate::types::{LockId, Pid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockEntry {
    pub pid: Pid,
    pub first: LockId,
    pub second: LockId,
    retired: bool,
}

impl LockEntry {
    fn new(pid: Pid, first: LockId, second: LockId) -> Self {
        Self {
            pid,
            first,
            second,
            retired: false,
        }
    }
}

/// Insertion-ordered list of lock entries. Entries `2k` and `2k + 1` form a
/// pair over the same two locks.
#[derive(Debug, Default)]
pub struct LockMap {
    entries: Vec<LockEntry>,
}

impl LockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pair. With `reversed` the second process takes the locks in
    /// the opposite order.
    pub fn add_pair(&mut self, p1: Pid, p2: Pid, a: LockId, b: LockId, reversed: bool) {
        self.entries.push(LockEntry::new(p1, a, b));
        if reversed {
            self.entries.push(LockEntry::new(p2, b, a));
        } else {
            self.entries.push(LockEntry::new(p2, a, b));
        }
    }

    fn position(&self, pid: Pid) -> Option<usize> {
        self.entries.iter().position(|e| e.pid == pid)
    }

    pub fn search(&self, pid: Pid) -> Option<&LockEntry> {
        self.position(pid).map(|i| &self.entries[i])
    }

    pub fn partner(&self, pid: Pid) -> Option<Pid> {
        self.position(pid).map(|i| self.entries[i ^ 1].pid)
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&LockEntry, &LockEntry)> {
        self.entries.chunks_exact(2).map(|c| (&c[0], &c[1]))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mark `pid` as gone. Once both members of its pair are gone the pair
    /// is removed and its two locks are returned so the caller can free
    /// them.
    pub fn retire(&mut self, pid: Pid) -> Option<(LockId, LockId)> {
        let i = self.position(pid)?;
        self.entries[i].retired = true;
        let base = i & !1;
        if !self.entries[base ^ 1].retired || !self.entries[base].retired {
            return None;
        }
        let locks = (self.entries[base].first, self.entries[base].second);
        self.entries.drain(base..base + 2);
        Some(locks)
    }
}

/// A detected hold-and-wait cycle between the two members of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadlock {
    pub p1: Pid,
    pub p2: Pid,
    /// Lock held by `p1`, wanted by `p2`.
    pub held_by_p1: LockId,
    /// Lock held by `p2`, wanted by `p1`.
    pub held_by_p2: LockId,
    /// First time this pair was seen deadlocked.
    pub first_seen: bool,
}

#[derive(Debug, Default)]
pub struct DeadlockMonitor {
    reported: HashSet<(Pid, Pid)>,
    deadlocked: bool,
    scans: u64,
}

fn holds_and_waits(locks: &LockTable, pid: Pid, held: LockId, wanted: LockId) -> bool {
    let holds = locks.get(held).map_or(false, |l| l.is_held_by(pid));
    let waits = locks.get(wanted).map_or(false, |l| l.is_waiting(pid));
    holds && waits
}

impl DeadlockMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any deadlock has ever been detected.
    pub fn deadlocked(&self) -> bool {
        self.deadlocked
    }

    pub fn scans(&self) -> u64 {
        self.scans
    }

    /// Number of distinct pairs ever found deadlocked.
    pub fn distinct(&self) -> usize {
        self.reported.len()
    }

    /// Check every pair once. Nothing is recovered.
    pub fn scan(&mut self, map: &LockMap, locks: &LockTable) -> Vec<Deadlock> {
        self.scans += 1;
        let mut found = vec![];
        for (e1, e2) in map.pairs() {
            let (a, b) = (e1.first, e1.second);
            let cycle = if holds_and_waits(locks, e1.pid, a, b) && holds_and_waits(locks, e2.pid, b, a) {
                Some((a, b))
            } else if holds_and_waits(locks, e1.pid, b, a) && holds_and_waits(locks, e2.pid, a, b) {
                Some((b, a))
            } else {
                None
            };

            if let Some((held_by_p1, held_by_p2)) = cycle {
                self.deadlocked = true;
                let first_seen = self.reported.insert((e1.pid, e2.pid));
                found.push(Deadlock {
                    p1: e1.pid,
                    p2: e2.pid,
                    held_by_p1,
                    held_by_p2,
                    first_seen,
                });
            }
        }
        found
    }
}
