// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Blocking mutual-exclusion locks.
//!
//! A [`MutexLock`] has at most one holder and a FIFO of parked waiters. On
//! release every waiter goes back to the ready queue and re-attempts the
//! acquisition when next dispatched; the first one to run wins.

use std::collections::BTreeMap;

use crate::fifo::FifoQueue;
use crate::pcb::{Pcb, ProcState};
use crate::ready_queue::ReadyQueue;
use crate::types::{LockId, Pid};

/// Outcome of [`MutexLock::acquire`].
#[derive(Debug)]
pub enum Acquire {
    /// The requester holds the lock. Its record is handed back.
    Acquired(Pcb),
    /// The lock is held by someone else and the requester is parked.
    Blocked,
}

/// Outcome of [`MutexLock::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Release {
    /// Holder before the release. `None` if the lock was already free.
    pub previous: Option<Pid>,
    /// Waiters moved to the ready queue.
    pub woken: usize,
}

#[derive(Debug)]
pub struct MutexLock {
    id: LockId,
    holder: Option<Pid>,
    waiters: FifoQueue,
}

impl MutexLock {
    pub fn new(id: LockId) -> Self {
        Self {
            id,
            holder: None,
            waiters: FifoQueue::new(),
        }
    }

    pub fn id(&self) -> LockId {
        self.id
    }

    pub fn holder(&self) -> Option<Pid> {
        self.holder
    }

    pub fn is_held_by(&self, pid: Pid) -> bool {
        self.holder == Some(pid)
    }

    pub fn is_waiting(&self, pid: Pid) -> bool {
        self.waiters.contains(pid)
    }

    pub fn waiters(&self) -> &FifoQueue {
        &self.waiters
    }

    /// Consume a retired lock, yielding whatever is still parked on it.
    pub fn into_waiters(self) -> FifoQueue {
        self.waiters
    }

    pub fn acquire(&mut self, mut requester: Pcb) -> Acquire {
        match self.holder {
            None => {
                self.holder = Some(requester.pid());
                Acquire::Acquired(requester)
            }
            Some(holder) if holder == requester.pid() => Acquire::Acquired(requester),
            Some(_) => {
                requester.state = ProcState::Blocked;
                self.waiters.enqueue(requester);
                Acquire::Blocked
            }
        }
    }

    /// Take the lock if it is free. Never parks the caller.
    pub fn try_acquire(&mut self, pid: Pid) -> bool {
        match self.holder {
            None => {
                self.holder = Some(pid);
                true
            }
            Some(holder) => holder == pid,
        }
    }

    /// Clear the holder and move every waiter to `ready`.
    ///
    /// The caller is trusted to be the holder. Releasing a free lock is a
    /// no-op.
    pub fn release(&mut self, ready: &mut ReadyQueue) -> Release {
        let previous = self.holder.take();
        if previous.is_none() {
            return Release { previous, woken: 0 };
        }
        let mut woken = 0;
        for pcb in self.waiters.drain() {
            ready.enqueue(pcb);
            woken += 1;
        }
        Release { previous, woken }
    }
}

/// All mutexes in the system, keyed by id.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: BTreeMap<LockId, MutexLock>,
    next_id: u32,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self) -> LockId {
        let id = LockId(self.next_id);
        self.next_id += 1;
        self.locks.insert(id, MutexLock::new(id));
        id
    }

    /// Allocate an id for a lock kept outside the table, such as a
    /// channel's.
    pub fn reserve(&mut self) -> LockId {
        let id = LockId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn get(&self, id: LockId) -> Option<&MutexLock> {
        self.locks.get(&id)
    }

    pub fn get_mut(&mut self, id: LockId) -> Option<&mut MutexLock> {
        self.locks.get_mut(&id)
    }

    pub fn remove(&mut self, id: LockId) -> Option<MutexLock> {
        self.locks.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MutexLock> {
        self.locks.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcb::ProcType;

    fn proc(pid: u32) -> Pcb {
        Pcb::new(Pid(pid), ProcType::MutexUser, 600, 0)
    }

    #[test]
    fn test_acquire_free_lock() {
        let mut lock = MutexLock::new(LockId(0));
        match lock.acquire(proc(1)) {
            Acquire::Acquired(pcb) => assert_eq!(pcb.pid(), Pid(1)),
            Acquire::Blocked => panic!("free lock must be acquired"),
        }
        assert_eq!(lock.holder(), Some(Pid(1)));
    }

    #[test]
    fn test_contended_acquire_parks() {
        let mut lock = MutexLock::new(LockId(0));
        assert!(lock.try_acquire(Pid(1)));
        assert!(matches!(lock.acquire(proc(2)), Acquire::Blocked));
        assert!(lock.is_waiting(Pid(2)));
        assert_eq!(lock.waiters().peek().map(|p| p.state), Some(ProcState::Blocked));
        assert!(!lock.is_waiting(Pid(1)));
    }

    #[test]
    fn test_reacquire_by_holder_is_idempotent() {
        let mut lock = MutexLock::new(LockId(0));
        assert!(lock.try_acquire(Pid(1)));
        assert!(matches!(lock.acquire(proc(1)), Acquire::Acquired(_)));
        assert!(lock.try_acquire(Pid(1)));
        assert!(lock.waiters().is_empty());
        assert_eq!(lock.holder(), Some(Pid(1)));
    }

    #[test]
    fn test_try_acquire_never_parks() {
        let mut lock = MutexLock::new(LockId(0));
        assert!(lock.try_acquire(Pid(1)));
        assert!(!lock.try_acquire(Pid(2)));
        assert!(lock.waiters().is_empty());
    }

    #[test]
    fn test_release_wakes_all_waiters() {
        let mut lock = MutexLock::new(LockId(0));
        let mut ready = ReadyQueue::new();
        assert!(lock.try_acquire(Pid(1)));
        assert!(matches!(lock.acquire(proc(2)), Acquire::Blocked));
        assert!(matches!(lock.acquire(proc(3)), Acquire::Blocked));

        let r = lock.release(&mut ready);
        assert_eq!(r, Release { previous: Some(Pid(1)), woken: 2 });
        assert_eq!(lock.holder(), None);
        assert_eq!(ready.len(), 2);
        assert!(ready.iter().all(|p| p.state == ProcState::Ready));
    }

    #[test]
    fn test_release_free_lock_is_noop() {
        let mut lock = MutexLock::new(LockId(0));
        let mut ready = ReadyQueue::new();
        let r = lock.release(&mut ready);
        assert_eq!(r, Release { previous: None, woken: 0 });
        assert!(ready.is_empty());
    }

    #[test]
    fn test_lock_table_ids() {
        let mut table = LockTable::new();
        let a = table.create();
        let b = table.create();
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert!(table.remove(a).is_some());
        assert!(table.get(a).is_none());
        assert!(table.get(b).is_some());

        let reserved = table.reserve();
        assert!(reserved != a && reserved != b);
        assert!(table.get(reserved).is_none());
        assert_ne!(table.create(), reserved);
    }
}
