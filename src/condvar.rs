// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Condition variables and producer/consumer rendezvous channels.

use crate::fifo::FifoQueue;
use crate::lock::{MutexLock, Release};
use crate::pcb::{Pcb, ProcState, ProcType};
use crate::ready_queue::ReadyQueue;
use crate::types::{LockId, Pid};

/// Outcome of [`CondVar::signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    NoWaiters,
    Woken {
        pid: Pid,
        /// Whether the signaler holds the associated lock afterwards.
        signaler_holds_lock: bool,
    },
}

/// A FIFO of processes parked until signalled. The associated lock is
/// supplied on every call.
#[derive(Debug, Default)]
pub struct CondVar {
    waiters: FifoQueue,
}

impl CondVar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release `lock` and park `pcb` on this variable.
    ///
    /// Both happen inside the caller's critical section so no signal can
    /// fall between them.
    pub fn wait(&mut self, lock: &mut MutexLock, mut pcb: Pcb, ready: &mut ReadyQueue) -> Release {
        let released = lock.release(ready);
        pcb.state = ProcState::Blocked;
        self.waiters.enqueue(pcb);
        released
    }

    /// Wake at most one waiter and make it Ready, then try to take `lock`
    /// for the signaler.
    pub fn signal(&mut self, signaler: Pid, lock: &mut MutexLock, ready: &mut ReadyQueue) -> Signal {
        let Some(waiter) = self.waiters.dequeue() else {
            return Signal::NoWaiters;
        };
        let pid = waiter.pid();
        ready.enqueue(waiter);
        Signal::Woken {
            pid,
            signaler_holds_lock: lock.try_acquire(signaler),
        }
    }

    pub fn is_waiting(&self, pid: Pid) -> bool {
        self.waiters.contains(pid)
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/// Side of a rendezvous a process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Producer,
    Consumer,
}

impl Role {
    pub fn of(proc_type: ProcType) -> Option<Role> {
        match proc_type {
            ProcType::Producer => Some(Role::Producer),
            ProcType::Consumer => Some(Role::Consumer),
            _ => None,
        }
    }
}

/// One-slot buffer shared by a producer and a consumer.
#[derive(Debug)]
pub struct Channel {
    pub producer: Pid,
    pub consumer: Pid,
    pub lock: MutexLock,
    /// Consumers wait here for a value.
    pub fill: CondVar,
    /// Producers wait here for a free slot.
    pub empty: CondVar,
    pub counter: u64,
    pub full: bool,
    retired: (bool, bool),
}

impl Channel {
    /// `lock` must not collide with any id in the lock table.
    pub fn new(lock: LockId, producer: Pid, consumer: Pid) -> Self {
        Self {
            producer,
            consumer,
            lock: MutexLock::new(lock),
            fill: CondVar::new(),
            empty: CondVar::new(),
            counter: 0,
            full: false,
            retired: (false, false),
        }
    }

    /// Whether `role` has to wait before its next step.
    pub fn must_wait(&self, role: Role) -> bool {
        match role {
            Role::Producer => self.full,
            Role::Consumer => !self.full,
        }
    }

    /// Park `pcb` on the variable its role waits on, releasing the
    /// channel lock.
    pub fn wait(&mut self, role: Role, pcb: Pcb, ready: &mut ReadyQueue) -> Release {
        match role {
            Role::Producer => self.empty.wait(&mut self.lock, pcb, ready),
            Role::Consumer => self.fill.wait(&mut self.lock, pcb, ready),
        }
    }

    /// Put the next value in the slot and signal `fill`.
    pub fn produce(&mut self, producer: Pid, ready: &mut ReadyQueue) -> (u64, Signal) {
        self.counter += 1;
        self.full = true;
        let signal = self.fill.signal(producer, &mut self.lock, ready);
        (self.counter, signal)
    }

    /// Take the value out of the slot and signal `empty`.
    pub fn consume(&mut self, consumer: Pid, ready: &mut ReadyQueue) -> (u64, Signal) {
        self.full = false;
        let signal = self.empty.signal(consumer, &mut self.lock, ready);
        (self.counter, signal)
    }

    /// Mark one side as gone. Returns true once both sides are.
    pub fn retire(&mut self, pid: Pid) -> bool {
        if pid == self.producer {
            self.retired.0 = true;
        } else if pid == self.consumer {
            self.retired.1 = true;
        }
        self.retired == (true, true)
    }

    /// Whether `pid` is parked anywhere on this channel.
    pub fn is_waiting(&self, pid: Pid) -> bool {
        self.fill.is_waiting(pid) || self.empty.is_waiting(pid) || self.lock.is_waiting(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proc(pid: u32, proc_type: ProcType) -> Pcb {
        Pcb::new(Pid(pid), proc_type, 400, 0)
    }

    #[test]
    fn test_wait_releases_lock_and_parks() {
        let mut lock = MutexLock::new(LockId(0));
        let mut cv = CondVar::new();
        let mut ready = ReadyQueue::new();
        assert!(lock.try_acquire(Pid(1)));

        let released = cv.wait(&mut lock, proc(1, ProcType::Consumer), &mut ready);
        assert_eq!(released.previous, Some(Pid(1)));
        assert_eq!(lock.holder(), None);
        assert!(cv.is_waiting(Pid(1)));
        assert!(ready.is_empty());
    }

    #[test]
    fn test_signal_wakes_exactly_once() {
        let mut lock = MutexLock::new(LockId(0));
        let mut cv = CondVar::new();
        let mut ready = ReadyQueue::new();
        assert!(lock.try_acquire(Pid(1)));
        cv.wait(&mut lock, proc(1, ProcType::Consumer), &mut ready);

        assert!(lock.try_acquire(Pid(2)));
        let s = cv.signal(Pid(2), &mut lock, &mut ready);
        assert_eq!(
            s,
            Signal::Woken {
                pid: Pid(1),
                signaler_holds_lock: true
            }
        );
        assert_eq!(ready.len(), 1);
        assert_eq!(ready.peek().map(|p| p.state), Some(ProcState::Ready));

        assert_eq!(cv.signal(Pid(2), &mut lock, &mut ready), Signal::NoWaiters);
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn test_signal_is_not_lost_when_lock_is_busy() {
        let mut lock = MutexLock::new(LockId(0));
        let mut cv = CondVar::new();
        let mut ready = ReadyQueue::new();
        cv.wait(&mut lock, proc(1, ProcType::Consumer), &mut ready);

        assert!(lock.try_acquire(Pid(9)));
        let s = cv.signal(Pid(2), &mut lock, &mut ready);
        assert_eq!(
            s,
            Signal::Woken {
                pid: Pid(1),
                signaler_holds_lock: false
            }
        );
        assert_eq!(ready.len(), 1);
        assert!(cv.is_empty());
    }

    #[test]
    fn test_channel_alternates() {
        let mut ch = Channel::new(LockId(0), Pid(1), Pid(2));
        let mut ready = ReadyQueue::new();
        assert!(ch.must_wait(Role::Consumer));
        assert!(!ch.must_wait(Role::Producer));

        let (v, s) = ch.produce(Pid(1), &mut ready);
        assert_eq!(v, 1);
        assert_eq!(s, Signal::NoWaiters);
        assert!(ch.must_wait(Role::Producer));

        let (v, _) = ch.consume(Pid(2), &mut ready);
        assert_eq!(v, 1);
        assert!(!ch.full);
    }

    #[test]
    fn test_retire_needs_both_sides() {
        let mut ch = Channel::new(LockId(0), Pid(1), Pid(2));
        assert!(!ch.retire(Pid(2)));
        assert!(!ch.retire(Pid(7)));
        assert!(ch.retire(Pid(1)));
    }

    #[test]
    fn test_producer_wakes_waiting_consumer() {
        let mut ch = Channel::new(LockId(0), Pid(1), Pid(2));
        let mut ready = ReadyQueue::new();
        assert!(ch.lock.try_acquire(Pid(2)));
        ch.wait(Role::Consumer, proc(2, ProcType::Consumer), &mut ready);
        assert!(ch.is_waiting(Pid(2)));

        assert!(ch.lock.try_acquire(Pid(1)));
        let (_, s) = ch.produce(Pid(1), &mut ready);
        assert_eq!(
            s,
            Signal::Woken {
                pid: Pid(2),
                signaler_holds_lock: true
            }
        );
        assert!(!ch.is_waiting(Pid(2)));
        assert_eq!(ready.len(), 1);
    }
}
