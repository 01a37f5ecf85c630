// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Process control block.
//!
//! A [`Pcb`] carries the scheduling metadata and the simulated register file
//! of one process. It is deliberately not `Clone`: every record lives in
//! exactly one queue (or the running slot) and moves between them by value.

use std::fmt;
use std::time::SystemTime;

use sorted_vec::SortedSet;

use crate::types::{ChannelId, Pid, Priority, NUM_TRIGGERS};

/// Lifecycle state of a simulated process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    New,
    Ready,
    Running,
    /// Preempted by the timer, about to be requeued.
    Interrupted,
    /// Parked on an I/O device, a lock or a condition variable.
    Blocked,
    Halted,
    Terminated,
}

impl fmt::Display for ProcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcState::New => "NEW",
            ProcState::Ready => "READY",
            ProcState::Running => "RUNNING",
            ProcState::Interrupted => "INTERRUPTED",
            ProcState::Blocked => "BLOCKED",
            ProcState::Halted => "HALTED",
            ProcState::Terminated => "TERMINATED",
        };
        write!(f, "{}", s)
    }
}

/// Workload category of a process. Decides which traps it can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProcType {
    IoBound,
    ComputeBound,
    MutexUser,
    Producer,
    Consumer,
}

impl fmt::Display for ProcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcType::IoBound => "io",
            ProcType::ComputeBound => "compute",
            ProcType::MutexUser => "mutex",
            ProcType::Producer => "producer",
            ProcType::Consumer => "consumer",
        };
        write!(f, "{}", s)
    }
}

/// The CPU register file, named as in the LC-3 processor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuContext {
    pub pc: u32,
    pub ir: u32,
    pub psr: u32,
    pub r: [u32; 8],
}

/// A set of program-counter values that raise a trap when reached.
#[derive(Debug, Clone, Default)]
pub struct TriggerSet {
    points: SortedSet<u32>,
}

impl TriggerSet {
    pub fn new<I: IntoIterator<Item = u32>>(points: I) -> Self {
        Self {
            points: SortedSet::from_unsorted(points.into_iter().collect()),
        }
    }

    pub fn contains(&self, pc: u32) -> bool {
        self.points.binary_search(&pc).is_ok()
    }

    pub fn points(&self) -> &[u32] {
        &self.points
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Trigger points for the two-lock protocol followed by mutex users.
///
/// `lock_1`/`lock_2` refer to the process's own first and second lock as
/// recorded in the lock map, not to a fixed lock.
#[derive(Debug, Clone, Default)]
pub struct MutexTriggers {
    pub lock_1: TriggerSet,
    pub lock_2: TriggerSet,
    pub unlock_1: TriggerSet,
    pub unlock_2: TriggerSet,
    pub trylock_1: TriggerSet,
    pub trylock_2: TriggerSet,
    pub try_unlock_1: TriggerSet,
    pub try_unlock_2: TriggerSet,
}

impl MutexTriggers {
    /// The fixed trigger table every mutex user runs.
    pub fn standard() -> Self {
        Self {
            lock_1: TriggerSet::new([5, 18, 200, 500]),
            lock_2: TriggerSet::new([6, 19, 201, 501]),
            unlock_2: TriggerSet::new([14, 30, 250, 570]),
            unlock_1: TriggerSet::new([15, 31, 251, 571]),
            trylock_1: TriggerSet::new([33, 50, 280, 300]),
            trylock_2: TriggerSet::new([34, 51, 281, 301]),
            try_unlock_2: TriggerSet::new([35, 52, 282, 302]),
            try_unlock_1: TriggerSet::new([36, 54, 283, 303]),
        }
    }

    /// Inclusive pc windows during which a lock may be held. A `max_pc`
    /// inside one of these windows would wrap before the release trigger.
    pub fn hold_windows(&self) -> Vec<(u32, u32)> {
        let mut windows = Vec::with_capacity(2 * NUM_TRIGGERS);
        for i in 0..NUM_TRIGGERS {
            let lo = self.lock_1.points()[i].min(self.lock_2.points()[i]);
            let hi = self.unlock_1.points()[i].max(self.unlock_2.points()[i]);
            windows.push((lo, hi));
            let lo = self.trylock_1.points()[i].min(self.trylock_2.points()[i]);
            let hi = self.try_unlock_1.points()[i].max(self.try_unlock_2.points()[i]);
            windows.push((lo, hi));
        }
        windows
    }
}

/// Rendezvous trigger points shared by producers and consumers.
pub fn rendezvous_triggers() -> TriggerSet {
    TriggerSet::new([69, 160, 251, 299])
}

/// Per-type trap configuration.
#[derive(Debug, Clone)]
pub enum TrapPlan {
    /// No synchronous traps.
    None,
    /// I/O trap points, indexed by device. Sets are disjoint.
    Io(Vec<TriggerSet>),
    Mutex(MutexTriggers),
    Rendezvous { triggers: TriggerSet, channel: ChannelId },
}

/// Process control block.
#[derive(Debug)]
pub struct Pcb {
    pid: Pid,
    pub state: ProcState,
    priority: Priority,
    proc_type: ProcType,
    pub context: CpuContext,
    /// Largest pc value before the counter wraps to 0.
    pub max_pc: u32,
    /// Terminate once `overflow_count` reaches this. 0 means never.
    pub terminate_after: u32,
    pub overflow_count: u32,
    pub traps: TrapPlan,
    pub created_at: SystemTime,
    pub terminated_at: Option<SystemTime>,
}

impl Pcb {
    pub fn new(pid: Pid, proc_type: ProcType, max_pc: u32, terminate_after: u32) -> Self {
        Self {
            pid,
            state: ProcState::New,
            priority: Priority::HIGHEST,
            proc_type,
            context: CpuContext::default(),
            max_pc,
            terminate_after,
            overflow_count: 0,
            traps: TrapPlan::None,
            created_at: SystemTime::now(),
            terminated_at: None,
        }
    }

    pub fn with_traps(mut self, traps: TrapPlan) -> Self {
        self.traps = traps;
        self
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn proc_type(&self) -> ProcType {
        self.proc_type
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Assign a priority level, clamped to the lowest level.
    pub fn set_priority(&mut self, level: usize) {
        self.priority = Priority::clamped(level);
    }

    /// Rendezvous channel of a producer or consumer.
    pub fn channel(&self) -> Option<ChannelId> {
        match &self.traps {
            TrapPlan::Rendezvous { channel, .. } => Some(*channel),
            _ => None,
        }
    }

    /// Point a producer or consumer at its channel. No-op for other types.
    pub fn bind_channel(&mut self, id: ChannelId) {
        if let TrapPlan::Rendezvous { channel, .. } = &mut self.traps {
            *channel = id;
        }
    }

    /// Whether the termination condition holds.
    pub fn should_terminate(&self) -> bool {
        self.terminate_after != 0 && self.overflow_count >= self.terminate_after
    }
}

impl fmt::Display for Pcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.context;
        write!(
            f,
            "PID: 0x{:X}, Priority: 0x{:X}, state: {}, type: {}, \
             PC: 0x{:04X}, IR: {:04X}, PSR: {:04X}",
            self.pid.0, self.priority.level(), self.state, self.proc_type, c.pc, c.ir, c.psr
        )?;
        for (i, r) in c.r.iter().enumerate() {
            write!(f, ", r{}: {:04X}", i, r)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NUM_PRIORITIES;

    #[test]
    fn test_priority_assignment_is_clamped() {
        let mut pcb = Pcb::new(Pid(1), ProcType::ComputeBound, 100, 3);
        pcb.set_priority(NUM_PRIORITIES + 4);
        assert_eq!(pcb.priority().level(), NUM_PRIORITIES - 1);
        pcb.set_priority(2);
        assert_eq!(pcb.priority().level(), 2);
    }

    #[test]
    fn test_termination_condition() {
        let mut pcb = Pcb::new(Pid(1), ProcType::IoBound, 100, 2);
        assert!(!pcb.should_terminate());
        pcb.overflow_count = 2;
        assert!(pcb.should_terminate());

        let mut immortal = Pcb::new(Pid(2), ProcType::IoBound, 100, 0);
        immortal.overflow_count = 1000;
        assert!(!immortal.should_terminate());
    }

    #[test]
    fn test_trigger_set_membership() {
        let set = TriggerSet::new([30, 4, 12]);
        assert_eq!(set.points(), &[4, 12, 30]);
        assert!(set.contains(12));
        assert!(!set.contains(13));
    }

    #[test]
    fn test_hold_windows_cover_lock_to_unlock() {
        let windows = MutexTriggers::standard().hold_windows();
        assert!(windows.contains(&(5, 15)));
        assert!(windows.contains(&(33, 36)));
        assert_eq!(windows.len(), 2 * NUM_TRIGGERS);
    }

    #[test]
    fn test_display_includes_registers() {
        let pcb = Pcb::new(Pid(10), ProcType::Producer, 100, 0);
        let s = pcb.to_string();
        assert!(s.starts_with("PID: 0xA"));
        assert!(s.contains("r7: 0000"));
    }
}
