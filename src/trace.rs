// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Scheduler event recording.
//!
//! Every state change the scheduler makes is described by a [`TraceKind`].
//! The scheduler always logs it; when trace recording is enabled it is also
//! kept here, stamped with the CPU iteration it happened on.

use std::fmt;

use log::Level;

use crate::pcb::ProcType;
use crate::types::{ChannelId, DeviceId, LockId, Pid, Priority};

#[derive(Debug, Clone)]
pub struct TraceEvent {
    /// CPU loop iteration when this event occurred.
    pub iteration: u64,
    pub kind: TraceKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceKind {
    Admitted { pid: Pid, proc_type: ProcType },
    Dispatched { pid: Pid, priority: Priority, pc: u32 },
    TimerInterrupt { pid: Option<Pid> },
    QuantumExpired { pid: Pid, priority: Priority },
    IoTrap { pid: Pid, device: DeviceId, countdown: u32 },
    IoCompleted { pid: Pid, device: DeviceId },
    LockAcquired { pid: Pid, lock: LockId },
    LockBlocked { pid: Pid, lock: LockId, holder: Option<Pid> },
    LockReleased { pid: Pid, lock: LockId, woken: usize },
    UnlockSkipped { pid: Pid, lock: LockId },
    TryLock { pid: Pid, lock: LockId, acquired: bool },
    CondWait { pid: Pid, channel: ChannelId },
    CondSignal { pid: Pid, channel: ChannelId, woken: Option<Pid> },
    Produced { pid: Pid, channel: ChannelId, value: u64 },
    Consumed { pid: Pid, channel: ChannelId, value: u64 },
    Terminated { pid: Pid, proc_type: ProcType },
    ZombiesFlushed { count: usize },
    PrioritiesReset { admitted: usize },
    DeadlockDetected { p1: Pid, p2: Pid, locks: (LockId, LockId) },
    Idle,
}

impl TraceKind {
    /// Level the event is logged at.
    pub fn level(&self) -> Level {
        match self {
            TraceKind::DeadlockDetected { .. } => Level::Warn,
            TraceKind::Dispatched { .. }
            | TraceKind::IoTrap { .. }
            | TraceKind::IoCompleted { .. }
            | TraceKind::Terminated { .. }
            | TraceKind::ZombiesFlushed { .. }
            | TraceKind::PrioritiesReset { .. } => Level::Info,
            TraceKind::Idle | TraceKind::TimerInterrupt { .. } => Level::Trace,
            _ => Level::Debug,
        }
    }

    /// Label for the `sched_events_total` metric.
    pub fn label(&self) -> &'static str {
        match self {
            TraceKind::Admitted { .. } => "admitted",
            TraceKind::Dispatched { .. } => "dispatched",
            TraceKind::TimerInterrupt { .. } => "timer_interrupt",
            TraceKind::QuantumExpired { .. } => "quantum_expired",
            TraceKind::IoTrap { .. } => "io_trap",
            TraceKind::IoCompleted { .. } => "io_completed",
            TraceKind::LockAcquired { .. } => "lock_acquired",
            TraceKind::LockBlocked { .. } => "lock_blocked",
            TraceKind::LockReleased { .. } => "lock_released",
            TraceKind::UnlockSkipped { .. } => "unlock_skipped",
            TraceKind::TryLock { .. } => "trylock",
            TraceKind::CondWait { .. } => "cond_wait",
            TraceKind::CondSignal { .. } => "cond_signal",
            TraceKind::Produced { .. } => "produced",
            TraceKind::Consumed { .. } => "consumed",
            TraceKind::Terminated { .. } => "terminated",
            TraceKind::ZombiesFlushed { .. } => "zombies_flushed",
            TraceKind::PrioritiesReset { .. } => "priorities_reset",
            TraceKind::DeadlockDetected { .. } => "deadlock",
            TraceKind::Idle => "idle",
        }
    }
}

impl fmt::Display for TraceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceKind::Admitted { pid, proc_type } => write!(f, "ADMIT    pid={} type={}", pid, proc_type),
            TraceKind::Dispatched { pid, priority, pc } => {
                write!(f, "DISPATCH pid={} prio={} pc={}", pid, priority, pc)
            }
            TraceKind::TimerInterrupt { pid: Some(pid) } => write!(f, "TIMER    pid={}", pid),
            TraceKind::TimerInterrupt { pid: None } => write!(f, "TIMER    idle"),
            TraceKind::QuantumExpired { pid, priority } => {
                write!(f, "EXPIRE   pid={} new_prio={}", pid, priority)
            }
            TraceKind::IoTrap { pid, device, countdown } => {
                write!(f, "IO_TRAP  pid={} dev={} countdown={}", pid, device, countdown)
            }
            TraceKind::IoCompleted { pid, device } => write!(f, "IO_DONE  pid={} dev={}", pid, device),
            TraceKind::LockAcquired { pid, lock } => write!(f, "LOCK     pid={} lock={}", pid, lock),
            TraceKind::LockBlocked { pid, lock, holder } => match holder {
                Some(h) => write!(f, "BLOCK    pid={} lock={} holder={}", pid, lock, h),
                None => write!(f, "BLOCK    pid={} lock={}", pid, lock),
            },
            TraceKind::LockReleased { pid, lock, woken } => {
                write!(f, "UNLOCK   pid={} lock={} woken={}", pid, lock, woken)
            }
            TraceKind::UnlockSkipped { pid, lock } => {
                write!(f, "UNLOCK   pid={} lock={} skipped (not holder)", pid, lock)
            }
            TraceKind::TryLock { pid, lock, acquired } => {
                write!(f, "TRYLOCK  pid={} lock={} acquired={}", pid, lock, acquired)
            }
            TraceKind::CondWait { pid, channel } => write!(f, "WAIT     pid={} chan={}", pid, channel),
            TraceKind::CondSignal { pid, channel, woken } => match woken {
                Some(w) => write!(f, "SIGNAL   pid={} chan={} woke={}", pid, channel, w),
                None => write!(f, "SIGNAL   pid={} chan={} no waiters", pid, channel),
            },
            TraceKind::Produced { pid, channel, value } => {
                write!(f, "PRODUCE  pid={} chan={} value={}", pid, channel, value)
            }
            TraceKind::Consumed { pid, channel, value } => {
                write!(f, "CONSUME  pid={} chan={} value={}", pid, channel, value)
            }
            TraceKind::Terminated { pid, proc_type } => {
                write!(f, "EXIT     pid={} type={}", pid, proc_type)
            }
            TraceKind::ZombiesFlushed { count } => write!(f, "REAP     count={}", count),
            TraceKind::PrioritiesReset { admitted } => write!(f, "RESET    admitted={}", admitted),
            TraceKind::DeadlockDetected { p1, p2, locks } => write!(
                f,
                "DEADLOCK pid={} holds lock={} pid={} holds lock={}",
                p1, locks.0, p2, locks.1
            ),
            TraceKind::Idle => write!(f, "IDLE"),
        }
    }
}

/// A recorded run, events in the order they happened.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    events: Vec<TraceEvent>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&mut self, iteration: u64, kind: TraceKind) {
        self.events.push(TraceEvent { iteration, kind });
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn count<F: Fn(&TraceKind) -> bool>(&self, pred: F) -> usize {
        self.events.iter().filter(|e| pred(&e.kind)).count()
    }

    /// Count the number of times a process was dispatched.
    pub fn dispatch_count(&self, pid: Pid) -> usize {
        self.count(|k| matches!(k, TraceKind::Dispatched { pid: p, .. } if *p == pid))
    }

    /// Pids in dispatch order.
    pub fn dispatch_order(&self) -> Vec<Pid> {
        self.events
            .iter()
            .filter_map(|e| match e.kind {
                TraceKind::Dispatched { pid, .. } => Some(pid),
                _ => None,
            })
            .collect()
    }

    /// Priorities a process was demoted to, in order.
    pub fn demotions(&self, pid: Pid) -> Vec<Priority> {
        self.events
            .iter()
            .filter_map(|e| match e.kind {
                TraceKind::QuantumExpired { pid: p, priority } if p == pid => Some(priority),
                _ => None,
            })
            .collect()
    }

    pub fn deadlock_count(&self) -> usize {
        self.count(|k| matches!(k, TraceKind::DeadlockDetected { .. }))
    }

    pub fn dump(&self) {
        for event in &self.events {
            eprintln!("[{:>8}] {}", event.iteration, event.kind);
        }
    }
}
