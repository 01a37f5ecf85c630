// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Multilevel feedback queue process scheduler simulation.
//!
//! A virtual CPU runs simulated processes picked from a sixteen-level ready
//! queue. A timer thread preempts the running process at the end of each
//! quantum, I/O device threads complete blocking requests, and mutex users
//! and producer/consumer pairs exercise locks and condition variables while
//! a monitor watches for lock-order deadlocks.
//!
//! [`SchedState`] can be driven directly from a single thread with
//! [`SchedState::tick`] and friends; [`Kernel`] runs the full threaded
//! simulation.

#[macro_use]
extern crate static_assertions;

pub mod condvar;
pub mod config;
pub mod cpu;
pub mod fifo;
pub mod interrupt;
pub mod lock;
pub mod lock_map;
pub mod pcb;
pub mod ready_queue;
pub mod sched;
pub mod stats;
pub mod trace;
pub mod trap;
pub mod types;
pub mod workload;

pub use config::{SimConfig, WorkloadCaps};
pub use interrupt::Kernel;
pub use pcb::{Pcb, ProcState, ProcType};
pub use sched::{Event, SchedState};
pub use stats::{Census, RunStats};
pub use trace::{Trace, TraceKind};
pub use types::{ChannelId, DeviceId, LockId, Pid, Priority, NUM_PRIORITIES};
pub use workload::{Arrival, NoWorkload, ProcSpec, RandomWorkload, ScriptedWorkload, Workload};
