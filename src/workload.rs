// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Process-arrival generators.
//!
//! The scheduler asks its [`Workload`] for a batch of arrivals at boot and
//! at every priority reset. [`RandomWorkload`] produces the randomized mix
//! the simulator normally runs; [`ScriptedWorkload`] replays fixed batches
//! for deterministic runs.

use std::collections::VecDeque;

use rand::rngs::SmallRng;
use rand::Rng;
use rand::SeedableRng;

use crate::config::{SimConfig, WorkloadCaps};
use crate::pcb::{rendezvous_triggers, MutexTriggers, Pcb, ProcType, TrapPlan, TriggerSet};
use crate::stats::Census;
use crate::types::{ChannelId, PidAllocator, NUM_TRIGGERS};

/// One unit of admission. Pairs are admitted together since they share
/// locks or a channel.
#[derive(Debug)]
pub enum Arrival {
    Single(Pcb),
    /// Two mutex users sharing two fresh locks. With `reversed` the second
    /// takes them in the opposite order.
    MutexPair { first: Pcb, second: Pcb, reversed: bool },
    RendezvousPair { producer: Pcb, consumer: Pcb },
}

impl Arrival {
    pub fn len(&self) -> usize {
        match self {
            Arrival::Single(_) => 1,
            _ => 2,
        }
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

pub trait Workload: Send {
    fn arrivals(&mut self, pids: &mut PidAllocator, census: &Census) -> Vec<Arrival>;
}

/// Never produces anything.
#[derive(Debug, Default)]
pub struct NoWorkload;

impl Workload for NoWorkload {
    fn arrivals(&mut self, _pids: &mut PidAllocator, _census: &Census) -> Vec<Arrival> {
        vec![]
    }
}

const MIN_MAX_PC: u32 = 20;
const MAX_PC_RANGE: u32 = 400;
const MAX_TERMINATE_AFTER: u32 = 30;
const IMMORTAL_ODDS: u32 = 1000;
const IMMORTAL_LOTTERY: u32 = 5;

/// Randomized process mix with per-category caps.
#[derive(Debug)]
pub struct RandomWorkload {
    rng: SmallRng,
    caps: WorkloadCaps,
    max_batch: u32,
    io_devices: usize,
    build_deadlock: bool,
    hold_windows: Vec<(u32, u32)>,
}

impl RandomWorkload {
    pub fn new(cfg: &SimConfig) -> Self {
        let rng = match cfg.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        let mut hold_windows = MutexTriggers::standard().hold_windows();
        hold_windows.extend(rendezvous_triggers().points().iter().map(|t| (t.saturating_sub(1), t + 1)));
        Self {
            rng,
            caps: cfg.caps,
            max_batch: cfg.max_batch,
            io_devices: cfg.io_devices,
            build_deadlock: cfg.build_deadlock,
            hold_windows,
        }
    }

    fn roll_max_pc(&mut self) -> u32 {
        MIN_MAX_PC + self.rng.gen_range(0..MAX_PC_RANGE)
    }

    /// A `max_pc` that never wraps while a lock or channel is held.
    fn roll_safe_max_pc(&mut self) -> u32 {
        loop {
            let m = self.roll_max_pc();
            if !self.hold_windows.iter().any(|&(lo, hi)| lo <= m && m < hi) {
                return m;
            }
        }
    }

    fn roll_terminate_after(&mut self) -> u32 {
        if self.rng.gen_range(0..IMMORTAL_ODDS) <= IMMORTAL_LOTTERY {
            0
        } else {
            1 + self.rng.gen_range(0..MAX_TERMINATE_AFTER)
        }
    }

    /// Strictly increasing trap points, dealt round-robin to the devices so
    /// no pc belongs to two devices.
    fn roll_io_traps(&mut self, max_pc: u32) -> Vec<TriggerSet> {
        let step = (max_pc / 4).max(1);
        let mut points: Vec<Vec<u32>> = vec![vec![]; self.io_devices];
        let mut pc = 0;
        for i in 0..self.io_devices * NUM_TRIGGERS {
            pc += 1 + self.rng.gen_range(0..step);
            if pc >= max_pc {
                break;
            }
            points[i % self.io_devices].push(pc);
        }
        points.into_iter().map(TriggerSet::new).collect()
    }

    fn io_bound(&mut self, pids: &mut PidAllocator) -> Pcb {
        let max_pc = self.roll_max_pc();
        let terminate_after = self.roll_terminate_after();
        let traps = self.roll_io_traps(max_pc);
        Pcb::new(pids.next_pid(), ProcType::IoBound, max_pc, terminate_after)
            .with_traps(TrapPlan::Io(traps))
    }

    fn compute_bound(&mut self, pids: &mut PidAllocator) -> Pcb {
        let max_pc = self.roll_max_pc();
        let terminate_after = self.roll_terminate_after();
        Pcb::new(pids.next_pid(), ProcType::ComputeBound, max_pc, terminate_after)
    }

    fn mutex_user(&mut self, pids: &mut PidAllocator) -> Pcb {
        let max_pc = self.roll_safe_max_pc();
        Pcb::new(pids.next_pid(), ProcType::MutexUser, max_pc, 0)
            .with_traps(TrapPlan::Mutex(MutexTriggers::standard()))
    }

    fn rendezvous(&mut self, pids: &mut PidAllocator, proc_type: ProcType) -> Pcb {
        let max_pc = self.roll_safe_max_pc();
        Pcb::new(pids.next_pid(), proc_type, max_pc, 0).with_traps(TrapPlan::Rendezvous {
            triggers: rendezvous_triggers(),
            channel: ChannelId(0),
        })
    }
}

impl Workload for RandomWorkload {
    fn arrivals(&mut self, pids: &mut PidAllocator, census: &Census) -> Vec<Arrival> {
        let candidates = self.rng.gen_range(0..self.max_batch);
        let mut io = census.live(ProcType::IoBound);
        let mut compute = census.live(ProcType::ComputeBound);
        let mut mutex = census.created(ProcType::MutexUser);
        let mut pairs = census.created(ProcType::Producer);

        let mut batch = vec![];
        for _ in 0..candidates {
            match self.rng.gen_range(0..4) {
                0 if io < self.caps.io_live => {
                    io += 1;
                    batch.push(Arrival::Single(self.io_bound(pids)));
                }
                1 if compute < self.caps.compute_live => {
                    compute += 1;
                    batch.push(Arrival::Single(self.compute_bound(pids)));
                }
                2 if mutex + 2 <= self.caps.mutex_created => {
                    mutex += 2;
                    batch.push(Arrival::MutexPair {
                        first: self.mutex_user(pids),
                        second: self.mutex_user(pids),
                        reversed: self.build_deadlock,
                    });
                }
                3 if pairs < self.caps.rendezvous_pairs => {
                    pairs += 1;
                    batch.push(Arrival::RendezvousPair {
                        producer: self.rendezvous(pids, ProcType::Producer),
                        consumer: self.rendezvous(pids, ProcType::Consumer),
                    });
                }
                _ => {}
            }
        }
        batch
    }
}

/// Description of a process for [`ScriptedWorkload`].
#[derive(Debug, Clone)]
pub enum ProcSpec {
    Compute { max_pc: u32, terminate_after: u32 },
    /// One trigger list per device.
    Io { max_pc: u32, terminate_after: u32, traps: Vec<Vec<u32>> },
    MutexPair { max_pc: u32, reversed: bool },
    RendezvousPair { max_pc: u32 },
}

impl ProcSpec {
    fn build(&self, pids: &mut PidAllocator) -> Arrival {
        match self {
            ProcSpec::Compute { max_pc, terminate_after } => Arrival::Single(Pcb::new(
                pids.next_pid(),
                ProcType::ComputeBound,
                *max_pc,
                *terminate_after,
            )),
            ProcSpec::Io { max_pc, terminate_after, traps } => {
                let sets = traps.iter().map(|t| TriggerSet::new(t.iter().copied())).collect();
                Arrival::Single(
                    Pcb::new(pids.next_pid(), ProcType::IoBound, *max_pc, *terminate_after)
                        .with_traps(TrapPlan::Io(sets)),
                )
            }
            ProcSpec::MutexPair { max_pc, reversed } => {
                let mut user = || {
                    Pcb::new(pids.next_pid(), ProcType::MutexUser, *max_pc, 0)
                        .with_traps(TrapPlan::Mutex(MutexTriggers::standard()))
                };
                let first = user();
                let second = user();
                Arrival::MutexPair {
                    first,
                    second,
                    reversed: *reversed,
                }
            }
            ProcSpec::RendezvousPair { max_pc } => {
                let mut side = |proc_type| {
                    Pcb::new(pids.next_pid(), proc_type, *max_pc, 0).with_traps(TrapPlan::Rendezvous {
                        triggers: rendezvous_triggers(),
                        channel: ChannelId(0),
                    })
                };
                let producer = side(ProcType::Producer);
                let consumer = side(ProcType::Consumer);
                Arrival::RendezvousPair { producer, consumer }
            }
        }
    }
}

/// Replays fixed batches, one per request, then produces nothing.
#[derive(Debug, Default)]
pub struct ScriptedWorkload {
    batches: VecDeque<Vec<ProcSpec>>,
}

impl ScriptedWorkload {
    pub fn new<I: IntoIterator<Item = Vec<ProcSpec>>>(batches: I) -> Self {
        Self {
            batches: batches.into_iter().collect(),
        }
    }
}

impl Workload for ScriptedWorkload {
    fn arrivals(&mut self, pids: &mut PidAllocator, _census: &Census) -> Vec<Arrival> {
        match self.batches.pop_front() {
            Some(batch) => batch.iter().map(|spec| spec.build(pids)).collect(),
            None => vec![],
        }
    }
}
