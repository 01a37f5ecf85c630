// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Simulation parameters.

use std::time::Duration;

use anyhow::bail;
use anyhow::Result;

use crate::types::NUM_PRIORITIES;

/// Per-category limits on what the random workload may create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadCaps {
    /// Maximum live I/O-bound processes.
    pub io_live: u64,
    /// Maximum live compute-bound processes.
    pub compute_live: u64,
    /// Maximum mutex users ever created.
    pub mutex_created: u64,
    /// Maximum producer/consumer pairs ever created.
    pub rendezvous_pairs: u64,
}

impl Default for WorkloadCaps {
    fn default() -> Self {
        Self {
            io_live: 50,
            compute_live: 25,
            mutex_created: 50,
            rendezvous_pairs: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// CPU loop iterations before the run ends.
    pub iterations: u64,
    pub timer_interval: Duration,
    /// Wall time per unit of I/O countdown.
    pub io_tick: Duration,
    pub io_devices: usize,
    pub priority_zero_time: u32,
    pub per_priority_time_increase: u32,
    /// Priority-reset interval in multiples of the middle quantum.
    pub s_multiple: u32,
    /// Dispatches between deadlock scans.
    pub deadlock_check_interval: u64,
    pub zombie_threshold: usize,
    /// Give the second mutex user of each pair the opposite lock order.
    pub build_deadlock: bool,
    /// Skip unlock triggers for locks the running process does not hold.
    pub strict_unlock: bool,
    pub max_batch: u32,
    pub caps: WorkloadCaps,
    pub seed: Option<u64>,
    pub record_trace: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            iterations: 1_000_000,
            timer_interval: Duration::from_millis(10),
            io_tick: Duration::from_micros(1),
            io_devices: 2,
            priority_zero_time: 5,
            per_priority_time_increase: 8,
            s_multiple: 8,
            deadlock_check_interval: 10,
            zombie_threshold: 4,
            build_deadlock: true,
            strict_unlock: false,
            max_batch: 40,
            caps: WorkloadCaps::default(),
            seed: None,
            record_trace: false,
        }
    }
}

/// Upper bound on any level's quantum in CPU cycles.
pub const MAX_QUANTUM: u32 = 1_000_000;

/// Upper bound on the wall time of one I/O countdown unit.
pub const MAX_IO_TICK: Duration = Duration::from_secs(1);

impl SimConfig {
    /// Quantum of a priority level in CPU cycles.
    pub fn quantum(&self, level: usize) -> u32 {
        self.per_priority_time_increase
            .saturating_mul(level as u32)
            .saturating_add(self.priority_zero_time)
    }

    /// Cycles between priority resets.
    pub fn reset_interval(&self) -> u64 {
        self.quantum(NUM_PRIORITIES / 2) as u64 * self.s_multiple as u64
    }

    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            bail!("iterations must be positive");
        }
        if self.io_devices < 2 {
            bail!("at least 2 I/O devices are required, got {}", self.io_devices);
        }
        if self.timer_interval.is_zero() {
            bail!("timer interval must be non-zero");
        }
        if self.priority_zero_time == 0 {
            bail!("priority 0 quantum must be positive");
        }
        if self.quantum(NUM_PRIORITIES - 1) > MAX_QUANTUM {
            bail!(
                "lowest priority quantum ({} + {} * {}) exceeds {} cycles",
                self.priority_zero_time,
                self.per_priority_time_increase,
                NUM_PRIORITIES - 1,
                MAX_QUANTUM
            );
        }
        if self.io_tick > MAX_IO_TICK {
            bail!("I/O tick {:?} exceeds {:?}", self.io_tick, MAX_IO_TICK);
        }
        if self.s_multiple == 0 {
            bail!("priority reset multiple must be positive");
        }
        if self.deadlock_check_interval == 0 {
            bail!("deadlock check interval must be positive");
        }
        if self.zombie_threshold == 0 {
            bail!("zombie threshold must be positive");
        }
        if self.max_batch < 2 {
            bail!("max batch ({}) must be at least 2", self.max_batch);
        }
        Ok(())
    }
}
