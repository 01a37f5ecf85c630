// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
#![allow(dead_code)]

use scx_procsim::{ProcSpec, SchedState, ScriptedWorkload, SimConfig};

/// Route `log` output through the test harness. Level comes from
/// `SIM_LOG` (error, warn, info, debug, trace); off by default.
///
/// Safe to call from every test: only the first call installs the logger.
pub fn setup_test() {
    let level = match std::env::var("SIM_LOG").as_deref() {
        Ok("error") => simplelog::LevelFilter::Error,
        Ok("warn") => simplelog::LevelFilter::Warn,
        Ok("info") => simplelog::LevelFilter::Info,
        Ok("debug") => simplelog::LevelFilter::Debug,
        Ok("trace") => simplelog::LevelFilter::Trace,
        _ => simplelog::LevelFilter::Off,
    };
    let _ = simplelog::TestLogger::init(level, simplelog::Config::default());
}

/// Config for deterministic single-threaded runs with tracing on.
pub fn traced_config() -> SimConfig {
    SimConfig {
        record_trace: true,
        seed: Some(42),
        ..Default::default()
    }
}

/// Booted scheduler whose first batch is `batch` and later batches empty.
pub fn scripted(cfg: SimConfig, batch: Vec<ProcSpec>) -> SchedState {
    let mut s = SchedState::new(cfg, Box::new(ScriptedWorkload::new([batch])));
    s.boot();
    s
}

pub fn compute(max_pc: u32, terminate_after: u32) -> ProcSpec {
    ProcSpec::Compute {
        max_pc,
        terminate_after,
    }
}

/// Seed for randomized tests, overridable with `STRESS_SEED`.
pub fn stress_seed() -> u64 {
    std::env::var("STRESS_SEED")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(42)
}

/// xorshift64, enough for picking random operations.
pub struct Rng(u64);

impl Rng {
    pub fn new(seed: u64) -> Self {
        Rng(seed.max(1))
    }

    pub fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    pub fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}
