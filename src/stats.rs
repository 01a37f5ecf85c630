// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeMap;
use std::io::Write;

use anyhow::Result;
use metrics::counter;
use metrics::gauge;
use metrics::Counter;
use metrics::Gauge;

use crate::pcb::ProcType;
use crate::trap::Trap;

const CATEGORIES: [ProcType; 5] = [
    ProcType::IoBound,
    ProcType::ComputeBound,
    ProcType::MutexUser,
    ProcType::Producer,
    ProcType::Consumer,
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tally {
    pub created: u64,
    pub terminated: u64,
}

impl Tally {
    pub fn live(&self) -> u64 {
        self.created.saturating_sub(self.terminated)
    }
}

/// Created and terminated process counts per category.
#[derive(Clone, Debug, Default)]
pub struct Census {
    tallies: BTreeMap<ProcType, Tally>,
}

impl Census {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tally(&self, proc_type: ProcType) -> Tally {
        self.tallies.get(&proc_type).copied().unwrap_or_default()
    }

    pub fn created(&self, proc_type: ProcType) -> u64 {
        self.tally(proc_type).created
    }

    pub fn live(&self, proc_type: ProcType) -> u64 {
        self.tally(proc_type).live()
    }

    pub fn note_created(&mut self, proc_type: ProcType) {
        self.tallies.entry(proc_type).or_default().created += 1;
    }

    pub fn note_terminated(&mut self, proc_type: ProcType) {
        self.tallies.entry(proc_type).or_default().terminated += 1;
    }

    pub fn total_created(&self) -> u64 {
        self.tallies.values().map(|t| t.created).sum()
    }

    pub fn total_terminated(&self) -> u64 {
        self.tallies.values().map(|t| t.terminated).sum()
    }

    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        for proc_type in CATEGORIES {
            let t = self.tally(proc_type);
            writeln!(
                w,
                "  {:<9} created={:<6} terminated={:<6} live={}",
                proc_type.to_string(),
                t.created,
                t.terminated,
                t.live()
            )?;
        }
        writeln!(
            w,
            "  {:<9} created={:<6} terminated={:<6}",
            "total",
            self.total_created(),
            self.total_terminated()
        )?;
        Ok(())
    }
}

/// Summary of a finished run.
#[derive(Clone, Debug, Default)]
pub struct RunStats {
    pub iterations: u64,
    pub dispatches: u64,
    pub quantum_expiries: u64,
    pub io_completions: u64,
    pub priority_resets: u64,
    pub deadlock: bool,
    pub deadlocked_pairs: usize,
    /// The run was stopped before reaching its iteration cap.
    pub interrupted: bool,
    pub census: Census,
}

impl RunStats {
    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        if self.interrupted {
            writeln!(w, "Run interrupted after {} iterations.", self.iterations)?;
        } else {
            writeln!(w, "Run finished after {} iterations.", self.iterations)?;
        }
        if self.deadlock {
            writeln!(
                w,
                "Deadlock occurred at least once ({} pair(s)).",
                self.deadlocked_pairs
            )?;
        } else {
            writeln!(w, "No deadlock occurred during run.")?;
        }
        writeln!(
            w,
            "dispatches={} expiries={} io_done={} resets={}",
            self.dispatches, self.quantum_expiries, self.io_completions, self.priority_resets
        )?;
        self.census.format(w)?;
        Ok(())
    }
}

/// Metric handles bumped by the scheduler. Cheap to clone and no-ops
/// unless a recorder is installed.
#[derive(Clone)]
pub struct Metrics {
    pub dispatches: Counter,
    pub terminations: Counter,
    pub deadlocks: Counter,
    pub priority_resets: Counter,
    pub quantum_expiries: Counter,
    pub io_completions: Counter,
    pub ready_queue_len: Gauge,
    pub zombie_queue_len: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            dispatches: counter!("dispatches_total"),
            terminations: counter!("terminations_total"),
            deadlocks: counter!("deadlocks_total"),
            priority_resets: counter!("priority_resets_total"),
            quantum_expiries: counter!("quantum_expiries_total"),
            io_completions: counter!("io_completions_total"),
            ready_queue_len: gauge!("ready_queue_len"),
            zombie_queue_len: gauge!("zombie_queue_len"),
        }
    }

    pub fn trap(&self, trap: &Trap) {
        counter!("traps_total", "type" => trap.kind()).increment(1);
    }

    pub fn event(&self, label: &'static str) {
        counter!("sched_events_total", "type" => label).increment(1);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Metrics")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_census_live_counts() {
        let mut census = Census::new();
        census.note_created(ProcType::IoBound);
        census.note_created(ProcType::IoBound);
        census.note_terminated(ProcType::IoBound);
        census.note_created(ProcType::MutexUser);

        assert_eq!(census.live(ProcType::IoBound), 1);
        assert_eq!(census.created(ProcType::MutexUser), 1);
        assert_eq!(census.live(ProcType::Consumer), 0);
        assert_eq!(census.total_created(), 3);
        assert_eq!(census.total_terminated(), 1);
    }

    #[test]
    fn test_run_stats_report() {
        let mut stats = RunStats {
            iterations: 1000,
            ..Default::default()
        };
        let mut out = vec![];
        stats.format(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("No deadlock occurred during run."));
        assert!(text.contains("mutex"));

        stats.deadlock = true;
        stats.deadlocked_pairs = 2;
        let mut out = vec![];
        stats.format(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Deadlock occurred at least once (2 pair(s))."));
    }
}
