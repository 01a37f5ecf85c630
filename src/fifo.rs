// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! FIFO queue of owned process records.
//!
//! Every waiting room in the simulation (new arrivals, one priority level
//! of the ready queue, a device queue, a lock's waiters, a condition
//! variable, the zombie list) is one of these.

use std::collections::VecDeque;
use std::fmt;

use crate::pcb::Pcb;
use crate::types::Pid;

#[derive(Debug, Default)]
pub struct FifoQueue {
    entries: VecDeque<Pcb>,
}

impl FifoQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, pcb: Pcb) {
        self.entries.push_back(pcb);
    }

    pub fn dequeue(&mut self) -> Option<Pcb> {
        self.entries.pop_front()
    }

    pub fn peek(&self) -> Option<&Pcb> {
        self.entries.front()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pcb> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Pcb> {
        self.entries.iter_mut()
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.entries.iter().any(|p| p.pid() == pid)
    }

    /// Remove every record, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = Pcb> + '_ {
        self.entries.drain(..)
    }
}

impl fmt::Display for FifoQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Q:Count={}:", self.entries.len())?;
        for p in &self.entries {
            write!(f, " P{}->", p.pid())?;
        }
        write!(f, " *")
    }
}
