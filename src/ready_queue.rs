// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Multilevel priority ready queue.
//!
//! One [`FifoQueue`] per priority level. Dequeue is strict priority across
//! levels and FIFO within a level.

use std::fmt;

use crate::fifo::FifoQueue;
use crate::pcb::{Pcb, ProcState};
use crate::types::{Priority, NUM_PRIORITIES};

#[derive(Debug)]
pub struct ReadyQueue {
    levels: Vec<FifoQueue>,
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            levels: (0..NUM_PRIORITIES).map(|_| FifoQueue::new()).collect(),
        }
    }

    /// Append `pcb` to the level matching its priority. The record is
    /// marked Ready on the way in.
    pub fn enqueue(&mut self, mut pcb: Pcb) {
        pcb.state = ProcState::Ready;
        let level = pcb.priority().level();
        self.levels[level].enqueue(pcb);
    }

    pub fn dequeue(&mut self) -> Option<Pcb> {
        self.levels.iter_mut().find_map(|q| q.dequeue())
    }

    pub fn peek(&self) -> Option<&Pcb> {
        self.levels.iter().find_map(|q| q.peek())
    }

    pub fn len(&self) -> usize {
        self.levels.iter().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(|q| q.is_empty())
    }

    pub fn level_len(&self, level: usize) -> usize {
        self.levels.get(level).map_or(0, |q| q.len())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pcb> {
        self.levels.iter().flat_map(|q| q.iter())
    }

    /// Move every process to level 0 with priority 0. Levels are appended
    /// in order so relative order within each level survives.
    pub fn reset_priorities(&mut self) {
        let (top, rest) = self.levels.split_at_mut(1);
        for q in top[0].iter_mut() {
            q.set_priority(Priority::HIGHEST.level());
        }
        for level in rest.iter_mut() {
            for mut pcb in level.drain() {
                pcb.set_priority(Priority::HIGHEST.level());
                top[0].enqueue(pcb);
            }
        }
    }
}

impl fmt::Display for ReadyQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, q) in self.levels.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "Q{:>2}: {}", i, q)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcb::ProcType;
    use crate::types::Pid;

    fn proc(pid: u32, priority: usize) -> Pcb {
        let mut pcb = Pcb::new(Pid(pid), ProcType::ComputeBound, 100, 1);
        pcb.set_priority(priority);
        pcb
    }

    #[test]
    fn test_strict_priority_then_fifo() {
        let mut rq = ReadyQueue::new();
        rq.enqueue(proc(1, 3));
        rq.enqueue(proc(2, 0));
        rq.enqueue(proc(3, 3));
        rq.enqueue(proc(4, 0));
        assert_eq!(rq.len(), 4);
        assert_eq!(rq.peek().map(|p| p.pid()), Some(Pid(2)));

        let order: Vec<Pid> = std::iter::from_fn(|| rq.dequeue()).map(|p| p.pid()).collect();
        assert_eq!(order, vec![Pid(2), Pid(4), Pid(1), Pid(3)]);
        assert!(rq.is_empty());
    }

    #[test]
    fn test_enqueue_marks_ready() {
        let mut rq = ReadyQueue::new();
        rq.enqueue(proc(1, 5));
        assert_eq!(rq.level_len(5), 1);
        assert!(rq.iter().all(|p| p.state == ProcState::Ready));
    }

    #[test]
    fn test_reset_preserves_level_order() {
        let mut rq = ReadyQueue::new();
        rq.enqueue(proc(1, 2));
        rq.enqueue(proc(2, 0));
        rq.enqueue(proc(3, 2));
        rq.enqueue(proc(4, 15));
        rq.reset_priorities();

        assert_eq!(rq.level_len(0), 4);
        let order: Vec<Pid> = std::iter::from_fn(|| rq.dequeue())
            .inspect(|p| assert_eq!(p.priority(), Priority::HIGHEST))
            .map(|p| p.pid())
            .collect();
        assert_eq!(order, vec![Pid(2), Pid(1), Pid(3), Pid(4)]);
    }

    #[test]
    fn test_display_lists_every_level() {
        let rq = ReadyQueue::new();
        assert_eq!(rq.to_string().lines().count(), NUM_PRIORITIES);
    }
}
