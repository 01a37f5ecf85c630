// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Newtype wrappers and constants for domain concepts.
//!
//! Identifiers for processes, locks, rendezvous channels and I/O devices are
//! all small integers in the simulation; wrapping them keeps a lock id from
//! ever being handed to something that expects a pid.

use std::fmt;

/// Number of priority levels. 0 is the highest priority.
pub const NUM_PRIORITIES: usize = 16;

/// Number of program-counter values in each trigger set.
pub const NUM_TRIGGERS: usize = 4;

const_assert!(NUM_PRIORITIES >= 2 && NUM_PRIORITIES <= u8::MAX as usize);

/// Process identifier. Allocated monotonically by [`PidAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a simulated mutex in the lock table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId(pub u32);

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a producer/consumer rendezvous channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a simulated I/O device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub usize);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling priority, always below [`NUM_PRIORITIES`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(0);
    pub const LOWEST: Priority = Priority((NUM_PRIORITIES - 1) as u8);

    /// Build a priority, clamping anything past the lowest level.
    pub fn clamped(level: usize) -> Self {
        Priority(level.min(NUM_PRIORITIES - 1) as u8)
    }

    pub fn level(self) -> usize {
        self.0 as usize
    }

    /// One level lower (numerically higher), saturating at [`Priority::LOWEST`].
    pub fn demoted(self) -> Self {
        Self::clamped(self.level() + 1)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out process ids in strictly increasing order.
#[derive(Debug, Default)]
pub struct PidAllocator {
    next: u32,
}

impl PidAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_pid(&mut self) -> Pid {
        let pid = Pid(self.next);
        self.next += 1;
        pid
    }

    /// Number of pids handed out so far.
    pub fn allocated(&self) -> u32 {
        self.next
    }
}
