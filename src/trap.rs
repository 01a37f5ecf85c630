// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Synchronous trap detection.
//!
//! After every pc advance the CPU asks [`match_trap`] whether the running
//! process hit one of its trigger points. At most one trap fires per tick;
//! the first match in a fixed per-type order wins.

use std::fmt;

use crate::lock_map::LockMap;
use crate::pcb::{MutexTriggers, Pcb, TrapPlan};
use crate::types::{ChannelId, DeviceId, LockId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    Io(DeviceId),
    Lock(LockId),
    Unlock(LockId),
    TryLock(LockId),
    TryUnlock(LockId),
    RendezvousAcquire(ChannelId),
    RendezvousBody(ChannelId),
    RendezvousRelease(ChannelId),
}

impl Trap {
    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Trap::Io(_) => "io",
            Trap::Lock(_) => "lock",
            Trap::Unlock(_) => "unlock",
            Trap::TryLock(_) => "trylock",
            Trap::TryUnlock(_) => "tryunlock",
            Trap::RendezvousAcquire(_) => "rendezvous_acquire",
            Trap::RendezvousBody(_) => "rendezvous",
            Trap::RendezvousRelease(_) => "rendezvous_release",
        }
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trap::Io(dev) => write!(f, "io(dev={})", dev),
            Trap::Lock(l) | Trap::Unlock(l) | Trap::TryLock(l) | Trap::TryUnlock(l) => {
                write!(f, "{}(lock={})", self.kind(), l)
            }
            Trap::RendezvousAcquire(c) | Trap::RendezvousBody(c) | Trap::RendezvousRelease(c) => {
                write!(f, "{}(chan={})", self.kind(), c)
            }
        }
    }
}

fn match_mutex(t: &MutexTriggers, pc: u32, first: LockId, second: LockId) -> Option<Trap> {
    let order = [
        (&t.lock_1, Trap::Lock(first)),
        (&t.lock_2, Trap::Lock(second)),
        (&t.unlock_1, Trap::Unlock(first)),
        (&t.unlock_2, Trap::Unlock(second)),
        (&t.trylock_1, Trap::TryLock(first)),
        (&t.trylock_2, Trap::TryLock(second)),
        (&t.try_unlock_1, Trap::TryUnlock(first)),
        (&t.try_unlock_2, Trap::TryUnlock(second)),
    ];
    order
        .into_iter()
        .find(|(set, _)| set.contains(pc))
        .map(|(_, trap)| trap)
}

/// Find the trap, if any, that `pcb` raises at `pc`.
///
/// A mutex user with no lock map entry raises nothing.
pub fn match_trap(pcb: &Pcb, pc: u32, map: &LockMap) -> Option<Trap> {
    match &pcb.traps {
        TrapPlan::None => None,
        TrapPlan::Mutex(triggers) => {
            let entry = map.search(pcb.pid())?;
            match_mutex(triggers, pc, entry.first, entry.second)
        }
        TrapPlan::Rendezvous { triggers, channel } => {
            if triggers.contains(pc + 1) {
                Some(Trap::RendezvousAcquire(*channel))
            } else if triggers.contains(pc) {
                Some(Trap::RendezvousBody(*channel))
            } else if pc > 0 && triggers.contains(pc - 1) {
                Some(Trap::RendezvousRelease(*channel))
            } else {
                None
            }
        }
        TrapPlan::Io(devices) => devices
            .iter()
            .position(|set| set.contains(pc))
            .map(|d| Trap::Io(DeviceId(d))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcb::{rendezvous_triggers, ProcType, TriggerSet};
    use crate::types::Pid;

    fn mutex_user(pid: u32) -> Pcb {
        Pcb::new(Pid(pid), ProcType::MutexUser, 600, 0)
            .with_traps(TrapPlan::Mutex(MutexTriggers::standard()))
    }

    #[test]
    fn test_mutex_triggers_use_own_lock_order() {
        let mut map = LockMap::new();
        map.add_pair(Pid(1), Pid(2), LockId(0), LockId(1), true);
        let p1 = mutex_user(1);
        let p2 = mutex_user(2);

        assert_eq!(match_trap(&p1, 5, &map), Some(Trap::Lock(LockId(0))));
        assert_eq!(match_trap(&p2, 5, &map), Some(Trap::Lock(LockId(1))));
        assert_eq!(match_trap(&p1, 6, &map), Some(Trap::Lock(LockId(1))));
        assert_eq!(match_trap(&p1, 14, &map), Some(Trap::Unlock(LockId(1))));
        assert_eq!(match_trap(&p1, 15, &map), Some(Trap::Unlock(LockId(0))));
        assert_eq!(match_trap(&p1, 33, &map), Some(Trap::TryLock(LockId(0))));
        assert_eq!(match_trap(&p1, 36, &map), Some(Trap::TryUnlock(LockId(0))));
        assert_eq!(match_trap(&p1, 7, &map), None);
    }

    #[test]
    fn test_mutex_user_without_entry_is_silent() {
        let map = LockMap::new();
        assert_eq!(match_trap(&mutex_user(1), 5, &map), None);
    }

    #[test]
    fn test_rendezvous_phases() {
        let map = LockMap::new();
        let p = Pcb::new(Pid(1), ProcType::Producer, 400, 0).with_traps(TrapPlan::Rendezvous {
            triggers: rendezvous_triggers(),
            channel: ChannelId(3),
        });
        assert_eq!(match_trap(&p, 68, &map), Some(Trap::RendezvousAcquire(ChannelId(3))));
        assert_eq!(match_trap(&p, 69, &map), Some(Trap::RendezvousBody(ChannelId(3))));
        assert_eq!(match_trap(&p, 70, &map), Some(Trap::RendezvousRelease(ChannelId(3))));
        assert_eq!(match_trap(&p, 0, &map), None);
    }

    #[test]
    fn test_io_device_order() {
        let map = LockMap::new();
        let p = Pcb::new(Pid(1), ProcType::IoBound, 400, 3).with_traps(TrapPlan::Io(vec![
            TriggerSet::new([3, 9]),
            TriggerSet::new([12]),
        ]));
        assert_eq!(match_trap(&p, 9, &map), Some(Trap::Io(DeviceId(0))));
        assert_eq!(match_trap(&p, 12, &map), Some(Trap::Io(DeviceId(1))));
        assert_eq!(match_trap(&p, 10, &map), None);
    }

    #[test]
    fn test_compute_bound_never_traps() {
        let map = LockMap::new();
        let p = Pcb::new(Pid(1), ProcType::ComputeBound, 400, 3);
        assert!((0..400).all(|pc| match_trap(&p, pc, &map).is_none()));
    }
}
