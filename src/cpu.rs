// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The virtual CPU: one tick of execution, trap handling and the two
//! interrupt entry points.
//!
//! All three entry points take the critical section by value and hand it
//! back, so the dispatcher can give it up at its checkpoints.

use std::ops::DerefMut;

use log::debug;

use crate::condvar::{Role, Signal};
use crate::lock::{Acquire, MutexLock};
use crate::pcb::{Pcb, ProcState};
use crate::sched::{run_scheduler, Event, Gate, NoGate, SchedState};
use crate::trace::TraceKind;
use crate::trap::{match_trap, Trap};
use crate::types::{ChannelId, DeviceId, LockId, Pid};

/// Execute one CPU cycle.
pub fn tick<G, A>(mut cpu: G, gate: &A) -> G
where
    G: DerefMut<Target = SchedState>,
    A: Gate<G> + ?Sized,
{
    cpu.iteration += 1;
    cpu.cycles_since_reset += 1;
    if cpu.iteration >= cpu.cfg.iterations {
        cpu.executing = false;
    }

    let Some(pid) = cpu.running_pid() else {
        // Idle ticks count toward the scan: a parked pair dispatches nothing.
        cpu.since_check += 1;
        cpu.maybe_check_deadlock();
        return run_scheduler(cpu, gate, Event::New);
    };

    cpu.advance_pc();
    cpu.maybe_check_deadlock();

    if let Some(trap) = cpu.pending_trap() {
        cpu = handle_trap(cpu, gate, trap);
    }

    if cpu.running_pid() == Some(pid) && cpu.zombify_running() {
        cpu = run_scheduler(cpu, gate, Event::Terminate);
    }
    cpu
}

/// Timer interrupt: the running process has used up its quantum.
pub fn timer_interrupt<G, A>(mut cpu: G, gate: &A) -> G
where
    G: DerefMut<Target = SchedState>,
    A: Gate<G> + ?Sized,
{
    let pc = cpu.cpu_pc;
    let pid = cpu.running.as_mut().map(|p| {
        p.state = ProcState::Interrupted;
        p.context.pc = pc;
        p.pid()
    });
    cpu.event(TraceKind::TimerInterrupt { pid });
    run_scheduler(cpu, gate, Event::Timer)
}

/// I/O interrupt: the request at the head of `device` finished.
pub fn io_interrupt<G, A>(mut cpu: G, gate: &A, device: DeviceId) -> G
where
    G: DerefMut<Target = SchedState>,
    A: Gate<G> + ?Sized,
{
    if cpu.complete_io(device).is_some() {
        cpu = run_scheduler(cpu, gate, Event::IoCompletion);
    }
    cpu
}

fn handle_trap<G, A>(mut cpu: G, gate: &A, trap: Trap) -> G
where
    G: DerefMut<Target = SchedState>,
    A: Gate<G> + ?Sized,
{
    cpu.metrics.trap(&trap);
    let event = match trap {
        Trap::Io(device) => {
            if cpu.start_io(device) {
                gate.notify_device(device);
                Some(Event::IoTrap)
            } else {
                None
            }
        }
        Trap::Lock(lock) => cpu.mutex_lock(lock).then_some(Event::LockTrap),
        Trap::Unlock(lock) | Trap::TryUnlock(lock) => {
            cpu.mutex_unlock(lock);
            None
        }
        Trap::TryLock(lock) => {
            cpu.mutex_trylock(lock);
            None
        }
        Trap::RendezvousAcquire(channel) => cpu.channel_lock(channel).then_some(Event::RendezvousTrap),
        Trap::RendezvousBody(channel) => cpu.rendezvous(channel).then_some(Event::RendezvousTrap),
        Trap::RendezvousRelease(channel) => {
            cpu.channel_unlock(channel);
            None
        }
    };
    match event {
        Some(event) => run_scheduler(cpu, gate, event),
        None => cpu,
    }
}

/// Take `lock` for `pcb` or park it on the lock. Returns the record when
/// it got the lock.
fn acquire_or_park(lock: &mut MutexLock, pcb: Pcb) -> Option<Pcb> {
    match lock.acquire(pcb) {
        Acquire::Acquired(pcb) => Some(pcb),
        Acquire::Blocked => None,
    }
}

impl SchedState {
    /// Single-threaded tick.
    pub fn tick(&mut self) {
        tick(&mut *self, &NoGate);
    }

    pub fn timer_interrupt(&mut self) {
        timer_interrupt(&mut *self, &NoGate);
    }

    pub fn io_interrupt(&mut self, device: DeviceId) {
        io_interrupt(&mut *self, &NoGate, device);
    }

    fn advance_pc(&mut self) {
        let Some(pcb) = self.running.as_mut() else {
            return;
        };
        self.cpu_pc += 1;
        if self.cpu_pc > pcb.max_pc {
            self.cpu_pc = 0;
            pcb.overflow_count += 1;
        }
    }

    fn pending_trap(&self) -> Option<Trap> {
        let pcb = self.running.as_ref()?;
        match_trap(pcb, self.cpu_pc, &self.lock_map)
    }

    fn maybe_check_deadlock(&mut self) {
        if self.since_check >= self.cfg.deadlock_check_interval {
            self.check_deadlock();
        }
    }

    fn check_deadlock(&mut self) {
        self.since_check = 0;
        let found = self.monitor.scan(&self.lock_map, &self.locks);
        for d in found {
            if d.first_seen {
                self.metrics.deadlocks.increment(1);
                self.event(TraceKind::DeadlockDetected {
                    p1: d.p1,
                    p2: d.p2,
                    locks: (d.held_by_p1, d.held_by_p2),
                });
            } else {
                debug!("pids {} and {} still deadlocked", d.p1, d.p2);
            }
        }
    }

    /// Park the running process on `device`. The request completes at the
    /// pc after the trap point.
    fn start_io(&mut self, device: DeviceId) -> bool {
        if device.0 >= self.devices.len() {
            return false;
        }
        let Some(pcb) = self.deschedule(self.cpu_pc, ProcState::Blocked) else {
            return false;
        };
        let countdown = self.io_countdown(pcb.priority());
        let dev = &mut self.devices[device.0];
        if dev.queue.is_empty() {
            dev.countdown = countdown;
        }
        let pid = pcb.pid();
        dev.queue.enqueue(pcb);
        self.event(TraceKind::IoTrap {
            pid,
            device,
            countdown,
        });
        true
    }

    /// Move the head of `device` back to the ready queue.
    pub(crate) fn complete_io(&mut self, device: DeviceId) -> Option<Pid> {
        let mut pcb = self.devices.get_mut(device.0)?.queue.dequeue()?;
        pcb.context.pc += 1;
        let pid = pcb.pid();
        self.ready.enqueue(pcb);

        let next = self.devices[device.0].queue.peek().map(|p| p.priority());
        let countdown = match next {
            Some(priority) => self.io_countdown(priority),
            None => 0,
        };
        self.devices[device.0].countdown = countdown;

        self.stats.io_completions += 1;
        self.metrics.io_completions.increment(1);
        self.event(TraceKind::IoCompleted { pid, device });
        Some(pid)
    }

    /// Returns true when the running process blocked.
    fn mutex_lock(&mut self, id: LockId) -> bool {
        let Some(mut pcb) = self.running.take() else {
            return false;
        };
        let pid = pcb.pid();
        let Some(lock) = self.locks.get_mut(id) else {
            debug!("pid {} hit a lock trigger for missing lock {}", pid, id);
            self.running = Some(pcb);
            return false;
        };
        let holder = lock.holder();
        pcb.context.pc = self.cpu_pc.saturating_sub(1);
        match acquire_or_park(lock, pcb) {
            Some(pcb) => {
                self.running = Some(pcb);
                self.event(TraceKind::LockAcquired { pid, lock: id });
                false
            }
            None => {
                self.event(TraceKind::LockBlocked { pid, lock: id, holder });
                true
            }
        }
    }

    fn mutex_unlock(&mut self, id: LockId) {
        let Some(pid) = self.running_pid() else {
            return;
        };
        let strict = self.cfg.strict_unlock;
        let Some(lock) = self.locks.get_mut(id) else {
            return;
        };
        if strict && !lock.is_held_by(pid) {
            self.event(TraceKind::UnlockSkipped { pid, lock: id });
            return;
        }
        let released = lock.release(&mut self.ready);
        if released.previous.is_some() {
            self.event(TraceKind::LockReleased {
                pid,
                lock: id,
                woken: released.woken,
            });
        }
    }

    fn mutex_trylock(&mut self, id: LockId) {
        let Some(pid) = self.running_pid() else {
            return;
        };
        let Some(lock) = self.locks.get_mut(id) else {
            return;
        };
        let acquired = lock.try_acquire(pid);
        self.event(TraceKind::TryLock { pid, lock: id, acquired });
    }

    fn channel_lock(&mut self, id: ChannelId) -> bool {
        let Some(mut pcb) = self.running.take() else {
            return false;
        };
        let pid = pcb.pid();
        let Some(channel) = self.channels.get_mut(&id) else {
            self.running = Some(pcb);
            return false;
        };
        let lock_id = channel.lock.id();
        let holder = channel.lock.holder();
        pcb.context.pc = self.cpu_pc.saturating_sub(1);
        match acquire_or_park(&mut channel.lock, pcb) {
            Some(pcb) => {
                self.running = Some(pcb);
                debug!("pid {} entered channel {}", pid, id);
                false
            }
            None => {
                self.event(TraceKind::LockBlocked {
                    pid,
                    lock: lock_id,
                    holder,
                });
                true
            }
        }
    }

    fn channel_unlock(&mut self, id: ChannelId) {
        let Some(pid) = self.running_pid() else {
            return;
        };
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        let released = channel.lock.release(&mut self.ready);
        if released.woken > 0 {
            debug!("pid {} left channel {}, woke {}", pid, id, released.woken);
        }
    }

    /// Produce into or consume from the channel. Returns true when the
    /// running process had to wait.
    fn rendezvous(&mut self, id: ChannelId) -> bool {
        let Some((pid, role)) = self
            .running
            .as_ref()
            .and_then(|p| Role::of(p.proc_type()).map(|role| (p.pid(), role)))
        else {
            return false;
        };
        let Some(channel) = self.channels.get_mut(&id) else {
            return false;
        };

        if channel.must_wait(role) {
            // Resume two cycles back so the lock is re-taken and the
            // condition checked again.
            let Some(mut pcb) = self.running.take() else {
                return false;
            };
            pcb.context.pc = self.cpu_pc.saturating_sub(2);
            channel.wait(role, pcb, &mut self.ready);
            self.event(TraceKind::CondWait { pid, channel: id });
            return true;
        }

        let (value, signal) = match role {
            Role::Producer => channel.produce(pid, &mut self.ready),
            Role::Consumer => channel.consume(pid, &mut self.ready),
        };
        let kind = match role {
            Role::Producer => TraceKind::Produced { pid, channel: id, value },
            Role::Consumer => TraceKind::Consumed { pid, channel: id, value },
        };
        self.event(kind);
        let woken = match signal {
            Signal::NoWaiters => None,
            Signal::Woken { pid, .. } => Some(pid),
        };
        self.event(TraceKind::CondSignal { pid, channel: id, woken });
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::pcb::ProcType;
    use crate::workload::{NoWorkload, ProcSpec, ScriptedWorkload};

    fn state(batch: Vec<ProcSpec>) -> SchedState {
        let cfg = SimConfig {
            record_trace: true,
            seed: Some(3),
            ..Default::default()
        };
        let mut s = SchedState::new(cfg, Box::new(ScriptedWorkload::new([batch])));
        s.boot();
        s
    }

    #[test]
    fn test_empty_tick_leaves_queues_empty() {
        let mut s = SchedState::new(SimConfig::default(), Box::new(NoWorkload));
        s.boot();
        s.tick();
        assert!(s.ready().is_empty());
        assert!(s.new_queue().is_empty());
        assert!(s.running().is_none());
        assert_eq!(s.iteration(), 1);
    }

    #[test]
    fn test_overflow_after_max_pc_plus_one_ticks() {
        let mut s = state(vec![ProcSpec::Compute {
            max_pc: 10,
            terminate_after: 0,
        }]);
        s.tick();
        assert_eq!(s.running_pid(), Some(Pid(0)));
        for _ in 0..10 {
            s.tick();
        }
        assert_eq!(s.running().map(|p| p.overflow_count), Some(0));
        s.tick();
        assert_eq!(s.running().map(|p| p.overflow_count), Some(1));
        assert_eq!(s.cpu_pc(), 0);
    }

    #[test]
    fn test_terminates_after_overflows() {
        let mut s = state(vec![ProcSpec::Compute {
            max_pc: 3,
            terminate_after: 2,
        }]);
        s.tick();
        for _ in 0..8 {
            s.tick();
        }
        assert!(s.running().is_none());
        assert_eq!(s.zombies().len(), 1);
        assert_eq!(s.census().tally(ProcType::ComputeBound).terminated, 1);
    }

    #[test]
    fn test_io_trap_round_trip() {
        let mut s = state(vec![ProcSpec::Io {
            max_pc: 50,
            terminate_after: 0,
            traps: vec![vec![3], vec![]],
        }]);
        s.tick();
        for _ in 0..3 {
            s.tick();
        }
        assert!(s.running().is_none());
        let dev = s.device(DeviceId(0)).unwrap();
        assert_eq!(dev.queue.len(), 1);
        assert!(dev.countdown >= 15 && dev.countdown < 115);

        s.io_interrupt(DeviceId(0));
        assert_eq!(s.running_pid(), Some(Pid(0)));
        assert_eq!(s.cpu_pc(), 4);
        assert!(s.device(DeviceId(0)).unwrap().queue.is_empty());
    }

    #[test]
    fn test_timer_interrupt_requeues_running() {
        let mut s = state(vec![
            ProcSpec::Compute {
                max_pc: 50,
                terminate_after: 0,
            },
            ProcSpec::Compute {
                max_pc: 50,
                terminate_after: 0,
            },
        ]);
        s.tick();
        s.tick();
        s.timer_interrupt();
        assert_eq!(s.running_pid(), Some(Pid(1)));
        let p0 = s.ready().peek().map(|p| (p.pid(), p.context.pc, p.state));
        assert_eq!(p0, Some((Pid(0), 1, ProcState::Ready)));
    }

    #[test]
    fn test_lock_then_unlock() {
        let mut s = state(vec![ProcSpec::MutexPair {
            max_pc: 100,
            reversed: false,
        }]);
        s.tick();
        for _ in 0..6 {
            s.tick();
        }
        let locks: Vec<Option<Pid>> = s.locks().iter().map(|l| l.holder()).collect();
        assert_eq!(locks, vec![Some(Pid(0)), Some(Pid(0))]);
        for _ in 0..9 {
            s.tick();
        }
        assert_eq!(s.cpu_pc(), 15);
        assert!(s.locks().iter().all(|l| l.holder().is_none()));
    }

    #[test]
    fn test_producer_then_consumer_exchange() {
        let mut s = state(vec![ProcSpec::RendezvousPair { max_pc: 400 }]);
        s.tick();
        assert_eq!(s.running_pid(), Some(Pid(0)));
        for _ in 0..70 {
            s.tick();
        }
        let ch = s.channel(ChannelId(0)).unwrap();
        assert!(ch.full);
        assert_eq!(ch.counter, 1);
        assert!(ch.lock.holder().is_none());

        s.timer_interrupt();
        assert_eq!(s.running_pid(), Some(Pid(1)));
        for _ in 0..70 {
            s.tick();
        }
        let ch = s.channel(ChannelId(0)).unwrap();
        assert!(!ch.full);
        assert!(ch.lock.holder().is_none());
        assert_eq!(s.trace().count(|k| matches!(k, TraceKind::Consumed { value: 1, .. })), 1);
        assert_eq!(
            s.trace().count(|k| matches!(k, TraceKind::CondSignal { pid: Pid(1), woken: None, .. })),
            1
        );
    }

    #[test]
    fn test_blocked_lock_retries_trigger() {
        let mut s = state(vec![ProcSpec::MutexPair {
            max_pc: 100,
            reversed: false,
        }]);
        s.tick();
        for _ in 0..5 {
            s.tick();
        }
        // P0 holds the first lock from pc 5; P1 then blocks on it.
        s.timer_interrupt();
        assert_eq!(s.running_pid(), Some(Pid(1)));
        for _ in 0..5 {
            s.tick();
        }
        assert!(s.running_pid() != Some(Pid(1)));
        let waiter = s.locks().iter().find(|l| l.is_waiting(Pid(1)));
        let parked = waiter.and_then(|l| l.waiters().peek()).map(|p| p.context.pc);
        assert_eq!(parked, Some(4));
    }
}
