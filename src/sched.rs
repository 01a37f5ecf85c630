// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Scheduler state and the dispatcher.
//!
//! [`SchedState`] owns every process record and queue in the system. It is
//! touched only from inside the primary critical section, which is either
//! a plain `&mut SchedState` (single-threaded runs) or a `MutexGuard`
//! shared by the CPU loop and the interrupt threads.
//!
//! The dispatcher is a fixed sequence of [`SchedStep`]s. Before each step
//! the caller's [`Gate`] gets a chance to hand the section to a pending
//! interrupt source, which is how the timer and I/O completions get
//! precedence over CPU-originated work.

use std::collections::BTreeMap;
use std::ops::DerefMut;
use std::time::SystemTime;

use log::debug;
use log::log;
use log::log_enabled;
use log::Level;
use rand::rngs::SmallRng;
use rand::Rng;
use rand::SeedableRng;

use crate::condvar::Channel;
use crate::config::SimConfig;
use crate::fifo::FifoQueue;
use crate::lock::LockTable;
use crate::lock_map::{DeadlockMonitor, LockMap};
use crate::pcb::{Pcb, ProcState};
use crate::ready_queue::ReadyQueue;
use crate::stats::{Census, Metrics, RunStats};
use crate::trace::{Trace, TraceKind};
use crate::types::{ChannelId, DeviceId, Pid, PidAllocator, Priority};
use crate::workload::{Arrival, Workload};

/// Why the dispatcher is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Nothing is running.
    New,
    Timer,
    IoCompletion,
    Terminate,
    IoTrap,
    LockTrap,
    RendezvousTrap,
}

impl Event {
    /// Whether this invocation must let an in-flight timer go first.
    pub fn yields_to_timer(self) -> bool {
        self != Event::Timer
    }

    /// Whether this invocation must let an in-flight I/O completion go
    /// first.
    pub fn yields_to_io(self) -> bool {
        matches!(self, Event::IoTrap | Event::LockTrap | Event::RendezvousTrap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedStep {
    PriorityReset,
    AdmitNew,
    Preempt,
    Dispatch,
    ReapZombies,
}

impl SchedStep {
    pub const ALL: [SchedStep; 5] = [
        SchedStep::PriorityReset,
        SchedStep::AdmitNew,
        SchedStep::Preempt,
        SchedStep::Dispatch,
        SchedStep::ReapZombies,
    ];
}

/// Deferral point between dispatcher steps.
///
/// `G` is the handle to the primary critical section. A gate may release
/// and re-acquire it before handing it back.
pub trait Gate<G> {
    fn checkpoint(&self, section: G, event: Event) -> G;

    /// A request was queued on `device`.
    fn notify_device(&self, device: DeviceId);
}

/// Gate for single-threaded runs: never defers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGate;

impl<'a> Gate<&'a mut SchedState> for NoGate {
    fn checkpoint(&self, section: &'a mut SchedState, _event: Event) -> &'a mut SchedState {
        section
    }

    fn notify_device(&self, _device: DeviceId) {}
}

/// Run every dispatcher step for `event`.
pub fn run_scheduler<G, A>(mut section: G, gate: &A, event: Event) -> G
where
    G: DerefMut<Target = SchedState>,
    A: Gate<G> + ?Sized,
{
    for step in SchedStep::ALL {
        section = gate.checkpoint(section, event);
        section.step(step, event);
    }
    section
}

/// An I/O device: FIFO of blocked processes and the countdown of the one
/// at the head.
#[derive(Debug, Default)]
pub struct IoDevice {
    pub queue: FifoQueue,
    pub countdown: u32,
}

#[derive(Debug)]
pub struct SchedState {
    pub(crate) cfg: SimConfig,
    pub(crate) running: Option<Pcb>,
    /// Program counter of the virtual CPU.
    pub(crate) cpu_pc: u32,
    /// Slot the dispatcher restores the pc through.
    pub(crate) sys_stack: u32,
    pub(crate) cycles_since_reset: u64,
    /// Dispatches and idle ticks since the last deadlock scan.
    pub(crate) since_check: u64,
    pub(crate) new_procs: FifoQueue,
    pub(crate) ready: ReadyQueue,
    pub(crate) zombies: FifoQueue,
    pub(crate) devices: Vec<IoDevice>,
    pub(crate) locks: LockTable,
    pub(crate) channels: BTreeMap<ChannelId, Channel>,
    next_channel: u32,
    pub(crate) lock_map: LockMap,
    pub(crate) monitor: DeadlockMonitor,
    pub(crate) executing: bool,
    pub(crate) iteration: u64,
    pids: PidAllocator,
    workload: Box<dyn Workload>,
    pub(crate) rng: SmallRng,
    pub(crate) stats: RunStats,
    trace: Trace,
    pub(crate) metrics: Metrics,
}

impl std::fmt::Debug for dyn Workload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Workload")
    }
}

impl SchedState {
    pub fn new(cfg: SimConfig, workload: Box<dyn Workload>) -> Self {
        let rng = match cfg.seed {
            Some(seed) => SmallRng::seed_from_u64(seed.wrapping_add(1)),
            None => SmallRng::from_entropy(),
        };
        let devices = (0..cfg.io_devices).map(|_| IoDevice::default()).collect();
        Self {
            cfg,
            running: None,
            cpu_pc: 0,
            sys_stack: 0,
            cycles_since_reset: 0,
            since_check: 0,
            new_procs: FifoQueue::new(),
            ready: ReadyQueue::new(),
            zombies: FifoQueue::new(),
            devices,
            locks: LockTable::new(),
            channels: BTreeMap::new(),
            next_channel: 0,
            lock_map: LockMap::new(),
            monitor: DeadlockMonitor::new(),
            executing: true,
            iteration: 0,
            pids: PidAllocator::new(),
            workload,
            rng,
            stats: RunStats::default(),
            trace: Trace::new(),
            metrics: Metrics::new(),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.cfg
    }

    pub fn running(&self) -> Option<&Pcb> {
        self.running.as_ref()
    }

    pub fn running_pid(&self) -> Option<Pid> {
        self.running.as_ref().map(|p| p.pid())
    }

    pub fn cpu_pc(&self) -> u32 {
        self.cpu_pc
    }

    pub fn ready(&self) -> &ReadyQueue {
        &self.ready
    }

    pub fn new_queue(&self) -> &FifoQueue {
        &self.new_procs
    }

    pub fn zombies(&self) -> &FifoQueue {
        &self.zombies
    }

    pub fn device(&self, device: DeviceId) -> Option<&IoDevice> {
        self.devices.get(device.0)
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn lock_map(&self) -> &LockMap {
        &self.lock_map
    }

    pub fn monitor(&self) -> &DeadlockMonitor {
        &self.monitor
    }

    pub fn census(&self) -> &Census {
        &self.stats.census
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn executing(&self) -> bool {
        self.executing
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn cycles_since_reset(&self) -> u64 {
        self.cycles_since_reset
    }

    pub(crate) fn device_idle(&self, device: DeviceId) -> bool {
        self.devices.get(device.0).map_or(true, |d| d.queue.is_empty())
    }

    /// Snapshot of the run so far.
    pub fn stats(&self, interrupted: bool) -> RunStats {
        let mut stats = self.stats.clone();
        stats.iterations = self.iteration;
        stats.deadlock = self.monitor.deadlocked();
        stats.deadlocked_pairs = self.monitor.distinct();
        stats.interrupted = interrupted;
        stats
    }

    /// Record a scheduler event: log it, count it and keep it in the trace
    /// if recording is on.
    pub(crate) fn event(&mut self, kind: TraceKind) {
        log!(kind.level(), "{}", kind);
        self.metrics.event(kind.label());
        if self.cfg.record_trace {
            self.trace.record(self.iteration, kind);
        }
    }

    /// Admit the first batch of arrivals.
    pub fn boot(&mut self) {
        let admitted = self.admit();
        debug!("boot: admitted {} processes", admitted);
    }

    /// Ask the workload for a batch and place it on the new queue.
    pub fn admit(&mut self) -> usize {
        let batch = self.workload.arrivals(&mut self.pids, &self.stats.census);
        let mut admitted = 0;
        for arrival in batch {
            admitted += arrival.len();
            match arrival {
                Arrival::Single(pcb) => self.admit_one(pcb),
                Arrival::MutexPair {
                    first,
                    second,
                    reversed,
                } => {
                    let a = self.locks.create();
                    let b = self.locks.create();
                    self.lock_map.add_pair(first.pid(), second.pid(), a, b, reversed);
                    self.admit_one(first);
                    self.admit_one(second);
                }
                Arrival::RendezvousPair {
                    mut producer,
                    mut consumer,
                } => {
                    let id = ChannelId(self.next_channel);
                    self.next_channel += 1;
                    producer.bind_channel(id);
                    consumer.bind_channel(id);
                    let lock = self.locks.reserve();
                    self.channels
                        .insert(id, Channel::new(lock, producer.pid(), consumer.pid()));
                    self.admit_one(producer);
                    self.admit_one(consumer);
                }
            }
        }
        admitted
    }

    fn admit_one(&mut self, mut pcb: Pcb) {
        pcb.state = ProcState::New;
        self.stats.census.note_created(pcb.proc_type());
        self.event(TraceKind::Admitted {
            pid: pcb.pid(),
            proc_type: pcb.proc_type(),
        });
        self.new_procs.enqueue(pcb);
    }

    /// Run one dispatcher step.
    pub fn step(&mut self, step: SchedStep, event: Event) {
        match step {
            SchedStep::PriorityReset => {
                if self.cycles_since_reset >= self.cfg.reset_interval() {
                    self.reset_priorities();
                }
            }
            SchedStep::AdmitNew => {
                for pcb in self.new_procs.drain() {
                    self.ready.enqueue(pcb);
                }
            }
            SchedStep::Preempt => {
                if event == Event::Timer {
                    self.preempt();
                }
            }
            SchedStep::Dispatch => {
                if self.running.is_none() {
                    self.dispatch();
                }
            }
            SchedStep::ReapZombies => {
                if self.zombies.len() >= self.cfg.zombie_threshold {
                    self.reap_zombies();
                }
            }
        }
    }

    /// Run the dispatcher without deferral.
    pub fn schedule(&mut self, event: Event) {
        run_scheduler(&mut *self, &NoGate, event);
    }

    fn reset_priorities(&mut self) {
        self.ready.reset_priorities();
        if let Some(pcb) = self.running.as_mut() {
            pcb.set_priority(Priority::HIGHEST.level());
        }
        self.cycles_since_reset = 0;
        let admitted = self.admit();
        self.stats.priority_resets += 1;
        self.metrics.priority_resets.increment(1);
        self.event(TraceKind::PrioritiesReset { admitted });
    }

    fn preempt(&mut self) {
        let Some(mut pcb) = self.running.take() else {
            return;
        };
        pcb.context.pc = self.cpu_pc;
        let demoted = pcb.priority().demoted();
        pcb.set_priority(demoted.level());
        self.stats.quantum_expiries += 1;
        self.metrics.quantum_expiries.increment(1);
        self.event(TraceKind::QuantumExpired {
            pid: pcb.pid(),
            priority: demoted,
        });
        self.ready.enqueue(pcb);
    }

    fn dispatch(&mut self) {
        let Some(mut pcb) = self.ready.dequeue() else {
            self.event(TraceKind::Idle);
            return;
        };
        pcb.state = ProcState::Running;
        self.sys_stack = pcb.context.pc;
        self.cpu_pc = self.sys_stack;
        self.since_check += 1;
        self.stats.dispatches += 1;
        self.metrics.dispatches.increment(1);
        self.metrics.ready_queue_len.set(self.ready.len() as f64);
        self.event(TraceKind::Dispatched {
            pid: pcb.pid(),
            priority: pcb.priority(),
            pc: self.cpu_pc,
        });
        self.running = Some(pcb);
        if log_enabled!(Level::Debug) {
            debug!("ready queues:\n{}", self.ready);
        }
    }

    /// Take the running process off the CPU, saving `resume_pc` as the
    /// point it continues from when next dispatched.
    pub(crate) fn deschedule(&mut self, resume_pc: u32, state: ProcState) -> Option<Pcb> {
        let mut pcb = self.running.take()?;
        pcb.context.pc = resume_pc;
        pcb.state = state;
        Some(pcb)
    }

    /// Move the running process to the zombie queue if it has finished.
    pub(crate) fn zombify_running(&mut self) -> bool {
        if !self.running.as_ref().map_or(false, |p| p.should_terminate()) {
            return false;
        }
        let Some(mut pcb) = self.deschedule(self.cpu_pc, ProcState::Terminated) else {
            return false;
        };
        pcb.terminated_at = Some(SystemTime::now());
        self.stats.census.note_terminated(pcb.proc_type());
        self.metrics.terminations.increment(1);
        self.event(TraceKind::Terminated {
            pid: pcb.pid(),
            proc_type: pcb.proc_type(),
        });
        self.zombies.enqueue(pcb);
        self.metrics.zombie_queue_len.set(self.zombies.len() as f64);
        true
    }

    fn reap_zombies(&mut self) {
        let reaped: Vec<Pcb> = self.zombies.drain().collect();
        let count = reaped.len();
        for pcb in reaped {
            if let Some((a, b)) = self.lock_map.retire(pcb.pid()) {
                for id in [a, b] {
                    if let Some(lock) = self.locks.remove(id) {
                        for waiter in lock.into_waiters().drain() {
                            self.ready.enqueue(waiter);
                        }
                    }
                }
            }
            if let Some(id) = pcb.channel() {
                let both_gone = self.channels.get_mut(&id).map_or(false, |c| c.retire(pcb.pid()));
                if both_gone {
                    self.channels.remove(&id);
                }
            }
        }
        self.metrics.zombie_queue_len.set(0.0);
        self.event(TraceKind::ZombiesFlushed { count });
    }

    /// I/O countdown for a request made at `priority`.
    pub(crate) fn io_countdown(&mut self, priority: Priority) -> u32 {
        self.cfg
            .quantum(priority.level())
            .saturating_add(10 + self.rng.gen_range(0..100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::{NoWorkload, ProcSpec, ScriptedWorkload};

    fn traced() -> SimConfig {
        SimConfig {
            record_trace: true,
            seed: Some(1),
            ..Default::default()
        }
    }

    fn compute(n: usize) -> ScriptedWorkload {
        ScriptedWorkload::new([vec![
            ProcSpec::Compute {
                max_pc: 100,
                terminate_after: 0,
            };
            n
        ]])
    }

    #[test]
    fn test_event_deferral_rules() {
        assert!(!Event::Timer.yields_to_timer());
        assert!(Event::IoCompletion.yields_to_timer());
        assert!(!Event::IoCompletion.yields_to_io());
        assert!(!Event::New.yields_to_io());
        assert!(Event::LockTrap.yields_to_io());
        assert!(Event::RendezvousTrap.yields_to_timer());
    }

    #[test]
    fn test_empty_schedule_is_idle() {
        let mut s = SchedState::new(traced(), Box::new(NoWorkload));
        s.boot();
        s.schedule(Event::New);
        assert!(s.running().is_none());
        assert!(s.ready().is_empty());
        assert_eq!(s.trace().count(|k| *k == TraceKind::Idle), 1);
    }

    #[test]
    fn test_dispatch_earliest_arrival() {
        let mut s = SchedState::new(traced(), Box::new(compute(3)));
        s.boot();
        assert_eq!(s.new_queue().len(), 3);
        s.schedule(Event::New);
        assert_eq!(s.running_pid(), Some(Pid(0)));
        assert_eq!(s.running().map(|p| p.state), Some(ProcState::Running));
        assert_eq!(s.ready().len(), 2);
        assert!(s.new_queue().is_empty());
    }

    #[test]
    fn test_timer_demotes_and_rotates() {
        let mut s = SchedState::new(traced(), Box::new(compute(2)));
        s.boot();
        s.schedule(Event::New);
        s.cpu_pc = 7;
        s.schedule(Event::Timer);

        assert_eq!(s.running_pid(), Some(Pid(1)));
        let parked = s.ready().peek().map(|p| (p.pid(), p.priority().level(), p.context.pc));
        assert_eq!(parked, Some((Pid(0), 1, 7)));
        assert_eq!(s.trace().demotions(Pid(0)), vec![Priority::clamped(1)]);
    }

    #[test]
    fn test_priority_reset_after_interval() {
        let mut s = SchedState::new(traced(), Box::new(compute(2)));
        s.boot();
        s.schedule(Event::New);
        s.schedule(Event::Timer);
        s.schedule(Event::Timer);
        assert!(s.ready().iter().all(|p| p.priority().level() == 1));

        s.cycles_since_reset = s.config().reset_interval();
        s.schedule(Event::New);
        assert_eq!(s.cycles_since_reset(), 0);
        assert_eq!(s.running().map(|p| p.priority()), Some(Priority::HIGHEST));
        assert!(s.ready().iter().all(|p| p.priority() == Priority::HIGHEST));
    }

    #[test]
    fn test_pairs_get_locks_and_channels() {
        let wl = ScriptedWorkload::new([vec![
            ProcSpec::MutexPair {
                max_pc: 100,
                reversed: true,
            },
            ProcSpec::RendezvousPair { max_pc: 400 },
        ]]);
        let mut s = SchedState::new(traced(), Box::new(wl));
        s.boot();
        assert_eq!(s.locks().len(), 2);
        assert_eq!(s.lock_map().partner(Pid(0)), Some(Pid(1)));
        let ch = s.channel(ChannelId(0)).map(|c| (c.producer, c.consumer));
        assert_eq!(ch, Some((Pid(2), Pid(3))));
        let chan_lock = s.channel(ChannelId(0)).map(|c| c.lock.id());
        assert_eq!(chan_lock, Some(crate::types::LockId(2)));
        assert!(s.locks().iter().all(|l| Some(l.id()) != chan_lock));
        assert_eq!(s.census().total_created(), 4);
    }

    #[test]
    fn test_zombies_flushed_at_threshold() {
        let mut s = SchedState::new(traced(), Box::new(NoWorkload));
        for pid in 0..3 {
            s.zombies.enqueue(Pcb::new(Pid(pid), crate::pcb::ProcType::ComputeBound, 10, 1));
        }
        s.schedule(Event::Terminate);
        assert_eq!(s.zombies().len(), 3);
        s.zombies.enqueue(Pcb::new(Pid(3), crate::pcb::ProcType::ComputeBound, 10, 1));
        s.schedule(Event::Terminate);
        assert!(s.zombies().is_empty());
        assert_eq!(s.trace().count(|k| *k == TraceKind::ZombiesFlushed { count: 4 }), 1);
    }

    #[test]
    fn test_reaping_both_mutex_users_frees_locks() {
        let wl = ScriptedWorkload::new([vec![ProcSpec::MutexPair {
            max_pc: 100,
            reversed: false,
        }]]);
        let cfg = SimConfig {
            zombie_threshold: 2,
            ..traced()
        };
        let mut s = SchedState::new(cfg, Box::new(wl));
        s.boot();
        for _ in 0..2 {
            s.schedule(Event::New);
            let mut pcb = s.running.take().unwrap();
            pcb.state = ProcState::Terminated;
            s.zombies.enqueue(pcb);
        }
        s.schedule(Event::Terminate);
        assert!(s.locks().is_empty());
        assert!(s.lock_map().is_empty());
    }
}
