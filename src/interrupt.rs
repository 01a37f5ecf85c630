// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Threaded kernel: the CPU loop plus timer and I/O device threads sharing
//! one [`SchedState`] behind a mutex.
//!
//! Interrupt sources announce themselves on the [`Arbiter`] before taking
//! the lock. The dispatcher's checkpoints consult the arbiter and step
//! aside while a source they must yield to is in flight:
//!
//! - every event except the timer's own yields to the timer
//! - I/O, lock and rendezvous traps also yield to I/O completions
//!
//! A source clears its flag while it still holds the lock and wakes the
//! waiters after letting go.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::TryLockError;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::info;

use crate::config::SimConfig;
use crate::cpu;
use crate::sched::{Event, Gate, SchedState};
use crate::stats::RunStats;
use crate::types::DeviceId;
use crate::workload::Workload;

/// Ordering rule between the CPU loop and the interrupt sources.
#[derive(Debug)]
pub struct Arbiter {
    timer_pending: AtomicBool,
    io_in_flight: AtomicUsize,
    handoff: Condvar,
    devices: Vec<Condvar>,
}

impl Arbiter {
    fn new(nr_devices: usize) -> Self {
        Self {
            timer_pending: AtomicBool::new(false),
            io_in_flight: AtomicUsize::new(0),
            handoff: Condvar::new(),
            devices: (0..nr_devices).map(|_| Condvar::new()).collect(),
        }
    }

    fn must_defer(&self, event: Event) -> bool {
        if event.yields_to_timer() && self.timer_pending.load(Ordering::SeqCst) {
            return true;
        }
        event.yields_to_io() && self.io_in_flight.load(Ordering::SeqCst) > 0
    }

    /// Whether any interrupt source is waiting for the section.
    pub fn pending(&self) -> bool {
        self.timer_pending.load(Ordering::SeqCst) || self.io_in_flight.load(Ordering::SeqCst) > 0
    }
}

impl<'a> Gate<MutexGuard<'a, SchedState>> for Arbiter {
    fn checkpoint(&self, section: MutexGuard<'a, SchedState>, event: Event) -> MutexGuard<'a, SchedState> {
        if !self.must_defer(event) {
            return section;
        }
        self.handoff
            .wait_while(section, |_| self.must_defer(event))
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_device(&self, device: DeviceId) {
        if let Some(cv) = self.devices.get(device.0) {
            cv.notify_one();
        }
    }
}

pub struct Kernel {
    state: Mutex<SchedState>,
    arbiter: Arbiter,
    stop: (Mutex<bool>, Condvar),
    timer_interval: Duration,
    io_tick: Duration,
}

impl Kernel {
    pub fn new(cfg: SimConfig, workload: Box<dyn Workload>) -> Result<Arc<Self>> {
        cfg.validate().context("invalid simulation config")?;
        let arbiter = Arbiter::new(cfg.io_devices);
        let timer_interval = cfg.timer_interval;
        let io_tick = cfg.io_tick;
        Ok(Arc::new(Self {
            state: Mutex::new(SchedState::new(cfg, workload)),
            arbiter,
            stop: (Mutex::new(false), Condvar::new()),
            timer_interval,
            io_tick,
        }))
    }

    pub fn lock_state(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run until the iteration cap or until `shutdown` is raised.
    pub fn run(self: &Arc<Self>, shutdown: Arc<AtomicBool>) -> Result<RunStats> {
        self.lock_state().boot();

        let mut handles: Vec<JoinHandle<()>> = vec![];
        let kernel = self.clone();
        handles.push(
            thread::Builder::new()
                .name("timer".into())
                .spawn(move || kernel.timer_loop())
                .context("failed to spawn timer thread")?,
        );
        for d in 0..self.arbiter.devices.len() {
            let kernel = self.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("io{}", d))
                    .spawn(move || kernel.device_loop(DeviceId(d)))
                    .with_context(|| format!("failed to spawn I/O device {} thread", d))?,
            );
        }
        info!("started timer and {} I/O device threads", self.arbiter.devices.len());

        let interrupted = self.cpu_loop(&shutdown);
        self.stop_sources();

        for handle in handles {
            handle.join().map_err(|_| anyhow!("interrupt thread panicked"))?;
        }
        Ok(self.lock_state().stats(interrupted))
    }

    /// Returns true when stopped by `shutdown` rather than the iteration cap.
    fn cpu_loop(&self, shutdown: &AtomicBool) -> bool {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return self.lock_state().executing();
            }
            if self.arbiter.pending() {
                thread::yield_now();
                continue;
            }
            let section = match self.state.try_lock() {
                Ok(section) => section,
                Err(TryLockError::WouldBlock) => {
                    thread::yield_now();
                    continue;
                }
                Err(TryLockError::Poisoned(e)) => e.into_inner(),
            };
            let section = cpu::tick(section, &self.arbiter);
            if !section.executing() {
                return false;
            }
        }
    }

    fn stop_sources(&self) {
        self.lock_state().executing = false;
        let (lock, cv) = &self.stop;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cv.notify_all();
        for cv in &self.arbiter.devices {
            cv.notify_all();
        }
    }

    fn timer_loop(&self) {
        let (lock, cv) = &self.stop;
        loop {
            {
                let stopped = lock.lock().unwrap_or_else(PoisonError::into_inner);
                let (stopped, _) = cv
                    .wait_timeout_while(stopped, self.timer_interval, |stopped| !*stopped)
                    .unwrap_or_else(PoisonError::into_inner);
                if *stopped {
                    break;
                }
            }

            self.arbiter.timer_pending.store(true, Ordering::SeqCst);
            let section = self.lock_state();
            let section = cpu::timer_interrupt(section, &self.arbiter);
            let executing = section.executing();
            self.arbiter.timer_pending.store(false, Ordering::SeqCst);
            drop(section);
            self.arbiter.handoff.notify_all();
            if !executing {
                break;
            }
        }
        debug!("timer thread exiting");
    }

    fn device_loop(&self, device: DeviceId) {
        let cv = &self.arbiter.devices[device.0];
        loop {
            let section = self.lock_state();
            let section = cv
                .wait_while(section, |s| s.executing() && s.device_idle(device))
                .unwrap_or_else(PoisonError::into_inner);
            if section.device_idle(device) {
                break;
            }
            let countdown = section.device(device).map_or(0, |d| d.countdown);
            drop(section);

            thread::sleep(self.io_tick.saturating_mul(countdown));

            self.arbiter.io_in_flight.fetch_add(1, Ordering::SeqCst);
            let section = self.lock_state();
            let section = cpu::io_interrupt(section, &self.arbiter, device);
            self.arbiter.io_in_flight.fetch_sub(1, Ordering::SeqCst);
            drop(section);
            self.arbiter.handoff.notify_all();
        }
        debug!("I/O device {} thread exiting", device);
    }
}
