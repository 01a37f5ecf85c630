// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::info;
use metrics_exporter_prometheus::PrometheusBuilder;

use scx_procsim::Kernel;
use scx_procsim::RandomWorkload;
use scx_procsim::SimConfig;
use scx_procsim::WorkloadCaps;

/// scx_procsim: A multilevel feedback queue process scheduler simulation
///
/// A virtual CPU executes simulated processes chosen from sixteen priority
/// levels. A timer thread preempts the running process every quantum and
/// demotes it one level; every few hundred cycles all priorities are reset
/// to zero and a new batch of processes arrives.
///
/// The workload mixes I/O-bound processes that block on simulated devices
/// (each serviced by its own thread), compute-bound processes, pairs of
/// mutex users that take two shared locks (by default in opposite orders so
/// they can deadlock) and producer/consumer pairs that meet through a
/// one-slot channel guarded by a lock and two condition variables.
///
/// A deadlock monitor periodically checks the mutex pairs and reports each
/// deadlocked pair once. Deadlocks are not broken.
///
/// The run ends after the configured number of CPU iterations, or on
/// Ctrl-C, and prints per-category process counts.
#[derive(Debug, Parser)]
struct Opts {
    /// Number of CPU loop iterations to run.
    #[clap(short = 'n', long, default_value = "1000000")]
    iterations: u64,

    /// Timer interrupt interval in milliseconds.
    #[clap(short = 't', long, default_value = "10")]
    timer_interval_ms: u64,

    /// Wall time per unit of I/O countdown in microseconds.
    #[clap(long, default_value = "1")]
    io_tick_us: u64,

    /// Number of simulated I/O devices. At least 2.
    #[clap(short = 'd', long, default_value = "2")]
    io_devices: usize,

    /// Quantum of priority level 0 in CPU cycles.
    #[clap(long, default_value = "5")]
    quantum_base: u32,

    /// Quantum increase per priority level in CPU cycles.
    #[clap(long, default_value = "8")]
    quantum_step: u32,

    /// Priorities are reset every this many middle-level quanta.
    #[clap(long, default_value = "8")]
    reset_multiple: u32,

    /// Dispatches between deadlock scans.
    #[clap(short = 'D', long, default_value = "10")]
    deadlock_interval: u64,

    /// Terminated processes are freed in batches of at least this size.
    #[clap(short = 'z', long, default_value = "4")]
    zombie_threshold: usize,

    /// Give both members of each mutex pair the same lock order, so they
    /// cannot deadlock.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_deadlock: bool,

    /// Ignore unlock triggers for locks the running process does not hold.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    strict_unlock: bool,

    /// Upper bound (exclusive) on processes considered per arrival batch.
    #[clap(short = 'b', long, default_value = "40")]
    max_batch: u32,

    /// Maximum live I/O-bound processes.
    #[clap(long, default_value = "50")]
    max_io: u64,

    /// Maximum live compute-bound processes.
    #[clap(long, default_value = "25")]
    max_compute: u64,

    /// Maximum mutex users created over the run.
    #[clap(long, default_value = "50")]
    max_mutex: u64,

    /// Maximum producer/consumer pairs created over the run.
    #[clap(long, default_value = "10")]
    max_pairs: u64,

    /// Seed for the workload and I/O timing. Random if not given.
    #[clap(short = 's', long)]
    seed: Option<u64>,

    /// Record every scheduler event and dump the trace to stderr at exit.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    trace: bool,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable the Prometheus endpoint for metrics on port 9000.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    enable_prometheus: bool,
}

impl Opts {
    fn sim_config(&self) -> SimConfig {
        SimConfig {
            iterations: self.iterations,
            timer_interval: Duration::from_millis(self.timer_interval_ms),
            io_tick: Duration::from_micros(self.io_tick_us),
            io_devices: self.io_devices,
            priority_zero_time: self.quantum_base,
            per_priority_time_increase: self.quantum_step,
            s_multiple: self.reset_multiple,
            deadlock_check_interval: self.deadlock_interval,
            zombie_threshold: self.zombie_threshold,
            build_deadlock: !self.no_deadlock,
            strict_unlock: self.strict_unlock,
            max_batch: self.max_batch,
            caps: WorkloadCaps {
                io_live: self.max_io,
                compute_live: self.max_compute,
                mutex_created: self.max_mutex,
                rendezvous_pairs: self.max_pairs,
            },
            seed: self.seed,
            record_trace: self.trace,
        }
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    if opts.enable_prometheus {
        info!("Enabling Prometheus endpoint: http://localhost:9000");
        PrometheusBuilder::new()
            .install()
            .context("failed to install Prometheus recorder")?;
    }

    let cfg = opts.sim_config();
    let workload = RandomWorkload::new(&cfg);
    let kernel = Kernel::new(cfg, Box::new(workload))?;
    info!(
        "running {} iterations, priority reset every {} cycles",
        opts.iterations,
        kernel.lock_state().config().reset_interval()
    );

    let stats = kernel.run(shutdown)?;

    if opts.trace {
        kernel.lock_state().trace().dump();
    }
    let mut out = std::io::stdout().lock();
    stats.format(&mut out)?;
    out.flush()?;

    if stats.interrupted {
        std::process::exit(1);
    }
    Ok(())
}
