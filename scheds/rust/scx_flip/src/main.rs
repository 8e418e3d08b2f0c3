// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use log::info;
use log::warn;
use scx_stats::prelude::*;

use scx_enclave::{Enclave, Gtid, Topology};
use scx_flip::agent::AgentDriver;
use scx_flip::scheduler::FlipScheduler;
use scx_flip::stats;
use scx_flip::SCHEDULER_NAME;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// scx_flip: userspace O(1) scheduler on a delegated-scheduling enclave
///
/// The kernel side is simulated in-process: a synthetic workload of
/// CPU-bound and interactive tasks is injected into the enclave and
/// scheduled by one agent thread per CPU, exactly as the scheduler would
/// run against a real delegating kernel.
///
/// Each agent drains its CPU's message channel, applies the task lifecycle
/// state machine, and commits the next task through a transactional run
/// request. Runnable tasks sit in a per-CPU dual-array runqueue whose
/// active and expired bands swap in O(1), giving every task a turn before
/// any slice is reused.
#[derive(Debug, Parser)]
struct Opts {
    /// Number of CPUs in the simulated enclave.
    #[clap(short = 'c', long, default_value = "4")]
    nr_cpus: u32,

    /// Number of CPU-bound tasks in the demo workload.
    #[clap(short = 'n', long, default_value = "8")]
    nr_workers: u32,

    /// Number of interactive (sleep/wake) tasks in the demo workload.
    #[clap(short = 'i', long, default_value = "2")]
    nr_interactive: u32,

    /// How long to run the demo workload, in seconds.
    #[clap(short = 'd', long, default_value = "5")]
    duration_s: u64,

    /// Tick interval in microseconds.
    #[clap(short = 't', long, default_value = "1000")]
    tick_us: u64,

    /// Enable verbose output; pass twice for per-agent chatter.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable stats monitoring with the specified interval.
    #[clap(long)]
    stats: Option<f64>,

    /// Run in stats monitoring mode with the specified interval. The
    /// scheduler is not launched.
    #[clap(long)]
    monitor: Option<f64>,

    /// Show descriptions for statistics.
    #[clap(long)]
    help_stats: bool,

    /// Print scheduler version and exit.
    #[clap(short = 'V', long, action = clap::ArgAction::SetTrue)]
    version: bool,
}

/// Demo-workload bookkeeping for one interactive task.
enum Phase {
    Running { since_tick: u64 },
    Sleeping { since_tick: u64 },
}

fn run(opts: &Opts, shutdown: Arc<AtomicBool>) -> Result<()> {
    let enclave = Arc::new(Enclave::with_monotonic_clock(Topology::new(opts.nr_cpus)));
    let scheduler = Arc::new(FlipScheduler::new(enclave.clone())?);

    // The server must stay alive for the whole run; keep the handle around.
    let stats_server = match StatsServer::new(stats::server_data()).launch() {
        Ok(server) => Some(server),
        Err(err) => {
            warn!("stats server unavailable: {err}");
            None
        }
    };
    let stats_channels = stats_server.as_ref().map(|server| server.channels());

    let driver = AgentDriver::new(scheduler.clone(), shutdown.clone(), opts.verbose);
    let handles = driver.spawn()?;
    enclave.wait_agents_ready();
    scheduler.enclave_ready();
    enclave.mark_ready();
    info!("{} scheduler attached", SCHEDULER_NAME);

    // Inject the synthetic workload.
    let mut next_gtid = 100u64;
    let mut alloc_gtid = || {
        let gtid = Gtid(next_gtid);
        next_gtid += 1;
        gtid
    };
    for _ in 0..opts.nr_workers {
        enclave.sched_task_new(alloc_gtid(), true);
    }
    let mut interactive: Vec<(Gtid, Phase)> = (0..opts.nr_interactive)
        .map(|_| {
            let gtid = alloc_gtid();
            enclave.sched_task_new(gtid, true);
            (gtid, Phase::Running { since_tick: 0 })
        })
        .collect();

    // Drive ticks and the interactive sleep/wake pattern until the deadline.
    let deadline = Instant::now() + Duration::from_secs(opts.duration_s);
    let tick = Duration::from_micros(opts.tick_us);
    let mut tick_no = 0u64;
    while !shutdown.load(Ordering::Acquire) && Instant::now() < deadline {
        std::thread::sleep(tick);
        tick_no += 1;

        for cpu in enclave.topology().cpus() {
            enclave.sched_tick(cpu.id);
        }

        for (gtid, phase) in interactive.iter_mut() {
            match phase {
                Phase::Running { since_tick } if tick_no - *since_tick >= 4 => {
                    // Blocking only lands if the task is actually on a CPU;
                    // otherwise try again on a later tick.
                    if enclave.sched_blocked(*gtid) {
                        *phase = Phase::Sleeping { since_tick: tick_no };
                    }
                }
                Phase::Sleeping { since_tick } if tick_no - *since_tick >= 8 => {
                    enclave.sched_wakeup(*gtid, false);
                    *phase = Phase::Running { since_tick: tick_no };
                }
                _ => {}
            }
        }

        if let Some((res_ch, req_ch)) = &stats_channels {
            if req_ch.try_recv().is_ok() {
                res_ch.send(scheduler.metrics())?;
            }
        }
    }

    // Drain the enclave: depart every task that is still around, then let
    // the agents empty their runqueues and exit.
    for gtid in enclave.live_tasks() {
        enclave.sched_departed(gtid);
    }
    shutdown.store(true, Ordering::Release);
    for handle in handles {
        handle.join().expect("agent thread panicked");
    }

    scheduler.metrics().format(&mut std::io::stdout())?;
    info!("unregister {} scheduler", SCHEDULER_NAME);
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if opts.version {
        println!(
            "{} version {} - scx_enclave {}",
            SCHEDULER_NAME,
            VERSION,
            scx_enclave::VERSION
        );
        return Ok(());
    }

    if opts.help_stats {
        stats::server_data().describe_meta(&mut std::io::stdout(), None)?;
        return Ok(());
    }

    let loglevel = match opts.verbose {
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
        loglevel,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Release);
    })?;

    if let Some(intv) = opts.monitor.or(opts.stats) {
        let shutdown_clone = shutdown.clone();
        let jh = std::thread::spawn(move || {
            stats::monitor(Duration::from_secs_f64(intv), shutdown_clone).unwrap()
        });
        if opts.monitor.is_some() {
            let _ = jh.join();
            return Ok(());
        }
    }

    run(&opts, shutdown)
}
