// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-CPU agent threads.
//!
//! One thread per enclave CPU, each running the drain-then-commit loop. An
//! agent only exits once shutdown has been requested *and* its CPU has
//! nothing left: a queued or current task keeps the loop alive so no work
//! is leaked on the way out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Result;
use log::info;

use scx_enclave::CpuId;

use crate::scheduler::FlipScheduler;

pub struct AgentDriver {
    scheduler: Arc<FlipScheduler>,
    shutdown: Arc<AtomicBool>,
    verbose: u8,
}

impl AgentDriver {
    pub fn new(scheduler: Arc<FlipScheduler>, shutdown: Arc<AtomicBool>, verbose: u8) -> Self {
        AgentDriver {
            scheduler,
            shutdown,
            verbose,
        }
    }

    /// Spawn one named agent thread per CPU.
    pub fn spawn(&self) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();
        for cpu in self.scheduler.enclave().topology().cpus() {
            let scheduler = self.scheduler.clone();
            let shutdown = self.shutdown.clone();
            let verbose = self.verbose;
            let cpu = cpu.id;
            let handle = std::thread::Builder::new()
                .name(format!("flip-agent-{}", cpu.0))
                .spawn(move || agent_loop(scheduler, shutdown, cpu, verbose))?;
            handles.push(handle);
        }
        Ok(handles)
    }
}

fn agent_loop(scheduler: Arc<FlipScheduler>, shutdown: Arc<AtomicBool>, cpu: CpuId, verbose: u8) {
    let enclave = scheduler.enclave().clone();
    let agent = enclave.agent(cpu);

    agent.signal_ready();
    enclave.wait_enclave_ready();
    if verbose > 1 {
        info!("agent for {cpu} running");
    }

    let mut last_dump = Instant::now();
    while !shutdown.load(Ordering::Acquire) || !scheduler.is_idle(cpu) {
        enclave.agent_resumed(cpu);
        scheduler.schedule(cpu);

        if verbose > 0 && last_dump.elapsed() >= Duration::from_secs(1) {
            last_dump = Instant::now();
            if scheduler.debug_runqueue.swap(false, Ordering::Relaxed) {
                scheduler.dump_state(cpu, true);
            } else {
                scheduler.dump_state(cpu, false);
            }
        }
    }

    if verbose > 1 {
        info!("agent for {cpu} drained, exiting");
    }
}
