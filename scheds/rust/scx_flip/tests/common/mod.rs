#![allow(dead_code)]

use std::sync::Arc;

use scx_enclave::{CpuId, Enclave, Gtid, Topology};
use scx_flip::scheduler::FlipScheduler;

/// Build an enclave on a manual clock with the scheduler attached and
/// ticks enabled.
pub fn setup(nr_cpus: u32) -> (Arc<Enclave>, Arc<FlipScheduler>) {
    let enclave = Arc::new(Enclave::new(Topology::new(nr_cpus)));
    let scheduler = Arc::new(FlipScheduler::new(enclave.clone()).unwrap());
    scheduler.enclave_ready();
    enclave.mark_ready();
    (enclave, scheduler)
}

/// One agent-loop iteration for a CPU: the kernel hands over the CPU, the
/// agent drains its channel and commits.
pub fn step(scheduler: &FlipScheduler, cpu: CpuId) {
    scheduler.enclave().agent_resumed(cpu);
    scheduler.schedule(cpu);
}

/// Check the uniqueness and placement invariants for one task: a queued or
/// on-CPU task is held by exactly one CPU, and only by its assigned one;
/// a blocked or runnable task is held by none.
pub fn assert_placement(scheduler: &FlipScheduler, enclave: &Enclave, gtid: Gtid) {
    use scx_flip::task::RunState;

    let task = scheduler.task(gtid).unwrap();
    let mut holders = 0;
    for cpu in enclave.topology().cpus() {
        let cs = scheduler.cpu_state(cpu.id);
        let queued_here = cs.run_queue.contains(gtid);
        let current_here = scheduler.current_gtid(cpu.id) == Some(gtid);
        if queued_here || current_here {
            assert_eq!(task.cpu(), cpu.id.0 as i32, "{gtid} held by a foreign CPU");
        }
        holders += queued_here as u32 + current_here as u32;
    }
    match task.run_state() {
        RunState::Queued | RunState::OnCpu => assert_eq!(holders, 1, "{gtid} held {holders}x"),
        RunState::Blocked | RunState::Runnable => {
            assert_eq!(holders, 0, "{gtid} held while not queued")
        }
    }
}
