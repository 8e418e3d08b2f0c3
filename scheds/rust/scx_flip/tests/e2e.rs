// End-to-end scheduling scenarios on the manual clock: tick-driven slice
// expiry, band-flip alternation, and shutdown draining.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{assert_placement, setup, step};
use scx_enclave::{CpuId, Gtid};
use scx_flip::agent::AgentDriver;
use scx_flip::task::{RunState, SLICE_NS};

#[test]
fn single_task_oscillates_between_bands() {
    let (enclave, scheduler) = setup(1);
    let cpu = CpuId(0);

    enclave.sched_task_new(Gtid(1), true);
    step(&scheduler, cpu);
    assert_eq!(scheduler.current_gtid(cpu), Some(Gtid(1)));

    for round in 1..=5u64 {
        // A full slice of wall time passes, then the tick fires.
        enclave.advance_clock(SLICE_NS as u64 + 1);
        enclave.sched_tick(cpu);
        step(&scheduler, cpu);

        // The task went off CPU into the expired band with a fresh slice,
        // the bands flipped, and it was committed again. Never lost.
        assert_eq!(scheduler.current_gtid(cpu), Some(Gtid(1)));
        let task = scheduler.task(Gtid(1)).unwrap();
        assert_eq!(task.run_state(), RunState::OnCpu);
        assert_eq!(task.remaining_ns(), SLICE_NS);
        assert_eq!(
            scheduler.counters.nr_tick_preempts.load(Ordering::Relaxed),
            round
        );
        assert_eq!(scheduler.cpu_state(cpu).run_queue.nr_flips(), round);
        assert_placement(&scheduler, &enclave, Gtid(1));
    }
}

#[test]
fn two_tasks_alternate_strictly() {
    let (enclave, scheduler) = setup(1);
    let cpu = CpuId(0);

    enclave.sched_task_new(Gtid(1), true);
    enclave.sched_task_new(Gtid(2), true);
    step(&scheduler, cpu);
    assert_eq!(scheduler.current_gtid(cpu), Some(Gtid(1)));

    let mut picks = Vec::new();
    for _ in 0..6 {
        enclave.advance_clock(SLICE_NS as u64 + 1);
        enclave.sched_tick(cpu);
        step(&scheduler, cpu);
        picks.push(scheduler.current_gtid(cpu).unwrap());
    }

    assert_eq!(
        picks,
        vec![Gtid(2), Gtid(1), Gtid(2), Gtid(1), Gtid(2), Gtid(1)]
    );
}

#[test]
fn ticks_before_expiry_do_not_preempt() {
    let (enclave, scheduler) = setup(1);
    let cpu = CpuId(0);

    enclave.sched_task_new(Gtid(1), true);
    enclave.sched_task_new(Gtid(2), true);
    step(&scheduler, cpu);

    // Half a slice: the current task keeps the CPU across the tick.
    enclave.advance_clock(SLICE_NS as u64 / 2);
    enclave.sched_tick(cpu);
    step(&scheduler, cpu);

    assert_eq!(scheduler.current_gtid(cpu), Some(Gtid(1)));
    assert_eq!(scheduler.counters.nr_tick_preempts.load(Ordering::Relaxed), 0);

    // The second half expires it.
    enclave.advance_clock(SLICE_NS as u64 / 2 + 1);
    enclave.sched_tick(cpu);
    step(&scheduler, cpu);
    assert_eq!(scheduler.current_gtid(cpu), Some(Gtid(2)));
}

#[test]
fn shutdown_waits_for_residual_work() {
    let (enclave, scheduler) = setup(2);
    let shutdown = Arc::new(AtomicBool::new(false));

    let driver = AgentDriver::new(scheduler.clone(), shutdown.clone(), 0);
    let handles = driver.spawn().unwrap();
    enclave.wait_agents_ready();

    enclave.sched_task_new(Gtid(1), true);
    wait_for(|| scheduler.current_gtid(CpuId(0)) == Some(Gtid(1)));

    // Shutdown with the task still current: its agent must keep going.
    shutdown.store(true, Ordering::Release);
    std::thread::sleep(Duration::from_millis(50));
    assert!(!handles[0].is_finished(), "agent exited with work left");

    // Departure drains the CPU; every agent can now exit.
    enclave.sched_departed(Gtid(1));
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(scheduler.nr_tasks(), 0);
    for cpu in enclave.topology().cpus() {
        assert_eq!(scheduler.current_gtid(cpu.id), None);
        assert!(scheduler.cpu_state(cpu.id).run_queue.is_empty());
    }
}

fn wait_for(cond: impl Fn() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("condition not reached within 10s");
}
