// Dual-array runqueue behavior: band classification, boost placement,
// band flips and the starvation bound.

use std::sync::Arc;

use scx_enclave::{Gtid, StatusWord};
use scx_flip::runqueue::FlipRq;
use scx_flip::task::{FlipTask, RunState, SLICE_NS};

fn rq_task(gtid: u64) -> Arc<FlipTask> {
    let task = Arc::new(FlipTask::new(Gtid(gtid), Arc::new(StatusWord::new())));
    task.set_cpu(0);
    task.set_run_state(RunState::Runnable);
    task.set_remaining_time();
    task
}

/// Consume the whole slice, the way a full tick interval would.
fn burn_slice(task: &FlipTask) {
    task.set_runtime_at_last_pick(0);
    task.update_remaining_time(SLICE_NS as u64, true);
}

#[test]
fn enqueue_classifies_by_remaining_slice() {
    let rq = FlipRq::new();

    let fresh = rq_task(1);
    rq.enqueue(&fresh);

    let spent = rq_task(2);
    burn_slice(&spent);
    assert!(spent.remaining_ns() <= 0);
    rq.enqueue(&spent);

    let (active, expired) = rq.snapshot();
    assert_eq!(active, vec![Gtid(1)]);
    assert_eq!(expired, vec![Gtid(2)]);

    // Entering the expired band refills the slice.
    assert_eq!(spent.remaining_ns(), SLICE_NS);
    assert!(fresh.queued());
    assert!(spent.queued());
}

#[test]
fn prio_boost_enqueues_at_the_head() {
    let rq = FlipRq::new();
    rq.enqueue(&rq_task(1));
    rq.enqueue(&rq_task(2));

    let boosted = rq_task(3);
    boosted.set_prio_boost(true);
    rq.enqueue(&boosted);

    let (active, _) = rq.snapshot();
    assert_eq!(active, vec![Gtid(3), Gtid(1), Gtid(2)]);
    assert_eq!(rq.dequeue().unwrap().gtid(), Gtid(3));
}

#[test]
fn dequeue_flips_bands_when_active_drains() {
    let rq = FlipRq::new();

    let expired = rq_task(1);
    burn_slice(&expired);
    rq.enqueue(&expired);
    assert_eq!(rq.nr_flips(), 0);

    // Nothing active: one flip brings the expired band over.
    let picked = rq.dequeue().unwrap();
    assert_eq!(picked.gtid(), Gtid(1));
    assert_eq!(picked.run_state(), RunState::Runnable);
    assert_eq!(rq.nr_flips(), 1);

    assert!(rq.dequeue().is_none());
    assert_eq!(rq.nr_flips(), 1);
}

#[test]
fn explicit_band_enqueues() {
    let rq = FlipRq::new();

    let a = rq_task(1);
    burn_slice(&a);
    // enqueue_active ignores the spent slice.
    rq.enqueue_active(&a);

    let b = rq_task(2);
    rq.enqueue_expired(&b);
    assert_eq!(b.remaining_ns(), SLICE_NS);

    let (active, expired) = rq.snapshot();
    assert_eq!(active, vec![Gtid(1)]);
    assert_eq!(expired, vec![Gtid(2)]);
}

#[test]
fn erase_targets_either_band() {
    let rq = FlipRq::new();
    let tasks: Vec<_> = (1u64..=4).map(rq_task).collect();
    for task in &tasks[..3] {
        rq.enqueue(task);
    }
    burn_slice(&tasks[3]);
    rq.enqueue(&tasks[3]);

    // Middle of active, then back of expired (the common case).
    rq.erase(&tasks[1]);
    rq.erase(&tasks[3]);

    let (active, expired) = rq.snapshot();
    assert_eq!(active, vec![Gtid(1), Gtid(3)]);
    assert!(expired.is_empty());
    assert_eq!(tasks[1].run_state(), RunState::Runnable);
    assert_eq!(rq.len(), 2);
}

#[test]
#[should_panic(expected = "missing from both bands")]
fn erase_of_absent_task_is_fatal() {
    let rq = FlipRq::new();
    rq.enqueue(&rq_task(1));

    let absent = rq_task(2);
    absent.set_run_state(RunState::Queued);
    rq.erase(&absent);
}

#[test]
fn every_task_runs_within_two_rounds() {
    // N always-runnable tasks: each must be scheduled at least once per 2N
    // dequeues (drain the active band, flip once, drain the other).
    const N: u64 = 8;
    let rq = FlipRq::new();
    let tasks: Vec<_> = (1..=N).map(rq_task).collect();
    for task in &tasks {
        rq.enqueue(task);
    }

    let mut scheduled = vec![0u32; N as usize + 1];
    for _ in 0..2 * N {
        let task = rq.dequeue().unwrap();
        scheduled[task.gtid().0 as usize] += 1;
        burn_slice(&task);
        rq.enqueue(&task);
    }

    for gtid in 1..=N {
        assert!(
            scheduled[gtid as usize] >= 1,
            "task {gtid} starved across 2N dequeues"
        );
    }
    assert!(rq.nr_flips() <= 2);
}
