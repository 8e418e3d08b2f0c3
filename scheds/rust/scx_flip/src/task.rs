// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-task state and time-slice accounting.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use scx_enclave::{BarrierToken, Gtid, StatusWord, TimeNs};

/// Time slice handed to every task (ns).
pub const SLICE_NS: i64 = 5_000_000;

/// Scheduling state of a task.
///
/// - `Blocked`: not runnable; neither queued nor on a CPU.
/// - `Runnable`: runnable but not yet visible in any runqueue.
/// - `Queued`: sitting in exactly one band of exactly one CPU's runqueue.
/// - `OnCpu`: the unique current task of exactly one CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Blocked = 0,
    Runnable = 1,
    Queued = 2,
    OnCpu = 3,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Blocked => "blocked",
            RunState::Runnable => "runnable",
            RunState::Queued => "queued",
            RunState::OnCpu => "oncpu",
        };
        write!(f, "{}", s)
    }
}

/// One task under the scheduler's control.
///
/// Fields are plain atomics rather than a mutex: a task is only mutated by
/// the agent owning the channel it is associated with, other agents at most
/// read (e.g. while enqueueing a wakeup on a remote runqueue). Cross-field
/// consistency comes from that single-mutator discipline, not from locking.
pub struct FlipTask {
    gtid: Gtid,
    status_word: Arc<StatusWord>,
    run_state: AtomicU8,
    /// Assigned CPU, or -1 while unplaced.
    cpu: AtomicI32,
    /// Last off-CPU transition was an involuntary preemption.
    preempted: AtomicBool,
    /// One-shot hint: enqueue at the head of the band.
    prio_boost: AtomicBool,
    /// Barrier token of the last message observed for this task.
    seqnum: AtomicU64,
    /// Unused portion of the current time slice (ns). May go negative
    /// before the accounting catches up.
    remaining_ns: AtomicI64,
    /// Clock reading when the task last went on CPU or had its slice
    /// updated mid-run.
    runtime_at_last_pick: AtomicU64,
}

impl FlipTask {
    pub fn new(gtid: Gtid, status_word: Arc<StatusWord>) -> Self {
        FlipTask {
            gtid,
            status_word,
            run_state: AtomicU8::new(RunState::Blocked as u8),
            cpu: AtomicI32::new(-1),
            preempted: AtomicBool::new(false),
            prio_boost: AtomicBool::new(false),
            seqnum: AtomicU64::new(0),
            remaining_ns: AtomicI64::new(0),
            runtime_at_last_pick: AtomicU64::new(0),
        }
    }

    pub fn gtid(&self) -> Gtid {
        self.gtid
    }

    pub fn status_word(&self) -> &StatusWord {
        &self.status_word
    }

    pub fn run_state(&self) -> RunState {
        match self.run_state.load(Ordering::Acquire) {
            0 => RunState::Blocked,
            1 => RunState::Runnable,
            2 => RunState::Queued,
            3 => RunState::OnCpu,
            other => unreachable!("corrupt run state {other}"),
        }
    }

    pub fn set_run_state(&self, state: RunState) {
        self.run_state.store(state as u8, Ordering::Release);
    }

    pub fn blocked(&self) -> bool {
        self.run_state() == RunState::Blocked
    }

    pub fn runnable(&self) -> bool {
        self.run_state() == RunState::Runnable
    }

    pub fn queued(&self) -> bool {
        self.run_state() == RunState::Queued
    }

    pub fn oncpu(&self) -> bool {
        self.run_state() == RunState::OnCpu
    }

    pub fn cpu(&self) -> i32 {
        self.cpu.load(Ordering::Acquire)
    }

    pub fn set_cpu(&self, cpu: i32) {
        self.cpu.store(cpu, Ordering::Release);
    }

    pub fn preempted(&self) -> bool {
        self.preempted.load(Ordering::Acquire)
    }

    pub fn set_preempted(&self, preempted: bool) {
        self.preempted.store(preempted, Ordering::Release);
    }

    pub fn prio_boost(&self) -> bool {
        self.prio_boost.load(Ordering::Acquire)
    }

    pub fn set_prio_boost(&self, boost: bool) {
        self.prio_boost.store(boost, Ordering::Release);
    }

    pub fn seqnum(&self) -> BarrierToken {
        self.seqnum.load(Ordering::Acquire)
    }

    pub fn set_seqnum(&self, seqnum: BarrierToken) {
        self.seqnum.store(seqnum, Ordering::Release);
    }

    pub fn remaining_ns(&self) -> i64 {
        self.remaining_ns.load(Ordering::Acquire)
    }

    /// Refill the slice.
    pub fn set_remaining_time(&self) {
        self.remaining_ns.store(SLICE_NS, Ordering::Release);
    }

    pub fn set_runtime_at_last_pick(&self, now: TimeNs) {
        self.runtime_at_last_pick.store(now, Ordering::Release);
    }

    /// Charge the time since the last pick against the slice.
    ///
    /// On the on-CPU path (`off_cpu == false`, i.e. a tick) the pick
    /// timestamp is reset so the next charge starts from now, and the
    /// return value says whether the slice just ran out. On the off-CPU
    /// path the caller classifies the task by the updated remainder, so
    /// this always returns false.
    pub fn update_remaining_time(&self, now: TimeNs, off_cpu: bool) -> bool {
        let last = self.runtime_at_last_pick.load(Ordering::Acquire);
        let ran = now.saturating_sub(last) as i64;
        let remaining = self.remaining_ns.fetch_sub(ran, Ordering::AcqRel) - ran;
        if !off_cpu {
            self.set_runtime_at_last_pick(now);
            return remaining <= 0;
        }
        false
    }
}

impl fmt::Debug for FlipTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlipTask")
            .field("gtid", &self.gtid)
            .field("run_state", &self.run_state())
            .field("cpu", &self.cpu())
            .field("preempted", &self.preempted())
            .field("prio_boost", &self.prio_boost())
            .field("remaining_ns", &self.remaining_ns())
            .finish()
    }
}
