// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Dual-array runqueue.
//!
//! Runnable tasks split into two bands: `active` holds tasks with slice
//! budget left, `expired` holds tasks whose slice ran out (refilled on
//! entry). Dequeue drains `active`; when it empties the bands swap in O(1).
//! Every queued task therefore gets a turn before any task reuses a slice,
//! which bounds starvation without any ordered structure.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::trace;

use scx_enclave::Gtid;

use crate::task::{FlipTask, RunState};

#[derive(Default)]
struct Bands {
    active: VecDeque<Arc<FlipTask>>,
    expired: VecDeque<Arc<FlipTask>>,
}

#[derive(Default)]
pub struct FlipRq {
    bands: Mutex<Bands>,
    nr_flips: AtomicU64,
}

impl FlipRq {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a runnable, placed task into the band its remaining slice
    /// calls for. Tasks out of budget are refilled and parked in `expired`.
    pub fn enqueue(&self, task: &Arc<FlipTask>) {
        assert!(task.cpu() >= 0, "enqueue of unplaced task {}", task.gtid());
        assert_eq!(
            task.run_state(),
            RunState::Runnable,
            "enqueue of task {} in state {}",
            task.gtid(),
            task.run_state()
        );
        task.set_run_state(RunState::Queued);

        let mut bands = self.bands.lock().unwrap();
        if task.remaining_ns() > 0 {
            trace!("enqueue {} active ({}ns left)", task.gtid(), task.remaining_ns());
            if task.prio_boost() {
                bands.active.push_front(task.clone());
            } else {
                bands.active.push_back(task.clone());
            }
        } else {
            trace!("enqueue {} expired ({}ns left)", task.gtid(), task.remaining_ns());
            task.set_remaining_time();
            if task.prio_boost() {
                bands.expired.push_front(task.clone());
            } else {
                bands.expired.push_back(task.clone());
            }
        }
    }

    /// Queue into `active` regardless of remaining slice.
    pub fn enqueue_active(&self, task: &Arc<FlipTask>) {
        assert!(task.cpu() >= 0, "enqueue of unplaced task {}", task.gtid());
        assert_eq!(task.run_state(), RunState::Runnable);
        task.set_run_state(RunState::Queued);

        let mut bands = self.bands.lock().unwrap();
        if task.prio_boost() {
            bands.active.push_front(task.clone());
        } else {
            bands.active.push_back(task.clone());
        }
    }

    /// Refill and queue into `expired` regardless of remaining slice.
    pub fn enqueue_expired(&self, task: &Arc<FlipTask>) {
        assert!(task.cpu() >= 0, "enqueue of unplaced task {}", task.gtid());
        assert_eq!(task.run_state(), RunState::Runnable);
        task.set_run_state(RunState::Queued);

        let mut bands = self.bands.lock().unwrap();
        task.set_remaining_time();
        if task.prio_boost() {
            bands.expired.push_front(task.clone());
        } else {
            bands.expired.push_back(task.clone());
        }
    }

    /// Pop the next task. Swaps the bands when `active` is dry.
    pub fn dequeue(&self) -> Option<Arc<FlipTask>> {
        let mut bands = self.bands.lock().unwrap();
        if bands.active.is_empty() {
            if bands.expired.is_empty() {
                return None;
            }
            let bands = &mut *bands;
            std::mem::swap(&mut bands.active, &mut bands.expired);
            self.nr_flips.fetch_add(1, Ordering::Relaxed);
        }

        let task = bands.active.pop_front().unwrap();
        assert!(task.queued());
        task.set_run_state(RunState::Runnable);
        Some(task)
    }

    /// Remove a specific queued task. It is a fatal invariant violation if
    /// the task is in neither band.
    pub fn erase(&self, task: &Arc<FlipTask>) {
        assert_eq!(
            task.run_state(),
            RunState::Queued,
            "erase of task {} in state {}",
            task.gtid(),
            task.run_state()
        );

        let mut bands = self.bands.lock().unwrap();
        if Self::remove(&mut bands.active, task.gtid()) || Self::remove(&mut bands.expired, task.gtid())
        {
            task.set_run_state(RunState::Runnable);
            return;
        }
        panic!("task {} queued but missing from both bands", task.gtid());
    }

    fn remove(band: &mut VecDeque<Arc<FlipTask>>, gtid: Gtid) -> bool {
        // Common case: the victim sits at the back.
        if band.back().is_some_and(|t| t.gtid() == gtid) {
            band.pop_back();
            return true;
        }
        if let Some(pos) = band.iter().position(|t| t.gtid() == gtid) {
            band.remove(pos);
            return true;
        }
        false
    }

    pub fn len(&self) -> usize {
        let bands = self.bands.lock().unwrap();
        bands.active.len() + bands.expired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, gtid: Gtid) -> bool {
        let bands = self.bands.lock().unwrap();
        bands.active.iter().chain(bands.expired.iter()).any(|t| t.gtid() == gtid)
    }

    /// Band contents front to back, for diagnostics and tests.
    pub fn snapshot(&self) -> (Vec<Gtid>, Vec<Gtid>) {
        let bands = self.bands.lock().unwrap();
        (
            bands.active.iter().map(|t| t.gtid()).collect(),
            bands.expired.iter().map(|t| t.gtid()).collect(),
        )
    }

    /// How many times the bands have swapped.
    pub fn nr_flips(&self) -> u64 {
        self.nr_flips.load(Ordering::Relaxed)
    }
}
