//! Status words: shared cells the kernel keeps up to date.
//!
//! Each task and each agent owns one. Task words expose on-CPU liveness for
//! polling; agent words expose the barrier token and the boosted-priority
//! hint read at the top of every scheduling round.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::types::BarrierToken;

#[derive(Debug, Default)]
pub struct StatusWord {
    on_cpu: AtomicBool,
    boosted_priority: AtomicBool,
    barrier: AtomicU64,
}

impl StatusWord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_cpu(&self) -> bool {
        self.on_cpu.load(Ordering::Acquire)
    }

    pub fn boosted_priority(&self) -> bool {
        self.boosted_priority.load(Ordering::Acquire)
    }

    pub fn barrier(&self) -> BarrierToken {
        self.barrier.load(Ordering::Acquire)
    }

    // Kernel-side updates. Schedulers never call these; the driver (and
    // tests standing in for it) do.

    pub fn set_on_cpu(&self, on_cpu: bool) {
        self.on_cpu.store(on_cpu, Ordering::Release);
    }

    pub fn set_boosted_priority(&self, boosted: bool) {
        self.boosted_priority.store(boosted, Ordering::Release);
    }

    pub(crate) fn advance_barrier(&self) -> BarrierToken {
        self.barrier.fetch_add(1, Ordering::AcqRel) + 1
    }
}
