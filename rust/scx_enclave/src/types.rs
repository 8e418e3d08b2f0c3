//! Newtype wrappers and type aliases for enclave concepts.
//!
//! Newtypes for identifiers (task and CPU ids) prevent silent type
//! confusion. Type aliases for quantities (timestamps, barrier tokens)
//! provide self-documenting code without arithmetic-trait boilerplate.

use std::fmt;

/// Stable task identifier assigned by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gtid(pub u64);

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gtid/{}", self.0)
    }
}

/// CPU identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuId(pub u32);

impl CpuId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Opaque ordering token used by the kernel to reject stale associations
/// and commits.
pub type BarrierToken = u64;

/// Monotonic time in nanoseconds.
pub type TimeNs = u64;
