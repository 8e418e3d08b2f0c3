//! scx_enclave - Delegated-scheduling enclave runtime.
//!
//! The kernel retains CPU ownership but delegates placement decisions to
//! userspace agents, one per CPU. This crate provides the runtime the agents
//! program against, backed by an in-process kernel driver so schedulers can
//! be exercised deterministically without kernel support:
//!
//! - **Topology**: the fixed set of CPUs under delegated scheduling
//! - **Channels**: per-CPU kernel-to-agent message queues with
//!   task-association barrier semantics
//! - **Status words**: shared cells exposing live task/agent state
//! - **Run requests**: transactional "run task T on CPU X" commits
//! - **Task pool**: thread-safe arena owning every task record
//! - **Enclave**: the kernel-side source of truth, plus the event-injection
//!   face used by workload drivers and tests

pub mod channel;
pub mod enclave;
pub mod message;
pub mod pool;
pub mod status_word;
pub mod topology;
pub mod types;

// Re-export the main public types for convenience.
pub use channel::{Channel, StaleBarrier};
pub use enclave::{
    AgentHandle, CommitState, Enclave, RunRequest, RunRequestOptions, COMMIT_AT_TXN_COMMIT,
    RTLA_ON_IDLE,
};
pub use message::{Message, MessageKind};
pub use pool::TaskPool;
pub use status_word::StatusWord;
pub use topology::{Cpu, Topology};
pub use types::{BarrierToken, CpuId, Gtid, TimeNs};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
