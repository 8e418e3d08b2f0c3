//! Per-CPU kernel-to-agent message channels.
//!
//! A channel is a bounded queue of [`Message`]s with task-association
//! semantics: every task is associated with exactly one channel at a time,
//! and its messages are delivered there. Moving the association is how a
//! task migrates between CPUs; the kernel guarantees no further messages on
//! the old channel once the association lands.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, Weak};

use crate::enclave::KernelShared;
use crate::message::Message;
use crate::types::{BarrierToken, CpuId, Gtid};

/// An association was attempted with an out-of-date barrier token.
///
/// The only legitimate occurrence is the agent-to-channel association at
/// enclave ready, which races with message delivery and is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleBarrier;

impl fmt::Display for StaleBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stale barrier token")
    }
}

impl std::error::Error for StaleBarrier {}

pub struct Channel {
    cpu: CpuId,
    max_elems: usize,
    queue: Mutex<VecDeque<Message>>,
    kernel: Weak<KernelShared>,
}

impl Channel {
    pub(crate) fn new(cpu: CpuId, max_elems: usize, kernel: Weak<KernelShared>) -> Self {
        Channel {
            cpu,
            max_elems,
            queue: Mutex::new(VecDeque::with_capacity(max_elems)),
            kernel,
        }
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Non-blocking look at the front message, if any.
    pub fn peek(&self) -> Option<Message> {
        self.queue.lock().unwrap().front().cloned()
    }

    /// Retire the front message. The caller passes back the message it
    /// peeked; consuming anything else is a dispatch bug.
    pub fn consume(&self, msg: &Message) {
        let popped = self
            .queue
            .lock()
            .unwrap()
            .pop_front()
            .expect("consume on empty channel");
        assert_eq!(&popped, msg, "consumed message is not the peeked one");
    }

    /// Move a task's message delivery to this channel.
    ///
    /// `barrier` must be the task's current seqnum; anything older means the
    /// caller has unprocessed messages for the task and the association is
    /// rejected as stale.
    pub fn associate_task(&self, gtid: Gtid, barrier: BarrierToken) -> Result<(), StaleBarrier> {
        let kernel = self.kernel();
        let mut tasks = kernel.tasks.lock().unwrap();
        let ktask = tasks
            .get_mut(&gtid)
            .unwrap_or_else(|| panic!("associate_task: unknown task {gtid}"));
        if ktask.seqnum != barrier {
            return Err(StaleBarrier);
        }
        ktask.channel = Some(self.cpu);
        Ok(())
    }

    /// Bind this channel's agent to it. Stale while messages race in;
    /// callers retry with a fresh agent barrier.
    pub fn associate_agent(&self, barrier: BarrierToken) -> Result<(), StaleBarrier> {
        let kernel = self.kernel();
        if kernel.agent_words[self.cpu.index()].barrier() != barrier {
            return Err(StaleBarrier);
        }
        kernel.agent_bound[self.cpu.index()].store(true, std::sync::atomic::Ordering::Release);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    /// Kernel-side delivery. The queue is bounded and sized for the task
    /// pool; overflowing it is fatal.
    pub(crate) fn push(&self, msg: Message) {
        let mut queue = self.queue.lock().unwrap();
        assert!(
            queue.len() < self.max_elems,
            "channel {} overflow ({} elems)",
            self.cpu,
            self.max_elems
        );
        queue.push_back(msg);
    }

    fn kernel(&self) -> std::sync::Arc<KernelShared> {
        self.kernel.upgrade().expect("enclave dropped")
    }
}
