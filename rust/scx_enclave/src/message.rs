//! Kernel-to-agent messages.
//!
//! The kernel notifies agents of task lifecycle transitions through per-CPU
//! channels. The message set is closed; dispatchers match exhaustively.

use crate::types::{BarrierToken, CpuId, Gtid};

/// A single message as delivered on a channel.
///
/// `seqnum` is the task's barrier token at delivery time; commits targeting
/// the task must present it back to the kernel. Tick messages carry no
/// task and a zero seqnum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub seqnum: BarrierToken,
    pub kind: MessageKind,
}

/// Decoded message payloads.
///
/// For `TaskYield`, `TaskBlocked`, `TaskPreempt` and `TaskDeparted` the
/// `cpu` field is only meaningful when `from_switchto` is set: it names the
/// CPU whose agent should be pinged because the switchto chain it was
/// hosting just changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    TaskNew { gtid: Gtid, runnable: bool },
    TaskWakeup { gtid: Gtid, deferrable: bool },
    TaskYield { gtid: Gtid, from_switchto: bool, cpu: CpuId },
    TaskBlocked { gtid: Gtid, from_switchto: bool, cpu: CpuId },
    TaskPreempt { gtid: Gtid, from_switchto: bool, cpu: CpuId },
    TaskSwitchto { gtid: Gtid },
    TaskDeparted { gtid: Gtid, from_switchto: bool, cpu: CpuId },
    TaskDead { gtid: Gtid },
    CpuTick { cpu: CpuId },
}

impl Message {
    /// The task this message is about, if any.
    pub fn gtid(&self) -> Option<Gtid> {
        match self.kind {
            MessageKind::TaskNew { gtid, .. }
            | MessageKind::TaskWakeup { gtid, .. }
            | MessageKind::TaskYield { gtid, .. }
            | MessageKind::TaskBlocked { gtid, .. }
            | MessageKind::TaskPreempt { gtid, .. }
            | MessageKind::TaskSwitchto { gtid }
            | MessageKind::TaskDeparted { gtid, .. }
            | MessageKind::TaskDead { gtid } => Some(gtid),
            MessageKind::CpuTick { .. } => None,
        }
    }
}
