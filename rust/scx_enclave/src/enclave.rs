//! The enclave: kernel-side truth and the event-injection driver.
//!
//! The enclave owns everything the kernel would own: per-task seqnums and
//! channel associations, which task occupies which CPU, the per-agent status
//! words, and the clock. Schedulers interact with it through channels,
//! run requests and agent handles; workload drivers and tests interact with
//! it through the `sched_*` injection methods, which validate every event
//! against kernel-side state before delivering the matching message.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::debug;

use crate::channel::Channel;
use crate::message::{Message, MessageKind};
use crate::status_word::StatusWord;
use crate::topology::Topology;
use crate::types::{BarrierToken, CpuId, Gtid, TimeNs};

/// Commit flag: the target goes on CPU when the transaction commits.
pub const COMMIT_AT_TXN_COMMIT: u32 = 0x1;

/// Yield flag: return control to the agent when the CPU next idles.
pub const RTLA_ON_IDLE: u32 = 0x1;

/// Kernel-side record of one task.
pub(crate) struct KTask {
    pub(crate) seqnum: BarrierToken,
    /// Channel the task's messages are delivered on. `None` routes to the
    /// default channel (the task has not been associated yet).
    pub(crate) channel: Option<CpuId>,
    status_word: Arc<StatusWord>,
    /// CPU the task currently occupies, if any.
    on: Option<CpuId>,
    /// Set while the task runs as part of a switchto chain, invisibly to
    /// the agents.
    in_switchto: bool,
}

/// State shared between the enclave and the handles it gives out.
///
/// Lock order: `tasks`, then a `current` slot, then `channels`/queues.
pub(crate) struct KernelShared {
    pub(crate) tasks: Mutex<HashMap<Gtid, KTask>>,
    current: Vec<Mutex<Option<Gtid>>>,
    pub(crate) agent_words: Vec<Arc<StatusWord>>,
    pub(crate) agent_bound: Vec<AtomicBool>,
    channels: Mutex<Vec<Option<Arc<Channel>>>>,
    default_channel: Mutex<Option<CpuId>>,
    forced_commit_failures: Vec<AtomicU32>,
}

impl KernelShared {
    fn channel_for(&self, cpu: CpuId) -> Arc<Channel> {
        self.channels.lock().unwrap()[cpu.index()]
            .clone()
            .unwrap_or_else(|| panic!("no channel for {cpu}"))
    }

    fn route(&self, assoc: Option<CpuId>) -> CpuId {
        assoc
            .or(*self.default_channel.lock().unwrap())
            .expect("no channels in the enclave")
    }

    /// Deliver a message on a channel and advance that agent's barrier.
    fn deliver(&self, chan_cpu: CpuId, msg: Message) {
        self.channel_for(chan_cpu).push(msg);
        self.agent_words[chan_cpu.index()].advance_barrier();
    }
}

enum ClockSource {
    Monotonic(Instant),
    Manual(AtomicU64),
}

/// Per-CPU agent handle: ping, status word, readiness.
pub struct AgentHandle {
    cpu: CpuId,
    word: Arc<StatusWord>,
    pings: AtomicU64,
    agents_ready: Arc<AtomicUsize>,
}

impl AgentHandle {
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn status_word(&self) -> &Arc<StatusWord> {
        &self.word
    }

    /// Get the agent's attention. With the polling agent loop this only
    /// needs to be observable, not to wake anything.
    pub fn ping(&self) {
        self.pings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pings(&self) -> u64 {
        self.pings.load(Ordering::Relaxed)
    }

    pub fn signal_ready(&self) {
        self.agents_ready.fetch_add(1, Ordering::AcqRel);
    }
}

/// Transaction parameters for a run request.
#[derive(Debug, Clone, Copy)]
pub struct RunRequestOptions {
    pub target: Gtid,
    pub target_barrier: BarrierToken,
    pub agent_barrier: BarrierToken,
    pub commit_flags: u32,
}

/// Diagnostic left behind by the last commit on a CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    Idle,
    Committed,
    UnknownTarget,
    StaleTargetBarrier,
    StaleAgentBarrier,
    Rejected,
}

impl fmt::Display for CommitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommitState::Idle => "idle",
            CommitState::Committed => "committed",
            CommitState::UnknownTarget => "unknown target",
            CommitState::StaleTargetBarrier => "stale target barrier",
            CommitState::StaleAgentBarrier => "stale agent barrier",
            CommitState::Rejected => "rejected",
        };
        write!(f, "{}", s)
    }
}

/// Per-CPU transactional run request.
pub struct RunRequest {
    cpu: CpuId,
    kernel: Arc<KernelShared>,
    txn: Mutex<Option<RunRequestOptions>>,
    state: Mutex<CommitState>,
}

impl RunRequest {
    /// Stage a transaction. Overwrites any uncommitted one.
    pub fn open(&self, opts: RunRequestOptions) {
        *self.txn.lock().unwrap() = Some(opts);
    }

    /// Commit the staged transaction. On success the target is on CPU and
    /// both barriers were current. Failure is an ordinary outcome; the
    /// cause is retrievable through [`RunRequest::state`].
    pub fn commit(&self) -> bool {
        let opts = self
            .txn
            .lock()
            .unwrap()
            .take()
            .expect("commit without an open transaction");

        if self.kernel.forced_commit_failures[self.cpu.index()]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return self.fail(CommitState::Rejected);
        }

        let mut tasks = self.kernel.tasks.lock().unwrap();

        match tasks.get(&opts.target) {
            None => return self.fail(CommitState::UnknownTarget),
            Some(ktask) => {
                if opts.target_barrier != ktask.seqnum {
                    return self.fail(CommitState::StaleTargetBarrier);
                }
            }
        }
        if opts.agent_barrier != self.kernel.agent_words[self.cpu.index()].barrier() {
            return self.fail(CommitState::StaleAgentBarrier);
        }

        {
            let mut current = self.kernel.current[self.cpu.index()].lock().unwrap();
            if let Some(prev) = *current {
                if prev != opts.target {
                    if let Some(kprev) = tasks.get_mut(&prev) {
                        kprev.on = None;
                        kprev.status_word.set_on_cpu(false);
                    }
                }
            }
            *current = Some(opts.target);
        }

        let ktask = tasks.get_mut(&opts.target).unwrap();
        ktask.on = Some(self.cpu);
        ktask.status_word.set_on_cpu(true);

        *self.state.lock().unwrap() = CommitState::Committed;
        true
    }

    pub fn state(&self) -> CommitState {
        *self.state.lock().unwrap()
    }

    /// Give the CPU back to the kernel until there is agent work again.
    pub fn local_yield(&self, _agent_barrier: BarrierToken, flags: u32) {
        debug!("local yield on {} (flags={:#x})", self.cpu, flags);
        std::thread::yield_now();
    }

    fn fail(&self, state: CommitState) -> bool {
        *self.state.lock().unwrap() = state;
        false
    }
}

pub struct Enclave {
    topology: Topology,
    kernel: Arc<KernelShared>,
    agents: Vec<Arc<AgentHandle>>,
    run_requests: Vec<RunRequest>,
    agents_ready: Arc<AtomicUsize>,
    ready: AtomicBool,
    deliver_ticks: AtomicBool,
    clock: ClockSource,
}

impl Enclave {
    /// Enclave with a manually advanced clock, for deterministic driving.
    pub fn new(topology: Topology) -> Self {
        Self::with_clock(topology, ClockSource::Manual(AtomicU64::new(0)))
    }

    /// Enclave running on wall time.
    pub fn with_monotonic_clock(topology: Topology) -> Self {
        Self::with_clock(topology, ClockSource::Monotonic(Instant::now()))
    }

    fn with_clock(topology: Topology, clock: ClockSource) -> Self {
        let nr = topology.nr_cpus();
        let kernel = Arc::new(KernelShared {
            tasks: Mutex::new(HashMap::new()),
            current: (0..nr).map(|_| Mutex::new(None)).collect(),
            agent_words: (0..nr).map(|_| Arc::new(StatusWord::new())).collect(),
            agent_bound: (0..nr).map(|_| AtomicBool::new(false)).collect(),
            channels: Mutex::new(vec![None; nr]),
            default_channel: Mutex::new(None),
            forced_commit_failures: (0..nr).map(|_| AtomicU32::new(0)).collect(),
        });
        let agents_ready = Arc::new(AtomicUsize::new(0));
        let agents = topology
            .cpus()
            .iter()
            .map(|cpu| {
                Arc::new(AgentHandle {
                    cpu: cpu.id,
                    word: kernel.agent_words[cpu.id.index()].clone(),
                    pings: AtomicU64::new(0),
                    agents_ready: agents_ready.clone(),
                })
            })
            .collect();
        let run_requests = topology
            .cpus()
            .iter()
            .map(|cpu| RunRequest {
                cpu: cpu.id,
                kernel: kernel.clone(),
                txn: Mutex::new(None),
                state: Mutex::new(CommitState::Idle),
            })
            .collect();
        Enclave {
            topology,
            kernel,
            agents,
            run_requests,
            agents_ready,
            ready: AtomicBool::new(false),
            deliver_ticks: AtomicBool::new(false),
            clock,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Build the message channel for one CPU. The first channel created
    /// becomes the default channel, which receives messages for tasks that
    /// have not been associated yet.
    pub fn make_channel(&self, max_elems: usize, _node: u32, cpus: &[CpuId]) -> Arc<Channel> {
        assert_eq!(cpus.len(), 1, "channels are per-CPU");
        let cpu = cpus[0];
        let chan = Arc::new(Channel::new(cpu, max_elems, Arc::downgrade(&self.kernel)));
        let mut channels = self.kernel.channels.lock().unwrap();
        assert!(
            channels[cpu.index()].is_none(),
            "channel for {cpu} already exists"
        );
        channels[cpu.index()] = Some(chan.clone());
        let mut default = self.kernel.default_channel.lock().unwrap();
        if default.is_none() {
            *default = Some(cpu);
        }
        chan
    }

    pub fn agent(&self, cpu: CpuId) -> Arc<AgentHandle> {
        self.agents[cpu.index()].clone()
    }

    pub fn run_request(&self, cpu: CpuId) -> &RunRequest {
        &self.run_requests[cpu.index()]
    }

    pub fn set_deliver_ticks(&self, deliver: bool) {
        self.deliver_ticks.store(deliver, Ordering::Release);
    }

    pub fn now_ns(&self) -> TimeNs {
        match &self.clock {
            ClockSource::Monotonic(start) => start.elapsed().as_nanos() as TimeNs,
            ClockSource::Manual(ns) => ns.load(Ordering::Acquire),
        }
    }

    /// Advance the manual clock. Panics on a wall-time enclave.
    pub fn advance_clock(&self, delta_ns: TimeNs) {
        match &self.clock {
            ClockSource::Manual(ns) => {
                ns.fetch_add(delta_ns, Ordering::AcqRel);
            }
            ClockSource::Monotonic(_) => panic!("advance_clock on a wall-time enclave"),
        }
    }

    // Readiness handshake: agents signal ready, the main thread finishes
    // initialization and marks the enclave ready, agents proceed.

    pub fn wait_agents_ready(&self) {
        while self.agents_ready.load(Ordering::Acquire) < self.topology.nr_cpus() {
            std::thread::yield_now();
        }
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn wait_enclave_ready(&self) {
        while !self.ready.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
    }

    /// The kernel hands the CPU to its agent: whatever task occupied the
    /// CPU is off it for the duration of the agent's turn (it stays
    /// current-elect and is re-committed if the agent keeps it).
    pub fn agent_resumed(&self, cpu: CpuId) {
        let tasks = self.kernel.tasks.lock().unwrap();
        let current = self.kernel.current[cpu.index()].lock().unwrap();
        if let Some(gtid) = *current {
            if let Some(ktask) = tasks.get(&gtid) {
                ktask.status_word.set_on_cpu(false);
            }
        }
    }

    // Introspection for drivers and tests.

    pub fn task_status_word(&self, gtid: Gtid) -> Arc<StatusWord> {
        self.kernel.tasks.lock().unwrap()[&gtid].status_word.clone()
    }

    pub fn kernel_current(&self, cpu: CpuId) -> Option<Gtid> {
        *self.kernel.current[cpu.index()].lock().unwrap()
    }

    /// Whether the CPU's agent has bound itself to its channel.
    pub fn agent_is_bound(&self, cpu: CpuId) -> bool {
        self.kernel.agent_bound[cpu.index()].load(Ordering::Acquire)
    }

    pub fn live_tasks(&self) -> Vec<Gtid> {
        let mut gtids: Vec<Gtid> = self.kernel.tasks.lock().unwrap().keys().copied().collect();
        gtids.sort();
        gtids
    }

    /// Force the next `count` commits on `cpu` to fail.
    pub fn force_commit_failure(&self, cpu: CpuId, count: u32) {
        self.kernel.forced_commit_failures[cpu.index()].fetch_add(count, Ordering::AcqRel);
    }

    // Event injection: the kernel producing messages. Every event is
    // validated against kernel-side state first.

    /// A task enters the enclave. Returns its status word.
    pub fn sched_task_new(&self, gtid: Gtid, runnable: bool) -> Arc<StatusWord> {
        let mut tasks = self.kernel.tasks.lock().unwrap();
        assert!(!tasks.contains_key(&gtid), "task {gtid} already exists");
        let word = Arc::new(StatusWord::new());
        tasks.insert(
            gtid,
            KTask {
                seqnum: 0,
                channel: None,
                status_word: word.clone(),
                on: None,
                in_switchto: false,
            },
        );
        self.deliver_task_msg(&mut tasks, gtid, MessageKind::TaskNew { gtid, runnable });
        word
    }

    /// A blocked task becomes runnable.
    pub fn sched_wakeup(&self, gtid: Gtid, deferrable: bool) {
        let mut tasks = self.kernel.tasks.lock().unwrap();
        {
            let ktask = tasks
                .get_mut(&gtid)
                .unwrap_or_else(|| panic!("wakeup for unknown task {gtid}"));
            if ktask.in_switchto {
                // The tail of a switchto chain can wake before it has been
                // observed off the remote CPU; settle the kernel state.
                let cpu = ktask.on.take().unwrap();
                ktask.in_switchto = false;
                ktask.status_word.set_on_cpu(false);
                let mut current = self.kernel.current[cpu.index()].lock().unwrap();
                if *current == Some(gtid) {
                    *current = None;
                }
            }
            assert!(ktask.on.is_none(), "wakeup for task {gtid} still on a CPU");
        }
        self.deliver_task_msg(&mut tasks, gtid, MessageKind::TaskWakeup { gtid, deferrable });
    }

    /// The occupant of a CPU blocks. Returns false (and delivers nothing)
    /// if the task was not on a CPU anymore by the time the event landed.
    pub fn sched_blocked(&self, gtid: Gtid) -> bool {
        self.off_cpu_event(gtid, |gtid, from_switchto, cpu| MessageKind::TaskBlocked {
            gtid,
            from_switchto,
            cpu,
        })
    }

    /// The occupant of a CPU yields voluntarily but stays runnable.
    pub fn sched_yield_event(&self, gtid: Gtid) -> bool {
        self.off_cpu_event(gtid, |gtid, from_switchto, cpu| MessageKind::TaskYield {
            gtid,
            from_switchto,
            cpu,
        })
    }

    /// The kernel preempts the occupant of a CPU.
    pub fn sched_preempt(&self, gtid: Gtid) -> bool {
        self.off_cpu_event(gtid, |gtid, from_switchto, cpu| MessageKind::TaskPreempt {
            gtid,
            from_switchto,
            cpu,
        })
    }

    /// `from` donates its remaining slice to `to`. `to` starts running on
    /// the CPU behind the agent's back; no message is produced for it.
    pub fn sched_switchto(&self, from: Gtid, to: Gtid) {
        let mut tasks = self.kernel.tasks.lock().unwrap();
        let cpu = {
            let kfrom = tasks
                .get_mut(&from)
                .unwrap_or_else(|| panic!("switchto from unknown task {from}"));
            let cpu = kfrom.on.take().expect("switchto source is not running");
            kfrom.status_word.set_on_cpu(false);
            cpu
        };
        {
            let kto = tasks
                .get_mut(&to)
                .unwrap_or_else(|| panic!("switchto to unknown task {to}"));
            assert!(kto.on.is_none(), "switchto target {to} already on a CPU");
            kto.on = Some(cpu);
            kto.in_switchto = true;
            kto.status_word.set_on_cpu(true);
            *self.kernel.current[cpu.index()].lock().unwrap() = Some(to);
        }
        self.deliver_task_msg(&mut tasks, from, MessageKind::TaskSwitchto { gtid: from });
    }

    /// A task leaves the enclave (e.g. changes scheduling class or exits
    /// while running). Its record is gone once the message is delivered.
    pub fn sched_departed(&self, gtid: Gtid) {
        let mut tasks = self.kernel.tasks.lock().unwrap();
        let (from_switchto, cpu) = {
            let ktask = tasks
                .get_mut(&gtid)
                .unwrap_or_else(|| panic!("departure of unknown task {gtid}"));
            let from_switchto = ktask.in_switchto;
            let cpu = match ktask.on.take() {
                Some(cpu) => {
                    ktask.status_word.set_on_cpu(false);
                    let mut current = self.kernel.current[cpu.index()].lock().unwrap();
                    if *current == Some(gtid) {
                        *current = None;
                    }
                    cpu
                }
                None => CpuId(0),
            };
            (from_switchto, cpu)
        };
        self.deliver_task_msg(
            &mut tasks,
            gtid,
            MessageKind::TaskDeparted {
                gtid,
                from_switchto,
                cpu,
            },
        );
        tasks.remove(&gtid);
    }

    /// A blocked task exits.
    pub fn sched_dead(&self, gtid: Gtid) {
        let mut tasks = self.kernel.tasks.lock().unwrap();
        {
            let ktask = tasks
                .get_mut(&gtid)
                .unwrap_or_else(|| panic!("death of unknown task {gtid}"));
            assert!(ktask.on.is_none(), "dead task {gtid} still on a CPU");
        }
        self.deliver_task_msg(&mut tasks, gtid, MessageKind::TaskDead { gtid });
        tasks.remove(&gtid);
    }

    /// Timer tick on a CPU. Dropped until tick delivery is enabled.
    pub fn sched_tick(&self, cpu: CpuId) {
        if !self.deliver_ticks.load(Ordering::Acquire) {
            return;
        }
        self.kernel.deliver(
            cpu,
            Message {
                seqnum: 0,
                kind: MessageKind::CpuTick { cpu },
            },
        );
    }

    fn off_cpu_event(&self, gtid: Gtid, make: impl FnOnce(Gtid, bool, CpuId) -> MessageKind) -> bool {
        let mut tasks = self.kernel.tasks.lock().unwrap();
        let (from_switchto, cpu) = {
            let ktask = tasks
                .get_mut(&gtid)
                .unwrap_or_else(|| panic!("off-CPU event for unknown task {gtid}"));
            let Some(cpu) = ktask.on.take() else {
                return false;
            };
            let from_switchto = ktask.in_switchto;
            ktask.in_switchto = false;
            ktask.status_word.set_on_cpu(false);
            let mut current = self.kernel.current[cpu.index()].lock().unwrap();
            if *current == Some(gtid) {
                *current = None;
            }
            (from_switchto, cpu)
        };
        self.deliver_task_msg(&mut tasks, gtid, make(gtid, from_switchto, cpu));
        true
    }

    /// Stamp the task's next seqnum on a message and deliver it on the
    /// task's associated channel.
    fn deliver_task_msg(&self, tasks: &mut HashMap<Gtid, KTask>, gtid: Gtid, kind: MessageKind) {
        let ktask = tasks.get_mut(&gtid).unwrap();
        ktask.seqnum += 1;
        let msg = Message {
            seqnum: ktask.seqnum,
            kind,
        };
        let chan_cpu = self.kernel.route(ktask.channel);
        self.kernel.deliver(chan_cpu, msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::StaleBarrier;

    fn enclave(nr_cpus: u32) -> Enclave {
        let enclave = Enclave::new(Topology::new(nr_cpus));
        for cpu in enclave.topology().cpus().to_vec() {
            enclave.make_channel(64, cpu.node, &[cpu.id]);
        }
        enclave
    }

    #[test]
    fn task_new_lands_on_default_channel() {
        let enclave = enclave(2);
        enclave.sched_task_new(Gtid(1), true);

        let chan = enclave.kernel.channel_for(CpuId(0));
        let msg = chan.peek().unwrap();
        assert_eq!(msg.seqnum, 1);
        assert_eq!(
            msg.kind,
            MessageKind::TaskNew {
                gtid: Gtid(1),
                runnable: true
            }
        );
        chan.consume(&msg);
        assert!(chan.is_empty());
    }

    #[test]
    fn association_moves_delivery() {
        let enclave = enclave(2);
        enclave.sched_task_new(Gtid(1), false);

        let chan1 = enclave.kernel.channel_for(CpuId(1));
        chan1.associate_task(Gtid(1), 1).unwrap();
        enclave.sched_wakeup(Gtid(1), true);

        let msg = chan1.peek().unwrap();
        assert_eq!(msg.seqnum, 2);
        assert!(matches!(msg.kind, MessageKind::TaskWakeup { .. }));
    }

    #[test]
    fn stale_association_is_rejected() {
        let enclave = enclave(2);
        enclave.sched_task_new(Gtid(1), false);
        enclave.sched_wakeup(Gtid(1), true); // seqnum is now 2

        let chan1 = enclave.kernel.channel_for(CpuId(1));
        assert_eq!(chan1.associate_task(Gtid(1), 1), Err(StaleBarrier));
        assert!(chan1.associate_task(Gtid(1), 2).is_ok());
    }

    #[test]
    fn commit_checks_barriers() {
        let enclave = enclave(1);
        enclave.sched_task_new(Gtid(1), true);
        let agent_barrier = enclave.agent(CpuId(0)).status_word().barrier();

        let req = enclave.run_request(CpuId(0));

        // Stale target barrier.
        req.open(RunRequestOptions {
            target: Gtid(1),
            target_barrier: 0,
            agent_barrier,
            commit_flags: COMMIT_AT_TXN_COMMIT,
        });
        assert!(!req.commit());
        assert_eq!(req.state(), CommitState::StaleTargetBarrier);

        // Current barriers commit.
        req.open(RunRequestOptions {
            target: Gtid(1),
            target_barrier: 1,
            agent_barrier,
            commit_flags: COMMIT_AT_TXN_COMMIT,
        });
        assert!(req.commit());
        assert_eq!(req.state(), CommitState::Committed);
        assert_eq!(enclave.kernel_current(CpuId(0)), Some(Gtid(1)));
        assert!(enclave.task_status_word(Gtid(1)).on_cpu());
    }

    #[test]
    fn agent_resumed_takes_current_off_cpu() {
        let enclave = enclave(1);
        enclave.sched_task_new(Gtid(1), true);
        let agent_barrier = enclave.agent(CpuId(0)).status_word().barrier();
        let req = enclave.run_request(CpuId(0));
        req.open(RunRequestOptions {
            target: Gtid(1),
            target_barrier: 1,
            agent_barrier,
            commit_flags: COMMIT_AT_TXN_COMMIT,
        });
        assert!(req.commit());

        enclave.agent_resumed(CpuId(0));
        assert!(!enclave.task_status_word(Gtid(1)).on_cpu());
        // Still current-elect.
        assert_eq!(enclave.kernel_current(CpuId(0)), Some(Gtid(1)));
    }

    #[test]
    fn agent_association_retries_on_stale() {
        let enclave = enclave(1);
        let cpu = CpuId(0);
        let chan = enclave.kernel.channel_for(cpu);
        let agent = enclave.agent(cpu);

        // A delivery between reading the barrier and associating makes the
        // token stale; a fresh read succeeds.
        let barrier = agent.status_word().barrier();
        enclave.sched_task_new(Gtid(1), false);
        assert_eq!(chan.associate_agent(barrier), Err(StaleBarrier));
        assert!(!enclave.agent_is_bound(cpu));

        assert!(chan.associate_agent(agent.status_word().barrier()).is_ok());
        assert!(enclave.agent_is_bound(cpu));
    }

    #[test]
    fn ticks_are_gated() {
        let enclave = enclave(1);
        enclave.sched_tick(CpuId(0));
        assert!(enclave.kernel.channel_for(CpuId(0)).is_empty());

        enclave.set_deliver_ticks(true);
        enclave.sched_tick(CpuId(0));
        let msg = enclave.kernel.channel_for(CpuId(0)).peek().unwrap();
        assert_eq!(msg.kind, MessageKind::CpuTick { cpu: CpuId(0) });
    }

    #[test]
    fn manual_clock_advances() {
        let enclave = enclave(1);
        assert_eq!(enclave.now_ns(), 0);
        enclave.advance_clock(1_000);
        assert_eq!(enclave.now_ns(), 1_000);
    }
}
