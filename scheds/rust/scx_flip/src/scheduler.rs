// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The scheduler proper: per-CPU state, the message dispatcher, the task
//! lifecycle handlers and the commit loop.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use log::{debug, info};

use scx_enclave::{
    BarrierToken, Channel, CpuId, Enclave, Gtid, Message, MessageKind, RunRequestOptions,
    TaskPool, COMMIT_AT_TXN_COMMIT, RTLA_ON_IDLE,
};

use crate::runqueue::FlipRq;
use crate::stats::{Counters, Metrics};
use crate::task::{FlipTask, RunState};

/// Queue depth of each per-CPU message channel.
const CHANNEL_DEPTH: usize = 1024;

/// Live tasks the pool reserves space for.
const MAX_TASKS: usize = 4096;

/// Everything one CPU's agent schedules with.
pub struct CpuState {
    pub current: Mutex<Option<Arc<FlipTask>>>,
    pub run_queue: FlipRq,
    pub channel: Arc<Channel>,
    pub preempt_curr: AtomicBool,
}

pub struct FlipScheduler {
    enclave: Arc<Enclave>,
    cpu_states: Vec<CpuState>,
    allocator: TaskPool<FlipTask>,
    /// Round-robin placement cursor. Placement only ever happens on the
    /// agent bound to the default channel, so a bare atomic is enough.
    rr_cursor: AtomicUsize,
    pub counters: Counters,
    /// One-shot request for a full task dump from the next verbose edge.
    pub debug_runqueue: AtomicBool,
}

impl FlipScheduler {
    pub fn new(enclave: Arc<Enclave>) -> Result<Self> {
        let mut cpu_states = Vec::with_capacity(enclave.topology().nr_cpus());
        for cpu in enclave.topology().cpus() {
            let channel = enclave.make_channel(CHANNEL_DEPTH, cpu.node, &[cpu.id]);
            cpu_states.push(CpuState {
                current: Mutex::new(None),
                run_queue: FlipRq::new(),
                channel,
                preempt_curr: AtomicBool::new(false),
            });
        }

        Ok(FlipScheduler {
            enclave,
            cpu_states,
            allocator: TaskPool::new(MAX_TASKS),
            rr_cursor: AtomicUsize::new(0),
            counters: Counters::default(),
            debug_runqueue: AtomicBool::new(false),
        })
    }

    pub fn enclave(&self) -> &Arc<Enclave> {
        &self.enclave
    }

    pub fn cpu_state(&self, cpu: CpuId) -> &CpuState {
        &self.cpu_states[cpu.index()]
    }

    /// The CPU state a placed task belongs to.
    fn cpu_state_of(&self, task: &FlipTask) -> &CpuState {
        let cpu = task.cpu();
        assert!(cpu >= 0, "task {} is unplaced", task.gtid());
        &self.cpu_states[cpu as usize]
    }

    /// Bind every agent to its channel, then enable tick delivery. Ticks
    /// must stay off until all agents own their channels: the agent on the
    /// default channel would otherwise see ticks meant for other CPUs.
    pub fn enclave_ready(&self) {
        for cpu in self.enclave.topology().cpus() {
            let cs = self.cpu_state(cpu.id);
            let agent = self.enclave.agent(cpu.id);
            // Association races with message delivery; retry with a fresh
            // barrier until it sticks.
            while cs
                .channel
                .associate_agent(agent.status_word().barrier())
                .is_err()
            {}
        }
        self.enclave.set_deliver_ticks(true);
        info!("enclave ready, ticks enabled");
    }

    /// Nothing left for this CPU: no queued work and no current task.
    pub fn is_idle(&self, cpu: CpuId) -> bool {
        let cs = self.cpu_state(cpu);
        cs.run_queue.is_empty() && cs.current.lock().unwrap().is_none()
    }

    pub fn current_gtid(&self, cpu: CpuId) -> Option<Gtid> {
        self.cpu_state(cpu)
            .current
            .lock()
            .unwrap()
            .as_ref()
            .map(|t| t.gtid())
    }

    pub fn task(&self, gtid: Gtid) -> Option<Arc<FlipTask>> {
        self.allocator.get(gtid)
    }

    pub fn nr_tasks(&self) -> usize {
        self.allocator.len()
    }

    /// One scheduling round for a CPU: drain the channel, then commit.
    pub fn schedule(&self, cpu: CpuId) {
        let agent = self.enclave.agent(cpu);
        let agent_barrier = agent.status_word().barrier();
        let cs = self.cpu_state(cpu);

        while let Some(msg) = cs.channel.peek() {
            self.dispatch_message(&msg);
            cs.channel.consume(&msg);
        }

        self.flip_schedule(cpu, agent_barrier, agent.status_word().boosted_priority());
    }

    fn dispatch_message(&self, msg: &Message) {
        Counters::inc(&self.counters.nr_messages);

        // Every task message advances the task's barrier token; commits
        // must present the latest one back.
        if let Some(gtid) = msg.gtid() {
            if !matches!(msg.kind, MessageKind::TaskNew { .. }) {
                let task = self
                    .allocator
                    .get(gtid)
                    .unwrap_or_else(|| panic!("message for unknown task {gtid}"));
                task.set_seqnum(msg.seqnum);
            }
        }

        match msg.kind {
            MessageKind::TaskNew { gtid, runnable } => self.task_new(gtid, runnable, msg.seqnum),
            MessageKind::TaskWakeup { gtid, deferrable } => {
                self.task_wakeup(&self.lookup(gtid), deferrable, msg.seqnum)
            }
            MessageKind::TaskYield {
                gtid,
                from_switchto,
                cpu,
            } => self.task_yield(&self.lookup(gtid), from_switchto, cpu),
            MessageKind::TaskBlocked {
                gtid,
                from_switchto,
                cpu,
            } => self.task_blocked(&self.lookup(gtid), from_switchto, cpu),
            MessageKind::TaskPreempt {
                gtid,
                from_switchto,
                cpu,
            } => self.task_preempted(&self.lookup(gtid), from_switchto, cpu),
            MessageKind::TaskSwitchto { gtid } => self.task_switchto(&self.lookup(gtid)),
            MessageKind::TaskDeparted {
                gtid,
                from_switchto,
                cpu,
            } => self.task_departed(&self.lookup(gtid), from_switchto, cpu),
            MessageKind::TaskDead { gtid } => self.task_dead(&self.lookup(gtid)),
            MessageKind::CpuTick { cpu } => self.cpu_tick(cpu),
        }
    }

    fn lookup(&self, gtid: Gtid) -> Arc<FlipTask> {
        self.allocator
            .get(gtid)
            .unwrap_or_else(|| panic!("message for unknown task {gtid}"))
    }

    fn task_new(&self, gtid: Gtid, runnable: bool, seqnum: BarrierToken) {
        debug!("[TaskNew] {gtid} runnable={runnable}");
        let task = Arc::new(FlipTask::new(gtid, self.enclave.task_status_word(gtid)));
        task.set_remaining_time();
        task.set_seqnum(seqnum);
        self.allocator.insert(gtid, task.clone());

        if runnable {
            task.set_run_state(RunState::Runnable);
            let cpu = self.assign_cpu(&task);
            self.migrate(&task, cpu, seqnum);
        } else {
            // Stay blocked and unplaced until the wakeup shows up; migrating
            // now would race with the wakeup landing on the default channel.
        }
    }

    fn task_wakeup(&self, task: &Arc<FlipTask>, deferrable: bool, seqnum: BarrierToken) {
        debug!("[TaskWakeup] {} deferrable={deferrable}", task.gtid());
        assert!(
            task.blocked(),
            "wakeup of task {} in state {}",
            task.gtid(),
            task.run_state()
        );
        task.set_run_state(RunState::Runnable);

        // A non-deferrable wakeup gets the same preference as a preempted
        // task: it may be holding locks other tasks need to make progress.
        task.set_prio_boost(!deferrable);

        if task.cpu() < 0 {
            // No more messages can be pending for this task until it goes
            // back on CPU, so the migration cannot race.
            let cpu = self.assign_cpu(task);
            self.migrate(task, cpu, seqnum);
        } else {
            self.cpu_state_of(task).run_queue.enqueue(task);
        }
    }

    fn task_yield(&self, task: &Arc<FlipTask>, from_switchto: bool, msg_cpu: CpuId) {
        debug!("[TaskYield] {}", task.gtid());
        self.task_off_cpu(task, false, from_switchto);
        self.cpu_state_of(task).run_queue.enqueue(task);
        if from_switchto {
            self.enclave.agent(msg_cpu).ping();
        }
    }

    fn task_blocked(&self, task: &Arc<FlipTask>, from_switchto: bool, msg_cpu: CpuId) {
        debug!("[TaskBlocked] {}", task.gtid());
        self.task_off_cpu(task, true, from_switchto);
        if from_switchto {
            self.enclave.agent(msg_cpu).ping();
        }
    }

    fn task_preempted(&self, task: &Arc<FlipTask>, from_switchto: bool, msg_cpu: CpuId) {
        debug!("[TaskPreempted] {}", task.gtid());
        self.task_off_cpu(task, false, from_switchto);

        // Preemption victims go back to the head of their band.
        task.set_preempted(true);
        task.set_prio_boost(true);
        self.cpu_state_of(task).run_queue.enqueue(task);
        if from_switchto {
            self.enclave.agent(msg_cpu).ping();
        }
    }

    fn task_switchto(&self, task: &Arc<FlipTask>) {
        debug!("[TaskSwitchto] {}", task.gtid());
        self.task_off_cpu(task, true, false);
    }

    fn task_departed(&self, task: &Arc<FlipTask>, from_switchto: bool, msg_cpu: CpuId) {
        debug!("[TaskDeparted] {}", task.gtid());
        if task.oncpu() || from_switchto {
            self.task_off_cpu(task, false, from_switchto);
        } else if task.queued() {
            self.cpu_state_of(task).run_queue.erase(task);
        } else {
            assert!(task.blocked());
        }

        if from_switchto {
            self.enclave.agent(msg_cpu).ping();
        }

        self.allocator.free(task.gtid());
    }

    fn task_dead(&self, task: &Arc<FlipTask>) {
        debug!("[TaskDead] {}", task.gtid());
        assert!(
            task.blocked(),
            "dead task {} in state {}",
            task.gtid(),
            task.run_state()
        );
        self.allocator.free(task.gtid());
    }

    fn cpu_tick(&self, cpu: CpuId) {
        self.check_preempt_tick(cpu);
    }

    /// Charge the running task for the tick interval; arm the preempt flag
    /// when its slice runs out. The commit loop does the actual unwinding.
    fn check_preempt_tick(&self, cpu: CpuId) {
        let cs = self.cpu_state(cpu);
        let current = cs.current.lock().unwrap();
        if let Some(task) = current.as_ref() {
            if task.update_remaining_time(self.enclave.now_ns(), false) {
                cs.preempt_curr.store(true, Ordering::Release);
            }
        }
    }

    /// Pick the CPU for a task that has never been placed. Strict round
    /// robin; load is deliberately ignored.
    fn assign_cpu(&self, task: &FlipTask) -> CpuId {
        let cpus = self.enclave.topology().cpus();
        let next = self.rr_cursor.fetch_add(1, Ordering::Relaxed);
        let cpu = cpus[next % cpus.len()].id;
        debug!("[AssignCpu] {} -> {cpu}", task.gtid());
        cpu
    }

    /// Bind a runnable, unplaced task to a CPU. The association must land
    /// before the task becomes visible in the runqueue, otherwise it could
    /// get on CPU while still producing into the old channel.
    fn migrate(&self, task: &Arc<FlipTask>, cpu: CpuId, seqnum: BarrierToken) {
        assert_eq!(task.run_state(), RunState::Runnable);
        assert_eq!(task.cpu(), -1);

        let cs = self.cpu_state(cpu);
        cs.channel
            .associate_task(task.gtid(), seqnum)
            .expect("stale barrier on task association");

        debug!("[Migrate] {} -> {cpu}", task.gtid());
        task.set_cpu(cpu.0 as i32);
        cs.run_queue.enqueue(task);

        // Get the agent's attention so it notices the new task.
        self.enclave.agent(cpu).ping();
        Counters::inc(&self.counters.nr_migrations);
    }

    fn task_off_cpu(&self, task: &Arc<FlipTask>, blocked: bool, from_switchto: bool) {
        debug!("[TaskOffCpu] {} blocked={blocked}", task.gtid());
        let cs = self.cpu_state_of(task);
        {
            let mut current = cs.current.lock().unwrap();

            // Slice accounting for whoever occupies the CPU. A from_switchto
            // event can arrive when the CPU has no current task; skip the
            // update then.
            if let Some(curr) = current.as_ref() {
                curr.update_remaining_time(self.enclave.now_ns(), true);
            }

            if task.oncpu() {
                let curr = current.as_ref().expect("on-CPU task with no current");
                assert_eq!(curr.gtid(), task.gtid());
                *current = None;
            } else {
                assert!(from_switchto);
                assert_eq!(task.run_state(), RunState::Blocked);
            }
        }

        task.set_run_state(if blocked {
            RunState::Blocked
        } else {
            RunState::Runnable
        });
    }

    fn task_on_cpu(&self, task: &Arc<FlipTask>, cpu: CpuId) {
        debug!("[TaskOnCpu] {} -> {cpu}", task.gtid());
        let cs = self.cpu_state(cpu);
        *cs.current.lock().unwrap() = Some(task.clone());

        task.set_run_state(RunState::OnCpu);
        task.set_runtime_at_last_pick(self.enclave.now_ns());
        task.set_cpu(cpu.0 as i32);
        task.set_preempted(false);
        task.set_prio_boost(false);
    }

    /// The commit half of a scheduling round.
    pub fn flip_schedule(&self, cpu: CpuId, agent_barrier: BarrierToken, prio_boost: bool) {
        let cs = self.cpu_state(cpu);

        if cs.preempt_curr.swap(false, Ordering::AcqRel) {
            let prev = cs.current.lock().unwrap().clone();
            if let Some(prev) = prev {
                debug!("preempting {} on {cpu}", prev.gtid());
                self.task_off_cpu(&prev, false, false);
                cs.run_queue.enqueue(&prev);
                Counters::inc(&self.counters.nr_tick_preempts);
            }
        }

        let next = if prio_boost {
            // A boosted agent yields the CPU back to the kernel.
            None
        } else {
            let current = cs.current.lock().unwrap().clone();
            current.or_else(|| cs.run_queue.dequeue())
        };

        let req = self.enclave.run_request(cpu);
        match next {
            Some(next) => {
                // A switchto target can still be on a remote CPU when its
                // wakeup is observed; wait for it to get off before
                // committing it here.
                while next.status_word().on_cpu() {
                    std::hint::spin_loop();
                }

                req.open(RunRequestOptions {
                    target: next.gtid(),
                    target_barrier: next.seqnum(),
                    agent_barrier,
                    commit_flags: COMMIT_AT_TXN_COMMIT,
                });

                if req.commit() {
                    self.task_on_cpu(&next, cpu);
                    Counters::inc(&self.counters.nr_commits);
                } else {
                    debug!("commit of {} failed on {cpu} ({})", next.gtid(), req.state());
                    let was_current = cs
                        .current
                        .lock()
                        .unwrap()
                        .as_ref()
                        .is_some_and(|c| c.gtid() == next.gtid());
                    if was_current {
                        self.task_off_cpu(&next, false, false);
                    }

                    // Put it at the head so it is the first candidate on
                    // the next round.
                    next.set_prio_boost(true);
                    cs.run_queue.enqueue(&next);
                    Counters::inc(&self.counters.nr_commit_fails);
                }
            }
            None => {
                let mut flags = 0;
                if prio_boost
                    && (cs.current.lock().unwrap().is_some() || !cs.run_queue.is_empty())
                {
                    // There is still work; ask to be resumed once the CPU
                    // idles instead of yielding outright.
                    flags = RTLA_ON_IDLE;
                }
                req.local_yield(agent_barrier, flags);
                if flags == RTLA_ON_IDLE {
                    Counters::inc(&self.counters.nr_idle_yields);
                } else {
                    Counters::inc(&self.counters.nr_yields);
                }
            }
        }
    }

    pub fn metrics(&self) -> Metrics {
        let nr_queued: usize = self.cpu_states.iter().map(|cs| cs.run_queue.len()).sum();
        let nr_running: usize = self
            .cpu_states
            .iter()
            .filter(|cs| cs.current.lock().unwrap().is_some())
            .count();
        let nr_band_flips: u64 = self.cpu_states.iter().map(|cs| cs.run_queue.nr_flips()).sum();
        Metrics {
            nr_cpus: self.enclave.topology().nr_cpus() as u64,
            nr_tasks: self.allocator.len() as u64,
            nr_queued: nr_queued as u64,
            nr_running: nr_running as u64,
            nr_messages: self.counters.nr_messages.load(Ordering::Relaxed),
            nr_commits: self.counters.nr_commits.load(Ordering::Relaxed),
            nr_commit_fails: self.counters.nr_commit_fails.load(Ordering::Relaxed),
            nr_yields: self.counters.nr_yields.load(Ordering::Relaxed),
            nr_idle_yields: self.counters.nr_idle_yields.load(Ordering::Relaxed),
            nr_tick_preempts: self.counters.nr_tick_preempts.load(Ordering::Relaxed),
            nr_migrations: self.counters.nr_migrations.load(Ordering::Relaxed),
            nr_band_flips,
        }
    }

    pub fn dump_all_tasks(&self) {
        info!("task         state     cpu");
        self.allocator.for_each(|gtid, task| {
            info!(
                "{:<12} {:<9} {:<4}{}{}",
                gtid.to_string(),
                task.run_state().to_string(),
                task.cpu(),
                if task.preempted() { 'P' } else { '-' },
                if task.prio_boost() { 'B' } else { '-' },
            );
        });
    }

    pub fn dump_state(&self, cpu: CpuId, all_tasks: bool) {
        if all_tasks {
            self.dump_all_tasks();
        }

        let cs = self.cpu_state(cpu);
        let current = self.current_gtid(cpu);
        if !all_tasks && current.is_none() && cs.run_queue.is_empty() {
            return;
        }
        info!(
            "SchedState[{}]: {} rq_len={}",
            cpu,
            current.map_or_else(|| "none".to_string(), |g| g.to_string()),
            cs.run_queue.len()
        );
    }
}
