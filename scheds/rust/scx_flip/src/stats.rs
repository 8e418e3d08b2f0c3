// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use anyhow::Result;
use log::info;
use scx_stats::prelude::*;
use scx_stats_derive::stat_doc;
use scx_stats_derive::Stats;
use serde::Deserialize;
use serde::Serialize;

/// Event counters bumped from the hot paths; folded into [`Metrics`] on
/// request.
#[derive(Debug, Default)]
pub struct Counters {
    pub nr_messages: AtomicU64,
    pub nr_commits: AtomicU64,
    pub nr_commit_fails: AtomicU64,
    pub nr_yields: AtomicU64,
    pub nr_idle_yields: AtomicU64,
    pub nr_tick_preempts: AtomicU64,
    pub nr_migrations: AtomicU64,
}

impl Counters {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[stat_doc]
#[derive(Clone, Debug, Default, Serialize, Deserialize, Stats)]
#[stat(top)]
pub struct Metrics {
    #[stat(desc = "Number of CPUs in the enclave")]
    pub nr_cpus: u64,
    #[stat(desc = "Amount of tasks currently alive")]
    pub nr_tasks: u64,
    #[stat(desc = "Amount of tasks sitting in runqueues")]
    pub nr_queued: u64,
    #[stat(desc = "Amount of tasks currently on a CPU")]
    pub nr_running: u64,
    #[stat(desc = "Number of messages drained from the channels")]
    pub nr_messages: u64,
    #[stat(desc = "Number of successful run-request commits")]
    pub nr_commits: u64,
    #[stat(desc = "Number of failed commits (stale barriers)")]
    pub nr_commit_fails: u64,
    #[stat(desc = "Number of local yields issued with nothing to run")]
    pub nr_yields: u64,
    #[stat(desc = "Number of boosted yields asking to be resumed on idle")]
    pub nr_idle_yields: u64,
    #[stat(desc = "Number of tick-driven slice preemptions")]
    pub nr_tick_preempts: u64,
    #[stat(desc = "Number of task migrations, initial placements included")]
    pub nr_migrations: u64,
    #[stat(desc = "Number of active/expired band flips across all runqueues")]
    pub nr_band_flips: u64,
}

impl Metrics {
    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "[{}] tasks -> a: {:>3} r: {:<2} q: {:<3} | msg: {:<6} | commit -> ok: {:<6} fail: {:<5} | yield: {:<6} idle: {:<5} | preempt: {:<5} mig: {:<4} flip: {:<5}",
            crate::SCHEDULER_NAME,
            self.nr_tasks,
            self.nr_running,
            self.nr_queued,
            self.nr_messages,
            self.nr_commits,
            self.nr_commit_fails,
            self.nr_yields,
            self.nr_idle_yields,
            self.nr_tick_preempts,
            self.nr_migrations,
            self.nr_band_flips,
        )?;
        Ok(())
    }

    fn delta(&self, rhs: &Self) -> Self {
        Self {
            nr_messages: self.nr_messages - rhs.nr_messages,
            nr_commits: self.nr_commits - rhs.nr_commits,
            nr_commit_fails: self.nr_commit_fails - rhs.nr_commit_fails,
            nr_yields: self.nr_yields - rhs.nr_yields,
            nr_idle_yields: self.nr_idle_yields - rhs.nr_idle_yields,
            nr_tick_preempts: self.nr_tick_preempts - rhs.nr_tick_preempts,
            nr_migrations: self.nr_migrations - rhs.nr_migrations,
            nr_band_flips: self.nr_band_flips - rhs.nr_band_flips,
            ..self.clone()
        }
    }
}

pub fn server_data() -> StatsServerData<(), Metrics> {
    let open: Box<dyn StatsOpener<(), Metrics>> = Box::new(move |(req_ch, res_ch)| {
        req_ch.send(())?;
        let mut prev = res_ch.recv()?;

        let read: Box<dyn StatsReader<(), Metrics>> = Box::new(move |_args, (req_ch, res_ch)| {
            req_ch.send(())?;
            let cur = res_ch.recv()?;
            let delta = cur.delta(&prev);
            prev = cur;
            delta.to_json()
        });

        Ok(read)
    });

    StatsServerData::new()
        .add_meta(Metrics::meta())
        .add_ops("top", StatsOps { open, close: None })
}

/// Poll the stats server and print deltas until shutdown.
pub fn monitor(intv: Duration, shutdown: Arc<AtomicBool>) -> Result<()> {
    let mut retry_cnt: u32 = 0;

    while !shutdown.load(Ordering::Relaxed) {
        let mut client = match StatsClient::new().connect(None) {
            Ok(v) => v,
            Err(_) => {
                if retry_cnt == 1 {
                    info!("Stats server not available, retrying...");
                }
                retry_cnt += 1;
                sleep(Duration::from_secs(1));
                continue;
            }
        };
        retry_cnt = 0;

        while !shutdown.load(Ordering::Relaxed) {
            let metrics = match client.request::<Metrics>("stats", vec![]) {
                Ok(v) => v,
                Err(_) => {
                    sleep(Duration::from_secs(1));
                    break;
                }
            };
            metrics.format(&mut std::io::stdout())?;
            sleep(intv);
        }
    }

    Ok(())
}
