// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Group CPU bandwidth control.
//!
//! A group with a quota owns a global runtime pool ([`CfsBandwidth`]) that
//! is refilled once per period. Each of the group's per-CPU queues draws
//! from it in slices into its local balance ([`BandwidthLimiter`]). A queue
//! that runs dry and cannot draw more is throttled: its group entity is
//! taken off the parent queue until the period timer hands out runtime
//! again. Runtime left over when a queue goes idle flows back to the pool
//! and is redistributed by a short slack timer.

use std::collections::VecDeque;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::ConfigError;
use crate::entity::DEQUEUE_SLEEP;
use crate::entity::ENQUEUE_WAKEUP;
use crate::sched::FairSched;
use crate::timer::forward;
use crate::timer::TimerKind;
use crate::types::{CfsRqId, CpuId, GroupId, Pid, TimeNs, NSEC_PER_MSEC, NSEC_PER_SEC, TICK_NSEC};

pub const DEFAULT_CFS_PERIOD: TimeNs = 100 * NSEC_PER_MSEC;
pub const MIN_CFS_QUOTA_PERIOD: TimeNs = NSEC_PER_MSEC;
pub const MAX_CFS_QUOTA_PERIOD: TimeNs = NSEC_PER_SEC;
/// Runtime a queue keeps when it hands the rest back.
pub const MIN_CFS_RQ_RUNTIME: i64 = NSEC_PER_MSEC as i64;
/// No slack redistribution this close to a refill.
pub const MIN_BANDWIDTH_EXPIRATION: i64 = 2 * NSEC_PER_MSEC as i64;
pub const CFS_BANDWIDTH_SLACK_PERIOD: TimeNs = 5 * NSEC_PER_MSEC;
/// Late period timers in a row before the period is stretched.
const MAX_PERIOD_OVERRUNS: u32 = 3;

/// Local runtime state of one per-CPU queue.
#[derive(Debug, Clone, Default)]
pub struct BandwidthLimiter {
    pub enabled: bool,
    /// Expiry of the pool generation the local runtime came from.
    pub expires: TimeNs,
    pub remaining: i64,
    pub throttled: bool,
    /// Number of throttled queues at or above this one.
    pub throttle_count: u32,
    /// `throttle_count` has been synced with the ancestors.
    pub throttle_uptodate: bool,
    pub throttled_clock: TimeNs,
    pub throttled_clock_task: TimeNs,
    pub throttled_clock_task_time: TimeNs,
}

/// Per-group quota, runtime pool and statistics.
#[derive(Debug, Clone)]
pub struct CfsBandwidth {
    pub period: TimeNs,
    /// `None` means unlimited.
    pub quota: Option<TimeNs>,
    pub runtime: u64,
    pub runtime_expires: TimeNs,
    /// No queue asked for runtime during the last period.
    pub idle: bool,
    pub timer_active: bool,
    pub distribute_running: bool,
    /// Expiry the period timer was last programmed for.
    pub period_expiry: TimeNs,
    pub overrun_streak: u32,
    pub throttled_cfs_rq: VecDeque<CfsRqId>,
    pub nr_periods: u64,
    pub nr_throttled: u64,
    pub throttled_time: u64,
}

impl Default for CfsBandwidth {
    fn default() -> Self {
        Self {
            period: DEFAULT_CFS_PERIOD,
            quota: None,
            runtime: 0,
            runtime_expires: 0,
            idle: false,
            timer_active: false,
            distribute_running: false,
            period_expiry: 0,
            overrun_streak: 0,
            throttled_cfs_rq: VecDeque::new(),
            nr_periods: 0,
            nr_throttled: 0,
            throttled_time: 0,
        }
    }
}

impl CfsBandwidth {
    /// Refill the pool for a new period.
    pub fn refill(&mut self, now: TimeNs) {
        if let Some(quota) = self.quota {
            self.runtime = quota;
            self.runtime_expires = now + self.period;
        }
    }
}

impl FairSched {
    /// Task clock of a queue. It stands still while the queue is throttled.
    pub(crate) fn cfs_rq_clock_task(&self, q: CfsRqId) -> TimeNs {
        let cfs_rq = &self.cfs_rqs[q.idx()];
        let rt = &cfs_rq.runtime;
        if rt.throttle_count > 0 {
            return rt.throttled_clock_task;
        }
        self.rqs[cfs_rq.cpu.idx()]
            .clock_task
            .saturating_sub(rt.throttled_clock_task_time)
    }

    /// Groups at and below `root`, parents first.
    pub(crate) fn group_subtree(&self, root: GroupId) -> Vec<GroupId> {
        let mut out = vec![root];
        let mut i = 0;
        while i < out.len() {
            out.extend(self.groups[out[i].idx()].children.iter().copied());
            i += 1;
        }
        out
    }

    fn start_cfs_bandwidth(&mut self, group: GroupId) {
        let now = self.now;
        let b = &mut self.groups[group.idx()].bandwidth;
        let (expiry, _) = forward(b.period_expiry, now, b.period);
        b.period_expiry = expiry;
        b.timer_active = true;
        self.timers.arm(TimerKind::BandwidthPeriod(group), expiry);
    }

    fn assign_cfs_rq_runtime(&mut self, q: CfsRqId) -> bool {
        let group = self.cfs_rqs[q.idx()].group;
        let now = self.now;
        let slice = self.cfg.bandwidth_slice as i64;
        let min_amount = slice - self.cfs_rqs[q.idx()].runtime.remaining;

        let mut start_timer = false;
        let b = &mut self.groups[group.idx()].bandwidth;
        let amount = match b.quota {
            None => min_amount,
            Some(_) => {
                if !b.timer_active {
                    b.refill(now);
                    start_timer = true;
                }
                let mut amount = 0;
                if b.runtime > 0 {
                    amount = (b.runtime as i64).min(min_amount).max(0);
                    b.runtime -= amount as u64;
                    b.idle = false;
                }
                amount
            }
        };
        let expires = b.runtime_expires;
        if start_timer {
            self.start_cfs_bandwidth(group);
        }

        let rt = &mut self.cfs_rqs[q.idx()].runtime;
        rt.remaining += amount;
        // Runtime from a newer pool generation extends the local lease.
        if (expires as i64).wrapping_sub(rt.expires as i64) > 0 {
            rt.expires = expires;
        }
        rt.remaining > 0
    }

    fn expire_cfs_rq_runtime(&mut self, q: CfsRqId) {
        let cpu = self.cfs_rqs[q.idx()].cpu;
        let clock = self.rqs[cpu.idx()].clock;
        let group = self.cfs_rqs[q.idx()].group;
        let global_expires = self.groups[group.idx()].bandwidth.runtime_expires;
        let rt = &mut self.cfs_rqs[q.idx()].runtime;

        if (clock as i64).wrapping_sub(rt.expires as i64) < 0 || rt.remaining < 0 {
            return;
        }
        if rt.expires != global_expires {
            // Our clock ran ahead of the timer's: extend by one tick.
            rt.expires += TICK_NSEC;
        } else {
            rt.remaining = 0;
        }
    }

    /// Charge `delta_exec` against a queue's local runtime.
    pub(crate) fn account_cfs_rq_runtime(&mut self, q: CfsRqId, delta_exec: u64) {
        if !self.cfs_rqs[q.idx()].runtime.enabled {
            return;
        }
        self.cfs_rqs[q.idx()].runtime.remaining -= delta_exec as i64;
        self.expire_cfs_rq_runtime(q);

        if self.cfs_rqs[q.idx()].runtime.remaining > 0 {
            return;
        }
        if !self.assign_cfs_rq_runtime(q) && self.cfs_rqs[q.idx()].curr.is_some() {
            let cpu = self.cfs_rqs[q.idx()].cpu;
            self.resched_curr(cpu);
        }
    }

    /// Would `pid`'s queue hierarchy throttle once it stops running?
    pub fn task_will_be_throttled(&self, pid: Pid) -> bool {
        let Some(task) = self.tasks.get(&pid) else {
            return false;
        };
        let mut se = Some(task.se);
        while let Some(e) = se {
            let q = &self.cfs_rqs[self.entities[e.idx()].cfs_rq.idx()];
            if q.runtime.enabled && q.runtime.remaining <= 0 {
                return true;
            }
            se = self.entities[e.idx()].parent;
        }
        false
    }

    /// Either end of a migration of a `group` task sits under a throttled
    /// queue.
    pub(crate) fn throttled_lb_pair(&self, group: GroupId, src: CpuId, dst: CpuId) -> bool {
        let tg = &self.groups[group.idx()];
        self.cfs_rqs[tg.cfs_rq[src.idx()].idx()].throttled_hierarchy()
            || self.cfs_rqs[tg.cfs_rq[dst.idx()].idx()].throttled_hierarchy()
    }

    pub(crate) fn throttle_cfs_rq(&mut self, q: CfsRqId) {
        let cpu = self.cfs_rqs[q.idx()].cpu;
        let group = self.cfs_rqs[q.idx()].group;
        let clock_task = self.rqs[cpu.idx()].clock_task;

        for g in self.group_subtree(group) {
            let c = self.groups[g.idx()].cfs_rq[cpu.idx()];
            let rt = &mut self.cfs_rqs[c.idx()].runtime;
            if rt.throttle_count == 0 {
                rt.throttled_clock_task = clock_task;
            }
            rt.throttle_count += 1;
        }

        let task_delta = self.cfs_rqs[q.idx()].h_nr_running;
        let stats = self.cfs_rqs[q.idx()].hmp_stats;
        let mut dequeue = true;
        let mut se = self.cfs_rqs[q.idx()].se;
        while let Some(e) = se {
            if !self.entities[e.idx()].on_rq {
                break;
            }
            let qcfs = self.entities[e.idx()].cfs_rq;
            if dequeue {
                self.dequeue_entity(qcfs, e, DEQUEUE_SLEEP);
            }
            let parent = &mut self.cfs_rqs[qcfs.idx()];
            parent.h_nr_running -= task_delta;
            parent.hmp_stats.sub_stats(&stats);
            if parent.load.weight != 0 {
                dequeue = false;
            }
            se = self.entities[e.idx()].parent;
        }
        if se.is_none() {
            self.sub_nr_running(cpu, task_delta);
            self.rqs[cpu.idx()].hmp_stats.sub_stats(&stats);
        }

        let clock = self.rqs[cpu.idx()].clock;
        let rt = &mut self.cfs_rqs[q.idx()].runtime;
        rt.throttled = true;
        rt.throttled_clock = clock;

        let b = &mut self.groups[group.idx()].bandwidth;
        // Queues throttled while a distribution is running go first so the
        // distribution does not hand them the runtime it is about to use.
        if b.distribute_running {
            b.throttled_cfs_rq.push_front(q);
        } else {
            b.throttled_cfs_rq.push_back(q);
        }
        let timer_active = b.timer_active;
        if !timer_active {
            self.start_cfs_bandwidth(group);
        }
        self.metrics.throttles.increment(1);
        info!(cpu = cpu.0, group = group.0, nr = task_delta, "throttle");
    }

    pub(crate) fn unthrottle_cfs_rq(&mut self, q: CfsRqId) {
        let cpu = self.cfs_rqs[q.idx()].cpu;
        let group = self.cfs_rqs[q.idx()].group;
        self.update_rq_clock(cpu);
        let clock = self.rqs[cpu.idx()].clock;
        let clock_task = self.rqs[cpu.idx()].clock_task;

        let throttled_clock = {
            let rt = &mut self.cfs_rqs[q.idx()].runtime;
            rt.throttled = false;
            rt.throttled_clock
        };
        let b = &mut self.groups[group.idx()].bandwidth;
        b.throttled_time += clock.saturating_sub(throttled_clock);
        b.throttled_cfs_rq.retain(|&c| c != q);

        for g in self.group_subtree(group).into_iter().rev() {
            let c = self.groups[g.idx()].cfs_rq[cpu.idx()];
            let rt = &mut self.cfs_rqs[c.idx()].runtime;
            rt.throttle_count = rt.throttle_count.saturating_sub(1);
            if rt.throttle_count == 0 {
                rt.throttled_clock_task_time += clock_task.saturating_sub(rt.throttled_clock_task);
            }
        }

        if self.cfs_rqs[q.idx()].load.weight == 0 {
            return;
        }

        let task_delta = self.cfs_rqs[q.idx()].h_nr_running;
        let stats = self.cfs_rqs[q.idx()].hmp_stats;
        let mut enqueue = true;
        let mut se = self.cfs_rqs[q.idx()].se;
        while let Some(e) = se {
            if self.entities[e.idx()].on_rq {
                enqueue = false;
            }
            let qcfs = self.entities[e.idx()].cfs_rq;
            if enqueue {
                self.enqueue_entity(qcfs, e, ENQUEUE_WAKEUP);
            }
            let parent = &mut self.cfs_rqs[qcfs.idx()];
            parent.h_nr_running += task_delta;
            parent.hmp_stats.add_stats(&stats);
            if parent.throttled() {
                break;
            }
            se = self.entities[e.idx()].parent;
        }
        if se.is_none() {
            self.add_nr_running(cpu, task_delta);
            self.rqs[cpu.idx()].hmp_stats.add_stats(&stats);
        }

        let rq = &self.rqs[cpu.idx()];
        if rq.curr.is_none() && self.cfs_rqs[rq.cfs.idx()].nr_running > 0 {
            self.resched_curr(cpu);
        }
        info!(cpu = cpu.0, group = group.0, nr = task_delta, "unthrottle");
    }

    /// Hand `remaining` out to throttled queues in list order. Returns how
    /// much was used.
    fn distribute_cfs_runtime(&mut self, group: GroupId, mut remaining: u64, expires: TimeNs) -> u64 {
        let starting = remaining;
        let list: Vec<CfsRqId> = self.groups[group.idx()]
            .bandwidth
            .throttled_cfs_rq
            .iter()
            .copied()
            .collect();
        for q in list {
            if !self.cfs_rqs[q.idx()].throttled() {
                continue;
            }
            let cpu = self.cfs_rqs[q.idx()].cpu;
            self.update_rq_clock(cpu);

            let rt = &mut self.cfs_rqs[q.idx()].runtime;
            let runtime = ((-rt.remaining + 1).max(0) as u64).min(remaining);
            remaining -= runtime;
            rt.remaining += runtime as i64;
            rt.expires = expires;
            if rt.remaining > 0 {
                self.unthrottle_cfs_rq(q);
            }
            if remaining == 0 {
                break;
            }
        }
        starting - remaining
    }

    /// One period elapsed `overrun` times. Returns whether the group went
    /// idle and the timer can stop.
    fn do_sched_cfs_period_timer(&mut self, group: GroupId, overrun: u64) -> bool {
        let now = self.now;
        let b = &mut self.groups[group.idx()].bandwidth;
        if b.quota.is_none() {
            b.timer_active = false;
            return true;
        }

        let mut throttled = !b.throttled_cfs_rq.is_empty();
        b.nr_periods += overrun;
        if b.idle && !throttled {
            b.timer_active = false;
            return true;
        }

        b.timer_active = true;
        b.refill(now);
        if !throttled {
            b.idle = true;
            return false;
        }
        b.nr_throttled += overrun;

        loop {
            let b = &mut self.groups[group.idx()].bandwidth;
            if !throttled || b.runtime == 0 || b.distribute_running {
                break;
            }
            let runtime = b.runtime;
            let expires = b.runtime_expires;
            b.distribute_running = true;

            let used = self.distribute_cfs_runtime(group, runtime, expires);

            let b = &mut self.groups[group.idx()].bandwidth;
            b.distribute_running = false;
            throttled = !b.throttled_cfs_rq.is_empty();
            b.runtime -= used.min(b.runtime);
            if used == 0 {
                break;
            }
        }
        self.groups[group.idx()].bandwidth.idle = false;
        false
    }

    /// Period timer expiry.
    pub(crate) fn sched_cfs_period_timer(&mut self, group: GroupId) {
        let now = self.now;
        let b = &mut self.groups[group.idx()].bandwidth;
        let (expiry, overrun) = forward(b.period_expiry, now, b.period);
        if overrun == 0 {
            self.timers.arm(TimerKind::BandwidthPeriod(group), expiry);
            return;
        }
        b.period_expiry = expiry;

        if overrun > 1 {
            b.overrun_streak += 1;
        } else {
            b.overrun_streak = 0;
        }
        if b.overrun_streak > MAX_PERIOD_OVERRUNS {
            let old = b.period;
            let new = old * 2;
            if new < MAX_CFS_QUOTA_PERIOD {
                b.period = new;
                b.quota = b.quota.map(|q| q * 2);
                warn!(
                    group = group.0,
                    period_us = new / 1000,
                    quota_us = b.quota.map(|q| q / 1000),
                    "bandwidth period too short, scaling up"
                );
            } else {
                warn!(
                    group = group.0,
                    period_us = old / 1000,
                    "bandwidth period too short, but cannot scale up further"
                );
            }
            b.overrun_streak = 0;
        }

        let idle = self.do_sched_cfs_period_timer(group, overrun);
        if !idle {
            let expiry = self.groups[group.idx()].bandwidth.period_expiry;
            self.timers.arm(TimerKind::BandwidthPeriod(group), expiry);
        }
    }

    /// Is the next refill less than `min` away?
    fn runtime_refresh_within(&self, group: GroupId, min: i64) -> bool {
        match self
            .timers
            .remaining(TimerKind::BandwidthPeriod(group), self.now)
        {
            Some(left) => left < min,
            None => false,
        }
    }

    fn start_cfs_slack_bandwidth(&mut self, group: GroupId) {
        if self.runtime_refresh_within(
            group,
            CFS_BANDWIDTH_SLACK_PERIOD as i64 + MIN_BANDWIDTH_EXPIRATION,
        ) {
            return;
        }
        self.timers.arm(
            TimerKind::BandwidthSlack(group),
            self.now + CFS_BANDWIDTH_SLACK_PERIOD,
        );
    }

    fn give_back_cfs_rq_runtime(&mut self, q: CfsRqId) {
        let slack = self.cfs_rqs[q.idx()].runtime.remaining - MIN_CFS_RQ_RUNTIME;
        if slack <= 0 {
            return;
        }
        let group = self.cfs_rqs[q.idx()].group;
        let local_expires = self.cfs_rqs[q.idx()].runtime.expires;
        let slice = self.cfg.bandwidth_slice;

        let b = &mut self.groups[group.idx()].bandwidth;
        if b.quota.is_some() && local_expires == b.runtime_expires {
            b.runtime += slack as u64;
            if b.runtime > slice && !b.throttled_cfs_rq.is_empty() {
                self.start_cfs_slack_bandwidth(group);
            }
        }
        self.cfs_rqs[q.idx()].runtime.remaining -= slack;
    }

    /// A queue went empty: return what it does not need.
    pub(crate) fn return_cfs_rq_runtime(&mut self, q: CfsRqId) {
        let cfs_rq = &self.cfs_rqs[q.idx()];
        if !cfs_rq.runtime.enabled || cfs_rq.nr_running > 0 {
            return;
        }
        self.give_back_cfs_rq_runtime(q);
    }

    /// Slack timer expiry.
    pub(crate) fn do_sched_cfs_slack_timer(&mut self, group: GroupId) {
        let slice = self.cfg.bandwidth_slice;
        if self.groups[group.idx()].bandwidth.distribute_running {
            return;
        }
        if self.runtime_refresh_within(group, MIN_BANDWIDTH_EXPIRATION) {
            return;
        }

        let b = &mut self.groups[group.idx()].bandwidth;
        let mut runtime = 0;
        if b.quota.is_some() && b.runtime > slice {
            runtime = b.runtime;
        }
        let expires = b.runtime_expires;
        if runtime == 0 {
            return;
        }
        b.distribute_running = true;

        let used = self.distribute_cfs_runtime(group, runtime, expires);
        debug!(group = group.0, used, "slack distribution");

        let b = &mut self.groups[group.idx()].bandwidth;
        if expires == b.runtime_expires {
            b.runtime -= used.min(b.runtime);
        }
        b.distribute_running = false;
    }

    /// First enqueue onto an empty queue: sync the throttle count and
    /// throttle right away if the queue is already out of runtime.
    pub(crate) fn check_enqueue_throttle(&mut self, q: CfsRqId) {
        if !self.cfs_rqs[q.idx()].runtime.throttle_uptodate {
            self.cfs_rqs[q.idx()].runtime.throttle_uptodate = true;
            let cpu = self.cfs_rqs[q.idx()].cpu;
            let mut g = self.groups[self.cfs_rqs[q.idx()].group.idx()].parent;
            while let Some(pg) = g {
                let pq = self.groups[pg.idx()].cfs_rq[cpu.idx()];
                if self.cfs_rqs[pq.idx()].runtime.throttle_uptodate {
                    let count = self.cfs_rqs[pq.idx()].runtime.throttle_count;
                    let clock_task = self.rqs[cpu.idx()].clock_task;
                    let rt = &mut self.cfs_rqs[q.idx()].runtime;
                    rt.throttle_count = count;
                    rt.throttled_clock_task = clock_task;
                    break;
                }
                g = self.groups[pg.idx()].parent;
            }
        }

        let cfs_rq = &self.cfs_rqs[q.idx()];
        if !cfs_rq.runtime.enabled || cfs_rq.curr.is_some() || cfs_rq.throttled() {
            return;
        }
        self.account_cfs_rq_runtime(q, 0);
        if self.cfs_rqs[q.idx()].runtime.remaining <= 0 {
            self.throttle_cfs_rq(q);
        }
    }

    /// Throttle a queue that ran out while its entity was running. Returns
    /// whether the queue is throttled.
    pub(crate) fn check_cfs_rq_runtime(&mut self, q: CfsRqId) -> bool {
        let cfs_rq = &self.cfs_rqs[q.idx()];
        if !cfs_rq.runtime.enabled || cfs_rq.runtime.remaining > 0 {
            return false;
        }
        if cfs_rq.throttled() {
            return true;
        }
        self.throttle_cfs_rq(q);
        true
    }

    /// Re-derive which of `cpu`'s queues are bandwidth limited.
    pub(crate) fn update_runtime_enabled(&mut self, cpu: CpuId) {
        for g in 0..self.groups.len() {
            let tg = &self.groups[g];
            let enabled = tg.bandwidth.quota.is_some();
            let q = tg.cfs_rq[cpu.idx()];
            self.cfs_rqs[q.idx()].runtime.enabled = enabled;
        }
    }

    /// Leave every queue of an offline CPU runnable and unlimited.
    pub(crate) fn unthrottle_offline_cfs_rqs(&mut self, cpu: CpuId) {
        for g in 0..self.groups.len() {
            let q = self.groups[g].cfs_rq[cpu.idx()];
            let rt = &mut self.cfs_rqs[q.idx()].runtime;
            if !rt.enabled {
                continue;
            }
            rt.remaining = 1;
            rt.enabled = false;
            if rt.throttled {
                self.unthrottle_cfs_rq(q);
            }
        }
    }

    /// Set a group's quota and period. `quota: None` lifts the limit.
    pub fn set_quota_period(
        &mut self,
        group: GroupId,
        quota: Option<TimeNs>,
        period: TimeNs,
    ) -> Result<(), ConfigError> {
        let tg = self
            .groups
            .get(group.idx())
            .ok_or(ConfigError::UnknownGroup(group))?;
        if tg.is_root() {
            return Err(ConfigError::RootGroup);
        }
        let check = |name, value: u64, min: u64, max: u64| {
            if value < min || value > max {
                return Err(ConfigError::OutOfRange {
                    name,
                    value: value as i64,
                    min: min as i64,
                    max: max as i64,
                });
            }
            Ok(())
        };
        check("period", period, MIN_CFS_QUOTA_PERIOD, MAX_CFS_QUOTA_PERIOD)?;
        if let Some(q) = quota {
            check("quota", q, MIN_CFS_QUOTA_PERIOD, u64::MAX >> 1)?;
        }

        let now = self.now;
        let enabled = quota.is_some();
        let b = &mut self.groups[group.idx()].bandwidth;
        b.period = period;
        b.quota = quota;
        b.overrun_streak = 0;
        b.refill(now);
        let restart = enabled && b.timer_active;
        if restart {
            b.period_expiry = now;
            self.start_cfs_bandwidth(group);
        }
        if !enabled {
            self.groups[group.idx()].bandwidth.timer_active = false;
            self.timers.cancel(TimerKind::BandwidthPeriod(group));
            self.timers.cancel(TimerKind::BandwidthSlack(group));
        }

        for cpu in 0..self.rqs.len() {
            if !self.rqs[cpu].online {
                continue;
            }
            let q = self.groups[group.idx()].cfs_rq[cpu];
            let rt = &mut self.cfs_rqs[q.idx()].runtime;
            rt.enabled = enabled;
            rt.remaining = 0;
            if rt.throttled {
                self.unthrottle_cfs_rq(q);
            }
        }
        info!(
            group = group.0,
            quota_us = quota.map(|q| q / 1000),
            period_us = period / 1000,
            "bandwidth set"
        );
        Ok(())
    }
}
