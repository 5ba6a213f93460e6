// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Queue-level load tracking built on [`crate::pelt`].
//!
//! Entities accrue their own averages. A queue's average is the sum of the
//! averages of the entities attached to it plus its own decay, so an entity
//! leaving a queue has to take its contribution with it: synchronously when
//! the queue is at hand (detach), or through the queue's removed-load
//! counters when it is not (migration, exit).
//!
//! This module also keeps the per-CPU decayed load history (`cpu_load`)
//! that the balancer reads through [`FairSched::source_load`] and
//! [`FairSched::target_load`].

use crate::pelt::{
    add_avg, sub_avg, sub_positive, update_load_avg, HmpScale, PeltScale, LOAD_AVG_MAX,
    SCHED_CAPACITY_SCALE,
};
use crate::rq::CPU_LOAD_IDX_MAX;
use crate::sched::FairSched;
use crate::types::{CfsRqId, CpuId, EntityId, Pid, TimeNs};

const DEGRADE_SHIFT: u32 = 7;

/// Ticks after which the history at each index is fully decayed.
const DEGRADE_ZERO_TICKS: [u64; CPU_LOAD_IDX_MAX] = [0, 8, 32, 64, 128];

/// `128 * ((2^idx - 1) / 2^idx)^(2^bit)` per index and bit of the missed
/// tick count.
const DEGRADE_FACTOR: [[u64; 8]; CPU_LOAD_IDX_MAX] = [
    [0, 0, 0, 0, 0, 0, 0, 0],
    [64, 32, 8, 0, 0, 0, 0, 0],
    [96, 72, 40, 12, 1, 0, 0, 0],
    [112, 98, 75, 43, 15, 1, 0, 0],
    [120, 112, 98, 76, 45, 16, 2, 0],
];

/// Decay `load` as if `missed` ticks with zero load had passed at history
/// index `idx`.
pub fn decay_load_missed(load: u64, missed: u64, idx: usize) -> u64 {
    if missed == 0 {
        return load;
    }
    if missed >= DEGRADE_ZERO_TICKS[idx] {
        return 0;
    }
    if idx == 1 {
        return load >> missed;
    }

    let mut load = load;
    let mut missed = missed;
    let mut j = 0;
    while missed != 0 {
        if missed & 1 != 0 {
            load = (load * DEGRADE_FACTOR[idx][j]) >> DEGRADE_SHIFT;
        }
        missed >>= 1;
        j += 1;
    }
    load
}

impl FairSched {
    /// Accumulation scales for time spent on `cpu`. Task entities also
    /// accrue HMP demand.
    pub(crate) fn pelt_scale(&self, cpu: CpuId, is_task: bool) -> PeltScale {
        let cluster = self.topo.cluster_of(cpu);
        let hmp = is_task.then(|| HmpScale {
            cur_freq: cluster.cur_freq,
            max_possible_freq: self.topo.max_possible_freq,
            efficiency_factor: self.topo.efficiency_factor(cpu),
        });
        PeltScale {
            freq: SCHED_CAPACITY_SCALE * cluster.cur_freq / cluster.max_freq.max(1),
            cpu: self.rqs[cpu.idx()].cpu_capacity_orig,
            hmp,
        }
    }

    /// Fold in load that left while the queue was not held, then decay.
    /// Returns whether the average changed.
    pub(crate) fn update_cfs_rq_load_avg(&mut self, now: TimeNs, q: CfsRqId) -> bool {
        let cpu = self.cfs_rqs[q.idx()].cpu;
        let scale = self.pelt_scale(cpu, false);
        let cfs_rq = &mut self.cfs_rqs[q.idx()];

        let (r_load, r_util) = cfs_rq.take_removed();
        let removed = r_load != 0 || r_util != 0;
        sub_positive(&mut cfs_rq.avg.load_avg, r_load);
        sub_positive(&mut cfs_rq.avg.load_sum, r_load * LOAD_AVG_MAX);
        sub_positive(&mut cfs_rq.avg.util_avg, r_util);
        sub_positive(&mut cfs_rq.avg.util_sum, r_util * LOAD_AVG_MAX);

        let weight = cfs_rq.load.weight;
        let running = cfs_rq.curr.is_some();
        let decayed = update_load_avg(
            now,
            &mut cfs_rq.avg,
            weight,
            running,
            Some(&mut cfs_rq.runnable),
            &scale,
        );
        decayed || removed
    }

    /// Publish the queue's load to its group when it drifted far enough.
    pub(crate) fn update_tg_load_avg(&mut self, q: CfsRqId, force: bool) {
        let cfs_rq = &self.cfs_rqs[q.idx()];
        let tg = &self.groups[cfs_rq.group.idx()];
        if tg.is_root() {
            return;
        }
        let delta = cfs_rq.avg.load_avg as i64 - cfs_rq.tg_load_avg_contrib as i64;
        let div = self.cfg.tunables.hysteresis.tg_load_update_div as i64;
        if force || delta.abs() > cfs_rq.tg_load_avg_contrib as i64 / div {
            tg.add_load(delta);
            let cfs_rq = &mut self.cfs_rqs[q.idx()];
            cfs_rq.tg_load_avg_contrib = cfs_rq.avg.load_avg;
        }
    }

    /// Bring `se` and its queue up to date.
    pub(crate) fn update_load_avg(&mut self, se: EntityId, update_tg: bool) {
        let q = self.cfs_rq_of(se);
        let now = self.cfs_rq_clock_task(q);
        let cpu = self.cfs_rqs[q.idx()].cpu;
        let running = self.cfs_rqs[q.idx()].curr == Some(se);
        let e = &self.entities[se.idx()];
        let pid = e.task();
        let weight = if e.on_rq { e.load.weight } else { 0 };
        let scale = self.pelt_scale(cpu, pid.is_some());

        let e = &mut self.entities[se.idx()];
        let before = e.avg.runnable_avg_sum_scaled;
        update_load_avg(now, &mut e.avg, weight, running, None, &scale);
        let demand_changed = e.avg.runnable_avg_sum_scaled != before;

        if self.update_cfs_rq_load_avg(now, q) && update_tg {
            self.update_tg_load_avg(q, false);
        }
        if let Some(pid) = pid {
            if demand_changed && self.tasks[&pid].hmp_contrib.is_some() {
                self.fixup_hmp_sched_stats(pid);
            }
        }
    }

    /// Add `se`'s averages to `q`, first aging them to the queue's clock.
    pub(crate) fn attach_entity_load_avg(&mut self, q: CfsRqId, se: EntityId) {
        let cpu = self.cfs_rqs[q.idx()].cpu;
        let q_last = self.cfs_rqs[q.idx()].avg.last_update_time;
        let is_task = self.entities[se.idx()].is_task();
        let scale = self.pelt_scale(cpu, is_task);
        let age = self.cfg.features().attach_age_load;

        let e = &mut self.entities[se.idx()];
        if age && e.avg.last_update_time != 0 {
            update_load_avg(q_last, &mut e.avg, 0, false, None, &scale);
        }
        // Zero marks a detached entity, so never store it here.
        e.avg.last_update_time = q_last.max(1);
        let avg = e.avg;
        add_avg(&mut self.cfs_rqs[q.idx()].avg, &avg);
    }

    pub(crate) fn detach_entity_load_avg(&mut self, q: CfsRqId, se: EntityId) {
        let cpu = self.cfs_rqs[q.idx()].cpu;
        let q_last = self.cfs_rqs[q.idx()].avg.last_update_time;
        let running = self.cfs_rqs[q.idx()].curr == Some(se);
        let e = &self.entities[se.idx()];
        let weight = if e.on_rq { e.load.weight } else { 0 };
        let scale = self.pelt_scale(cpu, e.is_task());

        let e = &mut self.entities[se.idx()];
        update_load_avg(q_last, &mut e.avg, weight, running, None, &scale);
        let avg = e.avg;
        sub_avg(&mut self.cfs_rqs[q.idx()].avg, &avg);
    }

    /// Account `se` as runnable on `q`. An entity arriving from elsewhere
    /// (zero `last_update_time`) is attached here.
    pub(crate) fn enqueue_entity_load_avg(&mut self, q: CfsRqId, se: EntityId) {
        let now = self.cfs_rq_clock_task(q);
        let cpu = self.cfs_rqs[q.idx()].cpu;
        let running = self.cfs_rqs[q.idx()].curr == Some(se);
        let e = &self.entities[se.idx()];
        let migrated = e.avg.last_update_time == 0;
        let weight = if e.on_rq { e.load.weight } else { 0 };
        let scale = self.pelt_scale(cpu, e.is_task());

        if !migrated {
            let e = &mut self.entities[se.idx()];
            update_load_avg(now, &mut e.avg, weight, running, None, &scale);
        }
        let decayed = self.update_cfs_rq_load_avg(now, q);

        let avg = self.entities[se.idx()].avg;
        let cfs_rq = &mut self.cfs_rqs[q.idx()];
        cfs_rq.runnable.load_avg += avg.load_avg;
        cfs_rq.runnable.load_sum += avg.load_sum;

        if migrated {
            self.attach_entity_load_avg(q, se);
        }
        if decayed || migrated {
            self.update_tg_load_avg(q, false);
        }
    }

    pub(crate) fn dequeue_entity_load_avg(&mut self, q: CfsRqId, se: EntityId) {
        self.update_load_avg(se, true);
        let avg = self.entities[se.idx()].avg;
        let cfs_rq = &mut self.cfs_rqs[q.idx()];
        sub_positive(&mut cfs_rq.runnable.load_avg, avg.load_avg);
        sub_positive(&mut cfs_rq.runnable.load_sum, avg.load_sum);
    }

    /// Queue `se`'s contribution for removal from its queue on the next
    /// update there. Used when `se` leaves without the queue being updated.
    pub(crate) fn remove_entity_load_avg(&mut self, se: EntityId) {
        if self.entities[se.idx()].avg.last_update_time == 0 {
            return;
        }
        let q = self.cfs_rq_of(se);
        let cpu = self.cfs_rqs[q.idx()].cpu;
        let q_last = self.cfs_rqs[q.idx()].avg.last_update_time;
        let scale = self.pelt_scale(cpu, self.entities[se.idx()].is_task());

        let e = &mut self.entities[se.idx()];
        update_load_avg(q_last, &mut e.avg, 0, false, None, &scale);
        let (load, util) = (e.avg.load_avg, e.avg.util_avg);
        self.cfs_rqs[q.idx()].queue_removed(load, util);
    }

    /// Re-age an attached entity from `prev`'s clock to `next`'s when it is
    /// repointed at another queue.
    pub(crate) fn set_task_rq_fair(&mut self, se: EntityId, prev: CfsRqId, next: CfsRqId) {
        if prev == next || !self.cfg.features().attach_age_load {
            return;
        }
        if self.entities[se.idx()].avg.last_update_time == 0 {
            return;
        }
        let p_last = self.cfs_rqs[prev.idx()].avg.last_update_time;
        let n_last = self.cfs_rqs[next.idx()].avg.last_update_time;
        let cpu = self.cfs_rqs[prev.idx()].cpu;
        let scale = self.pelt_scale(cpu, self.entities[se.idx()].is_task());

        let e = &mut self.entities[se.idx()];
        update_load_avg(p_last, &mut e.avg, 0, false, None, &scale);
        e.avg.last_update_time = n_last.max(1);
    }

    /// Decay the blocked load of every queue on `cpu`, children first.
    pub(crate) fn update_blocked_averages(&mut self, cpu: CpuId) {
        self.update_rq_clock(cpu);
        for g in (0..self.groups.len()).rev() {
            let q = self.groups[g].cfs_rq[cpu.idx()];
            if self.cfs_rqs[q.idx()].throttled_hierarchy() {
                continue;
            }
            let now = self.cfs_rq_clock_task(q);
            if self.update_cfs_rq_load_avg(now, q) {
                self.update_tg_load_avg(q, false);
            }
        }
    }

    /// Compute `h_load` for `q` and the queues above it, top down. Values
    /// are cached for the current tick.
    pub(crate) fn update_cfs_rq_h_load(&mut self, q: CfsRqId) {
        // Offset by one so that zero means never computed.
        let stamp = self.jiffies() + 1;
        if self.cfs_rqs[q.idx()].last_h_load_update == stamp {
            return;
        }

        let mut path: Vec<EntityId> = Vec::new();
        let mut top = q;
        while let Some(se) = self.cfs_rqs[top.idx()].se {
            path.push(se);
            top = self.cfs_rq_of(se);
            if self.cfs_rqs[top.idx()].last_h_load_update == stamp {
                break;
            }
        }
        if self.cfs_rqs[top.idx()].se.is_none() && self.cfs_rqs[top.idx()].last_h_load_update != stamp {
            let cfs_rq = &mut self.cfs_rqs[top.idx()];
            cfs_rq.h_load = cfs_rq.avg.load_avg;
            cfs_rq.last_h_load_update = stamp;
        }

        for &se in path.iter().rev() {
            let parent = self.cfs_rq_of(se);
            let p = &self.cfs_rqs[parent.idx()];
            let load = p.h_load * self.entities[se.idx()].avg.load_avg / (p.avg.load_avg + 1);
            let Some(child) = self.entities[se.idx()].my_q else {
                continue;
            };
            let c = &mut self.cfs_rqs[child.idx()];
            c.h_load = load;
            c.last_h_load_update = stamp;
        }
    }

    /// The task's load as seen from its CPU's root queue.
    pub(crate) fn task_h_load(&mut self, pid: Pid) -> u64 {
        let se = self.task_se(pid);
        let q = self.cfs_rq_of(se);
        self.update_cfs_rq_h_load(q);
        let cfs_rq = &self.cfs_rqs[q.idx()];
        cfs_rq.h_load * self.entities[se.idx()].avg.load_avg / (cfs_rq.avg.load_avg + 1)
    }

    pub(crate) fn weighted_cpuload(&self, cpu: CpuId) -> u64 {
        let rq = &self.rqs[cpu.idx()];
        self.cfs_rqs[rq.cfs.idx()].runnable.load_avg
    }

    fn update_cpu_load(&mut self, cpu: CpuId, this_load: u64, pending: u64) {
        let rq = &mut self.rqs[cpu.idx()];
        rq.cpu_load[0] = this_load;
        for i in 1..CPU_LOAD_IDX_MAX {
            let scale = 1u64 << i;
            let old = decay_load_missed(rq.cpu_load[i], pending.saturating_sub(1), i);
            let mut new = this_load;
            // Round up so that a steady load is eventually reached.
            if new > old {
                new += scale - 1;
            }
            rq.cpu_load[i] = (old * (scale - 1) + new) >> i;
        }
    }

    /// Tick-time refresh of the load history of a busy CPU.
    pub(crate) fn update_cpu_load_active(&mut self, cpu: CpuId) {
        let load = self.weighted_cpuload(cpu);
        self.rqs[cpu.idx()].last_load_update_tick = self.jiffies();
        self.update_cpu_load(cpu, load, 1);
    }

    /// Catch up the history of a tickless idle CPU.
    pub(crate) fn update_idle_cpu_load(&mut self, cpu: CpuId) {
        let load = self.weighted_cpuload(cpu);
        let now = self.jiffies();
        let last = self.rqs[cpu.idx()].last_load_update_tick;
        if load != 0 || now == last {
            return;
        }
        self.rqs[cpu.idx()].last_load_update_tick = now;
        self.update_cpu_load(cpu, load, now - last);
    }

    /// Account the idle ticks a CPU skipped when its tick restarts.
    pub(crate) fn update_cpu_load_nohz(&mut self, cpu: CpuId) {
        let now = self.jiffies();
        let last = self.rqs[cpu.idx()].last_load_update_tick;
        if now == last {
            return;
        }
        self.rqs[cpu.idx()].last_load_update_tick = now;
        self.update_cpu_load(cpu, 0, now - last);
    }

    /// Conservative estimate of `cpu`'s load when migrating away from it.
    pub(crate) fn source_load(&self, cpu: CpuId, load_type: usize) -> u64 {
        let total = self.weighted_cpuload(cpu);
        if load_type == 0 || !self.cfg.features().lb_bias {
            return total;
        }
        self.rqs[cpu.idx()].cpu_load[load_type - 1].min(total)
    }

    /// Conservative estimate of `cpu`'s load when migrating onto it.
    pub(crate) fn target_load(&self, cpu: CpuId, load_type: usize) -> u64 {
        let total = self.weighted_cpuload(cpu);
        if load_type == 0 || !self.cfg.features().lb_bias {
            return total;
        }
        self.rqs[cpu.idx()].cpu_load[load_type - 1].max(total)
    }

    pub(crate) fn cpu_avg_load_per_task(&self, cpu: CpuId) -> u64 {
        let rq = &self.rqs[cpu.idx()];
        let nr = self.cfs_rqs[rq.cfs.idx()].h_nr_running as u64;
        if nr == 0 {
            return 0;
        }
        self.weighted_cpuload(cpu) / nr
    }

    /// Utilization of `cpu`, capped at its original capacity.
    pub(crate) fn cpu_util(&self, cpu: CpuId) -> u64 {
        let rq = &self.rqs[cpu.idx()];
        self.cfs_rqs[rq.cfs.idx()]
            .avg
            .util_avg
            .min(rq.cpu_capacity_orig)
    }

    pub(crate) fn capacity_of(&self, cpu: CpuId) -> u64 {
        self.rqs[cpu.idx()].cpu_capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decay_load_missed() {
        assert_eq!(decay_load_missed(1000, 0, 3), 1000);
        assert_eq!(decay_load_missed(1000, 3, 1), 125);
        assert_eq!(decay_load_missed(1000, 8, 1), 0);
        // idx 2 decays by 3/4 per tick: one tick is 96/128.
        assert_eq!(decay_load_missed(1024, 1, 2), 768);
        // Three ticks: bits 0 and 1.
        assert_eq!(decay_load_missed(1024, 3, 2), (768 * 72) >> 7);
        assert_eq!(decay_load_missed(1024, 200, 4), 0);
    }
}
