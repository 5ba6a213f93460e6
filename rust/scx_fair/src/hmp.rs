// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Heterogeneous-multiprocessor placement.
//!
//! Task demand is the frequency and efficiency scaled runnable sum kept in
//! [`crate::pelt::SchedAvg::runnable_avg_sum_scaled`], in units where a
//! task that never stops running on the fastest CPU reaches
//! [`LOAD_AVG_MAX`]. Every threshold in [`crate::config::Config`] is in the
//! same units. Demand is scaled up by a CPU's load scale factor to tell how
//! heavy a task would be there.
//!
//! Runnable tasks are counted into per-queue [`HmpStats`] (big and small
//! task counts plus the summed demand). What a task added is stored on the
//! task, so a later removal subtracts exactly that even if the task's
//! demand or the thresholds moved in between.

use std::sync::atomic::Ordering;

use tracing::debug;
use tracing::info;
use tracing::trace;

use crate::cfs_rq::HmpContrib;
use crate::config::ConfigError;
use crate::cpumask::Cpumask;
use crate::pelt::LOAD_AVG_MAX;
use crate::power::table_cost;
use crate::sched::FairSched;
use crate::task::TaskState;
use crate::types::{ClusterId, CpuId, Pid, RelatedGroupId};

/// Why a running task should leave its CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationReason {
    /// Too heavy for this CPU, or boost asks for the big cluster.
    Up,
    /// Too niced or discouraged for a big CPU.
    Down,
    /// A cheaper CPU is idle while this one is about to throttle.
    Ea,
    IrqLoad,
    /// The task's related group prefers another cluster.
    PreferredCluster,
}

/// Tasks placed together on one cluster, sized by their summed demand.
#[derive(Debug, Clone)]
pub struct RelatedThreadGroup {
    pub id: RelatedGroupId,
    pub members: Vec<Pid>,
    pub preferred_cluster: Option<ClusterId>,
}

impl RelatedThreadGroup {
    pub fn new(id: RelatedGroupId) -> Self {
        Self {
            id,
            members: Vec::new(),
            preferred_cluster: None,
        }
    }
}

/// UP and DOWN moves only make sense across clusters.
fn do_migration(reason: MigrationReason, new_cpu: CpuId, cpu: CpuId, same_cluster: bool) -> bool {
    if matches!(reason, MigrationReason::Up | MigrationReason::Down) && same_cluster {
        return false;
    }
    new_cpu != cpu
}

impl FairSched {
    pub fn sched_boost(&self) -> bool {
        self.boost.load(Ordering::Relaxed) > 0
    }

    /// Take (`true`) or drop (`false`) a boost reference. While any is held
    /// placement favours the highest-capacity cluster.
    pub fn set_boost(&mut self, enable: bool) -> Result<(), ConfigError> {
        if !self.cfg.hmp_enabled() {
            return Err(ConfigError::HmpDisabled);
        }
        let old = self.boost.load(Ordering::Relaxed);
        if enable {
            self.boost.store(old + 1, Ordering::Relaxed);
        } else if old >= 1 {
            self.boost.store(old - 1, Ordering::Relaxed);
        } else {
            return Err(ConfigError::BoostUnderflow);
        }

        let new = self.boost.load(Ordering::Relaxed);
        info!(refcount = new, "boost");
        if old == 0 && new > 0 {
            self.boost_kick_cpus();
        }
        Ok(())
    }

    /// Make every busy CPU outside the big cluster re-check its running
    /// task's placement.
    fn boost_kick_cpus(&mut self) {
        let max_capacity = self.topo.max_capacity;
        for cpu in 0..self.nr_cpus() {
            let cpu = CpuId(cpu as u32);
            let rq = &self.rqs[cpu.idx()];
            if !rq.online || self.topo.capacity(cpu) == max_capacity || rq.nr_running == 0 {
                continue;
            }
            if let Some(curr) = rq.curr {
                self.check_for_migration(cpu, curr);
            }
        }
    }

    /// Demand of `pid` in max-capacity units.
    pub fn task_demand(&self, pid: Pid) -> u64 {
        let se = self.tasks[&pid].se;
        self.entities[se.idx()].avg.runnable_avg_sum_scaled.min(LOAD_AVG_MAX)
    }

    /// What a demand measured on the fastest CPU amounts to on `cpu`.
    pub(crate) fn scale_load_to_cpu(&self, load: u64, cpu: CpuId) -> u64 {
        load * self.topo.load_scale_factor(cpu) / 1024
    }

    pub(crate) fn cpu_load(&self, cpu: CpuId) -> u64 {
        self.scale_load_to_cpu(self.rqs[cpu.idx()].hmp_stats.cumulative_runnable_avg, cpu)
    }

    /// CPU load without the waker, which is about to sleep on a sync wakeup.
    pub(crate) fn cpu_load_sync(&self, cpu: CpuId, sync: bool, this_cpu: CpuId) -> u64 {
        let rq = &self.rqs[cpu.idx()];
        let mut load = rq.hmp_stats.cumulative_runnable_avg;
        if sync && cpu == this_cpu {
            if let Some(curr) = rq.curr {
                load = load.saturating_sub(self.task_demand(curr));
            }
        }
        self.scale_load_to_cpu(load, cpu)
    }

    pub(crate) fn sched_cpu_high_irqload(&self, cpu: CpuId) -> bool {
        self.rqs[cpu.idx()].irqload_pct > self.cfg.hmp().high_irqload_pct
    }

    pub(crate) fn is_big_task(&self, pid: Pid) -> bool {
        let task = &self.tasks[&pid];
        if task.nice > self.cfg.hmp().upmigrate_min_nice
            || self.group_upmigrate_discouraged(task.group)
        {
            return false;
        }
        self.scale_load_to_cpu(self.task_demand(pid), task.cpu) > self.cfg.upmigrate
    }

    pub(crate) fn is_small_task(&self, pid: Pid) -> bool {
        let load = self.task_demand(pid) * self.topo.max_load_scale_factor / 1024;
        load < self.cfg.small_task
    }

    pub(crate) fn mostly_idle_cpu(&self, cpu: CpuId) -> bool {
        let rq = &self.rqs[cpu.idx()];
        self.cpu_load(cpu) <= rq.mostly_idle_load
            && rq.nr_running <= rq.mostly_idle_nr_run
            && !self.sched_cpu_high_irqload(cpu)
    }

    pub(crate) fn mostly_idle_cpu_sync(&self, cpu: CpuId, load: u64, sync: bool, this_cpu: CpuId) -> bool {
        let rq = &self.rqs[cpu.idx()];
        let mut nr_running = rq.nr_running;
        if sync && cpu == this_cpu {
            nr_running = nr_running.saturating_sub(1);
        }
        load <= rq.mostly_idle_load && nr_running <= rq.mostly_idle_nr_run
    }

    pub(crate) fn spill_threshold_crossed(&self, task_load: u64, cpu_load: u64, cpu: CpuId) -> bool {
        task_load + cpu_load > self.cfg.spill_load
            || self.rqs[cpu.idx()].nr_running + 1 > self.cfg.hmp().spill_nr_run
    }

    /// Whether a task of scaled load `tload` belongs on `cpu` by capacity.
    pub(crate) fn task_load_will_fit(&self, pid: Pid, tload: u64, cpu: CpuId) -> bool {
        let cap = self.topo.capacity(cpu);
        if !self.cfg.hmp_enabled() || cap == self.topo.max_capacity {
            return true;
        }
        let task = &self.tasks[&pid];
        let prev_cap = self.topo.capacity(task.cpu);
        if self.sched_boost() {
            return cap > prev_cap;
        }
        if task.nice > self.cfg.hmp().upmigrate_min_nice
            || self.group_upmigrate_discouraged(task.group)
        {
            return true;
        }
        let threshold = if prev_cap > cap {
            self.cfg.downmigrate
        } else {
            self.cfg.upmigrate
        };
        tload < threshold
    }

    pub(crate) fn task_will_fit(&self, pid: Pid, cpu: CpuId) -> bool {
        let tload = self.scale_load_to_cpu(self.task_demand(pid), cpu);
        self.task_load_will_fit(pid, tload, cpu)
    }

    /// Whether a related group with total `demand` fits on `cluster`.
    /// Leaving the current preferred cluster for a smaller one uses the
    /// lower threshold.
    pub(crate) fn group_will_fit(&self, cluster: ClusterId, prev: Option<ClusterId>, demand: u64) -> bool {
        let c = &self.topo.clusters[cluster.0 as usize];
        if c.capacity == self.topo.max_capacity {
            return true;
        }
        let prev_cap = prev.map_or(0, |p| self.topo.clusters[p.0 as usize].capacity);
        let threshold = if c.capacity < prev_cap {
            self.cfg.grp_downmigrate
        } else {
            self.cfg.grp_upmigrate
        };
        let Some(first) = c.cpus.first() else {
            return false;
        };
        self.scale_load_to_cpu(demand, first) < threshold
    }

    pub(crate) fn eligible_cpu(&self, tload: u64, cpu_load: u64, cpu: CpuId, sync: bool, this_cpu: CpuId) -> bool {
        if self.sched_cpu_high_irqload(cpu) {
            return false;
        }
        if self.mostly_idle_cpu_sync(cpu, cpu_load, sync, this_cpu) {
            return true;
        }
        if self.topo.max_possible_capacity(cpu) != self.topo.max_possible_capacity {
            return !self.spill_threshold_crossed(tload, cpu_load, cpu);
        }
        false
    }

    /// Costs further apart than the power band are in different bands.
    /// With power-aware placement off any difference counts.
    pub(crate) fn power_delta_exceeded(&self, cpu_cost: u64, base_cost: u64) -> bool {
        if base_cost == 0 || cpu_cost == base_cost {
            return false;
        }
        let hmp = self.cfg.hmp();
        if !hmp.enable_power_aware {
            return true;
        }
        let limit = hmp.powerband_limit_pct as u64 * base_cost / 100;
        cpu_cost.abs_diff(base_cost) > limit
    }

    pub(crate) fn power_cost_at_freq(&self, cpu: CpuId, freq: u64) -> u64 {
        let fallback = self.topo.max_possible_capacity(cpu);
        if !self.cfg.hmp().enable_power_aware {
            return fallback;
        }
        let Some(table) = self.power.power_table(cpu) else {
            return fallback;
        };
        let freq = if freq == 0 { self.topo.min_max_freq } else { freq };
        table_cost(table, freq).unwrap_or(fallback)
    }

    /// Cost of running a task of scaled load `task_load` alone on `cpu`,
    /// including waking it from idle.
    pub(crate) fn power_cost(&self, task_load: u64, cpu: CpuId) -> u64 {
        if !self.cfg.hmp().enable_power_aware {
            return self.topo.max_possible_capacity(cpu);
        }
        let cluster = self.topo.cluster_of(cpu);
        let demand_pct = task_load * 100 / LOAD_AVG_MAX;
        let task_freq = (demand_pct * cluster.max_possible_freq / 100).max(cluster.cur_freq);

        let rq = &self.rqs[cpu.idx()];
        let mut static_cost = 0;
        if rq.is_idle() && rq.cstate != 0 {
            static_cost += rq.static_cpu_pwr_cost;
            if rq.dstate != 0 {
                static_cost += rq.static_cluster_pwr_cost;
            }
        }
        self.power_cost_at_freq(cpu, task_freq) + static_cost
    }

    fn wake_to_idle(&self, pid: Pid, this_cpu: CpuId) -> bool {
        let waker_hint = self.rqs[this_cpu.idx()]
            .curr
            .and_then(|c| self.tasks.get(&c))
            .is_some_and(|t| t.wake_up_idle);
        waker_hint || self.tasks[&pid].wake_up_idle
    }

    /// Preferred cluster of `pid`'s related group when colocation applies
    /// and the group wants more than the smallest cluster.
    fn colocation_cluster(&self, pid: Pid) -> Option<ClusterId> {
        if !self.cfg.hmp().enable_colocation {
            return None;
        }
        let rg = self.tasks[&pid].related_group?;
        let pref = self.related_groups.get(&rg)?.preferred_cluster?;
        (self.topo.clusters[pref.0 as usize].capacity > self.topo.min_capacity).then_some(pref)
    }

    /// Whether `cluster` is acceptable for `pid` given its related group.
    pub(crate) fn preferred_cluster(&self, cluster: ClusterId, pid: Pid) -> bool {
        match self.colocation_cluster(pid) {
            Some(pref) => pref == cluster,
            None => true,
        }
    }

    fn skip_freq_domain(&self, tcpu: CpuId, cpu: CpuId, reason: Option<MigrationReason>, pref: Option<ClusterId>) -> bool {
        let (cap, tcap) = (self.topo.capacity(cpu), self.topo.capacity(tcpu));
        match reason {
            Some(MigrationReason::Up) => cap <= tcap,
            Some(MigrationReason::Down) => cap >= tcap,
            Some(MigrationReason::Ea) => cap != tcap,
            Some(MigrationReason::PreferredCluster) => pref != Some(self.topo.cpus[cpu.idx()].cluster),
            Some(MigrationReason::IrqLoad) | None => false,
        }
    }

    fn skip_cpu(&self, task_cpu: CpuId, cpu: CpuId, tload: u64, reason: Option<MigrationReason>) -> bool {
        let Some(reason) = reason else {
            return false;
        };
        if self.rqs[cpu.idx()].reserved {
            return true;
        }
        match reason {
            MigrationReason::Ea => self.power_cost(tload, cpu) > self.power_cost(tload, task_cpu),
            _ => cpu == task_cpu,
        }
    }

    /// Home for a small task: a mostly idle CPU outside the big cluster,
    /// else the shallowest idle one, else the least loaded, else the
    /// cheapest big CPU.
    pub(crate) fn best_small_task_cpu(&self, pid: Pid, sync: bool, this_cpu: CpuId) -> Option<CpuId> {
        let task = &self.tasks[&pid];
        let hmp = self.cfg.hmp();
        let hmp_capable = self.topo.hmp_capable();
        let demand = self.task_demand(pid);
        let allowed = task.cpus_allowed.and(&self.active_mask);
        let mut search = allowed.clone();
        let mut fb_search = Cpumask::new(self.nr_cpus());

        let start = if search.test_cpu(task.cpu) {
            task.cpu
        } else {
            search.first()?
        };

        let mut best_busy_cpu = None;
        let mut min_cstate_cpu = None;
        let mut min_cstate = u32::MAX;
        let mut min_load = u64::MAX;

        let mut cursor = Some(start);
        while let Some(i) = cursor {
            let rq = &self.rqs[i.idx()];
            if hmp_capable && self.topo.max_possible_capacity(i) == self.topo.max_possible_capacity {
                let fd = self.topo.freq_domain(i);
                fb_search |= &search.and(fd);
                search = search.andnot(fd);
            } else {
                search.clear_cpu(i);
                if self.sched_cpu_high_irqload(i) {
                    // skip
                } else if rq.is_idle() && rq.cstate != 0 {
                    if rq.cstate < min_cstate {
                        min_cstate_cpu = Some(i);
                        min_cstate = rq.cstate;
                    }
                } else {
                    let cpu_load = self.cpu_load_sync(i, sync, this_cpu);
                    if hmp.restrict_tasks_spread {
                        let tload = self.scale_load_to_cpu(demand, i);
                        if !self.spill_threshold_crossed(tload, cpu_load, i) && cpu_load < min_load {
                            min_load = cpu_load;
                            best_busy_cpu = Some(i);
                        }
                    } else if self.mostly_idle_cpu_sync(i, cpu_load, sync, this_cpu) {
                        return Some(i);
                    }
                }
            }
            cursor = search.first();
        }

        if best_busy_cpu.is_some() {
            return best_busy_cpu;
        }
        if min_cstate_cpu.is_some() {
            return min_cstate_cpu;
        }

        if !hmp.restrict_tasks_spread {
            for i in allowed.andnot(&fb_search).iter() {
                if self.sched_cpu_high_irqload(i) {
                    continue;
                }
                let tload = self.scale_load_to_cpu(demand, i);
                let cpu_load = self.cpu_load_sync(i, sync, this_cpu);
                if self.spill_threshold_crossed(tload, cpu_load, i) {
                    continue;
                }
                if cpu_load < min_load || (i == task.cpu && cpu_load == min_load) {
                    min_load = cpu_load;
                    best_busy_cpu = Some(i);
                }
            }
            if best_busy_cpu.is_some() {
                return best_busy_cpu;
            }
        }

        let mut fallback = None;
        let mut min_cost = u64::MAX;
        for i in fb_search.iter() {
            let cost = self.power_cost(self.scale_load_to_cpu(demand, i), i);
            if cost < min_cost || (i == task.cpu && cost == min_cost) {
                fallback = Some(i);
                min_cost = cost;
            }
        }
        fallback
    }

    /// While `best_cpu`'s cluster runs slow, put the task on the cluster's
    /// cheapest CPU so the others can stay idle.
    fn select_packing_target(&self, pid: Pid, best_cpu: CpuId) -> CpuId {
        let rq = &self.rqs[best_cpu.idx()];
        let cluster = self.topo.cluster_of(best_cpu);
        if cluster.cur_freq >= rq.mostly_idle_freq || cluster.max_freq <= rq.mostly_idle_freq {
            return best_cpu;
        }

        let demand = self.task_demand(pid);
        let search = self.tasks[&pid]
            .cpus_allowed
            .and(&self.active_mask)
            .and(self.topo.freq_domain(best_cpu));
        let mut target = best_cpu;
        let mut min_cost = u64::MAX;
        for i in search.iter() {
            let cost = self.power_cost(self.scale_load_to_cpu(demand, i), i);
            if cost < min_cost && !self.sched_cpu_high_irqload(i) {
                target = i;
                min_cost = cost;
            }
        }
        target
    }

    /// Cheapest CPU that fits `pid`. `reason` is set when moving a running
    /// task, `sync` when the waker on `this_cpu` is about to sleep.
    pub(crate) fn select_best_cpu(&self, pid: Pid, reason: Option<MigrationReason>, sync: bool, this_cpu: CpuId) -> CpuId {
        let task = &self.tasks[&pid];
        let (best, prefer_idle_override) = self.find_best_cpu(pid, reason, sync, this_cpu);
        let best = best.unwrap_or(task.cpu);
        if self.rqs[best.idx()].mostly_idle_freq != 0 && !prefer_idle_override {
            return self.select_packing_target(pid, best);
        }
        best
    }

    fn find_best_cpu(
        &self,
        pid: Pid,
        reason: Option<MigrationReason>,
        sync: bool,
        this_cpu: CpuId,
    ) -> (Option<CpuId>, bool) {
        let task = &self.tasks[&pid];
        let mut small_task = self.is_small_task(pid);
        let mut sync = sync;
        let mut prefer_idle: Option<bool> = None;
        let mut prefer_idle_override = false;

        let pref_cluster = self.colocation_cluster(pid);
        if pref_cluster.is_some() {
            small_task = false;
        }
        if reason.is_some() {
            prefer_idle = Some(true);
            prefer_idle_override = true;
        }
        if self.wake_to_idle(pid, this_cpu) {
            prefer_idle = Some(true);
            prefer_idle_override = true;
            small_task = false;
            // Sync is only a hint, the idle request wins.
            sync = false;
        }

        if small_task && !self.sched_boost() && !sync {
            return (self.best_small_task_cpu(pid, sync, this_cpu), prefer_idle_override);
        }

        let mut search = task.cpus_allowed.and(&self.active_mask);
        if sync && search.test_cpu(this_cpu) {
            return (Some(this_cpu), prefer_idle_override);
        }

        let demand = self.task_demand(pid);
        let mut best_cpu: Option<CpuId> = None;
        let mut fallback_idle_cpu: Option<CpuId> = None;
        let mut min_cstate_cpu: Option<CpuId> = None;
        let mut min_cost = u64::MAX;
        let mut min_idle_cost = u64::MAX;
        let mut min_busy_cost = u64::MAX;
        let mut min_load = u64::MAX;
        let mut min_fallback_load = u64::MAX;
        let mut min_cstate = u32::MAX;

        for i in 0..self.nr_cpus() {
            let i = CpuId(i as u32);
            if !search.test_cpu(i) {
                continue;
            }
            let rq = &self.rqs[i.idx()];
            let fd = self.topo.freq_domain(i);
            if self.skip_freq_domain(task.cpu, i, reason, pref_cluster) {
                search = search.andnot(fd);
                continue;
            }
            let tload = self.scale_load_to_cpu(demand, i);
            if self.skip_cpu(task.cpu, i, tload, reason) {
                continue;
            }
            let prev_cpu = i == task.cpu;

            // The least loaded mostly idle CPU where the task won't fit is
            // the fallback if it fits nowhere.
            let wrong_cluster = pref_cluster.is_some_and(|c| c != self.topo.cpus[i.idx()].cluster);
            if wrong_cluster || !self.task_load_will_fit(pid, tload, i) {
                for j in search.and(fd).iter() {
                    let cpu_load = self.cpu_load_sync(j, sync, this_cpu);
                    if self.mostly_idle_cpu_sync(j, cpu_load, sync, this_cpu)
                        && !self.sched_cpu_high_irqload(j)
                        && (cpu_load < min_fallback_load
                            || (cpu_load == min_fallback_load && j == task.cpu))
                    {
                        min_fallback_load = cpu_load;
                        fallback_idle_cpu = Some(j);
                    }
                }
                search = search.andnot(fd);
                continue;
            }

            if prefer_idle.is_none() {
                prefer_idle = Some(rq.prefer_idle);
            }

            let cpu_load = self.cpu_load_sync(i, sync, this_cpu);
            if !self.eligible_cpu(tload, cpu_load, i, sync, this_cpu) {
                continue;
            }

            let cpu_cost = self.power_cost(tload, i);
            trace!(
                cpu = i.0,
                load = cpu_load,
                cost = cpu_cost,
                temp = self.power.cpu_temperature(i),
                "cpu load"
            );
            // A lower power band beats load and idle depth.
            if self.power_delta_exceeded(cpu_cost, min_cost) {
                if cpu_cost > min_cost {
                    continue;
                }
                min_cost = cpu_cost;
                min_load = u64::MAX;
                min_cstate = u32::MAX;
                min_cstate_cpu = None;
                best_cpu = None;
                if !prefer_idle_override {
                    prefer_idle = Some(rq.prefer_idle);
                }
            }

            let waker_idle = sync && i == this_cpu && prefer_idle == Some(true) && rq.nr_running == 1;
            if rq.is_idle() || waker_idle {
                let cstate = rq.cstate;
                if cstate > min_cstate {
                    continue;
                }
                if cstate < min_cstate {
                    min_idle_cost = cpu_cost;
                    min_cstate = cstate;
                    min_cstate_cpu = Some(i);
                    continue;
                }
                if cpu_cost < min_idle_cost || (prev_cpu && cpu_cost == min_idle_cost) {
                    min_idle_cost = cpu_cost;
                    min_cstate_cpu = Some(i);
                }
                continue;
            }

            if cpu_load > min_load {
                continue;
            }
            if cpu_load < min_load {
                min_load = cpu_load;
                min_busy_cost = cpu_cost;
                best_cpu = Some(i);
                continue;
            }
            if cpu_cost < min_busy_cost || (prev_cpu && cpu_cost == min_busy_cost) {
                min_busy_cost = cpu_cost;
                best_cpu = Some(i);
            }
        }

        if let Some(idle) = min_cstate_cpu {
            let busy_is_worse = match best_cpu {
                None => true,
                Some(b) => !self.mostly_idle_cpu_sync(b, min_load, sync, this_cpu),
            };
            if prefer_idle == Some(true) || busy_is_worse {
                best_cpu = Some(idle);
            }
        }
        (best_cpu.or(fallback_idle_cpu), prefer_idle_override)
    }

    fn lower_power_cpu_available(&self, pid: Pid, cpu: CpuId) -> bool {
        let task = &self.tasks[&pid];
        let demand = self.task_demand(pid);
        let mut lowest_cpu = task.cpu;
        let mut lowest = self.power_cost(self.scale_load_to_cpu(demand, lowest_cpu), lowest_cpu);

        let mut search = task
            .cpus_allowed
            .and(&self.active_mask)
            .and(self.topo.freq_domain(cpu));
        search.clear_cpu(task.cpu);
        for i in search.iter().filter(|&i| self.rqs[i.idx()].is_idle()) {
            let cost = self.power_cost(self.scale_load_to_cpu(demand, i), i);
            if cost < lowest {
                lowest_cpu = i;
                lowest = cost;
            }
        }
        lowest_cpu != task.cpu
    }

    pub(crate) fn is_task_migration_throttled(&self, pid: Pid) -> bool {
        let se = &self.entities[self.tasks[&pid].se.idx()];
        se.sum_exec_runtime - se.prev_sum_exec_runtime < self.cfg.hmp().min_runtime_ns
    }

    /// Whether `pid`, running on `cpu`, is on the wrong kind of CPU.
    pub(crate) fn migration_needed(&self, cpu: CpuId, pid: Pid) -> Option<MigrationReason> {
        let task = &self.tasks[&pid];
        if !self.cfg.hmp_enabled() || task.state != TaskState::Running || task.nr_cpus_allowed() == 1 {
            return None;
        }
        if self.task_will_be_throttled(pid) {
            return None;
        }

        let hmp = self.cfg.hmp();
        let cap = self.topo.capacity(cpu);
        let max_capacity = self.topo.max_capacity;
        let min_capacity = self.topo.min_capacity;
        let pref_cap = task
            .related_group
            .and_then(|rg| self.related_groups.get(&rg))
            .and_then(|g| g.preferred_cluster)
            .map(|c| self.topo.clusters[c.0 as usize].capacity);
        let colocated = hmp.enable_colocation && pref_cap.is_some();
        let niced = task.nice > hmp.upmigrate_min_nice;

        if self.sched_boost() {
            if niced {
                if colocated && pref_cap == Some(max_capacity) && cap != max_capacity {
                    return Some(MigrationReason::Up);
                }
                return None;
            }
            return (cap != max_capacity).then_some(MigrationReason::Up);
        }

        if !self.preferred_cluster(self.topo.cpus[cpu.idx()].cluster, pid) {
            return Some(MigrationReason::PreferredCluster);
        }
        if self.is_small_task(pid) {
            return None;
        }
        if self.sched_cpu_high_irqload(cpu) {
            return Some(MigrationReason::IrqLoad);
        }
        let unpinned = !colocated || pref_cap.map_or(true, |c| c == min_capacity);
        if unpinned
            && (niced || self.group_upmigrate_discouraged(task.group))
            && cap > min_capacity
        {
            return Some(MigrationReason::Down);
        }
        if !self.task_will_fit(pid, cpu) {
            return Some(MigrationReason::Up);
        }
        if hmp.enable_power_aware
            && !self.is_task_migration_throttled(pid)
            && self.power.is_throttling_imminent(cpu)
            && self.lower_power_cpu_available(pid, cpu)
        {
            return Some(MigrationReason::Ea);
        }
        None
    }

    fn kick_active_balance(&mut self, cpu: CpuId, pid: Pid, new_cpu: CpuId) -> bool {
        let rq = &mut self.rqs[cpu.idx()];
        if rq.active_balance {
            return false;
        }
        rq.active_balance = true;
        rq.push_cpu = new_cpu;
        rq.push_task = Some(pid);
        true
    }

    /// Tick-time check whether the task running on `cpu` should be pushed
    /// to a better CPU. Queues stop work on `cpu` when it should.
    pub(crate) fn check_for_migration(&mut self, cpu: CpuId, pid: Pid) {
        if let Some(rg) = self.tasks.get(&pid).and_then(|t| t.related_group) {
            self.update_preferred_cluster(rg);
        }
        let Some(reason) = self.migration_needed(cpu, pid) else {
            return;
        };
        let new_cpu = self.select_best_cpu(pid, Some(reason), false, cpu);
        if !do_migration(reason, new_cpu, cpu, self.topo.same_cluster(new_cpu, cpu)) {
            return;
        }
        if self.kick_active_balance(cpu, pid, new_cpu) {
            self.rqs[new_cpu.idx()].reserved = true;
            self.stop_work.push_back(cpu);
            debug!(pid = pid.0, cpu = cpu.0, to = new_cpu.0, ?reason, "hmp migration kick");
        }
    }

    /// Idle CPU closest to `call_cpu` that is cheapest to run at the
    /// lowest common max frequency. With `restrict`, CPUs bigger than
    /// `call_cpu` are passed over.
    pub(crate) fn find_new_hmp_ilb(&mut self, call_cpu: CpuId, restrict: bool) -> Option<CpuId> {
        let call_cap = self.topo.capacity(call_cpu);
        let min_max_freq = self.topo.min_max_freq;
        let mut best = None;

        for sd in &self.topo.domains[call_cpu.idx()] {
            let mut min_cost = u64::MAX;
            for i in sd.span.iter() {
                if !self.rqs[i.idx()].is_idle() || (restrict && self.topo.capacity(i) > call_cap) {
                    continue;
                }
                let cost = self.power_cost_at_freq(i, min_max_freq);
                if cost < min_cost {
                    best = Some(i);
                    min_cost = cost;
                }
            }
            if best.is_some() {
                break;
            }
        }

        if let Some(cpu) = best {
            for sd in self.topo.domains[cpu.idx()].iter_mut() {
                sd.balance_interval = 0;
            }
        }
        best
    }

    fn hmp_contrib(&self, pid: Pid) -> HmpContrib {
        let enabled = self.cfg.hmp_enabled();
        let big = enabled && self.is_big_task(pid);
        HmpContrib {
            big,
            small: enabled && !big && self.is_small_task(pid),
            demand: self.task_demand(pid),
        }
    }

    /// Apply `f` to the HMP stats of every queue `pid` is accounted in, up
    /// to the first throttled one, and to the CPU's stats when the walk
    /// reaches the top.
    fn walk_hmp_stats(&mut self, pid: Pid, f: impl Fn(&mut crate::cfs_rq::HmpStats)) {
        let task = &self.tasks[&pid];
        let cpu = task.cpu;
        let mut cursor = Some(task.se);
        while let Some(se) = cursor {
            let q = self.cfs_rq_of(se);
            let cfs_rq = &mut self.cfs_rqs[q.idx()];
            f(&mut cfs_rq.hmp_stats);
            if cfs_rq.throttled() {
                return;
            }
            cursor = self.entities[se.idx()].parent;
        }
        f(&mut self.rqs[cpu.idx()].hmp_stats);
    }

    pub(crate) fn inc_hmp_sched_stats_fair(&mut self, pid: Pid) {
        if self.tasks[&pid].hmp_contrib.is_some() {
            return;
        }
        let contrib = self.hmp_contrib(pid);
        self.walk_hmp_stats(pid, |s| s.inc(&contrib));
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.hmp_contrib = Some(contrib);
        }
    }

    pub(crate) fn dec_hmp_sched_stats_fair(&mut self, pid: Pid) {
        let Some(contrib) = self.tasks.get_mut(&pid).and_then(|t| t.hmp_contrib.take()) else {
            return;
        };
        self.walk_hmp_stats(pid, |s| s.dec(&contrib));
    }

    /// Re-count a queued task whose demand changed.
    pub(crate) fn fixup_hmp_sched_stats(&mut self, pid: Pid) {
        self.dec_hmp_sched_stats_fair(pid);
        self.inc_hmp_sched_stats_fair(pid);
    }

    /// Re-classify every counted task, after the thresholds changed.
    pub(crate) fn recount_hmp_stats(&mut self) {
        let counted: Vec<Pid> = self
            .tasks
            .values()
            .filter(|t| t.hmp_contrib.is_some())
            .map(|t| t.pid)
            .collect();
        for pid in counted {
            self.fixup_hmp_sched_stats(pid);
        }
    }

    /// Put `pid` in related group `rg`, creating the group if needed.
    pub(crate) fn join_related_group(&mut self, pid: Pid, rg: RelatedGroupId) {
        self.leave_related_group(pid);
        self.related_groups
            .entry(rg)
            .or_insert_with(|| RelatedThreadGroup::new(rg))
            .members
            .push(pid);
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.related_group = Some(rg);
        }
        self.update_preferred_cluster(rg);
    }

    pub(crate) fn leave_related_group(&mut self, pid: Pid) {
        let Some(rg) = self.tasks.get_mut(&pid).and_then(|t| t.related_group.take()) else {
            return;
        };
        let Some(group) = self.related_groups.get_mut(&rg) else {
            return;
        };
        group.members.retain(|&p| p != pid);
        if group.members.is_empty() {
            self.related_groups.remove(&rg);
        } else {
            self.update_preferred_cluster(rg);
        }
    }

    /// Move `pid` into related group `rg`, or out of its group with `None`.
    pub fn set_related_group(&mut self, pid: Pid, rg: Option<RelatedGroupId>) {
        if !self.tasks.contains_key(&pid) {
            return;
        }
        match rg {
            Some(rg) => self.join_related_group(pid, rg),
            None => self.leave_related_group(pid),
        }
    }

    /// Smallest cluster that fits the group's summed demand.
    pub(crate) fn update_preferred_cluster(&mut self, rg: RelatedGroupId) {
        let Some(group) = self.related_groups.get(&rg) else {
            return;
        };
        let demand: u64 = group
            .members
            .iter()
            .filter(|p| self.tasks.get(p).is_some_and(|t| t.state != TaskState::Dead))
            .map(|&p| self.task_demand(p))
            .sum();
        let prev = group.preferred_cluster;
        let order = self.topo.clusters_by_capacity();
        let pref = order
            .iter()
            .copied()
            .find(|&c| self.group_will_fit(c, prev, demand))
            .or_else(|| order.last().copied());

        if pref != prev {
            debug!(group = rg.0, demand, cluster = ?pref.map(|c| c.0), "preferred cluster");
        }
        if let Some(group) = self.related_groups.get_mut(&rg) {
            group.preferred_cluster = pref;
        }
    }

    pub fn preferred_cluster_of(&self, rg: RelatedGroupId) -> Option<ClusterId> {
        self.related_groups.get(&rg).and_then(|g| g.preferred_cluster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{pct_to_demand, Tunables};
    use crate::task::{Phase, TaskBehavior, TaskDef};
    use crate::topology::{PowerState, TopologySpec};

    fn hmp_tunables() -> Tunables {
        let mut t = Tunables::default();
        t.hmp.enable = true;
        t
    }

    fn big_little() -> TopologySpec {
        TopologySpec::clustered(&[(2, 1024, 1_000_000), (2, 2048, 2_000_000)])
    }

    fn task(pid: i32, load_pct: u32, cpu: u32) -> TaskDef {
        let mut def = TaskDef::new(
            &format!("t{pid}"),
            Pid(pid),
            TaskBehavior {
                phases: vec![Phase::Run(u64::MAX / 4)],
                repeat: false,
            },
        );
        def.init_load_pct = Some(load_pct);
        def.start_cpu = Some(CpuId(cpu));
        def
    }

    #[test]
    fn test_small_task_goes_to_mostly_idle_cpu() {
        let mut s = FairSched::new(&TopologySpec::smp(2), hmp_tunables()).unwrap();
        let pid = s.fork_task(&task(1, 5, 1)).unwrap();
        assert!(s.is_small_task(pid));
        let cpu = s.task(pid).unwrap().cpu;
        // Busy but under the spill limits: the task would still fit there.
        s.rqs[cpu.idx()].nr_running = 5;
        let other = CpuId(1 - cpu.0);
        assert_eq!(s.select_best_cpu(pid, None, false, cpu), other);
    }

    #[test]
    fn test_boost_refcount() {
        let mut s = FairSched::new(&TopologySpec::smp(1), Tunables::default()).unwrap();
        assert_eq!(s.set_boost(true), Err(ConfigError::HmpDisabled));

        let mut s = FairSched::new(&TopologySpec::smp(1), hmp_tunables()).unwrap();
        assert_eq!(s.set_boost(false), Err(ConfigError::BoostUnderflow));
        s.set_boost(true).unwrap();
        s.set_boost(true).unwrap();
        assert!(s.sched_boost());
        s.set_boost(false).unwrap();
        assert!(s.sched_boost());
        s.set_boost(false).unwrap();
        assert!(!s.sched_boost());
        assert_eq!(s.set_boost(false), Err(ConfigError::BoostUnderflow));
    }

    #[test]
    fn test_fit_uses_downmigrate_when_leaving_big_cpu() {
        let mut s = FairSched::new(&big_little(), hmp_tunables()).unwrap();
        let pid = s.fork_task(&task(1, 5, 0)).unwrap();
        let tload = pct_to_demand(70);

        s.tasks.get_mut(&pid).unwrap().cpu = CpuId(1);
        assert!(s.task_load_will_fit(pid, tload, CpuId(0)));
        s.tasks.get_mut(&pid).unwrap().cpu = CpuId(2);
        assert!(!s.task_load_will_fit(pid, tload, CpuId(0)));
        // The biggest CPUs fit everything.
        assert!(s.task_load_will_fit(pid, pct_to_demand(100), CpuId(3)));
    }

    #[test]
    fn test_big_task_classification() {
        let mut s = FairSched::new(&big_little(), hmp_tunables()).unwrap();
        let heavy = s.fork_task(&task(1, 30, 0)).unwrap();
        // 30% of a big CPU is 120% of a little one.
        s.tasks.get_mut(&heavy).unwrap().cpu = CpuId(0);
        assert!(s.is_big_task(heavy));
        s.tasks.get_mut(&heavy).unwrap().nice = 19;
        assert!(!s.is_big_task(heavy));
    }

    #[test]
    fn test_power_delta_exceeded() {
        let mut t = hmp_tunables();
        let s = FairSched::new(&TopologySpec::smp(1), t.clone()).unwrap();
        assert!(s.power_delta_exceeded(101, 100));
        assert!(!s.power_delta_exceeded(100, 100));
        assert!(!s.power_delta_exceeded(50, 0));

        t.hmp.enable_power_aware = true;
        let s = FairSched::new(&TopologySpec::smp(1), t).unwrap();
        assert!(!s.power_delta_exceeded(115, 100));
        assert!(s.power_delta_exceeded(130, 100));
        assert!(s.power_delta_exceeded(70, 100));
    }

    #[test]
    fn test_preferred_cluster_follows_group_demand() {
        let mut s = FairSched::new(&big_little(), hmp_tunables()).unwrap();
        let rg = RelatedGroupId(7);
        for pid in [1, 2] {
            let mut def = task(pid, 1, 0);
            def.related_group = Some(rg);
            s.fork_task(&def).unwrap();
        }
        assert_eq!(s.preferred_cluster_of(rg), Some(ClusterId(0)));

        let mut def = task(3, 100, 0);
        def.related_group = Some(rg);
        s.fork_task(&def).unwrap();
        assert_eq!(s.preferred_cluster_of(rg), Some(ClusterId(1)));

        for pid in [1, 2, 3] {
            s.set_related_group(Pid(pid), None);
        }
        assert_eq!(s.preferred_cluster_of(rg), None);
    }

    #[test]
    fn test_stats_follow_enqueue_and_dequeue() {
        let mut s = FairSched::new(&TopologySpec::smp(1), hmp_tunables()).unwrap();
        let pid = s.fork_task(&task(1, 5, 0)).unwrap();
        let stats = s.rqs[0].hmp_stats;
        assert_eq!(stats.nr_small_tasks, 1);
        assert_eq!(stats.cumulative_runnable_avg, s.task_demand(pid));

        s.dequeue_task(CpuId(0), pid, 0);
        assert_eq!(s.rqs[0].hmp_stats, crate::cfs_rq::HmpStats::default());
        assert!(s.task(pid).unwrap().hmp_contrib.is_none());
    }

    /// CPU 0 is expensive and about to be thermally capped, CPU 1 is cheap.
    struct SkewedPower;

    static EXPENSIVE: [PowerState; 1] = [PowerState { freq: u64::MAX, power: 100 }];
    static CHEAP: [PowerState; 1] = [PowerState { freq: u64::MAX, power: 10 }];

    impl crate::power::PowerModel for SkewedPower {
        fn power_table(&self, cpu: CpuId) -> Option<&[PowerState]> {
            let table: &[PowerState] = if cpu.0 == 0 { &EXPENSIVE } else { &CHEAP };
            Some(table)
        }

        fn cpu_temperature(&self, cpu: CpuId) -> u32 {
            if cpu.0 == 0 { 90 } else { 40 }
        }

        fn is_throttling_imminent(&self, cpu: CpuId) -> bool {
            cpu.0 == 0
        }
    }

    #[test]
    fn test_thermal_pressure_requests_ea_migration() {
        let mut t = hmp_tunables();
        t.hmp.enable_power_aware = true;
        let mut s = FairSched::new(&TopologySpec::smp(2), t).unwrap();
        let pid = s.fork_task(&task(1, 20, 0)).unwrap();
        if s.task(pid).unwrap().cpu != CpuId(0) {
            s.move_queued_task(pid, CpuId(0));
        }
        assert_eq!(s.migration_needed(CpuId(0), pid), None);

        s.set_power_model(Box::new(SkewedPower));
        assert_eq!(s.migration_needed(CpuId(0), pid), Some(MigrationReason::Ea));
    }
}
