// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Load balancing
//!
//! Periodic, newly-idle and idle-on-behalf-of-others balancing across the
//! scheduling domain hierarchy.
//!
//! Each pass works on one domain of one CPU (the destination). It gathers
//! per-group statistics ([`SgLbStats`]), picks the busiest group, works out
//! how much weighted load should move to the local group, picks the busiest
//! run-queue inside that group and detaches tasks from it until the
//! imbalance is covered. When nothing could be pulled after repeated
//! attempts, or when the HMP rules want a specific running task moved, the
//! busiest CPU is asked to push its running task through an active balance.
//!
//! Idle CPUs stop their tick. They are tracked in [`NohzState`] and one of
//! them is kicked to balance for all of them when a busy CPU sees work
//! piling up.
//!
//! Balance intervals and timestamps are in jiffies, except for the
//! per-domain intervals which are kept in milliseconds.

use tracing::debug;
use tracing::trace;

use crate::cpumask::Cpumask;
use crate::numa::fbq_classify_group;
use crate::numa::FbqType;
use crate::pelt::SCHED_CAPACITY_SCALE;
use crate::rq::double_rq_mut;
use crate::sched::FairSched;
use crate::task::TaskState;
use crate::topology::{
    SchedDomain, SD_BALANCE_NEWIDLE, SD_LOAD_BALANCE, SD_NUMA, SD_PREFER_SIBLING,
    SD_SHARE_PKG_RESOURCES,
};
use crate::types::{CpuId, CpuIdleType, Pid, Policy, NSEC_PER_MSEC, NSEC_PER_SEC, NSEC_PER_USEC, TICK_NSEC};

pub const HZ: u64 = NSEC_PER_SEC / TICK_NSEC;

pub const LBF_ALL_PINNED: u32 = 0x01;
pub const LBF_NEED_BREAK: u32 = 0x02;
pub const LBF_DST_PINNED: u32 = 0x04;
pub const LBF_SOME_PINNED: u32 = 0x08;
pub const LBF_IGNORE_SMALL_TASKS: u32 = 0x10;
pub const LBF_EA_ACTIVE_BALANCE: u32 = 0x20;
pub const LBF_SCHED_BOOST_ACTIVE_BALANCE: u32 = 0x40;
pub const LBF_BIG_TASK_ACTIVE_BALANCE: u32 = 0x80;
pub const LBF_HMP_ACTIVE_BALANCE: u32 =
    LBF_EA_ACTIVE_BALANCE | LBF_SCHED_BOOST_ACTIVE_BALANCE | LBF_BIG_TASK_ACTIVE_BALANCE;
pub const LBF_IGNORE_BIG_TASKS: u32 = 0x100;
pub const LBF_IGNORE_PREFERRED_CLUSTER_TASKS: u32 = 0x200;
const LBF_IGNORE_MASK: u32 =
    LBF_IGNORE_SMALL_TASKS | LBF_IGNORE_BIG_TASKS | LBF_IGNORE_PREFERRED_CLUSTER_TASKS;

const SCHED_NR_MIGRATE_BREAK: u32 = 32;
const MAX_PINNED_INTERVAL: u64 = 16;
const NEED_ACTIVE_BALANCE_THRESHOLD: u32 = 10;
const MAX_LOAD_BALANCE_INTERVAL_MS: u64 = 100;

/// Simulated cost of a newly-idle pass, per CPU in the domain span. The
/// simulated clock does not move while balancing.
const NEWIDLE_COST_PER_CPU_NS: u64 = 2 * NSEC_PER_USEC;

pub fn msecs_to_jiffies(ms: u64) -> u64 {
    (ms * NSEC_PER_MSEC).div_ceil(TICK_NSEC)
}

/// Why a group is a balancing candidate, in increasing order of urgency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum GroupType {
    #[default]
    Other,
    /// A same-capacity CPU could run the group's work for less power.
    Ea,
    /// Affinity kept an earlier pass from balancing the group.
    Imbalanced,
    Overloaded,
}

/// Idle CPUs with their tick stopped.
#[derive(Debug, Clone)]
pub struct NohzState {
    pub idle_cpus: Cpumask,
    pub nr_cpus: u32,
    /// In jiffies.
    pub next_balance: u64,
}

impl NohzState {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            idle_cpus: Cpumask::new(nr_cpus),
            nr_cpus: 0,
            next_balance: 0,
        }
    }
}

/// Statistics of one group of a domain.
#[derive(Debug, Clone, Copy, Default)]
pub struct SgLbStats {
    /// Load scaled by the group's capacity.
    pub avg_load: u64,
    pub group_load: u64,
    pub sum_weighted_load: u64,
    pub load_per_task: u64,
    pub group_capacity: u64,
    pub group_util: u64,
    pub sum_nr_running: u32,
    pub sum_nr_big_tasks: u32,
    pub sum_nr_small_tasks: u32,
    pub group_cpu_load: u64,
    pub idle_cpus: u32,
    pub group_weight: u32,
    pub group_type: GroupType,
    pub group_no_capacity: bool,
    pub nr_numa_running: u32,
    pub nr_preferred_running: u32,
}

/// Statistics of a whole domain.
#[derive(Debug, Clone, Default)]
pub struct SdLbStats {
    /// Index into the domain's groups.
    pub busiest: Option<usize>,
    pub local: Option<usize>,
    pub total_load: u64,
    pub total_capacity: u64,
    /// Domain-wide load per unit of capacity.
    pub avg_load: u64,
    pub busiest_stat: SgLbStats,
    pub local_stat: SgLbStats,
}

/// State of one balancing attempt.
#[derive(Debug)]
pub struct LbEnv {
    /// The domain being balanced: owning CPU and level.
    pub sd: (CpuId, usize),
    pub src_cpu: CpuId,
    pub dst_cpu: CpuId,
    /// CPUs of the local group an affinity-blocked pull may retarget to.
    pub dst_grpmask: Option<Cpumask>,
    pub new_dst_cpu: CpuId,
    pub idle: CpuIdleType,
    /// Weighted load still to move.
    pub imbalance: i64,
    /// CPUs still eligible in this attempt.
    pub cpus: Cpumask,
    pub busiest_grp_capacity: u64,
    pub busiest_nr_running: u32,
    pub flags: u32,
    pub loops: u32,
    pub loop_break: u32,
    pub loop_max: u32,
    pub fbq_type: FbqType,
    pub tasks: Vec<Pid>,
}

impl LbEnv {
    pub fn new(cpu: CpuId, level: usize, idle: CpuIdleType, cpus: Cpumask) -> Self {
        Self {
            sd: (cpu, level),
            src_cpu: cpu,
            dst_cpu: cpu,
            dst_grpmask: None,
            new_dst_cpu: cpu,
            idle,
            imbalance: 0,
            cpus,
            busiest_grp_capacity: 0,
            busiest_nr_running: 0,
            flags: 0,
            loops: 0,
            loop_break: SCHED_NR_MIGRATE_BREAK,
            loop_max: 0,
            fbq_type: FbqType::All,
            tasks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LbOutcome {
    Balanced,
    AllPinned,
    OnePinned,
}

pub fn get_sd_load_idx(sd: &SchedDomain, idle: CpuIdleType) -> usize {
    match idle {
        CpuIdleType::NotIdle => sd.idx.busy,
        CpuIdleType::NewlyIdle => sd.idx.newidle,
        CpuIdleType::Idle => sd.idx.idle,
    }
}

fn group_has_capacity(imbalance_pct: u64, sgs: &SgLbStats) -> bool {
    if sgs.sum_nr_running < sgs.group_weight {
        return true;
    }
    sgs.group_capacity * 100 > sgs.group_util * imbalance_pct
}

fn group_is_overloaded(imbalance_pct: u64, sgs: &SgLbStats) -> bool {
    if sgs.sum_nr_running <= sgs.group_weight {
        return false;
    }
    sgs.group_capacity * 100 < sgs.group_util * imbalance_pct
}

impl FairSched {
    fn sd(&self, env: &LbEnv) -> &SchedDomain {
        &self.topo.domains[env.sd.0.idx()][env.sd.1]
    }

    fn sd_mut(&mut self, cpu: CpuId, level: usize) -> &mut SchedDomain {
        &mut self.topo.domains[cpu.idx()][level]
    }

    /// Capacity state of the parent domain's local group, if there is a
    /// parent.
    fn parent_sgc(&self, cpu: CpuId, level: usize) -> Option<usize> {
        self.topo.domains[cpu.idx()]
            .get(level + 1)
            .map(|p| p.groups[0].sgc)
    }

    /// Balance interval of a domain in jiffies. Busy CPUs balance less
    /// often.
    pub(crate) fn sd_balance_interval(&self, cpu: CpuId, level: usize, cpu_busy: bool) -> u64 {
        let sd = &self.topo.domains[cpu.idx()][level];
        let mut interval = sd.balance_interval;
        if cpu_busy {
            interval *= sd.busy_factor;
        }
        msecs_to_jiffies(interval).clamp(1, msecs_to_jiffies(MAX_LOAD_BALANCE_INTERVAL_MS))
    }

    fn update_next_balance(&self, cpu: CpuId, level: usize, cpu_busy: bool, next_balance: &mut u64) {
        let interval = self.sd_balance_interval(cpu, level, cpu_busy);
        let next = self.topo.domains[cpu.idx()][level].last_balance + interval;
        if *next_balance > next {
            *next_balance = next;
        }
    }

    /// Capacity left for fair tasks once interrupt time is taken out.
    fn update_cpu_capacity(&mut self, cpu: CpuId, sgc: usize) {
        let orig = self.topo.capacity_orig(cpu);
        let irq = self.rqs[cpu.idx()].irqload_pct.min(100) as u64;
        let capacity = (orig * (100 - irq) / 100).max(1);
        let rq = &mut self.rqs[cpu.idx()];
        rq.cpu_capacity_orig = orig;
        rq.cpu_capacity = capacity;
        self.topo.sgc[sgc].capacity = capacity;
    }

    /// Refresh the capacity of the local group of `cpu`'s domain at
    /// `level`: the CPU itself at the bottom, the sum of the child domain's
    /// groups above that.
    pub(crate) fn update_group_capacity(&mut self, cpu: CpuId, level: usize, dst_cpu: CpuId) {
        let interval = self.sd_balance_interval(cpu, level, false);
        let sgc = self.topo.domains[cpu.idx()][level].groups[0].sgc;
        self.topo.sgc[sgc].next_update = self.jiffies() + interval;

        if level == 0 {
            self.update_cpu_capacity(dst_cpu, sgc);
            return;
        }
        let child = &self.topo.domains[cpu.idx()][level - 1];
        let capacity = child
            .groups
            .iter()
            .map(|g| self.topo.sgc[g.sgc].capacity)
            .sum::<u64>();
        self.topo.sgc[sgc].capacity = capacity;
    }

    /// Whether interrupt load eats a noticeable share of the CPU.
    fn check_cpu_capacity(&self, cpu: CpuId, sd: &SchedDomain) -> bool {
        let rq = &self.rqs[cpu.idx()];
        rq.cpu_capacity * sd.imbalance_pct < rq.cpu_capacity_orig * 100
    }

    fn group_classify(&self, env: &mut LbEnv, first: CpuId, sgc_imbalance: bool, sgs: &SgLbStats) -> GroupType {
        if sgs.group_no_capacity {
            env.flags &= !LBF_EA_ACTIVE_BALANCE;
            return GroupType::Overloaded;
        }
        if sgc_imbalance {
            env.flags &= !LBF_EA_ACTIVE_BALANCE;
            return GroupType::Imbalanced;
        }

        let dst = env.dst_cpu;
        if self.cfg.hmp().enable_power_aware
            && self.topo.capacity(dst) == self.topo.capacity(first)
            && sgs.sum_nr_running > 0
            && env.idle != CpuIdleType::NotIdle
            && self.power_cost_at_freq(dst, 0) < self.power_cost_at_freq(first, 0)
            && !self.rqs[first.idx()]
                .curr
                .map_or(true, |p| self.is_task_migration_throttled(p))
            && self.power.is_throttling_imminent(first)
        {
            env.flags |= LBF_EA_ACTIVE_BALANCE;
            return GroupType::Ea;
        }
        GroupType::Other
    }

    fn update_sg_lb_stats(
        &self,
        env: &mut LbEnv,
        group_idx: usize,
        load_idx: usize,
        local_group: bool,
        overload: &mut bool,
    ) -> SgLbStats {
        let sd = self.sd(env);
        let imbalance_pct = sd.imbalance_pct;
        let group = &sd.groups[group_idx];
        let mut sgs = SgLbStats::default();

        for i in group.cpus.iter().filter(|&i| env.cpus.test_cpu(i)) {
            let rq = &self.rqs[i.idx()];
            let load = if local_group {
                self.target_load(i, load_idx)
            } else {
                self.source_load(i, load_idx)
            };
            sgs.group_load += load;
            sgs.group_util += self.cpu_util(i);
            sgs.sum_nr_running += self.cfs_rqs[rq.cfs.idx()].h_nr_running;
            if rq.nr_running > 1 {
                *overload = true;
            }
            sgs.sum_nr_big_tasks += rq.hmp_stats.nr_big_tasks;
            sgs.sum_nr_small_tasks += rq.hmp_stats.nr_small_tasks;
            sgs.group_cpu_load += self.cpu_load(i);
            sgs.nr_numa_running += rq.nr_numa_running;
            sgs.nr_preferred_running += rq.nr_preferred_running;
            sgs.sum_weighted_load += self.weighted_cpuload(i);
            if rq.nr_running == 0 && rq.is_idle() {
                sgs.idle_cpus += 1;
            }
        }

        let sgc = &self.topo.sgc[group.sgc];
        sgs.group_capacity = sgc.capacity.max(1);
        sgs.avg_load = sgs.group_load * SCHED_CAPACITY_SCALE / sgs.group_capacity;
        if sgs.sum_nr_running > 0 {
            sgs.load_per_task = sgs.sum_weighted_load / sgs.sum_nr_running as u64;
        }
        sgs.group_weight = group.group_weight as u32;
        sgs.group_no_capacity = group_is_overloaded(imbalance_pct, &sgs);

        let first = group.cpus.first().unwrap_or(env.dst_cpu);
        let imbalanced = sgc.imbalance;
        sgs.group_type = self.group_classify(env, first, imbalanced, &sgs);
        sgs
    }

    /// HMP reasons to prefer a group regardless of load: boost wants work
    /// on the big CPUs, or the group holds more big tasks than any seen.
    fn update_sd_pick_busiest_active_balance(
        &self,
        env: &mut LbEnv,
        sds: &SdLbStats,
        first: CpuId,
        sgs: &SgLbStats,
    ) -> bool {
        if !self.cfg.hmp_enabled()
            || env.idle == CpuIdleType::NotIdle
            || self.topo.capacity(env.dst_cpu) <= self.topo.capacity(first)
        {
            return false;
        }
        if self.sched_boost() && sds.busiest.is_none() && sgs.sum_nr_running > 0 {
            env.flags |= LBF_SCHED_BOOST_ACTIVE_BALANCE;
            return true;
        }
        if sgs.sum_nr_big_tasks > sds.busiest_stat.sum_nr_big_tasks {
            env.flags |= LBF_BIG_TASK_ACTIVE_BALANCE;
            return true;
        }
        false
    }

    fn update_sd_pick_busiest(&self, env: &mut LbEnv, sds: &SdLbStats, group_idx: usize, sgs: &SgLbStats) -> bool {
        let sd = self.sd(env);
        let first = sd.groups[group_idx].cpus.first().unwrap_or(env.dst_cpu);
        let busiest_first = sds
            .busiest
            .and_then(|b| sd.groups[b].cpus.first());

        if self.update_sd_pick_busiest_active_balance(env, sds, first, sgs) {
            return true;
        }

        let busiest = &sds.busiest_stat;
        if sgs.group_type > busiest.group_type {
            return true;
        }
        if sgs.group_type < busiest.group_type {
            if sgs.group_type == GroupType::Ea {
                env.flags &= !LBF_EA_ACTIVE_BALANCE;
            }
            return false;
        }

        if env.flags & LBF_EA_ACTIVE_BALANCE != 0 {
            let Some(b) = busiest_first else {
                return true;
            };
            return self.power_cost_at_freq(first, 0) > self.power_cost_at_freq(b, 0);
        }

        sgs.avg_load > busiest.avg_load
    }

    fn update_sd_lb_stats(&mut self, env: &mut LbEnv, sds: &mut SdLbStats) {
        let (cpu, level) = env.sd;
        let nr_levels = self.topo.domains[cpu.idx()].len();
        let prefer_sibling = level > 0 && self.topo.domains[cpu.idx()][level - 1].has(SD_PREFER_SIBLING);
        let sd = self.sd(env);
        let load_idx = get_sd_load_idx(sd, env.idle);
        let imbalance_pct = sd.imbalance_pct;
        let nr_groups = sd.groups.len();
        let numa = sd.has(SD_NUMA);
        let jiffies = self.jiffies();
        let mut overload = false;

        for gi in 0..nr_groups {
            let group = &self.topo.domains[cpu.idx()][level].groups[gi];
            let local_group = group.cpus.test_cpu(env.dst_cpu);
            if local_group {
                sds.local = Some(gi);
                let next_update = self.topo.sgc[group.sgc].next_update;
                if env.idle != CpuIdleType::NewlyIdle || jiffies >= next_update {
                    self.update_group_capacity(cpu, level, env.dst_cpu);
                }
            }

            let mut sgs = self.update_sg_lb_stats(env, gi, load_idx, local_group, &mut overload);
            if local_group {
                sds.local_stat = sgs;
            } else {
                // Spread over siblings before stacking tasks on one.
                if prefer_sibling
                    && sds.local.is_some()
                    && group_has_capacity(imbalance_pct, &sds.local_stat)
                    && sgs.sum_nr_running > 1
                {
                    sgs.group_no_capacity = true;
                    sgs.group_type = GroupType::Overloaded;
                }
                if self.update_sd_pick_busiest(env, sds, gi, &sgs) {
                    sds.busiest = Some(gi);
                    sds.busiest_stat = sgs;
                    env.busiest_nr_running = sgs.sum_nr_running;
                    env.busiest_grp_capacity = sgs.group_capacity;
                }
            }
            sds.total_load += sgs.group_load;
            sds.total_capacity += sgs.group_capacity;
        }

        if numa {
            let b = &sds.busiest_stat;
            env.fbq_type = fbq_classify_group(b.sum_nr_running, b.nr_numa_running, b.nr_preferred_running);
        }
        if level + 1 == nr_levels {
            self.overload = overload;
        }
    }

    /// A bigger local cluster leaves a little cluster alone while it keeps
    /// under its spill thresholds and has no big tasks.
    fn bail_inter_cluster_balance(&self, env: &LbEnv, sds: &SdLbStats) -> bool {
        if !self.cfg.hmp_enabled() {
            return false;
        }
        let sd = self.sd(env);
        let (Some(local), Some(busiest)) = (sds.local, sds.busiest) else {
            return false;
        };
        let (Some(local_cpu), Some(busiest_cpu)) =
            (sd.groups[local].cpus.first(), sd.groups[busiest].cpus.first())
        else {
            return false;
        };
        if self.topo.capacity(local_cpu) <= self.topo.capacity(busiest_cpu) {
            return false;
        }
        let b = &sds.busiest_stat;
        if b.sum_nr_big_tasks > 0 {
            return false;
        }
        let nr_cpus = sd.groups[busiest].cpus.weight() as u64;
        b.group_cpu_load < nr_cpus * self.cfg.spill_load
            && (b.sum_nr_running as u64) < nr_cpus * self.cfg.hmp().spill_nr_run as u64
    }

    /// Find an imbalance between two groups too small for the normal
    /// computation and see whether moving one task improves throughput.
    fn fix_small_imbalance(&self, env: &mut LbEnv, sds: &mut SdLbStats) {
        let mut imbn = 2;
        if sds.local_stat.sum_nr_running == 0 {
            sds.local_stat.load_per_task = self.cpu_avg_load_per_task(env.dst_cpu);
        } else if sds.busiest_stat.load_per_task > sds.local_stat.load_per_task {
            imbn = 1;
        }
        let local = &sds.local_stat;
        let busiest = &sds.busiest_stat;
        let local_capacity = local.group_capacity.max(1);

        let scaled_busy_load_per_task = busiest.load_per_task * SCHED_CAPACITY_SCALE / busiest.group_capacity.max(1);
        if busiest.avg_load + scaled_busy_load_per_task >= local.avg_load + scaled_busy_load_per_task * imbn {
            env.imbalance = busiest.load_per_task as i64;
            return;
        }

        let mut capa_now = busiest.group_capacity * busiest.load_per_task.min(busiest.avg_load);
        capa_now += local.group_capacity * local.load_per_task.min(local.avg_load);
        capa_now /= SCHED_CAPACITY_SCALE;

        let mut capa_move = 0;
        if busiest.avg_load > scaled_busy_load_per_task {
            capa_move += busiest.group_capacity
                * busiest
                    .load_per_task
                    .min(busiest.avg_load - scaled_busy_load_per_task);
        }
        let tmp = if busiest.avg_load * busiest.group_capacity < busiest.load_per_task * SCHED_CAPACITY_SCALE {
            busiest.avg_load * busiest.group_capacity / local_capacity
        } else {
            busiest.load_per_task * SCHED_CAPACITY_SCALE / local_capacity
        };
        capa_move += local.group_capacity * local.load_per_task.min(local.avg_load + tmp);
        capa_move /= SCHED_CAPACITY_SCALE;

        if capa_move > capa_now {
            env.imbalance = busiest.load_per_task as i64;
        }
    }

    /// Weighted load to move from the busiest group to the local one.
    pub(crate) fn calculate_imbalance(&self, env: &mut LbEnv, sds: &mut SdLbStats) {
        if sds.busiest_stat.group_type == GroupType::Imbalanced {
            sds.busiest_stat.load_per_task = sds.busiest_stat.load_per_task.min(sds.avg_load);
        }
        let local = sds.local_stat;
        let busiest = sds.busiest_stat;

        if busiest.avg_load <= sds.avg_load || local.avg_load >= sds.avg_load {
            env.imbalance = 0;
            self.fix_small_imbalance(env, sds);
            return;
        }

        let mut load_above_capacity = u64::MAX;
        if busiest.group_type == GroupType::Overloaded && local.group_type == GroupType::Overloaded {
            load_above_capacity = busiest.sum_nr_running as u64 * SCHED_CAPACITY_SCALE;
            if load_above_capacity > busiest.group_capacity {
                load_above_capacity -= busiest.group_capacity;
            } else {
                load_above_capacity = u64::MAX;
            }
        }

        let max_pull = (busiest.avg_load - sds.avg_load).min(load_above_capacity);
        let imbalance = (max_pull.saturating_mul(busiest.group_capacity))
            .min((sds.avg_load - local.avg_load) * local.group_capacity)
            / SCHED_CAPACITY_SCALE;
        env.imbalance = imbalance as i64;

        if imbalance < busiest.load_per_task {
            self.fix_small_imbalance(env, sds);
        }
    }

    /// The group tasks should be pulled from, with `env.imbalance` set to
    /// the load to pull. `None` when the domain is balanced.
    pub(crate) fn find_busiest_group(&mut self, env: &mut LbEnv) -> Option<Cpumask> {
        let mut sds = SdLbStats::default();
        self.update_sd_lb_stats(env, &mut sds);

        let balanced = 'check: {
            let Some(busiest_idx) = sds.busiest else {
                break 'check true;
            };
            if sds.busiest_stat.sum_nr_running == 0 {
                break 'check true;
            }
            if env.flags & LBF_HMP_ACTIVE_BALANCE != 0 {
                break 'check false;
            }
            if self.bail_inter_cluster_balance(env, &sds) {
                break 'check true;
            }

            sds.avg_load = SCHED_CAPACITY_SCALE * sds.total_load / sds.total_capacity.max(1);
            let local = &sds.local_stat;
            let busiest = &sds.busiest_stat;
            let sd = self.sd(env);

            // Affinity left the group imbalanced: push it as long as it is
            // clearly heavier than the local group.
            if busiest.group_type == GroupType::Imbalanced {
                let margin = self.cfg.tunables.hysteresis.group_imbalance_16ths;
                if 16 * busiest.avg_load > (16 + margin) * local.avg_load {
                    break 'check false;
                }
            }
            if env.idle == CpuIdleType::NewlyIdle
                && group_has_capacity(sd.imbalance_pct, local)
                && busiest.group_no_capacity
            {
                break 'check false;
            }
            if local.avg_load >= busiest.avg_load || local.avg_load >= sds.avg_load {
                break 'check true;
            }
            if env.idle == CpuIdleType::Idle {
                if busiest.group_type != GroupType::Overloaded && local.idle_cpus <= busiest.idle_cpus + 1 {
                    break 'check true;
                }
            } else if 100 * busiest.avg_load <= sd.imbalance_pct * local.avg_load {
                break 'check true;
            }
            trace!(group = busiest_idx, "busiest group found");
            false
        };

        if balanced {
            env.imbalance = 0;
            return None;
        }
        self.calculate_imbalance(env, &mut sds);
        let busiest = sds.busiest?;
        Some(self.sd(env).groups[busiest].cpus.clone())
    }

    /// With HMP on, the busiest queue is the one with the most demand, or
    /// the one with the most big tasks when a big task is to be pulled up.
    fn find_busiest_queue_hmp(&self, env: &mut LbEnv, group: &Cpumask) -> Option<CpuId> {
        let find_big = env.flags & LBF_BIG_TASK_ACTIVE_BALANCE != 0;
        let mut busiest = None;
        let mut busiest_big = None;
        let (mut max_avg, mut max_avg_big, mut max_nr_big) = (0u64, 0u64, 0u32);

        for i in group.iter().filter(|&i| env.cpus.test_cpu(i)) {
            let stats = &self.rqs[i.idx()].hmp_stats;
            let cra = stats.cumulative_runnable_avg;
            if find_big {
                let nr_big = stats.nr_big_tasks;
                if nr_big > max_nr_big || (nr_big > 0 && nr_big == max_nr_big && cra > max_avg_big) {
                    max_avg_big = cra;
                    busiest_big = Some(i);
                    max_nr_big = nr_big;
                    continue;
                }
            }
            if cra > max_avg {
                max_avg = cra;
                busiest = Some(i);
            }
        }

        if busiest_big.is_some() {
            return busiest_big;
        }
        env.flags &= !LBF_BIG_TASK_ACTIVE_BALANCE;
        busiest
    }

    /// The run-queue in `group` with the most load per unit of capacity.
    pub(crate) fn find_busiest_queue(&self, env: &mut LbEnv, group: &Cpumask) -> Option<CpuId> {
        if self.cfg.hmp_enabled() {
            return self.find_busiest_queue_hmp(env, group);
        }
        let sd = self.sd(env);
        let mut busiest = None;
        let (mut busiest_load, mut busiest_capacity) = (0u64, 1u64);

        for i in group.iter().filter(|&i| env.cpus.test_cpu(i)) {
            if self.fbq_classify_rq(i) > env.fbq_type {
                continue;
            }
            let capacity = self.capacity_of(i);
            let wl = self.weighted_cpuload(i);
            // A lone task heavier than the imbalance stays put unless its
            // CPU lost capacity.
            if self.rqs[i.idx()].nr_running == 1 && wl as i64 > env.imbalance && !self.check_cpu_capacity(i, sd) {
                continue;
            }
            if wl * busiest_capacity > busiest_load * capacity {
                busiest_load = wl;
                busiest_capacity = capacity;
                busiest = Some(i);
            }
        }
        busiest
    }

    /// Only the first idle CPU of the local group, or its first CPU when
    /// none is idle, balances the domain.
    fn should_we_balance(&self, env: &LbEnv) -> bool {
        if env.idle == CpuIdleType::NewlyIdle {
            return self.rqs[env.dst_cpu.idx()].nr_running == 0;
        }
        let group = self.sd(env).groups[0].cpus.and(&env.cpus).and(&self.active_mask);
        let balance_cpu = group
            .iter()
            .find(|&c| self.rqs[c.idx()].is_idle())
            .or_else(|| group.first());
        balance_cpu == Some(env.dst_cpu)
    }

    /// Whether `pid` recently ran and would lose its cache by moving.
    fn task_hot(&self, pid: Pid, env: &LbEnv) -> bool {
        let task = &self.tasks[&pid];
        if task.policy == Policy::Idle {
            return false;
        }
        let se = task.se;
        let q = &self.cfs_rqs[self.cfs_rq_of(se).idx()];
        if self.cfg.features().cache_hot_buddy
            && self.rqs[env.dst_cpu.idx()].nr_running > 0
            && (q.next == Some(se) || q.last == Some(se))
        {
            return true;
        }
        match self.cfg.tunables.migration_cost_ns {
            -1 => true,
            0 => false,
            cost => {
                let clock = self.rqs[env.src_cpu.idx()].clock_task as i64;
                clock - (self.entities[se.idx()].exec_start as i64) < cost
            }
        }
    }

    pub(crate) fn can_migrate_task(&self, pid: Pid, env: &mut LbEnv) -> bool {
        let task = &self.tasks[&pid];
        let (src, dst) = (env.src_cpu, env.dst_cpu);
        if self.throttled_lb_pair(task.group, src, dst) {
            return false;
        }

        if !task.cpus_allowed.test_cpu(dst) {
            env.flags |= LBF_SOME_PINNED;
            if env.flags & LBF_DST_PINNED != 0 {
                return false;
            }
            let Some(grpmask) = &env.dst_grpmask else {
                return false;
            };
            let retarget = grpmask
                .iter()
                .filter(|&c| env.cpus.test_cpu(c))
                .find(|&c| task.cpus_allowed.test_cpu(c));
            if let Some(cpu) = retarget {
                env.flags |= LBF_DST_PINNED;
                env.new_dst_cpu = cpu;
            }
            return false;
        }
        env.flags &= !LBF_ALL_PINNED;

        if self.cfg.hmp_enabled() {
            if self.topo.capacity(dst) > self.topo.capacity(src)
                && self.rqs[src.idx()].hmp_stats.nr_big_tasks > 0
                && !self.is_big_task(pid)
            {
                return false;
            }
            if env.flags & LBF_IGNORE_SMALL_TASKS != 0 && self.is_small_task(pid) {
                return false;
            }
        }

        let twf = self.task_will_fit(pid, dst);
        if env.flags & LBF_IGNORE_BIG_TASKS != 0 && !twf {
            return false;
        }
        if env.flags & LBF_IGNORE_PREFERRED_CLUSTER_TASKS != 0
            && !self.preferred_cluster(self.topo.cpus[dst.idx()].cluster, pid)
        {
            return false;
        }
        // Keep tasks that do not fit from crossing clusters while the
        // busiest group still has a CPU for each of its tasks.
        let group_cpus = env.busiest_grp_capacity.div_ceil(SCHED_CAPACITY_SCALE);
        if !twf && env.busiest_nr_running as u64 <= group_cpus {
            return false;
        }
        if self.rqs[src.idx()].curr == Some(pid) {
            return false;
        }

        let sd = self.sd(env);
        let mut hot = self.task_hot(pid, env);
        if !hot {
            hot = self.migrate_degrades_locality(pid, src, dst, sd.flags);
        }
        env.idle != CpuIdleType::NotIdle
            || self.migrate_improves_locality(pid, src, dst, sd.flags)
            || !hot
            || sd.nr_balance_failed > sd.cache_nice_tries
    }

    /// Detach up to `env.imbalance` weighted load from the source CPU.
    /// Returns the number of tasks detached; they are left in `env.tasks`.
    pub(crate) fn detach_tasks(&mut self, env: &mut LbEnv) -> u32 {
        if env.imbalance <= 0 {
            return 0;
        }
        let (src, dst) = (env.src_cpu, env.dst_cpu);
        let orig_loop = env.loops;
        let mut detached = 0;

        if self.cfg.hmp_enabled() {
            env.flags |= LBF_IGNORE_PREFERRED_CLUSTER_TASKS;
            if self.topo.capacity(dst) > self.topo.capacity(src) {
                env.flags |= LBF_IGNORE_SMALL_TASKS;
            } else if self.topo.capacity(dst) < self.topo.capacity(src) && !self.sched_boost() {
                env.flags |= LBF_IGNORE_BIG_TASKS;
            }
        }

        loop {
            while let Some(&pid) = self.rqs[src.idx()].cfs_tasks.front() {
                // Never steal the last task.
                if env.idle != CpuIdleType::NotIdle && self.rqs[src.idx()].nr_running <= 1 {
                    break;
                }
                env.loops += 1;
                if env.loops > env.loop_max {
                    break;
                }
                if env.loops > env.loop_break {
                    env.loop_break += SCHED_NR_MIGRATE_BREAK;
                    env.flags |= LBF_NEED_BREAK;
                    break;
                }

                if self.can_migrate_task(pid, env) {
                    let load = self.task_h_load(pid).max(1);
                    let sd = self.sd(env);
                    let tiny = self.cfg.features().lb_min && load < 16 && sd.nr_balance_failed == 0;
                    let too_big = (self.rqs[src.idx()].nr_running > 2 || env.flags & LBF_IGNORE_BIG_TASKS != 0)
                        && (load / 2) as i64 > env.imbalance;
                    if !tiny && !too_big {
                        self.detach_task(pid, dst);
                        env.tasks.push(pid);
                        detached += 1;
                        env.imbalance -= load as i64;
                        // One task is enough to stop being idle.
                        if env.idle == CpuIdleType::NewlyIdle || env.imbalance <= 0 {
                            break;
                        }
                        continue;
                    }
                }
                let rq = &mut self.rqs[src.idx()];
                if let Some(p) = rq.cfs_tasks.pop_front() {
                    rq.cfs_tasks.push_back(p);
                }
            }

            if detached == 0 && env.flags & LBF_IGNORE_MASK != 0 {
                env.flags &= !LBF_IGNORE_MASK;
                env.loops = orig_loop;
                continue;
            }
            return detached;
        }
    }

    /// Detach the first migratable task of the source CPU.
    fn detach_one_task(&mut self, env: &mut LbEnv) -> Option<Pid> {
        let candidates: Vec<Pid> = self.rqs[env.src_cpu.idx()].cfs_tasks.iter().copied().collect();
        for pid in candidates {
            if !self.can_migrate_task(pid, env) {
                continue;
            }
            self.detach_task(pid, env.dst_cpu);
            return Some(pid);
        }
        None
    }

    fn attach_tasks(&mut self, env: &mut LbEnv) {
        for pid in std::mem::take(&mut env.tasks) {
            self.attach_task(pid);
        }
    }

    fn need_active_balance(&self, env: &LbEnv) -> bool {
        if env.flags & LBF_HMP_ACTIVE_BALANCE != 0 {
            return true;
        }
        let sd = self.sd(env);
        let src = &self.rqs[env.src_cpu.idx()];
        if env.idle != CpuIdleType::NotIdle
            && src.nr_running > 1
            && self.cfs_rqs[src.cfs.idx()].h_nr_running == 1
            && self.check_cpu_capacity(env.src_cpu, sd)
            && self.capacity_of(env.src_cpu) * sd.imbalance_pct < self.capacity_of(env.dst_cpu) * 100
        {
            return true;
        }
        sd.nr_balance_failed > sd.cache_nice_tries + NEED_ACTIVE_BALANCE_THRESHOLD
    }

    /// Bookkeeping after an attempt that reached a busiest queue. Returns
    /// `None` when the busiest CPU's running task cannot come here.
    fn settle_balance(
        &mut self,
        env: &mut LbEnv,
        busiest: CpuId,
        ld_moved: u32,
        continue_balancing: &mut bool,
    ) -> Option<u32> {
        let (this_cpu, level) = env.sd;
        let mut active_balance = false;

        if ld_moved == 0 {
            let hmp_active = env.flags & LBF_HMP_ACTIVE_BALANCE != 0;
            if !hmp_active {
                self.metrics.balance_failures.increment(1);
                if env.idle != CpuIdleType::NewlyIdle {
                    self.sd_mut(this_cpu, level).nr_balance_failed += 1;
                }
            }

            if self.need_active_balance(env) {
                let allowed = self.rqs[busiest.idx()]
                    .curr
                    .map_or(false, |p| self.tasks[&p].cpus_allowed.test_cpu(this_cpu));
                if !allowed {
                    env.flags |= LBF_ALL_PINNED;
                    return None;
                }

                if busiest != this_cpu {
                    let (src, dst) = double_rq_mut(&mut self.rqs, busiest, this_cpu);
                    if !src.active_balance {
                        src.active_balance = true;
                        src.push_cpu = this_cpu;
                        dst.reserved = true;
                        active_balance = true;
                    }
                }
                if active_balance {
                    self.stop_work.push_back(busiest);
                    *continue_balancing = false;
                    self.metrics.active_balances.increment(1);
                    debug!(src = busiest.0, dst = this_cpu.0, flags = env.flags, "active balance kick");
                }
                let sd = self.sd_mut(this_cpu, level);
                sd.nr_balance_failed = sd.cache_nice_tries + NEED_ACTIVE_BALANCE_THRESHOLD - 1;
            }
        } else {
            self.sd_mut(this_cpu, level).nr_balance_failed = 0;
        }

        let sd = self.sd_mut(this_cpu, level);
        if !active_balance {
            sd.balance_interval = sd.min_interval;
        } else if sd.balance_interval < sd.max_interval {
            sd.balance_interval *= 2;
        }
        Some(ld_moved)
    }

    /// Balance `this_cpu`'s domain at `level`. Returns the number of tasks
    /// pulled to this CPU (or to a sibling it retargeted to).
    pub(crate) fn load_balance(
        &mut self,
        this_cpu: CpuId,
        level: usize,
        idle: CpuIdleType,
        continue_balancing: &mut bool,
    ) -> u32 {
        let mut env = LbEnv::new(this_cpu, level, idle, self.active_mask.clone());
        if idle != CpuIdleType::NewlyIdle {
            env.dst_grpmask = Some(self.topo.domains[this_cpu.idx()][level].groups[0].cpus.clone());
        }
        self.metrics.balance_attempts.increment(1);

        let outcome = 'redo: loop {
            if !self.should_we_balance(&env) {
                *continue_balancing = false;
                break LbOutcome::Balanced;
            }
            let Some(group) = self.find_busiest_group(&mut env) else {
                break LbOutcome::Balanced;
            };
            let Some(busiest) = self.find_busiest_queue(&mut env, &group) else {
                break LbOutcome::Balanced;
            };
            debug_assert_ne!(busiest, env.dst_cpu);
            env.src_cpu = busiest;
            let mut ld_moved = 0;

            if self.rqs[busiest.idx()].nr_running > 1 {
                env.flags |= LBF_ALL_PINNED;
                env.loop_max = self.cfg.tunables.nr_migrate.min(self.rqs[busiest.idx()].nr_running);

                let mut drained = false;
                loop {
                    if self.rqs[busiest.idx()].nr_running <= 1 {
                        env.flags &= !LBF_ALL_PINNED;
                        drained = true;
                        break;
                    }
                    let cur = self.detach_tasks(&mut env);
                    if cur > 0 {
                        self.attach_tasks(&mut env);
                        ld_moved += cur;
                    }
                    if env.flags & LBF_NEED_BREAK != 0 {
                        env.flags &= !LBF_NEED_BREAK;
                        continue;
                    }
                    // Tasks left behind could run on another CPU of the
                    // local group: pull them there.
                    if env.flags & LBF_DST_PINNED != 0 && env.imbalance > 0 {
                        env.cpus.clear_cpu(env.dst_cpu);
                        env.dst_cpu = env.new_dst_cpu;
                        env.flags &= !LBF_DST_PINNED;
                        env.loops = 0;
                        env.loop_break = SCHED_NR_MIGRATE_BREAK;
                        continue;
                    }
                    break;
                }

                if !drained {
                    if env.flags & LBF_SOME_PINNED != 0 && env.imbalance > 0 {
                        if let Some(sgc) = self.parent_sgc(this_cpu, level) {
                            self.topo.sgc[sgc].imbalance = true;
                        }
                    }
                    if env.flags & LBF_ALL_PINNED != 0 {
                        env.cpus.clear_cpu(busiest);
                        env.cpus.clear_cpu(env.dst_cpu);
                        if env.cpus.intersects(&self.topo.domains[this_cpu.idx()][level].span) {
                            env.cpus.set_cpu(env.dst_cpu);
                            env.loops = 0;
                            env.loop_break = SCHED_NR_MIGRATE_BREAK;
                            continue 'redo;
                        }
                        break LbOutcome::AllPinned;
                    }
                }
            }

            match self.settle_balance(&mut env, busiest, ld_moved, continue_balancing) {
                Some(moved) => {
                    if moved > 0 {
                        debug!(
                            dst = this_cpu.0,
                            src = busiest.0,
                            level,
                            moved,
                            ?idle,
                            "pulled tasks"
                        );
                    }
                    return moved;
                }
                None => break LbOutcome::OnePinned,
            }
        };

        match outcome {
            LbOutcome::Balanced => {
                if env.flags & LBF_ALL_PINNED == 0 {
                    if let Some(sgc) = self.parent_sgc(this_cpu, level) {
                        self.topo.sgc[sgc].imbalance = false;
                    }
                }
                self.sd_mut(this_cpu, level).nr_balance_failed = 0;
            }
            LbOutcome::AllPinned => self.sd_mut(this_cpu, level).nr_balance_failed = 0,
            LbOutcome::OnePinned => {}
        }

        if env.idle != CpuIdleType::NewlyIdle {
            let sd = self.sd_mut(this_cpu, level);
            if (env.flags & LBF_ALL_PINNED != 0 && sd.balance_interval < MAX_PINNED_INTERVAL)
                || sd.balance_interval < sd.max_interval
            {
                sd.balance_interval *= 2;
            }
        }
        trace!(cpu = this_cpu.0, level, ?outcome, flags = env.flags, "balance found nothing to move");
        0
    }

    /// Among the LLC siblings that are idle, the one cheapest to run,
    /// when power-aware placement is on.
    fn idle_balance_cpu(&self, this_cpu: CpuId) -> CpuId {
        if !self.cfg.hmp().enable_power_aware {
            return this_cpu;
        }
        let mut best = this_cpu;
        let mut min_power = u64::MAX;
        for i in self.topo.llc_span(this_cpu).iter() {
            if i != this_cpu && !self.rqs[i.idx()].is_idle() {
                continue;
            }
            let cost = self.power_cost_at_freq(i, 0);
            if cost < min_power {
                min_power = cost;
                best = i;
            }
        }
        best
    }

    /// Try to pull work to `this_cpu`, which is about to go idle. Returns
    /// the number of tasks pulled, or 1 when fair work appeared otherwise.
    pub(crate) fn idle_balance(&mut self, this_cpu: CpuId) -> u32 {
        let jiffies = self.jiffies();
        let mut next_balance = jiffies + HZ;
        let mut pulled = 0;
        let mut curr_cost = 0;
        let mut balance_cpu = this_cpu;

        let clock = self.rqs[this_cpu.idx()].clock;
        self.rqs[this_cpu.idx()].idle_stamp = clock;
        let migration_cost = self.cfg.tunables.migration_cost_ns.max(0) as u64;

        if self.rqs[this_cpu.idx()].avg_idle < migration_cost || !self.overload {
            if !self.topo.domains[this_cpu.idx()].is_empty() {
                self.update_next_balance(this_cpu, 0, false, &mut next_balance);
            }
        } else {
            balance_cpu = self.idle_balance_cpu(this_cpu);
            self.update_blocked_averages(balance_cpu);

            for level in 0..self.topo.domains[balance_cpu.idx()].len() {
                let mut continue_balancing = true;
                let sd = &self.topo.domains[balance_cpu.idx()][level];
                if !sd.has(SD_LOAD_BALANCE) {
                    continue;
                }
                if self.rqs[balance_cpu.idx()].avg_idle < curr_cost + sd.max_newidle_lb_cost {
                    self.update_next_balance(balance_cpu, level, false, &mut next_balance);
                    break;
                }
                if sd.has(SD_BALANCE_NEWIDLE) {
                    let domain_cost = sd.weight() as u64 * NEWIDLE_COST_PER_CPU_NS;
                    pulled = self.load_balance(balance_cpu, level, CpuIdleType::NewlyIdle, &mut continue_balancing);
                    let sd = self.sd_mut(balance_cpu, level);
                    if domain_cost > sd.max_newidle_lb_cost {
                        sd.max_newidle_lb_cost = domain_cost;
                    }
                    curr_cost += domain_cost;
                }
                self.update_next_balance(balance_cpu, level, false, &mut next_balance);
                if pulled > 0 || self.rqs[balance_cpu.idx()].nr_running > 0 || !continue_balancing {
                    break;
                }
            }

            let rq = &mut self.rqs[this_cpu.idx()];
            if curr_cost > rq.max_idle_balance_cost {
                rq.max_idle_balance_cost = curr_cost;
            }
            if self.cfs_rqs[rq.cfs.idx()].h_nr_running > 0 && pulled == 0 {
                pulled = 1;
            }
        }

        let rq = &mut self.rqs[this_cpu.idx()];
        if rq.next_balance > next_balance {
            rq.next_balance = next_balance;
        }
        if pulled > 0 && balance_cpu == this_cpu {
            rq.idle_stamp = 0;
        }
        pulled
    }

    /// Stop work on `busiest_cpu`: push one task to the CPU recorded in
    /// `push_cpu`. The task is `push_task` when HMP asked for a specific
    /// one, otherwise the first one allowed to move.
    pub(crate) fn active_load_balance_cpu_stop(&mut self, busiest_cpu: CpuId) {
        let rq = &self.rqs[busiest_cpu.idx()];
        if !rq.active_balance {
            return;
        }
        let target_cpu = rq.push_cpu;
        let push_task = rq.push_task;
        let mut moved = None;

        if rq.nr_running > 0 && target_cpu != busiest_cpu {
            if let Some(pid) = push_task {
                let movable = self.tasks.get(&pid).map_or(false, |t| {
                    t.on_rq && t.state == TaskState::Running && t.cpu == busiest_cpu
                }) && self.rqs[target_cpu.idx()].online;
                if movable {
                    self.detach_task(pid, target_cpu);
                    moved = Some(pid);
                }
            } else if let Some(level) = self.topo.domains[target_cpu.idx()]
                .iter()
                .position(|sd| sd.has(SD_LOAD_BALANCE) && sd.span.test_cpu(busiest_cpu))
            {
                let mut env = LbEnv::new(target_cpu, level, CpuIdleType::Idle, self.active_mask.clone());
                env.src_cpu = busiest_cpu;
                moved = self.detach_one_task(&mut env);
            }
        }

        let rq = &mut self.rqs[busiest_cpu.idx()];
        rq.active_balance = false;
        rq.push_task = None;
        self.rqs[target_cpu.idx()].reserved = false;

        match moved {
            Some(pid) => {
                self.attach_task(pid);
                debug!(pid = pid.0, src = busiest_cpu.0, dst = target_cpu.0, "active balance moved task");
            }
            None => trace!(src = busiest_cpu.0, dst = target_cpu.0, "active balance moved nothing"),
        }
    }

    /// Periodic balance of every domain of `cpu` that is due.
    pub(crate) fn rebalance_domains(&mut self, cpu: CpuId, mut idle: CpuIdleType) {
        let jiffies = self.jiffies();
        let mut continue_balancing = true;
        let mut next_balance = jiffies + 60 * HZ;
        let mut update_next = false;
        let mut need_decay = false;
        let mut max_cost = 0;

        self.update_blocked_averages(cpu);

        for level in 0..self.topo.domains[cpu.idx()].len() {
            let sd = self.sd_mut(cpu, level);
            if jiffies > sd.next_decay_max_lb_cost {
                sd.max_newidle_lb_cost = sd.max_newidle_lb_cost * 253 / 256;
                sd.next_decay_max_lb_cost = jiffies + HZ;
                need_decay = true;
            }
            max_cost += sd.max_newidle_lb_cost;
            if !sd.has(SD_LOAD_BALANCE) {
                continue;
            }
            if !continue_balancing {
                if need_decay {
                    continue;
                }
                break;
            }

            let mut interval = self.sd_balance_interval(cpu, level, idle != CpuIdleType::Idle);
            if jiffies >= self.topo.domains[cpu.idx()][level].last_balance + interval {
                if self.load_balance(cpu, level, idle, &mut continue_balancing) > 0 {
                    idle = if self.rqs[cpu.idx()].is_idle() {
                        CpuIdleType::Idle
                    } else {
                        CpuIdleType::NotIdle
                    };
                }
                self.sd_mut(cpu, level).last_balance = jiffies;
                interval = self.sd_balance_interval(cpu, level, idle != CpuIdleType::Idle);
            }
            let next = self.topo.domains[cpu.idx()][level].last_balance + interval;
            if next_balance > next {
                next_balance = next;
                update_next = true;
            }
        }

        if need_decay {
            let migration_cost = self.cfg.tunables.migration_cost_ns.max(0) as u64;
            self.rqs[cpu.idx()].max_idle_balance_cost = migration_cost.max(max_cost);
        }
        if update_next {
            self.rqs[cpu.idx()].next_balance = next_balance;
            if idle == CpuIdleType::Idle && self.nohz.next_balance > next_balance {
                self.nohz.next_balance = next_balance;
            }
        }
    }

    pub(crate) fn nohz_balance_enter_idle(&mut self, cpu: CpuId) {
        if !self.active_mask.test_cpu(cpu)
            || self.rqs[cpu.idx()].nohz_tick_stopped
            || self.topo.domains[cpu.idx()].is_empty()
        {
            return;
        }
        self.nohz.idle_cpus.set_cpu(cpu);
        self.nohz.nr_cpus += 1;
        self.rqs[cpu.idx()].nohz_tick_stopped = true;
        trace!(cpu = cpu.0, nr_idle = self.nohz.nr_cpus, "tick stopped");
    }

    pub(crate) fn nohz_balance_exit_idle(&mut self, cpu: CpuId) {
        if !self.rqs[cpu.idx()].nohz_tick_stopped {
            return;
        }
        if self.nohz.idle_cpus.test_cpu(cpu) {
            self.nohz.idle_cpus.clear_cpu(cpu);
            self.nohz.nr_cpus = self.nohz.nr_cpus.saturating_sub(1);
        }
        self.rqs[cpu.idx()].nohz_tick_stopped = false;
        self.update_cpu_load_nohz(cpu);
    }

    /// Cheapest CPU of `cpus` with power-aware placement, the first one
    /// otherwise.
    fn select_lowest_power_cpu(&self, cpus: &Cpumask) -> Option<CpuId> {
        if !self.cfg.hmp().enable_power_aware {
            return cpus.first();
        }
        let mut lowest = None;
        let mut lowest_power = u64::MAX;
        for i in cpus.iter() {
            let cost = self.power_cost_at_freq(i, 0);
            if cost < lowest_power {
                lowest_power = cost;
                lowest = Some(i);
            }
        }
        lowest
    }

    /// Balance on behalf of every tickless idle CPU that is due, when
    /// `this_cpu` was kicked to do so.
    fn nohz_idle_balance(&mut self, this_cpu: CpuId, idle: CpuIdleType) {
        if idle == CpuIdleType::Idle && self.rqs[this_cpu.idx()].nohz_balance_kick {
            let jiffies = self.jiffies();
            let mut next_balance = jiffies + 60 * HZ;
            let mut update_next = false;
            let mut to_balance = self.nohz.idle_cpus.clone();

            while let Some(balance_cpu) = self.select_lowest_power_cpu(&to_balance) {
                to_balance.clear_cpu(balance_cpu);
                if balance_cpu == this_cpu || !self.rqs[balance_cpu.idx()].is_idle() {
                    continue;
                }
                if self.rqs[this_cpu.idx()].need_resched {
                    break;
                }
                if jiffies >= self.rqs[balance_cpu.idx()].next_balance {
                    self.update_rq_clock(balance_cpu);
                    self.update_idle_cpu_load(balance_cpu);
                    self.rebalance_domains(balance_cpu, CpuIdleType::Idle);
                }
                let rq_next = self.rqs[balance_cpu.idx()].next_balance;
                if next_balance > rq_next {
                    next_balance = rq_next;
                    update_next = true;
                }
            }
            if update_next {
                self.nohz.next_balance = next_balance;
            }
        }
        self.rqs[this_cpu.idx()].nohz_balance_kick = false;
    }

    /// HMP flavour: a CPU with enough non-small work, or more than it is
    /// allowed while mostly idle, wants help. Returns whether the helper
    /// should be restricted to CPUs no bigger than this one.
    fn nohz_kick_needed_hmp(&self, cpu: CpuId) -> Option<bool> {
        let rq = &self.rqs[cpu.idx()];
        let cluster = self.topo.cluster_of(cpu);
        let mif = rq.mostly_idle_freq;
        if mif > 0 && cluster.cur_freq < mif && cluster.max_freq > mif {
            return None;
        }

        let busy = rq.nr_running >= 2
            && (rq.nr_running - rq.hmp_stats.nr_small_tasks.min(rq.nr_running) >= 2
                || rq.nr_running > rq.mostly_idle_nr_run
                || self.cpu_load(cpu) > rq.mostly_idle_load);
        if !busy {
            return None;
        }
        if self.topo.capacity(cpu) == self.topo.max_capacity {
            return Some(false);
        }
        let sd = self.topo.domains[cpu.idx()].first()?;
        let restrict = sd.span.iter().any(|i| self.cpu_load(i) < self.cfg.spill_load);
        Some(restrict)
    }

    /// Whether the busy `cpu` should kick an idle CPU into balancing.
    fn nohz_kick_needed(&mut self, cpu: CpuId) -> Option<bool> {
        if self.rqs[cpu.idx()].idle_balance {
            return None;
        }
        self.nohz_balance_exit_idle(cpu);
        if self.nohz.nr_cpus == 0 || self.jiffies() < self.nohz.next_balance {
            return None;
        }

        if self.cfg.hmp_enabled() {
            return self.nohz_kick_needed_hmp(cpu);
        }

        let rq = &self.rqs[cpu.idx()];
        if rq.nr_running >= 2 {
            return Some(false);
        }

        // More than one busy CPU sharing this cache.
        let domains = &self.topo.domains[cpu.idx()];
        if let Some(llc) = domains.iter().rposition(|sd| sd.has(SD_SHARE_PKG_RESOURCES)) {
            if llc + 1 < domains.len() {
                let nr_busy = domains[llc]
                    .span
                    .iter()
                    .filter(|&c| self.active_mask.test_cpu(c) && !self.nohz.idle_cpus.test_cpu(c))
                    .count();
                if nr_busy > 1 {
                    return Some(false);
                }
            }
        }

        let sd = domains.first()?;
        if self.cfs_rqs[rq.cfs.idx()].h_nr_running >= 1 && self.check_cpu_capacity(cpu, sd) {
            return Some(false);
        }
        None
    }

    fn nohz_balancer_kick(&mut self, cpu: CpuId, restrict: bool) {
        self.nohz.next_balance += 1;
        let ilb = if self.cfg.hmp_enabled() {
            self.find_new_hmp_ilb(cpu, restrict)
        } else {
            self.nohz
                .idle_cpus
                .first()
                .filter(|&c| self.rqs[c.idx()].is_idle())
        };
        let Some(ilb) = ilb else {
            return;
        };
        let rq = &mut self.rqs[ilb.idx()];
        if rq.nohz_balance_kick {
            return;
        }
        rq.nohz_balance_kick = true;
        trace!(from = cpu.0, ilb = ilb.0, restrict, "nohz kick");
    }

    /// Balance softirq: idle balancing for others first when kicked, then
    /// this CPU's own domains.
    pub(crate) fn run_rebalance_domains(&mut self, cpu: CpuId) {
        let idle = if self.rqs[cpu.idx()].idle_balance {
            CpuIdleType::Idle
        } else {
            CpuIdleType::NotIdle
        };
        self.nohz_idle_balance(cpu, idle);
        self.rebalance_domains(cpu, idle);
    }

    /// Tick hook: run the periodic balance when due and kick an idle CPU
    /// when this one looks overloaded.
    pub(crate) fn trigger_load_balance(&mut self, cpu: CpuId) {
        if self.topo.domains[cpu.idx()].is_empty() {
            return;
        }
        if self.jiffies() >= self.rqs[cpu.idx()].next_balance {
            self.run_rebalance_domains(cpu);
        }
        if let Some(restrict) = self.nohz_kick_needed(cpu) {
            self.nohz_balancer_kick(cpu, restrict);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tunables;
    use crate::task::{Phase, TaskBehavior, TaskDef};
    use crate::topology::TopologySpec;

    fn on_cpu0(pid: i32) -> TaskDef {
        let mut def = TaskDef::new(
            &format!("t{pid}"),
            Pid(pid),
            TaskBehavior {
                phases: vec![Phase::Run(u64::MAX / 4)],
                repeat: false,
            },
        );
        def.cpus_allowed = Some("0".to_string());
        def
    }

    fn pinned_pair(s: &mut FairSched) -> (Pid, Pid) {
        let a = s.fork_task(&on_cpu0(1)).unwrap();
        let b = s.fork_task(&on_cpu0(2)).unwrap();
        (a, b)
    }

    #[test]
    fn test_msecs_to_jiffies_rounds_up() {
        assert_eq!(HZ, 250);
        assert_eq!(msecs_to_jiffies(0), 0);
        assert_eq!(msecs_to_jiffies(1), 1);
        assert_eq!(msecs_to_jiffies(4), 1);
        assert_eq!(msecs_to_jiffies(5), 2);
        assert_eq!(msecs_to_jiffies(100), 25);
    }

    #[test]
    fn test_group_type_order() {
        assert!(GroupType::Overloaded > GroupType::Imbalanced);
        assert!(GroupType::Imbalanced > GroupType::Ea);
        assert!(GroupType::Ea > GroupType::Other);
    }

    #[test]
    fn test_newidle_pulls_one_task() {
        let mut s = FairSched::new(&TopologySpec::smp(2), Tunables::default()).unwrap();
        let (a, b) = pinned_pair(&mut s);
        s.set_cpus_allowed(a, "0-1").unwrap();
        s.set_cpus_allowed(b, "0-1").unwrap();
        assert_eq!(s.nr_running(CpuId(0)), 2);

        let mut cont = true;
        let moved = s.load_balance(CpuId(1), 0, CpuIdleType::NewlyIdle, &mut cont);
        assert_eq!(moved, 1);
        assert_eq!(s.nr_running(CpuId(0)), 1);
        assert_eq!(s.nr_running(CpuId(1)), 1);
        assert_eq!(s.topo.domains[1][0].nr_balance_failed, 0);
    }

    #[test]
    fn test_all_pinned_backs_off() {
        let mut s = FairSched::new(&TopologySpec::smp(2), Tunables::default()).unwrap();
        pinned_pair(&mut s);
        let before = s.topo.domains[1][0].balance_interval;

        let mut cont = true;
        let moved = s.load_balance(CpuId(1), 0, CpuIdleType::Idle, &mut cont);
        assert_eq!(moved, 0);
        assert_eq!(s.nr_running(CpuId(0)), 2);
        assert_eq!(s.topo.domains[1][0].balance_interval, before * 2);
        assert_eq!(s.topo.domains[1][0].nr_balance_failed, 0);
    }

    #[test]
    fn test_imbalance_grows_with_busiest_load() {
        let s = FairSched::new(&TopologySpec::smp(2), Tunables::default()).unwrap();
        let mut last = 0;
        for busy in [2048u64, 3072, 4096, 8192] {
            let mut env = LbEnv::new(CpuId(1), 0, CpuIdleType::NotIdle, Cpumask::full(2));
            let mut sds = SdLbStats {
                busiest: Some(1),
                local: Some(0),
                total_load: busy,
                total_capacity: 2048,
                avg_load: busy * SCHED_CAPACITY_SCALE / 2048,
                busiest_stat: SgLbStats {
                    avg_load: busy,
                    group_load: busy,
                    sum_weighted_load: busy,
                    load_per_task: 1024,
                    group_capacity: 1024,
                    sum_nr_running: (busy / 1024) as u32,
                    group_weight: 1,
                    group_type: GroupType::Overloaded,
                    ..Default::default()
                },
                local_stat: SgLbStats {
                    group_capacity: 1024,
                    group_weight: 1,
                    ..Default::default()
                },
            };
            s.calculate_imbalance(&mut env, &mut sds);
            assert!(env.imbalance > last, "imbalance {} not above {}", env.imbalance, last);
            assert_eq!(env.imbalance as u64, busy / 2);
            last = env.imbalance;
        }
    }

    #[test]
    fn test_small_imbalance_moves_one_task() {
        let s = FairSched::new(&TopologySpec::smp(2), Tunables::default()).unwrap();
        let mut env = LbEnv::new(CpuId(1), 0, CpuIdleType::NotIdle, Cpumask::full(2));
        // One task each side plus a light one on the busy side: averaging
        // would move less than a task.
        let mut sds = SdLbStats {
            busiest: Some(1),
            local: Some(0),
            total_load: 3072,
            total_capacity: 2048,
            avg_load: 1536,
            busiest_stat: SgLbStats {
                avg_load: 2048,
                group_load: 2048,
                sum_weighted_load: 2048,
                load_per_task: 1024,
                group_capacity: 1024,
                sum_nr_running: 2,
                group_weight: 1,
                ..Default::default()
            },
            local_stat: SgLbStats {
                avg_load: 1024,
                group_load: 1024,
                sum_weighted_load: 1024,
                load_per_task: 1024,
                group_capacity: 1024,
                sum_nr_running: 1,
                group_weight: 1,
                ..Default::default()
            },
        };
        s.calculate_imbalance(&mut env, &mut sds);
        assert_eq!(env.imbalance, 1024);
    }

    #[test]
    fn test_nohz_idle_tracking() {
        let mut s = FairSched::new(&TopologySpec::smp(2), Tunables::default()).unwrap();
        s.nohz_balance_enter_idle(CpuId(1));
        s.nohz_balance_enter_idle(CpuId(1));
        assert_eq!(s.nohz.nr_cpus, 1);
        assert!(s.nohz.idle_cpus.test_cpu(CpuId(1)));
        assert!(s.rqs[1].nohz_tick_stopped);
        s.nohz_balance_exit_idle(CpuId(1));
        assert_eq!(s.nohz.nr_cpus, 0);
        assert!(!s.rqs[1].nohz_tick_stopped);
    }

    #[test]
    fn test_single_cpu_has_no_domains_to_balance() {
        let mut s = FairSched::new(&TopologySpec::smp(1), Tunables::default()).unwrap();
        s.nohz_balance_enter_idle(CpuId(0));
        assert_eq!(s.nohz.nr_cpus, 0);
        s.trigger_load_balance(CpuId(0));
        assert_eq!(s.rqs[0].next_balance, 0);
    }

    #[test]
    fn test_busy_cpu_kicks_idle_balancer() {
        let mut s = FairSched::new(&TopologySpec::smp(2), Tunables::default()).unwrap();
        let (a, b) = pinned_pair(&mut s);
        s.set_cpus_allowed(a, "0-1").unwrap();
        s.set_cpus_allowed(b, "0-1").unwrap();
        s.nohz_balance_enter_idle(CpuId(1));

        // Past the first balance interval.
        s.advance_clock(10 * NSEC_PER_MSEC);
        s.scheduler_tick(CpuId(0));
        assert_eq!(s.nohz_kicked_cpus(), vec![CpuId(1)]);

        s.handle_nohz_kick(CpuId(1));
        assert!(s.nohz_kicked_cpus().is_empty());
        assert_eq!(s.nr_running(CpuId(0)), 1);
        assert_eq!(s.nr_running(CpuId(1)), 1);
    }

    #[test]
    fn test_active_balance_pushes_queued_task() {
        let mut s = FairSched::new(&TopologySpec::smp(2), Tunables::default()).unwrap();
        let (a, _) = pinned_pair(&mut s);
        s.set_cpus_allowed(a, "0-1").unwrap();
        let rq = &mut s.rqs[0];
        rq.active_balance = true;
        rq.push_cpu = CpuId(1);
        s.rqs[1].reserved = true;

        s.active_load_balance_cpu_stop(CpuId(0));
        assert!(!s.rqs[0].active_balance);
        assert!(!s.rqs[1].reserved);
        assert_eq!(s.task(a).unwrap().cpu, CpuId(1));
        assert_eq!(s.nr_running(CpuId(1)), 1);
    }
}
