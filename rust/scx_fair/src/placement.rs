// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! CPU selection for waking and newly forked tasks.
//!
//! The policy is picked from the configuration: [`HmpPlacement`] when HMP
//! is enabled, [`FlatPlacement`] otherwise. Both only read scheduler
//! state; the caller validates the returned CPU against the task's
//! affinity and falls back if needed.

use crate::config::Config;
use crate::entity::WF_SYNC;
use crate::group::MIN_SHARES;
use crate::sched::FairSched;
use crate::pelt::SCHED_CAPACITY_SCALE;
use crate::topology::{SchedGroup, SD_BALANCE_WAKE, SD_LOAD_BALANCE, SD_SHARE_PKG_RESOURCES, SD_WAKE_AFFINE};
use crate::types::{CpuId, GroupId, Pid};

pub trait PlacementPolicy: Send {
    fn name(&self) -> &'static str;

    /// Select a CPU for `pid`, last run on `prev_cpu`, on behalf of
    /// `this_cpu`. `sd_flag` says whether this is a wakeup or a fork.
    fn select_task_rq(
        &self,
        s: &FairSched,
        pid: Pid,
        prev_cpu: CpuId,
        sd_flag: u32,
        wake_flags: u32,
        this_cpu: CpuId,
    ) -> CpuId;
}

pub fn placement_for(cfg: &Config) -> Box<dyn PlacementPolicy> {
    if cfg.hmp_enabled() {
        Box::new(HmpPlacement)
    } else {
        Box::new(FlatPlacement)
    }
}

/// Capacity-blind placement: wake next to the waker when loads allow it,
/// otherwise on an idle cache sibling, and spread forks to the idlest
/// group.
#[derive(Debug, Default)]
pub struct FlatPlacement;

/// Demand-driven placement across clusters of different capacity.
#[derive(Debug, Default)]
pub struct HmpPlacement;

impl PlacementPolicy for HmpPlacement {
    fn name(&self) -> &'static str {
        "hmp"
    }

    fn select_task_rq(
        &self,
        s: &FairSched,
        pid: Pid,
        _prev_cpu: CpuId,
        _sd_flag: u32,
        wake_flags: u32,
        this_cpu: CpuId,
    ) -> CpuId {
        s.select_best_cpu(pid, None, wake_flags & WF_SYNC != 0, this_cpu)
    }
}

impl PlacementPolicy for FlatPlacement {
    fn name(&self) -> &'static str {
        "flat"
    }

    fn select_task_rq(
        &self,
        s: &FairSched,
        pid: Pid,
        prev_cpu: CpuId,
        sd_flag: u32,
        wake_flags: u32,
        this_cpu: CpuId,
    ) -> CpuId {
        let sync = wake_flags & WF_SYNC != 0;
        let task = &s.tasks[&pid];
        let mut cpu = this_cpu;
        let mut new_cpu = prev_cpu;

        let want_affine = sd_flag & SD_BALANCE_WAKE != 0
            && !s.wake_wide(pid, this_cpu)
            && task.cpus_allowed.test_cpu(this_cpu);

        let domains = &s.topo.domains[cpu.idx()];
        let mut affine_sd = None;
        let mut sd = None;
        for (level, tmp) in domains.iter().enumerate() {
            if !tmp.has(SD_LOAD_BALANCE) {
                break;
            }
            if want_affine && tmp.has(SD_WAKE_AFFINE) && tmp.span.test_cpu(prev_cpu) {
                affine_sd = Some(level);
                break;
            }
            if tmp.has(sd_flag) {
                sd = Some(level);
            } else if !want_affine {
                break;
            }
        }

        if let Some(level) = affine_sd {
            sd = None;
            if cpu != prev_cpu && s.wake_affine(level, pid, this_cpu, sync) {
                new_cpu = cpu;
            }
        }

        let Some(mut level) = sd else {
            if sd_flag & SD_BALANCE_WAKE != 0 {
                new_cpu = s.select_idle_sibling(pid, new_cpu, this_cpu);
            }
            return new_cpu;
        };

        // Walk down from the widest domain with the flag, re-rooting on the
        // chosen CPU after every step.
        loop {
            let domain = &s.topo.domains[cpu.idx()][level];
            let next = if !domain.has(sd_flag) {
                None
            } else {
                s.find_idlest_group(cpu, level, pid, sd_flag)
                    .map(|group| s.find_idlest_cpu(group, pid, cpu))
            };

            match next {
                Some(found) if found != cpu => {
                    cpu = found;
                    new_cpu = found;
                    let weight = domain.weight();
                    let lower = s.topo.domains[cpu.idx()]
                        .iter()
                        .enumerate()
                        .take_while(|(_, d)| d.weight() < weight)
                        .filter(|(_, d)| d.has(sd_flag))
                        .map(|(i, _)| i)
                        .last();
                    match lower {
                        Some(l) => level = l,
                        None => break,
                    }
                }
                _ => {
                    if level == 0 {
                        break;
                    }
                    level -= 1;
                }
            }
        }
        new_cpu
    }
}

impl FairSched {
    /// The waker and wakee both flip between many partners, more than fit
    /// in one cache domain.
    pub(crate) fn wake_wide(&self, pid: Pid, this_cpu: CpuId) -> bool {
        let factor = self.topo.llc_size(this_cpu) as u32;
        let waker = self.rqs[this_cpu.idx()]
            .curr
            .and_then(|c| self.tasks.get(&c))
            .map_or(0, |t| t.wakee_flips);
        let wakee = self.tasks[&pid].wakee_flips;
        let (master, slave) = if waker < wakee { (wakee, waker) } else { (waker, wakee) };
        !(slave < factor || master < slave * factor)
    }

    /// Change in the top-level load of `cpu` when `group`'s queue there
    /// gains `wl` and the group as a whole gains `wg`.
    pub(crate) fn effective_load(&self, group: GroupId, cpu: CpuId, wl: i64, wg: i64) -> i64 {
        let tg = &self.groups[group.idx()];
        if tg.is_root() {
            return wl;
        }
        let (mut wl, mut wg) = (wl, wg);
        let mut cursor = tg.se[cpu.idx()];
        while let Some(se) = cursor {
            let e = &self.entities[se.idx()];
            let Some(my_q) = e.my_q else {
                break;
            };
            let cfs_rq = &self.cfs_rqs[my_q.idx()];
            let tg = &self.groups[cfs_rq.group.idx()];
            let mut w = cfs_rq.avg.load_avg as i64;
            let big_w = wg + tg.load() - cfs_rq.tg_load_avg_contrib as i64 + w;
            w += wl;

            wl = if big_w > 0 && w < big_w {
                w * tg.shares as i64 / big_w
            } else {
                tg.shares as i64
            };
            wl = wl.max(MIN_SHARES as i64);
            wl -= e.avg.load_avg as i64;
            wg = 0;
            cursor = e.parent;
        }
        wl
    }

    /// Whether pulling `pid` to the waker's CPU keeps the two CPUs within
    /// the domain's imbalance margin.
    pub(crate) fn wake_affine(&self, level: usize, pid: Pid, this_cpu: CpuId, sync: bool) -> bool {
        let sd = &self.topo.domains[this_cpu.idx()][level];
        let idx = sd.idx.wake;
        let task = &self.tasks[&pid];
        let prev_cpu = task.cpu;
        let mut load = self.source_load(prev_cpu, idx) as i64;
        let mut this_load = self.target_load(this_cpu, idx) as i64;

        if sync {
            if let Some(curr) = self.rqs[this_cpu.idx()].curr.and_then(|c| self.tasks.get(&c)) {
                let weight = self.entities[curr.se.idx()].avg.load_avg as i64;
                this_load += self.effective_load(curr.group, this_cpu, -weight, -weight);
                load += self.effective_load(curr.group, prev_cpu, 0, -weight);
            }
        }

        let weight = self.entities[task.se.idx()].avg.load_avg as i64;
        let mut this_eff_load = 100 * self.capacity_of(prev_cpu) as i64;
        let mut prev_eff_load =
            (100 + (sd.imbalance_pct as i64 - 100) / 2) * self.capacity_of(this_cpu) as i64;
        if this_load > 0 {
            this_eff_load *= this_load + self.effective_load(task.group, this_cpu, weight, weight);
            prev_eff_load *= load + self.effective_load(task.group, prev_cpu, 0, weight);
        }
        this_eff_load <= prev_eff_load
    }

    /// Least loaded group of the domain at `level` over `cpu`, if it is
    /// enough below the local group to be worth moving to.
    pub(crate) fn find_idlest_group(&self, cpu: CpuId, level: usize, pid: Pid, sd_flag: u32) -> Option<&SchedGroup> {
        let sd = &self.topo.domains[cpu.idx()][level];
        let load_idx = if sd_flag & SD_BALANCE_WAKE != 0 {
            sd.idx.wake
        } else {
            sd.idx.forkexec
        };
        let imbalance = 100 + (sd.imbalance_pct - 100) / 2;
        let allowed = &self.tasks[&pid].cpus_allowed;

        let mut idlest = None;
        let mut min_load = u64::MAX;
        let mut this_load = 0;
        for group in &sd.groups {
            if !group.cpus.intersects(allowed) {
                continue;
            }
            let local = group.cpus.test_cpu(cpu);
            let sum: u64 = group
                .cpus
                .iter()
                .map(|i| {
                    if local {
                        self.source_load(i, load_idx)
                    } else {
                        self.target_load(i, load_idx)
                    }
                })
                .sum();
            let capacity = self.topo.sgc[group.sgc].capacity.max(1);
            let avg_load = sum * SCHED_CAPACITY_SCALE / capacity;

            if local {
                this_load = avg_load;
            } else if avg_load < min_load {
                min_load = avg_load;
                idlest = Some(group);
            }
        }

        match idlest {
            Some(g) if 100 * this_load >= imbalance * min_load => Some(g),
            _ => None,
        }
    }

    /// Shallowest idle CPU of `group`, most recently idled on a tie, or the
    /// least loaded busy one.
    pub(crate) fn find_idlest_cpu(&self, group: &SchedGroup, pid: Pid, this_cpu: CpuId) -> CpuId {
        if group.group_weight == 1 {
            if let Some(only) = group.cpus.first() {
                return only;
            }
        }

        let mut min_load = u64::MAX;
        let mut min_exit_latency = u32::MAX;
        let mut latest_idle_timestamp = 0;
        let mut least_loaded_cpu = this_cpu;
        let mut shallowest_idle_cpu = None;

        for i in group.cpus.and(&self.tasks[&pid].cpus_allowed).iter() {
            let rq = &self.rqs[i.idx()];
            if rq.is_idle() {
                if rq.cstate < min_exit_latency {
                    min_exit_latency = rq.cstate;
                    latest_idle_timestamp = rq.idle_stamp;
                    shallowest_idle_cpu = Some(i);
                } else if rq.cstate == min_exit_latency && rq.idle_stamp > latest_idle_timestamp {
                    latest_idle_timestamp = rq.idle_stamp;
                    shallowest_idle_cpu = Some(i);
                }
            } else {
                let load = self.weighted_cpuload(i);
                if load < min_load || (load == min_load && i == this_cpu) {
                    min_load = load;
                    least_loaded_cpu = i;
                }
            }
        }
        shallowest_idle_cpu.unwrap_or(least_loaded_cpu)
    }

    /// An idle CPU sharing cache with `target`, or `target` itself.
    pub(crate) fn select_idle_sibling(&self, pid: Pid, target: CpuId, this_cpu: CpuId) -> CpuId {
        if self.rqs[target.idx()].is_idle() {
            return target;
        }
        let task = &self.tasks[&pid];
        let prev = task.cpu;
        if prev != target && self.topo.cpus_share_cache(prev, target) && self.rqs[prev.idx()].is_idle() {
            return prev;
        }

        let waker_hint = self.rqs[this_cpu.idx()]
            .curr
            .and_then(|c| self.tasks.get(&c))
            .is_some_and(|t| t.wake_up_idle);
        if !waker_hint && !task.wake_up_idle {
            return target;
        }

        let domains = &self.topo.domains[target.idx()];
        let Some(llc) = domains
            .iter()
            .rposition(|sd| sd.has(SD_SHARE_PKG_RESOURCES))
        else {
            return target;
        };
        for sd in domains[..=llc].iter().rev() {
            for sg in &sd.groups {
                if !sg.cpus.intersects(&task.cpus_allowed) {
                    continue;
                }
                if sg.cpus.iter().all(|i| i != target && self.rqs[i.idx()].is_idle()) {
                    if let Some(cpu) = sg.cpus.and(&task.cpus_allowed).first() {
                        return cpu;
                    }
                }
            }
        }
        target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tunables;
    use crate::task::{Phase, TaskBehavior, TaskDef};
    use crate::topology::TopologySpec;

    fn sleeper(pid: i32) -> TaskDef {
        TaskDef::new(
            &format!("t{pid}"),
            Pid(pid),
            TaskBehavior {
                phases: vec![Phase::Run(1_000_000), Phase::Sleep(1_000_000)],
                repeat: true,
            },
        )
    }

    #[test]
    fn test_policy_follows_config() {
        let s = FairSched::new(&TopologySpec::smp(2), Tunables::default()).unwrap();
        assert_eq!(s.placement.name(), "flat");
        let mut t = Tunables::default();
        t.hmp.enable = true;
        let s = FairSched::new(&TopologySpec::smp(2), t).unwrap();
        assert_eq!(s.placement.name(), "hmp");
    }

    #[test]
    fn test_fork_spreads_to_idle_cluster() {
        let spec = TopologySpec::clustered(&[(2, 1024, 1_000_000), (2, 1024, 1_000_000)]);
        let mut s = FairSched::new(&spec, Tunables::default()).unwrap();
        for pid in 1..=4 {
            let mut def = sleeper(pid);
            def.start_cpu = Some(CpuId(0));
            s.fork_task(&def).unwrap();
        }
        let on_first = s.tasks.values().filter(|t| t.cpu.0 < 2).count();
        // Forks balance across both clusters instead of piling onto CPU 0.
        assert!((1..=3).contains(&on_first), "{on_first} tasks on the first cluster");
    }

    #[test]
    fn test_idle_sibling_prefers_idle_target() {
        let s = {
            let mut s = FairSched::new(&TopologySpec::smp(4), Tunables::default()).unwrap();
            s.fork_task(&sleeper(1)).unwrap();
            s
        };
        let target = CpuId(2);
        assert_eq!(s.select_idle_sibling(Pid(1), target, CpuId(0)), target);
    }

    #[test]
    fn test_root_effective_load_is_identity() {
        let mut s = FairSched::new(&TopologySpec::smp(2), Tunables::default()).unwrap();
        s.fork_task(&sleeper(1)).unwrap();
        assert_eq!(s.effective_load(GroupId::ROOT, CpuId(0), 512, 512), 512);
    }

    #[test]
    fn test_wake_wide_needs_both_flipping() {
        let mut s = FairSched::new(&TopologySpec::smp(4), Tunables::default()).unwrap();
        s.fork_task(&sleeper(1)).unwrap();
        assert!(!s.wake_wide(Pid(1), CpuId(0)));
        s.tasks.get_mut(&Pid(1)).unwrap().wakee_flips = 100;
        // Nothing runs on CPU 0, so the waker side never flipped.
        assert!(!s.wake_wide(Pid(1), CpuId(0)));
    }
}
