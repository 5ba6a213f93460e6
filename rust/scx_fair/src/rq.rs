// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-CPU run-queue state.

use std::collections::VecDeque;

use crate::cfs_rq::HmpStats;
use crate::types::{CfsRqId, CpuId, Pid, TimeNs};
use crate::weight::LoadWeight;

pub const CPU_LOAD_IDX_MAX: usize = 5;

#[derive(Debug, Clone)]
pub struct Rq {
    pub cpu: CpuId,
    pub clock: TimeNs,
    pub clock_task: TimeNs,
    /// Fair tasks queued on this CPU, including the running one.
    pub nr_running: u32,
    pub cfs: CfsRqId,
    /// Weight of the top-level entities.
    pub load: LoadWeight,
    pub curr: Option<Pid>,
    pub need_resched: bool,
    /// Decayed load history, index 0 is the instantaneous load.
    pub cpu_load: [u64; CPU_LOAD_IDX_MAX],
    /// Tick at which `cpu_load` was last refreshed.
    pub last_load_update_tick: u64,
    pub hmp_stats: HmpStats,
    pub cpu_capacity: u64,
    pub cpu_capacity_orig: u64,
    pub idle_stamp: TimeNs,
    pub avg_idle: u64,
    pub max_idle_balance_cost: u64,
    /// In jiffies.
    pub next_balance: u64,
    /// Balancing from the tick while idle.
    pub idle_balance: bool,
    pub active_balance: bool,
    pub push_cpu: CpuId,
    pub push_task: Option<Pid>,
    /// Chosen as the target of a pending active migration.
    pub reserved: bool,
    pub online: bool,
    /// Idle state depth, 0 when running or in shallow idle.
    pub cstate: u32,
    /// Cluster-level idle state depth.
    pub dstate: u32,
    /// Share of time spent servicing interrupts.
    pub irqload_pct: u32,
    pub nr_numa_running: u32,
    pub nr_preferred_running: u32,
    /// Fair tasks on this CPU, most recently run first.
    pub cfs_tasks: VecDeque<Pid>,
    /// Mostly-idle thresholds; load in demand units.
    pub mostly_idle_load: u64,
    pub mostly_idle_nr_run: u32,
    pub mostly_idle_freq: u64,
    pub prefer_idle: bool,
    pub static_cpu_pwr_cost: u64,
    pub static_cluster_pwr_cost: u64,
    pub nohz_tick_stopped: bool,
    pub nohz_balance_kick: bool,
}

impl Rq {
    pub fn new(cpu: CpuId, cfs: CfsRqId) -> Self {
        Self {
            cpu,
            clock: 0,
            clock_task: 0,
            nr_running: 0,
            cfs,
            load: LoadWeight::default(),
            curr: None,
            need_resched: false,
            cpu_load: [0; CPU_LOAD_IDX_MAX],
            last_load_update_tick: 0,
            hmp_stats: HmpStats::default(),
            cpu_capacity: 1024,
            cpu_capacity_orig: 1024,
            idle_stamp: 0,
            avg_idle: 0,
            max_idle_balance_cost: 0,
            next_balance: 0,
            idle_balance: false,
            active_balance: false,
            push_cpu: cpu,
            push_task: None,
            reserved: false,
            online: true,
            cstate: 0,
            dstate: 0,
            irqload_pct: 0,
            nr_numa_running: 0,
            nr_preferred_running: 0,
            cfs_tasks: VecDeque::new(),
            mostly_idle_load: 0,
            mostly_idle_nr_run: 0,
            mostly_idle_freq: 0,
            prefer_idle: false,
            static_cpu_pwr_cost: 0,
            static_cluster_pwr_cost: 0,
            nohz_tick_stopped: false,
            nohz_balance_kick: false,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.curr.is_none() && self.nr_running == 0
    }

    /// Move `pid` to the head of `cfs_tasks`.
    pub fn touch_cfs_task(&mut self, pid: Pid) {
        if let Some(pos) = self.cfs_tasks.iter().position(|&p| p == pid) {
            self.cfs_tasks.remove(pos);
        }
        self.cfs_tasks.push_front(pid);
    }

    pub fn remove_cfs_task(&mut self, pid: Pid) {
        if let Some(pos) = self.cfs_tasks.iter().position(|&p| p == pid) {
            self.cfs_tasks.remove(pos);
        }
    }
}

/// Borrow two distinct run-queues mutably. The lower CPU is always split
/// off first.
pub fn double_rq_mut(rqs: &mut [Rq], a: CpuId, b: CpuId) -> (&mut Rq, &mut Rq) {
    debug_assert!(a != b, "double_rq_mut on cpu {} twice", a.0);
    if a.idx() < b.idx() {
        let (lo, hi) = rqs.split_at_mut(b.idx());
        (&mut lo[a.idx()], &mut hi[0])
    } else {
        let (lo, hi) = rqs.split_at_mut(a.idx());
        (&mut hi[0], &mut lo[b.idx()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_rq_mut_order() {
        let mut rqs: Vec<Rq> = (0..4).map(|i| Rq::new(CpuId(i), CfsRqId(i))).collect();
        {
            let (a, b) = double_rq_mut(&mut rqs, CpuId(3), CpuId(1));
            a.nr_running = 3;
            b.nr_running = 1;
        }
        assert_eq!(rqs[3].nr_running, 3);
        assert_eq!(rqs[1].nr_running, 1);
        let (a, b) = double_rq_mut(&mut rqs, CpuId(0), CpuId(2));
        assert_eq!((a.cpu, b.cpu), (CpuId(0), CpuId(2)));
    }

    #[test]
    fn test_cfs_tasks_order() {
        let mut rq = Rq::new(CpuId(0), CfsRqId(0));
        rq.touch_cfs_task(Pid(1));
        rq.touch_cfs_task(Pid(2));
        rq.touch_cfs_task(Pid(1));
        assert_eq!(rq.cfs_tasks, VecDeque::from(vec![Pid(1), Pid(2)]));
        rq.remove_cfs_task(Pid(1));
        assert_eq!(rq.cfs_tasks, VecDeque::from(vec![Pid(2)]));
    }
}
