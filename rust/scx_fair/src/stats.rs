// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Scheduling counters and read-only snapshots of scheduler state.

use metrics::counter;
use metrics::Counter;
use ordered_float::OrderedFloat;
use serde::Serialize;
use sorted_vec::SortedVec;

use crate::sched::FairSched;
use crate::types::{CpuId, GroupId, Pid, TimeNs};

pub struct Metrics {
    pub migrations: Counter,
    pub throttles: Counter,
    pub balance_attempts: Counter,
    pub balance_failures: Counter,
    pub active_balances: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            migrations: counter!("migrations_total"),
            throttles: counter!("throttles_total"),
            balance_attempts: counter!("load_balance_total", "result" => "attempt"),
            balance_failures: counter!("load_balance_total", "result" => "failed"),
            active_balances: counter!("active_balance_total"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CpuSnapshot {
    pub cpu: CpuId,
    pub online: bool,
    pub nr_running: u32,
    pub load_avg: u64,
    pub util_avg: u64,
    pub cumulative_runnable_avg: u64,
    pub nr_big_tasks: u32,
    pub nr_small_tasks: u32,
    pub capacity: u64,
    pub mostly_idle: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupSnapshot {
    pub group: GroupId,
    pub name: String,
    pub shares: u64,
    pub quota: Option<TimeNs>,
    pub period: TimeNs,
    pub nr_periods: u64,
    pub nr_throttled: u64,
    pub throttled_time: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub pid: Pid,
    pub name: String,
    pub cpu: CpuId,
    pub nr_migrations: u64,
    pub sum_exec_runtime: u64,
    pub vruntime: u64,
    /// HMP demand in max-capacity units.
    pub demand: u64,
}

impl FairSched {
    pub fn cpu_snapshot(&self, cpu: CpuId) -> CpuSnapshot {
        let rq = &self.rqs[cpu.idx()];
        let avg = &self.cfs_rqs[rq.cfs.idx()].avg;
        CpuSnapshot {
            cpu,
            online: rq.online,
            nr_running: rq.nr_running,
            load_avg: avg.load_avg,
            util_avg: avg.util_avg,
            cumulative_runnable_avg: rq.hmp_stats.cumulative_runnable_avg,
            nr_big_tasks: rq.hmp_stats.nr_big_tasks,
            nr_small_tasks: rq.hmp_stats.nr_small_tasks,
            capacity: rq.cpu_capacity,
            mostly_idle: self.mostly_idle_cpu(cpu),
        }
    }

    pub fn cpu_snapshots(&self) -> Vec<CpuSnapshot> {
        (0..self.nr_cpus())
            .map(|cpu| self.cpu_snapshot(CpuId(cpu as u32)))
            .collect()
    }

    pub fn group_snapshots(&self) -> Vec<GroupSnapshot> {
        self.groups
            .iter()
            .map(|tg| {
                let b = &tg.bandwidth;
                GroupSnapshot {
                    group: tg.id,
                    name: tg.name.clone(),
                    shares: tg.shares,
                    quota: b.quota,
                    period: b.period,
                    nr_periods: b.nr_periods,
                    nr_throttled: b.nr_throttled,
                    throttled_time: b.throttled_time,
                }
            })
            .collect()
    }

    pub fn task_snapshot(&self, pid: Pid) -> Option<TaskSnapshot> {
        let task = self.tasks.get(&pid)?;
        let se = &self.entities[task.se.idx()];
        Some(TaskSnapshot {
            pid,
            name: task.name.clone(),
            cpu: task.cpu,
            nr_migrations: se.nr_migrations,
            sum_exec_runtime: se.sum_exec_runtime,
            vruntime: se.vruntime.0,
            demand: self.task_demand(pid),
        })
    }

    pub fn task_snapshots(&self) -> Vec<TaskSnapshot> {
        self.tasks
            .keys()
            .filter_map(|&pid| self.task_snapshot(pid))
            .collect()
    }

    /// Online CPUs ordered by load per unit of capacity, busiest first.
    pub fn busiest_cpus(&self) -> Vec<(CpuId, f64)> {
        let mut ranked = SortedVec::new();
        for cpu in self.active_mask.iter() {
            let capacity = self.capacity_of(cpu).max(1) as f64;
            let load = self.weighted_cpuload(cpu) as f64 / capacity;
            ranked.insert((OrderedFloat(load), std::cmp::Reverse(cpu)));
        }
        ranked
            .iter()
            .rev()
            .map(|(load, cpu)| (cpu.0, load.0))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tunables;
    use crate::task::{Phase, TaskBehavior, TaskDef};
    use crate::topology::TopologySpec;

    #[test]
    fn test_busiest_cpus_ranked() {
        let mut s = FairSched::new(&TopologySpec::smp(3), Tunables::default()).unwrap();
        for (pid, cpu) in [(1, "2"), (2, "2"), (3, "0")] {
            let mut def = TaskDef::new(
                &format!("t{pid}"),
                Pid(pid),
                TaskBehavior {
                    phases: vec![Phase::Run(u64::MAX / 4)],
                    repeat: false,
                },
            );
            def.cpus_allowed = Some(cpu.to_string());
            s.fork_task(&def).unwrap();
        }

        let ranked: Vec<CpuId> = s.busiest_cpus().into_iter().map(|(cpu, _)| cpu).collect();
        assert_eq!(ranked, vec![CpuId(2), CpuId(0), CpuId(1)]);
    }

    #[test]
    fn test_snapshots_cover_everything() {
        let mut s = FairSched::new(&TopologySpec::smp(2), Tunables::default()).unwrap();
        let g = s.create_group("batch", GroupId::ROOT).unwrap();
        let def = TaskDef::new(
            "t1",
            Pid(1),
            TaskBehavior {
                phases: vec![Phase::Run(1_000_000)],
                repeat: false,
            },
        );
        s.fork_task(&def).unwrap();

        assert_eq!(s.cpu_snapshots().len(), 2);
        let groups = s.group_snapshots();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[1].group, g);
        assert_eq!(groups[1].quota, None);

        let t = s.task_snapshot(Pid(1)).unwrap();
        assert_eq!(t.name, "t1");
        assert_eq!(s.cpu_snapshot(t.cpu).nr_running, 1);
        assert!(s.task_snapshot(Pid(2)).is_none());
    }
}
