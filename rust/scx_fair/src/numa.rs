// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! NUMA locality bias.
//!
//! Fault counts per node come from outside (the workload or
//! [`FairSched::record_numa_faults`]). They decide a task's preferred node
//! and, for tasks sharing memory, the set of nodes their group is spread
//! over. The load balancer consults both as a tie-break: moves towards
//! where the memory is are favoured, moves away from it count as cache
//! hot.

use bitvec::prelude::*;
use tracing::debug;

use crate::sched::FairSched;
use crate::topology::SD_NUMA;
use crate::types::{CpuId, NodeId, Pid};

/// A node is active for a group when its faults are above this fraction
/// of the busiest node's.
const ACTIVE_NODE_FRACTION: u64 = 3;

/// How much of a queue the balancer may touch, from least to most
/// disruptive to NUMA placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FbqType {
    /// Some tasks have no node preference.
    Regular,
    /// Some tasks run away from their preferred node.
    Remote,
    All,
}

/// Tasks that share memory and are placed as one.
#[derive(Debug, Clone)]
pub struct NumaGroup {
    pub id: u32,
    pub members: Vec<Pid>,
    /// Faults per node, summed over the members.
    pub faults: Vec<u64>,
    pub active_nodes: BitVec,
}

impl NumaGroup {
    pub fn new(id: u32, nr_nodes: usize) -> Self {
        Self {
            id,
            members: Vec::new(),
            faults: vec![0; nr_nodes],
            active_nodes: bitvec![0; nr_nodes],
        }
    }

    pub fn is_active(&self, nid: NodeId) -> bool {
        self.active_nodes
            .get(nid.0 as usize)
            .map_or(false, |b| *b)
    }

    fn update_active_nodes(&mut self) {
        let max = self.faults.iter().copied().max().unwrap_or(0);
        for (nid, &f) in self.faults.iter().enumerate() {
            self.active_nodes.set(nid, max > 0 && f * ACTIVE_NODE_FRACTION > max);
        }
    }
}

pub(crate) fn fbq_classify_group(sum_nr_running: u32, nr_numa_running: u32, nr_preferred_running: u32) -> FbqType {
    if sum_nr_running > nr_numa_running {
        FbqType::Regular
    } else if sum_nr_running > nr_preferred_running {
        FbqType::Remote
    } else {
        FbqType::All
    }
}

impl FairSched {
    pub(crate) fn account_numa_enqueue(&mut self, cpu: CpuId, pid: Pid) {
        let (numa, preferred) = self.numa_accounting(cpu, pid);
        let rq = &mut self.rqs[cpu.idx()];
        rq.nr_numa_running += numa;
        rq.nr_preferred_running += preferred;
    }

    pub(crate) fn account_numa_dequeue(&mut self, cpu: CpuId, pid: Pid) {
        let (numa, preferred) = self.numa_accounting(cpu, pid);
        let rq = &mut self.rqs[cpu.idx()];
        rq.nr_numa_running = rq.nr_numa_running.saturating_sub(numa);
        rq.nr_preferred_running = rq.nr_preferred_running.saturating_sub(preferred);
    }

    fn numa_accounting(&self, cpu: CpuId, pid: Pid) -> (u32, u32) {
        let Some(nid) = self.tasks[&pid].numa_preferred_nid else {
            return (0, 0);
        };
        (1, (nid == self.topo.node_of(cpu)) as u32)
    }

    fn group_faults(&self, pid: Pid, nid: NodeId) -> u64 {
        let task = &self.tasks[&pid];
        match task.numa_group.and_then(|g| self.numa_groups.get(&g)) {
            Some(group) => group.faults.get(nid.0 as usize).copied().unwrap_or(0),
            None => task.faults(nid),
        }
    }

    /// Pick the node with the most faults, counting the whole group's
    /// faults when the task is in one.
    pub(crate) fn task_numa_placement(&mut self, pid: Pid) {
        let nr_nodes = self.topo.nr_nodes;
        let mut best = None;
        let mut max_faults = 0;
        for nid in 0..nr_nodes {
            let faults = self.group_faults(pid, NodeId(nid as u32));
            if faults > max_faults {
                max_faults = faults;
                best = Some(NodeId(nid as u32));
            }
        }

        let task = &self.tasks[&pid];
        if task.numa_preferred_nid == best {
            return;
        }
        let queued_on = task.on_rq.then_some(task.cpu);
        if let Some(cpu) = queued_on {
            self.account_numa_dequeue(cpu, pid);
        }
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.numa_preferred_nid = best;
        }
        if let Some(cpu) = queued_on {
            self.account_numa_enqueue(cpu, pid);
        }
        debug!(pid = pid.0, nid = ?best.map(|n| n.0), "numa preferred node");
    }

    fn refresh_numa_group(&mut self, id: u32) {
        let Some(group) = self.numa_groups.get(&id) else {
            return;
        };
        let mut faults = vec![0; self.topo.nr_nodes];
        for pid in &group.members {
            if let Some(task) = self.tasks.get(pid) {
                for (nid, f) in faults.iter_mut().enumerate() {
                    *f += task.faults(NodeId(nid as u32));
                }
            }
        }
        if let Some(group) = self.numa_groups.get_mut(&id) {
            group.faults = faults;
            group.update_active_nodes();
        }
    }

    /// Put `pid` in NUMA group `id`, creating the group on first use.
    pub fn join_numa_group(&mut self, pid: Pid, id: u32) {
        if !self.tasks.contains_key(&pid) {
            return;
        }
        self.leave_numa_group(pid);
        let nr_nodes = self.topo.nr_nodes;
        let group = self
            .numa_groups
            .entry(id)
            .or_insert_with(|| NumaGroup::new(id, nr_nodes));
        group.members.push(pid);
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.numa_group = Some(id);
        }
        self.refresh_numa_group(id);
        self.task_numa_placement(pid);
    }

    pub(crate) fn leave_numa_group(&mut self, pid: Pid) {
        let Some(id) = self.tasks.get_mut(&pid).and_then(|t| t.numa_group.take()) else {
            return;
        };
        let empty = match self.numa_groups.get_mut(&id) {
            Some(group) => {
                group.members.retain(|&p| p != pid);
                group.members.is_empty()
            }
            None => false,
        };
        if empty {
            self.numa_groups.remove(&id);
        } else {
            self.refresh_numa_group(id);
        }
    }

    /// Replace the per-node fault counts of `pid` and re-place it.
    pub fn record_numa_faults(&mut self, pid: Pid, mut faults: Vec<u64>) {
        let Some(task) = self.tasks.get_mut(&pid) else {
            return;
        };
        faults.resize(self.topo.nr_nodes, 0);
        task.numa_faults = faults;
        if let Some(id) = task.numa_group {
            self.refresh_numa_group(id);
        }
        self.task_numa_placement(pid);
    }

    fn numa_nodes(&self, pid: Pid, src_cpu: CpuId, dst_cpu: CpuId, sd_flags: u32) -> Option<(NodeId, NodeId)> {
        let task = &self.tasks[&pid];
        if sd_flags & SD_NUMA == 0 || task.numa_faults.iter().all(|&f| f == 0) {
            return None;
        }
        let src = self.topo.node_of(src_cpu);
        let dst = self.topo.node_of(dst_cpu);
        (src != dst).then_some((src, dst))
    }

    /// Moving `pid` from `src_cpu` to `dst_cpu` brings it closer to its
    /// memory.
    pub(crate) fn migrate_improves_locality(&self, pid: Pid, src_cpu: CpuId, dst_cpu: CpuId, sd_flags: u32) -> bool {
        if !self.cfg.features().numa_favour_higher {
            return false;
        }
        let Some((src, dst)) = self.numa_nodes(pid, src_cpu, dst_cpu, sd_flags) else {
            return false;
        };
        let band = self.cfg.tunables.hysteresis.numa_improve_16ths;
        let improves = |d: u64, s: u64| d * 16 > s * (16 + band);

        let task = &self.tasks[&pid];
        if let Some(group) = task.numa_group.and_then(|g| self.numa_groups.get(&g)) {
            if group.is_active(src) {
                return false;
            }
            if group.is_active(dst) {
                return true;
            }
            return improves(self.group_faults(pid, dst), self.group_faults(pid, src));
        }
        if task.numa_preferred_nid == Some(dst) {
            return true;
        }
        improves(task.faults(dst), task.faults(src))
    }

    /// Moving `pid` from `src_cpu` to `dst_cpu` takes it away from its
    /// memory.
    pub(crate) fn migrate_degrades_locality(&self, pid: Pid, src_cpu: CpuId, dst_cpu: CpuId, sd_flags: u32) -> bool {
        let features = self.cfg.features();
        if !features.numa || !features.numa_resist_lower {
            return false;
        }
        let Some((src, dst)) = self.numa_nodes(pid, src_cpu, dst_cpu, sd_flags) else {
            return false;
        };
        let band = self.cfg.tunables.hysteresis.numa_degrade_16ths.min(16);
        let degrades = |d: u64, s: u64| d * 16 < s * (16 - band);

        let task = &self.tasks[&pid];
        if let Some(group) = task.numa_group.and_then(|g| self.numa_groups.get(&g)) {
            if group.is_active(dst) {
                return false;
            }
            if group.is_active(src) {
                return true;
            }
            return degrades(self.group_faults(pid, dst), self.group_faults(pid, src));
        }
        if task.numa_preferred_nid == Some(src) {
            return true;
        }
        degrades(task.faults(dst), task.faults(src))
    }

    pub(crate) fn fbq_classify_rq(&self, cpu: CpuId) -> FbqType {
        if !self.cfg.features().numa {
            return FbqType::Regular;
        }
        let rq = &self.rqs[cpu.idx()];
        fbq_classify_group(rq.nr_running, rq.nr_numa_running, rq.nr_preferred_running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tunables;
    use crate::task::{Phase, TaskBehavior, TaskDef};
    use crate::topology::TopologySpec;

    fn two_nodes() -> TopologySpec {
        TopologySpec::clustered(&[(2, 1024, 1_000_000), (2, 1024, 1_000_000)]).with_node(1, 1)
    }

    fn task_with_faults(pid: i32, faults: Vec<u64>) -> TaskDef {
        let mut def = TaskDef::new(
            &format!("t{pid}"),
            Pid(pid),
            TaskBehavior {
                phases: vec![Phase::Run(10_000_000)],
                repeat: true,
            },
        );
        def.numa_faults = faults;
        def
    }

    #[test]
    fn test_preferred_node_follows_faults() {
        let mut s = FairSched::new(&two_nodes(), Tunables::default()).unwrap();
        s.fork_task(&task_with_faults(1, vec![10, 90])).unwrap();
        assert_eq!(s.tasks[&Pid(1)].numa_preferred_nid, Some(NodeId(1)));

        s.record_numa_faults(Pid(1), vec![80, 5]);
        assert_eq!(s.tasks[&Pid(1)].numa_preferred_nid, Some(NodeId(0)));

        let total: u32 = s.rqs.iter().map(|rq| rq.nr_numa_running).sum();
        assert_eq!(total, 1);
    }

    #[test]
    fn test_locality_needs_margin() {
        let mut s = FairSched::new(&two_nodes(), Tunables::default()).unwrap();
        s.fork_task(&task_with_faults(1, vec![100, 110])).unwrap();
        // Preferred node 1, so a move there always improves.
        assert!(s.migrate_improves_locality(Pid(1), CpuId(0), CpuId(2), SD_NUMA));
        s.tasks.get_mut(&Pid(1)).unwrap().numa_preferred_nid = None;
        // 110 is within 6/16 of 100.
        assert!(!s.migrate_improves_locality(Pid(1), CpuId(0), CpuId(2), SD_NUMA));
        // Not a NUMA domain.
        assert!(!s.migrate_improves_locality(Pid(1), CpuId(0), CpuId(2), 0));
    }

    #[test]
    fn test_group_active_nodes() {
        let mut s = FairSched::new(&two_nodes(), Tunables::default()).unwrap();
        s.fork_task(&task_with_faults(1, vec![100, 0])).unwrap();
        s.fork_task(&task_with_faults(2, vec![0, 10])).unwrap();
        s.join_numa_group(Pid(1), 7);
        s.join_numa_group(Pid(2), 7);

        let group = &s.numa_groups[&7];
        assert_eq!(group.faults, vec![100, 10]);
        assert!(group.is_active(NodeId(0)));
        assert!(!group.is_active(NodeId(1)));
        // Both members now prefer the group's node.
        assert_eq!(s.tasks[&Pid(2)].numa_preferred_nid, Some(NodeId(0)));

        s.leave_numa_group(Pid(1));
        s.leave_numa_group(Pid(2));
        assert!(s.numa_groups.is_empty());
    }

    #[test]
    fn test_fbq_classification() {
        assert_eq!(fbq_classify_group(3, 2, 2), FbqType::Regular);
        assert_eq!(fbq_classify_group(3, 3, 1), FbqType::Remote);
        assert_eq!(fbq_classify_group(3, 3, 3), FbqType::All);
    }
}
