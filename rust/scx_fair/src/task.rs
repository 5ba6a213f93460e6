// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Task model.
//!
//! [`Task`] is the scheduler's view of a task. [`TaskDef`] and [`SimTask`]
//! describe the scripted behaviour the simulator plays back on top of it.

use serde::{Deserialize, Serialize};

use crate::cfs_rq::HmpContrib;
use crate::cpumask::Cpumask;
use crate::types::{CpuId, EntityId, GroupId, NodeId, Pid, Policy, RelatedGroupId, TimeNs};

/// Scheduler-side lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Runnable or running.
    Running,
    /// Blocked.
    Sleeping,
    /// Being woken: its vruntime is relative until it is enqueued.
    Waking,
    /// Detached from any CPU while moving between queues.
    Migrating,
    Dead,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub pid: Pid,
    pub name: String,
    pub nice: i32,
    pub policy: Policy,
    pub se: EntityId,
    pub group: GroupId,
    pub cpu: CpuId,
    pub cpus_allowed: Cpumask,
    pub state: TaskState,
    /// Queued on a run-queue (running tasks are queued too).
    pub on_rq: bool,
    /// Prefer idle CPUs when waking this task.
    pub wake_up_idle: bool,
    pub related_group: Option<RelatedGroupId>,
    /// Memory faults per node, indexed by node.
    pub numa_faults: Vec<u64>,
    pub numa_preferred_nid: Option<NodeId>,
    pub numa_group: Option<u32>,
    /// What this task currently adds to HMP stats, if it is counted.
    pub hmp_contrib: Option<HmpContrib>,
    /// Starting demand, percent of a fully busy max-capacity CPU.
    pub init_load_pct: Option<u32>,
    pub wakee_flips: u32,
    pub wakee_flip_decay_ts: TimeNs,
    pub last_wakee: Option<Pid>,
}

impl Task {
    pub fn nr_cpus_allowed(&self) -> usize {
        self.cpus_allowed.weight()
    }

    /// Memory faults recorded on `nid`.
    pub fn faults(&self, nid: NodeId) -> u64 {
        self.numa_faults.get(nid.0 as usize).copied().unwrap_or(0)
    }
}

/// A phase in a task's scripted behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Run (consume CPU) for the given number of nanoseconds.
    Run(TimeNs),
    /// Sleep (block) for the given number of nanoseconds.
    Sleep(TimeNs),
    /// Wake another task by PID (instantaneous).
    Wake(Pid),
}

/// The scripted behavior for a task: a sequence of phases, optionally repeating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskBehavior {
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub repeat: bool,
}

/// Definition of a task for scenario creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDef {
    pub name: String,
    pub pid: Pid,
    #[serde(default)]
    pub nice: i32,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default = "root_group")]
    pub group: GroupId,
    /// Cpulist such as "0-3". All CPUs when unset.
    #[serde(default)]
    pub cpus_allowed: Option<String>,
    pub behavior: TaskBehavior,
    /// When the task first becomes runnable (simulated ns).
    #[serde(default)]
    pub start_time_ns: TimeNs,
    /// CPU the task is forked on.
    #[serde(default)]
    pub start_cpu: Option<CpuId>,
    #[serde(default)]
    pub wake_up_idle: bool,
    #[serde(default)]
    pub related_group: Option<RelatedGroupId>,
    #[serde(default)]
    pub numa_faults: Vec<u64>,
    /// Tasks with the same id share memory.
    #[serde(default)]
    pub numa_group: Option<u32>,
    #[serde(default)]
    pub init_load_pct: Option<u32>,
}

fn root_group() -> GroupId {
    GroupId::ROOT
}

impl TaskDef {
    /// A nice-0 task in the root group.
    pub fn new(name: &str, pid: Pid, behavior: TaskBehavior) -> Self {
        Self {
            name: name.to_string(),
            pid,
            nice: 0,
            policy: Policy::Normal,
            group: GroupId::ROOT,
            cpus_allowed: None,
            behavior,
            start_time_ns: 0,
            start_cpu: None,
            wake_up_idle: false,
            related_group: None,
            numa_faults: Vec::new(),
            numa_group: None,
            init_load_pct: None,
        }
    }
}

/// Where a simulated task is in its script.
#[derive(Debug, Clone)]
pub struct SimTask {
    pub pid: Pid,
    pub behavior: TaskBehavior,
    /// Current phase index.
    pub phase_idx: usize,
    /// Remaining nanoseconds in the current Run phase.
    pub run_remaining_ns: TimeNs,
    pub exited: bool,
}

impl SimTask {
    pub fn new(def: &TaskDef) -> Self {
        let run_remaining_ns = match def.behavior.phases.first() {
            Some(Phase::Run(ns)) => *ns,
            _ => 0,
        };
        SimTask {
            pid: def.pid,
            behavior: def.behavior.clone(),
            phase_idx: 0,
            run_remaining_ns,
            exited: false,
        }
    }

    /// Get the current phase, or None if the task has completed all phases.
    pub fn current_phase(&self) -> Option<&Phase> {
        self.behavior.phases.get(self.phase_idx)
    }

    /// Advance to the next phase. Returns true if there is a next phase.
    pub fn advance_phase(&mut self) -> bool {
        self.phase_idx += 1;
        if self.phase_idx >= self.behavior.phases.len() {
            if self.behavior.repeat && !self.behavior.phases.is_empty() {
                self.phase_idx = 0;
            } else {
                return false;
            }
        }
        if let Some(Phase::Run(ns)) = self.current_phase() {
            self.run_remaining_ns = *ns;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_phase_repeat() {
        let def = TaskDef::new(
            "t",
            Pid(1),
            TaskBehavior {
                phases: vec![Phase::Run(10), Phase::Sleep(5)],
                repeat: true,
            },
        );
        let mut t = SimTask::new(&def);
        assert_eq!(t.run_remaining_ns, 10);
        t.run_remaining_ns = 0;
        assert!(t.advance_phase());
        assert_eq!(t.current_phase(), Some(&Phase::Sleep(5)));
        assert!(t.advance_phase());
        assert_eq!(t.run_remaining_ns, 10);
    }

    #[test]
    fn test_task_def_json_defaults() {
        let def: TaskDef = serde_json::from_str(
            r#"{"name": "w", "pid": 4, "behavior": {"phases": [{"run": 1000}, {"sleep": 50}]}}"#,
        )
        .unwrap();
        assert_eq!(def.group, GroupId::ROOT);
        assert_eq!(def.policy, Policy::Normal);
        assert_eq!(def.behavior.phases[1], Phase::Sleep(50));
        assert!(!def.behavior.repeat);
    }
}
