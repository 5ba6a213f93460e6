// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Scenario definition and builder API.

use serde::{Deserialize, Serialize};

use crate::config::Tunables;
use crate::task::{TaskBehavior, TaskDef};
use crate::topology::TopologySpec;
use crate::types::{CpuId, GroupId, Pid, Policy, TimeNs, NSEC_PER_MSEC, NSEC_PER_USEC};

/// A task group created before the simulation starts. Groups get ids in
/// declaration order, starting at 1 (0 is the root group).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDef {
    pub name: String,
    /// Name of the parent group. The root group when unset.
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub shares: Option<u64>,
    #[serde(default)]
    pub quota_us: Option<u64>,
    #[serde(default = "default_period_us")]
    pub period_us: u64,
    #[serde(default)]
    pub upmigrate_discouraged: bool,
}

fn default_period_us() -> u64 {
    100_000
}

impl GroupDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            parent: None,
            shares: None,
            quota_us: None,
            period_us: default_period_us(),
            upmigrate_discouraged: false,
        }
    }
}

/// Something that happens to the system at a given time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum Action {
    CpuOffline { cpu: CpuId },
    CpuOnline { cpu: CpuId },
    Boost { enable: bool },
    SetShares { group: String, shares: u64 },
    SetQuota {
        group: String,
        quota_us: Option<u64>,
        period_us: u64,
    },
    SetNice { pid: Pid, nice: i32 },
    SetPolicy { pid: Pid, policy: Policy },
    SetAffinity { pid: Pid, cpus: String },
    /// Move a task into another group. `"root"` names the root group.
    MoveTask { pid: Pid, group: String },
    /// Whatever runs on `cpu` yields.
    Yield { cpu: CpuId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedAction {
    pub time_ns: TimeNs,
    #[serde(flatten)]
    pub action: Action,
}

/// A complete simulation scenario: topology, tunables, groups, tasks,
/// timed actions and duration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub topology: TopologySpec,
    #[serde(default)]
    pub tunables: Tunables,
    #[serde(default)]
    pub groups: Vec<GroupDef>,
    pub tasks: Vec<TaskDef>,
    #[serde(default)]
    pub actions: Vec<TimedAction>,
    pub duration_ns: TimeNs,
}

/// Builder for constructing scenarios.
pub struct ScenarioBuilder {
    topology: TopologySpec,
    tunables: Tunables,
    groups: Vec<GroupDef>,
    tasks: Vec<TaskDef>,
    actions: Vec<TimedAction>,
    duration_ns: TimeNs,
    next_pid: Pid,
}

impl Scenario {
    pub fn builder() -> ScenarioBuilder {
        ScenarioBuilder {
            topology: TopologySpec::smp(1),
            tunables: Tunables::default(),
            groups: Vec::new(),
            tasks: Vec::new(),
            actions: Vec::new(),
            duration_ns: 100 * NSEC_PER_MSEC,
            next_pid: Pid(1),
        }
    }

    /// Id the group named `name` will get, if declared.
    pub fn group_id(&self, name: &str) -> Option<GroupId> {
        self.groups
            .iter()
            .position(|g| g.name == name)
            .map(|i| GroupId(i as u32 + 1))
    }
}

impl ScenarioBuilder {
    /// `n` identical CPUs.
    pub fn cpus(mut self, n: u32) -> Self {
        self.topology = TopologySpec::smp(n);
        self
    }

    pub fn topology(mut self, topology: TopologySpec) -> Self {
        self.topology = topology;
        self
    }

    pub fn tunables(mut self, tunables: Tunables) -> Self {
        self.tunables = tunables;
        self
    }

    pub fn group(mut self, def: GroupDef) -> Self {
        self.groups.push(def);
        self
    }

    /// Add a task with a full TaskDef.
    pub fn task(mut self, def: TaskDef) -> Self {
        self.next_pid = Pid(self.next_pid.0.max(def.pid.0 + 1));
        self.tasks.push(def);
        self
    }

    /// Add a task with auto-assigned PID.
    pub fn add_task(mut self, name: &str, nice: i32, behavior: TaskBehavior) -> Self {
        let pid = self.next_pid;
        self.next_pid = Pid(pid.0 + 1);
        let mut def = TaskDef::new(name, pid, behavior);
        def.nice = nice;
        self.tasks.push(def);
        self
    }

    /// Add a task in the group named `group`, which must be declared
    /// before.
    pub fn add_group_task(mut self, name: &str, group: &str, behavior: TaskBehavior) -> Self {
        let pid = self.next_pid;
        self.next_pid = Pid(pid.0 + 1);
        let mut def = TaskDef::new(name, pid, behavior);
        if let Some(i) = self.groups.iter().position(|g| g.name == group) {
            def.group = GroupId(i as u32 + 1);
        }
        self.tasks.push(def);
        self
    }

    pub fn at_ms(mut self, ms: u64, action: Action) -> Self {
        self.actions.push(TimedAction {
            time_ns: ms * NSEC_PER_MSEC,
            action,
        });
        self
    }

    pub fn duration_ns(mut self, ns: TimeNs) -> Self {
        self.duration_ns = ns;
        self
    }

    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.duration_ns = ms * NSEC_PER_MSEC;
        self
    }

    pub fn build(self) -> Scenario {
        Scenario {
            topology: self.topology,
            tunables: self.tunables,
            groups: self.groups,
            tasks: self.tasks,
            actions: self.actions,
            duration_ns: self.duration_ns,
        }
    }
}

/// Parse a duration such as "1s", "0.5s", "500ms", "100us" or "1000ns". A
/// bare number is nanoseconds.
pub fn parse_duration_ns(s: &str) -> Result<TimeNs, String> {
    let s = s.trim();
    let (num, scale) = if let Some(n) = s.strip_suffix("ms") {
        (n, NSEC_PER_MSEC)
    } else if let Some(n) = s.strip_suffix("us") {
        (n, NSEC_PER_USEC)
    } else if let Some(n) = s.strip_suffix("ns") {
        (n, 1)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1_000 * NSEC_PER_MSEC)
    } else {
        (s, 1)
    };
    let value: f64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration {s:?}"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("invalid duration {s:?}"));
    }
    Ok((value * scale as f64).round() as TimeNs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Phase;

    fn spin() -> TaskBehavior {
        TaskBehavior {
            phases: vec![Phase::Run(NSEC_PER_MSEC)],
            repeat: true,
        }
    }

    #[test]
    fn test_builder_assigns_pids_and_groups() {
        let s = Scenario::builder()
            .cpus(2)
            .group(GroupDef::new("a"))
            .add_task("t1", 0, spin())
            .add_group_task("t2", "a", spin())
            .duration_ms(10)
            .build();
        assert_eq!(s.tasks[0].pid, Pid(1));
        assert_eq!(s.tasks[1].pid, Pid(2));
        assert_eq!(s.tasks[1].group, GroupId(1));
        assert_eq!(s.group_id("a"), Some(GroupId(1)));
        assert_eq!(s.duration_ns, 10 * NSEC_PER_MSEC);
        assert_eq!(s.topology.cpus.len(), 2);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration_ns("1s"), Ok(1_000_000_000));
        assert_eq!(parse_duration_ns("0.5s"), Ok(500_000_000));
        assert_eq!(parse_duration_ns("500ms"), Ok(500_000_000));
        assert_eq!(parse_duration_ns("100us"), Ok(100_000));
        assert_eq!(parse_duration_ns("1000"), Ok(1000));
        assert!(parse_duration_ns("fast").is_err());
        assert!(parse_duration_ns("-1ms").is_err());
    }

    #[test]
    fn test_action_json() {
        let a: TimedAction =
            serde_json::from_str(r#"{"time_ns": 5, "action": "cpu_offline", "cpu": 1}"#).unwrap();
        assert_eq!(
            a,
            TimedAction {
                time_ns: 5,
                action: Action::CpuOffline { cpu: CpuId(1) },
            }
        );
    }
}
