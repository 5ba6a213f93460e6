// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Event-driven simulation engine.
//!
//! The engine owns the event queue, the simulated clock and each task's
//! script, and drives [`FairSched`] through the same entry points a kernel
//! would: fork, wakeup, block, exit, the periodic tick, core timers, and the
//! deferred stop-machine and nohz-kick work the scheduler queues up.
//!
//! Time only moves when an event is popped. After each event the engine
//! settles every CPU: pending migrations run, kicked CPUs balance, and any CPU
//! that needs a reschedule calls into the scheduler's pick path.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use tracing::{debug, info, warn};

use crate::sched::FairSched;
use crate::scenario::{Action, Scenario};
use crate::task::{Phase, SimTask, TaskDef, TaskState};
use crate::trace::{Trace, TraceKind};
use crate::types::{CpuId, GroupId, Pid, TimeNs, NSEC_PER_USEC, TICK_NSEC};

/// Rounds of deferred work processed after one event before giving up.
const MAX_SETTLE_ROUNDS: usize = 64;

/// Phases a task may step through without consuming time.
const MAX_PHASE_STEPS: usize = 1024;

/// A simulation event, ordered by timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Event {
    time_ns: TimeNs,
    /// Tiebreaker for events at the same time (lower = earlier).
    seq: u64,
    kind: EventKind,
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time_ns
            .cmp(&other.time_ns)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EventKind {
    /// Fork a task from the scenario.
    TaskStart { pid: Pid },
    /// A timed sleep ends. Stale if the task's sleep generation moved on.
    TaskWake { pid: Pid, gen: u64 },
    /// The task running on `cpu` finished its current Run phase. Stale if
    /// the CPU was rescheduled since.
    PhaseComplete { cpu: CpuId, gen: u64 },
    Tick { cpu: CpuId },
    /// Earliest core timer is due.
    Timer,
    Action(Action),
}

#[derive(Debug, Clone, Copy)]
struct Running {
    pid: Pid,
    /// Last time the task's remaining run time was charged.
    since: TimeNs,
}

pub struct Simulator {
    sched: FairSched,
    defs: BTreeMap<Pid, TaskDef>,
    tasks: BTreeMap<Pid, SimTask>,
    duration_ns: TimeNs,
    events: BinaryHeap<Reverse<Event>>,
    seq: u64,
    trace: Trace,
    running: Vec<Option<Running>>,
    /// Bumped whenever a CPU switches what it runs.
    gen: Vec<u64>,
    /// Bumped whenever a task goes to sleep or is woken early.
    sleep_gen: BTreeMap<Pid, u64>,
    armed_timer: Option<TimeNs>,
}

impl Simulator {
    /// Build the scheduler for `scenario`, create its groups and queue the
    /// initial events.
    pub fn new(scenario: Scenario) -> Result<Self> {
        let mut sched = FairSched::new(&scenario.topology, scenario.tunables.clone())
            .context("Failed to create scheduler")?;

        for (i, def) in scenario.groups.iter().enumerate() {
            let parent = match &def.parent {
                Some(name) => sched
                    .group_by_name(name)
                    .with_context(|| format!("Group {:?} has unknown parent {:?}", def.name, name))?,
                None => GroupId::ROOT,
            };
            let id = sched
                .create_group(&def.name, parent)
                .with_context(|| format!("Failed to create group {:?}", def.name))?;
            if id != GroupId(i as u32 + 1) {
                bail!("Group {:?} got unexpected id {}", def.name, id.0);
            }
            if let Some(shares) = def.shares {
                sched
                    .set_shares(id, shares)
                    .with_context(|| format!("Invalid shares for group {:?}", def.name))?;
            }
            if let Some(quota_us) = def.quota_us {
                sched
                    .set_quota_period(
                        id,
                        Some(quota_us * NSEC_PER_USEC),
                        def.period_us * NSEC_PER_USEC,
                    )
                    .with_context(|| format!("Invalid bandwidth for group {:?}", def.name))?;
            }
            if def.upmigrate_discouraged {
                sched
                    .set_upmigrate_discouraged(id, true)
                    .with_context(|| format!("Invalid group {:?}", def.name))?;
            }
        }

        let mut defs = BTreeMap::new();
        for def in &scenario.tasks {
            if !runs_or_sleeps(def) {
                bail!(
                    "Task {} ({}) repeats forever without running or sleeping",
                    def.pid.0,
                    def.name
                );
            }
            if defs.insert(def.pid, def.clone()).is_some() {
                bail!("Duplicate task pid {}", def.pid.0);
            }
        }

        let nr_cpus = sched.nr_cpus();
        let mut sim = Simulator {
            sched,
            defs,
            tasks: BTreeMap::new(),
            duration_ns: scenario.duration_ns,
            events: BinaryHeap::new(),
            seq: 0,
            trace: Trace::new(),
            running: vec![None; nr_cpus],
            gen: vec![0; nr_cpus],
            sleep_gen: BTreeMap::new(),
            armed_timer: None,
        };

        for def in &scenario.tasks {
            sim.push(def.start_time_ns, EventKind::TaskStart { pid: def.pid });
        }
        for cpu in 0..nr_cpus {
            sim.push(TICK_NSEC, EventKind::Tick { cpu: CpuId(cpu as u32) });
        }
        for timed in scenario.actions {
            sim.push(timed.time_ns, EventKind::Action(timed.action));
        }
        Ok(sim)
    }

    pub fn sched(&self) -> &FairSched {
        &self.sched
    }

    /// Run until the scenario's duration and return the trace.
    pub fn run(mut self) -> Trace {
        info!(
            nr_cpus = self.sched.nr_cpus(),
            nr_tasks = self.defs.len(),
            duration_ns = self.duration_ns,
            "simulation start"
        );

        while let Some(Reverse(event)) = self.events.pop() {
            if event.time_ns > self.duration_ns {
                break;
            }
            self.sched.set_clock(event.time_ns);
            self.charge_running();

            match event.kind {
                EventKind::TaskStart { pid } => self.handle_task_start(pid),
                EventKind::TaskWake { pid, gen } => self.handle_task_wake(pid, gen),
                EventKind::PhaseComplete { cpu, gen } => self.handle_phase_complete(cpu, gen),
                EventKind::Tick { cpu } => self.handle_tick(cpu),
                EventKind::Timer => self.handle_timer(),
                EventKind::Action(action) => {
                    if let Err(e) = self.apply_action(&action) {
                        warn!("Ignoring {:?}: {:#}", action, e);
                    }
                }
            }

            self.settle();
            self.arm_timer();
        }

        self.sched.set_clock(self.duration_ns);
        let mut trace = self.trace;
        trace.end_ns = self.sched.now();
        trace.tasks = self.sched.task_snapshots();
        trace.cpus = self.sched.cpu_snapshots();
        trace.groups = self.sched.group_snapshots();
        info!(nr_events = trace.events().len(), "simulation done");
        trace
    }

    fn push(&mut self, time_ns: TimeNs, kind: EventKind) {
        self.seq += 1;
        self.events.push(Reverse(Event {
            time_ns,
            seq: self.seq,
            kind,
        }));
    }

    fn now(&self) -> TimeNs {
        self.sched.now()
    }

    /// Charge every running task for the time since it was last charged.
    fn charge_running(&mut self) {
        let now = self.now();
        for slot in self.running.iter_mut().flatten() {
            let elapsed = now.saturating_sub(slot.since);
            slot.since = now;
            if let Some(task) = self.tasks.get_mut(&slot.pid) {
                task.run_remaining_ns = task.run_remaining_ns.saturating_sub(elapsed);
            }
        }
    }

    fn handle_task_start(&mut self, pid: Pid) {
        let Some(def) = self.defs.get(&pid) else {
            return;
        };
        match self.sched.fork_task(def) {
            Ok(_) => {
                self.tasks.insert(pid, SimTask::new(def));
                let cpu = self.task_cpu(pid);
                self.trace
                    .record(self.now(), cpu, TraceKind::TaskStarted { pid });
            }
            Err(e) => warn!("Skipping task {}: {:#}", pid.0, e),
        }
    }

    fn handle_task_wake(&mut self, pid: Pid, gen: u64) {
        if self.sleep_gen.get(&pid) != Some(&gen) {
            return;
        }
        if self.sched.try_to_wake_up(pid, 0, None) {
            let cpu = self.task_cpu(pid);
            self.trace.record(self.now(), cpu, TraceKind::TaskWoke { pid });
        }
    }

    fn handle_phase_complete(&mut self, cpu: CpuId, gen: u64) {
        if self.gen[cpu.idx()] != gen {
            return;
        }
        let Some(slot) = self.running[cpu.idx()] else {
            return;
        };
        if self.sched.curr(cpu) != Some(slot.pid) {
            return;
        }
        self.drive_task(cpu, slot.pid);
    }

    fn handle_tick(&mut self, cpu: CpuId) {
        self.sched.scheduler_tick(cpu);
        self.push(self.now() + TICK_NSEC, EventKind::Tick { cpu });
    }

    fn handle_timer(&mut self) {
        if self.armed_timer.is_some_and(|t| t <= self.now()) {
            self.armed_timer = None;
        }
        self.sched.run_timers();
    }

    fn arm_timer(&mut self) {
        let Some(expiry) = self.sched.next_timer_expiry() else {
            return;
        };
        let expiry = expiry.max(self.now());
        if self.armed_timer.map_or(true, |armed| expiry < armed) {
            self.armed_timer = Some(expiry);
            self.push(expiry, EventKind::Timer);
        }
    }

    fn apply_action(&mut self, action: &Action) -> Result<()> {
        debug!(?action, "action");
        match action {
            Action::CpuOffline { cpu } => {
                self.sched.cpu_offline(*cpu)?;
                self.trace.record(self.now(), *cpu, TraceKind::CpuOffline);
            }
            Action::CpuOnline { cpu } => {
                self.sched.cpu_online(*cpu)?;
                self.trace.record(self.now(), *cpu, TraceKind::CpuOnline);
            }
            Action::Boost { enable } => self.sched.set_boost(*enable)?,
            Action::SetShares { group, shares } => {
                let id = self.group_id(group)?;
                self.sched.set_shares(id, *shares)?;
            }
            Action::SetQuota {
                group,
                quota_us,
                period_us,
            } => {
                let id = self.group_id(group)?;
                self.sched.set_quota_period(
                    id,
                    quota_us.map(|q| q * NSEC_PER_USEC),
                    period_us * NSEC_PER_USEC,
                )?;
            }
            Action::SetNice { pid, nice } => self.sched.set_user_nice(*pid, *nice),
            Action::SetPolicy { pid, policy } => self.sched.set_policy(*pid, *policy),
            Action::SetAffinity { pid, cpus } => self.sched.set_cpus_allowed(*pid, cpus)?,
            Action::MoveTask { pid, group } => {
                let id = self.group_id(group)?;
                self.sched.sched_move_task(*pid, id)?;
            }
            Action::Yield { cpu } => self.sched.yield_current(*cpu),
        }
        Ok(())
    }

    fn group_id(&self, name: &str) -> Result<GroupId> {
        self.sched
            .group_by_name(name)
            .with_context(|| format!("Unknown group {:?}", name))
    }

    fn task_cpu(&self, pid: Pid) -> CpuId {
        self.sched.task(pid).map(|t| t.cpu).unwrap_or(CpuId(0))
    }

    fn is_runnable(&self, pid: Pid) -> bool {
        self.sched
            .task(pid)
            .is_some_and(|t| t.on_rq && t.state == TaskState::Running)
    }

    /// Process deferred scheduler work and reschedule CPUs until nothing
    /// changes.
    fn settle(&mut self) {
        for _ in 0..MAX_SETTLE_ROUNDS {
            let mut progress = false;

            for cpu in self.sched.take_stop_work() {
                self.sched.run_active_balance(cpu);
                progress = true;
            }
            for cpu in self.sched.nohz_kicked_cpus() {
                self.sched.handle_nohz_kick(cpu);
                progress = true;
            }

            let nr_cpus = self.sched.nr_cpus();
            for cpu in (0..nr_cpus).map(|c| CpuId(c as u32)) {
                progress |= self.sync_cpu(cpu);
            }
            for cpu in (0..nr_cpus).map(|c| CpuId(c as u32)) {
                if self.wants_schedule(cpu) {
                    progress |= self.reschedule(cpu);
                }
            }

            if !progress {
                return;
            }
        }
        warn!(now = self.now(), "scheduler work did not settle");
    }

    /// Drop a CPU's running task when the scheduler took it away outside
    /// of a reschedule (hotplug, affinity change, active migration).
    fn sync_cpu(&mut self, cpu: CpuId) -> bool {
        let Some(slot) = self.running[cpu.idx()] else {
            return false;
        };
        if self.sched.curr(cpu) == Some(slot.pid) {
            return false;
        }
        self.running[cpu.idx()] = None;
        self.gen[cpu.idx()] += 1;
        if self.is_runnable(slot.pid) {
            self.trace
                .record(self.now(), cpu, TraceKind::TaskPreempted { pid: slot.pid });
        }
        true
    }

    fn wants_schedule(&self, cpu: CpuId) -> bool {
        self.sched.is_online(cpu)
            && (self.sched.need_resched(cpu)
                || (self.sched.curr(cpu).is_none() && self.sched.nr_running(cpu) > 0))
    }

    /// Call into the scheduler's pick path on `cpu`. Returns whether what
    /// the CPU runs changed.
    fn reschedule(&mut self, cpu: CpuId) -> bool {
        let now = self.now();
        let prev = self.running[cpu.idx()].map(|r| r.pid);
        let had_curr = self.sched.curr(cpu).is_some();
        let next = self.sched.schedule(cpu);

        // An exiting or sleeping task was already dropped from `running`
        // but the scheduler still had it as curr.
        if next == prev && (next.is_some() || !had_curr) {
            return false;
        }
        if let Some(p) = prev {
            if self.is_runnable(p) {
                self.trace
                    .record(now, cpu, TraceKind::TaskPreempted { pid: p });
            }
        }
        self.gen[cpu.idx()] += 1;
        match next {
            Some(pid) => {
                self.running[cpu.idx()] = Some(Running { pid, since: now });
                self.trace.record(now, cpu, TraceKind::TaskScheduled { pid });
                self.drive_task(cpu, pid);
                true
            }
            None => {
                self.running[cpu.idx()] = None;
                self.trace.record(now, cpu, TraceKind::CpuIdle);
                true
            }
        }
    }

    /// Step the task running on `cpu` through its script until it needs
    /// CPU time, blocks or exits.
    fn drive_task(&mut self, cpu: CpuId, pid: Pid) {
        let now = self.now();
        for _ in 0..MAX_PHASE_STEPS {
            let Some(task) = self.tasks.get_mut(&pid) else {
                return;
            };
            match task.current_phase().cloned() {
                Some(Phase::Run(_)) if task.run_remaining_ns > 0 => {
                    let at = now.saturating_add(task.run_remaining_ns);
                    let gen = self.gen[cpu.idx()];
                    self.push(at, EventKind::PhaseComplete { cpu, gen });
                    return;
                }
                Some(Phase::Run(_)) => {
                    task.advance_phase();
                }
                Some(Phase::Sleep(ns)) => {
                    task.advance_phase();
                    self.sched.sleep_current(cpu);
                    self.running[cpu.idx()] = None;
                    self.gen[cpu.idx()] += 1;
                    self.trace.record(now, cpu, TraceKind::TaskSlept { pid });
                    let gen = self.bump_sleep_gen(pid);
                    if let Some(at) = now.checked_add(ns) {
                        self.push(at, EventKind::TaskWake { pid, gen });
                    }
                    return;
                }
                Some(Phase::Wake(target)) => {
                    task.advance_phase();
                    if self.sched.try_to_wake_up(target, 0, Some(cpu)) {
                        self.bump_sleep_gen(target);
                        let target_cpu = self.task_cpu(target);
                        self.trace
                            .record(now, target_cpu, TraceKind::TaskWoke { pid: target });
                    }
                }
                None => {
                    self.exit_task(cpu, pid);
                    return;
                }
            }
        }
        warn!(pid = pid.0, "task script made no progress, exiting it");
        self.exit_task(cpu, pid);
    }

    fn exit_task(&mut self, cpu: CpuId, pid: Pid) {
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.exited = true;
        }
        self.sched.exit_current(cpu);
        self.running[cpu.idx()] = None;
        self.gen[cpu.idx()] += 1;
        self.trace
            .record(self.now(), cpu, TraceKind::TaskCompleted { pid });
    }

    fn bump_sleep_gen(&mut self, pid: Pid) -> u64 {
        let gen = self.sleep_gen.entry(pid).or_insert(0);
        *gen += 1;
        *gen
    }
}

/// A repeating script must consume time somewhere, or stepping through it
/// never ends.
fn runs_or_sleeps(def: &TaskDef) -> bool {
    !def.behavior.repeat
        || def
            .behavior
            .phases
            .iter()
            .any(|p| matches!(p, Phase::Run(ns) | Phase::Sleep(ns) if *ns > 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::GroupDef;
    use crate::task::TaskBehavior;
    use crate::types::NSEC_PER_MSEC;

    fn spin() -> TaskBehavior {
        TaskBehavior {
            phases: vec![Phase::Run(u64::MAX / 4)],
            repeat: false,
        }
    }

    #[test]
    fn test_single_task_runs_whole_duration() {
        let scenario = Scenario::builder()
            .cpus(1)
            .add_task("spin", 0, spin())
            .duration_ms(100)
            .build();
        let trace = Simulator::new(scenario).unwrap().run();
        assert_eq!(trace.total_runtime(Pid(1)), 100 * NSEC_PER_MSEC);
        assert_eq!(trace.schedule_count(Pid(1)), 1);
    }

    #[test]
    fn test_finite_task_completes() {
        let scenario = Scenario::builder()
            .cpus(1)
            .add_task(
                "short",
                0,
                TaskBehavior {
                    phases: vec![Phase::Run(5 * NSEC_PER_MSEC)],
                    repeat: false,
                },
            )
            .duration_ms(20)
            .build();
        let trace = Simulator::new(scenario).unwrap().run();
        assert_eq!(trace.total_runtime(Pid(1)), 5 * NSEC_PER_MSEC);
        assert!(trace
            .events()
            .iter()
            .any(|e| e.kind == TraceKind::TaskCompleted { pid: Pid(1) }));
        assert_eq!(trace.idle_count(CpuId(0)), 1);
    }

    #[test]
    fn test_sleeper_wakes_after_timeout() {
        let scenario = Scenario::builder()
            .cpus(1)
            .add_task(
                "sleeper",
                0,
                TaskBehavior {
                    phases: vec![
                        Phase::Run(NSEC_PER_MSEC),
                        Phase::Sleep(3 * NSEC_PER_MSEC),
                        Phase::Run(NSEC_PER_MSEC),
                    ],
                    repeat: false,
                },
            )
            .duration_ms(20)
            .build();
        let trace = Simulator::new(scenario).unwrap().run();
        let woke = trace
            .events()
            .iter()
            .find(|e| e.kind == TraceKind::TaskWoke { pid: Pid(1) })
            .unwrap();
        assert_eq!(woke.time_ns, 4 * NSEC_PER_MSEC);
        assert_eq!(trace.total_runtime(Pid(1)), 2 * NSEC_PER_MSEC);
    }

    #[test]
    fn test_wake_phase_wakes_blocked_task() {
        let waiter = TaskBehavior {
            phases: vec![Phase::Sleep(u64::MAX), Phase::Run(NSEC_PER_MSEC)],
            repeat: false,
        };
        let waker = TaskBehavior {
            phases: vec![Phase::Run(2 * NSEC_PER_MSEC), Phase::Wake(Pid(1))],
            repeat: false,
        };
        let scenario = Scenario::builder()
            .cpus(1)
            .add_task("waiter", 0, waiter)
            .add_task("waker", 0, waker)
            .duration_ms(20)
            .build();
        let trace = Simulator::new(scenario).unwrap().run();
        assert!(trace
            .events()
            .iter()
            .any(|e| e.kind == TraceKind::TaskWoke { pid: Pid(1) }));
        assert_eq!(trace.total_runtime(Pid(1)), NSEC_PER_MSEC);
    }

    #[test]
    fn test_rejects_spinning_script() {
        let scenario = Scenario::builder()
            .cpus(1)
            .add_task(
                "busy",
                0,
                TaskBehavior {
                    phases: vec![Phase::Run(0), Phase::Wake(Pid(7))],
                    repeat: true,
                },
            )
            .build();
        assert!(Simulator::new(scenario).is_err());
    }

    #[test]
    fn test_rejects_unknown_parent_group() {
        let mut child = GroupDef::new("child");
        child.parent = Some("missing".to_string());
        let scenario = Scenario::builder().cpus(1).group(child).build();
        assert!(Simulator::new(scenario).is_err());
    }

    #[test]
    fn test_offline_cpu_migrates_its_task() {
        let mut pinned = TaskDef::new("a", Pid(1), spin());
        pinned.start_cpu = Some(CpuId(1));
        let scenario = Scenario::builder()
            .cpus(2)
            .task(pinned)
            .at_ms(10, Action::CpuOffline { cpu: CpuId(1) })
            .duration_ms(30)
            .build();
        let trace = Simulator::new(scenario).unwrap().run();
        let cpus = trace.cpus_of(Pid(1));
        assert_eq!(cpus.last(), Some(&CpuId(0)));
        assert_eq!(trace.total_runtime(Pid(1)), 30 * NSEC_PER_MSEC);
        assert!(!trace.cpus[1].online);
    }
}
