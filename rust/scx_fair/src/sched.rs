// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The scheduler core object and its dispatcher-facing operations.
//!
//! [`FairSched`] owns every run-queue, entity, group and task. All state is
//! mutated through `&mut self`, so two CPUs' queues can only be touched at
//! once through [`crate::rq::double_rq_mut`] or by index in a single-owner
//! call chain. The fair-class internals live in sibling modules as further
//! `impl FairSched` blocks.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU32;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::cfs_rq::CfsRq;
use crate::config::pct_to_demand;
use crate::config::{Config, ConfigError, Tunables};
use crate::cpumask::Cpumask;
use crate::entity::{
    EntityOwner, SchedEntity, DEQUEUE_SLEEP, ENQUEUE_WAKEUP, ENQUEUE_WAKING, WF_FORK, WF_MIGRATED,
};
use crate::group::TaskGroup;
use crate::hmp::RelatedThreadGroup;
use crate::load_balance::NohzState;
use crate::numa::NumaGroup;
use crate::pelt::init_entity_runnable_average;
use crate::placement::placement_for;
use crate::placement::PlacementPolicy;
use crate::power::{PowerModel, TablePowerModel};
use crate::rq::Rq;
use crate::stats::Metrics;
use crate::task::{Task, TaskDef, TaskState};
use crate::timer::{TimerKind, TimerQueue};
use crate::topology::{Topology, TopologySpec, SD_BALANCE_FORK, SD_BALANCE_WAKE};
use crate::types::{CfsRqId, CpuId, EntityId, GroupId, Pid, Policy, RelatedGroupId, TimeNs, TICK_NSEC};
use crate::weight::{LoadWeight, MAX_NICE, MIN_NICE};

pub struct FairSched {
    pub(crate) cfg: Config,
    pub(crate) topo: Topology,
    pub(crate) rqs: Vec<Rq>,
    pub(crate) entities: Vec<SchedEntity>,
    pub(crate) cfs_rqs: Vec<CfsRq>,
    pub(crate) groups: Vec<TaskGroup>,
    pub(crate) tasks: BTreeMap<Pid, Task>,
    pub(crate) related_groups: BTreeMap<RelatedGroupId, RelatedThreadGroup>,
    pub(crate) numa_groups: BTreeMap<u32, NumaGroup>,
    pub(crate) placement: Box<dyn PlacementPolicy>,
    pub(crate) power: Box<dyn PowerModel>,
    pub(crate) timers: TimerQueue,
    /// Boost refcount. Non-zero sends every placement to the biggest CPUs.
    pub(crate) boost: AtomicU32,
    /// CPUs asked to run an active migration.
    pub(crate) stop_work: VecDeque<CpuId>,
    pub(crate) nohz: NohzState,
    /// Some CPU has more than one runnable task.
    pub(crate) overload: bool,
    pub(crate) active_mask: Cpumask,
    pub(crate) now: TimeNs,
    pub(crate) metrics: Metrics,
}

impl FairSched {
    pub fn new(spec: &TopologySpec, tunables: Tunables) -> Result<Self> {
        let topo = Topology::new(spec)?;
        let nr_cpus = topo.nr_cpus;
        let cfg = Config::new(tunables, nr_cpus).context("Invalid tunables")?;

        let mut root = TaskGroup::new(GroupId::ROOT, "root", None);
        let mut cfs_rqs = Vec::with_capacity(nr_cpus);
        let mut rqs = Vec::with_capacity(nr_cpus);
        for cpu in 0..nr_cpus {
            let cpu = CpuId(cpu as u32);
            let q = CfsRqId(cfs_rqs.len() as u32);
            cfs_rqs.push(CfsRq::new(cpu, GroupId::ROOT, None));
            root.cfs_rq.push(q);
            root.se.push(None);
            rqs.push(Rq::new(cpu, q));
        }

        let placement = placement_for(&cfg);
        let power = Box::new(TablePowerModel::new(&topo));
        let mut sched = FairSched {
            rqs,
            entities: Vec::new(),
            cfs_rqs,
            groups: vec![root],
            tasks: BTreeMap::new(),
            related_groups: BTreeMap::new(),
            numa_groups: BTreeMap::new(),
            placement,
            power,
            timers: TimerQueue::new(),
            boost: AtomicU32::new(0),
            stop_work: VecDeque::new(),
            nohz: NohzState::new(nr_cpus),
            overload: false,
            active_mask: Cpumask::full(nr_cpus),
            now: 0,
            metrics: Metrics::new(),
            cfg,
            topo,
        };
        sched.init_rq_capacity();
        sched.refresh_rq_thresholds();
        info!(
            nr_cpus,
            clusters = sched.topo.clusters.len(),
            placement = sched.placement.name(),
            "fair scheduler up"
        );
        Ok(sched)
    }

    fn init_rq_capacity(&mut self) {
        for cpu in 0..self.rqs.len() {
            let id = CpuId(cpu as u32);
            let orig = self.topo.capacity_orig(id);
            let desc = &self.topo.cpus[cpu].desc;
            let rq = &mut self.rqs[cpu];
            rq.cpu_capacity_orig = orig;
            rq.cpu_capacity = orig;
            rq.static_cpu_pwr_cost = desc.static_cpu_pwr_cost;
            rq.static_cluster_pwr_cost = desc.static_cluster_pwr_cost;
            rq.max_idle_balance_cost = self.cfg.tunables.migration_cost_ns.max(0) as u64;
            rq.avg_idle = 2 * rq.max_idle_balance_cost;
        }
    }

    /// Per-CPU mostly-idle thresholds, from the CPU descriptor when it has
    /// its own and from the tunables otherwise.
    fn refresh_rq_thresholds(&mut self) {
        let hmp = self.cfg.hmp().clone();
        for cpu in 0..self.rqs.len() {
            let desc = &self.topo.cpus[cpu].desc;
            let rq = &mut self.rqs[cpu];
            rq.mostly_idle_load =
                pct_to_demand(desc.mostly_idle_load_pct.unwrap_or(hmp.mostly_idle_load_pct));
            rq.mostly_idle_nr_run = desc.mostly_idle_nr_run.unwrap_or(hmp.mostly_idle_nr_run);
            rq.mostly_idle_freq = desc.mostly_idle_freq;
            rq.prefer_idle = desc.prefer_idle;
        }
    }

    /// Swap in new tunables. The old ones stay in effect on error.
    pub fn set_tunables(&mut self, tunables: Tunables) -> Result<(), ConfigError> {
        let cfg = match Config::new(tunables, self.topo.nr_cpus) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(error = %e, "tunables rejected");
                return Err(e);
            }
        };
        let hmp_was = self.cfg.hmp_enabled();
        self.cfg = cfg;
        self.placement = placement_for(&self.cfg);
        self.refresh_rq_thresholds();
        if hmp_was != self.cfg.hmp_enabled() {
            self.recount_hmp_stats();
        }
        info!(placement = self.placement.name(), "tunables updated");
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn topology(&self) -> &Topology {
        &self.topo
    }

    pub fn nr_cpus(&self) -> usize {
        self.rqs.len()
    }

    pub fn now(&self) -> TimeNs {
        self.now
    }

    pub fn task(&self, pid: Pid) -> Option<&Task> {
        self.tasks.get(&pid)
    }

    pub fn set_power_model(&mut self, power: Box<dyn PowerModel>) {
        self.power = power;
    }

    /// Advance the scheduler's notion of time. Never goes backwards.
    pub fn set_clock(&mut self, now: TimeNs) {
        if now > self.now {
            self.now = now;
        }
    }

    pub fn advance_clock(&mut self, delta: TimeNs) {
        self.now += delta;
    }

    pub(crate) fn jiffies(&self) -> u64 {
        self.now / TICK_NSEC
    }

    pub(crate) fn update_rq_clock(&mut self, cpu: CpuId) {
        let now = self.now;
        let rq = &mut self.rqs[cpu.idx()];
        if now > rq.clock {
            rq.clock = now;
            rq.clock_task = now;
        }
    }

    pub fn curr(&self, cpu: CpuId) -> Option<Pid> {
        self.rqs[cpu.idx()].curr
    }

    pub fn need_resched(&self, cpu: CpuId) -> bool {
        self.rqs[cpu.idx()].need_resched
    }

    pub fn nr_running(&self, cpu: CpuId) -> u32 {
        self.rqs[cpu.idx()].nr_running
    }

    pub fn is_online(&self, cpu: CpuId) -> bool {
        self.rqs[cpu.idx()].online
    }

    pub(crate) fn add_nr_running(&mut self, cpu: CpuId, count: u32) {
        let rq = &mut self.rqs[cpu.idx()];
        let prev = rq.nr_running;
        rq.nr_running += count;
        if prev < 2 && rq.nr_running >= 2 {
            self.overload = true;
        }
    }

    pub(crate) fn sub_nr_running(&mut self, cpu: CpuId, count: u32) {
        let rq = &mut self.rqs[cpu.idx()];
        rq.nr_running = rq.nr_running.saturating_sub(count);
    }

    pub(crate) fn task_se(&self, pid: Pid) -> EntityId {
        self.tasks[&pid].se
    }

    /// Point `pid` at its group's queue on `cpu`.
    pub(crate) fn set_task_rq(&mut self, pid: Pid, cpu: CpuId) {
        let task = &self.tasks[&pid];
        let se = task.se;
        let tg = &self.groups[task.group.idx()];
        let next = tg.cfs_rq[cpu.idx()];
        let parent = tg.se[cpu.idx()];
        let prev = self.entities[se.idx()].cfs_rq;
        self.set_task_rq_fair(se, prev, next);
        let e = &mut self.entities[se.idx()];
        e.cfs_rq = next;
        e.parent = parent;
    }

    pub(crate) fn set_task_cpu(&mut self, pid: Pid, new_cpu: CpuId) {
        let old_cpu = self.tasks[&pid].cpu;
        if old_cpu != new_cpu {
            self.migrate_task_rq_fair(pid);
            let se = self.task_se(pid);
            self.entities[se.idx()].nr_migrations += 1;
            self.metrics.migrations.increment(1);
            debug!(pid = pid.0, from = old_cpu.0, to = new_cpu.0, "migrate");
        }
        self.set_task_rq(pid, new_cpu);
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.cpu = new_cpu;
        }
    }

    pub(crate) fn enqueue_task(&mut self, cpu: CpuId, pid: Pid, flags: u32) {
        self.update_rq_clock(cpu);
        self.account_numa_enqueue(cpu, pid);
        self.enqueue_task_fair(cpu, pid, flags);
    }

    pub(crate) fn dequeue_task(&mut self, cpu: CpuId, pid: Pid, flags: u32) {
        self.update_rq_clock(cpu);
        self.account_numa_dequeue(cpu, pid);
        self.dequeue_task_fair(cpu, pid, flags);
    }

    pub(crate) fn check_preempt_curr(&mut self, cpu: CpuId, pid: Pid, wake_flags: u32) {
        match self.rqs[cpu.idx()].curr {
            None => self.resched_curr(cpu),
            Some(_) => self.check_preempt_wakeup(cpu, pid, wake_flags),
        }
    }

    /// Take a queued, not running task off its CPU and point it at `dst`.
    pub(crate) fn detach_task(&mut self, pid: Pid, dst: CpuId) {
        let src = self.tasks[&pid].cpu;
        self.dequeue_task(src, pid, 0);
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.state = TaskState::Migrating;
        }
        self.set_task_cpu(pid, dst);
    }

    pub(crate) fn attach_task(&mut self, pid: Pid) {
        let cpu = self.tasks[&pid].cpu;
        self.enqueue_task(cpu, pid, 0);
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.state = TaskState::Running;
        }
        self.check_preempt_curr(cpu, pid, 0);
    }

    pub(crate) fn move_queued_task(&mut self, pid: Pid, dst: CpuId) {
        self.update_rq_clock(dst);
        self.detach_task(pid, dst);
        self.attach_task(pid);
    }

    /// Any allowed online CPU, preferring `cpu`'s node. Widens the task's
    /// affinity to every online CPU when none is left.
    pub(crate) fn select_fallback_rq(&mut self, pid: Pid, cpu: CpuId) -> CpuId {
        let node = self.topo.node_of(cpu);
        let task = &self.tasks[&pid];
        let allowed = task.cpus_allowed.and(&self.active_mask);
        let local = allowed.and(&self.topo.node_masks[node.0 as usize]);
        if let Some(c) = local.first().or_else(|| allowed.first()) {
            return c;
        }

        warn!(pid = pid.0, "no allowed CPU is online, widening affinity");
        let active = self.active_mask.clone();
        let dest = active.first().unwrap_or(cpu);
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.cpus_allowed = active;
        }
        dest
    }

    pub(crate) fn select_task_rq(
        &mut self,
        pid: Pid,
        prev_cpu: CpuId,
        sd_flag: u32,
        wake_flags: u32,
        this_cpu: CpuId,
    ) -> CpuId {
        let task = &self.tasks[&pid];
        let cpu = if task.nr_cpus_allowed() > 1 {
            self.placement
                .select_task_rq(self, pid, prev_cpu, sd_flag, wake_flags, this_cpu)
        } else {
            task.cpus_allowed.first().unwrap_or(prev_cpu)
        };

        let task = &self.tasks[&pid];
        if !task.cpus_allowed.test_cpu(cpu) || !self.rqs[cpu.idx()].online {
            return self.select_fallback_rq(pid, prev_cpu);
        }
        cpu
    }

    /// Create a task from `def`, place it and make it runnable.
    pub fn fork_task(&mut self, def: &TaskDef) -> Result<Pid> {
        let pid = def.pid;
        if self.tasks.contains_key(&pid) {
            bail!("Task {} already exists", pid.0);
        }
        if def.group.idx() >= self.groups.len() {
            bail!("Task {} refers to unknown group {}", pid.0, def.group.0);
        }
        let nr_cpus = self.nr_cpus();
        let cpus_allowed = match &def.cpus_allowed {
            Some(list) => Cpumask::from_cpulist(nr_cpus, list)
                .with_context(|| format!("Invalid cpus_allowed for task {}", pid.0))?,
            None => Cpumask::full(nr_cpus),
        };
        if !cpus_allowed.intersects(&self.active_mask) {
            bail!("Task {} has no online CPU in {}", pid.0, cpus_allowed);
        }
        if def.nice < MIN_NICE || def.nice > MAX_NICE {
            bail!("Task {} nice {} outside [{}, {}]", pid.0, def.nice, MIN_NICE, MAX_NICE);
        }
        if let Some(pct) = def.init_load_pct {
            if pct > 100 {
                bail!("Task {} init_load_pct {} above 100", pid.0, pct);
            }
        }

        let mut parent_cpu = def.start_cpu.unwrap_or(CpuId(0));
        if parent_cpu.idx() >= nr_cpus || !self.rqs[parent_cpu.idx()].online {
            parent_cpu = self.active_mask.first().unwrap_or(CpuId(0));
        }

        let load = LoadWeight::for_nice(def.nice, def.policy);
        let se = EntityId(self.entities.len() as u32);
        let cfs_rq = self.groups[def.group.idx()].cfs_rq[parent_cpu.idx()];
        let mut entity = SchedEntity::new(EntityOwner::Task(pid), cfs_rq, load);
        let init_pct = def
            .init_load_pct
            .unwrap_or(self.cfg.hmp().init_task_load_pct);
        init_entity_runnable_average(&mut entity.avg, load.weight, pct_to_demand(init_pct));
        self.entities.push(entity);

        let nr_nodes = self.topo.nr_nodes;
        let mut numa_faults = def.numa_faults.clone();
        numa_faults.resize(nr_nodes, 0);
        self.tasks.insert(
            pid,
            Task {
                pid,
                name: def.name.clone(),
                nice: def.nice,
                policy: def.policy,
                se,
                group: def.group,
                cpu: parent_cpu,
                cpus_allowed,
                state: TaskState::Running,
                on_rq: false,
                wake_up_idle: def.wake_up_idle,
                related_group: None,
                numa_faults,
                numa_preferred_nid: None,
                numa_group: None,
                hmp_contrib: None,
                init_load_pct: def.init_load_pct,
                wakee_flips: 0,
                wakee_flip_decay_ts: self.now,
                last_wakee: None,
            },
        );
        match def.numa_group {
            Some(id) => self.join_numa_group(pid, id),
            None => self.task_numa_placement(pid),
        }
        if let Some(rg) = def.related_group {
            self.join_related_group(pid, rg);
        }

        self.update_rq_clock(parent_cpu);
        self.set_task_rq(pid, parent_cpu);
        self.task_fork_fair(pid, parent_cpu);
        self.wake_up_new_task(pid);
        debug!(pid = pid.0, name = %def.name, cpu = self.tasks[&pid].cpu.0, "fork");
        Ok(pid)
    }

    fn wake_up_new_task(&mut self, pid: Pid) {
        let prev = self.tasks[&pid].cpu;
        let cpu = self.select_task_rq(pid, prev, SD_BALANCE_FORK, 0, prev);
        self.set_task_cpu(pid, cpu);
        self.update_rq_clock(cpu);
        self.enqueue_task(cpu, pid, 0);
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.on_rq = true;
            task.state = TaskState::Running;
        }
        self.check_preempt_curr(cpu, pid, WF_FORK);
    }

    /// Wake a sleeping task. `waker_cpu` is the CPU doing the wakeup, `None`
    /// for a timer or interrupt on the task's own CPU. Returns whether the
    /// task was woken.
    pub fn try_to_wake_up(&mut self, pid: Pid, wake_flags: u32, waker_cpu: Option<CpuId>) -> bool {
        let Some(task) = self.tasks.get(&pid) else {
            return false;
        };
        if task.state != TaskState::Sleeping {
            return false;
        }
        let prev = task.cpu;
        let this_cpu = waker_cpu.unwrap_or(prev);
        let waker = waker_cpu.and_then(|c| self.rqs[c.idx()].curr);
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.state = TaskState::Waking;
        }

        self.task_waking_fair(pid, waker);
        let cpu = self.select_task_rq(pid, prev, SD_BALANCE_WAKE, wake_flags, this_cpu);
        let mut wake_flags = wake_flags;
        if cpu != prev {
            wake_flags |= WF_MIGRATED;
            self.set_task_cpu(pid, cpu);
        }
        self.ttwu_do_activate(cpu, pid, wake_flags);
        debug!(pid = pid.0, cpu = cpu.0, prev = prev.0, "wakeup");
        true
    }

    fn ttwu_do_activate(&mut self, cpu: CpuId, pid: Pid, wake_flags: u32) {
        self.update_rq_clock(cpu);
        self.enqueue_task(cpu, pid, ENQUEUE_WAKEUP | ENQUEUE_WAKING);
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.on_rq = true;
            task.state = TaskState::Running;
        }
        self.check_preempt_curr(cpu, pid, wake_flags);

        let rq = &mut self.rqs[cpu.idx()];
        if rq.idle_stamp != 0 {
            let delta = rq.clock.saturating_sub(rq.idle_stamp);
            let max = 2 * rq.max_idle_balance_cost;
            let diff = delta as i64 - rq.avg_idle as i64;
            rq.avg_idle = (rq.avg_idle as i64 + (diff >> 3)).max(0) as u64;
            if rq.avg_idle > max {
                rq.avg_idle = max;
            }
            rq.idle_stamp = 0;
        }
    }

    /// Block the task running on `cpu`. Returns the task.
    pub fn sleep_current(&mut self, cpu: CpuId) -> Option<Pid> {
        let pid = self.rqs[cpu.idx()].curr?;
        self.update_rq_clock(cpu);
        self.dequeue_task(cpu, pid, DEQUEUE_SLEEP);
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.on_rq = false;
            task.state = TaskState::Sleeping;
        }
        self.resched_curr(cpu);
        Some(pid)
    }

    /// The task running on `cpu` exits.
    pub fn exit_current(&mut self, cpu: CpuId) -> Option<Pid> {
        let pid = self.sleep_current(cpu)?;
        self.task_dead_fair(pid);
        self.leave_related_group(pid);
        self.leave_numa_group(pid);
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.state = TaskState::Dead;
        }
        debug!(pid = pid.0, cpu = cpu.0, "exit");
        Some(pid)
    }

    /// Pick what runs next on `cpu`. Returns the task now running.
    pub fn schedule(&mut self, cpu: CpuId) -> Option<Pid> {
        self.update_rq_clock(cpu);
        let prev = self.rqs[cpu.idx()].curr;
        self.rqs[cpu.idx()].need_resched = false;

        let next = self.pick_next_task_fair(cpu, prev);
        self.rqs[cpu.idx()].curr = next;

        match (prev, next) {
            (Some(_), None) => self.enter_idle(cpu),
            (None, Some(_)) => self.exit_idle(cpu),
            _ => {}
        }
        if let Some(p) = next {
            if next != prev {
                debug!(pid = p.0, cpu = cpu.0, "switch");
            }
        }
        next
    }

    fn enter_idle(&mut self, cpu: CpuId) {
        self.rqs[cpu.idx()].cstate = 1;
        let cluster = self.topo.cluster_of(cpu).cpus.clone();
        if cluster.iter().all(|c| self.rqs[c.idx()].is_idle()) {
            for c in cluster.iter() {
                self.rqs[c.idx()].dstate = 1;
            }
        }
        self.nohz_balance_enter_idle(cpu);
    }

    fn exit_idle(&mut self, cpu: CpuId) {
        self.rqs[cpu.idx()].cstate = 0;
        let cluster = self.topo.cluster_of(cpu).cpus.clone();
        for c in cluster.iter() {
            self.rqs[c.idx()].dstate = 0;
        }
        self.nohz_balance_exit_idle(cpu);
    }

    /// Periodic tick on `cpu`.
    pub fn scheduler_tick(&mut self, cpu: CpuId) {
        let rq = &self.rqs[cpu.idx()];
        if !rq.online || (rq.nohz_tick_stopped && rq.is_idle()) {
            return;
        }
        self.update_rq_clock(cpu);
        let curr = self.rqs[cpu.idx()].curr;
        if let Some(pid) = curr {
            self.task_tick_fair(cpu, pid);
        }
        self.update_cpu_load_active(cpu);

        let idle = self.rqs[cpu.idx()].is_idle();
        self.rqs[cpu.idx()].idle_balance = idle;
        self.trigger_load_balance(cpu);
        if let Some(pid) = curr {
            if self.cfg.hmp_enabled() {
                self.check_for_migration(cpu, pid);
            }
        }
    }

    /// The task running on `cpu` yields.
    pub fn yield_current(&mut self, cpu: CpuId) {
        if self.rqs[cpu.idx()].curr.is_none() {
            return;
        }
        self.yield_task_fair(cpu);
        self.resched_curr(cpu);
    }

    /// The task running on `cpu` yields in favour of `pid`. Returns whether
    /// `pid` was nominated.
    pub fn yield_to(&mut self, cpu: CpuId, pid: Pid) -> bool {
        let Some(task) = self.tasks.get(&pid) else {
            return false;
        };
        let p_cpu = task.cpu;
        if self.rqs[cpu.idx()].curr.is_none()
            || task.state != TaskState::Running
            || self.rqs[p_cpu.idx()].curr == Some(pid)
        {
            return false;
        }
        let yielded = self.yield_to_task_fair(cpu, pid);
        if yielded {
            if p_cpu != cpu {
                self.resched_curr(p_cpu);
            }
            self.resched_curr(cpu);
        }
        yielded
    }

    /// Change a task's nice value.
    pub fn set_user_nice(&mut self, pid: Pid, nice: i32) {
        let nice = nice.clamp(MIN_NICE, MAX_NICE);
        let Some(task) = self.tasks.get(&pid) else {
            return;
        };
        if task.state == TaskState::Dead || task.nice == nice {
            return;
        }
        let (cpu, queued, old, policy, se) = (task.cpu, task.on_rq, task.nice, task.policy, task.se);
        let running = self.rqs[cpu.idx()].curr == Some(pid);
        self.update_rq_clock(cpu);

        if queued {
            self.dequeue_task(cpu, pid, 0);
        }
        self.entities[se.idx()].load = LoadWeight::for_nice(nice, policy);
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.nice = nice;
        }
        if queued {
            self.enqueue_task(cpu, pid, 0);
            let delta = nice - old;
            if delta < 0 || (delta > 0 && running) {
                self.resched_curr(cpu);
            }
        }
    }

    /// Change a task's policy, keeping its nice value.
    pub fn set_policy(&mut self, pid: Pid, policy: Policy) {
        let Some(task) = self.tasks.get(&pid) else {
            return;
        };
        if task.state == TaskState::Dead || task.policy == policy {
            return;
        }
        let (cpu, queued, nice, se) = (task.cpu, task.on_rq, task.nice, task.se);
        let old_weight = self.entities[se.idx()].load.weight;
        let running = self.rqs[cpu.idx()].curr == Some(pid);
        self.update_rq_clock(cpu);

        if queued {
            self.dequeue_task(cpu, pid, 0);
        }
        if running {
            self.put_prev_task_fair(cpu, pid);
        }
        self.entities[se.idx()].load = LoadWeight::for_nice(nice, policy);
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.policy = policy;
        }
        if running {
            self.set_curr_task_fair(cpu, pid);
        }
        if queued {
            self.enqueue_task(cpu, pid, 0);
        }
        self.prio_changed_fair(cpu, pid, old_weight);
    }

    /// Restrict `pid` to `cpulist`, moving it off a CPU it may no longer use.
    pub fn set_cpus_allowed(&mut self, pid: Pid, cpulist: &str) -> Result<()> {
        let nr_cpus = self.nr_cpus();
        let mask = Cpumask::from_cpulist(nr_cpus, cpulist)
            .with_context(|| format!("Invalid cpulist {:?} for task {}", cpulist, pid.0))?;
        let Some(task) = self.tasks.get_mut(&pid) else {
            bail!("Unknown task {}", pid.0);
        };
        if !mask.intersects(&self.active_mask) {
            bail!("Task {} would have no online CPU in {}", pid.0, mask);
        }
        let cpu = task.cpu;
        let on_rq = task.on_rq;
        task.cpus_allowed = mask.clone();
        if mask.test_cpu(cpu) {
            return Ok(());
        }

        let dest = mask.and(&self.active_mask).first().unwrap_or(cpu);
        if self.rqs[cpu.idx()].curr == Some(pid) {
            self.update_rq_clock(cpu);
            self.put_prev_task_fair(cpu, pid);
            self.rqs[cpu.idx()].curr = None;
            self.resched_curr(cpu);
        }
        if on_rq {
            self.move_queued_task(pid, dest);
        }
        Ok(())
    }

    /// Move `pid` to another task group.
    pub fn sched_move_task(&mut self, pid: Pid, group: GroupId) -> Result<()> {
        if group.idx() >= self.groups.len() {
            bail!("Unknown task group {}", group.0);
        }
        let Some(task) = self.tasks.get(&pid) else {
            bail!("Unknown task {}", pid.0);
        };
        if task.group == group || task.state == TaskState::Dead {
            return Ok(());
        }
        let (cpu, queued) = (task.cpu, task.on_rq);
        let running = self.rqs[cpu.idx()].curr == Some(pid);
        self.update_rq_clock(cpu);

        if queued {
            self.dequeue_task(cpu, pid, 0);
        }
        if running {
            self.put_prev_task_fair(cpu, pid);
        }
        self.task_move_group_fair(pid, group);
        if running {
            self.set_curr_task_fair(cpu, pid);
        }
        if queued {
            self.enqueue_task(cpu, pid, 0);
        }
        debug!(pid = pid.0, group = group.0, "moved group");
        Ok(())
    }

    pub fn get_rr_interval(&self, pid: Pid) -> TimeNs {
        self.get_rr_interval_fair(pid)
    }

    /// Take `cpu` offline, pushing its tasks elsewhere.
    pub fn cpu_offline(&mut self, cpu: CpuId) -> Result<()> {
        if cpu.idx() >= self.nr_cpus() {
            bail!("Unknown CPU {}", cpu.0);
        }
        if !self.rqs[cpu.idx()].online {
            return Ok(());
        }
        if self.active_mask.weight() == 1 {
            bail!("Cannot offline the last online CPU {}", cpu.0);
        }

        self.update_rq_clock(cpu);
        self.rqs[cpu.idx()].online = false;
        self.active_mask.clear_cpu(cpu);
        self.rebuild_sched_domains();
        self.unthrottle_offline_cfs_rqs(cpu);

        if let Some(curr) = self.rqs[cpu.idx()].curr {
            self.put_prev_task_fair(cpu, curr);
            self.rqs[cpu.idx()].curr = None;
        }
        let queued: Vec<Pid> = self
            .tasks
            .values()
            .filter(|t| t.cpu == cpu && t.on_rq)
            .map(|t| t.pid)
            .collect();
        for pid in queued {
            let dest = self.select_fallback_rq(pid, cpu);
            self.move_queued_task(pid, dest);
        }

        let rq = &mut self.rqs[cpu.idx()];
        rq.need_resched = false;
        rq.active_balance = false;
        rq.push_task = None;
        rq.reserved = false;
        self.stop_work.retain(|&c| c != cpu);
        self.nohz_balance_exit_idle(cpu);
        info!(cpu = cpu.0, "cpu offline");
        Ok(())
    }

    pub fn cpu_online(&mut self, cpu: CpuId) -> Result<()> {
        if cpu.idx() >= self.nr_cpus() {
            bail!("Unknown CPU {}", cpu.0);
        }
        if self.rqs[cpu.idx()].online {
            return Ok(());
        }
        self.update_rq_clock(cpu);
        let now = self.jiffies();
        let rq = &mut self.rqs[cpu.idx()];
        rq.online = true;
        rq.next_balance = now;
        rq.cstate = 0;
        self.active_mask.set_cpu(cpu);
        self.rebuild_sched_domains();
        self.update_runtime_enabled(cpu);
        info!(cpu = cpu.0, "cpu online");
        Ok(())
    }

    /// Domains, groups and group capacities cover the active CPUs only.
    fn rebuild_sched_domains(&mut self) {
        let active = self.active_mask.clone();
        self.topo.rebuild_domains(&active);
        debug!(active = %active, "sched domains rebuilt");
    }

    /// Earliest armed core timer.
    pub fn next_timer_expiry(&self) -> Option<TimeNs> {
        self.timers.next_expiry()
    }

    /// Fire every core timer due at the current time.
    pub fn run_timers(&mut self) {
        for (kind, _) in self.timers.pop_expired(self.now) {
            match kind {
                TimerKind::BandwidthPeriod(group) => self.sched_cfs_period_timer(group),
                TimerKind::BandwidthSlack(group) => self.do_sched_cfs_slack_timer(group),
            }
        }
    }

    /// CPUs with a pending active migration request.
    pub fn take_stop_work(&mut self) -> Vec<CpuId> {
        self.stop_work.drain(..).collect()
    }

    /// Run the stop-and-migrate work queued on `cpu`.
    pub fn run_active_balance(&mut self, cpu: CpuId) {
        if !self.rqs[cpu.idx()].active_balance {
            return;
        }
        self.update_rq_clock(cpu);
        if let Some(curr) = self.rqs[cpu.idx()].curr {
            self.put_prev_task_fair(cpu, curr);
            self.rqs[cpu.idx()].curr = None;
        }
        self.active_load_balance_cpu_stop(cpu);
        self.resched_curr(cpu);
    }

    /// CPUs that were kicked to balance on behalf of idle CPUs.
    pub fn nohz_kicked_cpus(&self) -> Vec<CpuId> {
        self.rqs
            .iter()
            .filter(|rq| rq.nohz_balance_kick)
            .map(|rq| rq.cpu)
            .collect()
    }

    pub fn handle_nohz_kick(&mut self, cpu: CpuId) {
        if !self.rqs[cpu.idx()].nohz_balance_kick {
            return;
        }
        if !self.rqs[cpu.idx()].is_idle() {
            self.rqs[cpu.idx()].nohz_balance_kick = false;
            return;
        }
        self.update_rq_clock(cpu);
        self.rqs[cpu.idx()].idle_balance = true;
        self.run_rebalance_domains(cpu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Phase, TaskBehavior};
    use crate::weight::{NICE_0_LOAD, WEIGHT_IDLEPRIO};

    fn pinned_spinner(pid: i32, cpus: &str) -> TaskDef {
        let mut def = TaskDef::new(
            &format!("t{pid}"),
            Pid(pid),
            TaskBehavior {
                phases: vec![Phase::Run(u64::MAX / 4)],
                repeat: false,
            },
        );
        def.cpus_allowed = Some(cpus.to_string());
        def
    }

    fn aggregates(s: &FairSched, cpu: CpuId) -> (u64, u32, u32) {
        let root = &s.cfs_rqs[s.rqs[cpu.idx()].cfs.idx()];
        (root.load.weight, root.nr_running, s.rqs[cpu.idx()].nr_running)
    }

    #[test]
    fn test_enqueue_dequeue_restores_aggregates() {
        let mut s = FairSched::new(&TopologySpec::smp(1), Tunables::default()).unwrap();
        s.fork_task(&pinned_spinner(1, "0")).unwrap();
        s.fork_task(&pinned_spinner(2, "0")).unwrap();
        s.dequeue_task(CpuId(0), Pid(2), DEQUEUE_SLEEP);
        let before = aggregates(&s, CpuId(0));

        s.enqueue_task(CpuId(0), Pid(2), ENQUEUE_WAKEUP);
        assert_eq!(aggregates(&s, CpuId(0)).1, before.1 + 1);
        s.dequeue_task(CpuId(0), Pid(2), DEQUEUE_SLEEP);
        assert_eq!(aggregates(&s, CpuId(0)), before);
    }

    #[test]
    fn test_migration_moves_weight_exactly() {
        let mut s = FairSched::new(&TopologySpec::smp(2), Tunables::default()).unwrap();
        s.fork_task(&pinned_spinner(1, "0")).unwrap();
        s.fork_task(&pinned_spinner(2, "0")).unwrap();
        let se = s.task_se(Pid(2));
        let weight = s.entities[se.idx()].load.weight;
        let (src_before, _, _) = aggregates(&s, CpuId(0));
        let (dst_before, _, _) = aggregates(&s, CpuId(1));

        s.move_queued_task(Pid(2), CpuId(1));

        let (src_after, _, src_nr) = aggregates(&s, CpuId(0));
        let (dst_after, _, dst_nr) = aggregates(&s, CpuId(1));
        assert_eq!(src_before - src_after, weight);
        assert_eq!(dst_after - dst_before, weight);
        assert_eq!((src_nr, dst_nr), (1, 1));

        let in_tree = |cpu: CpuId| {
            s.cfs_rqs[s.rqs[cpu.idx()].cfs.idx()]
                .queued()
                .filter(|&e| e == se)
                .count()
        };
        assert_eq!(in_tree(CpuId(0)) + in_tree(CpuId(1)), 1);
        assert_eq!(in_tree(CpuId(1)), 1);
        assert_eq!(s.task(Pid(2)).unwrap().cpu, CpuId(1));
        assert_eq!(s.task_snapshot(Pid(2)).unwrap().nr_migrations, 1);
    }

    #[test]
    fn test_clock_never_goes_backwards() {
        let mut s = FairSched::new(&TopologySpec::smp(1), Tunables::default()).unwrap();
        s.set_clock(10);
        s.set_clock(5);
        assert_eq!(s.now(), 10);
    }

    #[test]
    fn test_last_cpu_cannot_go_offline() {
        let mut s = FairSched::new(&TopologySpec::smp(2), Tunables::default()).unwrap();
        s.cpu_offline(CpuId(1)).unwrap();
        assert!(s.cpu_offline(CpuId(0)).is_err());
        assert!(s.cpu_offline(CpuId(5)).is_err());
        s.cpu_online(CpuId(1)).unwrap();
        assert!(s.is_online(CpuId(1)));
    }

    #[test]
    fn test_hotplug_rebuilds_domains() {
        let spec = TopologySpec::clustered(&[(2, 1024, 1_000_000), (2, 1024, 1_000_000)]);
        let mut s = FairSched::new(&spec, Tunables::default()).unwrap();
        assert_eq!(s.topo.domains[1].len(), 2);

        s.cpu_offline(CpuId(0)).unwrap();
        assert!(s.topo.domains[0].is_empty());
        // CPU 1 lost its only sibling, so only the cluster level is left.
        let die = &s.topo.domains[1];
        assert_eq!(die.len(), 1);
        assert_eq!(die[0].span.to_string(), "{1,2,3}");
        assert_eq!(die[0].groups[0].group_weight, 1);
        assert_eq!(s.topo.sgc[die[0].groups[0].sgc].capacity, 1024);
        assert_eq!(s.topo.sgc[die[0].groups[1].sgc].capacity, 2048);
        for stack in &s.topo.domains {
            for sd in stack {
                assert!(!sd.span.test_cpu(CpuId(0)));
                assert!(sd.groups.iter().all(|g| !g.cpus.test_cpu(CpuId(0))));
            }
        }

        s.cpu_online(CpuId(0)).unwrap();
        assert_eq!(s.topo.domains[0].len(), 2);
        assert_eq!(s.topo.domains[1][1].span.to_string(), "{0,1,2,3}");
    }

    #[test]
    fn test_yield_skips_current() {
        let mut s = FairSched::new(&TopologySpec::smp(1), Tunables::default()).unwrap();
        s.fork_task(&pinned_spinner(1, "0")).unwrap();
        s.fork_task(&pinned_spinner(2, "0")).unwrap();
        let first = s.schedule(CpuId(0)).unwrap();
        s.set_clock(10_000_000);

        s.yield_current(CpuId(0));
        assert!(s.need_resched(CpuId(0)));
        let root = s.rqs[0].cfs;
        assert_eq!(s.cfs_rqs[root.idx()].skip, Some(s.task_se(first)));
        assert_ne!(s.schedule(CpuId(0)), Some(first));
    }

    #[test]
    fn test_yield_to_nominates_target() {
        let mut s = FairSched::new(&TopologySpec::smp(1), Tunables::default()).unwrap();
        for pid in 1..=3 {
            s.fork_task(&pinned_spinner(pid, "0")).unwrap();
        }
        let curr = s.schedule(CpuId(0)).unwrap();
        let target = (1..=3).map(Pid).find(|&p| p != curr).unwrap();

        assert!(s.yield_to(CpuId(0), target));
        let root = s.rqs[0].cfs;
        assert_eq!(s.cfs_rqs[root.idx()].next, Some(s.task_se(target)));
        assert!(!s.yield_to(CpuId(0), curr));
        assert!(!s.yield_to(CpuId(0), Pid(42)));
    }

    #[test]
    fn test_idle_policy_uses_idle_weight() {
        let mut s = FairSched::new(&TopologySpec::smp(1), Tunables::default()).unwrap();
        s.fork_task(&pinned_spinner(1, "0")).unwrap();
        s.set_policy(Pid(1), Policy::Idle);
        assert_eq!(aggregates(&s, CpuId(0)).0, WEIGHT_IDLEPRIO);

        s.set_policy(Pid(1), Policy::Normal);
        assert_eq!(aggregates(&s, CpuId(0)).0, NICE_0_LOAD);
    }

    #[test]
    fn test_move_task_between_groups() {
        let mut s = FairSched::new(&TopologySpec::smp(1), Tunables::default()).unwrap();
        let g = s.create_group("g", GroupId::ROOT).unwrap();
        s.fork_task(&pinned_spinner(1, "0")).unwrap();
        s.schedule(CpuId(0));

        s.sched_move_task(Pid(1), g).unwrap();
        assert_eq!(s.task(Pid(1)).unwrap().group, g);
        assert_eq!(s.curr(CpuId(0)), Some(Pid(1)));
        assert_eq!(aggregates(&s, CpuId(0)).2, 1);
        let se = s.task_se(Pid(1));
        assert_eq!(s.cfs_rqs[s.cfs_rq_of(se).idx()].group, g);

        assert!(s.sched_move_task(Pid(1), GroupId(7)).is_err());
        assert!(s.sched_move_task(Pid(9), GroupId::ROOT).is_err());
    }
}
