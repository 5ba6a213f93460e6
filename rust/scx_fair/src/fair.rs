// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Weighted virtual-time engine.
//!
//! Every queue orders its runnable entities by virtual runtime, which
//! advances at `NICE_0_LOAD / weight` times wall time while an entity runs.
//! The leftmost entity is the least served and runs next, unless one of
//! the queue's buddies (`next`, `last`, `skip`) is close enough to it in
//! virtual time to be preferred.
//!
//! Task operations walk the entity hierarchy: a task's entity sits in its
//! group's queue on the task's CPU, whose group entity sits in the parent
//! group's queue, and so on up to the CPU's root queue.

use crate::cfs_rq::CfsRq;
use crate::entity::{DEQUEUE_SLEEP, ENQUEUE_WAKEUP, ENQUEUE_WAKING, WF_FORK};
use crate::sched::FairSched;
use crate::task::TaskState;
use crate::types::{
    max_vruntime, min_vruntime, CfsRqId, CpuId, EntityId, GroupId, Pid, Policy, TimeNs,
    NSEC_PER_SEC,
};
use crate::weight::{calc_delta, calc_delta_fair};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Buddy {
    Last,
    Next,
    Skip,
}

fn buddy_mut(q: &mut CfsRq, buddy: Buddy) -> &mut Option<EntityId> {
    match buddy {
        Buddy::Last => &mut q.last,
        Buddy::Next => &mut q.next,
        Buddy::Skip => &mut q.skip,
    }
}

impl FairSched {
    pub(crate) fn cfs_rq_of(&self, se: EntityId) -> CfsRqId {
        self.entities[se.idx()].cfs_rq
    }

    fn entity_before(&self, a: EntityId, b: EntityId) -> bool {
        self.entities[a.idx()]
            .vruntime
            .delta(self.entities[b.idx()].vruntime)
            < 0
    }

    pub(crate) fn resched_curr(&mut self, cpu: CpuId) {
        self.rqs[cpu.idx()].need_resched = true;
    }

    pub(crate) fn update_min_vruntime(&mut self, q: CfsRqId) {
        let cfs_rq = &self.cfs_rqs[q.idx()];
        let curr_v = cfs_rq.curr.map(|c| self.entities[c.idx()].vruntime);
        let mut vruntime = curr_v.unwrap_or(cfs_rq.min_vruntime);

        if let Some(left) = cfs_rq.first() {
            let left_v = self.entities[left.idx()].vruntime;
            vruntime = match curr_v {
                None => left_v,
                Some(_) => min_vruntime(vruntime, left_v),
            };
        }

        // Never go backwards.
        let cfs_rq = &mut self.cfs_rqs[q.idx()];
        cfs_rq.min_vruntime = max_vruntime(cfs_rq.min_vruntime, vruntime);
    }

    /// Period in which every one of `nr_running` entities runs once.
    pub(crate) fn sched_period(&self, nr_running: u64) -> u64 {
        if nr_running > self.cfg.nr_latency {
            nr_running * self.cfg.min_granularity
        } else {
            self.cfg.latency
        }
    }

    /// Wall-clock slice `se` is entitled to: its share of the period at
    /// every level of the hierarchy.
    pub(crate) fn sched_slice(&self, q: CfsRqId, se: EntityId) -> u64 {
        let e = &self.entities[se.idx()];
        let nr = self.cfs_rqs[q.idx()].nr_running as u64 + (!e.on_rq) as u64;
        let mut slice = self.sched_period(nr);

        let mut cursor = Some(se);
        while let Some(s) = cursor {
            let e = &self.entities[s.idx()];
            let mut lw = self.cfs_rqs[e.cfs_rq.idx()].load;
            if !e.on_rq {
                lw.add(e.load.weight);
            }
            slice = calc_delta(slice, e.load.weight, &mut lw);
            cursor = e.parent;
        }
        slice
    }

    fn sched_vslice(&self, q: CfsRqId, se: EntityId) -> u64 {
        calc_delta_fair(self.sched_slice(q, se), &self.entities[se.idx()].load)
    }

    /// Charge the running entity of `q` for the time since it last was.
    pub(crate) fn update_curr(&mut self, q: CfsRqId) {
        let cfs_rq = &self.cfs_rqs[q.idx()];
        let Some(curr) = cfs_rq.curr else {
            return;
        };
        let now = self.rqs[cfs_rq.cpu.idx()].clock_task;
        let e = &mut self.entities[curr.idx()];
        let delta_exec = now as i64 - e.exec_start as i64;
        if delta_exec <= 0 {
            return;
        }
        let delta_exec = delta_exec as u64;
        e.exec_start = now;
        e.sum_exec_runtime += delta_exec;
        e.vruntime = e.vruntime.add(calc_delta_fair(delta_exec, &e.load));

        self.update_min_vruntime(q);
        self.account_cfs_rq_runtime(q, delta_exec);
    }

    fn place_entity(&mut self, q: CfsRqId, se: EntityId, initial: bool) {
        let mut vruntime = self.cfs_rqs[q.idx()].min_vruntime;
        let features = self.cfg.features();

        // New tasks start a slice behind so that forking cannot be used to
        // dodge the queue.
        if initial && features.start_debit {
            vruntime = vruntime.add(self.sched_vslice(q, se));
        }

        // Sleepers get up to one latency period of credit.
        if !initial {
            let mut thresh = self.cfg.latency;
            if features.gentle_fair_sleepers {
                thresh >>= 1;
            }
            vruntime = vruntime.sub(thresh);
        }

        let e = &mut self.entities[se.idx()];
        e.vruntime = max_vruntime(e.vruntime, vruntime);
    }

    fn check_spread(&mut self, q: CfsRqId, se: EntityId) {
        let d = self.entities[se.idx()]
            .vruntime
            .delta(self.cfs_rqs[q.idx()].min_vruntime)
            .unsigned_abs();
        if d > 3 * self.cfg.latency {
            self.cfs_rqs[q.idx()].nr_spread_over += 1;
        }
    }

    pub(crate) fn account_entity_enqueue(&mut self, q: CfsRqId, se: EntityId) {
        let e = &self.entities[se.idx()];
        let (weight, top, pid) = (e.load.weight, e.parent.is_none(), e.task());
        let cfs_rq = &mut self.cfs_rqs[q.idx()];
        cfs_rq.load.add(weight);
        cfs_rq.nr_running += 1;
        let rq = &mut self.rqs[cfs_rq.cpu.idx()];
        if top {
            rq.load.add(weight);
        }
        if let Some(pid) = pid {
            rq.touch_cfs_task(pid);
        }
    }

    pub(crate) fn account_entity_dequeue(&mut self, q: CfsRqId, se: EntityId) {
        let e = &self.entities[se.idx()];
        let (weight, top, pid) = (e.load.weight, e.parent.is_none(), e.task());
        let cfs_rq = &mut self.cfs_rqs[q.idx()];
        cfs_rq.load.sub(weight);
        cfs_rq.nr_running = cfs_rq.nr_running.saturating_sub(1);
        let rq = &mut self.rqs[cfs_rq.cpu.idx()];
        if top {
            rq.load.sub(weight);
        }
        if let Some(pid) = pid {
            rq.remove_cfs_task(pid);
        }
    }

    pub(crate) fn entity_depth(&self, se: EntityId) -> u32 {
        match self.entities[se.idx()].parent {
            Some(p) => self.entities[p.idx()].depth + 1,
            None => 0,
        }
    }

    pub(crate) fn enqueue_entity(&mut self, q: CfsRqId, se: EntityId, flags: u32) {
        // Relative vruntime (migration, fork, or wakeup from another CPU)
        // becomes absolute against this queue.
        if flags & ENQUEUE_WAKEUP == 0 || flags & ENQUEUE_WAKING != 0 {
            let min = self.cfs_rqs[q.idx()].min_vruntime;
            let e = &mut self.entities[se.idx()];
            e.vruntime = e.vruntime.add(min.0);
        }

        self.update_curr(q);
        self.enqueue_entity_load_avg(q, se);
        self.account_entity_enqueue(q, se);
        self.update_cfs_shares(q);

        if flags & ENQUEUE_WAKEUP != 0 {
            self.place_entity(q, se, false);
        }
        self.check_spread(q, se);

        let depth = self.entity_depth(se);
        let is_curr = self.cfs_rqs[q.idx()].curr == Some(se);
        let vruntime = self.entities[se.idx()].vruntime;
        let key = if is_curr {
            None
        } else {
            Some(self.cfs_rqs[q.idx()].insert(se, vruntime))
        };
        let e = &mut self.entities[se.idx()];
        e.depth = depth;
        if key.is_some() {
            e.tree_key = key;
        }
        e.on_rq = true;

        if self.cfs_rqs[q.idx()].nr_running == 1 {
            self.cfs_rqs[q.idx()].on_list = true;
            self.check_enqueue_throttle(q);
        }
    }

    fn clear_buddy(&mut self, se: EntityId, buddy: Buddy) {
        let mut cursor = Some(se);
        while let Some(s) = cursor {
            let q = self.cfs_rq_of(s);
            let slot = buddy_mut(&mut self.cfs_rqs[q.idx()], buddy);
            if *slot != Some(s) {
                break;
            }
            *slot = None;
            cursor = self.entities[s.idx()].parent;
        }
    }

    pub(crate) fn clear_buddies(&mut self, q: CfsRqId, se: EntityId) {
        for buddy in [Buddy::Last, Buddy::Next, Buddy::Skip] {
            if *buddy_mut(&mut self.cfs_rqs[q.idx()], buddy) == Some(se) {
                self.clear_buddy(se, buddy);
            }
        }
    }

    fn set_buddy(&mut self, se: EntityId, buddy: Buddy) {
        let mut cursor = Some(se);
        while let Some(s) = cursor {
            let q = self.cfs_rq_of(s);
            *buddy_mut(&mut self.cfs_rqs[q.idx()], buddy) = Some(s);
            cursor = self.entities[s.idx()].parent;
        }
    }

    fn is_idle_policy_task(&self, se: EntityId) -> bool {
        match self.entities[se.idx()].task() {
            Some(pid) => self.tasks[&pid].policy == Policy::Idle,
            None => false,
        }
    }

    pub(crate) fn set_next_buddy(&mut self, se: EntityId) {
        if self.is_idle_policy_task(se) {
            return;
        }
        self.set_buddy(se, Buddy::Next);
    }

    pub(crate) fn set_last_buddy(&mut self, se: EntityId) {
        if self.is_idle_policy_task(se) {
            return;
        }
        self.set_buddy(se, Buddy::Last);
    }

    pub(crate) fn set_skip_buddy(&mut self, se: EntityId) {
        self.set_buddy(se, Buddy::Skip);
    }

    pub(crate) fn dequeue_entity(&mut self, q: CfsRqId, se: EntityId, flags: u32) {
        self.update_curr(q);
        self.dequeue_entity_load_avg(q, se);
        self.clear_buddies(q, se);

        if self.cfs_rqs[q.idx()].curr != Some(se) {
            if let Some(key) = self.entities[se.idx()].tree_key.take() {
                self.cfs_rqs[q.idx()].remove(key);
            }
        }
        self.entities[se.idx()].on_rq = false;
        self.account_entity_dequeue(q, se);

        // Leaving for good or for another CPU: keep vruntime relative so it
        // can be re-based on whatever queue it lands on.
        if flags & DEQUEUE_SLEEP == 0 {
            let min = self.cfs_rqs[q.idx()].min_vruntime;
            let e = &mut self.entities[se.idx()];
            e.vruntime = e.vruntime.sub(min.0);
        }

        self.return_cfs_rq_runtime(q);
        self.update_min_vruntime(q);
        self.update_cfs_shares(q);
    }

    /// Preempt the running entity once it used up its slice, or once it is
    /// a full slice ahead of the leftmost entity.
    fn check_preempt_tick(&mut self, q: CfsRqId, curr: EntityId) {
        let cpu = self.cfs_rqs[q.idx()].cpu;
        let ideal_runtime = self.sched_slice(q, curr);
        let e = &self.entities[curr.idx()];
        let delta_exec = e.sum_exec_runtime.saturating_sub(e.prev_sum_exec_runtime);
        if delta_exec > ideal_runtime {
            self.resched_curr(cpu);
            self.clear_buddies(q, curr);
            return;
        }

        if delta_exec < self.cfg.min_granularity {
            return;
        }

        let Some(first) = self.cfs_rqs[q.idx()].first() else {
            return;
        };
        let delta = self.entities[curr.idx()]
            .vruntime
            .delta(self.entities[first.idx()].vruntime);
        if delta < 0 {
            return;
        }
        if delta as u64 > ideal_runtime {
            self.resched_curr(cpu);
        }
    }

    pub(crate) fn set_next_entity(&mut self, q: CfsRqId, se: EntityId) {
        if self.entities[se.idx()].on_rq {
            if let Some(key) = self.entities[se.idx()].tree_key.take() {
                self.cfs_rqs[q.idx()].remove(key);
            }
            self.update_load_avg(se, true);
        }
        let now = self.rqs[self.cfs_rqs[q.idx()].cpu.idx()].clock_task;
        let e = &mut self.entities[se.idx()];
        e.exec_start = now;
        e.prev_sum_exec_runtime = e.sum_exec_runtime;
        self.cfs_rqs[q.idx()].curr = Some(se);
    }

    /// `1` if `curr` is more than a wakeup granularity ahead of `se`, `0`
    /// if it is ahead by less, `-1` if it is not ahead.
    pub(crate) fn wakeup_preempt_entity(&self, curr: EntityId, se: EntityId) -> i32 {
        let vdiff = self.entities[curr.idx()]
            .vruntime
            .delta(self.entities[se.idx()].vruntime);
        if vdiff <= 0 {
            return -1;
        }
        // Scaled by the wakee's weight so light tasks preempt less eagerly.
        let gran = calc_delta_fair(self.cfg.wakeup_granularity, &self.entities[se.idx()].load);
        if vdiff as u64 > gran {
            return 1;
        }
        0
    }

    /// Choose the entity to run from `q`. `curr` is the entity still
    /// running on it, if any.
    pub(crate) fn pick_next_entity(&mut self, q: CfsRqId, curr: Option<EntityId>) -> Option<EntityId> {
        let cfs_rq = &self.cfs_rqs[q.idx()];
        let left = match (cfs_rq.first(), curr) {
            (None, c) => c,
            (Some(l), Some(c)) if self.entity_before(c, l) => Some(c),
            (l, _) => l,
        }?;
        let mut se = left;

        // Avoid the entity that asked to be skipped, if the runner-up is
        // close enough.
        if cfs_rq.skip == Some(se) {
            let second = if Some(se) == curr {
                cfs_rq.first()
            } else {
                let after = self.entities[se.idx()]
                    .tree_key
                    .and_then(|k| cfs_rq.next_after(k));
                match (after, curr) {
                    (None, c) => c,
                    (Some(s), Some(c)) if self.entity_before(c, s) => Some(c),
                    (s, _) => s,
                }
            };
            if let Some(second) = second {
                if self.wakeup_preempt_entity(second, left) < 1 {
                    se = second;
                }
            }
        }

        // Give the preempted entity its CPU back for cache locality.
        if let Some(last) = cfs_rq.last {
            if self.wakeup_preempt_entity(last, left) < 1 {
                se = last;
            }
        }

        // Someone really wants this to run.
        if let Some(next) = cfs_rq.next {
            if self.wakeup_preempt_entity(next, left) < 1 {
                se = next;
            }
        }

        self.clear_buddies(q, se);
        Some(se)
    }

    pub(crate) fn put_prev_entity(&mut self, q: CfsRqId, prev: EntityId) {
        let on_rq = self.entities[prev.idx()].on_rq;
        if on_rq {
            self.update_curr(q);
        }
        self.check_cfs_rq_runtime(q);
        self.check_spread(q, prev);
        if on_rq {
            let vruntime = self.entities[prev.idx()].vruntime;
            let key = self.cfs_rqs[q.idx()].insert(prev, vruntime);
            self.entities[prev.idx()].tree_key = Some(key);
            self.update_load_avg(prev, false);
        }
        self.cfs_rqs[q.idx()].curr = None;
    }

    fn entity_tick(&mut self, q: CfsRqId, curr: EntityId) {
        self.update_curr(q);
        self.update_load_avg(curr, true);
        self.update_cfs_shares(q);

        if self.cfs_rqs[q.idx()].nr_running > 1 {
            self.check_preempt_tick(q, curr);
        }
    }

    pub(crate) fn task_tick_fair(&mut self, _cpu: CpuId, pid: Pid) {
        let mut cursor = Some(self.task_se(pid));
        while let Some(se) = cursor {
            let q = self.cfs_rq_of(se);
            self.entity_tick(q, se);
            cursor = self.entities[se.idx()].parent;
        }
    }

    pub(crate) fn enqueue_task_fair(&mut self, cpu: CpuId, pid: Pid, flags: u32) {
        let mut flags = flags;
        let mut cursor = Some(self.task_se(pid));

        while let Some(se) = cursor {
            if self.entities[se.idx()].on_rq {
                break;
            }
            let q = self.cfs_rq_of(se);
            self.enqueue_entity(q, se, flags);

            // A throttled queue accounts the task but stops the walk: its
            // parents will see it when the queue is unthrottled.
            if self.cfs_rqs[q.idx()].throttled() {
                break;
            }
            self.cfs_rqs[q.idx()].h_nr_running += 1;
            flags = ENQUEUE_WAKEUP;
            cursor = self.entities[se.idx()].parent;
        }

        while let Some(se) = cursor {
            let q = self.cfs_rq_of(se);
            self.cfs_rqs[q.idx()].h_nr_running += 1;
            if self.cfs_rqs[q.idx()].throttled() {
                break;
            }
            self.update_load_avg(se, true);
            self.update_cfs_shares(q);
            cursor = self.entities[se.idx()].parent;
        }

        if cursor.is_none() {
            self.add_nr_running(cpu, 1);
        }
        self.inc_hmp_sched_stats_fair(pid);
    }

    pub(crate) fn dequeue_task_fair(&mut self, cpu: CpuId, pid: Pid, flags: u32) {
        self.dec_hmp_sched_stats_fair(pid);

        let task_sleep = flags & DEQUEUE_SLEEP != 0;
        let mut flags = flags;
        let mut cursor = Some(self.task_se(pid));

        while let Some(se) = cursor {
            let q = self.cfs_rq_of(se);
            self.dequeue_entity(q, se, flags);

            if self.cfs_rqs[q.idx()].throttled() {
                break;
            }
            let cfs_rq = &mut self.cfs_rqs[q.idx()];
            cfs_rq.h_nr_running = cfs_rq.h_nr_running.saturating_sub(1);

            // Don't dequeue the parent if it has other entities.
            if cfs_rq.load.weight != 0 {
                let throttled = cfs_rq.throttled_hierarchy();
                cursor = self.entities[se.idx()].parent;
                // Bias the next pick towards this queue: the task went to
                // sleep within its slice.
                if let Some(parent) = cursor {
                    if task_sleep && !throttled {
                        self.set_next_buddy(parent);
                    }
                }
                break;
            }
            flags |= DEQUEUE_SLEEP;
            cursor = self.entities[se.idx()].parent;
        }

        while let Some(se) = cursor {
            let q = self.cfs_rq_of(se);
            let cfs_rq = &mut self.cfs_rqs[q.idx()];
            cfs_rq.h_nr_running = cfs_rq.h_nr_running.saturating_sub(1);
            if cfs_rq.throttled() {
                break;
            }
            self.update_load_avg(se, true);
            self.update_cfs_shares(q);
            cursor = self.entities[se.idx()].parent;
        }

        if cursor.is_none() {
            self.sub_nr_running(cpu, 1);
        }
    }

    pub(crate) fn put_prev_task_fair(&mut self, _cpu: CpuId, pid: Pid) {
        let mut cursor = Some(self.task_se(pid));
        while let Some(se) = cursor {
            let q = self.cfs_rq_of(se);
            self.put_prev_entity(q, se);
            cursor = self.entities[se.idx()].parent;
        }
    }

    /// Put `prev` back and pick the next task, balancing in work from other
    /// CPUs when there is none.
    pub(crate) fn pick_next_task_fair(&mut self, cpu: CpuId, prev: Option<Pid>) -> Option<Pid> {
        if let Some(p) = prev {
            self.put_prev_task_fair(cpu, p);
        }

        let mut pulled = false;
        loop {
            let root = self.rqs[cpu.idx()].cfs;
            if self.cfs_rqs[root.idx()].nr_running > 0 {
                let mut q = root;
                loop {
                    let se = self.pick_next_entity(q, None)?;
                    self.set_next_entity(q, se);
                    match self.entities[se.idx()].my_q {
                        Some(child) => q = child,
                        None => return self.entities[se.idx()].task(),
                    }
                }
            }
            if pulled || !self.rqs[cpu.idx()].online {
                return None;
            }
            if self.idle_balance(cpu) == 0 {
                return None;
            }
            pulled = true;
        }
    }

    pub(crate) fn set_curr_task_fair(&mut self, _cpu: CpuId, pid: Pid) {
        let mut cursor = Some(self.task_se(pid));
        while let Some(se) = cursor {
            let q = self.cfs_rq_of(se);
            self.set_next_entity(q, se);
            self.account_cfs_rq_runtime(q, 0);
            cursor = self.entities[se.idx()].parent;
        }
    }

    /// Walk `se` and `pse` up until they sit in the same queue.
    pub(crate) fn find_matching_se(&self, se: EntityId, pse: EntityId) -> (EntityId, EntityId) {
        let (mut se, mut pse) = (se, pse);
        let mut se_depth = self.entities[se.idx()].depth;
        let mut pse_depth = self.entities[pse.idx()].depth;

        while se_depth > pse_depth {
            se_depth -= 1;
            se = self.entities[se.idx()].parent.unwrap_or(se);
        }
        while pse_depth > se_depth {
            pse_depth -= 1;
            pse = self.entities[pse.idx()].parent.unwrap_or(pse);
        }
        while self.cfs_rq_of(se) != self.cfs_rq_of(pse) {
            match (self.entities[se.idx()].parent, self.entities[pse.idx()].parent) {
                (Some(a), Some(b)) => {
                    se = a;
                    pse = b;
                }
                _ => break,
            }
        }
        (se, pse)
    }

    /// Should the just-woken `pid` preempt what runs on `cpu`?
    pub(crate) fn check_preempt_wakeup(&mut self, cpu: CpuId, pid: Pid, wake_flags: u32) {
        let Some(curr_pid) = self.rqs[cpu.idx()].curr else {
            return;
        };
        let curr_se = self.task_se(curr_pid);
        let pse = self.task_se(pid);
        if curr_se == pse {
            return;
        }
        let scale = self.cfs_rqs[self.cfs_rq_of(curr_se).idx()].nr_running as u64
            >= self.cfg.nr_latency;
        let features = self.cfg.features().clone();

        // A throttled wakee cannot run; it is being woken only so that it
        // can be found by the unthrottle.
        if self.cfs_rqs[self.cfs_rq_of(pse).idx()].throttled_hierarchy() {
            return;
        }

        let mut next_buddy_marked = false;
        if features.next_buddy && scale && wake_flags & WF_FORK == 0 {
            self.set_next_buddy(pse);
            next_buddy_marked = true;
        }

        if self.rqs[cpu.idx()].need_resched {
            return;
        }

        let curr_policy = self.tasks[&curr_pid].policy;
        let p_policy = self.tasks[&pid].policy;
        let mut se = curr_se;
        let preempt = if curr_policy == Policy::Idle && p_policy != Policy::Idle {
            true
        } else {
            if p_policy != Policy::Normal || !features.wakeup_preemption {
                return;
            }
            let (s, p) = self.find_matching_se(curr_se, pse);
            se = s;
            self.update_curr(self.cfs_rq_of(se));
            if self.wakeup_preempt_entity(se, p) == 1 {
                if !next_buddy_marked {
                    self.set_next_buddy(p);
                }
                true
            } else {
                false
            }
        };
        if !preempt {
            return;
        }

        self.resched_curr(cpu);
        // Keep the preempted task close by so it can run again soon.
        if !self.entities[se.idx()].on_rq {
            return;
        }
        if features.last_buddy && scale && self.entities[se.idx()].is_task() {
            self.set_last_buddy(se);
        }
    }

    pub(crate) fn yield_task_fair(&mut self, cpu: CpuId) {
        let rq = &self.rqs[cpu.idx()];
        let Some(curr) = rq.curr else {
            return;
        };
        // Nothing else to run.
        if rq.nr_running == 1 {
            return;
        }
        let se = self.task_se(curr);
        let q = self.cfs_rq_of(se);
        self.clear_buddies(q, se);

        if self.tasks[&curr].policy != Policy::Batch {
            self.update_rq_clock(cpu);
            self.update_curr(q);
        }
        self.set_skip_buddy(se);
    }

    pub(crate) fn yield_to_task_fair(&mut self, cpu: CpuId, pid: Pid) -> bool {
        let se = self.task_se(pid);
        if !self.entities[se.idx()].on_rq
            || self.cfs_rqs[self.cfs_rq_of(se).idx()].throttled_hierarchy()
        {
            return false;
        }
        self.set_next_buddy(se);
        self.yield_task_fair(cpu);
        true
    }

    /// Place a newly forked task relative to what runs on `cpu`. Leaves its
    /// vruntime relative so it can be enqueued anywhere.
    pub(crate) fn task_fork_fair(&mut self, pid: Pid, cpu: CpuId) {
        self.update_rq_clock(cpu);
        let se = self.task_se(pid);
        let q = self.cfs_rq_of(se);
        let curr = self.cfs_rqs[q.idx()].curr;
        self.update_curr(q);

        if let Some(c) = curr {
            self.entities[se.idx()].vruntime = self.entities[c.idx()].vruntime;
        }
        self.place_entity(q, se, true);

        if let Some(c) = curr {
            if self.cfg.tunables.child_runs_first && self.entity_before(c, se) {
                let cv = self.entities[c.idx()].vruntime;
                let sv = self.entities[se.idx()].vruntime;
                self.entities[c.idx()].vruntime = sv;
                self.entities[se.idx()].vruntime = cv;
                self.resched_curr(cpu);
            }
        }

        let min = self.cfs_rqs[q.idx()].min_vruntime;
        let e = &mut self.entities[se.idx()];
        e.vruntime = e.vruntime.sub(min.0);
    }

    /// The task's weight changed from `old_weight`.
    pub(crate) fn prio_changed_fair(&mut self, cpu: CpuId, pid: Pid, old_weight: u64) {
        let task = &self.tasks[&pid];
        if !task.on_rq {
            return;
        }
        let weight = self.entities[task.se.idx()].load.weight;
        if self.rqs[cpu.idx()].curr == Some(pid) {
            if weight < old_weight {
                self.resched_curr(cpu);
            }
        } else {
            self.check_preempt_curr(cpu, pid, 0);
        }
    }

    /// Is the task's vruntime currently stored relative to its queue?
    fn vruntime_normalized(&self, pid: Pid) -> bool {
        let task = &self.tasks[&pid];
        if task.on_rq || task.state == TaskState::Waking {
            return true;
        }
        // A forked child that never ran is still relative.
        self.entities[task.se.idx()].sum_exec_runtime == 0
    }

    fn detach_task_cfs_rq(&mut self, pid: Pid) {
        let se = self.task_se(pid);
        let q = self.cfs_rq_of(se);
        if !self.vruntime_normalized(pid) {
            // Take the sleeper credit now and make it relative.
            self.place_entity(q, se, false);
            let min = self.cfs_rqs[q.idx()].min_vruntime;
            let e = &mut self.entities[se.idx()];
            e.vruntime = e.vruntime.sub(min.0);
        }
        self.detach_entity_load_avg(q, se);
    }

    fn attach_task_cfs_rq(&mut self, pid: Pid) {
        let se = self.task_se(pid);
        let q = self.cfs_rq_of(se);
        self.entities[se.idx()].depth = self.entity_depth(se);
        self.attach_entity_load_avg(q, se);
        if !self.vruntime_normalized(pid) {
            let min = self.cfs_rqs[q.idx()].min_vruntime;
            let e = &mut self.entities[se.idx()];
            e.vruntime = e.vruntime.add(min.0);
        }
    }

    /// The task leaves the fair class. It must not be queued.
    pub fn switched_from_fair(&mut self, pid: Pid) {
        if !self.tasks.contains_key(&pid) {
            return;
        }
        self.detach_task_cfs_rq(pid);
    }

    /// The task joins the fair class.
    pub fn switched_to_fair(&mut self, pid: Pid) {
        let Some(task) = self.tasks.get(&pid) else {
            return;
        };
        let (cpu, on_rq) = (task.cpu, task.on_rq);
        self.attach_task_cfs_rq(pid);
        if on_rq {
            if self.rqs[cpu.idx()].curr == Some(pid) {
                self.resched_curr(cpu);
            } else {
                self.check_preempt_curr(cpu, pid, 0);
            }
        }
    }

    pub(crate) fn task_move_group_fair(&mut self, pid: Pid, group: GroupId) {
        self.detach_task_cfs_rq(pid);
        let cpu = {
            let task = self.tasks.get_mut(&pid);
            match task {
                Some(t) => {
                    t.group = group;
                    t.cpu
                }
                None => return,
            }
        };
        self.set_task_rq(pid, cpu);
        let se = self.task_se(pid);
        self.entities[se.idx()].avg.last_update_time = 0;
        self.attach_task_cfs_rq(pid);
    }

    pub(crate) fn get_rr_interval_fair(&self, pid: Pid) -> TimeNs {
        let Some(task) = self.tasks.get(&pid) else {
            return 0;
        };
        let root = self.rqs[task.cpu.idx()].cfs;
        if self.cfs_rqs[root.idx()].load.weight == 0 {
            return 0;
        }
        self.sched_slice(self.cfs_rq_of(task.se), task.se)
    }

    /// Make the waking task's vruntime relative and note who woke it.
    pub(crate) fn task_waking_fair(&mut self, pid: Pid, waker: Option<Pid>) {
        let se = self.task_se(pid);
        let min = self.cfs_rqs[self.cfs_rq_of(se).idx()].min_vruntime;
        let e = &mut self.entities[se.idx()];
        e.vruntime = e.vruntime.sub(min.0);
        if let Some(w) = waker {
            self.record_wakee(w, pid);
        }
    }

    fn record_wakee(&mut self, waker: Pid, wakee: Pid) {
        let now = self.now;
        let Some(w) = self.tasks.get_mut(&waker) else {
            return;
        };
        // Decay the flip count once a second so it tracks recent behavior.
        if now > w.wakee_flip_decay_ts + NSEC_PER_SEC {
            w.wakee_flips >>= 1;
            w.wakee_flip_decay_ts = now;
        }
        if w.last_wakee != Some(wakee) {
            w.last_wakee = Some(wakee);
            w.wakee_flips += 1;
        }
    }

    pub(crate) fn migrate_task_rq_fair(&mut self, pid: Pid) {
        let se = self.task_se(pid);
        self.remove_entity_load_avg(se);
        let e = &mut self.entities[se.idx()];
        // Re-attached on the destination by the next enqueue.
        e.avg.last_update_time = 0;
        e.exec_start = 0;
    }

    pub(crate) fn task_dead_fair(&mut self, pid: Pid) {
        let se = self.task_se(pid);
        self.remove_entity_load_avg(se);
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Tunables;
    use crate::entity::DEQUEUE_SLEEP;
    use crate::sched::FairSched;
    use crate::task::{Phase, TaskBehavior, TaskDef};
    use crate::topology::TopologySpec;
    use crate::types::{CpuId, Pid, NSEC_PER_MSEC, NSEC_PER_USEC};

    fn busy(pid: i32) -> TaskDef {
        let mut def = TaskDef::new(
            &format!("t{pid}"),
            Pid(pid),
            TaskBehavior {
                phases: vec![Phase::Run(u64::MAX / 4)],
                repeat: false,
            },
        );
        def.start_cpu = Some(CpuId(0));
        def
    }

    fn single_cpu() -> FairSched {
        FairSched::new(&TopologySpec::smp(1), Tunables::default()).unwrap()
    }

    #[test]
    fn test_slice_splits_latency() {
        let mut s = single_cpu();
        for pid in 1..=4 {
            s.fork_task(&busy(pid)).unwrap();
        }
        // One CPU: no latency scaling, 6ms split four ways.
        let slice = s.get_rr_interval(Pid(1));
        assert!(slice.abs_diff(1500 * NSEC_PER_USEC) < 10, "{slice}");
    }

    #[test]
    fn test_slice_clamps_to_min_granularity() {
        let mut s = single_cpu();
        for pid in 1..=10 {
            s.fork_task(&busy(pid)).unwrap();
        }
        let slice = s.get_rr_interval(Pid(1));
        assert!(slice.abs_diff(750 * NSEC_PER_USEC) < 10, "{slice}");
    }

    #[test]
    fn test_min_vruntime_monotonic() {
        let mut s = single_cpu();
        s.fork_task(&busy(1)).unwrap();
        s.fork_task(&busy(2)).unwrap();
        let root = s.rqs[0].cfs;
        let mut last = s.cfs_rqs[root.idx()].min_vruntime;
        for i in 1..50u64 {
            s.set_clock(i * NSEC_PER_MSEC);
            s.scheduler_tick(CpuId(0));
            if s.need_resched(CpuId(0)) || s.curr(CpuId(0)).is_none() {
                s.schedule(CpuId(0));
            }
            let min = s.cfs_rqs[root.idx()].min_vruntime;
            assert!(min >= last);
            last = min;
        }
    }

    #[test]
    fn test_running_entity_not_in_tree() {
        let mut s = single_cpu();
        s.fork_task(&busy(1)).unwrap();
        s.fork_task(&busy(2)).unwrap();
        let curr = s.schedule(CpuId(0)).unwrap();
        let root = s.rqs[0].cfs;
        let se = s.task_se(curr);
        assert_eq!(s.cfs_rqs[root.idx()].curr, Some(se));
        assert!(s.cfs_rqs[root.idx()].queued().all(|e| e != se));
        assert_eq!(s.cfs_rqs[root.idx()].tree_len(), 1);
        assert_eq!(s.cfs_rqs[root.idx()].nr_running, 2);
    }

    #[test]
    fn test_switching_class_moves_load() {
        let mut s = single_cpu();
        s.fork_task(&busy(1)).unwrap();
        s.fork_task(&busy(2)).unwrap();
        s.dequeue_task(CpuId(0), Pid(2), DEQUEUE_SLEEP);
        let root = s.rqs[0].cfs;
        let before = s.cfs_rqs[root.idx()].avg.load_avg;

        s.switched_from_fair(Pid(2));
        let detached = s.cfs_rqs[root.idx()].avg.load_avg;
        assert!(detached < before, "{detached} vs {before}");

        s.switched_to_fair(Pid(2));
        assert!(s.cfs_rqs[root.idx()].avg.load_avg > detached);
    }
}
