// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Fair run-queues.
//!
//! A `CfsRq` holds the runnable entities of one group on one CPU, ordered
//! by virtual runtime. The running entity is tracked in `curr` and is not
//! part of the tree while it runs. Each CPU has one root queue, and each
//! non-root group adds one queue per CPU.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::bandwidth::BandwidthLimiter;
use crate::pelt::{RunnableAvg, SchedAvg};
use crate::types::{CpuId, EntityId, GroupId, TimeNs, Vtime};
use crate::weight::LoadWeight;

/// Initial `min_vruntime`, chosen so that wrap-around bugs show up early.
pub const INIT_MIN_VRUNTIME: Vtime = Vtime((-(1i64 << 20)) as u64);

/// Per-queue HMP task accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HmpStats {
    pub nr_big_tasks: u32,
    pub nr_small_tasks: u32,
    /// Sum of the demand of the runnable tasks.
    pub cumulative_runnable_avg: u64,
}

/// What a single task adds to [`HmpStats`]. Stored on the task when it is
/// counted so that removal always subtracts what was added.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HmpContrib {
    pub big: bool,
    pub small: bool,
    pub demand: u64,
}

impl HmpStats {
    pub fn inc(&mut self, c: &HmpContrib) {
        self.nr_big_tasks += c.big as u32;
        self.nr_small_tasks += c.small as u32;
        self.cumulative_runnable_avg += c.demand;
    }

    pub fn dec(&mut self, c: &HmpContrib) {
        self.nr_big_tasks = self.nr_big_tasks.saturating_sub(c.big as u32);
        self.nr_small_tasks = self.nr_small_tasks.saturating_sub(c.small as u32);
        self.cumulative_runnable_avg = self.cumulative_runnable_avg.saturating_sub(c.demand);
    }

    /// Fold in the stats of a whole queue coming back from throttling.
    pub fn add_stats(&mut self, other: &HmpStats) {
        self.nr_big_tasks += other.nr_big_tasks;
        self.nr_small_tasks += other.nr_small_tasks;
        self.cumulative_runnable_avg += other.cumulative_runnable_avg;
    }

    pub fn sub_stats(&mut self, other: &HmpStats) {
        self.nr_big_tasks = self.nr_big_tasks.saturating_sub(other.nr_big_tasks);
        self.nr_small_tasks = self.nr_small_tasks.saturating_sub(other.nr_small_tasks);
        self.cumulative_runnable_avg = self
            .cumulative_runnable_avg
            .saturating_sub(other.cumulative_runnable_avg);
    }
}

#[derive(Debug)]
pub struct CfsRq {
    pub cpu: CpuId,
    pub group: GroupId,
    /// Group entity that stands for this queue in its parent, `None` for a
    /// CPU's root queue.
    pub se: Option<EntityId>,
    pub load: LoadWeight,
    pub nr_running: u32,
    /// Runnable tasks in this queue and every queue below it.
    pub h_nr_running: u32,
    pub min_vruntime: Vtime,
    tree: BTreeMap<(Vtime, u64), EntityId>,
    leftmost: Option<EntityId>,
    seq: u64,
    pub curr: Option<EntityId>,
    pub next: Option<EntityId>,
    pub last: Option<EntityId>,
    pub skip: Option<EntityId>,
    pub avg: SchedAvg,
    pub runnable: RunnableAvg,
    /// Load of entities that left while this queue's clock was not held,
    /// folded in on the next update.
    pub removed_load_avg: AtomicU64,
    pub removed_util_avg: AtomicU64,
    /// Load last published to the group total.
    pub tg_load_avg_contrib: u64,
    pub h_load: u64,
    pub last_h_load_update: TimeNs,
    pub hmp_stats: HmpStats,
    pub runtime: BandwidthLimiter,
    /// Whether the queue has load that still needs decaying.
    pub on_list: bool,
    pub nr_spread_over: u64,
}

impl CfsRq {
    pub fn new(cpu: CpuId, group: GroupId, se: Option<EntityId>) -> Self {
        Self {
            cpu,
            group,
            se,
            load: LoadWeight::default(),
            nr_running: 0,
            h_nr_running: 0,
            min_vruntime: INIT_MIN_VRUNTIME,
            tree: BTreeMap::new(),
            leftmost: None,
            seq: 0,
            curr: None,
            next: None,
            last: None,
            skip: None,
            avg: SchedAvg::default(),
            runnable: RunnableAvg::default(),
            removed_load_avg: AtomicU64::new(0),
            removed_util_avg: AtomicU64::new(0),
            tg_load_avg_contrib: 0,
            h_load: 0,
            last_h_load_update: 0,
            hmp_stats: HmpStats::default(),
            runtime: BandwidthLimiter::default(),
            on_list: false,
            nr_spread_over: 0,
        }
    }

    /// Insert `se` with key `vruntime`. Returns the key to remove it by.
    pub fn insert(&mut self, se: EntityId, vruntime: Vtime) -> (Vtime, u64) {
        self.seq += 1;
        let key = (vruntime, self.seq);
        self.tree.insert(key, se);
        self.leftmost = self.tree.first_key_value().map(|(_, &id)| id);
        key
    }

    pub fn remove(&mut self, key: (Vtime, u64)) {
        self.tree.remove(&key);
        self.leftmost = self.tree.first_key_value().map(|(_, &id)| id);
    }

    pub fn first(&self) -> Option<EntityId> {
        self.leftmost
    }

    pub fn last_entity(&self) -> Option<EntityId> {
        self.tree.last_key_value().map(|(_, &id)| id)
    }

    /// Entity following the one stored under `key`.
    pub fn next_after(&self, key: (Vtime, u64)) -> Option<EntityId> {
        use std::ops::Bound::{Excluded, Unbounded};
        self.tree
            .range((Excluded(key), Unbounded))
            .next()
            .map(|(_, &id)| id)
    }

    pub fn queued(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.tree.values().copied()
    }

    pub fn tree_len(&self) -> usize {
        self.tree.len()
    }

    pub fn throttled(&self) -> bool {
        self.runtime.throttled
    }

    pub fn throttled_hierarchy(&self) -> bool {
        self.runtime.throttle_count > 0
    }

    /// Record load of an entity that is leaving.
    pub fn queue_removed(&self, load_avg: u64, util_avg: u64) {
        self.removed_load_avg.fetch_add(load_avg, Ordering::Relaxed);
        self.removed_util_avg.fetch_add(util_avg, Ordering::Relaxed);
    }

    pub fn take_removed(&self) -> (u64, u64) {
        (
            self.removed_load_avg.swap(0, Ordering::Relaxed),
            self.removed_util_avg.swap(0, Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_order_and_leftmost() {
        let mut q = CfsRq::new(CpuId(0), GroupId::ROOT, None);
        let k1 = q.insert(EntityId(1), Vtime(300));
        let k2 = q.insert(EntityId(2), Vtime(100));
        let _k3 = q.insert(EntityId(3), Vtime(100));
        assert_eq!(q.first(), Some(EntityId(2)));
        // Equal keys keep insertion order.
        assert_eq!(q.next_after(k2), Some(EntityId(3)));
        assert_eq!(q.last_entity(), Some(EntityId(1)));
        q.remove(k2);
        assert_eq!(q.first(), Some(EntityId(3)));
        q.remove(k1);
        assert_eq!(q.tree_len(), 1);
    }

    #[test]
    fn test_tree_handles_wrapped_vruntime() {
        let mut q = CfsRq::new(CpuId(0), GroupId::ROOT, None);
        q.insert(EntityId(1), Vtime(5));
        q.insert(EntityId(2), INIT_MIN_VRUNTIME);
        assert_eq!(q.first(), Some(EntityId(2)));
    }

    #[test]
    fn test_removed_load_is_taken_once() {
        let q = CfsRq::new(CpuId(0), GroupId::ROOT, None);
        q.queue_removed(100, 10);
        q.queue_removed(50, 5);
        assert_eq!(q.take_removed(), (150, 15));
        assert_eq!(q.take_removed(), (0, 0));
    }

    #[test]
    fn test_hmp_stats_saturate() {
        let mut s = HmpStats::default();
        let c = HmpContrib {
            big: true,
            small: false,
            demand: 100,
        };
        s.inc(&c);
        s.dec(&c);
        s.dec(&c);
        assert_eq!(s, HmpStats::default());
    }
}
