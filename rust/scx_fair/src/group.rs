// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Task groups.
//!
//! A group owns one queue per CPU. For every group but the root, each of
//! those queues is represented in the parent group's queue on the same CPU
//! by a group entity whose weight is the group's share on that CPU.

use std::sync::atomic::{AtomicI64, Ordering};

use tracing::debug;
use tracing::info;

use crate::bandwidth::CfsBandwidth;
use crate::cfs_rq::CfsRq;
use crate::config::ConfigError;
use crate::entity::{EntityOwner, SchedEntity};
use crate::pelt::init_entity_runnable_average;
use crate::sched::FairSched;
use crate::types::{CfsRqId, CpuId, EntityId, GroupId};
use crate::weight::{LoadWeight, NICE_0_LOAD};

pub const MIN_SHARES: u64 = 2;
pub const MAX_SHARES: u64 = 1 << 18;
pub const ROOT_TASK_GROUP_LOAD: u64 = NICE_0_LOAD;

#[derive(Debug)]
pub struct TaskGroup {
    pub id: GroupId,
    pub name: String,
    pub parent: Option<GroupId>,
    pub children: Vec<GroupId>,
    pub shares: u64,
    /// Sum of the load published by this group's per-CPU queues.
    pub load_avg: AtomicI64,
    /// Per-CPU queue, indexed by CPU.
    pub cfs_rq: Vec<CfsRqId>,
    /// Per-CPU group entity, indexed by CPU. `None` for the root group.
    pub se: Vec<Option<EntityId>>,
    pub bandwidth: CfsBandwidth,
    /// Keep this group's tasks off the big cluster.
    pub upmigrate_discouraged: bool,
}

impl TaskGroup {
    pub fn new(id: GroupId, name: &str, parent: Option<GroupId>) -> Self {
        Self {
            id,
            name: name.to_string(),
            parent,
            children: Vec::new(),
            shares: ROOT_TASK_GROUP_LOAD,
            load_avg: AtomicI64::new(0),
            cfs_rq: Vec::new(),
            se: Vec::new(),
            bandwidth: CfsBandwidth::default(),
            upmigrate_discouraged: false,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn load(&self) -> i64 {
        self.load_avg.load(Ordering::Relaxed)
    }

    pub fn add_load(&self, delta: i64) {
        self.load_avg.fetch_add(delta, Ordering::Relaxed);
    }
}

impl FairSched {
    /// Create a child group of `parent` with default shares and no quota.
    pub fn create_group(&mut self, name: &str, parent: GroupId) -> Result<GroupId, ConfigError> {
        if parent.idx() >= self.groups.len() {
            return Err(ConfigError::UnknownGroup(parent));
        }
        let id = GroupId(self.groups.len() as u32);
        let mut tg = TaskGroup::new(id, name, Some(parent));

        for cpu in 0..self.nr_cpus() {
            let cpu_id = CpuId(cpu as u32);
            let q = CfsRqId(self.cfs_rqs.len() as u32);
            let se = EntityId(self.entities.len() as u32);
            let parent_q = self.groups[parent.idx()].cfs_rq[cpu];
            let parent_se = self.groups[parent.idx()].se[cpu];

            let load = LoadWeight::new(NICE_0_LOAD);
            let mut entity = SchedEntity::new(EntityOwner::Group { group: id, cpu: cpu_id }, parent_q, load);
            entity.parent = parent_se;
            entity.my_q = Some(q);
            entity.depth = parent_se.map_or(0, |p| self.entities[p.idx()].depth + 1);
            init_entity_runnable_average(&mut entity.avg, load.weight, 0);
            self.entities.push(entity);

            self.cfs_rqs.push(CfsRq::new(cpu_id, id, Some(se)));
            tg.cfs_rq.push(q);
            tg.se.push(Some(se));
        }

        self.groups[parent.idx()].children.push(id);
        self.groups.push(tg);
        debug!(group = id.0, parent = parent.0, name, "group created");
        Ok(id)
    }

    pub fn group_by_name(&self, name: &str) -> Option<GroupId> {
        self.groups.iter().find(|g| g.name == name).map(|g| g.id)
    }

    /// Weight the group entity above `q` should carry: the group's shares
    /// split in proportion to how much of the group's load sits on `q`.
    pub(crate) fn calc_cfs_shares(&self, q: CfsRqId) -> u64 {
        let cfs_rq = &self.cfs_rqs[q.idx()];
        let tg = &self.groups[cfs_rq.group.idx()];
        let load = cfs_rq.load.weight;
        let tg_weight = (tg.load() - cfs_rq.tg_load_avg_contrib as i64 + load as i64).max(0) as u64;

        let mut shares = tg.shares * load;
        if tg_weight != 0 {
            shares /= tg_weight;
        }
        shares.clamp(MIN_SHARES, tg.shares.max(MIN_SHARES))
    }

    pub(crate) fn reweight_entity(&mut self, q: CfsRqId, se: EntityId, weight: u64) {
        let on_rq = self.entities[se.idx()].on_rq;
        if on_rq {
            if self.cfs_rqs[q.idx()].curr == Some(se) {
                self.update_curr(q);
            }
            self.account_entity_dequeue(q, se);
        }
        self.entities[se.idx()].load.set(weight);
        if on_rq {
            self.account_entity_enqueue(q, se);
        }
    }

    /// Re-derive the weight of the group entity representing `q`.
    pub(crate) fn update_cfs_shares(&mut self, q: CfsRqId) {
        let cfs_rq = &self.cfs_rqs[q.idx()];
        let Some(se) = cfs_rq.se else {
            return;
        };
        if cfs_rq.throttled_hierarchy() {
            return;
        }
        let shares = self.calc_cfs_shares(q);
        let parent_q = self.cfs_rq_of(se);
        self.reweight_entity(parent_q, se, shares);
    }

    /// Set the group's shares, clamped to [`MIN_SHARES`, `MAX_SHARES`].
    pub fn set_shares(&mut self, group: GroupId, shares: u64) -> Result<(), ConfigError> {
        let Some(tg) = self.groups.get(group.idx()) else {
            return Err(ConfigError::UnknownGroup(group));
        };
        if tg.is_root() {
            return Err(ConfigError::RootGroup);
        }
        let shares = shares.clamp(MIN_SHARES, MAX_SHARES);
        if tg.shares == shares {
            return Ok(());
        }
        self.groups[group.idx()].shares = shares;

        for cpu in 0..self.nr_cpus() {
            self.update_rq_clock(CpuId(cpu as u32));
            let mut cursor = self.groups[group.idx()].se[cpu];
            while let Some(se) = cursor {
                self.update_load_avg(se, false);
                if let Some(my_q) = self.entities[se.idx()].my_q {
                    self.update_cfs_shares(my_q);
                }
                cursor = self.entities[se.idx()].parent;
            }
        }
        info!(group = group.0, shares, "shares updated");
        Ok(())
    }

    /// Keep the group's tasks off the highest-capacity cluster.
    pub fn set_upmigrate_discouraged(&mut self, group: GroupId, discouraged: bool) -> Result<(), ConfigError> {
        let Some(tg) = self.groups.get_mut(group.idx()) else {
            return Err(ConfigError::UnknownGroup(group));
        };
        tg.upmigrate_discouraged = discouraged;
        Ok(())
    }

    pub(crate) fn group_upmigrate_discouraged(&self, group: GroupId) -> bool {
        self.groups[group.idx()].upmigrate_discouraged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tunables;
    use crate::topology::TopologySpec;

    #[test]
    fn test_create_nested_groups() {
        let mut s = FairSched::new(&TopologySpec::smp(2), Tunables::default()).unwrap();
        let a = s.create_group("a", GroupId::ROOT).unwrap();
        let b = s.create_group("b", a).unwrap();
        assert_eq!(s.groups[a.idx()].children, vec![b]);
        let se_b = s.groups[b.idx()].se[1].unwrap();
        let se_a = s.groups[a.idx()].se[1].unwrap();
        assert_eq!(s.entities[se_b.idx()].parent, Some(se_a));
        assert_eq!(s.entities[se_b.idx()].depth, 1);
        assert_eq!(s.group_by_name("b"), Some(b));
        assert_eq!(
            s.create_group("x", GroupId(42)),
            Err(ConfigError::UnknownGroup(GroupId(42)))
        );
    }

    #[test]
    fn test_set_shares_clamps() {
        let mut s = FairSched::new(&TopologySpec::smp(1), Tunables::default()).unwrap();
        let a = s.create_group("a", GroupId::ROOT).unwrap();
        s.set_shares(a, 1).unwrap();
        assert_eq!(s.groups[a.idx()].shares, MIN_SHARES);
        s.set_shares(a, u64::MAX).unwrap();
        assert_eq!(s.groups[a.idx()].shares, MAX_SHARES);
        assert_eq!(s.set_shares(GroupId::ROOT, 2048), Err(ConfigError::RootGroup));
    }

    #[test]
    fn test_calc_shares_single_cpu_gets_all() {
        let mut s = FairSched::new(&TopologySpec::smp(1), Tunables::default()).unwrap();
        let a = s.create_group("a", GroupId::ROOT).unwrap();
        let q = s.groups[a.idx()].cfs_rq[0];
        s.cfs_rqs[q.idx()].load.set(2048);
        // Nothing published yet: this queue holds the group's whole weight.
        assert_eq!(s.calc_cfs_shares(q), NICE_0_LOAD);
    }
}
