// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Schedulable entities.
//!
//! An entity is either a task or the stand-in of a group's per-CPU queue
//! inside its parent queue. Entities live in an arena owned by
//! `FairSched`; queues refer to them by [`EntityId`].

use crate::pelt::SchedAvg;
use crate::types::{CfsRqId, CpuId, EntityId, GroupId, Pid, TimeNs, Vtime};
use crate::weight::LoadWeight;

pub const ENQUEUE_WAKEUP: u32 = 0x01;
pub const ENQUEUE_WAKING: u32 = 0x04;
/// The entity is arriving from another CPU with relative vruntime.
pub const ENQUEUE_MIGRATING: u32 = 0x08;

pub const DEQUEUE_SLEEP: u32 = 0x01;
pub const DEQUEUE_MIGRATING: u32 = 0x08;

pub const WF_SYNC: u32 = 0x01;
pub const WF_FORK: u32 = 0x02;
pub const WF_MIGRATED: u32 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityOwner {
    Task(Pid),
    /// Stand-in for `group`'s queue on `cpu`.
    Group { group: GroupId, cpu: CpuId },
}

#[derive(Debug, Clone)]
pub struct SchedEntity {
    pub load: LoadWeight,
    pub vruntime: Vtime,
    pub exec_start: TimeNs,
    pub sum_exec_runtime: u64,
    pub prev_sum_exec_runtime: u64,
    pub nr_migrations: u64,
    pub on_rq: bool,
    /// Key under which the entity sits in its queue's tree, if it does.
    pub tree_key: Option<(Vtime, u64)>,
    pub depth: u32,
    /// Group entity one level up, `None` at the top level.
    pub parent: Option<EntityId>,
    /// Queue this entity is (or would be) queued on.
    pub cfs_rq: CfsRqId,
    /// Queue this entity represents, for group entities.
    pub my_q: Option<CfsRqId>,
    pub avg: SchedAvg,
    pub owner: EntityOwner,
}

impl SchedEntity {
    pub fn new(owner: EntityOwner, cfs_rq: CfsRqId, load: LoadWeight) -> Self {
        Self {
            load,
            vruntime: Vtime(0),
            exec_start: 0,
            sum_exec_runtime: 0,
            prev_sum_exec_runtime: 0,
            nr_migrations: 0,
            on_rq: false,
            tree_key: None,
            depth: 0,
            parent: None,
            cfs_rq,
            my_q: None,
            avg: SchedAvg::default(),
            owner,
        }
    }

    pub fn task(&self) -> Option<Pid> {
        match self.owner {
            EntityOwner::Task(pid) => Some(pid),
            EntityOwner::Group { .. } => None,
        }
    }

    pub fn is_task(&self) -> bool {
        self.task().is_some()
    }
}
