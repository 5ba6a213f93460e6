// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Newtype wrappers and type aliases for domain concepts.
//!
//! Identifiers for CPUs, tasks, groups, and the arena slots that hold
//! entities and queues are all distinct newtypes so that an entity index can
//! never be passed where a queue index is expected. Plain quantities
//! (timestamps) stay as type aliases.

use serde::{Deserialize, Serialize};

/// Process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pid(pub i32);

/// CPU identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CpuId(pub u32);

impl CpuId {
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

/// Task group (control group) identifier. `GroupId::ROOT` always exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub u32);

impl GroupId {
    pub const ROOT: GroupId = GroupId(0);

    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

/// Index of a schedulable entity in the entity arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u32);

impl EntityId {
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

/// Index of a fair run-queue in the queue arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CfsRqId(pub u32);

impl CfsRqId {
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

/// Cluster (capacity class / frequency domain) identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId(pub u32);

/// Memory node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Related-thread group identifier (co-location).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelatedGroupId(pub u32);

/// Simulated time in nanoseconds.
pub type TimeNs = u64;

pub const NSEC_PER_USEC: u64 = 1_000;
pub const NSEC_PER_MSEC: u64 = 1_000_000;
pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Scheduler tick period (HZ=250).
pub const TICK_NSEC: TimeNs = 4 * NSEC_PER_MSEC;

/// Virtual runtime (weight-normalized nanoseconds).
///
/// Ordering uses wrapping comparison (like the kernel's `time_before64`),
/// so `Vtime(u64::MAX)` compares as less than `Vtime(0)` when they are
/// within half the u64 range of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Vtime(pub u64);

impl PartialOrd for Vtime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Vtime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // (s64)(a - b) < 0 means a < b.
        (self.0.wrapping_sub(other.0) as i64).cmp(&0)
    }
}

impl Vtime {
    /// Signed distance `self - other`.
    pub fn delta(self, other: Vtime) -> i64 {
        self.0.wrapping_sub(other.0) as i64
    }

    pub fn add(self, ns: u64) -> Vtime {
        Vtime(self.0.wrapping_add(ns))
    }

    pub fn sub(self, ns: u64) -> Vtime {
        Vtime(self.0.wrapping_sub(ns))
    }
}

/// Wrap-safe `max` on virtual time.
pub fn max_vruntime(a: Vtime, b: Vtime) -> Vtime {
    if b.delta(a) > 0 {
        b
    } else {
        a
    }
}

/// Wrap-safe `min` on virtual time.
pub fn min_vruntime(a: Vtime, b: Vtime) -> Vtime {
    if b.delta(a) < 0 {
        b
    } else {
        a
    }
}

/// Where a CPU stands when it balances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CpuIdleType {
    /// The CPU is idle and balancing from the periodic tick.
    Idle,
    /// The CPU is busy.
    NotIdle,
    /// The CPU is about to go idle.
    NewlyIdle,
}

/// Scheduling policy of a fair-class task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    #[default]
    Normal,
    Batch,
    Idle,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vtime_wraps() {
        assert!(Vtime(u64::MAX) < Vtime(0));
        assert!(Vtime(5) > Vtime(u64::MAX - 5));
        assert_eq!(max_vruntime(Vtime(u64::MAX), Vtime(1)), Vtime(1));
        assert_eq!(min_vruntime(Vtime(u64::MAX), Vtime(1)), Vtime(u64::MAX));
        assert_eq!(Vtime(3).delta(Vtime(5)), -2);
    }
}
