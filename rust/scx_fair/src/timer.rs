// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! One-shot timers owned by the scheduler core.
//!
//! The core never runs callbacks itself. It arms and cancels entries here,
//! and the driver asks for [`TimerQueue::next_expiry`] and hands expired
//! entries back through `FairSched::run_timers`. A timer kind can be armed
//! at most once; re-arming moves it.

use std::collections::BTreeMap;

use crate::types::{GroupId, TimeNs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    /// Quota refill at the end of a group's bandwidth period.
    BandwidthPeriod(GroupId),
    /// Deferred redistribution of runtime returned by idle queues.
    BandwidthSlack(GroupId),
}

#[derive(Debug, Default, Clone)]
pub struct TimerQueue {
    armed: BTreeMap<TimerKind, TimeNs>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, kind: TimerKind, expires: TimeNs) {
        self.armed.insert(kind, expires);
    }

    /// Returns whether the timer was armed.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.armed.remove(&kind).is_some()
    }

    pub fn is_active(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    pub fn expires(&self, kind: TimerKind) -> Option<TimeNs> {
        self.armed.get(&kind).copied()
    }

    /// Time left until `kind` fires, negative if it is overdue.
    pub fn remaining(&self, kind: TimerKind, now: TimeNs) -> Option<i64> {
        self.expires(kind).map(|e| e as i64 - now as i64)
    }

    pub fn next_expiry(&self) -> Option<TimeNs> {
        self.armed.values().copied().min()
    }

    /// Disarm and return every timer due at `now`, earliest first.
    pub fn pop_expired(&mut self, now: TimeNs) -> Vec<(TimerKind, TimeNs)> {
        let mut due: Vec<(TimerKind, TimeNs)> = self
            .armed
            .iter()
            .filter(|(_, &t)| t <= now)
            .map(|(&k, &t)| (k, t))
            .collect();
        due.sort_by_key(|&(k, t)| (t, k));
        for (k, _) in &due {
            self.armed.remove(k);
        }
        due
    }
}

/// Advance a periodic expiry past `now`. Returns the new expiry and the
/// number of whole periods that elapsed, zero if `expiry` is still ahead.
pub fn forward(expiry: TimeNs, now: TimeNs, interval: TimeNs) -> (TimeNs, u64) {
    if now < expiry || interval == 0 {
        return (expiry, 0);
    }
    let overrun = (now - expiry) / interval + 1;
    (expiry + overrun * interval, overrun)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_expired_order() {
        let mut q = TimerQueue::new();
        q.arm(TimerKind::BandwidthSlack(GroupId(1)), 30);
        q.arm(TimerKind::BandwidthPeriod(GroupId(2)), 10);
        q.arm(TimerKind::BandwidthPeriod(GroupId(1)), 50);
        assert_eq!(q.next_expiry(), Some(10));
        let due = q.pop_expired(30);
        assert_eq!(
            due,
            vec![
                (TimerKind::BandwidthPeriod(GroupId(2)), 10),
                (TimerKind::BandwidthSlack(GroupId(1)), 30),
            ]
        );
        assert!(q.is_active(TimerKind::BandwidthPeriod(GroupId(1))));
        assert_eq!(q.remaining(TimerKind::BandwidthPeriod(GroupId(1)), 40), Some(10));
        assert!(q.cancel(TimerKind::BandwidthPeriod(GroupId(1))));
        assert_eq!(q.next_expiry(), None);
    }

    #[test]
    fn test_forward_overrun() {
        assert_eq!(forward(100, 50, 100), (100, 0));
        assert_eq!(forward(100, 100, 100), (200, 1));
        assert_eq!(forward(100, 450, 100), (500, 4));
    }
}
