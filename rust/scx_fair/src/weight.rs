// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Nice-to-weight mapping and weight-scaled arithmetic.

use static_assertions::const_assert_eq;

use crate::types::Policy;

pub const NICE_0_LOAD: u64 = 1024;
pub const WEIGHT_IDLEPRIO: u64 = 3;
pub const WMULT_IDLEPRIO: u32 = 1_431_655_765;
pub const WMULT_CONST: u64 = 0xffff_ffff;
pub const WMULT_SHIFT: u32 = 32;

pub const MIN_NICE: i32 = -20;
pub const MAX_NICE: i32 = 19;

/// Weight per nice level. Each step is roughly 10% of CPU time relative to
/// a neighbour at the adjacent level.
pub const SCHED_PRIO_TO_WEIGHT: [u64; 40] = [
    /* -20 */ 88761, 71755, 56483, 46273, 36291,
    /* -15 */ 29154, 23254, 18705, 14949, 11916,
    /* -10 */ 9548, 7620, 6100, 4904, 3906,
    /*  -5 */ 3121, 2501, 1991, 1586, 1277,
    /*   0 */ 1024, 820, 655, 526, 423,
    /*   5 */ 335, 272, 215, 172, 137,
    /*  10 */ 110, 87, 70, 56, 45,
    /*  15 */ 36, 29, 23, 18, 15,
];

/// Precomputed `2^32 / weight` per nice level.
pub const SCHED_PRIO_TO_WMULT: [u32; 40] = [
    /* -20 */ 48388, 59856, 76040, 92818, 118348,
    /* -15 */ 147320, 184698, 229616, 287308, 360437,
    /* -10 */ 449829, 563644, 704093, 875809, 1099582,
    /*  -5 */ 1376151, 1717300, 2157191, 2708050, 3363326,
    /*   0 */ 4194304, 5237765, 6557202, 8165337, 10153587,
    /*   5 */ 12820798, 15790321, 19976592, 24970740, 31350126,
    /*  10 */ 39045157, 49367440, 61356676, 76695844, 95443717,
    /*  15 */ 119304647, 148102320, 186737708, 238609294, 286331153,
];

const_assert_eq!(SCHED_PRIO_TO_WEIGHT.len(), (MAX_NICE - MIN_NICE + 1) as usize);
const_assert_eq!(SCHED_PRIO_TO_WMULT.len(), SCHED_PRIO_TO_WEIGHT.len());

/// A load weight with a lazily computed inverse.
///
/// `inv_weight == 0` means the inverse is stale and is recomputed on the
/// next [`calc_delta`] that needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadWeight {
    pub weight: u64,
    pub inv_weight: u32,
}

impl LoadWeight {
    pub fn new(weight: u64) -> LoadWeight {
        LoadWeight {
            weight,
            inv_weight: 0,
        }
    }

    /// Weight of a task at `nice` under `policy`.
    pub fn for_nice(nice: i32, policy: Policy) -> LoadWeight {
        if policy == Policy::Idle {
            return LoadWeight {
                weight: WEIGHT_IDLEPRIO,
                inv_weight: WMULT_IDLEPRIO,
            };
        }
        let idx = (nice.clamp(MIN_NICE, MAX_NICE) - MIN_NICE) as usize;
        LoadWeight {
            weight: SCHED_PRIO_TO_WEIGHT[idx],
            inv_weight: SCHED_PRIO_TO_WMULT[idx],
        }
    }

    pub fn add(&mut self, inc: u64) {
        self.weight += inc;
        self.inv_weight = 0;
    }

    pub fn sub(&mut self, dec: u64) {
        self.weight = self.weight.saturating_sub(dec);
        self.inv_weight = 0;
    }

    pub fn set(&mut self, weight: u64) {
        self.weight = weight;
        self.inv_weight = 0;
    }

    fn update_inv(&mut self) {
        if self.inv_weight != 0 {
            return;
        }
        let w = self.weight.max(1);
        self.inv_weight = if w >= WMULT_CONST {
            1
        } else {
            (WMULT_CONST / w) as u32
        };
    }
}

/// `delta * weight / lw.weight` without a division on the hot path.
///
/// The product is computed as `delta * weight * inv_weight >> 32`, with
/// `weight * inv_weight` kept inside 32 bits by shifting it down first.
pub fn calc_delta(delta: u64, weight: u64, lw: &mut LoadWeight) -> u64 {
    let mut shift = WMULT_SHIFT;
    let mut fact = weight;

    lw.update_inv();

    while fact >> 32 != 0 {
        fact >>= 1;
        shift -= 1;
    }

    fact = (fact as u32 as u64) * lw.inv_weight as u64;

    while fact >> 32 != 0 {
        fact >>= 1;
        shift -= 1;
    }

    ((delta as u128 * fact as u128) >> shift) as u64
}

/// Convert wall time to virtual time for an entity of weight `lw`.
pub fn calc_delta_fair(delta: u64, lw: &LoadWeight) -> u64 {
    if lw.weight == NICE_0_LOAD {
        return delta;
    }
    let mut lw = *lw;
    calc_delta(delta, NICE_0_LOAD, &mut lw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nice_mapping() {
        assert_eq!(LoadWeight::for_nice(0, Policy::Normal).weight, 1024);
        assert_eq!(LoadWeight::for_nice(-20, Policy::Normal).weight, 88761);
        assert_eq!(LoadWeight::for_nice(19, Policy::Batch).weight, 15);
        assert_eq!(LoadWeight::for_nice(0, Policy::Idle).weight, WEIGHT_IDLEPRIO);
        assert_eq!(LoadWeight::for_nice(40, Policy::Normal).weight, 15);
    }

    #[test]
    fn test_calc_delta_matches_division() {
        for nice in MIN_NICE..=MAX_NICE {
            let lw = LoadWeight::for_nice(nice, Policy::Normal);
            let exact = 6_000_000u64 * NICE_0_LOAD / lw.weight;
            let approx = calc_delta_fair(6_000_000, &lw);
            let err = exact.abs_diff(approx);
            assert!(err * 1000 <= exact.max(1), "nice {nice}: {approx} vs {exact}");
        }
    }

    #[test]
    fn test_calc_delta_lazy_inverse() {
        let mut lw = LoadWeight::new(2048);
        assert_eq!(lw.inv_weight, 0);
        let d = calc_delta(1_000_000, 1024, &mut lw);
        assert_ne!(lw.inv_weight, 0);
        assert!(d.abs_diff(500_000) <= 1);

        lw.add(2048);
        assert_eq!(lw.inv_weight, 0);
        let d = calc_delta(1_000_000, 1024, &mut lw);
        assert!(d.abs_diff(250_000) <= 1);
    }

    #[test]
    fn test_calc_delta_large_weight() {
        // Sum of many heavy entities: weight does not fit in 32 bits after
        // multiplication but the result stays proportional.
        let mut lw = LoadWeight::new(88761 * 64);
        let d = calc_delta(1_000_000_000, 88761, &mut lw);
        assert!(d.abs_diff(1_000_000_000 / 64) < 20_000);
    }
}
