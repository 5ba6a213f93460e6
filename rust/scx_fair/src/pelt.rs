// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-entity load tracking.
//!
//! Time is accounted in 1024ns units. Each completed 1024-unit period decays
//! everything accumulated so far by `y`, where `y^32 = 1/2`, so a signal
//! loses half of its weight every 32 periods (about 32ms). The functions in
//! this module are pure accumulators over [`SchedAvg`]; attaching and
//! detaching entities from a queue's average is driven by the queue code.

use static_assertions::const_assert_eq;

use crate::types::TimeNs;

pub const LOAD_AVG_PERIOD: u64 = 32;
/// Maximum possible value of a fully saturated load sum divided by weight.
pub const LOAD_AVG_MAX: u64 = 47742;
/// Number of full periods after which the sum saturates at `LOAD_AVG_MAX`.
pub const LOAD_AVG_MAX_N: u64 = 345;
pub const SCHED_CAPACITY_SHIFT: u32 = 10;
pub const SCHED_CAPACITY_SCALE: u64 = 1 << SCHED_CAPACITY_SHIFT;

/// `2^32 * y^n` for `n` in `0..32`.
const RUNNABLE_AVG_YN_INV: [u32; 32] = [
    0xffffffff, 0xfa83b2da, 0xf5257d14, 0xefe4b99a, 0xeac0c6e6, 0xe5b906e6, 0xe0ccdeeb,
    0xdbfbb796, 0xd744fcc9, 0xd2a81d91, 0xce248c14, 0xc9b9bd85, 0xc5672a10, 0xc12c4cc9,
    0xbd08a39e, 0xb8fbaf46, 0xb504f333, 0xb123f581, 0xad583ee9, 0xa9a15ab4, 0xa5fed6a9,
    0xa2704302, 0x9ef5325f, 0x9b8d39b9, 0x9837f050, 0x94f4efa8, 0x91c3d373, 0x8ea4398a,
    0x8b95c1e3, 0x88980e80, 0x85aac367, 0x82cd8698,
];

/// `floor(sum(1024 * y^k, 1 <= k <= n))` for `n` in `0..=32`.
const RUNNABLE_AVG_YN_SUM: [u32; 33] = [
    0, 1002, 1982, 2941, 3880, 4798, 5697, 6576, 7437, 8279, 9103, 9909, 10698, 11470, 12226,
    12966, 13690, 14398, 15091, 15769, 16433, 17082, 17718, 18340, 18949, 19545, 20128, 20698,
    21256, 21802, 22336, 22859, 23371,
];

const_assert_eq!(RUNNABLE_AVG_YN_INV.len(), LOAD_AVG_PERIOD as usize);
const_assert_eq!(RUNNABLE_AVG_YN_SUM.len(), LOAD_AVG_PERIOD as usize + 1);

/// Decayed load averages of an entity or a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedAvg {
    /// Clock value of the last update. Zero marks an entity that has not
    /// been attached anywhere yet, or that is in flight between queues.
    pub last_update_time: TimeNs,
    pub load_sum: u64,
    pub util_sum: u64,
    /// Progress into the current 1024-unit period.
    pub period_contrib: u32,
    pub load_avg: u64,
    pub util_avg: u64,
    /// Runnable time scaled by frequency and efficiency, in the same decayed
    /// units as `load_sum / weight`. This is a task's HMP demand.
    pub runnable_avg_sum_scaled: u64,
}

/// Runnable-only load of a queue, which excludes blocked contributions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnableAvg {
    pub load_sum: u64,
    pub load_avg: u64,
}

/// Scale factors applied to a single accumulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeltScale {
    /// Frequency capacity, 1024 at full speed.
    pub freq: u64,
    /// CPU capacity, 1024 on the biggest CPU.
    pub cpu: u64,
    /// Demand scaling when HMP placement is on: the CPU's current frequency,
    /// the highest frequency in the system and the efficiency factor
    /// relative to the most efficient CPU (1024 = same).
    pub hmp: Option<HmpScale>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HmpScale {
    pub cur_freq: u64,
    pub max_possible_freq: u64,
    pub efficiency_factor: u64,
}

impl Default for PeltScale {
    fn default() -> Self {
        Self {
            freq: SCHED_CAPACITY_SCALE,
            cpu: SCHED_CAPACITY_SCALE,
            hmp: None,
        }
    }
}

fn cap_scale(v: u64, s: u64) -> u64 {
    (v * s) >> SCHED_CAPACITY_SHIFT
}

/// Approximate `val * y^n`.
pub fn decay_load(val: u64, n: u64) -> u64 {
    if n == 0 {
        return val;
    } else if n > LOAD_AVG_PERIOD * 63 {
        return 0;
    }

    let mut val = val;
    let mut local_n = n;
    if local_n >= LOAD_AVG_PERIOD {
        val >>= local_n / LOAD_AVG_PERIOD;
        local_n %= LOAD_AVG_PERIOD;
    }

    ((val as u128 * RUNNABLE_AVG_YN_INV[local_n as usize] as u128) >> 32) as u64
}

/// `sum(1024 * y^k, 1 <= k <= n)` for any `n`.
pub fn compute_runnable_contrib(n: u64) -> u64 {
    if n <= LOAD_AVG_PERIOD {
        return RUNNABLE_AVG_YN_SUM[n as usize] as u64;
    } else if n >= LOAD_AVG_MAX_N {
        return LOAD_AVG_MAX;
    }

    let mut n = n;
    let mut contrib: u64 = 0;
    loop {
        contrib /= 2;
        contrib += RUNNABLE_AVG_YN_SUM[LOAD_AVG_PERIOD as usize] as u64;
        n -= LOAD_AVG_PERIOD;
        if n <= LOAD_AVG_PERIOD {
            break;
        }
    }

    decay_load(contrib, n) + RUNNABLE_AVG_YN_SUM[n as usize] as u64
}

fn add_to_scaled_stat(sa: &mut SchedAvg, delta: u64, scale: &PeltScale) {
    let Some(hmp) = scale.hmp else {
        return;
    };
    if hmp.max_possible_freq == 0 {
        return;
    }
    let cur = hmp.cur_freq.min(hmp.max_possible_freq);
    let scaled = delta * cur / hmp.max_possible_freq;
    sa.runnable_avg_sum_scaled += (scaled * hmp.efficiency_factor) >> 10;
}

fn decay_scaled_stat(sa: &mut SchedAvg, periods: u64, scale: &PeltScale) {
    if scale.hmp.is_none() {
        return;
    }
    sa.runnable_avg_sum_scaled = decay_load(sa.runnable_avg_sum_scaled, periods);
}

/// Accrue `now - last_update_time` into `sa`.
///
/// `weight` is the entity's weight when it is runnable and zero otherwise;
/// `running` says whether the time was spent on a CPU. Queue updates also
/// pass their runnable-only average so it decays in lockstep. Returns
/// whether at least one period boundary was crossed.
pub fn update_load_avg(
    now: TimeNs,
    sa: &mut SchedAvg,
    weight: u64,
    running: bool,
    mut runnable: Option<&mut RunnableAvg>,
    scale: &PeltScale,
) -> bool {
    if now < sa.last_update_time {
        sa.last_update_time = now;
        return false;
    }

    let mut delta = (now - sa.last_update_time) >> 10;
    if delta == 0 {
        return false;
    }
    sa.last_update_time = now;

    let mut decayed = false;
    let mut delta_w = sa.period_contrib as u64;
    if delta + delta_w >= 1024 {
        decayed = true;
        sa.period_contrib = 0;

        delta_w = 1024 - delta_w;
        let scaled_delta_w = cap_scale(delta_w, scale.freq);
        if weight != 0 {
            sa.load_sum += weight * scaled_delta_w;
            add_to_scaled_stat(sa, delta_w, scale);
            if let Some(r) = runnable.as_deref_mut() {
                r.load_sum += weight * scaled_delta_w;
            }
        }
        if running {
            sa.util_sum += scaled_delta_w * scale.cpu;
        }

        delta -= delta_w;
        let periods = delta / 1024;
        delta %= 1024;

        sa.load_sum = decay_load(sa.load_sum, periods + 1);
        if let Some(r) = runnable.as_deref_mut() {
            r.load_sum = decay_load(r.load_sum, periods + 1);
        }
        sa.util_sum = decay_load(sa.util_sum, periods + 1);
        decay_scaled_stat(sa, periods + 1, scale);

        let contrib = cap_scale(compute_runnable_contrib(periods), scale.freq);
        if weight != 0 {
            sa.load_sum += weight * contrib;
            add_to_scaled_stat(sa, contrib, scale);
            if let Some(r) = runnable.as_deref_mut() {
                r.load_sum += weight * contrib;
            }
        }
        if running {
            sa.util_sum += contrib * scale.cpu;
        }
    }

    let scaled_delta = cap_scale(delta, scale.freq);
    if weight != 0 {
        sa.load_sum += weight * scaled_delta;
        add_to_scaled_stat(sa, delta, scale);
        if let Some(r) = runnable.as_deref_mut() {
            r.load_sum += weight * scaled_delta;
        }
    }
    if running {
        sa.util_sum += scaled_delta * scale.cpu;
    }
    sa.period_contrib += delta as u32;

    if decayed {
        sa.load_avg = sa.load_sum / LOAD_AVG_MAX;
        if let Some(r) = runnable {
            r.load_avg = r.load_sum / LOAD_AVG_MAX;
        }
        sa.util_avg = sa.util_sum / LOAD_AVG_MAX;
    }

    decayed
}

/// Seed a new task so it starts out looking fully loaded and busy until its
/// history builds up. `init_demand` primes the HMP demand signal.
pub fn init_entity_runnable_average(sa: &mut SchedAvg, weight: u64, init_demand: u64) {
    sa.period_contrib = 1023;
    sa.load_avg = weight;
    sa.load_sum = sa.load_avg * LOAD_AVG_MAX;
    sa.util_avg = SCHED_CAPACITY_SCALE;
    sa.util_sum = sa.util_avg * LOAD_AVG_MAX;
    sa.runnable_avg_sum_scaled = init_demand;
}

/// Unsigned subtract, clamping at zero.
pub fn sub_positive(v: &mut u64, d: u64) {
    *v = v.saturating_sub(d);
}

/// Add an entity's averages to a queue's.
pub fn add_avg(dst: &mut SchedAvg, src: &SchedAvg) {
    dst.load_avg += src.load_avg;
    dst.load_sum += src.load_sum;
    dst.util_avg += src.util_avg;
    dst.util_sum += src.util_sum;
}

/// Remove an entity's averages from a queue's.
pub fn sub_avg(dst: &mut SchedAvg, src: &SchedAvg) {
    sub_positive(&mut dst.load_avg, src.load_avg);
    sub_positive(&mut dst.load_sum, src.load_sum);
    sub_positive(&mut dst.util_avg, src.util_avg);
    sub_positive(&mut dst.util_sum, src.util_sum);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decay_half_life() {
        assert_eq!(decay_load(1024, 0), 1024);
        let half = decay_load(1 << 20, LOAD_AVG_PERIOD);
        assert_eq!(half, (1 << 19) - 1);
        assert_eq!(decay_load(u64::MAX, LOAD_AVG_PERIOD * 64), 0);
    }

    #[test]
    fn test_runnable_contrib_saturates() {
        assert_eq!(compute_runnable_contrib(0), 0);
        assert_eq!(compute_runnable_contrib(32), 23371);
        assert_eq!(compute_runnable_contrib(LOAD_AVG_MAX_N), LOAD_AVG_MAX);
        let c = compute_runnable_contrib(LOAD_AVG_MAX_N - 1);
        assert!(c <= LOAD_AVG_MAX && c > LOAD_AVG_MAX - 200);
        let mut prev = 0;
        for n in 0..160 {
            let c = compute_runnable_contrib(n);
            assert!(c >= prev);
            prev = c;
        }
    }

    #[test]
    fn test_runnable_reaches_half_after_one_half_life() {
        let mut sa = SchedAvg::default();
        let scale = PeltScale::default();
        let d = update_load_avg(32 * 1024 * 1024, &mut sa, 1024, true, None, &scale);
        assert!(d);
        assert!(sa.load_avg.abs_diff(512) <= 16, "load_avg {}", sa.load_avg);
        assert!(sa.util_avg.abs_diff(512) <= 16, "util_avg {}", sa.util_avg);
    }

    #[test]
    fn test_blocked_load_decays() {
        let mut sa = SchedAvg::default();
        let scale = PeltScale::default();
        update_load_avg(1_000_000_000, &mut sa, 1024, true, None, &scale);
        assert!(sa.load_avg > 1000);
        let before = sa.load_avg;
        update_load_avg(1_000_000_000 + 32 * 1024 * 1024, &mut sa, 0, false, None, &scale);
        assert!(sa.load_avg.abs_diff(before / 2) <= 16);
    }

    #[test]
    fn test_sub_period_update_does_not_decay() {
        let mut sa = SchedAvg::default();
        let scale = PeltScale::default();
        assert!(!update_load_avg(500, &mut sa, 1024, true, None, &scale));
        assert!(!update_load_avg(100 * 1024, &mut sa, 1024, true, None, &scale));
        assert_eq!(sa.period_contrib, 100);
        // Clock going backwards just resyncs.
        assert!(!update_load_avg(10, &mut sa, 1024, true, None, &scale));
        assert_eq!(sa.last_update_time, 10);
    }

    #[test]
    fn test_scaled_demand_tracks_efficiency() {
        let fast = PeltScale {
            hmp: Some(HmpScale {
                cur_freq: 2000,
                max_possible_freq: 2000,
                efficiency_factor: 1024,
            }),
            ..Default::default()
        };
        let slow = PeltScale {
            hmp: Some(HmpScale {
                cur_freq: 1000,
                max_possible_freq: 2000,
                efficiency_factor: 512,
            }),
            ..Default::default()
        };
        let mut a = SchedAvg::default();
        let mut b = SchedAvg::default();
        update_load_avg(64 * 1024 * 1024, &mut a, 1024, true, None, &fast);
        update_load_avg(64 * 1024 * 1024, &mut b, 1024, true, None, &slow);
        // Quarter the speed, quarter the demand.
        let ratio = a.runnable_avg_sum_scaled as f64 / b.runnable_avg_sum_scaled as f64;
        assert!((ratio - 4.0).abs() < 0.1, "ratio {ratio}");
    }
}
