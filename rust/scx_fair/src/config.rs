// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Scheduler tunables and their validation.
//!
//! Every externally settable knob lives in [`Tunables`]. A [`Config`] is the
//! validated form that decision functions read: it carries the tunables
//! plus the values derived from them (CPU-count scaled latencies, HMP
//! thresholds expressed in task-demand units). A `Config` can only be built
//! through [`Config::new`], so a rejected update never reaches the core.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::pelt::LOAD_AVG_MAX;
use crate::types::{GroupId, NSEC_PER_MSEC, NSEC_PER_USEC};

/// How latency tunables grow with the number of CPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunableScaling {
    None,
    #[default]
    Log,
    Linear,
}

/// Scheduler feature switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Features {
    /// Halve the sleeper credit given on wakeup placement.
    pub gentle_fair_sleepers: bool,
    /// New entities start one virtual slice behind.
    pub start_debit: bool,
    /// Prefer the wakee as the next entity to run.
    pub next_buddy: bool,
    /// Prefer the preempted entity on the next pick.
    pub last_buddy: bool,
    /// Buddies are cache hot for migration purposes.
    pub cache_hot_buddy: bool,
    pub wakeup_preemption: bool,
    /// Skip tiny-load tasks during balancing until a balance attempt fails.
    pub lb_min: bool,
    /// Age a migrated entity's load to the destination queue's clock.
    pub attach_age_load: bool,
    pub numa: bool,
    pub numa_favour_higher: bool,
    pub numa_resist_lower: bool,
    /// Bias source and target load estimates with the decayed history.
    pub lb_bias: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            gentle_fair_sleepers: true,
            start_debit: true,
            next_buddy: false,
            last_buddy: true,
            cache_hot_buddy: true,
            wakeup_preemption: true,
            lb_min: false,
            attach_age_load: true,
            numa: true,
            numa_favour_higher: true,
            numa_resist_lower: false,
            lb_bias: true,
        }
    }
}

/// Hysteresis bands around policy thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hysteresis {
    /// A queue republishes its load to the group when it drifted by more
    /// than 1/`tg_load_update_div` of the last published value.
    pub tg_load_update_div: u64,
    /// Destination must show this many sixteenths more faults than the
    /// source before a move counts as improving locality.
    pub numa_improve_16ths: u64,
    /// Destination must show this many sixteenths fewer faults than the
    /// source before a move counts as degrading locality.
    pub numa_degrade_16ths: u64,
    /// Margin, in sixteenths of local load, by which an affinity-imbalanced
    /// group must exceed the local group before it is forced to balance.
    pub group_imbalance_16ths: u64,
}

impl Default for Hysteresis {
    fn default() -> Self {
        Self {
            tg_load_update_div: 64,
            numa_improve_16ths: 6,
            numa_degrade_16ths: 3,
            group_imbalance_16ths: 1,
        }
    }
}

/// NUMA scanning knobs. The fault scanner itself is an external collaborator;
/// these are carried so they can be exposed and validated alongside the rest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NumaTunables {
    pub scan_period_min_ms: u64,
    pub scan_period_max_ms: u64,
    pub scan_delay_ms: u64,
    pub scan_size_mb: u64,
}

impl Default for NumaTunables {
    fn default() -> Self {
        Self {
            scan_period_min_ms: 1000,
            scan_period_max_ms: 60000,
            scan_delay_ms: 1000,
            scan_size_mb: 256,
        }
    }
}

/// Heterogeneous-multiprocessor placement knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HmpTunables {
    pub enable: bool,
    pub upmigrate_pct: u32,
    pub downmigrate_pct: u32,
    pub small_task_pct: u32,
    pub spill_load_pct: u32,
    pub spill_nr_run: u32,
    /// Tasks niced above this are never big.
    pub upmigrate_min_nice: i32,
    pub grp_upmigrate_pct: u32,
    pub grp_downmigrate_pct: u32,
    pub enable_power_aware: bool,
    pub powerband_limit_pct: u32,
    pub init_task_load_pct: u32,
    pub restrict_tasks_spread: bool,
    pub enable_colocation: bool,
    /// Defaults for CPUs whose topology entry leaves them unset.
    pub mostly_idle_load_pct: u32,
    pub mostly_idle_nr_run: u32,
    /// A CPU spending more than this share of its time in interrupts is
    /// avoided for placement.
    pub high_irqload_pct: u32,
    /// A running task is not moved for power reasons before it has run
    /// this long.
    pub min_runtime_ns: u64,
}

impl Default for HmpTunables {
    fn default() -> Self {
        Self {
            enable: false,
            upmigrate_pct: 80,
            downmigrate_pct: 60,
            small_task_pct: 10,
            spill_load_pct: 100,
            spill_nr_run: 10,
            upmigrate_min_nice: 15,
            grp_upmigrate_pct: 120,
            grp_downmigrate_pct: 100,
            enable_power_aware: false,
            powerband_limit_pct: 20,
            init_task_load_pct: 15,
            restrict_tasks_spread: false,
            enable_colocation: true,
            mostly_idle_load_pct: 20,
            mostly_idle_nr_run: 3,
            high_irqload_pct: 10,
            min_runtime_ns: 0,
        }
    }
}

/// All externally settable scheduler parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    /// Targeted preemption latency for CPU-bound tasks (unscaled).
    pub latency_ns: u64,
    /// Minimal preemption granularity (unscaled).
    pub min_granularity_ns: u64,
    /// Wakeup preemption granularity (unscaled).
    pub wakeup_granularity_ns: u64,
    pub scaling: TunableScaling,
    /// A forked child runs before its parent.
    pub child_runs_first: bool,
    /// Tasks that ran within this window are cache hot. -1 means always hot,
    /// 0 means never.
    pub migration_cost_ns: i64,
    /// Upper bound on tasks examined per balance pass.
    pub nr_migrate: u32,
    /// Runtime handed out per draw from a group's bandwidth pool.
    pub cfs_bandwidth_slice_us: u64,
    pub numa: NumaTunables,
    pub hmp: HmpTunables,
    pub features: Features,
    pub hysteresis: Hysteresis,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            latency_ns: 6 * NSEC_PER_MSEC,
            min_granularity_ns: 750_000,
            wakeup_granularity_ns: NSEC_PER_MSEC,
            scaling: TunableScaling::Log,
            child_runs_first: false,
            migration_cost_ns: 500_000,
            nr_migrate: 32,
            cfs_bandwidth_slice_us: 5000,
            numa: NumaTunables::default(),
            hmp: HmpTunables::default(),
            features: Features::default(),
            hysteresis: Hysteresis::default(),
        }
    }
}

/// Rejections surfaced at the configuration boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    OutOfRange {
        name: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
    Inverted {
        lower: &'static str,
        upper: &'static str,
    },
    HmpDisabled,
    BoostUnderflow,
    UnknownGroup(GroupId),
    RootGroup,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::OutOfRange {
                name,
                value,
                min,
                max,
            } => write!(f, "{name}={value} outside [{min}, {max}]"),
            ConfigError::Inverted { lower, upper } => {
                write!(f, "{lower} must not exceed {upper}")
            }
            ConfigError::HmpDisabled => write!(f, "HMP placement is disabled"),
            ConfigError::BoostUnderflow => write!(f, "boost released more times than taken"),
            ConfigError::UnknownGroup(g) => write!(f, "unknown task group {}", g.0),
            ConfigError::RootGroup => write!(f, "operation not permitted on the root group"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn check_range(name: &'static str, value: i64, min: i64, max: i64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            name,
            value,
            min,
            max,
        });
    }
    Ok(())
}

fn check_order(lower: &'static str, lo: u64, upper: &'static str, hi: u64) -> Result<(), ConfigError> {
    if lo > hi {
        return Err(ConfigError::Inverted { lower, upper });
    }
    Ok(())
}

impl Tunables {
    /// Reject out-of-range values and inverted threshold pairs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range(
            "latency_ns",
            self.latency_ns as i64,
            100_000,
            NSEC_PER_MSEC as i64 * 1000,
        )?;
        check_range(
            "min_granularity_ns",
            self.min_granularity_ns as i64,
            100_000,
            NSEC_PER_MSEC as i64 * 1000,
        )?;
        check_range(
            "wakeup_granularity_ns",
            self.wakeup_granularity_ns as i64,
            0,
            NSEC_PER_MSEC as i64 * 1000,
        )?;
        check_order(
            "min_granularity_ns",
            self.min_granularity_ns,
            "latency_ns",
            self.latency_ns,
        )?;
        check_range("migration_cost_ns", self.migration_cost_ns, -1, i64::MAX)?;
        check_range("nr_migrate", self.nr_migrate as i64, 1, 1 << 16)?;
        check_range(
            "cfs_bandwidth_slice_us",
            self.cfs_bandwidth_slice_us as i64,
            1,
            1_000_000,
        )?;
        check_order(
            "numa.scan_period_min_ms",
            self.numa.scan_period_min_ms,
            "numa.scan_period_max_ms",
            self.numa.scan_period_max_ms,
        )?;

        let h = &self.hmp;
        check_range("hmp.upmigrate_pct", h.upmigrate_pct as i64, 0, 100)?;
        check_range("hmp.downmigrate_pct", h.downmigrate_pct as i64, 0, 100)?;
        check_order(
            "hmp.downmigrate_pct",
            h.downmigrate_pct as u64,
            "hmp.upmigrate_pct",
            h.upmigrate_pct as u64,
        )?;
        check_range("hmp.small_task_pct", h.small_task_pct as i64, 0, 100)?;
        check_range("hmp.spill_load_pct", h.spill_load_pct as i64, 0, 100)?;
        check_range("hmp.spill_nr_run", h.spill_nr_run as i64, 1, 1 << 16)?;
        check_range("hmp.upmigrate_min_nice", h.upmigrate_min_nice as i64, -20, 19)?;
        check_range("hmp.grp_upmigrate_pct", h.grp_upmigrate_pct as i64, 0, 1000)?;
        check_order(
            "hmp.grp_downmigrate_pct",
            h.grp_downmigrate_pct as u64,
            "hmp.grp_upmigrate_pct",
            h.grp_upmigrate_pct as u64,
        )?;
        check_range("hmp.powerband_limit_pct", h.powerband_limit_pct as i64, 0, 100)?;
        check_range("hmp.init_task_load_pct", h.init_task_load_pct as i64, 0, 100)?;
        check_range("hmp.mostly_idle_load_pct", h.mostly_idle_load_pct as i64, 0, 100)?;
        check_range("hmp.high_irqload_pct", h.high_irqload_pct as i64, 0, 100)?;

        let hy = &self.hysteresis;
        check_range(
            "hysteresis.tg_load_update_div",
            hy.tg_load_update_div as i64,
            1,
            1 << 20,
        )?;
        check_range(
            "hysteresis.numa_improve_16ths",
            hy.numa_improve_16ths as i64,
            0,
            16,
        )?;
        check_range(
            "hysteresis.numa_degrade_16ths",
            hy.numa_degrade_16ths as i64,
            0,
            16,
        )?;
        check_range(
            "hysteresis.group_imbalance_16ths",
            hy.group_imbalance_16ths as i64,
            0,
            16,
        )?;
        Ok(())
    }
}

/// Factor by which latency tunables are multiplied on `nr_cpus` CPUs.
pub fn tunable_scaling_factor(scaling: TunableScaling, nr_cpus: usize) -> u64 {
    let cpus = nr_cpus.clamp(1, 8) as u64;
    match scaling {
        TunableScaling::None => 1,
        TunableScaling::Log => 1 + cpus.ilog2() as u64,
        TunableScaling::Linear => cpus,
    }
}

/// Validated tunables plus derived values.
#[derive(Debug, Clone)]
pub struct Config {
    pub tunables: Tunables,
    /// Scaled period targeted for every runnable entity to run once.
    pub latency: u64,
    pub min_granularity: u64,
    pub wakeup_granularity: u64,
    /// Runnable count beyond which the period stretches.
    pub nr_latency: u64,
    pub bandwidth_slice: u64,
    /// HMP thresholds in task-demand units.
    pub upmigrate: u64,
    pub downmigrate: u64,
    pub small_task: u64,
    pub spill_load: u64,
    pub grp_upmigrate: u64,
    pub grp_downmigrate: u64,
    pub init_task_load: u64,
}

/// Convert a percentage of a fully busy max-capacity CPU to demand units.
pub fn pct_to_demand(pct: u32) -> u64 {
    pct as u64 * LOAD_AVG_MAX / 100
}

impl Config {
    pub fn new(tunables: Tunables, nr_cpus: usize) -> Result<Config, ConfigError> {
        tunables.validate()?;
        let factor = tunable_scaling_factor(tunables.scaling, nr_cpus);
        let latency = tunables.latency_ns * factor;
        let min_granularity = tunables.min_granularity_ns * factor;
        let wakeup_granularity = tunables.wakeup_granularity_ns * factor;
        let nr_latency = latency.div_ceil(min_granularity);
        let h = &tunables.hmp;

        Ok(Config {
            latency,
            min_granularity,
            wakeup_granularity,
            nr_latency,
            bandwidth_slice: tunables.cfs_bandwidth_slice_us * NSEC_PER_USEC,
            upmigrate: pct_to_demand(h.upmigrate_pct),
            downmigrate: pct_to_demand(h.downmigrate_pct),
            small_task: pct_to_demand(h.small_task_pct),
            spill_load: pct_to_demand(h.spill_load_pct),
            grp_upmigrate: pct_to_demand(h.grp_upmigrate_pct),
            grp_downmigrate: pct_to_demand(h.grp_downmigrate_pct),
            init_task_load: pct_to_demand(h.init_task_load_pct),
            tunables,
        })
    }

    pub fn features(&self) -> &Features {
        &self.tunables.features
    }

    pub fn hmp(&self) -> &HmpTunables {
        &self.tunables.hmp
    }

    pub fn hmp_enabled(&self) -> bool {
        self.tunables.hmp.enable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let cfg = Config::new(Tunables::default(), 1).unwrap();
        assert_eq!(cfg.latency, 6_000_000);
        assert_eq!(cfg.min_granularity, 750_000);
        assert_eq!(cfg.nr_latency, 8);
        assert_eq!(cfg.bandwidth_slice, 5_000_000);
    }

    #[test]
    fn test_log_scaling() {
        // 4 CPUs: 1 + ilog2(4) = 3
        let cfg = Config::new(Tunables::default(), 4).unwrap();
        assert_eq!(cfg.latency, 18_000_000);
        // Capped at 8 CPUs.
        assert_eq!(tunable_scaling_factor(TunableScaling::Log, 64), 4);
        assert_eq!(tunable_scaling_factor(TunableScaling::Linear, 64), 8);
        assert_eq!(tunable_scaling_factor(TunableScaling::None, 64), 1);
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let mut t = Tunables::default();
        t.hmp.downmigrate_pct = 90;
        assert_eq!(
            t.validate(),
            Err(ConfigError::Inverted {
                lower: "hmp.downmigrate_pct",
                upper: "hmp.upmigrate_pct",
            })
        );
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut t = Tunables::default();
        t.hmp.small_task_pct = 150;
        let err = t.validate().unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { name, .. } if name == "hmp.small_task_pct"));
        assert!(err.to_string().contains("150"));

        let mut t = Tunables::default();
        t.min_granularity_ns = t.latency_ns + 1;
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let t: Tunables =
            serde_json::from_str(r#"{"latency_ns": 12000000, "hmp": {"enable": true}}"#).unwrap();
        assert_eq!(t.latency_ns, 12_000_000);
        assert!(t.hmp.enable);
        assert_eq!(t.hmp.upmigrate_pct, 80);
        assert_eq!(t.min_granularity_ns, 750_000);
    }
}
