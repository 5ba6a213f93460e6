// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! scx_fair - Weighted fair-share CPU scheduling core.
//!
//! Tasks and task groups are entities that accumulate weighted virtual
//! runtime; each CPU runs the entity furthest behind. On top of that the
//! core implements hierarchical group shares, CPU bandwidth quotas,
//! per-entity load tracking, wake-up placement, heterogeneous (big.LITTLE)
//! placement, NUMA locality bias and periodic, idle and active load
//! balancing over a tree of scheduling domains.
//!
//! There is no kernel underneath. A deterministic event-driven
//! [`Simulator`] plays the role of the dispatcher: it forks scripted tasks,
//! fires ticks and timers, and asks [`FairSched`] what to run.
//!
//! # Architecture
//!
//! - **sched / fair / entity / cfs_rq**: the virtual-time engine
//! - **group / bandwidth**: shares hierarchy and quota enforcement
//! - **pelt / load_avg**: decaying load and utilization averages
//! - **placement / hmp / numa**: where a waking task should run
//! - **load_balance**: moving load between CPUs
//! - **engine / scenario / trace / workload**: the simulator
//!
//! # Usage
//!
//! ```rust,no_run
//! use scx_fair::*;
//!
//! let scenario = Scenario::builder()
//!     .cpus(2)
//!     .add_task("worker", 0, TaskBehavior {
//!         phases: vec![Phase::Run(10_000_000), Phase::Sleep(5_000_000)],
//!         repeat: true,
//!     })
//!     .duration_ms(100)
//!     .build();
//!
//! let trace = Simulator::new(scenario).unwrap().run();
//! trace.dump();
//! ```

pub mod bandwidth;
pub mod cfs_rq;
pub mod config;
pub mod cpumask;
pub mod engine;
pub mod entity;
pub mod fair;
pub mod group;
pub mod hmp;
pub mod load_avg;
pub mod load_balance;
pub mod numa;
pub mod pelt;
pub mod placement;
pub mod power;
pub mod rq;
pub mod scenario;
pub mod sched;
pub mod stats;
pub mod task;
pub mod timer;
pub mod topology;
pub mod trace;
pub mod types;
pub mod weight;
pub mod workload;

pub use config::{ConfigError, Tunables};
pub use engine::Simulator;
pub use scenario::{Action, GroupDef, Scenario};
pub use sched::FairSched;
pub use task::{Phase, TaskBehavior, TaskDef};
pub use topology::TopologySpec;
pub use trace::{Trace, TraceEvent, TraceKind};
pub use types::{CpuId, GroupId, Pid, Policy, TimeNs};
pub use workload::{load_workload, parse_workload};
