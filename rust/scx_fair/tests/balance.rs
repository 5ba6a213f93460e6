// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use scx_fair::*;

mod common;
use common::spinner;

const MS: u64 = 1_000_000;

/// Two clusters of two CPUs: an MC level per cluster and a DIE level on
/// top whose child prefers spreading to siblings.
fn two_clusters() -> TopologySpec {
    TopologySpec::clustered(&[(2, 1024, 1_000_000), (2, 1024, 1_000_000)])
}

/// Four hogs released from CPU 0 spread out over both levels of the domain
/// tree until every CPU runs one.
#[test]
fn test_two_level_spread() {
    common::setup_test();
    let mut builder = Scenario::builder()
        .topology(two_clusters())
        .duration_ms(400);
    for pid in 1..=4 {
        let mut def = TaskDef::new(&format!("hog{pid}"), Pid(pid), spinner());
        def.cpus_allowed = Some("0".to_string());
        builder = builder.task(def).at_ms(
            10,
            Action::SetAffinity {
                pid: Pid(pid),
                cpus: "0-3".to_string(),
            },
        );
    }
    let trace = Simulator::new(builder.build()).unwrap().run();

    for cpu in &trace.cpus {
        assert!(cpu.nr_running >= 1, "CPU {} ended idle", cpu.cpu.0);
    }
    for pid in 1..=4 {
        let rt = trace.total_runtime(Pid(pid));
        assert!(rt >= 150 * MS, "hog {pid} only ran {rt}ns");
    }
    let migrated: u64 = trace.tasks.iter().map(|t| t.nr_migrations).sum();
    assert!(migrated >= 3, "only {migrated} migrations");
}

/// With a CPU kept busy by pinned work, free tasks drain to the other CPUs
/// instead of queueing behind it.
#[test]
fn test_free_tasks_avoid_pinned_cpu() {
    common::setup_test();
    let mut pinned = TaskDef::new("pinned", Pid(1), spinner());
    pinned.cpus_allowed = Some("0".to_string());
    let scenario = Scenario::builder()
        .topology(two_clusters())
        .task(pinned)
        .add_task("free1", 0, spinner())
        .add_task("free2", 0, spinner())
        .add_task("free3", 0, spinner())
        .duration_ms(300)
        .build();

    let trace = Simulator::new(scenario).unwrap().run();
    assert!(trace.total_runtime(Pid(1)) >= 200 * MS);
    assert_eq!(trace.cpus_of(Pid(1)), vec![CpuId(0)]);
    let free: u64 = (2..=4).map(|p| trace.total_runtime(Pid(p))).sum();
    assert!(free >= 600 * MS, "free tasks ran {free}ns");
}

/// Losing a CPU mid-run shrinks its cluster to one CPU. Balancing then
/// weighs that cluster by what is left of it and six hogs settle two per
/// surviving CPU.
#[test]
fn test_spread_after_cpu_offline() {
    common::setup_test();
    let mut builder = Scenario::builder()
        .topology(two_clusters())
        .at_ms(1, Action::CpuOffline { cpu: CpuId(0) })
        .duration_ms(2000);
    for pid in 1..=6 {
        builder = builder.add_task(&format!("hog{pid}"), 0, spinner());
    }
    let trace = Simulator::new(builder.build()).unwrap().run();

    let offline = &trace.cpus[0];
    assert!(!offline.online);
    assert_eq!(offline.nr_running, 0);
    let spread: Vec<u32> = trace.cpus[1..].iter().map(|c| c.nr_running).collect();
    assert_eq!(spread.iter().sum::<u32>(), 6, "{spread:?}");
    assert!(spread.iter().all(|&n| n <= 2), "uneven spread {spread:?}");
    for pid in 1..=6 {
        let rt = trace.total_runtime(Pid(pid));
        assert!(rt >= 500 * MS, "hog {pid} only ran {rt}ns");
    }
}
