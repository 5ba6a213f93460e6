// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use scx_fair::*;

mod common;
use common::spinner;

const MS: u64 = 1_000_000;

fn limited(quota_us: u64, period_us: u64) -> GroupDef {
    let mut g = GroupDef::new("limited");
    g.quota_us = Some(quota_us);
    g.period_us = period_us;
    g
}

/// A 5ms/100ms quota holds a CPU hog to a few percent of the CPU, and the
/// group is throttled once per period.
#[test]
fn test_quota_caps_runtime() {
    common::setup_test();
    let scenario = Scenario::builder()
        .cpus(1)
        .group(limited(5_000, 100_000))
        .add_group_task("hog", "limited", spinner())
        .duration_ms(300)
        .build();

    let trace = Simulator::new(scenario).unwrap().run();
    let rt = trace.total_runtime(Pid(1));
    eprintln!("limited hog runtime: {rt}ns");
    // Three periods of quota plus at most a tick of overrun each.
    assert!(rt >= 8 * MS, "ran {rt}ns");
    assert!(rt <= 30 * MS, "ran {rt}ns");

    let group = trace.group("limited").unwrap();
    assert!(group.nr_throttled >= 2, "{group:?}");
    assert!(group.nr_periods >= 2, "{group:?}");
    assert!(group.throttled_time > 0);
}

/// Every period refills the quota and no period runs past it by more than
/// one slice. The group is throttled in each period it runs.
#[test]
fn test_quota_enforced_every_period() {
    common::setup_test();
    let scenario = Scenario::builder()
        .cpus(1)
        .group(limited(5_000, 100_000))
        .add_group_task("hog", "limited", spinner())
        .duration_ms(1000)
        .build();

    let trace = Simulator::new(scenario).unwrap().run();
    let per_period: Vec<u64> = (0..10)
        .map(|p| trace.runtime_between(Pid(1), p * 100 * MS, (p + 1) * 100 * MS))
        .collect();
    eprintln!("runtime per period: {per_period:?}");

    for (p, &rt) in per_period.iter().enumerate() {
        // Quota plus a 5ms slice of overrun.
        assert!(rt <= 10 * MS, "period {p} ran {rt}ns: {per_period:?}");
        assert!(rt >= 2 * MS, "period {p} starved: {per_period:?}");
    }
    let avg = per_period.iter().sum::<u64>() / per_period.len() as u64;
    assert!((3 * MS..=7 * MS).contains(&avg), "average {avg}ns: {per_period:?}");

    let group = trace.group("limited").unwrap();
    assert!(group.nr_periods >= 9, "{group:?}");
    assert_eq!(group.nr_throttled, group.nr_periods, "{group:?}");
}

/// Time a throttled group leaves on the table goes to everybody else.
#[test]
fn test_throttled_group_yields_to_others() {
    common::setup_test();
    let scenario = Scenario::builder()
        .cpus(1)
        .group(limited(10_000, 100_000))
        .add_group_task("hog", "limited", spinner())
        .add_task("free", 0, spinner())
        .duration_ms(300)
        .build();

    let trace = Simulator::new(scenario).unwrap().run();
    let limited_rt = trace.total_runtime(Pid(1));
    let free_rt = trace.total_runtime(Pid(2));
    assert!(limited_rt <= 45 * MS, "limited ran {limited_rt}ns");
    assert!(free_rt >= 250 * MS, "free ran {free_rt}ns");
}

/// Lifting the quota mid-run lets the group use the CPU again.
#[test]
fn test_quota_lifted_at_runtime() {
    common::setup_test();
    let scenario = Scenario::builder()
        .cpus(1)
        .group(limited(5_000, 100_000))
        .add_group_task("hog", "limited", spinner())
        .at_ms(
            150,
            Action::SetQuota {
                group: "limited".to_string(),
                quota_us: None,
                period_us: 100_000,
            },
        )
        .duration_ms(300)
        .build();

    let trace = Simulator::new(scenario).unwrap().run();
    let rt = trace.total_runtime(Pid(1));
    assert!(rt >= 150 * MS, "ran {rt}ns");
    assert_eq!(trace.group("limited").unwrap().quota, None);
}

#[test]
fn test_invalid_quota_rejected() {
    common::setup_test();
    let mut sched = FairSched::new(&TopologySpec::smp(1), Tunables::default()).unwrap();
    let g = sched.create_group("g", GroupId::ROOT).unwrap();

    // Below the 1ms floor.
    assert!(matches!(
        sched.set_quota_period(g, Some(500_000), 100 * MS),
        Err(ConfigError::OutOfRange { name: "quota", .. })
    ));
    assert!(matches!(
        sched.set_quota_period(g, Some(5 * MS), 0),
        Err(ConfigError::OutOfRange { name: "period", .. })
    ));
    assert_eq!(
        sched.set_quota_period(GroupId::ROOT, Some(5 * MS), 100 * MS),
        Err(ConfigError::RootGroup)
    );
    assert_eq!(
        sched.set_quota_period(GroupId(9), None, 100 * MS),
        Err(ConfigError::UnknownGroup(GroupId(9)))
    );
    sched.set_quota_period(g, Some(5 * MS), 100 * MS).unwrap();
}

/// Moving a hog into a limited group puts it under the group's quota.
#[test]
fn test_task_moved_into_limited_group() {
    common::setup_test();
    let scenario = Scenario::builder()
        .cpus(1)
        .group(limited(5_000, 100_000))
        .add_task("hog", 0, spinner())
        .at_ms(
            100,
            Action::MoveTask {
                pid: Pid(1),
                group: "limited".to_string(),
            },
        )
        .duration_ms(400)
        .build();

    let trace = Simulator::new(scenario).unwrap().run();
    let rt = trace.total_runtime(Pid(1));
    assert!(rt >= 95 * MS, "ran {rt}ns");
    assert!(rt <= 160 * MS, "ran {rt}ns");
    assert!(trace.group("limited").unwrap().nr_throttled >= 1);
}
