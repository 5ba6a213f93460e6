// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io::Write;

use scx_fair::*;

mod common;

#[test]
fn test_bad_tunables_rejected_at_creation() {
    common::setup_test();
    let mut t = Tunables::default();
    t.min_granularity_ns = 10_000_000;
    t.latency_ns = 6_000_000;
    assert!(FairSched::new(&TopologySpec::smp(2), t).is_err());
}

#[test]
fn test_rejected_tunables_keep_old_ones() {
    common::setup_test();
    let mut sched = FairSched::new(&TopologySpec::smp(4), Tunables::default()).unwrap();
    let before = sched.config().latency;

    let mut t = Tunables::default();
    t.hmp.downmigrate_pct = 90;
    t.hmp.upmigrate_pct = 80;
    assert_eq!(
        sched.set_tunables(t),
        Err(ConfigError::Inverted {
            lower: "hmp.downmigrate_pct",
            upper: "hmp.upmigrate_pct",
        })
    );
    assert_eq!(sched.config().latency, before);

    let mut t = Tunables::default();
    t.nr_migrate = 0;
    assert!(matches!(
        sched.set_tunables(t),
        Err(ConfigError::OutOfRange { name: "nr_migrate", .. })
    ));
}

#[test]
fn test_latency_scales_with_cpus() {
    common::setup_test();
    let one = FairSched::new(&TopologySpec::smp(1), Tunables::default()).unwrap();
    let four = FairSched::new(&TopologySpec::smp(4), Tunables::default()).unwrap();
    // 1 + log2(4)
    assert_eq!(four.config().latency, 3 * one.config().latency);
    assert_eq!(four.config().min_granularity, 3 * one.config().min_granularity);
}

#[test]
fn test_load_workload_file() {
    common::setup_test();
    let json = r#"{
        "topology": {
            "clusters": [{"efficiency": 1024, "max_freq": 2000000}],
            "cpus": [{"cluster": 0}]
        },
        "tunables": {"latency_ns": 12000000},
        "tasks": [
            {"name": "a", "pid": 1, "behavior": {"phases": [{"run": 100000000}], "repeat": true}},
            {"name": "b", "pid": 2, "behavior": {"phases": [{"run": 100000000}], "repeat": true}}
        ],
        "duration": "100ms"
    }"#;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();

    let scenario = load_workload(file.path()).unwrap();
    assert_eq!(scenario.tunables.latency_ns, 12_000_000);
    assert_eq!(scenario.tunables.min_granularity_ns, 750_000);
    assert_eq!(scenario.duration_ns, 100_000_000);

    let trace = Simulator::new(scenario).unwrap().run();
    let total = trace.total_runtime(Pid(1)) + trace.total_runtime(Pid(2));
    assert_eq!(total, 100_000_000);
}

#[test]
fn test_load_workload_reports_path() {
    common::setup_test();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.json");
    let err = load_workload(&path).unwrap_err();
    assert!(format!("{err:#}").contains("missing.json"));

    let bad = dir.path().join("bad.json");
    std::fs::write(&bad, "{ not json").unwrap();
    let err = load_workload(&bad).unwrap_err();
    assert!(format!("{err:#}").contains("bad.json"));
}

#[test]
fn test_scenario_round_trips_through_json() {
    common::setup_test();
    let scenario = Scenario::builder()
        .cpus(2)
        .group(GroupDef::new("g"))
        .add_group_task("t", "g", common::spinner())
        .at_ms(5, Action::Boost { enable: false })
        .at_ms(
            10,
            Action::SetPolicy {
                pid: Pid(1),
                policy: Policy::Batch,
            },
        )
        .at_ms(
            20,
            Action::MoveTask {
                pid: Pid(1),
                group: "root".to_string(),
            },
        )
        .at_ms(30, Action::Yield { cpu: CpuId(0) })
        .duration_ms(50)
        .build();
    let json = serde_json::to_string(&scenario).unwrap();
    assert!(json.contains(r#""action":"move_task""#), "{json}");
    assert_eq!(parse_workload(&json).unwrap(), scenario);

    // The boost fails (HMP is off), everything else applies to the one
    // running task without taking the CPU away from it.
    let trace = Simulator::new(scenario).unwrap().run();
    assert!(trace.total_runtime(Pid(1)) >= 49_000_000);
    assert_eq!(trace.task(Pid(1)).unwrap().nr_migrations, 0);
}

/// Bad runtime actions are logged and skipped, not fatal.
#[test]
fn test_bad_action_is_ignored() {
    common::setup_test();
    let scenario = Scenario::builder()
        .cpus(1)
        .add_task("t", 0, common::spinner())
        .at_ms(5, Action::Boost { enable: true })
        .at_ms(6, Action::CpuOffline { cpu: CpuId(0) })
        .at_ms(
            7,
            Action::SetShares {
                group: "nope".to_string(),
                shares: 10,
            },
        )
        .duration_ms(20)
        .build();
    let trace = Simulator::new(scenario).unwrap().run();
    assert_eq!(trace.total_runtime(Pid(1)), 20_000_000);
    assert!(trace.cpus[0].online);
}
