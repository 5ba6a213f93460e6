// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use scx_fair::*;

mod common;
use common::{ratio, spinner};

const MS: u64 = 1_000_000;

/// Two tasks with equal weight on 1 CPU should get roughly equal runtime.
#[test]
fn test_equal_weight_fairness() {
    common::setup_test();
    let scenario = Scenario::builder()
        .cpus(1)
        .add_task("t1", 0, spinner())
        .add_task("t2", 0, spinner())
        .duration_ms(200)
        .build();

    let trace = Simulator::new(scenario).unwrap().run();
    let rt1 = trace.total_runtime(Pid(1));
    let rt2 = trace.total_runtime(Pid(2));
    eprintln!("t1 runtime: {rt1}ns, t2 runtime: {rt2}ns");

    assert!(rt1 > 0 && rt2 > 0);
    let r = ratio(rt1, rt2);
    assert!(
        (0.8..=1.2).contains(&r),
        "expected ~equal runtime ratio, got {r:.3} (rt1={rt1}, rt2={rt2})"
    );
    // Nobody else wanted the CPU.
    assert!(rt1 + rt2 >= 199 * MS);

    // Preemption only happens on 4ms ticks, so allow a slice plus a few
    // ticks of skew.
    let v1 = trace.task(Pid(1)).unwrap().vruntime;
    let v2 = trace.task(Pid(2)).unwrap().vruntime;
    assert!(v1.abs_diff(v2) <= 12 * MS, "vruntime skew {v1} vs {v2}");
}

/// nice -3 is about 1.94x the weight of nice 0.
#[test]
fn test_weighted_fairness() {
    common::setup_test();
    let scenario = Scenario::builder()
        .cpus(1)
        .add_task("heavy", -3, spinner())
        .add_task("light", 0, spinner())
        .duration_ms(300)
        .build();

    let trace = Simulator::new(scenario).unwrap().run();
    let r = ratio(trace.total_runtime(Pid(1)), trace.total_runtime(Pid(2)));
    assert!((1.6..=2.3).contains(&r), "expected ~1.94x, got {r:.3}");
}

/// Shares split CPU time between groups regardless of how many tasks each
/// group runs.
#[test]
fn test_group_shares_split() {
    common::setup_test();
    let mut web = GroupDef::new("web");
    web.shares = Some(2048);
    let mut batch = GroupDef::new("batch");
    batch.shares = Some(1024);
    let scenario = Scenario::builder()
        .cpus(1)
        .group(web)
        .group(batch)
        .add_group_task("web0", "web", spinner())
        .add_group_task("batch0", "batch", spinner())
        .add_group_task("batch1", "batch", spinner())
        .duration_ms(400)
        .build();

    let trace = Simulator::new(scenario).unwrap().run();
    let web_rt = trace.total_runtime(Pid(1));
    let batch_rt = trace.total_runtime(Pid(2)) + trace.total_runtime(Pid(3));
    let r = ratio(web_rt, batch_rt);
    assert!((1.6..=2.4).contains(&r), "expected ~2x, got {r:.3}");

    // Inside the batch group the two tasks still share evenly.
    let inner = ratio(trace.total_runtime(Pid(2)), trace.total_runtime(Pid(3)));
    assert!((0.7..=1.4).contains(&inner), "got {inner:.3}");
}

/// A task that mostly sleeps gets the CPU when it wants it, even next to a
/// CPU hog.
#[test]
fn test_sleeper_gets_its_demand() {
    common::setup_test();
    let sleeper = TaskBehavior {
        phases: vec![Phase::Run(MS), Phase::Sleep(9 * MS)],
        repeat: true,
    };
    let scenario = Scenario::builder()
        .cpus(1)
        .add_task("hog", 0, spinner())
        .add_task("sleeper", 0, sleeper)
        .duration_ms(200)
        .build();

    let trace = Simulator::new(scenario).unwrap().run();
    let sleeper_rt = trace.total_runtime(Pid(2));
    assert!(sleeper_rt >= 12 * MS, "sleeper only ran {sleeper_rt}ns");
    assert!(sleeper_rt <= 21 * MS, "sleeper ran {sleeper_rt}ns");
    assert!(trace.total_runtime(Pid(1)) >= 170 * MS);
}

/// Four hogs on two CPUs end up sharing both CPUs.
#[test]
fn test_hogs_spread_over_cpus() {
    common::setup_test();
    let mut builder = Scenario::builder().cpus(2).duration_ms(400);
    for i in 0..4 {
        builder = builder.add_task(&format!("hog{i}"), 0, spinner());
    }
    let trace = Simulator::new(builder.build()).unwrap().run();

    let mut total = 0;
    for pid in 1..=4 {
        let rt = trace.total_runtime(Pid(pid));
        assert!(rt >= 100 * MS, "hog {pid} only ran {rt}ns");
        total += rt;
    }
    assert!(total >= 500 * MS, "CPUs mostly idle: {total}ns");
    assert!(trace.cpus.iter().all(|c| c.nr_running > 0));
}

/// Affinity is honoured by placement and by every balancer.
#[test]
fn test_pinned_tasks_never_migrate() {
    common::setup_test();
    let mut builder = Scenario::builder().cpus(2).duration_ms(300);
    for pid in 1..=3 {
        let mut def = TaskDef::new(&format!("pinned{pid}"), Pid(pid), spinner());
        def.cpus_allowed = Some("0".to_string());
        builder = builder.task(def);
    }
    builder = builder.add_task("free", 0, spinner());
    let trace = Simulator::new(builder.build()).unwrap().run();

    for pid in 1..=3 {
        assert_eq!(trace.cpus_of(Pid(pid)), vec![CpuId(0)], "pid {pid}");
        assert_eq!(trace.task(Pid(pid)).unwrap().nr_migrations, 0);
        assert!(trace.total_runtime(Pid(pid)) >= 60 * MS);
    }
    assert!(trace.total_runtime(Pid(4)) >= 180 * MS);
}

/// A task switched to the idle policy mid-run barely gets the CPU.
#[test]
fn test_idle_policy_task_starves_politely() {
    common::setup_test();
    let scenario = Scenario::builder()
        .cpus(1)
        .add_task("normal", 0, spinner())
        .add_task("idle", 0, spinner())
        .at_ms(
            10,
            Action::SetPolicy {
                pid: Pid(2),
                policy: Policy::Idle,
            },
        )
        .duration_ms(200)
        .build();

    let trace = Simulator::new(scenario).unwrap().run();
    let normal = trace.total_runtime(Pid(1));
    let idle = trace.total_runtime(Pid(2));
    assert!(normal >= 170 * MS, "normal ran {normal}ns");
    assert!(idle <= 25 * MS, "idle ran {idle}ns");
}
