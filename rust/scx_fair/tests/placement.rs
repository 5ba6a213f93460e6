// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use scx_fair::*;

mod common;
use common::spinner;

const MS: u64 = 1_000_000;

fn hmp_tunables() -> Tunables {
    let mut t = Tunables::default();
    t.hmp.enable = true;
    t
}

/// Two little CPUs (0, 1) at a quarter of the capacity of two big ones
/// (2, 3).
fn big_little() -> TopologySpec {
    TopologySpec::clustered(&[(2, 1024, 1_000_000), (2, 2048, 2_000_000)])
}

fn task_with_load(pid: i32, load_pct: u32) -> TaskDef {
    let mut def = TaskDef::new(&format!("t{pid}"), Pid(pid), spinner());
    def.init_load_pct = Some(load_pct);
    def
}

#[test]
fn test_topology_capacities() {
    common::setup_test();
    let sched = FairSched::new(&big_little(), hmp_tunables()).unwrap();
    let topo = sched.topology();
    assert_eq!(topo.capacity_orig(CpuId(3)), 1024);
    assert_eq!(topo.capacity_orig(CpuId(0)), 256);
}

#[test]
fn test_big_task_placed_on_big_cluster() {
    common::setup_test();
    let mut sched = FairSched::new(&big_little(), hmp_tunables()).unwrap();
    let pid = sched.fork_task(&task_with_load(1, 100)).unwrap();
    let cpu = sched.task(pid).unwrap().cpu;
    assert!(cpu.0 >= 2, "big task placed on little CPU {}", cpu.0);
}

#[test]
fn test_boost_sends_tasks_to_big_cluster() {
    common::setup_test();
    let mut sched = FairSched::new(&big_little(), hmp_tunables()).unwrap();
    sched.set_boost(true).unwrap();
    for pid in 1..=2 {
        let pid = sched.fork_task(&task_with_load(pid, 15)).unwrap();
        let cpu = sched.task(pid).unwrap().cpu;
        assert!(cpu.0 >= 2, "boosted task placed on little CPU {}", cpu.0);
    }
}

#[test]
fn test_affinity_beats_capacity() {
    common::setup_test();
    let mut sched = FairSched::new(&big_little(), hmp_tunables()).unwrap();
    let mut def = task_with_load(1, 100);
    def.cpus_allowed = Some("0-1".to_string());
    let pid = sched.fork_task(&def).unwrap();
    assert!(sched.task(pid).unwrap().cpu.0 < 2);

    assert!(sched.set_cpus_allowed(pid, "7").is_err());
    sched.set_cpus_allowed(pid, "3").unwrap();
    assert_eq!(sched.task(pid).unwrap().cpu, CpuId(3));
}

#[test]
fn test_fork_rejects_bad_task() {
    common::setup_test();
    let mut sched = FairSched::new(&TopologySpec::smp(2), Tunables::default()).unwrap();
    let mut def = task_with_load(1, 10);
    def.nice = 25;
    assert!(sched.fork_task(&def).is_err());

    let mut def = task_with_load(1, 10);
    def.group = GroupId(3);
    assert!(sched.fork_task(&def).is_err());

    sched.fork_task(&task_with_load(1, 10)).unwrap();
    assert!(sched.fork_task(&task_with_load(1, 10)).is_err());
}

/// A CPU coming back online picks up work from its busy sibling.
#[test]
fn test_hotplug_round_trip() {
    common::setup_test();
    let scenario = Scenario::builder()
        .cpus(2)
        .add_task("a", 0, spinner())
        .add_task("b", 0, spinner())
        .at_ms(50, Action::CpuOffline { cpu: CpuId(1) })
        .at_ms(100, Action::CpuOnline { cpu: CpuId(1) })
        .duration_ms(300)
        .build();

    let trace = Simulator::new(scenario).unwrap().run();
    let on_cpu1: Vec<u64> = trace
        .events()
        .iter()
        .filter(|e| e.cpu == CpuId(1) && matches!(e.kind, TraceKind::TaskScheduled { .. }))
        .map(|e| e.time_ns)
        .collect();
    assert!(
        on_cpu1.iter().all(|&t| t <= 50 * MS || t >= 100 * MS),
        "ran on an offline CPU: {on_cpu1:?}"
    );
    assert!(
        on_cpu1.iter().any(|&t| t >= 100 * MS),
        "CPU 1 never ran anything after coming back"
    );
    let total = trace.total_runtime(Pid(1)) + trace.total_runtime(Pid(2));
    assert!(total >= 450 * MS, "{total}");
}
