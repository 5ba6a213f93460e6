// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Trace event recording for the simulator.
//!
//! Every dispatch decision (task scheduled, preempted, slept, woke, CPU idle)
//! is recorded as a `TraceEvent` with a simulated timestamp and CPU ID. At
//! the end of a run the trace also carries a snapshot of per-task, per-CPU
//! and per-group scheduler statistics.

use serde::Serialize;

use crate::stats::{CpuSnapshot, GroupSnapshot, TaskSnapshot};
use crate::types::{CpuId, Pid, TimeNs};

/// A single trace event produced by the simulator.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub time_ns: TimeNs,
    pub cpu: CpuId,
    #[serde(flatten)]
    pub kind: TraceKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum TraceKind {
    /// A task was forked onto this CPU's queue.
    TaskStarted { pid: Pid },
    TaskScheduled { pid: Pid },
    /// A still-runnable task stopped running on this CPU.
    TaskPreempted { pid: Pid },
    TaskSlept { pid: Pid },
    /// A task was woken. The CPU is the one it was queued on.
    TaskWoke { pid: Pid },
    TaskCompleted { pid: Pid },
    CpuIdle,
    CpuOffline,
    CpuOnline,
}

/// A complete simulation trace, containing all events in chronological order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Trace {
    events: Vec<TraceEvent>,
    /// Simulated time the run stopped at.
    pub end_ns: TimeNs,
    pub tasks: Vec<TaskSnapshot>,
    pub cpus: Vec<CpuSnapshot>,
    pub groups: Vec<GroupSnapshot>,
}

impl Trace {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&mut self, time_ns: TimeNs, cpu: CpuId, kind: TraceKind) {
        self.events.push(TraceEvent { time_ns, cpu, kind });
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Total time `pid` spent running, summed over the intervals between
    /// `TaskScheduled` and the next preempt, sleep or completion. A task still
    /// running when the trace ends is counted up to `end_ns`.
    pub fn total_runtime(&self, pid: Pid) -> TimeNs {
        self.runtime_between(pid, 0, self.end_ns)
    }

    /// Like [`Trace::total_runtime`] but only the part of each run interval
    /// that falls inside `[start_ns, end_ns)`.
    pub fn runtime_between(&self, pid: Pid, start_ns: TimeNs, end_ns: TimeNs) -> TimeNs {
        let mut total: TimeNs = 0;
        let mut running_since: Option<TimeNs> = None;
        let clipped = |from: TimeNs, to: TimeNs| to.min(end_ns).saturating_sub(from.max(start_ns));

        for event in &self.events {
            match &event.kind {
                TraceKind::TaskScheduled { pid: p } if *p == pid => {
                    running_since = Some(event.time_ns);
                }
                TraceKind::TaskPreempted { pid: p }
                | TraceKind::TaskSlept { pid: p }
                | TraceKind::TaskCompleted { pid: p }
                    if *p == pid =>
                {
                    if let Some(start) = running_since.take() {
                        total += clipped(start, event.time_ns);
                    }
                }
                _ => {}
            }
        }
        if let Some(start) = running_since {
            total += clipped(start, self.end_ns);
        }

        total
    }

    pub fn schedule_count(&self, pid: Pid) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e.kind, TraceKind::TaskScheduled { pid: p } if p == pid))
            .count()
    }

    pub fn idle_count(&self, cpu: CpuId) -> usize {
        self.events
            .iter()
            .filter(|e| e.cpu == cpu && matches!(e.kind, TraceKind::CpuIdle))
            .count()
    }

    /// CPUs `pid` was scheduled on, in order, with repeats collapsed.
    pub fn cpus_of(&self, pid: Pid) -> Vec<CpuId> {
        let mut cpus: Vec<CpuId> = Vec::new();
        for event in &self.events {
            if matches!(event.kind, TraceKind::TaskScheduled { pid: p } if p == pid)
                && cpus.last() != Some(&event.cpu)
            {
                cpus.push(event.cpu);
            }
        }
        cpus
    }

    pub fn task(&self, pid: Pid) -> Option<&TaskSnapshot> {
        self.tasks.iter().find(|t| t.pid == pid)
    }

    pub fn group(&self, name: &str) -> Option<&GroupSnapshot> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Pretty-print the trace for debugging.
    pub fn dump(&self) {
        for event in &self.events {
            let desc = match &event.kind {
                TraceKind::TaskStarted { pid } => format!("START    pid={}", pid.0),
                TraceKind::TaskScheduled { pid } => format!("SCHED    pid={}", pid.0),
                TraceKind::TaskPreempted { pid } => format!("PREEMPT  pid={}", pid.0),
                TraceKind::TaskSlept { pid } => format!("SLEEP    pid={}", pid.0),
                TraceKind::TaskWoke { pid } => format!("WAKE     pid={}", pid.0),
                TraceKind::TaskCompleted { pid } => format!("COMPLETE pid={}", pid.0),
                TraceKind::CpuIdle => "IDLE".to_string(),
                TraceKind::CpuOffline => "OFFLINE".to_string(),
                TraceKind::CpuOnline => "ONLINE".to_string(),
            };
            eprintln!(
                "[{:>12} ns] cpu={:<3} {}",
                event.time_ns, event.cpu.0, desc
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_runtime_counts_open_interval() {
        let mut trace = Trace::new();
        trace.record(0, CpuId(0), TraceKind::TaskScheduled { pid: Pid(1) });
        trace.record(10, CpuId(0), TraceKind::TaskPreempted { pid: Pid(1) });
        trace.record(10, CpuId(0), TraceKind::TaskScheduled { pid: Pid(2) });
        trace.record(25, CpuId(1), TraceKind::TaskScheduled { pid: Pid(1) });
        trace.end_ns = 40;

        assert_eq!(trace.total_runtime(Pid(1)), 10 + 15);
        assert_eq!(trace.total_runtime(Pid(2)), 30);
        assert_eq!(trace.schedule_count(Pid(1)), 2);
        assert_eq!(trace.cpus_of(Pid(1)), vec![CpuId(0), CpuId(1)]);

        assert_eq!(trace.runtime_between(Pid(1), 5, 30), 5 + 5);
        assert_eq!(trace.runtime_between(Pid(2), 0, 10), 0);
        assert_eq!(trace.runtime_between(Pid(2), 20, 100), 20);
    }

    #[test]
    fn test_trace_event_json() {
        let event = TraceEvent {
            time_ns: 7,
            cpu: CpuId(3),
            kind: TraceKind::TaskWoke { pid: Pid(9) },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"time_ns": 7, "cpu": 3, "event": "task_woke", "pid": 9})
        );
    }
}
