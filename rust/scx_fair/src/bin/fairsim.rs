// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! fairsim - Run fair-share scheduling simulations from JSON workloads.

use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;

use scx_fair::scenario::parse_duration_ns;
use scx_fair::{load_workload, Simulator};

/// Run fair-share scheduling simulations from JSON workloads.
#[derive(Parser)]
#[command(name = "fairsim")]
struct Cli {
    /// Path to a JSON workload file.
    workload: PathBuf,

    /// Simulation end time (overrides workload duration).
    ///
    /// Accepts durations with units: "1s", "0.5s", "500ms", "100us", "1000ns".
    /// A bare number is interpreted as nanoseconds.
    #[arg(long, value_name = "DURATION")]
    end_time: Option<String>,

    /// Enable the heterogeneous-CPU placement extensions.
    #[arg(long)]
    hmp: bool,

    /// Print trace events to stderr.
    #[arg(long)]
    dump_trace: bool,

    /// Write the full trace and final statistics as JSON.
    #[arg(long, value_name = "PATH")]
    json: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    if let Err(e) = run(&cli) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut scenario = load_workload(&cli.workload)?;
    if let Some(end_time) = &cli.end_time {
        scenario.duration_ns = parse_duration_ns(end_time)
            .map_err(anyhow::Error::msg)
            .context("--end-time")?;
    }
    if cli.hmp {
        scenario.tunables.hmp.enable = true;
    }

    let trace = Simulator::new(scenario)?.run();

    if cli.dump_trace {
        trace.dump();
    }

    for task in &trace.tasks {
        println!(
            "pid={:<6} {:<16} runtime={:>12}ns migrations={:<4} cpu={}",
            task.pid.0,
            task.name,
            trace.total_runtime(task.pid),
            task.nr_migrations,
            task.cpu.0
        );
    }
    for group in trace.groups.iter().filter(|g| g.nr_throttled > 0) {
        println!(
            "group={:<16} periods={} throttled={} throttled_time={}ns",
            group.name, group.nr_periods, group.nr_throttled, group.throttled_time
        );
    }

    if let Some(path) = &cli.json {
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(file, &trace)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        eprintln!("wrote trace to {}", path.display());
    }

    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}
