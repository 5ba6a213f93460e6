// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! JSON workload files.
//!
//! A workload file is a serialized [`Scenario`]. Two conveniences are
//! accepted on top of the plain serde form:
//!
//! - C-style block comments (`/* ... */`) are stripped before parsing.
//! - A top-level `"duration"` string such as `"500ms"` may replace
//!   `"duration_ns"`.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde_json::Value;

use crate::scenario::{parse_duration_ns, Scenario};

pub fn load_workload(path: &Path) -> Result<Scenario> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_workload(&json).with_context(|| format!("Failed to parse {}", path.display()))
}

pub fn parse_workload(json: &str) -> Result<Scenario> {
    let mut value: Value = serde_json::from_str(&strip_comments(json))?;
    if let Some(obj) = value.as_object_mut() {
        if let Some(duration) = obj.remove("duration") {
            let text = duration
                .as_str()
                .ok_or_else(|| anyhow!("\"duration\" must be a string such as \"1s\""))?;
            let ns = parse_duration_ns(text).map_err(|e| anyhow!(e))?;
            obj.insert("duration_ns".to_string(), Value::from(ns));
        }
    }
    let scenario: Scenario = serde_json::from_value(value)?;
    validate(&scenario)?;
    Ok(scenario)
}

fn validate(scenario: &Scenario) -> Result<()> {
    if scenario.duration_ns == 0 {
        bail!("Workload duration must be positive");
    }
    if scenario.topology.cpus.is_empty() {
        bail!("Workload topology has no CPUs");
    }
    let mut pids = BTreeSet::new();
    for task in &scenario.tasks {
        if !pids.insert(task.pid) {
            bail!("Duplicate task pid {}", task.pid.0);
        }
        if task.group.0 as usize > scenario.groups.len() {
            bail!(
                "Task {} ({}) refers to unknown group {}",
                task.pid.0,
                task.name,
                task.group.0
            );
        }
    }
    let mut names = BTreeSet::new();
    for group in &scenario.groups {
        if !names.insert(group.name.as_str()) {
            bail!("Duplicate group {:?}", group.name);
        }
    }
    Ok(())
}

/// Strip C-style block comments (`/* ... */`) outside of strings.
fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                }
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        if c == '/' && chars.peek() == Some(&'*') {
            chars.next();
            let mut prev = '\0';
            for c in chars.by_ref() {
                if prev == '*' && c == '/' {
                    break;
                }
                prev = c;
            }
            continue;
        }
        if c == '"' {
            in_string = true;
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Phase;
    use crate::types::{GroupId, Pid, NSEC_PER_MSEC};

    const WORKLOAD: &str = r#"
    /* two hogs in separate groups */
    {
        "topology": {
            "clusters": [{"efficiency": 1024, "max_freq": 2000000, "min_freq": 500000}],
            "cpus": [{"cluster": 0}, {"cluster": 0}]
        },
        "groups": [{"name": "web", "shares": 2048}],
        "tasks": [
            {"name": "a", "pid": 1, "group": 1,
             "behavior": {"phases": [{"run": 1000000}], "repeat": true}},
            {"name": "b /* not a comment */", "pid": 2,
             "behavior": {"phases": [{"run": 1000000}, {"sleep": 500000}]}}
        ],
        "duration": "250ms"
    }
    "#;

    #[test]
    fn test_parse_workload() {
        let s = parse_workload(WORKLOAD).unwrap();
        assert_eq!(s.duration_ns, 250 * NSEC_PER_MSEC);
        assert_eq!(s.topology.cpus.len(), 2);
        assert_eq!(s.groups[0].shares, Some(2048));
        assert_eq!(s.tasks[0].group, GroupId(1));
        assert_eq!(s.tasks[1].name, "b /* not a comment */");
        assert_eq!(s.tasks[1].pid, Pid(2));
        assert_eq!(s.tasks[1].behavior.phases[1], Phase::Sleep(500_000));
    }

    #[test]
    fn test_rejects_unknown_group() {
        let json = WORKLOAD.replace(r#""group": 1"#, r#""group": 4"#);
        let err = parse_workload(&json).unwrap_err();
        assert!(format!("{err:#}").contains("unknown group 4"));
    }

    #[test]
    fn test_rejects_duplicate_pid() {
        let json = WORKLOAD.replace(r#""pid": 2"#, r#""pid": 1"#);
        assert!(parse_workload(&json).is_err());
    }

    #[test]
    fn test_rejects_bad_duration() {
        let json = WORKLOAD.replace(r#""250ms""#, r#""soon""#);
        assert!(parse_workload(&json).is_err());
    }
}
