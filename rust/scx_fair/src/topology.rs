// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! CPU topology and scheduling domains.
//!
//! A [`TopologySpec`] describes clusters (CPUs sharing a frequency domain
//! and a capacity class) and the CPUs in them. [`Topology::new`] turns it
//! into derived capacities and a per-CPU stack of scheduling domains:
//!
//! - MC: the CPU's cluster, one group per CPU
//! - DIE: the CPU's memory node, one group per cluster
//! - NUMA: the whole system, one group per node
//!
//! Levels with a single group are dropped. Group capacity state is shared
//! by every domain that contains the same group, so an imbalance flagged
//! by one CPU is seen by the others when they balance the parent level.

use std::collections::BTreeMap;

use anyhow::bail;
use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::cpumask::Cpumask;
use crate::pelt::SCHED_CAPACITY_SCALE;
use crate::types::{ClusterId, CpuId, NodeId};

pub const SD_LOAD_BALANCE: u32 = 0x0001;
pub const SD_BALANCE_NEWIDLE: u32 = 0x0002;
pub const SD_BALANCE_EXEC: u32 = 0x0004;
pub const SD_BALANCE_FORK: u32 = 0x0008;
pub const SD_BALANCE_WAKE: u32 = 0x0010;
pub const SD_WAKE_AFFINE: u32 = 0x0020;
pub const SD_SHARE_PKG_RESOURCES: u32 = 0x0200;
pub const SD_SERIALIZE: u32 = 0x0400;
pub const SD_PREFER_SIBLING: u32 = 0x1000;
pub const SD_NUMA: u32 = 0x4000;

const SD_DEFAULT_FLAGS: u32 =
    SD_LOAD_BALANCE | SD_BALANCE_NEWIDLE | SD_BALANCE_EXEC | SD_BALANCE_FORK | SD_WAKE_AFFINE;

/// One operating point of a cluster's power table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerState {
    pub freq: u64,
    pub power: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDesc {
    /// Relative instructions-per-cycle. Higher is faster per MHz.
    pub efficiency: u64,
    /// Frequencies are in kHz.
    pub max_freq: u64,
    #[serde(default)]
    pub min_freq: u64,
    /// Defaults to `max_freq`.
    #[serde(default)]
    pub cur_freq: Option<u64>,
    /// Defaults to `max_freq`.
    #[serde(default)]
    pub max_possible_freq: Option<u64>,
    #[serde(default)]
    pub power: Vec<PowerState>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuDesc {
    pub cluster: u32,
    pub node: u32,
    /// Overrides the system-wide mostly-idle thresholds.
    pub mostly_idle_load_pct: Option<u32>,
    pub mostly_idle_nr_run: Option<u32>,
    /// Below this cluster frequency small tasks are packed. Zero disables.
    pub mostly_idle_freq: u64,
    pub prefer_idle: bool,
    pub static_cpu_pwr_cost: u64,
    pub static_cluster_pwr_cost: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySpec {
    pub clusters: Vec<ClusterDesc>,
    pub cpus: Vec<CpuDesc>,
}

impl TopologySpec {
    /// `nr_cpus` identical CPUs in one cluster.
    pub fn smp(nr_cpus: u32) -> Self {
        Self::clustered(&[(nr_cpus, 1024, 2_000_000)])
    }

    /// One cluster per `(nr_cpus, efficiency, max_freq)` entry, all on
    /// node 0.
    pub fn clustered(clusters: &[(u32, u64, u64)]) -> Self {
        let mut spec = TopologySpec {
            clusters: Vec::new(),
            cpus: Vec::new(),
        };
        for (i, &(nr, efficiency, max_freq)) in clusters.iter().enumerate() {
            spec.clusters.push(ClusterDesc {
                efficiency,
                max_freq,
                min_freq: max_freq / 4,
                cur_freq: None,
                max_possible_freq: None,
                power: Vec::new(),
            });
            for _ in 0..nr {
                spec.cpus.push(CpuDesc {
                    cluster: i as u32,
                    ..Default::default()
                });
            }
        }
        spec
    }

    /// Put CPUs of `cluster` on memory node `node`.
    pub fn with_node(mut self, cluster: u32, node: u32) -> Self {
        for cpu in self.cpus.iter_mut().filter(|c| c.cluster == cluster) {
            cpu.node = node;
        }
        self
    }
}

/// Indexes into a CPU's decayed load history used at each idle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadIdx {
    pub busy: usize,
    pub idle: usize,
    pub newidle: usize,
    pub wake: usize,
    pub forkexec: usize,
}

/// Capacity state of a group, shared across the CPUs that see it.
#[derive(Debug, Clone, Default)]
pub struct SgCapacity {
    pub capacity: u64,
    /// Set when the group could not be balanced because of affinity.
    pub imbalance: bool,
    /// In jiffies.
    pub next_update: u64,
}

#[derive(Debug, Clone)]
pub struct SchedGroup {
    pub cpus: Cpumask,
    /// Index into [`Topology::sgc`].
    pub sgc: usize,
    pub group_weight: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainLevel {
    Mc,
    Die,
    Numa,
}

#[derive(Debug, Clone)]
pub struct SchedDomain {
    pub level: DomainLevel,
    pub span: Cpumask,
    pub flags: u32,
    pub imbalance_pct: u64,
    pub cache_nice_tries: u32,
    pub busy_factor: u64,
    /// Intervals are in milliseconds.
    pub min_interval: u64,
    pub max_interval: u64,
    pub balance_interval: u64,
    pub nr_balance_failed: u32,
    /// In jiffies.
    pub last_balance: u64,
    /// In nanoseconds.
    pub max_newidle_lb_cost: u64,
    /// In jiffies.
    pub next_decay_max_lb_cost: u64,
    pub idx: LoadIdx,
    /// The group containing the owning CPU comes first.
    pub groups: Vec<SchedGroup>,
}

impl SchedDomain {
    pub fn weight(&self) -> usize {
        self.span.weight()
    }

    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

#[derive(Debug, Clone)]
pub struct Cluster {
    pub id: ClusterId,
    pub cpus: Cpumask,
    pub efficiency: u64,
    pub max_freq: u64,
    pub min_freq: u64,
    pub cur_freq: u64,
    pub max_possible_freq: u64,
    /// Capacity at `max_freq`, 1024 for the slowest cluster.
    pub capacity: u64,
    pub max_possible_capacity: u64,
    /// Multiplier (1024 = none) turning a demand measured on the fastest
    /// CPU into the demand it places on this cluster.
    pub load_scale_factor: u64,
    pub power: Vec<PowerState>,
}

#[derive(Debug, Clone)]
pub struct CpuTopo {
    pub cluster: ClusterId,
    pub node: NodeId,
    pub desc: CpuDesc,
}

#[derive(Debug, Clone)]
pub struct Topology {
    pub nr_cpus: usize,
    pub nr_nodes: usize,
    pub clusters: Vec<Cluster>,
    pub cpus: Vec<CpuTopo>,
    /// Per-CPU domain stack, lowest level first.
    pub domains: Vec<Vec<SchedDomain>>,
    pub sgc: Vec<SgCapacity>,
    pub min_capacity: u64,
    pub max_capacity: u64,
    pub max_possible_capacity: u64,
    pub min_max_freq: u64,
    pub max_possible_freq: u64,
    pub max_possible_efficiency: u64,
    pub min_possible_efficiency: u64,
    pub max_load_scale_factor: u64,
    /// CPUs whose cluster can reach the highest capacity in the system.
    pub mpc_mask: Cpumask,
    pub node_masks: Vec<Cpumask>,
}

impl Topology {
    pub fn new(spec: &TopologySpec) -> Result<Topology> {
        if spec.cpus.is_empty() {
            bail!("Topology has no CPUs");
        }
        if spec.clusters.is_empty() {
            bail!("Topology has no clusters");
        }
        let nr_cpus = spec.cpus.len();

        for (i, c) in spec.clusters.iter().enumerate() {
            if c.efficiency == 0 || c.max_freq == 0 {
                bail!("Cluster {} needs a non-zero efficiency and max_freq", i);
            }
            if c.max_possible_freq.unwrap_or(c.max_freq) < c.max_freq {
                bail!("Cluster {} max_possible_freq is below max_freq", i);
            }
        }

        let mut cluster_cpus = vec![Cpumask::new(nr_cpus); spec.clusters.len()];
        let nr_nodes = spec.cpus.iter().map(|c| c.node as usize + 1).max().unwrap_or(1);
        let mut node_masks = vec![Cpumask::new(nr_cpus); nr_nodes];
        let mut cluster_node: Vec<Option<u32>> = vec![None; spec.clusters.len()];
        for (cpu, desc) in spec.cpus.iter().enumerate() {
            let cl = desc.cluster as usize;
            if cl >= spec.clusters.len() {
                bail!("CPU {} refers to unknown cluster {}", cpu, desc.cluster);
            }
            match cluster_node[cl] {
                Some(n) if n != desc.node => {
                    bail!("Cluster {} spans more than one node", cl);
                }
                _ => cluster_node[cl] = Some(desc.node),
            }
            cluster_cpus[cl].set_cpu(CpuId(cpu as u32));
            node_masks[desc.node as usize].set_cpu(CpuId(cpu as u32));
        }
        if cluster_cpus.iter().any(|m| m.is_empty()) {
            bail!("Every cluster needs at least one CPU");
        }
        if node_masks.iter().any(|m| m.is_empty()) {
            bail!("Memory nodes must be numbered densely from 0");
        }

        let min_max_freq = spec.clusters.iter().map(|c| c.max_freq).min().unwrap_or(1);
        let max_possible_freq = spec
            .clusters
            .iter()
            .map(|c| c.max_possible_freq.unwrap_or(c.max_freq))
            .max()
            .unwrap_or(1);
        let max_eff = spec.clusters.iter().map(|c| c.efficiency).max().unwrap_or(1);
        let min_eff = spec.clusters.iter().map(|c| c.efficiency).min().unwrap_or(1);

        let mut clusters = Vec::new();
        for (i, c) in spec.clusters.iter().enumerate() {
            let mpf = c.max_possible_freq.unwrap_or(c.max_freq);
            let capacity = SCHED_CAPACITY_SCALE * c.efficiency / min_eff * c.max_freq / min_max_freq;
            let max_possible_capacity =
                SCHED_CAPACITY_SCALE * c.efficiency / min_eff * mpf / min_max_freq;
            let load_scale_factor =
                SCHED_CAPACITY_SCALE * max_eff / c.efficiency * max_possible_freq / c.max_freq;
            clusters.push(Cluster {
                id: ClusterId(i as u32),
                cpus: cluster_cpus[i].clone(),
                efficiency: c.efficiency,
                max_freq: c.max_freq,
                min_freq: c.min_freq,
                cur_freq: c.cur_freq.unwrap_or(c.max_freq).min(c.max_freq),
                max_possible_freq: mpf,
                capacity,
                max_possible_capacity,
                load_scale_factor,
                power: c.power.clone(),
            });
        }

        let cpus: Vec<CpuTopo> = spec
            .cpus
            .iter()
            .map(|d| CpuTopo {
                cluster: ClusterId(d.cluster),
                node: NodeId(d.node),
                desc: d.clone(),
            })
            .collect();

        let max_possible_capacity = clusters
            .iter()
            .map(|c| c.max_possible_capacity)
            .max()
            .unwrap_or(SCHED_CAPACITY_SCALE);
        let mut mpc_mask = Cpumask::new(nr_cpus);
        for c in clusters
            .iter()
            .filter(|c| c.max_possible_capacity == max_possible_capacity)
        {
            mpc_mask |= &c.cpus;
        }

        let mut topo = Topology {
            nr_cpus,
            nr_nodes,
            min_capacity: clusters.iter().map(|c| c.capacity).min().unwrap_or(1024),
            max_capacity: clusters.iter().map(|c| c.capacity).max().unwrap_or(1024),
            max_possible_capacity,
            max_load_scale_factor: clusters
                .iter()
                .map(|c| c.load_scale_factor)
                .max()
                .unwrap_or(1024),
            clusters,
            cpus,
            domains: Vec::new(),
            sgc: Vec::new(),
            min_max_freq,
            max_possible_freq,
            max_possible_efficiency: max_eff,
            min_possible_efficiency: min_eff,
            mpc_mask,
            node_masks,
        };
        topo.rebuild_domains(&Cpumask::full(nr_cpus));
        Ok(topo)
    }

    /// Rebuild every CPU's domain stack over `active` only. Offline CPUs
    /// get no domains and drop out of every span and group.
    pub(crate) fn rebuild_domains(&mut self, active: &Cpumask) {
        let n = self.nr_cpus;
        let mut sgc_index: BTreeMap<(u8, String), usize> = BTreeMap::new();
        let mut sgc: Vec<SgCapacity> = Vec::new();
        let mut domains = Vec::with_capacity(n);

        for cpu in 0..n {
            let cpu_id = CpuId(cpu as u32);
            let mut stack: Vec<SchedDomain> = Vec::new();
            if !active.test_cpu(cpu_id) {
                domains.push(stack);
                continue;
            }
            let cluster = &self.clusters[self.cpus[cpu].cluster.0 as usize];
            let node = self.cpus[cpu].node.0 as usize;
            let node_span = self.node_masks[node].and(active);

            // MC
            let mc_span = cluster.cpus.and(active);
            let mc_groups: Vec<Cpumask> = mc_span
                .iter()
                .map(|c| Cpumask::from_cpus(n, [c]))
                .collect();
            // DIE
            let die_groups: Vec<Cpumask> = self
                .clusters
                .iter()
                .filter(|c| c.cpus.is_subset(&self.node_masks[node]))
                .map(|c| c.cpus.and(active))
                .filter(|m| !m.is_empty())
                .collect();
            // NUMA
            let numa_groups: Vec<Cpumask> = self
                .node_masks
                .iter()
                .map(|m| m.and(active))
                .filter(|m| !m.is_empty())
                .collect();

            let levels = [
                (DomainLevel::Mc, mc_span, mc_groups),
                (DomainLevel::Die, node_span, die_groups),
                (DomainLevel::Numa, active.clone(), numa_groups),
            ];

            for (level, span, group_masks) in levels {
                if group_masks.len() < 2 {
                    continue;
                }
                let mut groups: Vec<SchedGroup> = Vec::new();
                for mask in group_masks {
                    let key = (level as u8, mask.to_string());
                    let idx = *sgc_index.entry(key).or_insert_with(|| {
                        sgc.push(SgCapacity {
                            capacity: SCHED_CAPACITY_SCALE * mask.weight() as u64,
                            imbalance: false,
                            next_update: 0,
                        });
                        sgc.len() - 1
                    });
                    let group = SchedGroup {
                        group_weight: mask.weight(),
                        cpus: mask,
                        sgc: idx,
                    };
                    if group.cpus.test_cpu(cpu_id) {
                        groups.insert(0, group);
                    } else {
                        groups.push(group);
                    }
                }
                stack.push(Self::init_domain(level, span, groups));
            }
            domains.push(stack);
        }
        self.domains = domains;
        self.sgc = sgc;
    }

    fn init_domain(level: DomainLevel, span: Cpumask, groups: Vec<SchedGroup>) -> SchedDomain {
        let weight = span.weight() as u64;
        let (flags, imbalance_pct, cache_nice_tries, idx) = match level {
            DomainLevel::Mc => (
                SD_DEFAULT_FLAGS | SD_SHARE_PKG_RESOURCES,
                117,
                1,
                LoadIdx {
                    busy: 2,
                    ..Default::default()
                },
            ),
            DomainLevel::Die => (
                SD_DEFAULT_FLAGS | SD_PREFER_SIBLING,
                125,
                1,
                LoadIdx {
                    busy: 2,
                    idle: 1,
                    ..Default::default()
                },
            ),
            DomainLevel::Numa => (
                (SD_DEFAULT_FLAGS | SD_NUMA | SD_SERIALIZE)
                    & !(SD_BALANCE_EXEC | SD_BALANCE_FORK | SD_WAKE_AFFINE),
                125,
                2,
                LoadIdx {
                    busy: 3,
                    idle: 2,
                    ..Default::default()
                },
            ),
        };
        SchedDomain {
            level,
            span,
            flags,
            imbalance_pct,
            cache_nice_tries,
            busy_factor: 32,
            min_interval: weight,
            max_interval: 2 * weight,
            balance_interval: weight,
            nr_balance_failed: 0,
            last_balance: 0,
            max_newidle_lb_cost: 0,
            next_decay_max_lb_cost: 0,
            idx,
            groups,
        }
    }

    pub fn cluster_of(&self, cpu: CpuId) -> &Cluster {
        &self.clusters[self.cpus[cpu.idx()].cluster.0 as usize]
    }

    pub fn node_of(&self, cpu: CpuId) -> NodeId {
        self.cpus[cpu.idx()].node
    }

    /// HMP capacity of the CPU's cluster at its max frequency.
    pub fn capacity(&self, cpu: CpuId) -> u64 {
        self.cluster_of(cpu).capacity
    }

    pub fn max_possible_capacity(&self, cpu: CpuId) -> u64 {
        self.cluster_of(cpu).max_possible_capacity
    }

    pub fn load_scale_factor(&self, cpu: CpuId) -> u64 {
        self.cluster_of(cpu).load_scale_factor
    }

    /// Capacity on the 0..=1024 scale used by the load balancer.
    pub fn capacity_orig(&self, cpu: CpuId) -> u64 {
        SCHED_CAPACITY_SCALE * self.capacity(cpu) / self.max_capacity.max(1)
    }

    /// Efficiency relative to the most efficient cluster, 1024 = same.
    pub fn efficiency_factor(&self, cpu: CpuId) -> u64 {
        SCHED_CAPACITY_SCALE * self.cluster_of(cpu).efficiency / self.max_possible_efficiency.max(1)
    }

    pub fn same_cluster(&self, a: CpuId, b: CpuId) -> bool {
        self.cpus[a.idx()].cluster == self.cpus[b.idx()].cluster
    }

    /// CPUs that share a frequency domain with `cpu`.
    pub fn freq_domain(&self, cpu: CpuId) -> &Cpumask {
        &self.cluster_of(cpu).cpus
    }

    /// Last-level cache domain. Falls back to just the CPU.
    pub fn llc_span(&self, cpu: CpuId) -> Cpumask {
        self.domains[cpu.idx()]
            .iter()
            .filter(|sd| sd.has(SD_SHARE_PKG_RESOURCES))
            .last()
            .map(|sd| sd.span.clone())
            .unwrap_or_else(|| Cpumask::from_cpus(self.nr_cpus, [cpu]))
    }

    pub fn llc_size(&self, cpu: CpuId) -> usize {
        self.llc_span(cpu).weight()
    }

    pub fn cpus_share_cache(&self, a: CpuId, b: CpuId) -> bool {
        self.llc_span(a).test_cpu(b)
    }

    /// Clusters ordered by ascending capacity.
    pub fn clusters_by_capacity(&self) -> Vec<ClusterId> {
        let mut ids: Vec<ClusterId> = self.clusters.iter().map(|c| c.id).collect();
        ids.sort_by_key(|id| (self.clusters[id.0 as usize].capacity, id.0));
        ids
    }

    pub fn hmp_capable(&self) -> bool {
        self.mpc_mask.weight() != self.nr_cpus
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_little_capacity() {
        let spec = TopologySpec::clustered(&[(2, 1024, 1_000_000), (2, 2048, 2_000_000)]);
        let topo = Topology::new(&spec).unwrap();
        assert_eq!(topo.min_capacity, 1024);
        assert_eq!(topo.max_capacity, 4096);
        assert_eq!(topo.capacity_orig(CpuId(0)), 256);
        assert_eq!(topo.capacity_orig(CpuId(3)), 1024);
        // Demand measured on the big core is four times heavier on a little one.
        assert_eq!(topo.load_scale_factor(CpuId(0)), 4096);
        assert_eq!(topo.load_scale_factor(CpuId(2)), 1024);
        assert!(topo.hmp_capable());
        assert_eq!(
            topo.clusters_by_capacity(),
            vec![ClusterId(0), ClusterId(1)]
        );
    }

    #[test]
    fn test_domain_levels() {
        let spec = TopologySpec::clustered(&[(2, 1024, 1_000_000), (2, 1024, 1_000_000)]);
        let topo = Topology::new(&spec).unwrap();
        let sds = &topo.domains[1];
        assert_eq!(sds.len(), 2);
        assert_eq!(sds[0].level, DomainLevel::Mc);
        assert_eq!(sds[0].span.to_string(), "{0,1}");
        assert!(sds[0].groups[0].cpus.test_cpu(CpuId(1)));
        assert_eq!(sds[1].level, DomainLevel::Die);
        assert!(sds[1].has(SD_PREFER_SIBLING));
        assert_eq!(sds[1].groups.len(), 2);
        assert!(sds[1].groups[0].cpus.test_cpu(CpuId(1)));
        // CPU 2 sees the same group capacity objects in a different order.
        let sd2 = &topo.domains[2][1];
        assert_eq!(sd2.groups[1].sgc, sds[1].groups[0].sgc);
        assert_eq!(topo.llc_size(CpuId(0)), 2);
        assert!(topo.cpus_share_cache(CpuId(0), CpuId(1)));
        assert!(!topo.cpus_share_cache(CpuId(0), CpuId(2)));
    }

    #[test]
    fn test_single_cpu_clusters_drop_mc() {
        let spec = TopologySpec::clustered(&[(1, 1024, 1_000_000), (1, 1024, 1_000_000)]);
        let topo = Topology::new(&spec).unwrap();
        assert_eq!(topo.domains[0].len(), 1);
        assert_eq!(topo.domains[0][0].level, DomainLevel::Die);
        assert_eq!(topo.llc_size(CpuId(0)), 1);
    }

    #[test]
    fn test_numa_level() {
        let spec = TopologySpec::clustered(&[(2, 1024, 1_000_000), (2, 1024, 1_000_000)])
            .with_node(1, 1);
        let topo = Topology::new(&spec).unwrap();
        let sds = &topo.domains[0];
        assert_eq!(sds.len(), 2);
        assert_eq!(sds[1].level, DomainLevel::Numa);
        assert!(!sds[1].has(SD_WAKE_AFFINE));
        assert_eq!(sds[1].cache_nice_tries, 2);
    }

    #[test]
    fn test_bad_spec_rejected() {
        let mut spec = TopologySpec::smp(2);
        spec.cpus[1].cluster = 3;
        assert!(Topology::new(&spec).is_err());
        let spec = TopologySpec {
            clusters: vec![],
            cpus: vec![],
        };
        assert!(Topology::new(&spec).is_err());
    }
}
