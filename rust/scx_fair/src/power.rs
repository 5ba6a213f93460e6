// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Platform power data.
//!
//! Power tables, temperatures and thermal state come from the platform. The
//! scheduler only reads them through [`PowerModel`], so a driver can plug
//! in measured data. [`TablePowerModel`] serves the tables from the
//! topology description and lets a driver set temperatures and throttling.

use crate::topology::{PowerState, Topology};
use crate::types::CpuId;

pub trait PowerModel: Send {
    /// Operating points of `cpu` sorted by frequency, if known.
    fn power_table(&self, cpu: CpuId) -> Option<&[PowerState]>;

    fn cpu_temperature(&self, cpu: CpuId) -> u32;

    /// The platform is about to cap `cpu`'s frequency for thermal reasons.
    fn is_throttling_imminent(&self, cpu: CpuId) -> bool;
}

/// Cost of running `cpu` at `freq` according to `table`: the first point
/// at or above `freq`, or the highest point.
pub fn table_cost(table: &[PowerState], freq: u64) -> Option<u64> {
    table
        .iter()
        .find(|ps| ps.freq >= freq)
        .or_else(|| table.last())
        .map(|ps| ps.power)
}

#[derive(Debug, Clone)]
pub struct TablePowerModel {
    tables: Vec<Vec<PowerState>>,
    temperature: Vec<u32>,
    throttling: Vec<bool>,
}

impl TablePowerModel {
    pub fn new(topo: &Topology) -> Self {
        let tables = (0..topo.nr_cpus)
            .map(|cpu| {
                let mut t = topo.cluster_of(CpuId(cpu as u32)).power.clone();
                t.sort_by_key(|ps| ps.freq);
                t
            })
            .collect();
        Self {
            tables,
            temperature: vec![0; topo.nr_cpus],
            throttling: vec![false; topo.nr_cpus],
        }
    }

    pub fn set_temperature(&mut self, cpu: CpuId, temp: u32) {
        if let Some(t) = self.temperature.get_mut(cpu.idx()) {
            *t = temp;
        }
    }

    pub fn set_throttling(&mut self, cpu: CpuId, throttling: bool) {
        if let Some(t) = self.throttling.get_mut(cpu.idx()) {
            *t = throttling;
        }
    }
}

impl PowerModel for TablePowerModel {
    fn power_table(&self, cpu: CpuId) -> Option<&[PowerState]> {
        match self.tables.get(cpu.idx()) {
            Some(t) if !t.is_empty() => Some(t.as_slice()),
            _ => None,
        }
    }

    fn cpu_temperature(&self, cpu: CpuId) -> u32 {
        self.temperature.get(cpu.idx()).copied().unwrap_or(0)
    }

    fn is_throttling_imminent(&self, cpu: CpuId) -> bool {
        self.throttling.get(cpu.idx()).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::TopologySpec;

    #[test]
    fn test_table_cost_lookup() {
        let table = [
            PowerState { freq: 300, power: 10 },
            PowerState { freq: 600, power: 25 },
            PowerState { freq: 900, power: 60 },
        ];
        assert_eq!(table_cost(&table, 0), Some(10));
        assert_eq!(table_cost(&table, 301), Some(25));
        assert_eq!(table_cost(&table, 900), Some(60));
        assert_eq!(table_cost(&table, 2000), Some(60));
        assert_eq!(table_cost(&[], 100), None);
    }

    #[test]
    fn test_model_defaults() {
        let mut spec = TopologySpec::smp(2);
        spec.clusters[0].power = vec![
            PowerState { freq: 2_000_000, power: 90 },
            PowerState { freq: 500_000, power: 20 },
        ];
        let topo = Topology::new(&spec).unwrap();
        let mut model = TablePowerModel::new(&topo);
        let t = model.power_table(CpuId(1)).unwrap();
        assert_eq!(t[0].freq, 500_000);
        assert!(!model.is_throttling_imminent(CpuId(0)));
        model.set_throttling(CpuId(0), true);
        model.set_temperature(CpuId(0), 70);
        assert!(model.is_throttling_imminent(CpuId(0)));
        assert_eq!(model.cpu_temperature(CpuId(0)), 70);
    }
}
