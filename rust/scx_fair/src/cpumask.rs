// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Fixed-width CPU sets.
//!
//! A `Cpumask` is a `BitVec` sized to the number of simulated CPUs. Masks are
//! used for task affinity, domain and group spans, frequency domains, and the
//! working set of candidate CPUs during load balancing.

use std::fmt;
use std::ops::BitAndAssign;
use std::ops::BitOrAssign;

use anyhow::bail;
use anyhow::Result;
use bitvec::prelude::*;

use crate::types::CpuId;

#[derive(Debug, Eq, Clone, Hash, PartialEq)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    /// Build an empty mask able to hold `nr_cpus` CPUs.
    pub fn new(nr_cpus: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 0; nr_cpus],
        }
    }

    /// Build a mask with every one of `nr_cpus` CPUs set.
    pub fn full(nr_cpus: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 1; nr_cpus],
        }
    }

    pub fn from_cpus(nr_cpus: usize, cpus: impl IntoIterator<Item = CpuId>) -> Cpumask {
        let mut mask = Cpumask::new(nr_cpus);
        for cpu in cpus {
            mask.set_cpu(cpu);
        }
        mask
    }

    /// Parse a cpulist such as "0-3,6".
    pub fn from_cpulist(nr_cpus: usize, cpulist: &str) -> Result<Cpumask> {
        let mut mask = Cpumask::new(nr_cpus);
        for group in cpulist.trim().split(',').filter(|g| !g.trim().is_empty()) {
            let group = group.trim();
            let (min, max) = match group.split_once('-') {
                Some((lo, hi)) => (lo.trim().parse::<usize>()?, hi.trim().parse::<usize>()?),
                None => {
                    let cpu = group.parse::<usize>()?;
                    (cpu, cpu)
                }
            };
            if max >= nr_cpus || min > max {
                bail!("Invalid cpulist group {} for {} cpus", group, nr_cpus);
            }
            for cpu in min..=max {
                mask.mask.set(cpu, true);
            }
        }
        Ok(mask)
    }

    /// Set a CPU. Out-of-range CPUs are ignored.
    pub fn set_cpu(&mut self, cpu: CpuId) {
        if cpu.idx() < self.mask.len() {
            self.mask.set(cpu.idx(), true);
        }
    }

    pub fn clear_cpu(&mut self, cpu: CpuId) {
        if cpu.idx() < self.mask.len() {
            self.mask.set(cpu.idx(), false);
        }
    }

    pub fn test_cpu(&self, cpu: CpuId) -> bool {
        match self.mask.get(cpu.idx()) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Number of CPUs set.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    pub fn len(&self) -> usize {
        self.mask.len()
    }

    pub fn first(&self) -> Option<CpuId> {
        self.mask.first_one().map(|i| CpuId(i as u32))
    }

    pub fn and(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new &= other;
        new
    }

    pub fn or(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new |= other;
        new
    }

    /// CPUs in `self` that are not in `other`.
    pub fn andnot(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        for cpu in other.iter() {
            new.clear_cpu(cpu);
        }
        new
    }

    pub fn intersects(&self, other: &Cpumask) -> bool {
        self.iter().any(|cpu| other.test_cpu(cpu))
    }

    pub fn is_subset(&self, other: &Cpumask) -> bool {
        self.iter().all(|cpu| other.test_cpu(cpu))
    }

    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        self.mask.iter_ones().map(|i| CpuId(i as u32))
    }
}

impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cpus: Vec<String> = self.iter().map(|c| c.0.to_string()).collect();
        write!(f, "{{{}}}", cpus.join(","))
    }
}

impl BitAndAssign<&Self> for Cpumask {
    fn bitand_assign(&mut self, rhs: &Self) {
        self.mask &= &rhs.mask;
    }
}

impl BitOrAssign<&Self> for Cpumask {
    fn bitor_assign(&mut self, rhs: &Self) {
        self.mask |= &rhs.mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpulist() {
        let mask = Cpumask::from_cpulist(8, "0-2,5").unwrap();
        assert_eq!(mask.weight(), 4);
        assert!(mask.test_cpu(CpuId(5)));
        assert!(!mask.test_cpu(CpuId(3)));
        assert_eq!(mask.to_string(), "{0,1,2,5}");
        assert!(Cpumask::from_cpulist(4, "2-7").is_err());
    }

    #[test]
    fn test_andnot_intersects() {
        let a = Cpumask::from_cpus(4, [CpuId(0), CpuId(1), CpuId(2)]);
        let b = Cpumask::from_cpus(4, [CpuId(1)]);
        let c = a.andnot(&b);
        assert!(!c.test_cpu(CpuId(1)));
        assert!(a.intersects(&b));
        assert!(!c.intersects(&b));
        assert!(b.is_subset(&a));
        assert_eq!(c.first(), Some(CpuId(0)));
    }
}
