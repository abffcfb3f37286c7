//! Layout of the first chunk.
//!
//! The first chunk is set up by architecture code before the allocator
//! runs. [`PcpuAllocInfo`] describes how its units are cut:
//!
//! ```text
//!  unit of one CPU (unit_size bytes)
//! ┌──────────────┬───────────────┬─────────────────┬───────┐
//! │ static       │ reserved      │ dynamic         │ slack │
//! │ (linker)     │ (modules)     │ (alloc_percpu)  │       │
//! └──────────────┴───────────────┴─────────────────┴───────┘
//! ```
//!
//! Units are collected into groups, one per NUMA node. Groups are laid out
//! back to back; a group may carry trailing units that serve no CPU when the
//! allocation granularity does not divide evenly.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use kernel_info::memory::PCPU_MIN_UNIT_SIZE;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, align_up, page_align};
use kernel_vmalloc::NodeId;

/// Reasons a first-chunk layout is rejected.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum LayoutError {
    #[error("the static area is empty")]
    NoStaticArea,
    #[error("the dynamic area is empty")]
    NoDynamicArea,
    #[error("layout has no groups")]
    NoGroups,
    #[error("area sizes overflow")]
    Overflow,
    #[error("unit size {0:#x} is unaligned or below the minimum")]
    BadUnitSize(usize),
    #[error("unit size {unit_size:#x} cannot hold {needed:#x} bytes")]
    UnitTooSmall { unit_size: usize, needed: usize },
    #[error("atom size {0:#x} is not a power of two of at least one page")]
    BadAtomSize(usize),
    #[error("base address {0} is not page aligned")]
    UnalignedBase(VirtualAddress),
    #[error("group at offset {0:#x} overlaps its predecessor")]
    GroupOverlap(usize),
    #[error("cpu {0} does not exist")]
    CpuOutOfRange(usize),
    #[error("cpu {0} is served by more than one unit")]
    DuplicateCpu(usize),
    #[error("cpu {0} has no unit")]
    MissingCpu(usize),
}

/// A run of units serving the CPUs of one node.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PcpuGroupInfo {
    /// Offset of the group's first unit from the chunk base.
    pub base_offset: usize,
    /// CPU served by each unit; `None` for units nobody uses.
    pub cpu_map: Vec<Option<usize>>,
}

impl PcpuGroupInfo {
    #[must_use]
    pub fn nr_units(&self) -> usize {
        self.cpu_map.len()
    }
}

/// Description of the first chunk's layout.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PcpuAllocInfo {
    pub static_size: usize,
    pub reserved_size: usize,
    pub dyn_size: usize,
    pub unit_size: usize,
    /// Granularity of the underlying memory; units are packed into atoms.
    pub atom_size: usize,
    /// Bytes allocated per atom, `unit_size * units_per_atom`.
    pub alloc_size: usize,
    pub groups: Vec<PcpuGroupInfo>,
}

impl PcpuAllocInfo {
    /// Build a layout for `possible_cpus` CPUs.
    ///
    /// The dynamic area is grown so that the three areas fill whole pages,
    /// and the unit never drops below [`PCPU_MIN_UNIT_SIZE`]. CPUs are
    /// grouped by node; the number of units per atom is the one that needs
    /// the fewest atoms without wasting more than a third of the CPUs'
    /// worth of units.
    ///
    /// # Errors
    /// [`LayoutError::BadAtomSize`] for an atom that is not a power-of-two
    /// multiple of the page size, [`LayoutError::Overflow`] if the sizes do
    /// not fit the address space.
    pub fn build(
        static_size: usize,
        reserved_size: usize,
        dyn_size: usize,
        atom_size: usize,
        possible_cpus: usize,
        cpu_to_node: impl Fn(usize) -> NodeId,
    ) -> Result<Self, LayoutError> {
        if !atom_size.is_power_of_two() || atom_size < PAGE_SIZE {
            return Err(LayoutError::BadAtomSize(atom_size));
        }

        let size_sum = static_size
            .checked_add(reserved_size)
            .and_then(|sum| sum.checked_add(dyn_size))
            .and_then(page_align)
            .ok_or(LayoutError::Overflow)?;
        let dyn_size = size_sum - static_size - reserved_size;

        let min_unit_size = size_sum.max(PCPU_MIN_UNIT_SIZE);
        let alloc_size = align_up(min_unit_size, atom_size).ok_or(LayoutError::Overflow)?;
        let fits = |upa: usize| {
            alloc_size.is_multiple_of(upa) && (alloc_size / upa).is_multiple_of(PAGE_SIZE)
        };

        let mut nodes: BTreeMap<NodeId, Vec<usize>> = BTreeMap::new();
        for cpu in 0..possible_cpus {
            nodes.entry(cpu_to_node(cpu)).or_default().push(cpu);
        }

        let max_upa = alloc_size / min_unit_size;
        let mut best_upa = 1;
        let mut last_allocs = usize::MAX;
        for upa in (1..=max_upa).rev().filter(|&upa| fits(upa)) {
            let mut allocs = 0;
            let mut wasted = 0;
            for cpus in nodes.values() {
                let this_allocs = cpus.len().div_ceil(upa);
                allocs += this_allocs;
                wasted += this_allocs * upa - cpus.len();
            }
            if wasted > possible_cpus / 3 {
                continue;
            }
            if allocs > last_allocs {
                break;
            }
            last_allocs = allocs;
            best_upa = upa;
        }

        let unit_size = alloc_size / best_upa;
        let mut groups = Vec::with_capacity(nodes.len());
        let mut base_offset = 0;
        for cpus in nodes.values() {
            let nr_units = cpus.len().div_ceil(best_upa) * best_upa;
            let mut cpu_map: Vec<Option<usize>> = cpus.iter().copied().map(Some).collect();
            cpu_map.resize(nr_units, None);
            groups.push(PcpuGroupInfo {
                base_offset,
                cpu_map,
            });
            base_offset += nr_units * unit_size;
        }

        Ok(Self {
            static_size,
            reserved_size,
            dyn_size,
            unit_size,
            atom_size,
            alloc_size,
            groups,
        })
    }

    /// Total number of units, used or not.
    #[must_use]
    pub fn nr_units(&self) -> usize {
        self.groups.iter().map(PcpuGroupInfo::nr_units).sum()
    }

    /// Bytes from the chunk base to the end of the last unit.
    #[must_use]
    pub fn span(&self) -> usize {
        self.groups
            .iter()
            .map(|group| group.base_offset + group.nr_units() * self.unit_size)
            .max()
            .unwrap_or(0)
    }

    /// Check that the layout is usable for a chunk at `base` serving
    /// `possible_cpus` CPUs.
    ///
    /// # Errors
    /// The first inconsistency found.
    pub fn validate(&self, base: VirtualAddress, possible_cpus: usize) -> Result<(), LayoutError> {
        if !base.is_page_aligned() {
            return Err(LayoutError::UnalignedBase(base));
        }
        if self.static_size == 0 {
            return Err(LayoutError::NoStaticArea);
        }
        if self.dyn_size == 0 {
            return Err(LayoutError::NoDynamicArea);
        }
        if !self.unit_size.is_multiple_of(PAGE_SIZE) || self.unit_size < PCPU_MIN_UNIT_SIZE {
            return Err(LayoutError::BadUnitSize(self.unit_size));
        }
        if !self.atom_size.is_power_of_two() || self.atom_size < PAGE_SIZE {
            return Err(LayoutError::BadAtomSize(self.atom_size));
        }
        let needed = self
            .static_size
            .checked_add(self.reserved_size)
            .and_then(|sum| sum.checked_add(self.dyn_size))
            .ok_or(LayoutError::Overflow)?;
        if needed > self.unit_size {
            return Err(LayoutError::UnitTooSmall {
                unit_size: self.unit_size,
                needed,
            });
        }
        if self.groups.is_empty() {
            return Err(LayoutError::NoGroups);
        }

        let mut groups: Vec<&PcpuGroupInfo> = self.groups.iter().collect();
        groups.sort_unstable_by_key(|group| group.base_offset);
        let mut end = 0;
        for group in groups {
            if group.base_offset < end {
                return Err(LayoutError::GroupOverlap(group.base_offset));
            }
            end = group.base_offset + group.nr_units() * self.unit_size;
        }

        let mut seen = vec![false; possible_cpus];
        for cpu in self.groups.iter().flat_map(|group| group.cpu_map.iter().flatten()) {
            let slot = seen.get_mut(*cpu).ok_or(LayoutError::CpuOutOfRange(*cpu))?;
            if *slot {
                return Err(LayoutError::DuplicateCpu(*cpu));
            }
            *slot = true;
        }
        match seen.iter().position(|seen| !seen) {
            Some(cpu) => Err(LayoutError::MissingCpu(cpu)),
            None => Ok(()),
        }
    }

    /// Offset of each CPU's unit from the chunk base, indexed by CPU.
    /// Only meaningful for a validated layout.
    pub(crate) fn unit_offsets(&self, possible_cpus: usize) -> Vec<usize> {
        let mut offsets = vec![0; possible_cpus];
        for group in &self.groups {
            for (unit, cpu) in group.cpu_map.iter().enumerate() {
                if let Some(cpu) = cpu {
                    offsets[*cpu] = group.base_offset + unit * self.unit_size;
                }
            }
        }
        offsets
    }
}

impl fmt::Display for PcpuAllocInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "s{} r{} d{} u{} alloc={}*{}",
            self.static_size,
            self.reserved_size,
            self.dyn_size,
            self.unit_size,
            self.alloc_size / self.unit_size,
            self.alloc_size,
        )?;
        for (i, group) in self.groups.iter().enumerate() {
            write!(f, " [{i}]")?;
            for cpu in &group.cpu_map {
                match cpu {
                    Some(cpu) => write!(f, " {cpu}")?,
                    None => f.write_str(" -")?,
                }
            }
        }
        Ok(())
    }
}
