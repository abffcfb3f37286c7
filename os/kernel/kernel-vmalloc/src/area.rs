//! The vmap area registry.
//!
//! Every reserved range of kernel virtual address space is a [`VmapArea`],
//! kept in an ordered map keyed by start address. The registry answers
//! "which area contains this address" and finds the lowest free gap for a new
//! reservation. A small cache remembers where the last search ended so that
//! consecutive allocations do not rescan the same fully occupied prefix.
//!
//! ```text
//!  vstart                                                        vend
//!    │ ┌─────┐ ┌───────┐    hole    ┌───┐ ┌──────┐                │
//!    ├─┤ va0 ├─┤  va1  ├────────────┤va2├─┤ va3  ├────────────────┤
//!    │ └─────┘ └───────┘            └───┘ └──────┘                │
//!                                           ▲
//!                                        anchor: last insert,
//!                                        search resumes after it
//! ```
//!
//! The registry itself is not synchronized; [`Vmalloc`](crate::Vmalloc)
//! wraps it in a spin lock.

use crate::vm_struct::VmStruct;
use alloc::collections::BTreeMap;
use bitflags::bitflags;
use core::ops::Bound::{Excluded, Unbounded};
use kernel_memory_addresses::{PAGE_SHIFT, VirtualAddress, align_up};
use log::error;

bitflags! {
    /// Lifecycle state of a vmap area.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct VmapAreaFlags: u32 {
        /// Released by its owner, waiting for the next purge.
        const LAZY_FREE = 1 << 0;
        /// Picked up by a running purge.
        const LAZY_FREEING = 1 << 1;
        /// Owned by a VM area descriptor.
        const VM_AREA = 1 << 2;
    }
}

/// Who owns a vmap area.
#[derive(Debug)]
pub(crate) enum AreaOwner {
    /// Plain reservation (large `vm_map_ram` mappings).
    None,
    /// A VM area.
    Vm(VmStruct),
    /// A per-CPU vmap block.
    Block,
}

/// A reserved range `[start, end)` of kernel virtual address space.
#[derive(Debug)]
pub(crate) struct VmapArea {
    pub start: usize,
    pub end: usize,
    pub flags: VmapAreaFlags,
    pub owner: AreaOwner,
}

impl VmapArea {
    pub const fn pages(&self) -> usize {
        (self.end - self.start) >> PAGE_SHIFT
    }

    pub const fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end
    }

    pub fn vm(&self) -> Option<&VmStruct> {
        match &self.owner {
            AreaOwner::Vm(vm) if self.flags.contains(VmapAreaFlags::VM_AREA) => Some(vm),
            _ => None,
        }
    }

    pub fn vm_mut(&mut self) -> Option<&mut VmStruct> {
        match &mut self.owner {
            AreaOwner::Vm(vm) if self.flags.contains(VmapAreaFlags::VM_AREA) => Some(vm),
            _ => None,
        }
    }

    pub fn info(&self) -> VmapAreaInfo {
        let kind = match self.owner {
            AreaOwner::None => AreaKind::Plain,
            AreaOwner::Vm(_) => AreaKind::VmArea,
            AreaOwner::Block => AreaKind::Block,
        };
        VmapAreaInfo {
            start: VirtualAddress::new(self.start),
            end: VirtualAddress::new(self.end),
            flags: self.flags,
            kind,
        }
    }
}

/// What a vmap area is used for.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AreaKind {
    Plain,
    VmArea,
    Block,
}

/// Snapshot of one registered vmap area.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct VmapAreaInfo {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
    pub flags: VmapAreaFlags,
    pub kind: AreaKind,
}

impl VmapAreaInfo {
    /// `true` once the owner released the area.
    #[must_use]
    pub const fn is_lazy(&self) -> bool {
        self.flags
            .intersects(VmapAreaFlags::LAZY_FREE.union(VmapAreaFlags::LAZY_FREEING))
    }
}

/// Where the previous search ended, and under which parameters.
#[derive(Debug)]
struct FreeAreaCache {
    /// Start of the most recently inserted area.
    anchor: Option<usize>,
    /// Largest hole skipped below the anchor.
    hole_size: usize,
    vstart: usize,
    vend: usize,
    align: usize,
}

impl FreeAreaCache {
    const fn new() -> Self {
        Self {
            anchor: None,
            hole_size: 0,
            vstart: 0,
            vend: 0,
            align: 0,
        }
    }

    /// Whether a search for `size`/`align` in `[vstart, vend)` may resume at
    /// the anchor. Anything that could fit below the anchor forces a rescan.
    const fn usable_for(&self, size: usize, align: usize, vstart: usize, vend: usize) -> bool {
        self.anchor.is_some()
            && size >= self.hole_size
            && vstart >= self.vstart
            && vend == self.vend
            && align >= self.align
    }

    const fn reset(&mut self) {
        self.anchor = None;
        self.hole_size = 0;
    }
}

/// Ordered set of non-overlapping vmap areas.
#[derive(Debug)]
pub(crate) struct VmapAreaRegistry {
    areas: BTreeMap<usize, VmapArea>,
    cache: FreeAreaCache,
}

impl VmapAreaRegistry {
    pub const fn new() -> Self {
        Self {
            areas: BTreeMap::new(),
            cache: FreeAreaCache::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.areas.len()
    }

    /// Reserve the lowest `align`-aligned range of `size` bytes inside
    /// `[vstart, vend)` and register it. Returns the start address, or `None`
    /// if no gap is large enough.
    ///
    /// `size` must be a non-zero multiple of the page size and `align` a
    /// power of two.
    pub fn alloc(&mut self, size: usize, align: usize, vstart: usize, vend: usize) -> Option<usize> {
        debug_assert!(size != 0 && size.trailing_zeros() >= PAGE_SHIFT);
        debug_assert!(align.is_power_of_two());

        if !self.cache.usable_for(size, align, vstart, vend) {
            self.cache.reset();
        }
        self.cache.vstart = vstart;
        self.cache.vend = vend;
        self.cache.align = align;

        let (mut addr, first) = self.search_start(size, align, vstart)?;

        // Step over every area that overlaps [addr, addr + size), recording
        // the largest hole passed on the way.
        if let Some(mut key) = first {
            loop {
                let area = &self.areas[&key];
                let tail = addr.checked_add(size)?;
                if tail <= area.start || tail > vend {
                    break;
                }
                if addr.saturating_add(self.cache.hole_size) < area.start {
                    self.cache.hole_size = area.start - addr;
                }
                addr = align_up(area.end, align)?;
                addr.checked_add(size)?;
                match self.next_key(key) {
                    Some(next) => key = next,
                    None => break,
                }
            }
        }

        let end = addr.checked_add(size)?;
        if end > vend {
            return None;
        }

        self.insert(VmapArea {
            start: addr,
            end,
            flags: VmapAreaFlags::empty(),
            owner: AreaOwner::None,
        });
        self.cache.anchor = Some(addr);
        Some(addr)
    }

    /// Candidate address and the first area that may collide with it.
    fn search_start(&mut self, size: usize, align: usize, vstart: usize) -> Option<(usize, Option<usize>)> {
        if let Some(anchor) = self.cache.anchor {
            let addr = align_up(self.areas[&anchor].end, align)?;
            if addr >= vstart {
                addr.checked_add(size)?;
                return Some((addr, Some(anchor)));
            }
            self.cache.reset();
        }

        let addr = align_up(vstart, align)?;
        addr.checked_add(size)?;
        Some((addr, self.first_ending_at_or_after(addr)))
    }

    /// Lowest area whose end is at or above `addr`.
    fn first_ending_at_or_after(&self, addr: usize) -> Option<usize> {
        if let Some((&start, area)) = self.areas.range(..=addr).next_back()
            && area.end >= addr
        {
            return Some(start);
        }
        self.areas
            .range((Excluded(addr), Unbounded))
            .next()
            .map(|(&start, _)| start)
    }

    fn next_key(&self, key: usize) -> Option<usize> {
        self.areas
            .range((Excluded(key), Unbounded))
            .next()
            .map(|(&start, _)| start)
    }

    fn prev_key(&self, key: usize) -> Option<usize> {
        self.areas.range(..key).next_back().map(|(&start, _)| start)
    }

    fn insert(&mut self, area: VmapArea) {
        if let Some((_, prev)) = self.areas.range(..=area.start).next_back() {
            assert!(
                prev.end <= area.start,
                "vmap area {:#x}..{:#x} overlaps {:#x}..{:#x}",
                area.start,
                area.end,
                prev.start,
                prev.end
            );
        }
        if let Some((_, next)) = self.areas.range(area.start..).next() {
            assert!(
                area.end <= next.start,
                "vmap area {:#x}..{:#x} overlaps {:#x}..{:#x}",
                area.start,
                area.end,
                next.start,
                next.end
            );
        }
        self.areas.insert(area.start, area);
    }

    /// The area containing `addr`.
    pub fn find(&self, addr: usize) -> Option<&VmapArea> {
        self.areas
            .range(..=addr)
            .next_back()
            .map(|(_, area)| area)
            .filter(|area| area.contains(addr))
    }

    pub fn find_mut(&mut self, addr: usize) -> Option<&mut VmapArea> {
        self.areas
            .range_mut(..=addr)
            .next_back()
            .map(|(_, area)| area)
            .filter(|area| area.contains(addr))
    }

    /// The area starting exactly at `start`.
    pub fn get_mut(&mut self, start: usize) -> Option<&mut VmapArea> {
        self.areas.get_mut(&start)
    }

    pub fn iter(&self) -> impl Iterator<Item = &VmapArea> {
        self.areas.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut VmapArea> {
        self.areas.values_mut()
    }

    /// Unregister the area starting at `start`, keeping the search cache
    /// consistent: if the area lies at or below the anchor, the anchor moves
    /// to the preceding area so the freed gap is seen by the next search.
    pub fn remove(&mut self, start: usize) -> VmapArea {
        let Some(area) = self.areas.remove(&start) else {
            error!("removing unknown vmap area at {start:#x}");
            panic!("removing unknown vmap area at {start:#x}");
        };

        if let Some(anchor) = self.cache.anchor {
            if area.end < self.cache.vstart {
                self.cache.anchor = None;
            } else if area.start <= anchor {
                self.cache.anchor = self.prev_key(area.start);
            }
        }
        area
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::PAGE_SIZE;

    const VSTART: usize = 0x10_0000;
    const VEND: usize = 0x20_0000;

    fn spans(reg: &VmapAreaRegistry) -> Vec<(usize, usize)> {
        reg.iter().map(|a| (a.start, a.end)).collect()
    }

    #[test]
    fn lowest_fit_first() {
        let mut reg = VmapAreaRegistry::new();
        let a = reg.alloc(PAGE_SIZE, PAGE_SIZE, VSTART, VEND).unwrap();
        let b = reg.alloc(2 * PAGE_SIZE, PAGE_SIZE, VSTART, VEND).unwrap();
        let c = reg.alloc(PAGE_SIZE, PAGE_SIZE, VSTART, VEND).unwrap();
        assert_eq!(a, VSTART);
        assert_eq!(b, VSTART + PAGE_SIZE);
        assert_eq!(c, VSTART + 3 * PAGE_SIZE);
    }

    #[test]
    fn freed_gap_is_reused() {
        let mut reg = VmapAreaRegistry::new();
        let a = reg.alloc(PAGE_SIZE, PAGE_SIZE, VSTART, VEND).unwrap();
        let b = reg.alloc(PAGE_SIZE, PAGE_SIZE, VSTART, VEND).unwrap();
        let _c = reg.alloc(PAGE_SIZE, PAGE_SIZE, VSTART, VEND).unwrap();
        reg.remove(b);
        assert_eq!(reg.alloc(PAGE_SIZE, PAGE_SIZE, VSTART, VEND), Some(b));
        reg.remove(a);
        assert_eq!(reg.alloc(PAGE_SIZE, PAGE_SIZE, VSTART, VEND), Some(a));
    }

    #[test]
    fn smaller_request_finds_skipped_hole() {
        let mut reg = VmapAreaRegistry::new();
        let _a = reg.alloc(PAGE_SIZE, PAGE_SIZE, VSTART, VEND).unwrap();
        let hole = reg.alloc(2 * PAGE_SIZE, PAGE_SIZE, VSTART, VEND).unwrap();
        let _c = reg.alloc(PAGE_SIZE, PAGE_SIZE, VSTART, VEND).unwrap();
        reg.remove(hole);

        // Too large for the two-page hole: lands at the top and remembers the hole.
        let big = reg.alloc(3 * PAGE_SIZE, PAGE_SIZE, VSTART, VEND).unwrap();
        assert_eq!(big, VSTART + 4 * PAGE_SIZE);

        // A request smaller than the skipped hole rescans from the bottom.
        assert_eq!(reg.alloc(PAGE_SIZE, PAGE_SIZE, VSTART, VEND), Some(hole));
    }

    #[test]
    fn alignment_is_honored() {
        let mut reg = VmapAreaRegistry::new();
        reg.alloc(PAGE_SIZE, PAGE_SIZE, VSTART, VEND).unwrap();
        let aligned = reg.alloc(PAGE_SIZE, 0x4_0000, VSTART, VEND).unwrap();
        assert_eq!(aligned % 0x4_0000, 0);
        assert!(aligned >= VSTART + PAGE_SIZE);
        // Lower alignment afterwards restarts below the anchor.
        assert_eq!(
            reg.alloc(PAGE_SIZE, PAGE_SIZE, VSTART, VEND),
            Some(VSTART + PAGE_SIZE)
        );
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut reg = VmapAreaRegistry::new();
        let window = 4 * PAGE_SIZE;
        for _ in 0..4 {
            reg.alloc(PAGE_SIZE, PAGE_SIZE, VSTART, VSTART + window).unwrap();
        }
        assert_eq!(reg.alloc(PAGE_SIZE, PAGE_SIZE, VSTART, VSTART + window), None);
        assert_eq!(reg.len(), 4);
    }

    #[test]
    fn top_of_address_space_does_not_wrap() {
        let mut reg = VmapAreaRegistry::new();
        let vstart = usize::MAX - 2 * PAGE_SIZE + 1;
        assert_eq!(reg.alloc(4 * PAGE_SIZE, PAGE_SIZE, vstart, usize::MAX), None);
    }

    #[test]
    fn find_by_interior_address() {
        let mut reg = VmapAreaRegistry::new();
        let a = reg.alloc(3 * PAGE_SIZE, PAGE_SIZE, VSTART, VEND).unwrap();
        assert_eq!(reg.find(a + PAGE_SIZE + 7).map(|v| v.start), Some(a));
        assert!(reg.find(a + 3 * PAGE_SIZE).is_none());
        assert!(reg.find(a - 1).is_none());
    }

    #[test]
    fn areas_never_overlap() {
        let mut reg = VmapAreaRegistry::new();
        let mut live = Vec::new();
        for i in 0..64usize {
            let pages = 1 + i % 5;
            let align = PAGE_SIZE << (i % 3);
            if let Some(a) = reg.alloc(pages * PAGE_SIZE, align, VSTART, VEND) {
                live.push(a);
            }
            if i % 4 == 3 {
                let victim = live.remove(i % live.len());
                reg.remove(victim);
            }
        }
        let spans = spans(&reg);
        for pair in spans.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "{pair:x?}");
        }
        assert!(spans.iter().all(|&(s, e)| s >= VSTART && e <= VEND));
    }

    #[test]
    #[should_panic(expected = "unknown vmap area")]
    fn removing_unknown_area_is_fatal() {
        let mut reg = VmapAreaRegistry::new();
        reg.remove(VSTART);
    }
}
