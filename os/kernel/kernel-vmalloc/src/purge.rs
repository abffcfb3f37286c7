//! Lazy release of virtual ranges.
//!
//! Unmapping a kernel range is cheap; invalidating the TLBs of every CPU is
//! not. Released areas are therefore only marked [`LAZY_FREE`] and stay
//! reserved until enough of them have piled up. A purge then issues **one**
//! TLB flush covering all of them and returns the ranges to the registry.
//!
//! ```text
//!  owner releases        purge picks up          after the flush
//!  ┌────────────┐        ┌──────────────┐
//!  │ LAZY_FREE  │ ─────▶ │ LAZY_FREEING │ ─────▶  removed from registry
//!  └────────────┘        └──────────────┘
//! ```
//!
//! A range must never be handed out again before the flush that covers it
//! has completed; stale TLB entries on another CPU would otherwise alias the
//! new owner's pages.
//!
//! [`LAZY_FREE`]: crate::VmapAreaFlags::LAZY_FREE

use crate::area::VmapAreaFlags;
use crate::backend::{CpuTopology, KernelMapper, PageAlloc};
use crate::vmalloc::Vmalloc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use kernel_info::memory::LAZY_PURGE_UNIT_PAGES;
use kernel_memory_addresses::{VirtualAddress, ilog2};
use log::{debug, error, trace};

/// Union of address ranges that need a TLB flush.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct FlushRange {
    start: usize,
    end: usize,
}

impl FlushRange {
    pub const fn empty() -> Self {
        Self {
            start: usize::MAX,
            end: 0,
        }
    }

    pub const fn include(&mut self, start: usize, end: usize) {
        if start < self.start {
            self.start = start;
        }
        if end > self.end {
            self.end = end;
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

impl<A, M, C> Vmalloc<A, M, C>
where
    A: PageAlloc,
    M: KernelMapper,
    C: CpuTopology,
{
    /// Number of lazily freed pages tolerated before a purge is attempted.
    ///
    /// TLB flushes get more expensive with more CPUs, so the threshold grows
    /// with the number of online CPUs, logarithmically.
    #[must_use]
    pub fn lazy_max_pages(&self) -> usize {
        let online = self.cpus.online_cpus().max(1);
        (ilog2(online) as usize + 1) * LAZY_PURGE_UNIT_PAGES
    }

    /// Mark the area starting at `start` as released and account its pages.
    /// The caller has already torn down the mappings.
    pub(crate) fn free_vmap_area_noflush(&self, start: VirtualAddress) {
        let pages = {
            let mut areas = self.areas.lock();
            let Some(area) = areas.get_mut(start.as_usize()) else {
                error!("vmalloc: lazy free of unknown area {start}");
                panic!("vmalloc: lazy free of unknown area {start}");
            };
            assert!(
                !area.flags.intersects(VmapAreaFlags::LAZY_FREE | VmapAreaFlags::LAZY_FREEING),
                "vmap area {start} released twice"
            );
            area.flags.insert(VmapAreaFlags::LAZY_FREE);
            area.pages()
        };

        let pending = self.lazy_nr.fetch_add(pages, Ordering::AcqRel) + pages;
        trace!("vmalloc: {start} lazily freed ({pages} pages, {pending} pending)");
        if pending > self.lazy_max_pages() {
            self.try_purge_vmap_area_lazy();
        }
    }

    /// Purge unless another purge is already running.
    pub(crate) fn try_purge_vmap_area_lazy(&self) {
        let mut range = FlushRange::empty();
        self.purge_vmap_area_lazy_range(&mut range, false, false);
    }

    /// Purge all lazily freed areas, waiting for a concurrent purge to finish
    /// first, and release fragmented vmap blocks on every CPU.
    pub fn purge_vmap_area_lazy(&self) {
        let mut range = FlushRange::empty();
        self.purge_vmap_area_lazy_range(&mut range, true, false);
    }

    /// Core of the purge engine.
    ///
    /// `range` enters with addresses the caller wants flushed anyway and is
    /// widened by every purged area. Without `sync` or `force_flush` the call
    /// gives up if another purge holds the lock. With `force_flush` the TLB is
    /// flushed even if no area was purged.
    pub(crate) fn purge_vmap_area_lazy_range(
        &self,
        range: &mut FlushRange,
        sync: bool,
        force_flush: bool,
    ) {
        let _guard = if !sync && !force_flush {
            let Some(guard) = self.purge_lock.try_lock() else {
                trace!("vmalloc: purge already running");
                return;
            };
            guard
        } else {
            self.purge_lock.lock()
        };

        if sync {
            self.purge_fragmented_blocks_allcpus();
        }

        let mut purging = Vec::new();
        let mut nr = 0;
        {
            let mut areas = self.areas.lock();
            for area in areas.iter_mut() {
                if !area.flags.contains(VmapAreaFlags::LAZY_FREE) {
                    continue;
                }
                range.include(area.start, area.end);
                nr += area.pages();
                area.flags.remove(VmapAreaFlags::LAZY_FREE);
                area.flags.insert(VmapAreaFlags::LAZY_FREEING);
                purging.push(area.start);
            }
        }

        if nr > 0 {
            self.lazy_nr.fetch_sub(nr, Ordering::AcqRel);
        }

        if (nr > 0 || force_flush) && !range.is_empty() {
            self.mapper.flush_tlb_range(
                VirtualAddress::new(range.start),
                VirtualAddress::new(range.end),
            );
        }

        if nr > 0 {
            let mut areas = self.areas.lock();
            for start in &purging {
                areas.remove(*start);
            }
            debug!(
                "vmalloc: purged {} areas ({nr} pages), flushed {:#x}..{:#x}",
                purging.len(),
                range.start,
                range.end
            );
        }
    }
}
