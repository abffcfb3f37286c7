use crate::area::{VmapAreaInfo, VmapAreaRegistry};
use crate::backend::{CpuTopology, KernelMapper, PageAlloc};
use crate::block::VmapBlocks;
use crate::config::VmallocConfig;
use crate::error::VmallocError;
use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_memory_addresses::{PAGE_SIZE, PageFrame, VirtualAddress};
use log::{error, trace, warn};
use spin::{Mutex, RwLock};

/// The kernel's dynamic virtual memory allocator.
///
/// Owns the vmalloc window described by its [`VmallocConfig`] and hands out
/// ranges of it: page-granular VM areas ([`vmalloc`](Self::vmalloc),
/// [`vmap`](Self::vmap), [`get_vm_area`](Self::get_vm_area)) and short-lived
/// small mappings ([`vm_map_ram`](Self::vm_map_ram)).
///
/// All methods take `&self`; the instance is meant to live in a `static` or
/// be shared by reference.
pub struct Vmalloc<A, M, C> {
    pub(crate) config: VmallocConfig,
    pub(crate) pages: A,
    pub(crate) mapper: M,
    pub(crate) cpus: C,
    /// Every reserved range of the window.
    pub(crate) areas: Mutex<VmapAreaRegistry>,
    /// Serializes lazy purges.
    pub(crate) purge_lock: Mutex<()>,
    /// Pages held by areas that were released but not yet purged.
    pub(crate) lazy_nr: AtomicUsize,
    pub(crate) blocks: VmapBlocks,
    /// Start addresses of published VM areas.
    pub(crate) vmlist: RwLock<BTreeSet<VirtualAddress>>,
}

impl<A, M, C> Vmalloc<A, M, C>
where
    A: PageAlloc,
    M: KernelMapper,
    C: CpuTopology,
{
    /// Set up the allocator for the window in `config`.
    ///
    /// # Panics
    /// If the window is empty or not page aligned, or if the topology
    /// reports no CPUs.
    pub fn new(config: VmallocConfig, pages: A, mapper: M, cpus: C) -> Self {
        config.validate();
        let possible = cpus.possible_cpus();
        assert!(possible > 0, "no possible CPUs");

        let blocks = VmapBlocks::new(&config, possible);
        log::info!(
            "vmalloc: window {}..{} ({} pages), {} CPUs, vmap blocks of {} pages",
            config.start,
            config.end,
            config.pages(),
            possible,
            blocks.bits()
        );

        Self {
            config,
            pages,
            mapper,
            cpus,
            areas: Mutex::new(VmapAreaRegistry::new()),
            purge_lock: Mutex::new(()),
            lazy_nr: AtomicUsize::new(0),
            blocks,
            vmlist: RwLock::new(BTreeSet::new()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &VmallocConfig {
        &self.config
    }

    #[must_use]
    pub const fn page_allocator(&self) -> &A {
        &self.pages
    }

    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[must_use]
    pub const fn cpus(&self) -> &C {
        &self.cpus
    }

    /// Reserve `size` bytes aligned to `align` within `[vstart, vend)`.
    ///
    /// If the window is exhausted, outstanding lazily freed areas are purged
    /// once and the search is repeated.
    pub(crate) fn alloc_vmap_area(
        &self,
        size: usize,
        align: usize,
        vstart: VirtualAddress,
        vend: VirtualAddress,
    ) -> Result<VirtualAddress, VmallocError> {
        assert!(
            size != 0 && size.is_multiple_of(PAGE_SIZE),
            "vmap area size {size:#x} is not a whole number of pages"
        );
        assert!(align.is_power_of_two(), "alignment {align:#x} is not a power of two");

        let mut purged = false;
        loop {
            let found =
                self.areas
                    .lock()
                    .alloc(size, align, vstart.as_usize(), vend.as_usize());
            if let Some(start) = found {
                let start = VirtualAddress::new(start);
                trace!("vmalloc: reserved {start}+{size:#x} (align {align:#x})");
                return Ok(start);
            }
            if purged {
                warn!("vmap allocation for size {size:#x} failed: window {vstart}..{vend} exhausted");
                return Err(VmallocError::OutOfVirtualSpace { size, align });
            }
            self.purge_vmap_area_lazy();
            purged = true;
        }
    }

    /// Release the range of the area starting at `start`: flush caches, tear
    /// down the mappings, and queue the range for the next purge.
    pub(crate) fn free_unmap_vmap_area(&self, start: VirtualAddress, end: VirtualAddress) {
        self.mapper.flush_cache_range(start, end);
        self.mapper.unmap_range(start, end);
        self.free_vmap_area_noflush(start);
    }

    /// Like [`free_unmap_vmap_area`](Self::free_unmap_vmap_area) for the
    /// area containing `addr`.
    pub(crate) fn free_unmap_vmap_area_addr(&self, addr: VirtualAddress) {
        let span = self
            .areas
            .lock()
            .find(addr.as_usize())
            .filter(|area| !area.info().is_lazy())
            .map(|area| (area.start, area.end));
        let Some((start, end)) = span else {
            error!("vmalloc: freeing unknown address {addr}");
            panic!("vmalloc: freeing unknown address {addr}");
        };
        self.free_unmap_vmap_area(VirtualAddress::new(start), VirtualAddress::new(end));
    }

    /// The registered vmap area containing `addr`, if any.
    #[must_use]
    pub fn find_area(&self, addr: VirtualAddress) -> Option<VmapAreaInfo> {
        self.areas.lock().find(addr.as_usize()).map(|area| area.info())
    }

    /// Snapshot of all registered vmap areas, in address order.
    #[must_use]
    pub fn areas(&self) -> Vec<VmapAreaInfo> {
        self.areas.lock().iter().map(|area| area.info()).collect()
    }

    /// The page mapped at `addr`.
    #[must_use]
    pub fn vmalloc_to_page(&self, addr: VirtualAddress) -> Option<PageFrame> {
        self.mapper.translate(addr.page_base())
    }

    /// Pages released but not yet returned to the free pool.
    #[must_use]
    pub fn lazy_pages(&self) -> usize {
        self.lazy_nr.load(Ordering::Relaxed)
    }

    /// `true` if `addr` lies inside the vmalloc window.
    #[must_use]
    pub fn is_vmalloc_addr(&self, addr: VirtualAddress) -> bool {
        self.config.start <= addr && addr < self.config.end
    }
}
