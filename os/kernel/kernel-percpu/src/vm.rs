//! Backing dynamic chunks with vmalloc space.
//!
//! A dynamic chunk is one VM area large enough for all units. The area is
//! reserved up front; pages are allocated and mapped lazily, for every
//! possible CPU at once, the first time an allocation touches them.
//!
//! ```text
//!  chunk base
//!  │ unit 0 (cpu 0)   │ unit 1 (cpu 1)   │ ... │ unit n-1          │ guard │
//!  ├──┬──┬──┬──┬──┬───┼──┬──┬──┬──┬──┬───┼─────┼──┬──┬──┬──┬──┬───┼───────┤
//!  │■■│■■│  │■■│  │   │■■│■■│  │■■│  │   │     │■■│■■│  │■■│  │   │       │
//!  └──┴──┴──┴──┴──┴───┴──┴──┴──┴──┴──┴───┴─────┴──┴──┴──┴──┴──┴───┴───────┘
//!    ■ populated: the same pages in every unit
//! ```
//!
//! Population is all or nothing: if any page cannot be obtained or mapped,
//! everything done so far for the request is undone.

use crate::chunk::{ChunkId, PcpuChunk};
use crate::error::PercpuError;
use crate::percpu::PercpuAllocator;
use alloc::vec::Vec;
use kernel_memory_addresses::{PAGE_SHIFT, PageFrame, VirtualAddress, pfn_down, pfn_up};
use kernel_vmalloc::{
    CpuTopology, KernelMapper, MapError, PageAlloc, Protection, VmFlags, VmallocError,
};
use log::{debug, trace, warn};

impl<A, M, C> PercpuAllocator<'_, A, M, C>
where
    A: PageAlloc,
    M: KernelMapper,
    C: CpuTopology,
{
    fn possible_cpus(&self) -> usize {
        self.geometry.unit_offsets.len()
    }

    /// Back `[off, off + size)` of every unit of chunk `id` with pages and
    /// zero it.
    pub(crate) fn populate_chunk(
        &self,
        id: ChunkId,
        off: usize,
        size: usize,
    ) -> Result<(), PercpuError> {
        let page_start = pfn_down(off);
        let page_end = pfn_up(off + size);

        let (base, regions) = {
            let state = self.state.lock();
            let chunk = state.chunk(id);
            (chunk.base, chunk.page_regions(page_start, page_end, false))
        };

        if !regions.is_empty() {
            let pages = self.alloc_pages(&regions)?;
            if let Err(e) = self.map_pages(base, &regions, &pages) {
                self.free_pages(pages);
                return Err(PercpuError::Populate(VmallocError::MapFailed(e)));
            }

            let (start, end) = self.geometry.flush_span(base, page_start, page_end);
            self.vm.mapper().flush_cache_range(start, end);

            let mut state = self.state.lock();
            for &(rs, re) in &regions {
                state.chunk_mut(id).set_populated(rs, re, true);
            }
            for page in pages {
                state.page_chunk.insert(page, id);
            }
            trace!("percpu: populated pages {page_start}..{page_end} of chunk at {base}");
        }

        for cpu in 0..self.possible_cpus() {
            let addr = self.geometry.chunk_addr(base, cpu, 0) + off;
            // SAFETY: the range lies in pages of this chunk that were
            // populated above or earlier, and the area was just handed to us.
            unsafe { self.vm.mapper().zero_range(addr, size) };
        }
        Ok(())
    }

    /// One page per CPU for every page in `regions`, ordered by region,
    /// then CPU, then page.
    fn alloc_pages(&self, regions: &[(usize, usize)]) -> Result<Vec<PageFrame>, PercpuError> {
        let mut pages = Vec::new();
        for &(rs, re) in regions {
            for cpu in 0..self.possible_cpus() {
                let node = self.vm.cpus().cpu_to_node(cpu);
                for _ in rs..re {
                    if let Some(page) = self.vm.page_allocator().alloc_page(Some(node)) {
                        pages.push(page);
                    } else {
                        warn!("percpu: out of pages populating {rs}..{re} for cpu {cpu}");
                        self.free_pages(pages);
                        return Err(PercpuError::Populate(VmallocError::OutOfMemory));
                    }
                }
            }
        }
        Ok(pages)
    }

    fn free_pages(&self, pages: Vec<PageFrame>) {
        for page in pages {
            self.vm.page_allocator().free_page(page);
        }
    }

    /// Map `pages` (as ordered by [`alloc_pages`](Self::alloc_pages)) into
    /// every unit. On failure every range touched is unmapped again.
    fn map_pages(
        &self,
        base: VirtualAddress,
        regions: &[(usize, usize)],
        pages: &[PageFrame],
    ) -> Result<(), MapError> {
        let mut touched: Vec<(VirtualAddress, usize)> = Vec::new();
        let mut next = 0;

        for &(rs, re) in regions {
            let size = (re - rs) << PAGE_SHIFT;
            for cpu in 0..self.possible_cpus() {
                let addr = self.geometry.chunk_addr(base, cpu, rs);
                let frames = &pages[next..next + (re - rs)];
                next += re - rs;
                touched.push((addr, size));

                let mapped = self
                    .vm
                    .map_kernel_range_noflush(addr, size, Protection::KERNEL, frames);
                if let Err(e) = mapped {
                    let (start, end) = self.geometry.flush_span(base, regions[0].0, re);
                    self.vm.mapper().flush_cache_range(start, end);
                    for (addr, size) in touched {
                        self.vm.unmap_kernel_range_noflush(addr, size);
                    }
                    self.vm.mapper().flush_tlb_range(start, end);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Unmap and free the pages backing `[off, off + size)` of every unit.
    pub(crate) fn depopulate_chunk(&self, chunk: &mut PcpuChunk, off: usize, size: usize) {
        let page_start = pfn_down(off);
        let page_end = pfn_up(off + size);

        let regions = chunk.page_regions(page_start, page_end, true);
        if regions.is_empty() {
            return;
        }
        if chunk.immutable {
            warn!("percpu: refusing to depopulate immutable chunk at {}", chunk.base);
            return;
        }

        let mapper = self.vm.mapper();
        let (start, end) = self.geometry.flush_span(chunk.base, page_start, page_end);
        mapper.flush_cache_range(start, end);

        let mut pages = Vec::new();
        for &(rs, re) in &regions {
            for cpu in 0..self.possible_cpus() {
                let addr = self.geometry.chunk_addr(chunk.base, cpu, rs);
                pages.extend(
                    (0..re - rs).filter_map(|i| self.vm.vmalloc_to_page(addr.add_pages(i))),
                );
                self.vm.unmap_kernel_range_noflush(addr, (re - rs) << PAGE_SHIFT);
            }
            chunk.set_populated(rs, re, false);
        }
        // The pages may only be reused once no TLB refers to them.
        mapper.flush_tlb_range(start, end);

        {
            let mut state = self.state.lock();
            for page in &pages {
                state.page_chunk.remove(page);
            }
        }
        self.free_pages(pages);
    }

    /// A new, empty chunk spanning a fresh VM area.
    pub(crate) fn create_chunk(&self) -> Result<PcpuChunk, PercpuError> {
        let area = self
            .vm
            .get_vm_area_aligned(
                self.geometry.chunk_size,
                self.geometry.atom_size,
                VmFlags::ALLOC | VmFlags::UNLIST,
            )
            .map_err(PercpuError::ChunkCreation)?;

        let chunk = PcpuChunk::new(area.addr, self.geometry.unit_size, self.geometry.unit_pages);
        self.vm.publish_vm_area(area.addr);
        debug!("percpu: created chunk at {}", area.addr);
        Ok(chunk)
    }

    /// Release the VM area of a depopulated chunk.
    pub(crate) fn destroy_chunk(&self, chunk: PcpuChunk) {
        debug!("percpu: destroying chunk at {}", chunk.base);
        self.vm.free_vm_area(chunk.base);
    }
}
