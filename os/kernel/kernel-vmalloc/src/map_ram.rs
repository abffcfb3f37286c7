//! Fast temporary mappings of page lists.

use crate::backend::{CpuTopology, KernelMapper, PageAlloc, Protection};
use crate::error::VmallocError;
use crate::vmalloc::Vmalloc;
use kernel_info::memory::VMAP_MAX_ALLOC;
use kernel_memory_addresses::{PAGE_SIZE, PageFrame, VirtualAddress};
use log::error;

impl<A, M, C> Vmalloc<A, M, C>
where
    A: PageAlloc,
    M: KernelMapper,
    C: CpuTopology,
{
    /// Map `pages` contiguously at a fresh address.
    ///
    /// Requests of up to [`VMAP_MAX_ALLOC`] pages are served from the
    /// current CPU's vmap blocks; their release is batched and cheap. Larger
    /// requests reserve a dedicated range. There is no guard page.
    ///
    /// # Errors
    /// [`VmallocError::InvalidSize`] carrying the page count for an empty
    /// or oversized page list, [`VmallocError::OutOfVirtualSpace`] if no range is available,
    /// [`VmallocError::MapFailed`] if the page tables could not be populated.
    pub fn vm_map_ram(
        &self,
        pages: &[PageFrame],
        prot: Protection,
    ) -> Result<VirtualAddress, VmallocError> {
        let count = pages.len();
        let size = map_ram_size(count)?;

        let addr = if count <= VMAP_MAX_ALLOC {
            self.vb_alloc(size)?
        } else {
            self.alloc_vmap_area(size, PAGE_SIZE, self.config.start, self.config.end)?
        };

        let end = addr + size;
        let result = self.mapper.map_range(addr, end, prot, pages);
        self.mapper.flush_cache_range(addr, end);
        if let Err(e) = result {
            self.vm_unmap_ram(addr, count);
            return Err(e.into());
        }
        Ok(addr)
    }

    /// Release a mapping made by [`vm_map_ram`](Self::vm_map_ram). `count`
    /// must match the page count passed there.
    ///
    /// # Panics
    /// If `addr` is not a live mapping inside the vmalloc window.
    pub fn vm_unmap_ram(&self, addr: VirtualAddress, count: usize) {
        if count == 0
            || addr.is_null()
            || !addr.is_page_aligned()
            || !self.is_vmalloc_addr(addr)
        {
            error!("vm_unmap_ram: bad address {addr} ({count} pages)");
            panic!("vm_unmap_ram: bad address {addr} ({count} pages)");
        }

        let size = count * PAGE_SIZE;
        if count <= VMAP_MAX_ALLOC {
            self.vb_free(addr, size);
        } else {
            self.free_unmap_vmap_area_addr(addr);
        }
    }
}

/// Bytes covered by `count` pages; zero or overflowing counts are invalid.
fn map_ram_size(count: usize) -> Result<usize, VmallocError> {
    count
        .checked_mul(PAGE_SIZE)
        .filter(|&size| size != 0)
        .ok_or(VmallocError::InvalidSize(count))
}
