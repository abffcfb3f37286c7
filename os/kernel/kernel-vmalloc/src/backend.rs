//! Collaborators the allocators are generic over.
//!
//! The allocators never touch hardware themselves. Physical pages come from a
//! [`PageAlloc`], page tables are edited through a [`KernelMapper`] and the
//! CPU set is described by a [`CpuTopology`]. On target these are thin
//! wrappers around the frame allocator and the kernel page tables; on the host
//! they are provided by `testing::SimMachine` behind the `testing` feature.

use bitflags::bitflags;
use kernel_memory_addresses::{PageFrame, VirtualAddress};

/// NUMA node identifier, used as an allocation hint only.
pub type NodeId = usize;

bitflags! {
    /// Protection bits of a kernel mapping.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct Protection: u32 {
        /// The mapping may be read.
        const READ = 1 << 0;
        /// The mapping may be written.
        const WRITE = 1 << 1;
        /// Instructions may be fetched from the mapping.
        const EXEC = 1 << 2;
        /// The mapping is reachable from user mode.
        const USER = 1 << 3;
        /// Caching disabled.
        const NO_CACHE = 1 << 4;
    }
}

impl Protection {
    /// Ordinary kernel data: read/write, no execute.
    pub const KERNEL: Self = Self::READ.union(Self::WRITE);

    /// Kernel code: read/write/execute.
    pub const KERNEL_EXEC: Self = Self::KERNEL.union(Self::EXEC);
}

/// Errors reported by the page-table collaborator.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("a mapping already exists at {0}")]
    AlreadyMapped(VirtualAddress),
    #[error("out of memory for an intermediate page table")]
    PageTableAllocation,
}

/// Source of physical 4 KiB pages.
pub trait PageAlloc {
    /// Allocate one page, preferably on `node`.
    fn alloc_page(&self, node: Option<NodeId>) -> Option<PageFrame>;

    /// Return a page previously handed out by [`alloc_page`](Self::alloc_page).
    fn free_page(&self, frame: PageFrame);

    /// Total number of pages the allocator manages. Requests larger than
    /// this are refused up front.
    fn total_pages(&self) -> usize;
}

/// Kernel page-table manipulation.
///
/// All ranges are half-open and page aligned.
pub trait KernelMapper {
    /// Map `pages[i]` at `start + i * PAGE_SIZE` for every page of
    /// `[start, end)`. Partial progress may remain on error; the caller
    /// unmaps the whole range in that case.
    ///
    /// # Errors
    /// Intermediate table allocation failed, or a live mapping is in the way.
    fn map_range(
        &self,
        start: VirtualAddress,
        end: VirtualAddress,
        prot: Protection,
        pages: &[PageFrame],
    ) -> Result<(), MapError>;

    /// Remove all mappings in `[start, end)`. Holes are ignored. Does not
    /// flush the TLB.
    fn unmap_range(&self, start: VirtualAddress, end: VirtualAddress);

    /// Write back/invalidate data caches for the range, as required before
    /// (un)mapping on virtually indexed caches. A no-op on x86.
    fn flush_cache_range(&self, start: VirtualAddress, end: VirtualAddress);

    /// Invalidate kernel TLB entries covering `[start, end)` on all CPUs.
    fn flush_tlb_range(&self, start: VirtualAddress, end: VirtualAddress);

    /// The frame currently mapped at `va`, if any.
    fn translate(&self, va: VirtualAddress) -> Option<PageFrame>;

    /// Fill `len` bytes at `start` with zeroes.
    ///
    /// # Safety
    /// `[start, start + len)` must be mapped writable and not aliased by any
    /// live reference.
    unsafe fn zero_range(&self, start: VirtualAddress, len: usize) {
        unsafe { core::ptr::write_bytes(start.as_mut_ptr::<u8>(), 0, len) };
    }

    /// Copy `src` to `start`.
    ///
    /// # Safety
    /// As for [`zero_range`](Self::zero_range), over `src.len()` bytes.
    unsafe fn write_range(&self, start: VirtualAddress, src: &[u8]) {
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), start.as_mut_ptr::<u8>(), src.len());
        };
    }

    /// Fill `dst` from the memory at `start`.
    ///
    /// # Safety
    /// `[start, start + dst.len())` must be mapped and not written
    /// concurrently.
    unsafe fn read_range(&self, start: VirtualAddress, dst: &mut [u8]) {
        unsafe {
            core::ptr::copy_nonoverlapping(
                start.as_mut_ptr::<u8>().cast_const(),
                dst.as_mut_ptr(),
                dst.len(),
            );
        };
    }
}

/// The set of CPUs and the CPU the caller runs on.
pub trait CpuTopology {
    /// Number of possible CPUs; CPU ids are `0..possible_cpus()`.
    fn possible_cpus(&self) -> usize;

    /// Number of CPUs currently online.
    fn online_cpus(&self) -> usize;

    /// The CPU executing the caller.
    fn current_cpu(&self) -> usize;

    /// NUMA node of `cpu`.
    fn cpu_to_node(&self, cpu: usize) -> NodeId {
        let _ = cpu;
        0
    }
}
