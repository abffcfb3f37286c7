use crate::backend::KernelMapper;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::panic::Location;
use kernel_memory_addresses::{PAGE_SIZE, PageFrame, VirtualAddress};

bitflags! {
    /// Properties of a VM area.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct VmFlags: u32 {
        /// I/O remapping; alignment is derived from the size.
        const IOREMAP = 1 << 0;
        /// Backed by pages allocated by [`Vmalloc::vmalloc`](crate::Vmalloc::vmalloc).
        const ALLOC = 1 << 1;
        /// Caller-supplied pages mapped by [`Vmalloc::vmap`](crate::Vmalloc::vmap).
        const MAP = 1 << 2;
        /// May be mapped into user space.
        const USERMAP = 1 << 3;
        /// The page array itself lives in vmalloc space.
        const VPAGES = 1 << 4;
        /// Not (yet) published on the VM-area list.
        const UNLIST = 1 << 5;
    }
}

/// Descriptor of a VM area, owned by the vmap area that backs it.
#[derive(Debug)]
pub(crate) struct VmStruct {
    pub addr: VirtualAddress,
    /// Size in bytes including the trailing guard page while the area is
    /// live; the guard page is subtracted once the area is removed.
    pub size: usize,
    pub flags: VmFlags,
    pub pages: PageArray,
    pub caller: &'static Location<'static>,
}

impl VmStruct {
    pub const fn new(
        addr: VirtualAddress,
        size: usize,
        flags: VmFlags,
        caller: &'static Location<'static>,
    ) -> Self {
        Self {
            addr,
            size,
            flags,
            pages: PageArray::Heap(Vec::new()),
            caller,
        }
    }

    pub fn info(&self) -> VmAreaInfo {
        VmAreaInfo {
            addr: self.addr,
            size: self.size,
            flags: self.flags,
            nr_pages: self.pages.len(),
            caller: self.caller,
        }
    }
}

/// Bytes per entry of a page array.
pub(crate) const PAGE_ARRAY_ENTRY: usize = core::mem::size_of::<u64>();

/// The frames owned by a VM area, in mapping order.
#[derive(Debug)]
pub(crate) enum PageArray {
    Heap(Vec<PageFrame>),
    /// `len` frame numbers stored at `addr`, a vmalloc area of its own
    /// (the area carries [`VmFlags::VPAGES`]).
    Vmalloc { addr: VirtualAddress, len: usize },
}

impl PageArray {
    /// Write `pages` to `backing` and refer to them there.
    ///
    /// # Safety
    /// `backing` must be mapped for `pages.len()` entries and owned by the
    /// returned array until it is released with the area.
    pub unsafe fn store<M: KernelMapper>(
        mapper: &M,
        backing: VirtualAddress,
        pages: &[PageFrame],
    ) -> Self {
        for (i, page) in pages.iter().enumerate() {
            let entry = backing + i * PAGE_ARRAY_ENTRY;
            unsafe { mapper.write_range(entry, &page.pfn().to_ne_bytes()) };
        }
        Self::Vmalloc {
            addr: backing,
            len: pages.len(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Heap(pages) => pages.len(),
            Self::Vmalloc { len, .. } => *len,
        }
    }

    /// Where the array lives if it is not on the heap.
    pub const fn backing(&self) -> Option<VirtualAddress> {
        match self {
            Self::Heap(_) => None,
            Self::Vmalloc { addr, .. } => Some(*addr),
        }
    }

    /// Entry `i`.
    pub fn get<M: KernelMapper>(&self, mapper: &M, i: usize) -> PageFrame {
        match self {
            Self::Heap(pages) => pages[i],
            Self::Vmalloc { addr, len } => {
                assert!(i < *len, "page {i} of {len}");
                let mut raw = [0u8; PAGE_ARRAY_ENTRY];
                // SAFETY: the backing stays mapped for as long as the array
                // refers to it, and only `store` writes it.
                unsafe { mapper.read_range(*addr + i * PAGE_ARRAY_ENTRY, &mut raw) };
                PageFrame::from_pfn(u64::from_ne_bytes(raw))
            }
        }
    }
}

/// Snapshot of a VM area.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct VmAreaInfo {
    pub addr: VirtualAddress,
    /// Size in bytes, including the guard page.
    pub size: usize,
    pub flags: VmFlags,
    /// Number of pages owned by the area.
    pub nr_pages: usize,
    /// Where the area was requested from.
    pub caller: &'static Location<'static>,
}

impl VmAreaInfo {
    /// One past the last usable byte; the guard page starts here.
    #[must_use]
    pub fn usable_end(&self) -> VirtualAddress {
        self.addr + (self.size - PAGE_SIZE)
    }
}
