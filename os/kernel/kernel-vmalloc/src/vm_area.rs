//! VM areas and the vmalloc family.
//!
//! A VM area is a vmap area with a descriptor attached: flags, the backing
//! pages if the area owns any, and the caller that requested it. Every VM
//! area is followed by one unmapped guard page so that a linear overrun
//! faults instead of silently corrupting the neighbor.
//!
//! ```text
//!  addr                                     addr + size
//!   ├──────────────── usable ─────────────────┬─ guard ─┤
//!   │ page 0 │ page 1 │   ...   │ page n-1    │ (none)  │
//!   └────────┴────────┴─────────┴─────────────┴─────────┘
//! ```
//!
//! Areas are *published* on the VM-area list once they are fully set up.
//! [`vmalloc`](Vmalloc::vmalloc) reserves with [`VmFlags::UNLIST`] and only
//! publishes after the pages are mapped, so list walkers never observe a
//! half-built area.

use crate::area::{AreaOwner, VmapAreaFlags};
use crate::backend::{CpuTopology, KernelMapper, MapError, NodeId, PageAlloc, Protection};
use crate::error::VmallocError;
use crate::vm_struct::{PAGE_ARRAY_ENTRY, PageArray, VmAreaInfo, VmFlags, VmStruct};
use crate::vmalloc::Vmalloc;
use alloc::vec::Vec;
use core::panic::Location;
use kernel_info::memory::IOREMAP_MAX_ORDER;
use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, PageFrame, VirtualAddress, fls, page_align};
use log::{debug, error, warn};

/// Parameters of a vmalloc request.
#[derive(Debug, Copy, Clone)]
struct VmallocRequest {
    size: usize,
    align: usize,
    start: VirtualAddress,
    end: VirtualAddress,
    prot: Protection,
    node: Option<NodeId>,
    flags: VmFlags,
    zero: bool,
}

#[cold]
fn bad_free(addr: VirtualAddress, what: &str) -> ! {
    error!("{what}: trying to free invalid area {addr}");
    panic!("{what}: trying to free invalid area {addr}");
}

impl<A, M, C> Vmalloc<A, M, C>
where
    A: PageAlloc,
    M: KernelMapper,
    C: CpuTopology,
{
    /// Reserve a VM area of `size` bytes (plus guard page) anywhere in the
    /// vmalloc window. No pages are mapped.
    ///
    /// # Errors
    /// [`VmallocError::InvalidSize`] for a zero size,
    /// [`VmallocError::OutOfVirtualSpace`] if the window is exhausted.
    #[track_caller]
    pub fn get_vm_area(&self, size: usize, flags: VmFlags) -> Result<VmAreaInfo, VmallocError> {
        let caller = Location::caller();
        self.get_vm_area_node(size, 1, flags, self.config.start, self.config.end, caller)
    }

    /// Like [`get_vm_area`](Self::get_vm_area) with a caller-chosen
    /// alignment.
    ///
    /// # Errors
    /// See [`get_vm_area`](Self::get_vm_area).
    #[track_caller]
    pub fn get_vm_area_aligned(
        &self,
        size: usize,
        align: usize,
        flags: VmFlags,
    ) -> Result<VmAreaInfo, VmallocError> {
        let caller = Location::caller();
        self.get_vm_area_node(size, align, flags, self.config.start, self.config.end, caller)
    }

    /// Reserve a VM area inside `[start, end)`, which may lie outside the
    /// vmalloc window (e.g. a module area).
    ///
    /// # Errors
    /// See [`get_vm_area`](Self::get_vm_area).
    #[track_caller]
    pub fn get_vm_area_range(
        &self,
        size: usize,
        flags: VmFlags,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Result<VmAreaInfo, VmallocError> {
        let caller = Location::caller();
        self.get_vm_area_node(size, 1, flags, start, end, caller)
    }

    pub(crate) fn get_vm_area_node(
        &self,
        size: usize,
        align: usize,
        flags: VmFlags,
        start: VirtualAddress,
        end: VirtualAddress,
        caller: &'static Location<'static>,
    ) -> Result<VmAreaInfo, VmallocError> {
        let align = if flags.contains(VmFlags::IOREMAP) {
            1usize << fls(size).clamp(PAGE_SHIFT, IOREMAP_MAX_ORDER)
        } else {
            align.max(1)
        };

        let size = page_align(size)
            .filter(|&size| size != 0)
            .ok_or(VmallocError::InvalidSize(size))?;
        let size = size
            .checked_add(PAGE_SIZE)
            .ok_or(VmallocError::InvalidSize(size))?;

        let addr = self.alloc_vmap_area(size, align, start, end)?;
        let vm = VmStruct::new(addr, size, flags, caller);
        let info = vm.info();
        {
            let mut areas = self.areas.lock();
            let Some(area) = areas.get_mut(addr.as_usize()) else {
                unreachable!("freshly reserved area {addr} vanished");
            };
            area.owner = AreaOwner::Vm(vm);
            area.flags.insert(VmapAreaFlags::VM_AREA);
        }
        if !flags.contains(VmFlags::UNLIST) {
            self.vmlist.write().insert(addr);
        }

        debug!("vmalloc: vm area {addr}+{size:#x} {flags:?} for {caller}");
        Ok(info)
    }

    /// Publish an area reserved with [`VmFlags::UNLIST`] on the VM-area list.
    pub fn publish_vm_area(&self, addr: VirtualAddress) {
        {
            let mut areas = self.areas.lock();
            let Some(vm) = areas.get_mut(addr.as_usize()).and_then(|area| area.vm_mut()) else {
                error!("vmalloc: publishing unknown vm area {addr}");
                panic!("vmalloc: publishing unknown vm area {addr}");
            };
            vm.flags.remove(VmFlags::UNLIST);
        }
        self.vmlist.write().insert(addr);
    }

    /// The VM area containing `addr`, if any.
    #[must_use]
    pub fn find_vm_area(&self, addr: VirtualAddress) -> Option<VmAreaInfo> {
        self.areas
            .lock()
            .find(addr.as_usize())
            .and_then(|area| area.vm().map(VmStruct::info))
    }

    /// Snapshot of all published VM areas, in address order.
    #[must_use]
    pub fn vmalloc_areas(&self) -> Vec<VmAreaInfo> {
        let list = self.vmlist.read();
        let areas = self.areas.lock();
        list.iter()
            .filter_map(|addr| areas.find(addr.as_usize()).and_then(|area| area.vm()))
            .map(VmStruct::info)
            .collect()
    }

    /// Detach the VM area containing `addr`: unlist it, tear down its
    /// mappings and queue its range for release. The descriptor is returned
    /// to the caller with the guard page subtracted from its size.
    pub(crate) fn remove_vm_area(&self, addr: VirtualAddress) -> Option<VmStruct> {
        let (vm, start, end) = {
            let mut areas = self.areas.lock();
            let area = areas.find_mut(addr.as_usize())?;
            if !area.flags.contains(VmapAreaFlags::VM_AREA) {
                return None;
            }
            area.flags.remove(VmapAreaFlags::VM_AREA);
            let AreaOwner::Vm(vm) = core::mem::replace(&mut area.owner, AreaOwner::None) else {
                unreachable!("vm area without descriptor at {addr}");
            };
            (vm, area.start, area.end)
        };

        if !vm.flags.contains(VmFlags::UNLIST) {
            self.vmlist.write().remove(&vm.addr);
        }

        self.free_unmap_vmap_area(VirtualAddress::new(start), VirtualAddress::new(end));

        let mut vm = vm;
        vm.size -= PAGE_SIZE;
        Some(vm)
    }

    /// Release a reservation made with [`get_vm_area`](Self::get_vm_area).
    /// Mapped pages are unmapped but not freed.
    ///
    /// # Panics
    /// If `addr` is not the start of a live VM area.
    pub fn free_vm_area(&self, addr: VirtualAddress) {
        match self.remove_vm_area(addr) {
            Some(vm) if vm.addr == addr => {}
            _ => bad_free(addr, "free_vm_area"),
        }
    }

    fn vunmap_inner(&self, addr: VirtualAddress, deallocate_pages: bool, what: &str) {
        if addr.is_null() {
            return;
        }
        if !addr.is_page_aligned() {
            bad_free(addr, what);
        }

        let Some(vm) = self.remove_vm_area(addr) else {
            bad_free(addr, what);
        };

        if deallocate_pages {
            for i in 0..vm.pages.len() {
                self.pages.free_page(vm.pages.get(&self.mapper, i));
            }
            if let Some(backing) = vm.pages.backing() {
                self.vfree(backing);
            }
        }
    }

    /// Free memory obtained from the [`vmalloc`](Self::vmalloc) family. A
    /// null address is ignored.
    ///
    /// # Panics
    /// If `addr` is not page aligned or not a live VM area.
    pub fn vfree(&self, addr: VirtualAddress) {
        self.vunmap_inner(addr, true, "vfree");
    }

    /// Release a mapping made by [`vmap`](Self::vmap). The pages stay with
    /// the caller. A null address is ignored.
    ///
    /// # Panics
    /// If `addr` is not page aligned or not a live VM area.
    pub fn vunmap(&self, addr: VirtualAddress) {
        self.vunmap_inner(addr, false, "vunmap");
    }

    /// Map `pages` contiguously into a new VM area.
    ///
    /// # Errors
    /// [`VmallocError::InvalidSize`] for an empty page list, otherwise see
    /// [`get_vm_area`](Self::get_vm_area) and
    /// [`VmallocError::MapFailed`].
    #[track_caller]
    pub fn vmap(
        &self,
        pages: &[PageFrame],
        flags: VmFlags,
        prot: Protection,
    ) -> Result<VirtualAddress, VmallocError> {
        let caller = Location::caller();
        let size = pages
            .len()
            .checked_mul(PAGE_SIZE)
            .filter(|&size| size != 0)
            .ok_or(VmallocError::InvalidSize(0))?;

        let addr = self
            .get_vm_area_node(
                size,
                1,
                flags | VmFlags::MAP,
                self.config.start,
                self.config.end,
                caller,
            )?
            .addr;
        if let Err(e) = self.map_vm_area(addr, size, prot, pages) {
            self.vunmap(addr);
            return Err(e.into());
        }
        Ok(addr)
    }

    /// Map `pages` at `addr` and flush caches for the range.
    fn map_vm_area(
        &self,
        addr: VirtualAddress,
        size: usize,
        prot: Protection,
        pages: &[PageFrame],
    ) -> Result<(), MapError> {
        let end = addr + size;
        let result = self.mapper.map_range(addr, end, prot, pages);
        self.mapper.flush_cache_range(addr, end);
        result
    }

    /// Map `pages` at `[addr, addr + size)` without any cache maintenance.
    /// The range must lie inside an area the caller owns.
    ///
    /// # Errors
    /// See [`KernelMapper::map_range`].
    pub fn map_kernel_range_noflush(
        &self,
        addr: VirtualAddress,
        size: usize,
        prot: Protection,
        pages: &[PageFrame],
    ) -> Result<(), MapError> {
        self.mapper.map_range(addr, addr + size, prot, pages)
    }

    /// Unmap `[addr, addr + size)` without cache or TLB maintenance.
    pub fn unmap_kernel_range_noflush(&self, addr: VirtualAddress, size: usize) {
        self.mapper.unmap_range(addr, addr + size);
    }

    /// Allocate `size` bytes of virtually contiguous memory.
    ///
    /// # Errors
    /// [`VmallocError::InvalidSize`] for a zero size,
    /// [`VmallocError::OutOfVirtualSpace`] or
    /// [`VmallocError::OutOfMemory`] if the window or the page allocator is
    /// exhausted, [`VmallocError::MapFailed`] if the page tables could not be
    /// populated.
    #[track_caller]
    pub fn vmalloc(&self, size: usize) -> Result<VirtualAddress, VmallocError> {
        self.vmalloc_node_range(self.request(size), Location::caller())
    }

    /// [`vmalloc`](Self::vmalloc), with the memory zeroed.
    ///
    /// # Errors
    /// See [`vmalloc`](Self::vmalloc).
    #[track_caller]
    pub fn vzalloc(&self, size: usize) -> Result<VirtualAddress, VmallocError> {
        let req = VmallocRequest {
            zero: true,
            ..self.request(size)
        };
        self.vmalloc_node_range(req, Location::caller())
    }

    /// [`vmalloc`](Self::vmalloc), preferring pages from `node`.
    ///
    /// # Errors
    /// See [`vmalloc`](Self::vmalloc).
    #[track_caller]
    pub fn vmalloc_node(&self, size: usize, node: NodeId) -> Result<VirtualAddress, VmallocError> {
        let req = VmallocRequest {
            node: Some(node),
            ..self.request(size)
        };
        self.vmalloc_node_range(req, Location::caller())
    }

    /// Zeroed memory that may later be mapped into user space.
    ///
    /// # Errors
    /// See [`vmalloc`](Self::vmalloc).
    #[track_caller]
    pub fn vmalloc_user(&self, size: usize) -> Result<VirtualAddress, VmallocError> {
        let req = VmallocRequest {
            flags: VmFlags::USERMAP,
            zero: true,
            ..self.request(size)
        };
        self.vmalloc_node_range(req, Location::caller())
    }

    /// Executable memory.
    ///
    /// # Errors
    /// See [`vmalloc`](Self::vmalloc).
    #[track_caller]
    pub fn vmalloc_exec(&self, size: usize) -> Result<VirtualAddress, VmallocError> {
        let req = VmallocRequest {
            prot: Protection::KERNEL_EXEC,
            ..self.request(size)
        };
        self.vmalloc_node_range(req, Location::caller())
    }

    /// [`vmalloc`](Self::vmalloc) with explicit page protection.
    ///
    /// # Errors
    /// See [`vmalloc`](Self::vmalloc).
    #[track_caller]
    pub fn vmalloc_prot(&self, size: usize, prot: Protection) -> Result<VirtualAddress, VmallocError> {
        let req = VmallocRequest {
            prot,
            ..self.request(size)
        };
        self.vmalloc_node_range(req, Location::caller())
    }

    /// Allocate inside `[start, end)` with alignment `align`.
    ///
    /// # Errors
    /// See [`vmalloc`](Self::vmalloc).
    #[track_caller]
    pub fn vmalloc_range(
        &self,
        size: usize,
        align: usize,
        start: VirtualAddress,
        end: VirtualAddress,
        prot: Protection,
    ) -> Result<VirtualAddress, VmallocError> {
        let req = VmallocRequest {
            align,
            start,
            end,
            prot,
            ..self.request(size)
        };
        self.vmalloc_node_range(req, Location::caller())
    }

    const fn request(&self, size: usize) -> VmallocRequest {
        VmallocRequest {
            size,
            align: 1,
            start: self.config.start,
            end: self.config.end,
            prot: Protection::KERNEL,
            node: None,
            flags: VmFlags::empty(),
            zero: false,
        }
    }

    fn vmalloc_node_range(
        &self,
        req: VmallocRequest,
        caller: &'static Location<'static>,
    ) -> Result<VirtualAddress, VmallocError> {
        let size = page_align(req.size)
            .filter(|&size| size != 0)
            .ok_or(VmallocError::InvalidSize(req.size))?;
        if (size >> PAGE_SHIFT) > self.pages.total_pages() {
            warn!("vmalloc: {size:#x} bytes exceed physical memory");
            return Err(VmallocError::OutOfMemory);
        }

        let addr = self
            .get_vm_area_node(
                size,
                req.align,
                req.flags | VmFlags::ALLOC | VmFlags::UNLIST,
                req.start,
                req.end,
                caller,
            )?
            .addr;

        self.vmalloc_area_node(addr, size, &req, caller)?;

        if req.zero {
            // SAFETY: [addr, addr + size) was just mapped writable and is not
            // visible to anybody else yet.
            unsafe { self.mapper.zero_range(addr, size) };
        }

        self.publish_vm_area(addr);
        Ok(addr)
    }

    /// Allocate and map the backing pages of the fresh area at `addr`.
    /// On failure the area is released again.
    fn vmalloc_area_node(
        &self,
        addr: VirtualAddress,
        size: usize,
        req: &VmallocRequest,
        caller: &'static Location<'static>,
    ) -> Result<(), VmallocError> {
        let nr_pages = size >> PAGE_SHIFT;
        let array_size = nr_pages * PAGE_ARRAY_ENTRY;

        // Page arrays beyond a page live in vmalloc space themselves.
        let backing = if array_size > PAGE_SIZE {
            let backing_req = VmallocRequest {
                size: array_size,
                align: 1,
                prot: Protection::KERNEL,
                flags: VmFlags::empty(),
                zero: false,
                ..*req
            };
            match self.vmalloc_node_range(backing_req, caller) {
                Ok(backing) => Some(backing),
                Err(e) => {
                    self.remove_vm_area(addr);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let mut pages = Vec::new();
        if pages.try_reserve_exact(nr_pages).is_err() {
            self.store_pages(addr, Vec::new(), backing);
            self.vfree(addr);
            return Err(VmallocError::OutOfMemory);
        }

        for _ in 0..nr_pages {
            if let Some(page) = self.pages.alloc_page(req.node) {
                pages.push(page);
            } else {
                warn!(
                    "vmalloc: allocation failure, allocated {} of {size:#x} bytes",
                    pages.len() << PAGE_SHIFT
                );
                self.store_pages(addr, pages, backing);
                self.vfree(addr);
                return Err(VmallocError::OutOfMemory);
            }
        }

        let result = self.map_vm_area(addr, size, req.prot, &pages);
        self.store_pages(addr, pages, backing);
        if let Err(e) = result {
            self.vfree(addr);
            return Err(e.into());
        }
        Ok(())
    }

    fn store_pages(
        &self,
        addr: VirtualAddress,
        pages: Vec<PageFrame>,
        backing: Option<VirtualAddress>,
    ) {
        let array = match backing {
            // SAFETY: `backing` was vmalloc'd for this area's full page count
            // and is released only together with the area.
            Some(backing) => unsafe { PageArray::store(&self.mapper, backing, &pages) },
            None => PageArray::Heap(pages),
        };

        let mut areas = self.areas.lock();
        let Some(vm) = areas.get_mut(addr.as_usize()).and_then(|area| area.vm_mut()) else {
            unreachable!("vm area {addr} vanished while being populated");
        };
        if array.backing().is_some() {
            vm.flags.insert(VmFlags::VPAGES);
        }
        vm.pages = array;
    }
}
