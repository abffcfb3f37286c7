//! Per-CPU vmap blocks.
//!
//! Small, short-lived mappings (up to [`VMAP_MAX_ALLOC`] pages) would hammer
//! the global registry and trigger a TLB flush each. Instead every CPU keeps
//! a queue of *vmap blocks*: naturally aligned runs of `bits` pages, each
//! reserved as one vmap area, from which power-of-two slot runs are carved.
//!
//! ```text
//!            block (bits slots, aligned to its own size)
//!  ┌────┬────┬────────┬────┬────────────────┬─────────────────────┐
//!  │ A  │ d  │   A    │ d  │       A        │        free         │
//!  └────┴────┴────────┴────┴────────────────┴─────────────────────┘
//!   A = handed out   d = released (dirty, still needs a TLB flush)
//! ```
//!
//! Released slots are never reused within a block. Once every slot of a
//! block is dirty, the whole block is lazily freed in one go. Blocks that
//! can no longer satisfy any request (all slots either dirty or handed out,
//! but not all dirty) are *fragmented*; they are retired early on demand.
//!
//! Locking: a block's state lock may be held while taking its CPU's queue
//! lock, never the other way round.

use crate::area::AreaOwner;
use crate::backend::{CpuTopology, KernelMapper, PageAlloc};
use crate::bitmap::SlotBitmap;
use crate::config::VmallocConfig;
use crate::error::VmallocError;
use crate::purge::FlushRange;
use crate::vmalloc::Vmalloc;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_info::memory::{VMAP_BBMAP_BITS_MAX, VMAP_BBMAP_BITS_MIN, VMAP_MAX_ALLOC};
use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, VirtualAddress, get_order, ilog2};
use log::{debug, error, trace};
use spin::{Mutex, RwLock};

/// Mutable state of a block, guarded by the block's own lock.
#[derive(Debug)]
struct VmapBlockState {
    /// Slots never handed out.
    free: usize,
    /// Slots released by their users.
    dirty: usize,
    alloc_map: SlotBitmap,
    dirty_map: SlotBitmap,
}

#[derive(Debug)]
pub(crate) struct VmapBlock {
    va_start: VirtualAddress,
    cpu: usize,
    state: Mutex<VmapBlockState>,
}

/// Snapshot of one vmap block.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct VmapBlockInfo {
    pub start: VirtualAddress,
    pub cpu: usize,
    /// Slots never handed out.
    pub free: usize,
    /// Slots released but not yet flushed.
    pub dirty: usize,
    /// Slots currently in use.
    pub allocated: usize,
    /// Total number of slots.
    pub slots: usize,
}

/// Blocks of one CPU that still have free slots.
#[derive(Debug, Default)]
struct VmapBlockQueue {
    free: Mutex<Vec<Arc<VmapBlock>>>,
}

impl VmapBlockQueue {
    fn snapshot(&self) -> Vec<Arc<VmapBlock>> {
        self.free.lock().clone()
    }

    fn remove(&self, vb: &Arc<VmapBlock>) {
        self.free.lock().retain(|other| !Arc::ptr_eq(other, vb));
    }
}

/// All vmap blocks: per-CPU queues plus an index by block number.
#[derive(Debug)]
pub(crate) struct VmapBlocks {
    /// Slots per block.
    bits: usize,
    /// `config.start` rounded down to the block size; block numbers count
    /// from here.
    index_base: usize,
    queues: Vec<VmapBlockQueue>,
    index: RwLock<BTreeMap<usize, Arc<VmapBlock>>>,
}

impl VmapBlocks {
    /// Size blocks for the window: large enough for the biggest request,
    /// small enough that every CPU gets a share of the window, and a power of
    /// two so that a block can be aligned to its own size.
    pub fn new(config: &VmallocConfig, possible_cpus: usize) -> Self {
        let per_cpu = config.pages() / possible_cpus.next_power_of_two() / 16;
        let bits = if per_cpu == 0 {
            VMAP_BBMAP_BITS_MIN
        } else {
            (1usize << ilog2(per_cpu)).clamp(VMAP_BBMAP_BITS_MIN, VMAP_BBMAP_BITS_MAX)
        };
        let block_size = bits * PAGE_SIZE;

        Self {
            bits,
            index_base: config.start.as_usize() & !(block_size - 1),
            queues: (0..possible_cpus).map(|_| VmapBlockQueue::default()).collect(),
            index: RwLock::new(BTreeMap::new()),
        }
    }

    pub const fn bits(&self) -> usize {
        self.bits
    }

    const fn block_size(&self) -> usize {
        self.bits * PAGE_SIZE
    }

    const fn index_of(&self, addr: VirtualAddress) -> usize {
        (addr.as_usize() - self.index_base) / self.block_size()
    }

    fn queue(&self, cpu: usize) -> &VmapBlockQueue {
        &self.queues[cpu]
    }
}

const _: () = {
    assert!(VMAP_BBMAP_BITS_MIN >= 2 * VMAP_MAX_ALLOC);
    assert!(VMAP_BBMAP_BITS_MIN.is_power_of_two());
};

impl<A, M, C> Vmalloc<A, M, C>
where
    A: PageAlloc,
    M: KernelMapper,
    C: CpuTopology,
{
    /// Number of page slots per vmap block.
    #[must_use]
    pub fn vmap_block_slots(&self) -> usize {
        self.blocks.bits()
    }

    /// Reserve a fresh block for `cpu`, claim its first `2^order` slots and
    /// put it at the head of the queue. Returns the claimed address.
    fn new_vmap_block(&self, cpu: usize, order: u32) -> Result<VirtualAddress, VmallocError> {
        let block_size = self.blocks.block_size();
        let va_start =
            self.alloc_vmap_area(block_size, block_size, self.config.start, self.config.end)?;
        if let Some(area) = self.areas.lock().get_mut(va_start.as_usize()) {
            area.owner = AreaOwner::Block;
        }

        let bits = self.blocks.bits;
        let mut alloc_map = SlotBitmap::new();
        if alloc_map.find_free_region(bits, order) != Some(0) {
            unreachable!("fresh vmap block cannot hold order {order}");
        }
        let vb = Arc::new(VmapBlock {
            va_start,
            cpu,
            state: Mutex::new(VmapBlockState {
                free: bits - (1 << order),
                dirty: 0,
                alloc_map,
                dirty_map: SlotBitmap::new(),
            }),
        });

        let idx = self.blocks.index_of(va_start);
        let previous = self.blocks.index.write().insert(idx, Arc::clone(&vb));
        assert!(previous.is_none(), "vmap block {idx} registered twice");

        self.blocks.queue(cpu).free.lock().insert(0, vb);
        debug!("vmalloc: new vmap block {va_start} for cpu {cpu}");
        Ok(va_start)
    }

    /// Unregister a fully dirty block and lazily free its range.
    fn free_vmap_block(&self, vb: &VmapBlock) {
        let idx = self.blocks.index_of(vb.va_start);
        let removed = self.blocks.index.write().remove(&idx);
        assert!(removed.is_some(), "vmap block {idx} is not registered");
        debug!("vmalloc: retiring vmap block {} of cpu {}", vb.va_start, vb.cpu);
        self.free_vmap_area_noflush(vb.va_start);
    }

    /// Retire every fragmented block on `cpu`'s queue.
    pub(crate) fn purge_fragmented_blocks(&self, cpu: usize) {
        let bits = self.blocks.bits;
        let queue = self.blocks.queue(cpu);
        let mut retired = Vec::new();

        for vb in queue.snapshot() {
            let mut st = vb.state.lock();
            if st.free + st.dirty == bits && st.dirty != bits {
                st.free = 0;
                st.dirty = bits;
                st.alloc_map.fill(bits);
                st.dirty_map.fill(bits);
                queue.remove(&vb);
                drop(st);
                retired.push(vb);
            }
        }

        for vb in &retired {
            self.free_vmap_block(vb);
        }
    }

    pub(crate) fn purge_fragmented_blocks_allcpus(&self) {
        for cpu in 0..self.blocks.queues.len() {
            self.purge_fragmented_blocks(cpu);
        }
    }

    /// Carve `size` bytes (rounded up to a power-of-two number of pages) out
    /// of one of the current CPU's blocks.
    pub(crate) fn vb_alloc(&self, size: usize) -> Result<VirtualAddress, VmallocError> {
        assert!(
            size != 0 && size.is_multiple_of(PAGE_SIZE) && size <= VMAP_MAX_ALLOC * PAGE_SIZE,
            "invalid vmap block request of {size:#x} bytes"
        );
        let order = get_order(size);
        let want = 1usize << order;
        let bits = self.blocks.bits;

        let cpu = self.cpus.current_cpu();
        let queue = self.blocks.queue(cpu);
        let mut found = None;
        let mut purge = false;

        for vb in queue.snapshot() {
            let mut st = vb.state.lock();
            if st.free < want {
                continue;
            }
            let Some(slot) = st.alloc_map.find_free_region(bits, order) else {
                if st.free + st.dirty == bits && st.dirty != bits {
                    purge = true;
                }
                continue;
            };

            let addr = vb.va_start.add_pages(slot);
            debug_assert_eq!(self.blocks.index_of(addr), self.blocks.index_of(vb.va_start));
            st.free -= want;
            if st.free == 0 {
                queue.remove(&vb);
            }
            found = Some(addr);
            break;
        }

        if purge {
            self.purge_fragmented_blocks(cpu);
        }
        let addr = match found {
            Some(addr) => addr,
            None => self.new_vmap_block(cpu, order)?,
        };
        trace!("vmalloc: vmap block slot {addr} ({want} pages) on cpu {cpu}");
        Ok(addr)
    }

    /// Release a slot run handed out by [`vb_alloc`](Self::vb_alloc).
    pub(crate) fn vb_free(&self, addr: VirtualAddress, size: usize) {
        assert!(
            size != 0 && size.is_multiple_of(PAGE_SIZE) && size <= VMAP_MAX_ALLOC * PAGE_SIZE,
            "invalid vmap block release of {size:#x} bytes"
        );
        let order = get_order(size);
        let offset = addr.as_usize() & (self.blocks.block_size() - 1);
        let idx = self.blocks.index_of(addr);

        let Some(vb) = self.blocks.index.read().get(&idx).cloned() else {
            error!("vmalloc: {addr} does not belong to a vmap block");
            panic!("vmalloc: {addr} does not belong to a vmap block");
        };

        let end = addr + size;
        self.mapper.flush_cache_range(addr, end);
        self.mapper.unmap_range(addr, end);

        let mut st = vb.state.lock();
        if !st.dirty_map.allocate_region(offset >> PAGE_SHIFT, order) {
            error!("vmalloc: vmap block slot {addr} released twice");
            panic!("vmalloc: vmap block slot {addr} released twice");
        }
        st.dirty += 1 << order;
        if st.dirty == self.blocks.bits {
            assert_eq!(st.free, 0, "fully dirty vmap block still has free slots");
            drop(st);
            self.free_vmap_block(&vb);
        }
    }

    /// Flush all lazily freed ranges now, including dirty slots of every
    /// vmap block. Needed before handing pages that were mapped through
    /// vmalloc to code that maps them with different attributes.
    pub fn vm_unmap_aliases(&self) {
        let bits = self.blocks.bits;
        let mut range = FlushRange::empty();
        let mut flush = false;

        for queue in &self.blocks.queues {
            for vb in queue.snapshot() {
                let st = vb.state.lock();
                if let Some((first, last)) = st.dirty_map.span(bits) {
                    let start = vb.va_start.add_pages(first);
                    let end = vb.va_start.add_pages(last);
                    range.include(start.as_usize(), end.as_usize());
                    flush = true;
                }
            }
        }

        self.purge_vmap_area_lazy_range(&mut range, true, flush);
    }

    /// Snapshot of all registered vmap blocks, in address order.
    #[must_use]
    pub fn vmap_blocks(&self) -> Vec<VmapBlockInfo> {
        let bits = self.blocks.bits;
        self.blocks
            .index
            .read()
            .values()
            .map(|vb| {
                let st = vb.state.lock();
                VmapBlockInfo {
                    start: vb.va_start,
                    cpu: vb.cpu,
                    free: st.free,
                    dirty: st.dirty,
                    allocated: st.alloc_map.count_ones_without(&st.dirty_map),
                    slots: bits,
                }
            })
            .collect()
    }
}
