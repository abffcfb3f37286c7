use crate::alloc_info::PcpuAllocInfo;
use crate::chunk::{ChunkId, PcpuChunk, PcpuChunkInfo};
use crate::error::PercpuError;
use crate::slots::SlotLists;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use kernel_info::memory::PCPU_MIN_UNIT_SIZE;
use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, PageFrame, VirtualAddress};
use kernel_vmalloc::{CpuTopology, KernelMapper, PageAlloc, Vmalloc};
use log::{debug, error, info, warn};
use spin::Mutex;

/// Allocation failures reported before going quiet.
const WARN_LIMIT: usize = 10;

/// A percpu pointer.
///
/// The address an object would have if its chunk's units all started at
/// the chunk base. [`PercpuAllocator::per_cpu_ptr`] turns it into the
/// address of one CPU's instance.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct PercpuPtr(VirtualAddress);

impl PercpuPtr {
    pub const NULL: Self = Self(VirtualAddress::zero());

    #[must_use]
    pub const fn addr(self) -> VirtualAddress {
        self.0
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0.is_null()
    }
}

impl fmt::Debug for PercpuPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PercpuPtr({})", self.0)
    }
}

/// Unit geometry shared by every chunk.
#[derive(Debug)]
pub(crate) struct Geometry {
    pub unit_size: usize,
    pub unit_pages: usize,
    /// Bytes from a chunk's base to the end of its last unit.
    pub chunk_size: usize,
    pub atom_size: usize,
    pub static_size: usize,
    /// End of the reserved area within a unit of the first chunk.
    pub reserved_limit: usize,
    /// Offset of each CPU's unit from the chunk base.
    pub unit_offsets: Vec<usize>,
    pub low_unit_offset: usize,
    pub high_unit_offset: usize,
    pub first_base: VirtualAddress,
}

impl Geometry {
    /// Address of page `page` in `cpu`'s unit of the chunk at `base`.
    pub fn chunk_addr(&self, base: VirtualAddress, cpu: usize, page: usize) -> VirtualAddress {
        base + self.unit_offsets[cpu] + (page << PAGE_SHIFT)
    }

    /// Range touching pages `[page_start, page_end)` of every unit.
    pub fn flush_span(
        &self,
        base: VirtualAddress,
        page_start: usize,
        page_end: usize,
    ) -> (VirtualAddress, VirtualAddress) {
        (
            base + self.low_unit_offset + (page_start << PAGE_SHIFT),
            base + self.high_unit_offset + (page_end << PAGE_SHIFT),
        )
    }
}

/// Index structures, behind the fine-grained lock.
#[derive(Debug)]
pub(crate) struct PcpuState {
    pub chunks: BTreeMap<ChunkId, PcpuChunk>,
    pub slots: SlotLists,
    pub first_chunk: ChunkId,
    pub reserved_chunk: Option<ChunkId>,
    /// Owning chunk of every page populated into a dynamic chunk.
    pub page_chunk: BTreeMap<PageFrame, ChunkId>,
    next_id: u64,
}

impl PcpuState {
    pub fn chunk(&self, id: ChunkId) -> &PcpuChunk {
        let Some(chunk) = self.chunks.get(&id) else {
            unreachable!("percpu: chunk {id:?} vanished");
        };
        chunk
    }

    pub fn chunk_mut(&mut self, id: ChunkId) -> &mut PcpuChunk {
        let Some(chunk) = self.chunks.get_mut(&id) else {
            unreachable!("percpu: chunk {id:?} vanished");
        };
        chunk
    }

    /// Register `chunk` and put it on its slot.
    pub fn insert(&mut self, chunk: PcpuChunk) -> ChunkId {
        let id = ChunkId(self.next_id);
        self.next_id += 1;
        self.chunks.insert(id, chunk);
        self.relocate(id, None);
        id
    }

    /// Move `id` to the slot matching its free size. The reserved chunk is
    /// never on a slot.
    fn relocate(&mut self, id: ChunkId, oslot: Option<usize>) {
        if Some(id) == self.reserved_chunk {
            return;
        }
        let nslot = self.slots.chunk_slot(self.chunk(id));
        self.slots.relocate(id, oslot, nslot);
    }

    pub fn alloc_area(&mut self, id: ChunkId, size: usize, align: usize) -> Option<usize> {
        let oslot = self.slots.chunk_slot(self.chunk(id));
        let off = self.chunk_mut(id).alloc_area(size, align);
        self.relocate(id, Some(oslot));
        off
    }

    pub fn free_area(&mut self, id: ChunkId, off: usize) {
        let oslot = self.slots.chunk_slot(self.chunk(id));
        self.chunk_mut(id).free_area(off);
        self.relocate(id, Some(oslot));
    }
}

/// The percpu allocator.
///
/// Serves allocations from the first chunk while it has room and creates
/// chunks in vmalloc space on demand. Chunks that become entirely free are
/// reclaimed by [`reclaim`](Self::reclaim), which the owner runs from a
/// context that may block once [`needs_reclaim`](Self::needs_reclaim)
/// reports work.
pub struct PercpuAllocator<'v, A, M, C> {
    pub(crate) vm: &'v Vmalloc<A, M, C>,
    pub(crate) geometry: Geometry,
    /// Serializes allocation, population and reclaim.
    pub(crate) alloc_mutex: Mutex<()>,
    pub(crate) state: Mutex<PcpuState>,
    reclaim_pending: AtomicBool,
    warn_limit: AtomicUsize,
}

impl<'v, A, M, C> PercpuAllocator<'v, A, M, C>
where
    A: PageAlloc,
    M: KernelMapper,
    C: CpuTopology,
{
    /// Take over the first chunk at `base`, laid out as described by `ai`.
    /// Every unit of the first chunk must already be mapped.
    ///
    /// With a reserved area, the static and reserved parts form the
    /// reserved chunk, which only serves
    /// [`alloc_reserved`](Self::alloc_reserved), and the dynamic part is
    /// served as a chunk of its own.
    ///
    /// # Panics
    /// If the layout is inconsistent or does not cover every possible CPU.
    pub fn setup_first_chunk(
        vm: &'v Vmalloc<A, M, C>,
        ai: &PcpuAllocInfo,
        base: VirtualAddress,
    ) -> Self {
        let possible = vm.cpus().possible_cpus();
        if let Err(e) = ai.validate(base, possible) {
            error!("percpu: bad first chunk layout ({e}): {ai}");
            panic!("percpu: bad first chunk layout: {e}");
        }

        let unit_offsets = ai.unit_offsets(possible);
        let geometry = Geometry {
            unit_size: ai.unit_size,
            unit_pages: ai.unit_size >> PAGE_SHIFT,
            chunk_size: ai.span(),
            atom_size: ai.atom_size,
            static_size: ai.static_size,
            reserved_limit: ai.static_size + ai.reserved_size,
            low_unit_offset: unit_offsets.iter().copied().min().unwrap_or(0),
            high_unit_offset: unit_offsets.iter().copied().max().unwrap_or(0),
            unit_offsets,
            first_base: base,
        };

        let first = |head, free| {
            PcpuChunk::first(base, geometry.unit_size, geometry.unit_pages, head, free)
        };
        let mut state = PcpuState {
            chunks: BTreeMap::new(),
            slots: SlotLists::new(geometry.unit_size),
            first_chunk: ChunkId(0),
            reserved_chunk: None,
            page_chunk: BTreeMap::new(),
            next_id: 0,
        };
        if ai.reserved_size > 0 {
            // Claim the id before inserting so the chunk stays off the slots.
            state.reserved_chunk = Some(ChunkId(state.next_id));
            state.insert(first(ai.static_size, ai.reserved_size));
            state.first_chunk = state.insert(first(geometry.reserved_limit, ai.dyn_size));
        } else {
            state.first_chunk = state.insert(first(ai.static_size, ai.dyn_size));
        }

        info!(
            "percpu: first chunk at {base}, {} pages/cpu, {ai}",
            geometry.unit_pages
        );

        Self {
            vm,
            geometry,
            alloc_mutex: Mutex::new(()),
            state: Mutex::new(state),
            reclaim_pending: AtomicBool::new(false),
            warn_limit: AtomicUsize::new(WARN_LIMIT),
        }
    }

    /// The vmalloc instance backing dynamic chunks.
    #[must_use]
    pub const fn vmalloc(&self) -> &'v Vmalloc<A, M, C> {
        self.vm
    }

    /// Bytes per unit.
    #[must_use]
    pub const fn unit_size(&self) -> usize {
        self.geometry.unit_size
    }

    /// Offset of `cpu`'s unit from a chunk's base.
    #[must_use]
    pub fn unit_offset(&self, cpu: usize) -> usize {
        self.geometry.unit_offsets[cpu]
    }

    /// Allocate `size` bytes aligned to `align` for every possible CPU. The
    /// memory is zeroed.
    ///
    /// # Errors
    /// [`PercpuError::InvalidRequest`] unless `0 < size <=
    /// PCPU_MIN_UNIT_SIZE` and `align` is a power of two up to a page;
    /// otherwise whatever prevented finding or backing the area.
    pub fn alloc(&self, size: usize, align: usize) -> Result<PercpuPtr, PercpuError> {
        self.pcpu_alloc(size, align, false)
    }

    /// Like [`alloc`](Self::alloc), but served from the reserved chunk if
    /// there is one.
    ///
    /// # Errors
    /// [`PercpuError::ReservedExhausted`] if the reserved chunk cannot hold
    /// the request, otherwise as [`alloc`](Self::alloc).
    pub fn alloc_reserved(&self, size: usize, align: usize) -> Result<PercpuPtr, PercpuError> {
        self.pcpu_alloc(size, align, true)
    }

    fn pcpu_alloc(
        &self,
        size: usize,
        align: usize,
        reserved: bool,
    ) -> Result<PercpuPtr, PercpuError> {
        if size == 0 || size > PCPU_MIN_UNIT_SIZE || !align.is_power_of_two() || align > PAGE_SIZE
        {
            warn!("percpu: illegal size ({size}) or align ({align}) for percpu allocation");
            return Err(PercpuError::InvalidRequest { size, align });
        }

        let _serialized = self.alloc_mutex.lock();
        let result = self.find_area(size, align, reserved).and_then(|(id, base, off)| {
            if let Err(e) = self.populate_chunk(id, off, size) {
                self.state.lock().free_area(id, off);
                return Err(e);
            }
            Ok(PercpuPtr(base + off))
        });

        if let Err(e) = &result {
            self.warn_failure(size, align, e);
        }
        result
    }

    /// Find room for the request, creating a chunk if nothing fits.
    /// Returns the chunk, its base and the offset within it.
    fn find_area(
        &self,
        size: usize,
        align: usize,
        reserved: bool,
    ) -> Result<(ChunkId, VirtualAddress, usize), PercpuError> {
        let mut state = self.state.lock();

        if reserved && let Some(id) = state.reserved_chunk {
            loop {
                let chunk = state.chunk(id);
                if size > chunk.contig_hint {
                    return Err(PercpuError::ReservedExhausted { size });
                }
                let Some(new_alloc) = chunk.need_to_extend() else {
                    break;
                };
                drop(state);
                self.extend_area_map(id, new_alloc)?;
                state = self.state.lock();
            }
            let base = state.chunk(id).base;
            return match state.alloc_area(id, size, align) {
                Some(off) => Ok((id, base, off)),
                None => Err(PercpuError::ReservedExhausted { size }),
            };
        }

        // Each restart follows a map extension or a new chunk, and a new
        // chunk always fits the request.
        'restart: loop {
            for slot in state.slots.size_to_slot(size)..state.slots.nr_slots() {
                let candidates = state.slots.list(slot).to_vec();
                for id in candidates {
                    let chunk = state.chunk(id);
                    if size > chunk.contig_hint {
                        continue;
                    }
                    if let Some(new_alloc) = chunk.need_to_extend() {
                        drop(state);
                        self.extend_area_map(id, new_alloc)?;
                        state = self.state.lock();
                        continue 'restart;
                    }
                    let base = chunk.base;
                    if let Some(off) = state.alloc_area(id, size, align) {
                        return Ok((id, base, off));
                    }
                }
            }

            drop(state);
            let chunk = self.create_chunk()?;
            state = self.state.lock();
            state.insert(chunk);
        }
    }

    /// Grow the map of chunk `id` to `new_alloc` entries. The memory is
    /// obtained without the state lock held.
    fn extend_area_map(&self, id: ChunkId, new_alloc: usize) -> Result<(), PercpuError> {
        let mut new_map = Vec::new();
        new_map
            .try_reserve_exact(new_alloc)
            .map_err(|_| PercpuError::MapExtension)?;

        let discarded = self.state.lock().chunk_mut(id).extend_map(new_map, new_alloc);
        drop(discarded);
        debug!("percpu: map of chunk {id:?} extended to {new_alloc} entries");
        Ok(())
    }

    fn warn_failure(&self, size: usize, align: usize, err: &PercpuError) {
        let Ok(left) = self
            .warn_limit
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| left.checked_sub(1))
        else {
            return;
        };
        warn!("percpu: allocation failed, size={size} align={align}: {err}");
        if left == 1 {
            info!("percpu: limit reached, disable warning");
        }
    }

    /// Free an allocation. A null pointer is ignored. Never blocks on
    /// allocation or reclaim.
    ///
    /// # Panics
    /// If `ptr` was not returned by this allocator or was freed already.
    pub fn free(&self, ptr: PercpuPtr) {
        if ptr.is_null() {
            return;
        }

        let mut state = self.state.lock();
        let id = self.chunk_addr_search(&state, ptr.addr());
        let off = ptr.addr() - state.chunk(id).base;
        state.free_area(id, off);

        if state.chunk(id).free_size == self.geometry.unit_size {
            let top = state.slots.nr_slots() - 1;
            if state.slots.list(top).iter().any(|&other| other != id) {
                self.reclaim_pending.store(true, Ordering::Release);
            }
        }
    }

    /// The chunk holding the object at percpu address `addr`.
    fn chunk_addr_search(&self, state: &PcpuState, addr: VirtualAddress) -> ChunkId {
        let first = self.geometry.first_base;
        if first <= addr && addr < first + self.geometry.unit_size {
            if addr < first + self.geometry.reserved_limit
                && let Some(reserved) = state.reserved_chunk
            {
                return reserved;
            }
            return state.first_chunk;
        }

        let cpu = self.vm.cpus().current_cpu();
        let page = self.vm.vmalloc_to_page(addr + self.geometry.unit_offsets[cpu]);
        match page.and_then(|page| state.page_chunk.get(&page)) {
            Some(id) => *id,
            None => {
                error!("percpu: freeing unknown pointer {addr}");
                panic!("percpu: freeing unknown pointer {addr}");
            }
        }
    }

    /// Address of `cpu`'s instance of `ptr`.
    ///
    /// # Panics
    /// If `cpu` is not a possible CPU.
    #[must_use]
    pub fn per_cpu_ptr(&self, ptr: PercpuPtr, cpu: usize) -> VirtualAddress {
        assert!(
            cpu < self.geometry.unit_offsets.len(),
            "cpu {cpu} is not a possible cpu"
        );
        ptr.addr() + self.geometry.unit_offsets[cpu]
    }

    /// `true` if `addr` lies in the static area of some CPU's first-chunk
    /// unit.
    #[must_use]
    pub fn is_kernel_percpu_address(&self, addr: VirtualAddress) -> bool {
        self.geometry.unit_offsets.iter().any(|&offset| {
            let start = self.geometry.first_base + offset;
            start <= addr && addr < start + self.geometry.static_size
        })
    }

    /// The page backing `addr`, a CPU-specific percpu address.
    ///
    /// The first chunk and vmalloc-backed chunks are both reached through
    /// the kernel page tables, so a single lookup covers either.
    #[must_use]
    pub fn per_cpu_ptr_to_page(&self, addr: VirtualAddress) -> Option<PageFrame> {
        self.vm.vmalloc_to_page(addr)
    }

    /// `true` once a free left more than one chunk entirely free.
    #[must_use]
    pub fn needs_reclaim(&self) -> bool {
        self.reclaim_pending.load(Ordering::Acquire)
    }

    /// Depopulate and destroy every entirely free chunk but one. Returns
    /// the number of chunks destroyed.
    pub fn reclaim(&self) -> usize {
        let _serialized = self.alloc_mutex.lock();
        self.reclaim_pending.store(false, Ordering::Release);

        let victims: Vec<PcpuChunk> = {
            let mut state = self.state.lock();
            let top = state.slots.nr_slots() - 1;
            let ids: Vec<ChunkId> = state.slots.list(top).iter().skip(1).copied().collect();
            let mut victims = Vec::with_capacity(ids.len());
            for id in ids {
                if state.chunk(id).immutable {
                    warn!("percpu: not reclaiming immutable chunk {id:?}");
                    continue;
                }
                state.slots.remove(id, top);
                if let Some(chunk) = state.chunks.remove(&id) {
                    victims.push(chunk);
                }
            }
            victims
        };

        let count = victims.len();
        for mut chunk in victims {
            self.depopulate_chunk(&mut chunk, 0, self.geometry.unit_size);
            self.destroy_chunk(chunk);
        }
        if count > 0 {
            debug!("percpu: reclaimed {count} chunks");
        }
        count
    }

    /// Snapshot of every chunk, the first chunk's parts included.
    #[must_use]
    pub fn chunks(&self) -> Vec<PcpuChunkInfo> {
        let state = self.state.lock();
        state
            .chunks
            .iter()
            .map(|(&id, chunk)| {
                let reserved = state.reserved_chunk == Some(id);
                chunk.info(reserved, state.slots.slot_of(id))
            })
            .collect()
    }
}
