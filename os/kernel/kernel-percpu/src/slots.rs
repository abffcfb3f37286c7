//! Chunk slots.
//!
//! Chunks are kept on lists ("slots") by how much free space they have, so
//! that an allocation can start scanning where chunks are likely to fit.
//! The slot of a free size is `fls(size) - PCPU_SLOT_BASE_SHIFT + 2`, at
//! least 1. Slot 0 holds chunks too fragmented to serve anything and the
//! last slot holds chunks that are entirely free.

use crate::chunk::{ChunkId, MIN_RUN, PcpuChunk};
use alloc::vec;
use alloc::vec::Vec;
use kernel_info::memory::PCPU_SLOT_BASE_SHIFT;
use kernel_memory_addresses::fls;

/// Slot of a free size, without the special case for empty chunks.
const fn size_to_slot_raw(size: usize) -> usize {
    let highbit = fls(size) as usize;
    let slot = (highbit + 2).saturating_sub(PCPU_SLOT_BASE_SHIFT as usize);
    if slot < 1 { 1 } else { slot }
}

#[derive(Debug)]
pub(crate) struct SlotLists {
    unit_size: usize,
    lists: Vec<Vec<ChunkId>>,
}

impl SlotLists {
    pub fn new(unit_size: usize) -> Self {
        Self {
            unit_size,
            lists: vec![Vec::new(); size_to_slot_raw(unit_size) + 2],
        }
    }

    pub fn nr_slots(&self) -> usize {
        self.lists.len()
    }

    /// The slot for chunks with `size` bytes free.
    pub fn size_to_slot(&self, size: usize) -> usize {
        if size == self.unit_size {
            self.nr_slots() - 1
        } else {
            size_to_slot_raw(size)
        }
    }

    /// The slot `chunk` belongs on.
    pub fn chunk_slot(&self, chunk: &PcpuChunk) -> usize {
        if chunk.free_size < MIN_RUN || chunk.contig_hint < MIN_RUN {
            0
        } else {
            self.size_to_slot(chunk.free_size)
        }
    }

    pub fn list(&self, slot: usize) -> &[ChunkId] {
        &self.lists[slot]
    }

    pub fn slot_of(&self, id: ChunkId) -> Option<usize> {
        self.lists.iter().position(|list| list.contains(&id))
    }

    /// Move `id` from `oslot` (`None` if on no list yet) to `nslot`.
    /// Chunks moving up go to the front of their new list so that they are
    /// tried first; chunks moving down go to the back.
    pub fn relocate(&mut self, id: ChunkId, oslot: Option<usize>, nslot: usize) {
        if oslot == Some(nslot) {
            return;
        }
        if let Some(oslot) = oslot {
            self.remove(id, oslot);
        }
        if oslot.is_none_or(|oslot| oslot < nslot) {
            self.lists[nslot].insert(0, id);
        } else {
            self.lists[nslot].push(id);
        }
    }

    pub fn remove(&mut self, id: ChunkId, slot: usize) {
        self.lists[slot].retain(|&other| other != id);
    }
}
