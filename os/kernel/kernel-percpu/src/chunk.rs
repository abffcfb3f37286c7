//! Chunks and their allocation maps.
//!
//! A chunk's map is the sequence of runs covering one unit, in offset
//! order. Each run is either free or handed out; neighbouring free runs are
//! always merged, so two free runs are never adjacent after a release.
//!
//! ```text
//!  offset 0                                                unit_size
//!  ├─ Used(64) ─┼─ Free(4032) ─┼─ Used(8) ─┼───── Free(28664) ──────┤
//! ```
//!
//! Every unit of a chunk shares the same map: an offset handed out is valid
//! in all of them at once.

use alloc::vec;
use alloc::vec::Vec;
use kernel_info::memory::PCPU_DFL_MAP_ALLOC;
use kernel_memory_addresses::VirtualAddress;
use log::error;

/// Free runs shorter than this are not worth tracking on their own and are
/// folded into their neighbour.
pub(crate) const MIN_RUN: usize = core::mem::size_of::<u32>();

/// One entry of a chunk's allocation map.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Run {
    Free(usize),
    Used(usize),
}

impl Run {
    /// Length in bytes.
    #[must_use]
    pub const fn len(self) -> usize {
        match self {
            Self::Free(len) | Self::Used(len) => len,
        }
    }

    #[must_use]
    pub const fn is_free(self) -> bool {
        matches!(self, Self::Free(_))
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct ChunkId(pub u64);

#[derive(Debug)]
pub(crate) struct PcpuChunk {
    pub base: VirtualAddress,
    /// Runs in offset order. `map.capacity() >= map_alloc` at all times, so
    /// that splitting never reallocates under the lock.
    pub map: Vec<Run>,
    pub map_alloc: usize,
    pub free_size: usize,
    /// Never smaller than the largest free run; exact only after a scan
    /// that walked the whole map.
    pub contig_hint: usize,
    /// One entry per page of a unit.
    pub populated: Vec<bool>,
    /// Set for the chunks carved from the first chunk. They are always
    /// fully populated and are never destroyed.
    pub immutable: bool,
}

/// Snapshot of a chunk.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PcpuChunkInfo {
    pub base: VirtualAddress,
    pub free_size: usize,
    pub contig_hint: usize,
    pub map: Vec<Run>,
    /// Map capacity in entries.
    pub map_alloc: usize,
    pub populated_pages: usize,
    pub immutable: bool,
    pub reserved: bool,
    /// Slot list the chunk is on; `None` for the reserved chunk.
    pub slot: Option<usize>,
}

impl PcpuChunkInfo {
    /// Length of the largest free run.
    #[must_use]
    pub fn largest_free_run(&self) -> usize {
        self.map
            .iter()
            .filter(|run| run.is_free())
            .map(|run| run.len())
            .max()
            .unwrap_or(0)
    }
}

impl PcpuChunk {
    /// An empty chunk at `base`, nothing populated.
    pub fn new(base: VirtualAddress, unit_size: usize, unit_pages: usize) -> Self {
        let mut map = Vec::with_capacity(PCPU_DFL_MAP_ALLOC);
        map.push(Run::Free(unit_size));
        Self {
            base,
            map,
            map_alloc: PCPU_DFL_MAP_ALLOC,
            free_size: unit_size,
            contig_hint: unit_size,
            populated: vec![false; unit_pages],
            immutable: false,
        }
    }

    /// A view into the first chunk: `head` bytes in use, then `free` bytes
    /// available, the rest of the unit held back. Fully populated.
    pub fn first(
        base: VirtualAddress,
        unit_size: usize,
        unit_pages: usize,
        head: usize,
        free: usize,
    ) -> Self {
        let mut map = Vec::with_capacity(PCPU_DFL_MAP_ALLOC);
        map.push(Run::Used(head));
        map.push(Run::Free(free));
        let slack = unit_size - head - free;
        if slack > 0 {
            map.push(Run::Used(slack));
        }
        Self {
            base,
            map,
            map_alloc: PCPU_DFL_MAP_ALLOC,
            free_size: free,
            contig_hint: free,
            populated: vec![true; unit_pages],
            immutable: true,
        }
    }

    /// New map capacity needed before an allocation may split a run, if
    /// the current one is too small. A split adds at most two entries.
    pub fn need_to_extend(&self) -> Option<usize> {
        if self.map_alloc >= self.map.len() + 2 {
            return None;
        }
        let mut new_alloc = PCPU_DFL_MAP_ALLOC;
        while new_alloc < self.map.len() + 2 {
            new_alloc *= 2;
        }
        Some(new_alloc)
    }

    /// Switch to `new_map`, an empty vector with room for `new_alloc`
    /// entries, unless the map has grown to that size meanwhile. Returns
    /// whichever vector is no longer needed so it can be dropped outside
    /// the lock.
    pub fn extend_map(&mut self, mut new_map: Vec<Run>, new_alloc: usize) -> Vec<Run> {
        if new_alloc <= self.map_alloc {
            return new_map;
        }
        new_map.extend_from_slice(&self.map);
        self.map_alloc = new_alloc;
        core::mem::replace(&mut self.map, new_map)
    }

    /// Carve `size` bytes aligned to `align` out of the first free run that
    /// can hold them, returning the offset.
    ///
    /// The map must have room for two more entries.
    pub fn alloc_area(&mut self, size: usize, align: usize) -> Option<usize> {
        let nr_runs = self.map.len();
        let mut max_contig = 0;
        let mut off = 0;
        let mut i = 0;

        while i < self.map.len() {
            let is_last = i + 1 == nr_runs;
            let Run::Free(len) = self.map[i] else {
                off += self.map[i].len();
                i += 1;
                continue;
            };

            let mut head = off.next_multiple_of(align) - off;
            if len < head + size {
                max_contig = max_contig.max(len);
                off += len;
                i += 1;
                continue;
            }

            // A tiny head, or one following a free run, goes to the
            // previous run instead of becoming a run of its own.
            if head > 0 && (head < MIN_RUN || self.map[i - 1].is_free()) {
                self.map[i - 1] = match self.map[i - 1] {
                    Run::Free(prev) => Run::Free(prev + head),
                    Run::Used(prev) => {
                        self.free_size -= head;
                        Run::Used(prev + head)
                    }
                };
                self.map[i] = Run::Free(len - head);
                off += head;
                head = 0;
            }

            // A tiny tail stays attached to the allocation as slack.
            let tail = match self.map[i].len() - head - size {
                tail if tail < MIN_RUN => 0,
                tail => tail,
            };

            if head > 0 || tail > 0 {
                self.split(i, head, tail);
                if head > 0 {
                    i += 1;
                    off += head;
                    max_contig = max_contig.max(self.map[i - 1].len());
                }
                if tail > 0 {
                    max_contig = max_contig.max(self.map[i + 1].len());
                }
            }

            self.contig_hint = if is_last {
                max_contig
            } else {
                self.contig_hint.max(max_contig)
            };

            let len = self.map[i].len();
            self.free_size -= len;
            self.map[i] = Run::Used(len);
            return Some(off);
        }

        // Walked everything without a fit: the hint is exact now.
        self.contig_hint = max_contig;
        None
    }

    /// Split free run `i` into `head`, body and `tail`; zero-sized parts are
    /// not created.
    fn split(&mut self, mut i: usize, head: usize, tail: usize) {
        if head > 0 {
            let len = self.map[i].len();
            self.map[i] = Run::Free(head);
            self.map.insert(i + 1, Run::Free(len - head));
            i += 1;
        }
        if tail > 0 {
            let len = self.map[i].len();
            self.map[i] = Run::Free(len - tail);
            self.map.insert(i + 1, Run::Free(tail));
        }
    }

    /// Release the run starting at offset `freeme` and merge it with free
    /// neighbours.
    ///
    /// # Panics
    /// If no run starts at `freeme` or the run is already free.
    pub fn free_area(&mut self, freeme: usize) {
        let mut off = 0;
        let Some(mut i) = self.map.iter().position(|run| {
            let here = off;
            off += run.len();
            here == freeme
        }) else {
            error!("percpu: no area at offset {freeme:#x} in chunk {}", self.base);
            panic!("percpu: no area at offset {freeme:#x} in chunk {}", self.base);
        };

        let Run::Used(len) = self.map[i] else {
            error!("percpu: double free at offset {freeme:#x} in chunk {}", self.base);
            panic!("percpu: double free at offset {freeme:#x} in chunk {}", self.base);
        };
        self.map[i] = Run::Free(len);
        self.free_size += len;

        if i > 0 && self.map[i - 1].is_free() {
            self.map[i - 1] = Run::Free(self.map[i - 1].len() + self.map[i].len());
            self.map.remove(i);
            i -= 1;
        }
        if i + 1 < self.map.len() && self.map[i + 1].is_free() {
            self.map[i] = Run::Free(self.map[i].len() + self.map[i + 1].len());
            self.map.remove(i + 1);
        }

        self.contig_hint = self.contig_hint.max(self.map[i].len());
    }

    /// Maximal runs of pages within `[start, end)` whose populated state is
    /// `populated`, as half-open page index ranges.
    pub fn page_regions(&self, start: usize, end: usize, populated: bool) -> Vec<(usize, usize)> {
        let mut regions = Vec::new();
        let mut page = start;
        while page < end {
            if self.populated[page] != populated {
                page += 1;
                continue;
            }
            let first = page;
            while page < end && self.populated[page] == populated {
                page += 1;
            }
            regions.push((first, page));
        }
        regions
    }

    pub fn set_populated(&mut self, start: usize, end: usize, populated: bool) {
        self.populated[start..end].fill(populated);
    }

    pub fn populated_pages(&self) -> usize {
        self.populated.iter().filter(|&&page| page).count()
    }

    pub fn info(&self, reserved: bool, slot: Option<usize>) -> PcpuChunkInfo {
        PcpuChunkInfo {
            base: self.base,
            free_size: self.free_size,
            contig_hint: self.contig_hint,
            map: self.map.clone(),
            map_alloc: self.map_alloc,
            populated_pages: self.populated_pages(),
            immutable: self.immutable,
            reserved,
            slot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const UNIT: usize = 32 << 10;

    fn chunk() -> PcpuChunk {
        PcpuChunk::new(VirtualAddress::new(0xffff_c900_0000_0000), UNIT, UNIT >> 12)
    }

    fn total(chunk: &PcpuChunk) -> usize {
        chunk.map.iter().map(|run| run.len()).sum()
    }

    fn free_bytes(chunk: &PcpuChunk) -> usize {
        chunk
            .map
            .iter()
            .filter(|run| run.is_free())
            .map(|run| run.len())
            .sum()
    }

    #[test]
    fn allocations_are_packed_from_the_start() {
        let mut chunk = chunk();
        assert_eq!(chunk.alloc_area(64, 8), Some(0));
        assert_eq!(chunk.alloc_area(64, 8), Some(64));
        assert_eq!(chunk.map, vec![Run::Used(64), Run::Used(64), Run::Free(UNIT - 128)]);
        assert_eq!(chunk.free_size, UNIT - 128);
        assert_eq!(chunk.contig_hint, UNIT - 128);
    }

    #[test]
    fn alignment_padding_becomes_a_free_run() {
        let mut chunk = chunk();
        chunk.alloc_area(64, 8).unwrap();
        assert_eq!(chunk.alloc_area(8, 4096), Some(4096));
        assert_eq!(
            chunk.map,
            vec![
                Run::Used(64),
                Run::Free(4032),
                Run::Used(8),
                Run::Free(UNIT - 4096 - 8)
            ]
        );
        assert_eq!(chunk.free_size, free_bytes(&chunk));
        assert_eq!(chunk.contig_hint, UNIT - 4096 - 8);

        // The padding is still usable.
        assert_eq!(chunk.alloc_area(32, 8), Some(64));
    }

    #[test]
    fn tiny_head_is_absorbed_by_the_previous_run() {
        let mut chunk = chunk();
        assert_eq!(chunk.alloc_area(2, 1), Some(0));
        assert_eq!(chunk.alloc_area(4, 4), Some(4));
        assert_eq!(chunk.map, vec![Run::Used(4), Run::Used(4), Run::Free(UNIT - 8)]);
        assert_eq!(chunk.free_size, UNIT - 8);
    }

    #[test]
    fn tiny_tail_is_kept_as_slack() {
        let mut chunk = chunk();
        assert_eq!(chunk.alloc_area(UNIT - 2, 1), Some(0));
        assert_eq!(chunk.map, vec![Run::Used(UNIT)]);
        assert_eq!(chunk.free_size, 0);

        chunk.free_area(0);
        assert_eq!(chunk.map, vec![Run::Free(UNIT)]);
        assert_eq!(chunk.free_size, UNIT);
    }

    #[test]
    fn release_merges_with_both_neighbours() {
        let mut chunk = chunk();
        let a = chunk.alloc_area(100, 4).unwrap();
        let b = chunk.alloc_area(100, 4).unwrap();
        let c = chunk.alloc_area(100, 4).unwrap();
        chunk.free_area(a);
        chunk.free_area(c);
        assert_eq!(
            chunk.map,
            vec![Run::Free(100), Run::Used(100), Run::Free(UNIT - 200)]
        );
        chunk.free_area(b);
        assert_eq!(chunk.map, vec![Run::Free(UNIT)]);
        assert_eq!(chunk.contig_hint, UNIT);
    }

    #[test]
    fn failed_scan_makes_the_hint_exact() {
        let mut chunk = chunk();
        chunk.alloc_area(UNIT - 1024, 4).unwrap();
        assert_eq!(chunk.alloc_area(2048, 4), None);
        assert_eq!(chunk.contig_hint, 1024);
    }

    #[test]
    fn map_grows_by_doubling() {
        let mut chunk = chunk();
        assert_eq!(chunk.need_to_extend(), None);
        for _ in 0..PCPU_DFL_MAP_ALLOC - 2 {
            chunk.alloc_area(8, 4).unwrap();
        }
        // Fifteen runs now; a split could need seventeen entries.
        assert_eq!(chunk.map.len(), PCPU_DFL_MAP_ALLOC - 1);
        assert_eq!(chunk.need_to_extend(), Some(2 * PCPU_DFL_MAP_ALLOC));

        let old = chunk.map.clone();
        let mut new_map = Vec::new();
        new_map.reserve_exact(2 * PCPU_DFL_MAP_ALLOC);
        let discarded = chunk.extend_map(new_map, 2 * PCPU_DFL_MAP_ALLOC);
        assert_eq!(discarded, old);
        assert_eq!(chunk.map, old);
        assert_eq!(chunk.map_alloc, 2 * PCPU_DFL_MAP_ALLOC);
        assert_eq!(chunk.need_to_extend(), None);

        // A late extension to a size already reached is dropped.
        let unused = chunk.extend_map(Vec::with_capacity(PCPU_DFL_MAP_ALLOC), PCPU_DFL_MAP_ALLOC);
        assert!(unused.is_empty());
        assert_eq!(chunk.map_alloc, 2 * PCPU_DFL_MAP_ALLOC);
    }

    #[test]
    fn first_chunk_view_holds_back_the_rest() {
        let chunk = PcpuChunk::first(VirtualAddress::new(0x1000), UNIT, 8, 8192, 20480);
        assert_eq!(
            chunk.map,
            vec![Run::Used(8192), Run::Free(20480), Run::Used(UNIT - 8192 - 20480)]
        );
        assert_eq!(chunk.populated_pages(), 8);
        assert!(chunk.immutable);
    }

    #[test]
    fn page_regions_split_on_state_changes() {
        let mut chunk = chunk();
        chunk.set_populated(2, 4, true);
        chunk.set_populated(6, 7, true);
        assert_eq!(chunk.page_regions(0, 8, false), vec![(0, 2), (4, 6), (7, 8)]);
        assert_eq!(chunk.page_regions(3, 8, true), vec![(3, 4), (6, 7)]);
        assert_eq!(chunk.populated_pages(), 3);
    }

    #[test]
    fn random_traffic_keeps_the_map_consistent() {
        let mut chunk = chunk();
        let mut rng = StdRng::seed_from_u64(7);
        let mut live = Vec::new();

        for _ in 0..5_000 {
            if live.is_empty() || rng.gen_bool(0.55) {
                if let Some(new_alloc) = chunk.need_to_extend() {
                    chunk.extend_map(Vec::with_capacity(new_alloc), new_alloc);
                }
                let size = rng.gen_range(1..=512);
                let align = 1 << rng.gen_range(0..=6);
                if let Some(off) = chunk.alloc_area(size, align) {
                    assert_eq!(off % align, 0);
                    live.push(off);
                }
            } else {
                let off = live.swap_remove(rng.gen_range(0..live.len()));
                chunk.free_area(off);
            }

            assert_eq!(total(&chunk), UNIT);
            assert_eq!(chunk.free_size, free_bytes(&chunk));
            let info = chunk.info(false, None);
            assert!(chunk.contig_hint >= info.largest_free_run(), "{info:?}");
            assert!(
                chunk.map.windows(2).all(|w| !(w[0].is_free() && w[1].is_free())),
                "adjacent free runs: {:?}",
                chunk.map
            );
            assert!(chunk.map.len() <= chunk.map_alloc);
        }
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_release_is_fatal() {
        let mut chunk = chunk();
        let off = chunk.alloc_area(16, 4).unwrap();
        chunk.alloc_area(16, 4).unwrap();
        chunk.free_area(off);
        chunk.free_area(off);
    }

    #[test]
    #[should_panic(expected = "no area at offset")]
    fn releasing_an_interior_offset_is_fatal() {
        let mut chunk = chunk();
        chunk.alloc_area(16, 4).unwrap();
        chunk.free_area(8);
    }
}
