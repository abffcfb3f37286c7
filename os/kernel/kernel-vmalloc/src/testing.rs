//! A simulated machine for exercising the allocators off-target.
//!
//! [`SimMachine`] implements [`PageAlloc`], [`KernelMapper`] and
//! [`CpuTopology`] on top of plain heap memory: frames are boxed 4 KiB
//! buffers, page tables are an ordered map from page number to frame, and the
//! "current CPU" is a settable number. It records flushes and can be told to
//! fail, which lets tests observe the allocators' side effects and error
//! paths.
//!
//! Clones share state, so one machine can be handed to an allocator three
//! times (as page allocator, mapper and topology) and still be inspected.

use crate::backend::{CpuTopology, KernelMapper, MapError, NodeId, PageAlloc, Protection};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, PageFrame, VirtualAddress};
use spin::Mutex;

/// Byte pattern fresh frames are filled with.
pub const POISON: u8 = 0xA5;

/// Default amount of simulated physical memory, in pages.
pub const DEFAULT_TOTAL_PAGES: usize = 1 << 20;

#[derive(Debug)]
struct Frames {
    next_pfn: u64,
    live: BTreeMap<PageFrame, Box<[u8]>>,
    allocs: usize,
    fail_at: Option<usize>,
}

#[derive(Debug, Copy, Clone)]
struct Pte {
    frame: PageFrame,
    prot: Protection,
}

#[derive(Debug)]
struct Inner {
    possible_cpus: usize,
    online_cpus: AtomicUsize,
    current_cpu: AtomicUsize,
    nodes: usize,
    total_pages: usize,
    frames: Mutex<Frames>,
    ptes: Mutex<BTreeMap<usize, Pte>>,
    tlb_flushes: Mutex<Vec<(VirtualAddress, VirtualAddress)>>,
    cache_flushes: AtomicUsize,
    fail_maps: AtomicUsize,
}

/// Simulated physical memory, page tables and CPUs.
#[derive(Debug, Clone)]
pub struct SimMachine {
    inner: Arc<Inner>,
}

impl SimMachine {
    /// A machine with `cpus` CPUs, all online, on a single node.
    #[must_use]
    pub fn new(cpus: usize) -> Self {
        Self::with_nodes(cpus, 1)
    }

    /// A machine with `cpus` CPUs spread round-robin over `nodes` nodes.
    #[must_use]
    pub fn with_nodes(cpus: usize, nodes: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                possible_cpus: cpus,
                online_cpus: AtomicUsize::new(cpus),
                current_cpu: AtomicUsize::new(0),
                nodes: nodes.max(1),
                total_pages: DEFAULT_TOTAL_PAGES,
                frames: Mutex::new(Frames {
                    next_pfn: 0x100,
                    live: BTreeMap::new(),
                    allocs: 0,
                    fail_at: None,
                }),
                ptes: Mutex::new(BTreeMap::new()),
                tlb_flushes: Mutex::new(Vec::new()),
                cache_flushes: AtomicUsize::new(0),
                fail_maps: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_current_cpu(&self, cpu: usize) {
        assert!(cpu < self.inner.possible_cpus, "cpu {cpu} does not exist");
        self.inner.current_cpu.store(cpu, Ordering::Relaxed);
    }

    pub fn set_online_cpus(&self, online: usize) {
        self.inner.online_cpus.store(online, Ordering::Relaxed);
    }

    /// Make the `nth` page allocation from now on (1-based) fail once.
    pub fn fail_nth_page_alloc(&self, nth: usize) {
        let mut frames = self.inner.frames.lock();
        frames.fail_at = Some(frames.allocs + nth);
    }

    /// Make the next `count` calls to `map_range` fail.
    pub fn fail_next_maps(&self, count: usize) {
        self.inner.fail_maps.store(count, Ordering::Relaxed);
    }

    /// Frames currently handed out.
    #[must_use]
    pub fn outstanding_pages(&self) -> usize {
        self.inner.frames.lock().live.len()
    }

    /// Number of live page-table entries.
    #[must_use]
    pub fn mapped_pages(&self) -> usize {
        self.inner.ptes.lock().len()
    }

    #[must_use]
    pub fn is_mapped(&self, va: VirtualAddress) -> bool {
        self.inner.ptes.lock().contains_key(&(va.as_usize() >> PAGE_SHIFT))
    }

    /// Protection of the mapping at `va`.
    #[must_use]
    pub fn protection(&self, va: VirtualAddress) -> Option<Protection> {
        self.inner
            .ptes
            .lock()
            .get(&(va.as_usize() >> PAGE_SHIFT))
            .map(|pte| pte.prot)
    }

    /// Every TLB flush issued so far.
    #[must_use]
    pub fn tlb_flushes(&self) -> Vec<(VirtualAddress, VirtualAddress)> {
        self.inner.tlb_flushes.lock().clone()
    }

    #[must_use]
    pub fn tlb_flush_count(&self) -> usize {
        self.inner.tlb_flushes.lock().len()
    }

    #[must_use]
    pub fn cache_flush_count(&self) -> usize {
        self.inner.cache_flushes.load(Ordering::Relaxed)
    }

    /// `true` if some recorded TLB flush covers all of `[start, end)`.
    #[must_use]
    pub fn tlb_flushed(&self, start: VirtualAddress, end: VirtualAddress) -> bool {
        self.inner
            .tlb_flushes
            .lock()
            .iter()
            .any(|&(s, e)| s <= start && end <= e)
    }

    /// Read `len` bytes through the simulated page tables.
    #[must_use]
    pub fn read_bytes(&self, va: VirtualAddress, len: usize) -> Option<Vec<u8>> {
        let ptes = self.inner.ptes.lock();
        let frames = self.inner.frames.lock();
        let mut out = Vec::with_capacity(len);
        let mut addr = va.as_usize();
        let end = addr + len;
        while addr < end {
            let pte = ptes.get(&(addr >> PAGE_SHIFT))?;
            let data = frames.live.get(&pte.frame)?;
            let offset = addr & (PAGE_SIZE - 1);
            let chunk = (PAGE_SIZE - offset).min(end - addr);
            out.extend_from_slice(&data[offset..offset + chunk]);
            addr += chunk;
        }
        Some(out)
    }

    /// Write `bytes` through the simulated page tables. Returns `false` if
    /// any byte of the range is unmapped; nothing is written in that case.
    pub fn write_bytes(&self, va: VirtualAddress, bytes: &[u8]) -> bool {
        let ptes = self.inner.ptes.lock();
        let mut frames = self.inner.frames.lock();
        let start = va.as_usize();
        let end = start + bytes.len();

        let mut addr = start;
        while addr < end {
            let Some(pte) = ptes.get(&(addr >> PAGE_SHIFT)) else {
                return false;
            };
            if !frames.live.contains_key(&pte.frame) {
                return false;
            }
            addr = (addr & !(PAGE_SIZE - 1)) + PAGE_SIZE;
        }

        let mut addr = start;
        while addr < end {
            let frame = ptes[&(addr >> PAGE_SHIFT)].frame;
            let offset = addr & (PAGE_SIZE - 1);
            let chunk = (PAGE_SIZE - offset).min(end - addr);
            if let Some(data) = frames.live.get_mut(&frame) {
                let src = addr - start;
                data[offset..offset + chunk].copy_from_slice(&bytes[src..src + chunk]);
            }
            addr += chunk;
        }
        true
    }

    /// Back `[start, start + pages * PAGE_SIZE)` with fresh frames, the way
    /// boot code maps static data. Returns the frames.
    ///
    /// # Panics
    /// If the simulated memory is exhausted or the range is already mapped.
    #[must_use]
    pub fn map_static(&self, start: VirtualAddress, pages: usize) -> Vec<PageFrame> {
        let frames: Vec<PageFrame> = (0..pages)
            .map(|_| {
                self.alloc_page(None)
                    .unwrap_or_else(|| panic!("simulated memory exhausted"))
            })
            .collect();
        if let Err(e) = self.map_range(start, start.add_pages(pages), Protection::KERNEL, &frames) {
            panic!("static mapping at {start} failed: {e}");
        }
        frames
    }
}

impl PageAlloc for SimMachine {
    fn alloc_page(&self, _node: Option<NodeId>) -> Option<PageFrame> {
        let mut frames = self.inner.frames.lock();
        frames.allocs += 1;
        if frames.fail_at == Some(frames.allocs) {
            frames.fail_at = None;
            return None;
        }
        if frames.live.len() >= self.inner.total_pages {
            return None;
        }
        let frame = PageFrame::from_pfn(frames.next_pfn);
        frames.next_pfn += 1;
        frames
            .live
            .insert(frame, vec![POISON; PAGE_SIZE].into_boxed_slice());
        Some(frame)
    }

    fn free_page(&self, frame: PageFrame) {
        let removed = self.inner.frames.lock().live.remove(&frame);
        assert!(removed.is_some(), "double free of {frame}");
    }

    fn total_pages(&self) -> usize {
        self.inner.total_pages
    }
}

impl KernelMapper for SimMachine {
    fn map_range(
        &self,
        start: VirtualAddress,
        end: VirtualAddress,
        prot: Protection,
        pages: &[PageFrame],
    ) -> Result<(), MapError> {
        let pending = self.inner.fail_maps.load(Ordering::Relaxed);
        if pending > 0 {
            self.inner.fail_maps.store(pending - 1, Ordering::Relaxed);
            return Err(MapError::PageTableAllocation);
        }

        let count = (end - start) >> PAGE_SHIFT;
        assert!(pages.len() >= count, "{count} pages to map but only {} given", pages.len());

        let mut ptes = self.inner.ptes.lock();
        for (i, frame) in pages.iter().take(count).enumerate() {
            let va = start.add_pages(i);
            let vpn = va.as_usize() >> PAGE_SHIFT;
            if ptes.contains_key(&vpn) {
                return Err(MapError::AlreadyMapped(va));
            }
            ptes.insert(vpn, Pte { frame: *frame, prot });
        }
        Ok(())
    }

    fn unmap_range(&self, start: VirtualAddress, end: VirtualAddress) {
        let mut ptes = self.inner.ptes.lock();
        let first = start.as_usize() >> PAGE_SHIFT;
        let last = end.as_usize() >> PAGE_SHIFT;
        let doomed: Vec<usize> = ptes.range(first..last).map(|(&vpn, _)| vpn).collect();
        for vpn in doomed {
            ptes.remove(&vpn);
        }
    }

    fn flush_cache_range(&self, _start: VirtualAddress, _end: VirtualAddress) {
        self.inner.cache_flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn flush_tlb_range(&self, start: VirtualAddress, end: VirtualAddress) {
        self.inner.tlb_flushes.lock().push((start, end));
    }

    fn translate(&self, va: VirtualAddress) -> Option<PageFrame> {
        self.inner
            .ptes
            .lock()
            .get(&(va.as_usize() >> PAGE_SHIFT))
            .map(|pte| pte.frame)
    }

    unsafe fn zero_range(&self, start: VirtualAddress, len: usize) {
        let zeroes = vec![0u8; len];
        let written = self.write_bytes(start, &zeroes);
        assert!(written, "zeroing unmapped range {start}+{len:#x}");
    }

    unsafe fn write_range(&self, start: VirtualAddress, src: &[u8]) {
        let written = self.write_bytes(start, src);
        assert!(written, "writing unmapped range {start}+{:#x}", src.len());
    }

    unsafe fn read_range(&self, start: VirtualAddress, dst: &mut [u8]) {
        let Some(bytes) = self.read_bytes(start, dst.len()) else {
            panic!("reading unmapped range {start}+{:#x}", dst.len());
        };
        dst.copy_from_slice(&bytes);
    }
}

impl CpuTopology for SimMachine {
    fn possible_cpus(&self) -> usize {
        self.inner.possible_cpus
    }

    fn online_cpus(&self) -> usize {
        self.inner.online_cpus.load(Ordering::Relaxed)
    }

    fn current_cpu(&self) -> usize {
        self.inner.current_cpu.load(Ordering::Relaxed)
    }

    fn cpu_to_node(&self, cpu: usize) -> NodeId {
        cpu % self.inner.nodes
    }
}
