//! # Memory Layout

use kernel_memory_addresses::{BITS_PER_LONG, PAGE_SHIFT, PAGE_SIZE};

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: usize = 0xffff_8880_0000_0000;

/// First address of the dynamically mapped kernel window.
pub const VMALLOC_START: usize = 0xffff_c900_0000_0000;

/// One past the last address of the dynamically mapped kernel window.
pub const VMALLOC_END: usize = 0xffff_e900_0000_0000;

/// Where the kernel executes (VMA), matches the linker script.
pub const KERNEL_BASE: usize = 0xffff_ffff_8000_0000;

/// Upper bound (as a page order plus [`PAGE_SHIFT`]) for the alignment given
/// to I/O remappings: at most 128 pages.
pub const IOREMAP_MAX_ORDER: u32 = 7 + PAGE_SHIFT;

/// Pages of lazily freed address space tolerated per "CPU order" before a
/// purge is attempted (32 MiB worth of 4 KiB pages).
pub const LAZY_PURGE_UNIT_PAGES: usize = (32 * 1024 * 1024) >> PAGE_SHIFT;

/// Largest request, in pages, served by the per-CPU block sub-allocator.
pub const VMAP_MAX_ALLOC: usize = BITS_PER_LONG;

/// Upper bound on the number of page slots per vmap block.
pub const VMAP_BBMAP_BITS_MAX: usize = 1024;

/// Lower bound on the number of page slots per vmap block.
pub const VMAP_BBMAP_BITS_MIN: usize = VMAP_MAX_ALLOC * 2;

/// Minimum size of one percpu unit.
pub const PCPU_MIN_UNIT_SIZE: usize = 32 << 10;

/// Initial capacity (entries) of a chunk's allocation map.
pub const PCPU_DFL_MAP_ALLOC: usize = 16;

/// Free sizes below `1 << PCPU_SLOT_BASE_SHIFT` share the lowest real slot.
pub const PCPU_SLOT_BASE_SHIFT: u32 = 5;

/// Default size of the dynamic area of the first percpu chunk.
pub const PERCPU_DYNAMIC_RESERVE: usize = 20 << 10;

/// Default size of the reserved area of the first percpu chunk.
pub const PERCPU_MODULE_RESERVE: usize = 8 << 10;

const _: () = {
    assert!(VMALLOC_START > HHDM_BASE);
    assert!(VMALLOC_END > VMALLOC_START);
    assert!(KERNEL_BASE > VMALLOC_END);
    assert!(VMALLOC_START % PAGE_SIZE == 0 && VMALLOC_END % PAGE_SIZE == 0);
    assert!(VMAP_BBMAP_BITS_MIN <= VMAP_BBMAP_BITS_MAX);
    assert!(VMAP_BBMAP_BITS_MAX.is_power_of_two());
    assert!(PCPU_MIN_UNIT_SIZE % PAGE_SIZE == 0);
};
