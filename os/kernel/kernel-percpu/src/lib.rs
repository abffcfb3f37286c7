//! # Percpu Memory Allocator
//!
//! Dynamic percpu memory: every allocation exists once per possible CPU,
//! and each CPU finds its own instance at a fixed offset from one shared
//! pointer.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │               Percpu Allocator                      │
//! │    • alloc / alloc_reserved / free                  │
//! │    • chunks bucketed into slots by free size        │
//! │    • run-length allocation map per chunk            │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │               VM Backend                            │
//! │    • chunk = one VM area covering all units         │
//! │    • pages populated on first use, for every CPU    │
//! │    • entirely free chunks reclaimed in batches      │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │               kernel-vmalloc                        │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Chunks and Units
//!
//! A chunk holds one *unit* per CPU; all units have the same layout. The
//! first chunk is handed over by early boot code and also contains the
//! kernel's static percpu variables; it is described by a
//! [`PcpuAllocInfo`]. Further chunks come from vmalloc space.
//!
//! ## Locking
//!
//! Two `spin` locks: an outer one serializing allocation and reclaim,
//! held while pages are obtained and mapped, and an inner one for the
//! chunk maps and slot lists. [`PercpuAllocator::free`] only takes the
//! inner one and never blocks on page-table work; releasing the pages of
//! an entirely free chunk is left to [`PercpuAllocator::reclaim`].
//!
//! ## Usage
//!
//! ```rust
//! use kernel_memory_addresses::VirtualAddress;
//! use kernel_percpu::{PcpuAllocInfo, PercpuAllocator};
//! use kernel_vmalloc::testing::SimMachine;
//! use kernel_vmalloc::{Vmalloc, VmallocConfig};
//!
//! let sim = SimMachine::new(2);
//! let vm = Vmalloc::new(VmallocConfig::default(), sim.clone(), sim.clone(), sim.clone());
//!
//! let ai = PcpuAllocInfo::build(8 << 10, 0, 20 << 10, 4096, 2, |_| 0).unwrap();
//! let base = VirtualAddress::new(0xffff_8880_0100_0000);
//! let _frames = sim.map_static(base, ai.span() / 4096);
//! let pcpu = PercpuAllocator::setup_first_chunk(&vm, &ai, base);
//!
//! let counter = pcpu.alloc(8, 8).unwrap();
//! let mine = pcpu.per_cpu_ptr(counter, 0);
//! let theirs = pcpu.per_cpu_ptr(counter, 1);
//! assert_eq!(theirs - mine, ai.unit_size);
//! assert_eq!(sim.read_bytes(theirs, 8), Some(vec![0; 8]));
//!
//! pcpu.free(counter);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod alloc_info;
mod chunk;
mod error;
mod percpu;
mod slots;
mod vm;

pub use alloc_info::{LayoutError, PcpuAllocInfo, PcpuGroupInfo};
pub use chunk::{PcpuChunkInfo, Run};
pub use error::PercpuError;
pub use percpu::{PercpuAllocator, PercpuPtr};
