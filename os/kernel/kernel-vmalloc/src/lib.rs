//! # Kernel Virtual Memory Allocator
//!
//! This crate manages the kernel's *vmalloc window*: the range of kernel
//! virtual addresses that is not permanently mapped and is instead handed out
//! on demand. Memory obtained here is virtually contiguous but may be backed
//! by physically scattered pages.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │               VM Area Facility                      │
//! │    • vmalloc / vzalloc / vmalloc_exec / vfree       │
//! │    • vmap / vunmap of caller-supplied pages         │
//! │    • get_vm_area reservations, guard pages          │
//! └───────────┬─────────────────────────┬───────────────┘
//!             │                         │
//!             │          ┌──────────────▼───────────────┐
//!             │          │     Per-CPU vmap blocks      │
//!             │          │  • vm_map_ram for ≤ 64 pages │
//!             │          │  • slot bitmaps, no reuse    │
//!             │          └──────────────┬───────────────┘
//! ┌───────────▼─────────────────────────▼───────────────┐
//! │               Vmap Area Registry                    │
//! │    • ordered, non-overlapping reservations          │
//! │    • lowest-fit search with a resume cache          │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │               Lazy Purge Engine                     │
//! │    • released ranges wait for one batched TLB flush │
//! │    • threshold scales with the online CPU count     │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Collaborators
//!
//! The allocator is generic over three traits from [`backend`]:
//!
//! | Trait | Provides |
//! |-------|----------|
//! | [`PageAlloc`] | Physical 4 KiB pages, optionally per NUMA node. |
//! | [`KernelMapper`] | Page-table edits, cache and TLB maintenance. |
//! | [`CpuTopology`] | Possible/online CPUs and the current CPU. |
//!
//! With the `testing` feature, `testing::SimMachine` implements all three in
//! plain memory.
//!
//! ## Locking
//!
//! Everything is behind `spin` locks and atomics; all public methods take
//! `&self`. Lock order, outermost first:
//!
//! 1. the purge lock (held across a whole purge),
//! 2. a vmap block's state lock, then its CPU's queue lock,
//! 3. the VM-area list, then the area registry.
//!
//! ## Failure Model
//!
//! Resource exhaustion is reported through [`VmallocError`]. Releasing
//! something that was never handed out, or releasing it twice, is a kernel
//! bug and panics after logging the offending address.
//!
//! ## Usage
//!
//! ```rust
//! use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
//! use kernel_vmalloc::testing::SimMachine;
//! use kernel_vmalloc::{Vmalloc, VmallocConfig};
//!
//! let sim = SimMachine::new(4);
//! let vm = Vmalloc::new(VmallocConfig::default(), sim.clone(), sim.clone(), sim.clone());
//!
//! let buf = vm.vzalloc(3 * PAGE_SIZE).unwrap();
//! assert_eq!(sim.read_bytes(buf, 8), Some(vec![0; 8]));
//!
//! // The page after the allocation is a guard page.
//! assert!(!sim.is_mapped(buf + 3 * PAGE_SIZE));
//!
//! vm.vfree(buf);
//! assert_eq!(sim.outstanding_pages(), 0);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod area;
pub mod backend;
mod bitmap;
mod block;
mod config;
mod error;
mod map_ram;
mod purge;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
mod vm_area;
mod vm_struct;
mod vmalloc;

pub use area::{AreaKind, VmapAreaFlags, VmapAreaInfo};
pub use backend::{CpuTopology, KernelMapper, MapError, NodeId, PageAlloc, Protection};
pub use block::VmapBlockInfo;
pub use config::VmallocConfig;
pub use error::VmallocError;
pub use vm_struct::{VmAreaInfo, VmFlags};
pub use vmalloc::Vmalloc;
