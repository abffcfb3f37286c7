//! # Kernel Memory Layout Information
//!
//! Compile-time constants that describe where the kernel's dynamically mapped
//! virtual memory lives and how the allocators managing it are tuned. This is
//! the single authoritative source shared by the vmalloc and percpu crates so
//! that both agree on the window they carve up.
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Mapping    │
//! VMALLOC_START         ├─────────────────────────────────┤ 0xffff_c900_0000_0000
//!                       │   vmalloc / vmap / percpu       │
//!                       │   (dynamically mapped, 32 TiB)  │
//! VMALLOC_END           ├─────────────────────────────────┤ 0xffff_e900_0000_0000
//!                       │        Guard Region             │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │       Kernel Text & Data        │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ## Tunables
//!
//! See [`memory`] for the individual constants. None of them are correctness
//! critical beyond the compile-time assertions at the bottom of that module;
//! they trade memory slack against flush and scan frequency.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod memory;
