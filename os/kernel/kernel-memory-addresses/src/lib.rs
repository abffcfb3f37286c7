//! # Virtual Addresses and Page Frames
//!
//! Strongly typed wrappers for the two kinds of values the kernel allocators
//! pass around all day: **virtual addresses** handed out to callers, and
//! opaque **page frame** handles obtained from the physical page allocator.
//!
//! ## Overview
//!
//! | Type | Description |
//! |------|-------------|
//! | [`VirtualAddress`] | A byte address inside the kernel's virtual address space. |
//! | [`PageFrame`] | A handle to one 4 KiB physical frame, identified by its frame number. |
//!
//! Both are `#[repr(transparent)]` and zero-cost. Keeping them apart at the
//! type level prevents the classic bug of mapping a virtual address as if it
//! were a frame number (or vice versa).
//!
//! ## Page Geometry
//!
//! The allocators work in units of [`PAGE_SIZE`] bytes. The helpers in this
//! crate ([`align_up`], [`page_align`], [`pfn_up`], [`get_order`], ...) are
//! `const fn` and perform checked arithmetic where overflow is possible, so
//! that the callers can surface a clean "out of virtual space" instead of
//! wrapping around the top of the address space.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xFFFF_C900_0000_1234);
//! assert_eq!(va.page_base().as_usize(), 0xFFFF_C900_0000_1000);
//! assert_eq!(va.page_offset(), 0x234);
//!
//! assert_eq!(page_align(1), Some(PAGE_SIZE));
//! assert_eq!(get_order(3 * PAGE_SIZE), 2);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod align;
mod page_frame;
mod virtual_address;

pub use align::{align_down, align_up, fls, get_order, ilog2, page_align, pfn_down, pfn_up};
pub use page_frame::PageFrame;
pub use virtual_address::VirtualAddress;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Size of a base page in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Mask selecting the in-page offset bits of an address.
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Number of bits in a machine word.
pub const BITS_PER_LONG: usize = usize::BITS as usize;

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(BITS_PER_LONG == 64, "the allocators assume a 64-bit address space");
};
