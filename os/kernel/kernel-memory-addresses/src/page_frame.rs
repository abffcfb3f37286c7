use crate::PAGE_SHIFT;
use core::fmt;

/// Handle to one physical 4 KiB frame.
///
/// The allocators never dereference a frame; they only hand the handle
/// between the physical page allocator and the page-table code. The frame
/// number is what identifies it.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageFrame(u64);

impl PageFrame {
    #[inline]
    #[must_use]
    pub const fn from_pfn(pfn: u64) -> Self {
        Self(pfn)
    }

    /// Frame containing the physical address `pa`.
    #[inline]
    #[must_use]
    pub const fn containing(pa: u64) -> Self {
        Self(pa >> PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn pfn(self) -> u64 {
        self.0
    }

    /// Physical base address of the frame.
    #[inline]
    #[must_use]
    pub const fn base(self) -> u64 {
        self.0 << PAGE_SHIFT
    }
}

impl fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageFrame(pfn=0x{:X})", self.0)
    }
}

impl fmt::Display for PageFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pfn:0x{:X}", self.0)
    }
}
