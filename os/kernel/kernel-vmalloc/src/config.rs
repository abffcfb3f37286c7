use kernel_info::memory::{VMALLOC_END, VMALLOC_START};
use kernel_memory_addresses::VirtualAddress;

/// Boot-time parameters of the vmalloc window.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct VmallocConfig {
    /// First address handed out.
    pub start: VirtualAddress,
    /// One past the last address handed out.
    pub end: VirtualAddress,
}

impl VmallocConfig {
    #[must_use]
    pub const fn new(start: VirtualAddress, end: VirtualAddress) -> Self {
        Self { start, end }
    }

    /// Size of the window in pages.
    #[must_use]
    pub const fn pages(&self) -> usize {
        (self.end.as_usize() - self.start.as_usize()) >> kernel_memory_addresses::PAGE_SHIFT
    }

    pub(crate) fn validate(&self) {
        assert!(
            self.start.is_page_aligned() && self.end.is_page_aligned(),
            "vmalloc window {}..{} is not page aligned",
            self.start,
            self.end
        );
        assert!(
            self.start < self.end,
            "empty vmalloc window {}..{}",
            self.start,
            self.end
        );
    }
}

impl Default for VmallocConfig {
    fn default() -> Self {
        Self::new(
            VirtualAddress::new(VMALLOC_START),
            VirtualAddress::new(VMALLOC_END),
        )
    }
}
