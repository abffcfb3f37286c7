use crate::backend::MapError;

/// Errors returned by the vmalloc family.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmallocError {
    #[error("no free virtual range of {size:#x} bytes with alignment {align:#x}")]
    OutOfVirtualSpace { size: usize, align: usize },
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("page table mapping failed: {0}")]
    MapFailed(#[from] MapError),
    #[error("invalid allocation size {0:#x}")]
    InvalidSize(usize),
}
