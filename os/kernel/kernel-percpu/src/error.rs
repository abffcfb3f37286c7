use kernel_vmalloc::VmallocError;

/// Errors returned by the percpu allocator.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PercpuError {
    #[error("illegal percpu request: size {size:#x}, align {align:#x}")]
    InvalidRequest { size: usize, align: usize },
    #[error("reserved chunk has no room for {size:#x} bytes")]
    ReservedExhausted { size: usize },
    #[error("failed to extend an area map")]
    MapExtension,
    #[error("failed to create a new chunk: {0}")]
    ChunkCreation(#[source] VmallocError),
    #[error("failed to populate: {0}")]
    Populate(#[source] VmallocError),
}
