#![allow(dead_code)]

use kernel_info::memory::PERCPU_DYNAMIC_RESERVE;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_percpu::{PcpuAllocInfo, PercpuAllocator, PercpuPtr};
use kernel_vmalloc::testing::SimMachine;
use kernel_vmalloc::{Vmalloc, VmallocConfig};

pub type SimVmalloc = Vmalloc<SimMachine, SimMachine, SimMachine>;
pub type SimPercpu<'v> = PercpuAllocator<'v, SimMachine, SimMachine, SimMachine>;

/// Where the tests place the first chunk: in the direct map, below vmalloc.
pub const FIRST_CHUNK_BASE: VirtualAddress = VirtualAddress::new(0xffff_8880_0100_0000);

/// Static area of the first chunk used by the tests.
pub const STATIC_SIZE: usize = 8 << 10;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn machine(cpus: usize) -> (SimMachine, SimVmalloc) {
    init_logging();
    let sim = SimMachine::new(cpus);
    let vm = Vmalloc::new(
        VmallocConfig::default(),
        sim.clone(),
        sim.clone(),
        sim.clone(),
    );
    (sim, vm)
}

/// 8 KiB static, `reserved` bytes reserved and the default dynamic area,
/// which adds up to 32 KiB units without a reserved area.
pub fn layout(cpus: usize, reserved: usize) -> PcpuAllocInfo {
    PcpuAllocInfo::build(
        STATIC_SIZE,
        reserved,
        PERCPU_DYNAMIC_RESERVE,
        PAGE_SIZE,
        cpus,
        |_| 0,
    )
    .unwrap()
}

/// Map the first chunk the way early boot code would and hand it over.
pub fn setup<'v>(sim: &SimMachine, vm: &'v SimVmalloc, ai: &PcpuAllocInfo) -> SimPercpu<'v> {
    let _frames = sim.map_static(FIRST_CHUNK_BASE, ai.span() / PAGE_SIZE);
    PercpuAllocator::setup_first_chunk(vm, ai, FIRST_CHUNK_BASE)
}

/// Sum of all run lengths of every chunk must be one unit.
pub fn assert_maps_consistent(pcpu: &SimPercpu<'_>) {
    for chunk in pcpu.chunks() {
        let total: usize = chunk.map.iter().map(|run| run.len()).sum();
        assert_eq!(total, pcpu.unit_size(), "{chunk:?}");
        let free: usize = chunk
            .map
            .iter()
            .filter(|run| run.is_free())
            .map(|run| run.len())
            .sum();
        assert_eq!(free, chunk.free_size, "{chunk:?}");
        assert!(chunk.contig_hint >= chunk.largest_free_run(), "{chunk:?}");
        assert!(chunk.map.len() <= chunk.map_alloc, "{chunk:?}");
    }
}

/// Fill the dynamic area of the first chunk so that the next allocation
/// needs a new chunk.
pub fn fill_first_chunk(pcpu: &SimPercpu<'_>) -> PercpuPtr {
    pcpu.alloc(PERCPU_DYNAMIC_RESERVE, 8).unwrap()
}
