mod common;

use common::{FIRST_CHUNK_BASE, STATIC_SIZE, fill_first_chunk, layout, machine, setup};
use kernel_info::memory::{PCPU_DFL_MAP_ALLOC, PCPU_MIN_UNIT_SIZE};
use kernel_memory_addresses::PAGE_SIZE;
use kernel_percpu::{PercpuAllocator, PercpuError, PercpuPtr, Run};
use kernel_vmalloc::VmallocError;

#[test]
fn every_cpu_gets_its_own_zeroed_instance() {
    let (sim, vm) = machine(4);
    let pcpu = setup(&sim, &vm, &layout(4, 0));
    assert_eq!(pcpu.unit_size(), 32 << 10);

    let ptr = pcpu.alloc(64, 8).unwrap();
    // The dynamic area starts right after the static one.
    assert_eq!(ptr.addr(), FIRST_CHUNK_BASE + STATIC_SIZE);

    let instances: Vec<_> = (0..4).map(|cpu| pcpu.per_cpu_ptr(ptr, cpu)).collect();
    for (cpu, &addr) in instances.iter().enumerate() {
        assert_eq!(addr, ptr.addr() + cpu * pcpu.unit_size());
        assert_eq!(sim.read_bytes(addr, 64), Some(vec![0; 64]));
    }

    assert!(sim.write_bytes(instances[1], &[0xaa; 64]));
    assert_eq!(sim.read_bytes(instances[0], 64), Some(vec![0; 64]));
    assert_eq!(sim.read_bytes(instances[2], 64), Some(vec![0; 64]));

    pcpu.free(ptr);
    let first = &pcpu.chunks()[0];
    assert_eq!(first.free_size, 20 << 10);
}

#[test]
fn reused_memory_is_zeroed_again() {
    let (sim, vm) = machine(2);
    let pcpu = setup(&sim, &vm, &layout(2, 0));

    let ptr = pcpu.alloc(128, 16).unwrap();
    assert!(sim.write_bytes(pcpu.per_cpu_ptr(ptr, 0), &[0xff; 128]));
    pcpu.free(ptr);

    let again = pcpu.alloc(128, 16).unwrap();
    assert_eq!(again, ptr);
    assert_eq!(sim.read_bytes(pcpu.per_cpu_ptr(again, 0), 128), Some(vec![0; 128]));
}

#[test]
fn alignment_is_honored() {
    let (sim, vm) = machine(2);
    let pcpu = setup(&sim, &vm, &layout(2, 0));

    let _odd = pcpu.alloc(3, 1).unwrap();
    for align in [2, 8, 64, 256, PAGE_SIZE] {
        let ptr = pcpu.alloc(24, align).unwrap();
        assert!(ptr.addr().is_aligned(align), "{ptr:?} not aligned to {align}");
    }
    common::assert_maps_consistent(&pcpu);
}

#[test]
fn null_free_is_ignored() {
    let (sim, vm) = machine(2);
    let pcpu = setup(&sim, &vm, &layout(2, 0));
    let before = pcpu.chunks();
    pcpu.free(PercpuPtr::NULL);
    assert_eq!(pcpu.chunks(), before);
}

#[test]
fn invalid_requests_are_rejected() {
    let (sim, vm) = machine(2);
    let pcpu = setup(&sim, &vm, &layout(2, 0));

    for (size, align) in [
        (0, 8),
        (PCPU_MIN_UNIT_SIZE + 1, 8),
        (8, 0),
        (8, 3),
        (8, 2 * PAGE_SIZE),
    ] {
        assert_eq!(
            pcpu.alloc(size, align),
            Err(PercpuError::InvalidRequest { size, align })
        );
    }
    // Nothing was created for them.
    assert_eq!(pcpu.chunks().len(), 1);
    assert!(vm.vmalloc_areas().is_empty());
}

#[test]
fn full_first_chunk_spills_into_a_vmalloc_chunk() {
    let (sim, vm) = machine(4);
    let pcpu = setup(&sim, &vm, &layout(4, 0));
    let filler = fill_first_chunk(&pcpu);
    assert_eq!(filler.addr(), FIRST_CHUNK_BASE + STATIC_SIZE);

    let pages_before = sim.outstanding_pages();
    let ptr = pcpu.alloc(64, 8).unwrap();
    assert!(vm.is_vmalloc_addr(ptr.addr()));

    let area = vm.find_vm_area(ptr.addr()).unwrap();
    assert_eq!(area.addr, ptr.addr());
    assert!(area.size >= 4 * pcpu.unit_size());
    assert!(vm.vmalloc_areas().iter().any(|a| a.addr == area.addr));

    // One page per CPU was populated.
    assert_eq!(sim.outstanding_pages(), pages_before + 4);
    for cpu in 0..4 {
        let addr = pcpu.per_cpu_ptr(ptr, cpu);
        assert!(sim.is_mapped(addr));
        assert_eq!(sim.read_bytes(addr, 64), Some(vec![0; 64]));
    }

    let chunks = pcpu.chunks();
    assert_eq!(chunks.len(), 2);
    let dynamic = chunks.iter().find(|c| c.base == ptr.addr()).unwrap();
    assert!(!dynamic.immutable);
    assert_eq!(dynamic.populated_pages, 1);
    assert_eq!(dynamic.free_size, pcpu.unit_size() - 64);

    // Freeing resolves the chunk through the page of the freeing CPU.
    sim.set_current_cpu(3);
    pcpu.free(ptr);
    let dynamic = pcpu.chunks().into_iter().find(|c| c.base == ptr.addr()).unwrap();
    assert_eq!(dynamic.free_size, pcpu.unit_size());
    // Pages stay until reclaim.
    assert_eq!(sim.outstanding_pages(), pages_before + 4);
    assert!(!pcpu.needs_reclaim());

    pcpu.free(filler);
    common::assert_maps_consistent(&pcpu);
}

#[test]
fn population_only_touches_missing_pages() {
    let (sim, vm) = machine(2);
    let pcpu = setup(&sim, &vm, &layout(2, 0));
    let _filler = fill_first_chunk(&pcpu);

    let pages = sim.outstanding_pages();
    let a = pcpu.alloc(100, 8).unwrap();
    let b = pcpu.alloc(100, 8).unwrap();
    assert_eq!(sim.outstanding_pages(), pages + 2);

    // Spans pages 0..=2 of every unit, page 0 is already there.
    let c = pcpu.alloc(2 * PAGE_SIZE, 8).unwrap();
    assert_eq!(sim.outstanding_pages(), pages + 6);
    for ptr in [a, b, c] {
        assert!(vm.is_vmalloc_addr(ptr.addr()));
    }
    assert_eq!(
        pcpu.per_cpu_ptr_to_page(pcpu.per_cpu_ptr(c, 1)),
        vm.vmalloc_to_page(pcpu.per_cpu_ptr(c, 1))
    );
}

#[test]
fn page_allocation_failure_rolls_back() {
    let (sim, vm) = machine(4);
    let pcpu = setup(&sim, &vm, &layout(4, 0));
    let _filler = fill_first_chunk(&pcpu);

    let pages = sim.outstanding_pages();
    let mapped = sim.mapped_pages();
    sim.fail_nth_page_alloc(3);
    assert_eq!(
        pcpu.alloc(3 * PAGE_SIZE, 8),
        Err(PercpuError::Populate(VmallocError::OutOfMemory))
    );
    assert_eq!(sim.outstanding_pages(), pages);
    assert_eq!(sim.mapped_pages(), mapped);

    // The chunk survives, empty and unpopulated.
    let dynamic = pcpu.chunks().into_iter().find(|c| !c.immutable).unwrap();
    assert_eq!(dynamic.free_size, pcpu.unit_size());
    assert_eq!(dynamic.populated_pages, 0);

    let ptr = pcpu.alloc(3 * PAGE_SIZE, 8).unwrap();
    assert_eq!(ptr.addr(), dynamic.base);
    assert_eq!(sim.outstanding_pages(), pages + 12);
}

#[test]
fn mapping_failure_rolls_back() {
    let (sim, vm) = machine(4);
    let pcpu = setup(&sim, &vm, &layout(4, 0));
    let _filler = fill_first_chunk(&pcpu);

    let pages = sim.outstanding_pages();
    let mapped = sim.mapped_pages();
    sim.fail_next_maps(1);
    let err = pcpu.alloc(64, 8).unwrap_err();
    assert!(
        matches!(err, PercpuError::Populate(VmallocError::MapFailed(_))),
        "{err:?}"
    );
    assert_eq!(sim.outstanding_pages(), pages);
    assert_eq!(sim.mapped_pages(), mapped);

    let ptr = pcpu.alloc(64, 8).unwrap();
    assert!(sim.is_mapped(pcpu.per_cpu_ptr(ptr, 3)));
}

#[test]
fn reserved_chunk_serves_reserved_requests_only() {
    let (sim, vm) = machine(4);
    let ai = layout(4, 8 << 10);
    let pcpu = setup(&sim, &vm, &ai);
    assert_eq!(pcpu.unit_size(), 36 << 10);

    let reserved = pcpu.alloc_reserved(64, 8).unwrap();
    assert_eq!(reserved.addr(), FIRST_CHUNK_BASE + STATIC_SIZE);
    let normal = pcpu.alloc(64, 8).unwrap();
    assert_eq!(normal.addr(), FIRST_CHUNK_BASE + STATIC_SIZE + (8 << 10));

    let chunks = pcpu.chunks();
    let rchunk = chunks.iter().find(|c| c.reserved).unwrap();
    assert_eq!(rchunk.slot, None);
    assert_eq!(rchunk.free_size, (8 << 10) - 64);

    assert_eq!(
        pcpu.alloc_reserved(8 << 10, 8),
        Err(PercpuError::ReservedExhausted { size: 8 << 10 })
    );
    assert_eq!(
        pcpu.alloc_reserved(PCPU_MIN_UNIT_SIZE, 8),
        Err(PercpuError::ReservedExhausted {
            size: PCPU_MIN_UNIT_SIZE
        })
    );

    pcpu.free(reserved);
    let rchunk = pcpu.chunks().into_iter().find(|c| c.reserved).unwrap();
    assert_eq!(rchunk.free_size, 8 << 10);
    assert_eq!(
        rchunk.map,
        vec![Run::Used(STATIC_SIZE), Run::Free(8 << 10), Run::Used(20 << 10)]
    );
    pcpu.free(normal);
}

#[test]
fn reserved_requests_without_reserved_chunk_are_ordinary() {
    let (sim, vm) = machine(2);
    let pcpu = setup(&sim, &vm, &layout(2, 0));
    let ptr = pcpu.alloc_reserved(64, 8).unwrap();
    assert_eq!(ptr.addr(), FIRST_CHUNK_BASE + STATIC_SIZE);
    assert!(pcpu.chunks().iter().all(|c| !c.reserved));
}

#[test]
fn allocation_map_grows_on_demand() {
    let (sim, vm) = machine(2);
    let pcpu = setup(&sim, &vm, &layout(2, 0));

    let ptrs: Vec<_> = (0..40).map(|_| pcpu.alloc(4, 4).unwrap()).collect();
    let first = &pcpu.chunks()[0];
    assert_eq!(first.map.len(), 43);
    assert_eq!(first.map_alloc, 4 * PCPU_DFL_MAP_ALLOC);
    for pair in ptrs.windows(2) {
        assert_eq!(pair[1].addr() - pair[0].addr(), 4);
    }

    for ptr in ptrs {
        pcpu.free(ptr);
    }
    let first = &pcpu.chunks()[0];
    assert_eq!(
        first.map,
        vec![Run::Used(STATIC_SIZE), Run::Free(20 << 10), Run::Used(4 << 10)]
    );
    common::assert_maps_consistent(&pcpu);
}

#[test]
fn static_area_is_recognized() {
    let (sim, vm) = machine(4);
    let ai = layout(4, 0);
    let frames = sim.map_static(FIRST_CHUNK_BASE, ai.span() / PAGE_SIZE);
    let pcpu = PercpuAllocator::setup_first_chunk(&vm, &ai, FIRST_CHUNK_BASE);

    for cpu in 0..4 {
        let unit = FIRST_CHUNK_BASE + pcpu.unit_offset(cpu);
        assert!(pcpu.is_kernel_percpu_address(unit));
        assert!(pcpu.is_kernel_percpu_address(unit + (STATIC_SIZE - 1)));
        assert!(!pcpu.is_kernel_percpu_address(unit + STATIC_SIZE));
        assert_eq!(
            pcpu.per_cpu_ptr_to_page(unit),
            Some(frames[pcpu.unit_offset(cpu) / PAGE_SIZE])
        );
    }

    let addr = FIRST_CHUNK_BASE + pcpu.unit_offset(1) + 100;
    assert_eq!(pcpu.per_cpu_ptr_to_page(addr), Some(frames[8]));

    let _filler = fill_first_chunk(&pcpu);
    let ptr = pcpu.alloc(64, 8).unwrap();
    assert!(!pcpu.is_kernel_percpu_address(ptr.addr()));
    let mine = pcpu.per_cpu_ptr(ptr, 2);
    assert!(pcpu.per_cpu_ptr_to_page(mine).is_some());
    assert_eq!(pcpu.per_cpu_ptr_to_page(mine), vm.vmalloc_to_page(mine));
}

#[test]
#[should_panic(expected = "double free")]
fn double_free_is_fatal() {
    let (sim, vm) = machine(2);
    let pcpu = setup(&sim, &vm, &layout(2, 0));
    let ptr = pcpu.alloc(64, 8).unwrap();
    pcpu.free(ptr);
    pcpu.free(ptr);
}

#[test]
#[should_panic(expected = "not a possible cpu")]
fn impossible_cpu_is_fatal() {
    let (sim, vm) = machine(2);
    let pcpu = setup(&sim, &vm, &layout(2, 0));
    let ptr = pcpu.alloc(64, 8).unwrap();
    let _ = pcpu.per_cpu_ptr(ptr, 2);
}
