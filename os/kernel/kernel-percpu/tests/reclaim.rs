mod common;

use common::{assert_maps_consistent, fill_first_chunk, layout, machine, setup};
use kernel_info::memory::PCPU_MIN_UNIT_SIZE;
use kernel_percpu::PercpuPtr;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::thread;

#[test]
fn entirely_free_chunks_are_reclaimed_but_one() {
    let (sim, vm) = machine(4);
    let pcpu = setup(&sim, &vm, &layout(4, 0));
    let _filler = fill_first_chunk(&pcpu);
    let pages = sim.outstanding_pages();

    let a = pcpu.alloc(PCPU_MIN_UNIT_SIZE, 8).unwrap();
    let b = pcpu.alloc(PCPU_MIN_UNIT_SIZE, 8).unwrap();
    assert_ne!(a.addr(), b.addr());
    assert_eq!(pcpu.chunks().len(), 3);
    assert_eq!(sim.outstanding_pages(), pages + 64);

    pcpu.free(a);
    assert!(!pcpu.needs_reclaim(), "a single free chunk is kept");
    pcpu.free(b);
    assert!(pcpu.needs_reclaim());

    // The chunk freed last is tried first and survives.
    assert_eq!(pcpu.reclaim(), 1);
    assert!(!pcpu.needs_reclaim());
    assert_eq!(sim.outstanding_pages(), pages + 32);
    for cpu in 0..4 {
        assert!(!sim.is_mapped(pcpu.per_cpu_ptr(a, cpu)));
        assert!(sim.is_mapped(pcpu.per_cpu_ptr(b, cpu)));
    }

    assert!(vm.find_vm_area(a.addr()).is_none());
    assert!(vm.find_area(a.addr()).is_none_or(|area| area.is_lazy()));
    vm.purge_vmap_area_lazy();
    assert!(vm.find_area(a.addr()).is_none());

    let chunks = pcpu.chunks();
    assert_eq!(chunks.len(), 2);
    assert!(chunks.iter().any(|c| c.base == b.addr()));
    assert_eq!(pcpu.reclaim(), 0);

    // The survivor is still populated.
    let again = pcpu.alloc(64, 8).unwrap();
    assert_eq!(again, b);
    assert_eq!(sim.outstanding_pages(), pages + 32);
}

#[test]
fn random_workload_keeps_maps_consistent() {
    let (sim, vm) = machine(2);
    let pcpu = setup(&sim, &vm, &layout(2, 0));
    let pages = sim.outstanding_pages();
    let mut rng = StdRng::seed_from_u64(7);
    let mut live: Vec<(PercpuPtr, usize)> = Vec::new();

    for step in 0..2_000 {
        if live.is_empty() || (live.len() < 200 && rng.gen_bool(0.6)) {
            let size = if rng.gen_bool(0.05) {
                rng.gen_range(4096..=PCPU_MIN_UNIT_SIZE)
            } else {
                rng.gen_range(1..=2048)
            };
            let align = 1 << rng.gen_range(0..=6);
            let ptr = pcpu.alloc(size, align).unwrap();
            assert!(ptr.addr().is_aligned(align));
            live.push((ptr, size));
        } else {
            let (ptr, _) = live.swap_remove(rng.gen_range(0..live.len()));
            pcpu.free(ptr);
        }
        assert_maps_consistent(&pcpu);

        if step % 250 == 0 && pcpu.needs_reclaim() {
            pcpu.reclaim();
        }
    }

    live.sort_by_key(|(ptr, _)| *ptr);
    for pair in live.windows(2) {
        let ((a, size), (b, _)) = (pair[0], pair[1]);
        assert!(a.addr() + size <= b.addr(), "{a:?}+{size} overlaps {b:?}");
    }

    for (ptr, _) in live {
        pcpu.free(ptr);
    }
    pcpu.reclaim();
    assert_maps_consistent(&pcpu);

    let dynamic: Vec<_> = pcpu.chunks().into_iter().filter(|c| !c.immutable).collect();
    assert!(dynamic.len() <= 1, "{dynamic:?}");
    let populated: usize = dynamic.iter().map(|c| c.populated_pages).sum();
    for chunk in &dynamic {
        assert_eq!(chunk.free_size, pcpu.unit_size());
    }
    assert_eq!(sim.outstanding_pages(), pages + 2 * populated);
}

#[test]
fn concurrent_users_never_share_memory() {
    const THREADS: usize = 4;

    let (sim, vm) = machine(THREADS);
    let pcpu = setup(&sim, &vm, &layout(THREADS, 0));

    thread::scope(|s| {
        for t in 0..THREADS {
            let (sim, pcpu) = (&sim, &pcpu);
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(t as u64);
                let pattern = u8::try_from(t + 1).unwrap();
                let mut live: Vec<(PercpuPtr, usize)> = Vec::new();

                for _ in 0..300 {
                    if live.is_empty() || (live.len() < 32 && rng.gen_bool(0.6)) {
                        let size = rng.gen_range(8..=512);
                        let ptr = pcpu.alloc(size, 8).unwrap();
                        let mine = pcpu.per_cpu_ptr(ptr, t);
                        assert_eq!(sim.read_bytes(mine, size), Some(vec![0; size]));
                        assert!(sim.write_bytes(mine, &vec![pattern; size]));
                        live.push((ptr, size));
                    } else {
                        let (ptr, size) = live.swap_remove(rng.gen_range(0..live.len()));
                        let mine = pcpu.per_cpu_ptr(ptr, t);
                        assert_eq!(sim.read_bytes(mine, size), Some(vec![pattern; size]));
                        pcpu.free(ptr);
                    }
                    if t == 0 && pcpu.needs_reclaim() {
                        pcpu.reclaim();
                    }
                }

                for (ptr, size) in live {
                    let mine = pcpu.per_cpu_ptr(ptr, t);
                    assert_eq!(sim.read_bytes(mine, size), Some(vec![pattern; size]));
                    pcpu.free(ptr);
                }
            });
        }
    });

    assert_maps_consistent(&pcpu);
    pcpu.reclaim();
    let first = &pcpu.chunks()[0];
    assert_eq!(first.free_size, 20 << 10);
    assert!(pcpu.chunks().iter().filter(|c| !c.immutable).count() <= 1);
}
