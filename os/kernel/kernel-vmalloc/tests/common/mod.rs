#![allow(dead_code)]

use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_vmalloc::testing::SimMachine;
use kernel_vmalloc::{Vmalloc, VmallocConfig};

pub type SimVmalloc = Vmalloc<SimMachine, SimMachine, SimMachine>;

/// Base of the window used by the tests.
pub const WINDOW_START: usize = 0xffff_c900_0000_0000;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Allocator over the default (huge) vmalloc window.
pub fn setup(cpus: usize) -> (SimMachine, SimVmalloc) {
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

/// Allocator over a window of `pages` pages.
pub fn setup_window(cpus: usize, pages: usize) -> (SimMachine, SimVmalloc) {
    init_logging();
    let sim = SimMachine::new(cpus);
    let start = VirtualAddress::new(WINDOW_START);
    let config = VmallocConfig::new(start, start + pages * PAGE_SIZE);
    let vm = Vmalloc::new(config, sim.clone(), sim.clone(), sim.clone());
    (sim, vm)
}
