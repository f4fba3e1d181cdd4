//! Shared fixtures for unit tests.


pub use placer::FakePlacer;

use crate::{
    maps::ProcMapping,
    region::{MemoryRegion, Protection, RegionKind},
};

// Helper function to create a descriptor for an address range that is never touched
pub fn forged_region(start: usize, len: usize, kind: RegionKind) -> MemoryRegion {
    unsafe { MemoryRegion::from_raw_parts(start, len, Protection::READ_WRITE, kind) }
        .expect("forged regions must not start at zero")
}

// Helper function to create an anonymous read-write mapping
pub fn mapping(start: usize, end: usize) -> ProcMapping {
    ProcMapping::new(start, end, Protection::READ_WRITE)
}

// Helper function to route log output through the test harness
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
