//! Concurrent acquire/release against one mapper.
//!
//! Regions handed out at the same time must never overlap, whichever threads acquire and
//! release them in whatever order.

use std::{
    sync::{Arc, Barrier, Mutex},
    thread,
};

use nearmap::{MemoryMapper, MemoryRegion, RegionKind};
use proptest::prelude::*;
use rayon::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Op {
    Code(usize),
    Data(usize),
    Release(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1usize..200_000).prop_map(Op::Code),
        (1usize..200_000).prop_map(Op::Data),
        any::<usize>().prop_map(Op::Release),
    ]
}

fn assert_disjoint(spans: &mut [(usize, usize)]) {
    spans.sort_unstable();
    for pair in spans.windows(2) {
        assert!(
            pair[0].1 <= pair[1].0,
            "{:#x}..{:#x} overlaps {:#x}..{:#x}",
            pair[0].0,
            pair[0].1,
            pair[1].0,
            pair[1].1
        );
    }
}

fn run_script(mapper: &MemoryMapper, script: &[Op], live: &Mutex<Vec<MemoryRegion>>) {
    let mut own: Vec<MemoryRegion> = Vec::new();
    for op in script {
        match *op {
            Op::Code(size) => own.push(mapper.acquire_code_region(size).unwrap()),
            Op::Data(size) => own.push(mapper.acquire_data_region(size).unwrap()),
            Op::Release(pick) if !own.is_empty() => {
                let region = own.swap_remove(pick % own.len());
                mapper.release_region(region).unwrap();
            }
            Op::Release(_) => {}
        }
    }
    live.lock().unwrap().extend(own);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn live_regions_never_overlap(
        scripts in prop::collection::vec(prop::collection::vec(op(), 1..12), 2..6)
    ) {
        let mapper = Arc::new(MemoryMapper::new().unwrap());
        let live = Arc::new(Mutex::new(Vec::new()));
        let barrier = Arc::new(Barrier::new(scripts.len()));

        let handles: Vec<_> = scripts
            .into_iter()
            .map(|script| {
                let mapper = mapper.clone();
                let live = live.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    run_script(&mapper, &script, &live);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let regions = std::mem::take(&mut *live.lock().unwrap());
        let mut spans: Vec<(usize, usize)> =
            regions.iter().map(|r| (r.start(), r.end())).collect();
        assert_disjoint(&mut spans);

        let reference = mapper.reference_address().unwrap();
        for region in regions.iter().filter(|r| r.kind() == RegionKind::Code) {
            prop_assert!(region.start() > reference);
            prop_assert!(region.end() - reference <= u32::MAX as usize);
        }

        prop_assert_eq!(mapper.stats().live_regions, regions.len());
        for region in regions {
            mapper.release_region(region).unwrap();
        }
        prop_assert_eq!(mapper.stats().live_regions, 0);
    }
}

#[test]
fn parallel_code_acquisition() {
    let mapper = MemoryMapper::new().unwrap();

    let regions: Vec<MemoryRegion> = (0..64)
        .into_par_iter()
        .map(|i| mapper.acquire_code_region(4096 * (1 + i % 4)).unwrap())
        .collect();

    let mut spans: Vec<(usize, usize)> = regions.iter().map(|r| (r.start(), r.end())).collect();
    assert_disjoint(&mut spans);
    assert_eq!(mapper.tracker().len(), 64);

    regions
        .into_par_iter()
        .for_each(|region| mapper.release_region(region).unwrap());
    assert!(mapper.tracker().is_empty());
}
