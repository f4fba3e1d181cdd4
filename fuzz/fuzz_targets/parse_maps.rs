#![no_main]

use libfuzzer_sys::fuzz_target;
use nearmap::alloc::find_candidate_gaps;
use nearmap::maps::{procfs::parse_maps, MappingTable};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(mappings) = parse_maps(text) else {
        return;
    };
    let Ok(table) = MappingTable::new(mappings) else {
        return;
    };

    let Some(first) = table.as_slice().first() else {
        return;
    };
    let reference = first.start;
    let ceiling = reference.saturating_add(u32::MAX as usize);
    for gap in find_candidate_gaps(table.as_slice(), reference, 0x1000, ceiling) {
        assert!(gap.start > reference);
        assert!(gap.end <= ceiling);
        assert!(gap.len() >= 0x1000);
        assert!(table.find(gap.start).is_none());
    }
});
