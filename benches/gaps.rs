#![allow(unused)]
extern crate nearmap;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use nearmap::{
    alloc::{compute_gaps, find_candidate_gaps},
    maps::{procfs::parse_maps, ProcMapping},
    Protection,
};
use std::{fmt::Write, hint::black_box};

/// Builds a proc map with `count` regions separated by holes of varying size.
fn synthetic_maps(count: usize) -> String {
    let mut text = String::with_capacity(count * 96);
    let mut address = 0x5555_0000_0000usize;
    for i in 0..count {
        let len = 0x1000 * (1 + i % 7);
        let perms = ["r--p", "r-xp", "rw-p", "rw-s"][i % 4];
        let _ = writeln!(
            text,
            "{:x}-{:x} {} {:08x} 08:01 {:<10} /usr/lib/libsynthetic{}.so",
            address,
            address + len,
            perms,
            (i * 0x1000) % 0x10_0000,
            1_000_000 + i,
            i % 13
        );
        address += len + 0x1000 * (i % 3);
    }
    text
}

/// Benchmark proc map parsing on synthetic maps of realistic sizes
fn bench_parse_maps(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_maps");
    for count in [64, 512, 4096] {
        let text = synthetic_maps(count);
        group.throughput(Throughput::Bytes(text.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &text, |b, text| {
            b.iter(|| {
                let parsed = parse_maps(black_box(text)).unwrap();
                black_box(parsed)
            });
        });
    }
    group.finish();
}

/// Benchmark gap computation and candidate filtering
fn bench_candidate_gaps(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_candidate_gaps");
    for count in [64, 512, 4096] {
        let mappings: Vec<ProcMapping> = parse_maps(&synthetic_maps(count)).unwrap();
        let reference = mappings[count / 4].start;
        let ceiling = reference + u32::MAX as usize;

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(
            BenchmarkId::new("gaps", count),
            &mappings,
            |b, mappings| {
                b.iter(|| black_box(compute_gaps(black_box(mappings), ceiling)));
            },
        );
        group.bench_with_input(
            BenchmarkId::new("candidates", count),
            &mappings,
            |b, mappings| {
                b.iter(|| {
                    black_box(find_candidate_gaps(
                        black_box(mappings),
                        reference,
                        0x2000,
                        ceiling,
                    ))
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_parse_maps, bench_candidate_gaps);
criterion_main!(benches);
