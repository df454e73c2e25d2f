//! Benchmarks for registry lookups and residency resolution

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use warp_mirror::{CallSite, Entry, EntryKind, HostAddr, MemoryManager, MirrorConfig, Registry};

const STRIDE: usize = 0x1000;

fn populated(config: MirrorConfig, entries: usize) -> MemoryManager {
    let mut mm = MemoryManager::new(config);
    for i in 0..entries {
        unsafe { mm.insert(HostAddr::new(0x100_0000 + i * STRIDE), STRIDE / 8, 8).unwrap() };
    }
    mm
}

fn exact_lookup_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("exact_lookup");

    for entries in &[16, 1024, 65536] {
        let mut mm = populated(MirrorConfig::default(), *entries);
        group.bench_with_input(BenchmarkId::from_parameter(entries), entries, |b, &entries| {
            let mut i = 0;
            b.iter(|| {
                let addr = HostAddr::new(0x100_0000 + (i % entries) * STRIDE);
                i += 1;
                black_box(mm.known(addr, false));
            });
        });
    }

    group.finish();
}

fn interior_lookup_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("interior_lookup");

    for entries in &[16, 1024, 65536] {
        let mut registry = Registry::new();
        for i in 0..*entries {
            let addr = HostAddr::new(0x100_0000 + i * STRIDE);
            registry.insert(Entry::new(addr, addr, STRIDE, EntryKind::Registered, CallSite::caller()));
        }

        group.bench_with_input(BenchmarkId::from_parameter(entries), entries, |b, &entries| {
            let mut i = 0;
            b.iter(|| {
                let addr = HostAddr::new(0x100_0000 + (i % entries) * STRIDE + 24);
                i += 1;
                black_box(registry.remaining_bytes(addr));
            });
        });
    }

    group.finish();
}

fn resolve_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve_mirrored");

    for size in &[4 * 1024, 256 * 1024, 4 * 1024 * 1024] {
        let data = vec![1u8; *size];
        let addr = HostAddr::of_slice(&data);
        let mut mm = MemoryManager::new(MirrorConfig::accelerated());
        unsafe { mm.insert(addr, *size, 1).unwrap() };
        mm.resolve(addr).unwrap();

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("cached", size), size, |b, _| {
            b.iter(|| black_box(mm.resolve(addr).unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("push", size), size, |b, _| {
            b.iter(|| mm.push(addr).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, exact_lookup_benchmark, interior_lookup_benchmark, resolve_benchmark);
criterion_main!(benches);
