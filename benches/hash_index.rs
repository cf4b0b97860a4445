//! Hash index benchmarks
//!
//! Insert cost including online rehashing, unique lookups, and lookups that
//! walk a long sibling list of duplicate keys.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use slabdb::index::{HashIndex, KeyField, KeySpec};
use slabdb::storage::{Arena, ArenaConfig, ArenaKind, Backing, RowState};
use slabdb::txn::{CommittedView, Visibility};

fn filled(count: u32, distinct: u32, unique: bool) -> (Arena, HashIndex) {
    let mut rows = Arena::open(
        Backing::Memory,
        &ArenaConfig::new(ArenaKind::Rows, 12, 8).with_control_offset(8),
    )
    .unwrap();
    let key = KeySpec::new([KeyField::binary(0, 4)]).unwrap();
    let mut index = HashIndex::new("bench", key, unique, 8).unwrap();
    for i in 0..count {
        let id = rows.allocate().unwrap();
        rows.slot_mut(id)[..4].copy_from_slice(&(i % distinct).to_le_bytes());
        rows.set_row_state(id, RowState::Committed);
        let check: Option<&dyn Visibility> = if unique { Some(&CommittedView) } else { None };
        index.add(id, &rows, check).unwrap();
    }
    (rows, index)
}

fn bench_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_index_add");
    for count in [1_000u32, 100_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::new("unique", count), count, |b, &count| {
            b.iter(|| black_box(filled(count, count, true).1.len()));
        });
        group.bench_with_input(BenchmarkId::new("duplicates_x16", count), count, |b, &count| {
            b.iter(|| black_box(filled(count, count / 16, false).1.len()));
        });
    }
    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_index_lookup");
    let count = 100_000u32;

    let (rows, index) = filled(count, count, true);
    group.bench_function("unique_hit", |b| {
        let mut k = 0u32;
        b.iter(|| {
            k = (k + 7919) % count;
            let bytes = k.to_le_bytes();
            black_box(index.query_unique(&rows, &[&bytes[..]], &CommittedView))
        });
    });
    group.bench_function("miss", |b| {
        let mut k = count;
        b.iter(|| {
            k = k.wrapping_add(1).max(count);
            let bytes = k.to_le_bytes();
            black_box(index.query_unique(&rows, &[&bytes[..]], &CommittedView))
        });
    });

    let (rows, index) = filled(count, 100, false);
    group.throughput(Throughput::Elements(1_000));
    group.bench_function("sibling_walk_1000", |b| {
        let bytes = 42u32.to_le_bytes();
        b.iter(|| black_box(index.query(&rows, &[&bytes[..]], &CommittedView).count()));
    });

    group.finish();
}

criterion_group!(benches, bench_add, bench_lookup);
criterion_main!(benches);
