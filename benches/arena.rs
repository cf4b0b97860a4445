//! Arena benchmarks
//!
//! Slot allocation and recycling over heap and mapped regions, plus the
//! connection insert path on top of them.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use slabdb::storage::{Arena, ArenaConfig, ArenaKind, Backing, RowState};
use slabdb::{Engine, SyncMode, TableDef};
use tempfile::tempdir;

fn rows_config() -> ArenaConfig {
    ArenaConfig::new(ArenaKind::Rows, 64, 8).with_control_offset(60)
}

fn bench_allocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("arena_allocate");

    for count in [1_000u32, 100_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::new("heap", count), count, |b, &count| {
            b.iter(|| {
                let mut arena = Arena::open(Backing::Memory, &rows_config()).unwrap();
                for _ in 0..count {
                    let id = arena.allocate().unwrap();
                    arena.set_row_state(id, RowState::Committed);
                }
                black_box(arena.max_id())
            });
        });

        group.bench_with_input(BenchmarkId::new("mapped", count), count, |b, &count| {
            b.iter_with_setup(
                || {
                    let dir = tempdir().unwrap();
                    let path = dir.path().join("rows.dat");
                    (dir, path)
                },
                |(dir, path)| {
                    let mut arena = Arena::open(Backing::File(&path), &rows_config()).unwrap();
                    for _ in 0..count {
                        let id = arena.allocate().unwrap();
                        arena.set_row_state(id, RowState::Committed);
                    }
                    black_box(arena.max_id());
                    dir
                },
            );
        });
    }

    group.finish();
}

fn bench_recycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("arena_recycle");
    group.throughput(Throughput::Elements(10_000));
    group.bench_function("free_then_allocate", |b| {
        let mut arena = Arena::open(Backing::Memory, &rows_config()).unwrap();
        let ids: Vec<u32> = (0..10_000).map(|_| arena.allocate().unwrap()).collect();
        b.iter(|| {
            for &id in &ids {
                arena.free(id);
            }
            for _ in 0..ids.len() {
                black_box(arena.allocate().unwrap());
            }
        });
    });
    group.finish();
}

fn bench_connection_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("connection_insert");
    let count = 1_000u32;
    group.throughput(Throughput::Elements(count as u64));

    group.bench_function("in_memory_auto_commit", |b| {
        b.iter_with_setup(
            || {
                let engine = Engine::default();
                engine.database("bench").table(TableDef::new("t", 32)).open().unwrap();
                engine
            },
            |engine| {
                let table = engine.get_database("bench").unwrap().table("t").unwrap();
                let mut conn = engine.connect();
                for i in 0..count {
                    let mut row = [0u8; 32];
                    row[..4].copy_from_slice(&i.to_le_bytes());
                    conn.insert(&table, &row, None).unwrap();
                }
            },
        );
    });

    group.bench_function("persistent_one_transaction", |b| {
        b.iter_with_setup(
            || {
                let dir = tempdir().unwrap();
                let engine = Engine::default();
                engine
                    .database("bench")
                    .path(dir.path())
                    .sync_mode(SyncMode::Off)
                    .table(TableDef::new("t", 32))
                    .open()
                    .unwrap();
                (dir, engine)
            },
            |(dir, engine)| {
                let table = engine.get_database("bench").unwrap().table("t").unwrap();
                let mut conn = engine.connect();
                conn.begin().unwrap();
                for i in 0..count {
                    let mut row = [0u8; 32];
                    row[..4].copy_from_slice(&i.to_le_bytes());
                    conn.insert(&table, &row, None).unwrap();
                }
                conn.commit().unwrap();
                dir
            },
        );
    });

    group.finish();
}

criterion_group!(benches, bench_allocate, bench_recycle, bench_connection_insert);
criterion_main!(benches);
