use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::prelude::*;
use symheap_rust::heap::{PeerTable, RangeAllocator};
use symheap_rust::USER_HEAP_OFFSET;

const HEAP: usize = 64 << 20;

fn bench_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_free");
    for &size in &[16usize, 1024, 64 * 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let mut allocator = RangeAllocator::new(USER_HEAP_OFFSET, HEAP).unwrap();
            b.iter(|| {
                let offset = allocator.allocate(black_box(size)).unwrap();
                allocator.release(offset).unwrap();
            });
        });
    }
    group.finish();
}

fn bench_fragmented_heap(c: &mut Criterion) {
    // Checkerboard of live blocks so every request walks the free index.
    let mut allocator = RangeAllocator::new(USER_HEAP_OFFSET, HEAP).unwrap();
    let mut rng = StdRng::seed_from_u64(42);
    let blocks: Vec<usize> = (0..4096)
        .map(|_| allocator.allocate(rng.gen_range(16..4096)).unwrap())
        .collect();
    for offset in blocks.iter().step_by(2) {
        allocator.release(*offset).unwrap();
    }

    c.bench_function("fragmented_best_fit", |b| {
        b.iter(|| {
            let offset = allocator.allocate(black_box(2000)).unwrap();
            allocator.release(offset).unwrap();
        });
    });

    c.bench_function("fragmented_aligned", |b| {
        b.iter(|| {
            let offset = allocator.allocate_aligned(black_box(256), 1000).unwrap();
            allocator.release(offset).unwrap();
        });
    });
}

fn bench_translate(c: &mut Criterion) {
    let world = 64;
    let heap_size = 1 << 20;
    let mut table = PeerTable::new(0, world, 0x1000_0000, heap_size);
    for rank in 1..world {
        table
            .set_peer_base(rank, 0x1000_0000 + rank * 2 * heap_size)
            .unwrap();
    }
    c.bench_function("translate", |b| {
        let mut rank = 0;
        b.iter(|| {
            rank = (rank + 1) % world;
            black_box(table.translate(black_box(0x1000_0000 + 4096), rank).unwrap())
        });
    });
}

criterion_group!(benches, bench_alloc_free, bench_fragmented_heap, bench_translate);
criterion_main!(benches);
