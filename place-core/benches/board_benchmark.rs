use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use place_core::{unpack, Board, BoardGeometry, Pixel};
use std::hint::black_box;

fn bench_insert_pixel(c: &mut Criterion) {
    let mut group = c.benchmark_group("Board Codec");
    group.throughput(Throughput::Elements(1));

    group.bench_function("insert_pixel", |b| {
        let mut board = Board::solid(BoardGeometry::default(), 3);
        let mut i: u32 = 0;
        b.iter(|| {
            i = i.wrapping_add(7919);
            let x = (i % 1000) as u16;
            let y = ((i / 1000) % 1000) as u16;
            board.insert_pixel(black_box(x), black_box(y), black_box(5)).unwrap();
        })
    });

    group.finish();
}

fn bench_unpack_full_board(c: &mut Criterion) {
    let mut group = c.benchmark_group("Board Codec");
    let geometry = BoardGeometry::default();
    group.throughput(Throughput::Bytes(geometry.packed_len() as u64));

    let blob = Board::solid(geometry, 0xA).into_bytes();
    group.bench_function("unpack_1000x1000", |b| {
        b.iter(|| black_box(unpack(geometry, black_box(&blob)).unwrap()))
    });

    let colors = unpack(geometry, &blob).unwrap();
    group.bench_function("pack_1000x1000", |b| {
        b.iter(|| black_box(Board::pack(geometry, black_box(&colors)).unwrap()))
    });

    group.finish();
}

fn bench_fold_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("Board Codec");
    let pixels: Vec<Pixel> = (0..10_000u32)
        .map(|i| Pixel::new((i % 1000) as u16, (i / 1000) as u16, (i % 16) as u8))
        .collect();
    group.throughput(Throughput::Elements(pixels.len() as u64));

    group.bench_function("apply_all_10k", |b| {
        let mut board = Board::solid(BoardGeometry::default(), 0);
        b.iter(|| black_box(board.apply_all(black_box(&pixels))))
    });

    group.finish();
}

criterion_group!(benches, bench_insert_pixel, bench_unpack_full_board, bench_fold_batch);
criterion_main!(benches);
