use criterion::{black_box, criterion_group, criterion_main, Criterion};
use bgzf::block::{decode_block, encode_block, BLOCK_SIZE};
use bgzf::BgzfWriter;
use flate2::Compression;
use std::io::Cursor;

fn bench_block_codec(c: &mut Criterion) {
    let data: Vec<u8> = (0..BLOCK_SIZE).map(|i| (i % 77) as u8).collect();

    c.bench_function("encode_block_64k_level1", |b| {
        b.iter(|| encode_block(black_box(&data), Compression::new(1)).unwrap())
    });
    c.bench_function("encode_block_64k_level6", |b| {
        b.iter(|| encode_block(black_box(&data), Compression::new(6)).unwrap())
    });

    let block = encode_block(&data, Compression::new(6)).unwrap();
    c.bench_function("decode_block_64k", |b| {
        b.iter(|| decode_block(black_box(&block)).unwrap())
    });
}

fn bench_write_stream(c: &mut Criterion) {
    let data: Vec<u8> = (0..4 * 1024 * 1024).map(|i| ((i * 31) % 241) as u8).collect();

    c.bench_function("write_4mb_single_thread", |b| {
        b.iter(|| {
            let mut writer = BgzfWriter::new(Cursor::new(Vec::new()), Compression::new(6));
            writer.write(black_box(&data)).unwrap();
            writer.finish().unwrap();
        })
    });

    c.bench_function("write_4mb_pipeline_4_workers", |b| {
        b.iter(|| {
            let mut writer = BgzfWriter::new(Cursor::new(Vec::new()), Compression::new(6));
            writer.enable_pipeline(4, 16).unwrap();
            writer.write(black_box(&data)).unwrap();
            writer.finish().unwrap();
        })
    });
}

criterion_group!(benches, bench_block_codec, bench_write_stream);
criterion_main!(benches);
