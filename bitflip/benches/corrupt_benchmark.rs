use bitflip::{Codec, CorruptingReader, DecoderParser, Harness, MemorySource};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::io::{Read, Write};

/// Deterministic filler so runs are comparable.
fn generate_data(len: usize) -> Vec<u8> {
    let mut state = 0x9E37_79B9_7F4A_7C15u64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

fn bench_corrupting_reader(c: &mut Criterion) {
    let mut group = c.benchmark_group("corrupting_reader");

    for size_mb in [1, 10].iter() {
        let data = generate_data(size_mb * 1024 * 1024);
        let offset = data.len() as u64 * 4;

        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("plain", format!("{}MB", size_mb)),
            &data,
            |b, data| {
                b.iter(|| {
                    let mut reader = &data[..];
                    let mut buffer = [0u8; 8192];
                    while reader.read(&mut buffer).unwrap() > 0 {}
                })
            },
        );
        group.bench_with_input(
            BenchmarkId::new("corrupting", format!("{}MB", size_mb)),
            &data,
            |b, data| {
                b.iter(|| {
                    let mut reader = CorruptingReader::with_offset(&data[..], Some(offset));
                    let mut buffer = [0u8; 8192];
                    while reader.read(&mut buffer).unwrap() > 0 {}
                })
            },
        );
    }

    group.finish();
}

fn bench_sweep(c: &mut Criterion) {
    let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::best());
    encoder.write_all(&generate_data(256)).unwrap();
    let doc = encoder.finish().unwrap();
    let source = MemorySource::new("bench.bz2", doc.clone());

    let mut group = c.benchmark_group("sweep");
    group.sample_size(10);
    group.throughput(Throughput::Elements(doc.len() as u64 * 8));
    group.bench_function("bzip2_sequential", |b| {
        let harness = Harness::new(DecoderParser::new(Codec::Bzip2));
        b.iter(|| harness.sweep(&source).unwrap())
    });
    group.finish();
}

criterion_group!(benches, bench_corrupting_reader, bench_sweep);
criterion_main!(benches);
