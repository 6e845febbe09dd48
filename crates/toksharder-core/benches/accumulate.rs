use std::io;
use std::path::PathBuf;

use toksharder_core::{ByteEncoder, ShardAccumulator, ShardSink, encode_u16};

/// Drops shards on the floor so only buffering cost is measured
struct NullSink;

impl ShardSink for NullSink {
    fn write_shard(&mut self, index: usize, tokens: &[u16]) -> io::Result<PathBuf> {
        divan::black_box(tokens);
        Ok(PathBuf::from(format!("shard_{index:05}")))
    }
}

fn synthetic_batches(n: usize, len: usize) -> Vec<Vec<u16>> {
    (0..n)
        .map(|i| (0..len).map(|j| ((i * len + j) % 50_000) as u16).collect())
        .collect()
}

#[divan::bench(args = [1_000, 100_000, 1_000_000])]
fn accumulate(bencher: divan::Bencher, shard_size: usize) {
    let batches = synthetic_batches(2_000, 512);
    bencher.bench(|| {
        let mut acc = ShardAccumulator::new(NullSink, shard_size).unwrap();
        for batch in &batches {
            acc.push(batch).unwrap();
        }
        acc.finish(toksharder_core::ShardKind::Final).unwrap()
    });
}

#[divan::bench]
fn byte_encode(bencher: divan::Bencher) {
    let text = "The quick brown fox jumps over the lazy dog. ".repeat(200);
    bencher.bench(|| {
        let mut encoder = ByteEncoder;
        encode_u16(&mut encoder, divan::black_box(&text)).unwrap()
    });
}

fn main() {
    divan::main();
}
