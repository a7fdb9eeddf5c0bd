use anoncast::amd::{self, AmdParams};
use anoncast::bits::Bits;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;

const SECURITY: u32 = 5;

fn bench_encode(c: &mut Criterion) {
    let mut rng = StdRng::from_seed([7u8; 32]);
    let mut group = c.benchmark_group("amd_encode");

    for message_len in [8usize, 64, 256, 1024, 4096] {
        let params = AmdParams::derive(message_len, SECURITY).unwrap();
        let message = Bits::random(message_len, &mut rng);

        group.bench_with_input(
            BenchmarkId::from_parameter(message_len),
            &(params, message),
            |b, (params, message)| {
                let mut rng = StdRng::from_seed([11u8; 32]);
                b.iter(|| amd::encode(params, message, &mut rng).unwrap());
            },
        );
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut rng = StdRng::from_seed([7u8; 32]);
    let mut group = c.benchmark_group("amd_decode");

    for message_len in [8usize, 64, 256, 1024, 4096] {
        let params = AmdParams::derive(message_len, SECURITY).unwrap();
        let message = Bits::random(message_len, &mut rng);
        let codeword = amd::encode(&params, &message, &mut rng).unwrap();

        group.bench_with_input(
            BenchmarkId::from_parameter(message_len),
            &(params, codeword),
            |b, (params, codeword)| {
                b.iter(|| amd::decode(params, codeword).unwrap());
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
