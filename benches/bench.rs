//! Benchmarks for descriptor quantization and nearest-neighbor search.
//!
//! Descriptors are synthetic SIFT-like vectors; timings compare the three
//! matching strategies on the same reference set.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::prelude::*;
use vocloc::*;

fn random_set(n: usize, seed: u64) -> DescriptorSet {
    let mut rng = StdRng::seed_from_u64(seed);
    let rows = (0..n).map(|_| {
        (0..DescriptorType::Sift.dim())
            .map(|_| rng.gen_range(0..256) as f32)
            .collect::<Vec<_>>()
    });
    DescriptorSet::from_rows(DescriptorType::Sift, rows).unwrap()
}

/// Benchmark for VocabularyTree::histogram()
fn bench_quantize(c: &mut Criterion) {
    let training = random_set(2_000, 42);
    let query = random_set(500, 7);
    let mut group = c.benchmark_group("quantize");
    group.throughput(Throughput::Elements(query.len() as u64));

    for &(k, levels) in &[(10, 2), (10, 3)] {
        let tree = VocabularyTree::train(&training, k, levels, 0).unwrap();
        group.bench_with_input(
            BenchmarkId::new("histogram", format!("k{}_l{}", k, levels)),
            &tree,
            |b, tree| b.iter(|| tree.histogram(black_box(&query)).unwrap()),
        );
    }
    group.finish();
}

fn bench_matchers(c: &mut Criterion) {
    let reference = random_set(2_000, 1);
    let query = random_set(200, 2);
    let mut group = c.benchmark_group("match_set");
    group.throughput(Throughput::Elements(query.len() as u64));

    for &matcher_type in &[
        MatcherType::BruteForceL2,
        MatcherType::AnnL2,
        MatcherType::CascadeHashingL2,
    ] {
        let config = MatcherConfig {
            matcher_type,
            ..MatcherConfig::default()
        };
        let matcher = RegionsMatcher::build(&config, &reference).unwrap();
        group.bench_function(BenchmarkId::from_parameter(format!("{:?}", matcher_type)), |b| {
            b.iter(|| matcher.match_set(config.ratio, black_box(&query)).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_quantize, bench_matchers);
criterion_main!(benches);
