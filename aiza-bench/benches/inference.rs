use aiza_infer::sampler::{softmax, top_k};
use aiza_infer::{KvCache, KvCacheConfig, Sampler, SamplingParams};
use criterion::{Criterion, black_box, criterion_group, criterion_main};

fn softmax_benchmark(c: &mut Criterion) {
    let logits: Vec<f32> = (0..32000).map(|i| (i as f32) * 0.001).collect();
    c.bench_function("softmax_32k_vocab", |b| b.iter(|| softmax(black_box(&logits))));
    c.bench_function("top_k_50_of_32k", |b| b.iter(|| top_k(black_box(&logits), 50)));
}

fn sample_benchmark(c: &mut Criterion) {
    let logits: Vec<f32> = (0..32000).map(|i| ((i as f32) * 0.37).sin()).collect();
    let mut sampler = Sampler::new(SamplingParams {
        temperature: 0.8,
        top_k: Some(50),
        seed: Some(1),
    })
    .unwrap();
    c.bench_function("sample_top50_32k", |b| {
        b.iter(|| sampler.sample(black_box(&logits)).unwrap())
    });
}

fn kv_cache_benchmark(c: &mut Criterion) {
    let cfg = KvCacheConfig {
        num_layers: 12,
        batch_size: 1,
        num_heads: 8,
        head_dim: 64,
        block_size: 1024,
        max_positions: None,
    };
    let step = vec![0.5f32; cfg.num_heads * cfg.head_dim];
    c.bench_function("kv_cache_decode_2048_steps", |b| {
        b.iter(|| {
            let mut cache = KvCache::new(cfg).unwrap();
            for _ in 0..2048 {
                for layer in 0..cfg.num_layers {
                    black_box(cache.insert(layer, &step, &step).unwrap().len());
                }
            }
            cache.growth_events()
        })
    });
}

criterion_group!(benches, softmax_benchmark, sample_benchmark, kv_cache_benchmark);
criterion_main!(benches);
