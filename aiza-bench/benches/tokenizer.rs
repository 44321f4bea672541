use aiza_bench::corpus;
use aiza_core::bpe::{TrainerConfig, train};
use criterion::{Criterion, black_box, criterion_group, criterion_main};

fn train_benchmark(c: &mut Criterion) {
    let docs = corpus(500);
    let config = TrainerConfig {
        vocab_size: 600,
        ..Default::default()
    };
    c.bench_function("bpe_train_500_docs_600_vocab", |b| {
        b.iter(|| train(black_box(&docs), &config).unwrap())
    });
}

fn encode_benchmark(c: &mut Criterion) {
    let docs = corpus(2000);
    let vocab = train(&docs, &TrainerConfig {
        vocab_size: 1000,
        ..Default::default()
    })
    .unwrap();
    let text = docs[..200].join(" ");
    c.bench_function("encode_200_docs", |b| b.iter(|| vocab.encode(black_box(&text))));

    let ids = vocab.encode(&text);
    c.bench_function("decode_200_docs", |b| b.iter(|| vocab.decode(black_box(&ids))));
}

criterion_group!(benches, train_benchmark, encode_benchmark);
criterion_main!(benches);
