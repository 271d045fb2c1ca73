use criterion::{Criterion, black_box, criterion_group, criterion_main};
use encoder_rs::nn::init::initialize;
use encoder_rs::nn::transformer::{
    AttentionKernel, AttentionMask, FusedAttention, ReferenceAttention,
};
use encoder_rs::tensor::Tensor;

fn benchmark_attention(c: &mut Criterion) {
    let batch = 2;
    let seq_len = 128;
    let num_heads = 4;
    let model_dim = 128;

    // Use unwrap() freely as this is a benchmark setup
    let mut reference = ReferenceAttention::<f32>::new(model_dim, num_heads, 0.0).unwrap();
    initialize(&mut reference, 0).unwrap();
    let fused = FusedAttention::from_reference(&reference).unwrap();

    let x = Tensor::new(
        (0..batch * seq_len * model_dim)
            .map(|i| (i as f32 * 0.01).sin())
            .collect(),
        [batch, seq_len, model_dim],
    )
    .unwrap();
    let mask = AttentionMask::from_lengths(&[seq_len, seq_len / 2], seq_len).unwrap();

    let mut group = c.benchmark_group("attention");

    group.bench_function("reference", |b| {
        b.iter(|| reference.forward(black_box(&x), None, None).unwrap())
    });

    group.bench_function("fused", |b| {
        b.iter(|| fused.forward(black_box(&x), None, None).unwrap())
    });

    group.bench_function("fused_padded", |b| {
        b.iter(|| fused.forward(black_box(&x), Some(&mask), None).unwrap())
    });

    group.finish();
}

criterion_group!(benches, benchmark_attention);
criterion_main!(benches);
