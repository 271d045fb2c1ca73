use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use encoder_rs::models::encoder::{EncoderConfig, OptimizedEncoder};
use encoder_rs::models::traits::Encoder;
use encoder_rs::nn::Mode;
use encoder_rs::tensor::Tensor;

fn benchmark_encoder(c: &mut Criterion) {
    let (batch, seq_len, dim) = (2, 64, 128);
    let x = Tensor::<f32, 3>::new(
        (0..batch * seq_len * dim).map(|i| (i as f32 * 0.03).cos()).collect(),
        [batch, seq_len, dim],
    )
    .unwrap();

    let mut group = c.benchmark_group("encoder");
    group.sample_size(20);

    for fused in [false, true] {
        let config = EncoderConfig::new(2, 4, dim, 0.1).with_fused_attention(fused);
        let encoder = OptimizedEncoder::<f32>::new(config).unwrap();
        let kernel = if fused { "fused" } else { "reference" };

        group.bench_with_input(BenchmarkId::new("inference", kernel), &x, |b, x| {
            b.iter(|| encoder.forward_with_mode(black_box(x), None, Mode::Inference).unwrap())
        });
    }

    for checkpointing in [false, true] {
        let config = EncoderConfig::new(2, 4, dim, 0.1).with_checkpointing(checkpointing);
        let encoder = OptimizedEncoder::<f32>::new(config).unwrap();
        let label = if checkpointing { "checkpointed" } else { "full" };

        group.bench_with_input(BenchmarkId::new("train", label), &x, |b, x| {
            b.iter(|| encoder.forward_train(black_box(x), None, 7).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_encoder);
criterion_main!(benches);
