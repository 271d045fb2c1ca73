use criterion::{Criterion, criterion_group, criterion_main};
use encoder_rs_kernels::{cpu_matmul, cpu_matmul_transposed, cpu_softmax_rows, cpu_transpose};
use std::hint::black_box;

fn benchmark_matmul(c: &mut Criterion) {
    let mut group = c.benchmark_group("matmul");

    for &size in &[64usize, 128, 256, 512] {
        let shape = [size, size];
        let lhs = vec![1.0f32; size * size];
        let rhs = vec![1.0f32; size * size];

        group.bench_function(format!("{size}x{size}"), |b| {
            b.iter(|| cpu_matmul(black_box(&lhs), black_box(&rhs), &shape, &shape).unwrap())
        });
        group.bench_function(format!("{size}x{size}_transposed"), |b| {
            b.iter(|| {
                cpu_matmul_transposed(black_box(&lhs), black_box(&rhs), &shape, &shape).unwrap()
            })
        });
    }
    group.finish();
}

fn benchmark_transpose(c: &mut Criterion) {
    let mut group = c.benchmark_group("transpose");

    for &size in &[128usize, 512, 1024, 2048] {
        let shape = [size, size];
        let data = vec![1.0f32; size * size];

        group.bench_function(format!("{size}x{size}"), |b| {
            b.iter(|| cpu_transpose(black_box(&data), black_box(&shape)).unwrap())
        });
    }
    group.finish();
}

fn benchmark_softmax(c: &mut Criterion) {
    let mut group = c.benchmark_group("softmax_rows");

    // Attention-shaped score buffers: heads * L rows of length L.
    for &seq_len in &[64usize, 128, 256] {
        let rows = 8 * seq_len;
        let data: Vec<f32> = (0..rows * seq_len).map(|i| (i % 17) as f32 * 0.1).collect();

        group.bench_function(format!("8x{seq_len}x{seq_len}"), |b| {
            b.iter_batched(
                || data.clone(),
                |mut buf| cpu_softmax_rows(black_box(&mut buf), seq_len).unwrap(),
                criterion::BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_matmul, benchmark_transpose, benchmark_softmax);
criterion_main!(benches);
