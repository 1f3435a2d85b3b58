use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use pb_audio::write_path::apply_volume;

fn bench_apply_volume(c: &mut Criterion) {
    let mut buffer = vec![0.5f32; 2 * 256];
    c.bench_function("volume 2x256", |b| {
        b.iter(|| apply_volume(black_box(&mut buffer), black_box(0.8)))
    });
    c.bench_function("volume 2x256 unity", |b| {
        b.iter(|| apply_volume(black_box(&mut buffer), black_box(1.0)))
    });

    let mut large = vec![0.5f32; 8 * 4096];
    c.bench_function("volume 8x4096", |b| {
        b.iter(|| apply_volume(black_box(&mut large), black_box(1.5)))
    });
}

criterion_group!(benches, bench_apply_volume);
criterion_main!(benches);
