use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::Arc;

use parley_media::{MediaSourceProvider, ProviderConfig, SyntheticBackend};

fn bench_acquire_release(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let provider = MediaSourceProvider::new(
        Arc::new(SyntheticBackend::new()),
        ProviderConfig::default(),
    );

    c.bench_function("synthetic_acquire_release", |b| {
        b.to_async(&rt).iter(|| async {
            let stream = provider.acquire(true, true).await;
            provider.release(&stream);
        })
    });
}

fn bench_degraded_acquire(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let provider = MediaSourceProvider::new(
        Arc::new(SyntheticBackend::new().camera(parley_media::DeviceBehavior::Denied)),
        ProviderConfig::default(),
    );

    c.bench_function("synthetic_acquire_camera_denied", |b| {
        b.to_async(&rt).iter(|| async {
            let stream = provider.acquire(true, true).await;
            provider.release(&stream);
        })
    });
}

criterion_group!(benches, bench_acquire_release, bench_degraded_acquire);
criterion_main!(benches);
