//! Benchmarks for the per-tick hot paths: burst-pattern evaluation, payload
//! pool reads, and rate-limiter checks. All three run once per session per
//! scheduler tick, so their cost multiplies by session count.

use std::{net::IpAddr, time::Instant};

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use netprobe_core::{
    burst::{self, BurstState},
    prng::PayloadPool,
    profiles::TrafficProfile,
    ratelimit::RateLimiter,
};

fn bench_burst_evaluate(c: &mut Criterion) {
    let mut group = c.benchmark_group("burst_evaluate");
    let now = Instant::now();

    let profiles = [
        ("gamer", TrafficProfile::gamer()),
        ("video_caller", TrafficProfile::video_caller()),
        ("streamer", TrafficProfile::streamer()),
    ];
    for (name, profile) in &profiles {
        group.bench_function(*name, |b| {
            b.iter_batched(
                || BurstState::initial(now),
                |state| burst::evaluate(profile, state, now),
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_payload_pool_take(c: &mut Criterion) {
    let mut group = c.benchmark_group("payload_pool_take");
    let pool = PayloadPool::from_os_entropy();

    for size in [1024usize, 16 * 1024, 64 * 1024] {
        group.bench_function(format!("{size}_bytes"), |b| {
            b.iter(|| pool.take(size));
        });
    }
    group.finish();
}

fn bench_rate_limiter_flood_prefilter(c: &mut Criterion) {
    let limiter = RateLimiter::new(Default::default());
    let addr: IpAddr = "203.0.113.7".parse().unwrap();

    c.bench_function("rate_limiter_flood_prefilter", |b| {
        b.iter(|| limiter.check_flood_prefilter(addr));
    });
}

criterion_group!(benches, bench_burst_evaluate, bench_payload_pool_take, bench_rate_limiter_flood_prefilter);
criterion_main!(benches);
