//! Benchmarks for admission-path overhead
//!
//! This benchmark measures:
//! - Circuit breaker execute() wrapping of a trivial operation
//! - Rate limiter token acquisition under a large bucket
//! - Registry lookup plus guarded call

use criterion::{criterion_group, criterion_main, Criterion};
use std::time::Duration;
use tokio::runtime::Runtime;

use courier_resilience::{
    BoxError, CircuitBreaker, CircuitBreakerConfig, RateLimiter, RateLimiterConfig,
    ResilienceRegistry,
};

fn bench_breaker_execute(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let breaker = rt.block_on(async {
        CircuitBreaker::new(
            "bench",
            CircuitBreakerConfig::new().with_max_concurrent_requests(u32::MAX),
        )
    });

    c.bench_function("breaker_execute_ok", |b| {
        b.to_async(&rt).iter(|| async {
            breaker
                .execute(|| async { Ok::<_, BoxError>(42u64) })
                .await
                .expect("closed breaker admits")
        })
    });
}

fn bench_limiter_acquire(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let limiter = rt.block_on(async {
        RateLimiter::new(
            "bench",
            RateLimiterConfig::new()
                .with_max_tokens(u32::MAX)
                .with_refill_interval(Duration::from_nanos(1)),
        )
    });

    c.bench_function("limiter_acquire_token", |b| {
        b.to_async(&rt).iter(|| async { limiter.acquire_token().await })
    });
}

fn bench_registry_guarded_call(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let registry = rt.block_on(async {
        ResilienceRegistry::builder()
            .with_default_breaker_config(
                CircuitBreakerConfig::new().with_max_concurrent_requests(u32::MAX),
            )
            .with_default_limiter_config(
                RateLimiterConfig::new()
                    .with_max_tokens(u32::MAX)
                    .with_refill_interval(Duration::from_nanos(1)),
            )
            .service("orders")
            .build()
    });

    c.bench_function("registry_guarded_call", |b| {
        b.to_async(&rt).iter(|| async {
            let guards = registry.guards("orders").expect("registered");
            guards.limiter.acquire_token().await;
            guards
                .breaker
                .execute(|| async { Ok::<_, BoxError>(()) })
                .await
                .expect("closed breaker admits")
        })
    });
}

criterion_group!(
    benches,
    bench_breaker_execute,
    bench_limiter_acquire,
    bench_registry_guarded_call
);
criterion_main!(benches);
