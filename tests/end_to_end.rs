use courier_resilience::{
    BoxError, CircuitBreakerConfig, CircuitState, Error, RateLimiterConfig, ResilienceRegistry,
    ServiceHealthMonitor, ServiceStatus, SystemHealth,
};
use courier_resilience::health::HealthMonitorConfig;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn fast_breaker() -> CircuitBreakerConfig {
    CircuitBreakerConfig::new()
        .with_failure_threshold(3)
        .with_success_threshold(2)
        .with_recovery_bounds(Duration::from_millis(100), Duration::from_secs(10))
        .with_recovery_timeout(Duration::from_secs(1))
}

#[tokio::test]
async fn test_breaker_full_lifecycle() {
    init_tracing();
    let registry = ResilienceRegistry::builder()
        .with_default_breaker_config(fast_breaker())
        .service("orders")
        .build();
    let breaker = registry.breaker("orders").expect("registered");

    // Three failures trip the breaker.
    for _ in 0..3 {
        let result = breaker
            .execute(|| async { Err::<(), BoxError>("backend down".into()) })
            .await;
        assert!(matches!(result, Err(Error::Operation(_))));
    }
    assert_eq!(breaker.state().await, CircuitState::Open);

    // An immediate fourth call is rejected without running the operation.
    let calls = Arc::new(AtomicU32::new(0));
    let counted = Arc::clone(&calls);
    let rejected = breaker
        .execute(move || {
            let counted = Arc::clone(&counted);
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(())
            }
        })
        .await;
    assert!(matches!(rejected, Err(Error::CircuitOpen { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // After the recovery timeout the next call is admitted as a probe, and
    // two consecutive successes close the circuit again.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    for _ in 0..2 {
        breaker
            .execute(|| async { Ok::<_, BoxError>(()) })
            .await
            .expect("probe should be admitted");
    }
    assert_eq!(breaker.state().await, CircuitState::Closed);
}

#[tokio::test]
async fn test_registry_guards_are_independent_per_service() {
    init_tracing();
    let registry = ResilienceRegistry::builder()
        .with_default_breaker_config(fast_breaker())
        .service("orders")
        .service("payments")
        .build();

    let orders = registry.breaker("orders").expect("registered");
    let payments = registry.breaker("payments").expect("registered");
    for _ in 0..3 {
        let _ = orders
            .execute(|| async { Err::<(), BoxError>("boom".into()) })
            .await;
    }

    assert_eq!(orders.state().await, CircuitState::Open);
    assert_eq!(payments.state().await, CircuitState::Closed);
    payments
        .execute(|| async { Ok::<_, BoxError>(()) })
        .await
        .expect("unrelated service stays available");
}

#[tokio::test]
async fn test_limiter_rejection_carries_retry_after() {
    init_tracing();
    let registry = ResilienceRegistry::builder()
        .with_default_limiter_config(
            RateLimiterConfig::new()
                .with_max_tokens(2)
                .with_refill_interval(Duration::from_secs(60)),
        )
        .service("geocoding")
        .build();
    let limiter = registry.limiter("geocoding").expect("registered");

    assert!(limiter.check().await.is_ok());
    assert!(limiter.check().await.is_ok());
    match limiter.check().await {
        Err(Error::RateLimited { service, .. }) => assert_eq!(service, "geocoding"),
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[tokio::test]
async fn test_breaker_state_feeds_health_verdict() {
    init_tracing();
    let registry = Arc::new(
        ResilienceRegistry::builder()
            .with_default_breaker_config(fast_breaker())
            .service("payments")
            .build(),
    );
    let monitor = ServiceHealthMonitor::new(
        HealthMonitorConfig::new().with_sweep_interval(Duration::from_secs(600)),
    );

    // Health check derives the service status from its breaker state.
    let probe_registry = Arc::clone(&registry);
    monitor
        .register_service_fn("payments", true, move || {
            let registry = Arc::clone(&probe_registry);
            async move {
                let breaker = registry.breaker("payments").ok_or("unknown service")?;
                let status = match breaker.state().await {
                    CircuitState::Closed => ServiceStatus::Healthy,
                    CircuitState::HalfOpen => ServiceStatus::Degraded,
                    CircuitState::Open => ServiceStatus::Unhealthy,
                };
                Ok(status)
            }
        })
        .await;

    monitor.run_health_checks().await;
    assert_eq!(
        monitor.get_health_summary().await.overall,
        SystemHealth::Healthy
    );

    let breaker = registry.breaker("payments").expect("registered");
    for _ in 0..3 {
        let _ = breaker
            .execute(|| async { Err::<(), BoxError>("card processor down".into()) })
            .await;
    }

    monitor.run_health_checks().await;
    let summary = monitor.get_health_summary().await;
    // A critical service behind an open breaker dominates the verdict.
    assert_eq!(summary.overall, SystemHealth::Critical);
    assert_eq!(summary.critical_down, 1);
}
