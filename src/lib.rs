//! # courier-resilience
//!
//! Resilience layer for services talking to flaky backends: fail-fast
//! circuit breaking, adaptive rate limiting, prioritized request queuing and
//! service-health aggregation, wired together through an explicitly
//! constructed per-service registry.
//!
//! ## Overview
//!
//! Each component guards one downstream dependency and owns its own state
//! behind a single serialized writer, so concurrent callers always observe
//! consistent transitions. Background work (proactive breaker recovery,
//! queue dispatch, health sweeps) runs on scheduled tasks owned by the
//! component instance and torn down when it is dropped.
//!
//! ## Key Features
//!
//! - **Circuit breaking**: [`CircuitBreaker`] with closed/open/half-open
//!   states, adaptive failure threshold and adaptive recovery timeout
//! - **Rate limiting**: [`RateLimiter`] combining a token bucket with a
//!   sliding-window adaptive threshold and exponential throttle backoff
//! - **Request queuing**: [`RequestQueueManager`] with a bounded priority
//!   queue, a fixed worker pool and pluggable retry policies
//! - **Health monitoring**: [`ServiceHealthMonitor`] sweeping registered
//!   probes concurrently and aggregating an overall system verdict
//! - **Registry**: [`ResilienceRegistry`] handing out one breaker/limiter
//!   pair per service identifier, built once and passed by the application
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use courier_resilience::{ResilienceRegistry, BoxError};
//!
//! #[tokio::main]
//! async fn main() -> courier_resilience::Result<()> {
//!     let registry = ResilienceRegistry::builder()
//!         .service("orders")
//!         .service("payments")
//!         .build();
//!
//!     let breaker = registry.breaker("orders").expect("registered above");
//!     let value = breaker
//!         .execute(|| async { Ok::<_, BoxError>("response") })
//!         .await?;
//!     assert_eq!(value, "response");
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`circuit_breaker`] | Per-dependency fail-fast guard with adaptive tuning |
//! | [`rate_limiter`] | Token-bucket plus sliding-window admission control |
//! | [`request_queue`] | Bounded priority queue with worker pool and retries |
//! | [`health`] | Periodic health sweeps, recovery hooks, aggregation |
//! | [`registry`] | Keyed store of per-service breaker/limiter pairs |
//! | [`error`] | Unified error taxonomy |

pub mod circuit_breaker;
pub mod error;
pub mod health;
pub mod rate_limiter;
pub mod registry;
pub mod request_queue;

// Re-export main types for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use error::{BoxError, Error};
pub use health::{
    FnProbe, HealthMonitorConfig, HealthProbe, HealthSummary, ServiceHealth,
    ServiceHealthMonitor, ServiceStatus, SystemHealth,
};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use registry::{ResilienceRegistry, ResilienceRegistryBuilder, ServiceGuards};
pub use request_queue::{
    Priority, QueueMetrics, RequestQueueConfig, RequestQueueManager, RetryPolicy,
};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
