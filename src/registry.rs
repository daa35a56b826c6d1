//! Keyed store of per-service resilience guards.
//!
//! One [`CircuitBreaker`] and one [`RateLimiter`] exist per service
//! identifier, created once when the registry is built and shared for its
//! lifetime. The registry is constructed at process start and handed to call
//! sites explicitly; there are no process-wide singletons.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::rate_limiter::{RateLimiter, RateLimiterConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Guards handed out for one service.
#[derive(Clone)]
pub struct ServiceGuards {
    pub breaker: Arc<CircuitBreaker>,
    pub limiter: Arc<RateLimiter>,
}

struct ServiceSpec {
    breaker_config: CircuitBreakerConfig,
    limiter_config: RateLimiterConfig,
}

/// Builder for [`ResilienceRegistry`].
///
/// Services pick up the builder-wide default configs unless they register
/// an override.
pub struct ResilienceRegistryBuilder {
    default_breaker: CircuitBreakerConfig,
    default_limiter: RateLimiterConfig,
    services: HashMap<String, ServiceSpec>,
}

impl Default for ResilienceRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResilienceRegistryBuilder {
    pub fn new() -> Self {
        Self {
            default_breaker: CircuitBreakerConfig::default(),
            default_limiter: RateLimiterConfig::default(),
            services: HashMap::new(),
        }
    }

    /// Breaker config applied to services without an override.
    pub fn with_default_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.default_breaker = config;
        self
    }

    /// Limiter config applied to services without an override.
    pub fn with_default_limiter_config(mut self, config: RateLimiterConfig) -> Self {
        self.default_limiter = config;
        self
    }

    /// Register a service with the builder-wide defaults.
    pub fn service(self, name: impl Into<String>) -> Self {
        let breaker = self.default_breaker.clone();
        let limiter = self.default_limiter.clone();
        self.service_with(name, breaker, limiter)
    }

    /// Register a service with its own configs.
    pub fn service_with(
        mut self,
        name: impl Into<String>,
        breaker_config: CircuitBreakerConfig,
        limiter_config: RateLimiterConfig,
    ) -> Self {
        self.services.insert(
            name.into(),
            ServiceSpec {
                breaker_config,
                limiter_config,
            },
        );
        self
    }

    /// Instantiate every registered service's guards.
    ///
    /// Must be called within a tokio runtime: breakers own scheduled
    /// recovery-check tasks.
    pub fn build(self) -> ResilienceRegistry {
        let services = self
            .services
            .into_iter()
            .map(|(name, spec)| {
                debug!(service = %name, "resilience guards created");
                let guards = ServiceGuards {
                    breaker: Arc::new(CircuitBreaker::new(&name, spec.breaker_config)),
                    limiter: Arc::new(RateLimiter::new(&name, spec.limiter_config)),
                };
                (name, guards)
            })
            .collect();
        ResilienceRegistry { services }
    }
}

/// Immutable keyed store of [`ServiceGuards`], built once via
/// [`ResilienceRegistryBuilder`].
pub struct ResilienceRegistry {
    services: HashMap<String, ServiceGuards>,
}

impl ResilienceRegistry {
    pub fn builder() -> ResilienceRegistryBuilder {
        ResilienceRegistryBuilder::new()
    }

    /// Guards of a registered service.
    pub fn guards(&self, service: &str) -> Option<ServiceGuards> {
        self.services.get(service).cloned()
    }

    /// Breaker of a registered service.
    pub fn breaker(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.services.get(service).map(|g| Arc::clone(&g.breaker))
    }

    /// Limiter of a registered service.
    pub fn limiter(&self, service: &str) -> Option<Arc<RateLimiter>> {
        self.services.get(service).map(|g| Arc::clone(&g.limiter))
    }

    /// Registered service identifiers.
    pub fn services(&self) -> Vec<&str> {
        self.services.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_returns_shared_instance() {
        let registry = ResilienceRegistry::builder()
            .service("orders")
            .service("payments")
            .build();

        assert_eq!(registry.len(), 2);
        let a = registry.breaker("orders").unwrap();
        let b = registry.breaker("orders").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.guards("geocoding").is_none());
    }

    #[tokio::test]
    async fn test_per_service_override_beats_defaults() {
        let registry = ResilienceRegistry::builder()
            .with_default_breaker_config(CircuitBreakerConfig::new().with_failure_threshold(5))
            .service("orders")
            .service_with(
                "payments",
                CircuitBreakerConfig::new().with_failure_threshold(1),
                RateLimiterConfig::new().with_max_tokens(2),
            )
            .build();

        let payments = registry.breaker("payments").unwrap();
        // One failure trips the overridden breaker.
        let _ = payments
            .execute(|| async { Err::<(), _>("boom".into()) })
            .await;
        assert!(payments
            .execute(|| async { Ok::<_, crate::BoxError>(()) })
            .await
            .is_err());

        let orders = registry.breaker("orders").unwrap();
        let _ = orders
            .execute(|| async { Err::<(), _>("boom".into()) })
            .await;
        assert!(orders
            .execute(|| async { Ok::<_, crate::BoxError>(()) })
            .await
            .is_ok());

        let limiter = registry.limiter("payments").unwrap();
        assert!(limiter.acquire_token().await);
        assert!(limiter.acquire_token().await);
    }

    #[tokio::test]
    async fn test_guards_share_service_name() {
        let registry = ResilienceRegistry::builder().service("orders").build();
        let guards = registry.guards("orders").unwrap();
        assert_eq!(guards.breaker.service(), "orders");
        assert_eq!(guards.limiter.service(), "orders");
    }
}
