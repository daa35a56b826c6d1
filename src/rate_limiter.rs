//! Token-bucket plus sliding-window admission control with an adaptive
//! threshold.
//!
//! Admission is a two-phase protocol: [`RateLimiter::acquire_token`] decides
//! whether the guarded operation may run, and the caller reports the outcome
//! afterwards with [`RateLimiter::record_result`], which feeds the adaptive
//! threshold. The limiter never retries anything on its own.

use crate::{Error, Result};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Configuration for [`RateLimiter`].
///
/// The adaptive steps (halving below 50% success, ×0.8 below 80%, +1 above
/// 95%) are heuristics preserved as defaults and exposed as fields.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Token bucket capacity; also the ceiling of the adaptive threshold.
    pub max_tokens: u32,
    /// Time to mint one token. Refill adds `floor(elapsed / refill_interval)`
    /// tokens, capped at `max_tokens`.
    pub refill_interval: Duration,
    /// Sliding window over which recent requests are counted.
    pub window: Duration,
    /// Rolling outcome window feeding the success rate.
    pub outcome_window: usize,
    /// Base throttle duration; doubles with the excess ratio.
    pub base_throttle: Duration,
    /// Throttle duration ceiling.
    pub max_throttle: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_tokens: 100,
            refill_interval: Duration::from_millis(100),
            window: Duration::from_secs(60),
            outcome_window: 10,
            base_throttle: Duration::from_secs(5),
            max_throttle: Duration::from_secs(60),
        }
    }
}

impl RateLimiterConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bucket capacity.
    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = tokens.max(1);
        self
    }

    /// Set the per-token refill interval.
    pub fn with_refill_interval(mut self, interval: Duration) -> Self {
        self.refill_interval = interval;
        self
    }

    /// Set the sliding-window duration.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Set the rolling outcome-window size.
    pub fn with_outcome_window(mut self, size: usize) -> Self {
        self.outcome_window = size.max(1);
        self
    }

    /// Set the base throttle duration.
    pub fn with_base_throttle(mut self, throttle: Duration) -> Self {
        self.base_throttle = throttle;
        self
    }

    /// Set the throttle duration ceiling.
    pub fn with_max_throttle(mut self, throttle: Duration) -> Self {
        self.max_throttle = throttle;
        self
    }
}

/// Point-in-time view of a limiter.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterSnapshot {
    pub service: String,
    pub tokens: u32,
    pub max_tokens: u32,
    pub requests_in_window: u32,
    pub adaptive_threshold: u32,
    pub throttled: bool,
    /// Remaining throttle time in ms, if currently throttled.
    pub throttle_remaining_ms: Option<u64>,
    /// Rolling success rate, once at least one outcome was recorded.
    pub success_rate: Option<f64>,
}

#[derive(Debug)]
struct State {
    tokens: u32,
    last_refill: Instant,
    /// Grant timestamps inside the sliding window, oldest first.
    request_timestamps: VecDeque<Instant>,
    adaptive_threshold: u32,
    throttle_until: Option<Instant>,
    /// Rolling outcome window, `true` = success.
    outcomes: VecDeque<bool>,
}

/// Per-dependency token-bucket + sliding-window rate limiter.
///
/// Admission is non-blocking: `acquire_token` returns immediately with a
/// grant or a denial. All mutation goes through the single internal mutex.
pub struct RateLimiter {
    service: String,
    config: RateLimiterConfig,
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn new(service: impl Into<String>, config: RateLimiterConfig) -> Self {
        let state = Mutex::new(State {
            tokens: config.max_tokens,
            last_refill: Instant::now(),
            request_timestamps: VecDeque::new(),
            // The threshold starts wide open and adapts downwards on poor
            // outcomes.
            adaptive_threshold: config.max_tokens.max(1),
            throttle_until: None,
            outcomes: VecDeque::with_capacity(config.outcome_window),
        });
        Self {
            service: service.into(),
            config,
            state,
        }
    }

    /// Create with default configuration.
    pub fn with_defaults(service: impl Into<String>) -> Self {
        Self::new(service, RateLimiterConfig::default())
    }

    /// The service identifier this limiter guards.
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Try to acquire a token. Returns `true` when the request is admitted.
    ///
    /// Executed in order: refill, window pruning, throttle check, window
    /// threshold check (which may start a new throttle), token grant.
    pub async fn acquire_token(&self) -> bool {
        let mut st = self.state.lock().await;
        self.refill_locked(&mut st);
        Self::prune_locked(&mut st, self.config.window);

        let now = Instant::now();
        if let Some(until) = st.throttle_until {
            if now < until {
                return false;
            }
            st.throttle_until = None;
            info!(service = %self.service, "throttle window elapsed");
        }

        let in_window = st.request_timestamps.len() as u32;
        if in_window >= st.adaptive_threshold {
            let excess_ratio = in_window as f64 / st.adaptive_threshold as f64;
            let throttle = self
                .config
                .base_throttle
                .mul_f64(2f64.powf(excess_ratio - 1.0))
                .min(self.config.max_throttle);
            st.throttle_until = Some(now + throttle);
            warn!(
                service = %self.service,
                requests_in_window = in_window,
                threshold = st.adaptive_threshold,
                throttle_ms = throttle.as_millis() as u64,
                "request volume exceeded adaptive threshold, throttling"
            );
            return false;
        }

        if st.tokens > 0 {
            st.tokens -= 1;
            st.request_timestamps.push_back(now);
            true
        } else {
            false
        }
    }

    /// Like [`acquire_token`](Self::acquire_token), but maps a denial to
    /// [`Error::RateLimited`] with an estimated retry-after.
    pub async fn check(&self) -> Result<()> {
        if self.acquire_token().await {
            return Ok(());
        }
        let st = self.state.lock().await;
        let now = Instant::now();
        let retry_after_ms = st
            .throttle_until
            .filter(|until| *until > now)
            .map(|until| until.duration_since(now).as_millis() as u64)
            .or_else(|| {
                // Bucket empty: wait for the next minted token.
                (st.tokens == 0).then(|| self.config.refill_interval.as_millis() as u64)
            });
        Err(Error::RateLimited {
            service: self.service.clone(),
            retry_after_ms,
        })
    }

    /// Report the outcome of an admitted operation. This is the second phase
    /// of the protocol and the only input to the adaptive threshold.
    pub async fn record_result(&self, success: bool) {
        let mut st = self.state.lock().await;
        if st.outcomes.len() == self.config.outcome_window {
            st.outcomes.pop_front();
        }
        st.outcomes.push_back(success);

        let successes = st.outcomes.iter().filter(|ok| **ok).count();
        let rate = successes as f64 / st.outcomes.len() as f64;
        let before = st.adaptive_threshold;

        if rate < 0.5 {
            st.adaptive_threshold = (before / 2).max(1);
        } else if rate < 0.8 {
            st.adaptive_threshold = ((before as f64 * 0.8).floor() as u32).max(1);
        } else if rate > 0.95 && before < self.config.max_tokens {
            st.adaptive_threshold = before + 1;
        }

        if st.adaptive_threshold != before {
            debug!(
                service = %self.service,
                success_rate = rate,
                threshold = st.adaptive_threshold,
                "adaptive threshold adjusted"
            );
        }
    }

    fn refill_locked(&self, st: &mut State) {
        let interval = self.config.refill_interval;
        if interval.is_zero() {
            st.tokens = self.config.max_tokens;
            return;
        }
        let elapsed = st.last_refill.elapsed();
        let minted = elapsed.as_nanos() / interval.as_nanos();
        if minted == 0 {
            return;
        }
        let add = minted.min(self.config.max_tokens as u128) as u32;
        st.tokens = st.tokens.saturating_add(add).min(self.config.max_tokens);
        if st.tokens == self.config.max_tokens {
            // Full bucket: no credit is hoarded past capacity.
            st.last_refill = Instant::now();
        } else {
            st.last_refill += interval * (minted as u32);
        }
    }

    fn prune_locked(st: &mut State, window: Duration) {
        let now = Instant::now();
        while let Some(oldest) = st.request_timestamps.front() {
            if now.duration_since(*oldest) > window {
                st.request_timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    pub async fn snapshot(&self) -> RateLimiterSnapshot {
        let mut st = self.state.lock().await;
        self.refill_locked(&mut st);
        Self::prune_locked(&mut st, self.config.window);

        let now = Instant::now();
        let throttle_remaining_ms = st
            .throttle_until
            .filter(|until| *until > now)
            .map(|until| until.duration_since(now).as_millis() as u64);
        let success_rate = (!st.outcomes.is_empty()).then(|| {
            st.outcomes.iter().filter(|ok| **ok).count() as f64 / st.outcomes.len() as f64
        });

        RateLimiterSnapshot {
            service: self.service.clone(),
            tokens: st.tokens,
            max_tokens: self.config.max_tokens,
            requests_in_window: st.request_timestamps.len() as u32,
            adaptive_threshold: st.adaptive_threshold,
            throttled: throttle_remaining_ms.is_some(),
            throttle_remaining_ms,
            success_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> RateLimiterConfig {
        RateLimiterConfig::new()
            .with_max_tokens(3)
            .with_refill_interval(Duration::from_millis(50))
            .with_window(Duration::from_secs(10))
    }

    #[test]
    fn test_config_defaults() {
        let config = RateLimiterConfig::default();
        assert_eq!(config.max_tokens, 100);
        assert_eq!(config.refill_interval, Duration::from_millis(100));
        assert_eq!(config.window, Duration::from_secs(60));
        assert_eq!(config.outcome_window, 10);
    }

    #[test]
    fn test_config_builders_cover_every_knob() {
        let config = RateLimiterConfig::new()
            .with_max_tokens(8)
            .with_refill_interval(Duration::from_millis(25))
            .with_window(Duration::from_secs(5))
            .with_outcome_window(4)
            .with_base_throttle(Duration::from_millis(500))
            .with_max_throttle(Duration::from_secs(8));
        assert_eq!(config.max_tokens, 8);
        assert_eq!(config.refill_interval, Duration::from_millis(25));
        assert_eq!(config.window, Duration::from_secs(5));
        assert_eq!(config.outcome_window, 4);
        assert_eq!(config.base_throttle, Duration::from_millis(500));
        assert_eq!(config.max_throttle, Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_burst_then_denial() {
        let limiter = RateLimiter::new("orders", small_config());
        assert!(limiter.acquire_token().await);
        assert!(limiter.acquire_token().await);
        assert!(limiter.acquire_token().await);
        // Bucket exhausted.
        assert!(!limiter.acquire_token().await);
    }

    #[tokio::test]
    async fn test_tokens_stay_within_bounds() {
        let limiter = RateLimiter::new("orders", small_config());
        for _ in 0..20 {
            let _ = limiter.acquire_token().await;
        }
        let snap = limiter.snapshot().await;
        assert!(snap.tokens <= snap.max_tokens);

        // Long idle period must not overfill the bucket.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let snap = limiter.snapshot().await;
        assert!(snap.tokens <= snap.max_tokens);
    }

    #[tokio::test]
    async fn test_refill_is_floor_of_elapsed() {
        // Short window so the sliding-window count stays clear of the
        // threshold and only the bucket drives admission here.
        let cfg = small_config().with_window(Duration::from_millis(5));
        let limiter = RateLimiter::new("orders", cfg);
        for _ in 0..3 {
            assert!(limiter.acquire_token().await);
        }

        // Less than one interval since construction: still empty.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!limiter.acquire_token().await);

        // Past one interval: exactly one token minted.
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(limiter.acquire_token().await);
        assert!(!limiter.acquire_token().await);
    }

    #[tokio::test]
    async fn test_window_threshold_starts_throttle() {
        let cfg = small_config()
            .with_max_tokens(10)
            .with_base_throttle(Duration::from_millis(60));
        let limiter = RateLimiter::new("orders", cfg);

        // Drive the threshold down to 1 with failures, then trip the window.
        for _ in 0..10 {
            limiter.record_result(false).await;
        }
        assert_eq!(limiter.snapshot().await.adaptive_threshold, 1);

        assert!(limiter.acquire_token().await);
        assert!(!limiter.acquire_token().await);
        let snap = limiter.snapshot().await;
        assert!(snap.throttled);
        assert!(snap.throttle_remaining_ms.is_some());

        // Throttle elapses on its own.
        tokio::time::sleep(Duration::from_millis(120)).await;
        let snap = limiter.snapshot().await;
        assert!(!snap.throttled);
    }

    #[tokio::test]
    async fn test_low_success_rate_strictly_decreases_threshold() {
        let limiter = RateLimiter::new("orders", RateLimiterConfig::new().with_max_tokens(64));
        // 6 failures / 4 successes: rate 0.4 after ten outcomes.
        for _ in 0..4 {
            limiter.record_result(true).await;
        }
        for _ in 0..6 {
            limiter.record_result(false).await;
        }
        let before = limiter.snapshot().await.adaptive_threshold;
        limiter.record_result(false).await;
        let after = limiter.snapshot().await.adaptive_threshold;
        assert!(after < before);
        assert!(after >= 1);
    }

    #[tokio::test]
    async fn test_threshold_floor_is_one() {
        let limiter = RateLimiter::new("orders", small_config());
        for _ in 0..30 {
            limiter.record_result(false).await;
        }
        assert_eq!(limiter.snapshot().await.adaptive_threshold, 1);
    }

    #[tokio::test]
    async fn test_high_success_rate_grows_threshold_to_cap() {
        let cfg = small_config().with_max_tokens(4).with_outcome_window(10);
        let limiter = RateLimiter::new("orders", cfg);
        // Pull the threshold down first.
        for _ in 0..10 {
            limiter.record_result(false).await;
        }
        assert_eq!(limiter.snapshot().await.adaptive_threshold, 1);

        // All-success outcomes grow it back one step at a time, capped.
        for _ in 0..20 {
            limiter.record_result(true).await;
        }
        assert_eq!(limiter.snapshot().await.adaptive_threshold, 4);
    }

    #[tokio::test]
    async fn test_check_maps_denial_to_error() {
        let limiter = RateLimiter::new("orders", small_config());
        for _ in 0..3 {
            limiter.check().await.unwrap();
        }
        let err = limiter.check().await.unwrap_err();
        assert!(matches!(err, Error::RateLimited { .. }));
        assert!(err.is_rejection());
    }

    #[tokio::test]
    async fn test_window_count_matches_timestamps_after_prune() {
        let cfg = small_config().with_window(Duration::from_millis(80));
        let limiter = RateLimiter::new("orders", cfg);

        assert!(limiter.acquire_token().await);
        assert!(limiter.acquire_token().await);
        assert_eq!(limiter.snapshot().await.requests_in_window, 2);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(limiter.snapshot().await.requests_in_window, 0);
    }
}
