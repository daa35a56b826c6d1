//! Per-dependency fail-fast guard with adaptive thresholds.
//!
//! The breaker tracks three states:
//! - **Closed**: normal operation, calls pass through (bounded by a
//!   concurrency cap)
//! - **Open**: failures reached the adaptive threshold, calls fail fast
//! - **HalfOpen**: a limited number of probe calls test recovery
//!
//! State only changes through the transition rules implemented here:
//! Closed→Open when `failure_count` reaches the adaptive threshold,
//! Open→HalfOpen once the adaptive cooldown has elapsed (checked lazily on
//! the next call and proactively by a scheduled task, so the breaker recovers
//! without traffic), HalfOpen→Closed after `success_threshold` consecutive
//! probe successes, HalfOpen→Open on any probe failure.

use crate::{BoxError, Error, Result};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    /// Normal operation - requests pass through.
    Closed,
    /// Failures reached the threshold - requests are rejected.
    Open,
    /// Testing recovery - a bounded number of probes pass through.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
            Self::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// Configuration for [`CircuitBreaker`].
///
/// The adaptive tuning constants (`threshold` step of 1, the timeout
/// shrink/grow factors, the outcome window size) are heuristics preserved as
/// defaults; all of them are plain fields and can be tuned per instance.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Initial value for the adaptive failure threshold.
    pub failure_threshold: u32,
    /// Upper bound the adaptive failure threshold may grow to.
    pub max_failure_threshold: u32,
    /// Consecutive probe successes required to close from half-open.
    pub success_threshold: u32,
    /// Initial value for the adaptive open-state cooldown.
    pub recovery_timeout: Duration,
    /// Floor for the adaptive cooldown.
    pub min_recovery_timeout: Duration,
    /// Ceiling for the adaptive cooldown.
    pub max_recovery_timeout: Duration,
    /// Per-call execution timeout; the timer winning the race counts as a
    /// failure of kind `Timeout`.
    pub call_timeout: Duration,
    /// Concurrency cap in the closed state; excess calls are rejected with
    /// `TooManyRequests` without touching the counters.
    pub max_concurrent_requests: u32,
    /// Concurrent probe calls admitted while half-open.
    pub half_open_max_probes: u32,
    /// Enable retuning of threshold/cooldown from the rolling failure rate.
    pub adaptive: bool,
    /// Number of recent outcomes the failure rate is computed over. Retuning
    /// only starts once the window is full.
    pub outcome_window: usize,
    /// Cooldown multiplier applied when the failure rate is below 10%.
    pub timeout_shrink_factor: f64,
    /// Cooldown multiplier applied when the failure rate is above 50%.
    pub timeout_grow_factor: f64,
    /// Interval of the proactive open→half-open check task.
    pub recovery_check_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            max_failure_threshold: 20,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
            min_recovery_timeout: Duration::from_secs(5),
            max_recovery_timeout: Duration::from_secs(120),
            call_timeout: Duration::from_secs(10),
            max_concurrent_requests: 50,
            half_open_max_probes: 1,
            adaptive: true,
            outcome_window: 20,
            timeout_shrink_factor: 0.9,
            timeout_grow_factor: 1.5,
            recovery_check_interval: Duration::from_secs(1),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial failure threshold.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the success threshold for the half-open state.
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    /// Set the initial open-state cooldown.
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Set the adaptive cooldown bounds.
    pub fn with_recovery_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.min_recovery_timeout = min;
        self.max_recovery_timeout = max;
        self
    }

    /// Set the per-call execution timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the closed-state concurrency cap.
    pub fn with_max_concurrent_requests(mut self, max: u32) -> Self {
        self.max_concurrent_requests = max.max(1);
        self
    }

    /// Set the number of probes admitted while half-open.
    pub fn with_half_open_max_probes(mut self, probes: u32) -> Self {
        self.half_open_max_probes = probes.max(1);
        self
    }

    /// Enable or disable adaptive retuning.
    pub fn with_adaptive(mut self, adaptive: bool) -> Self {
        self.adaptive = adaptive;
        self
    }

    /// Set the proactive recovery-check interval.
    pub fn with_recovery_check_interval(mut self, interval: Duration) -> Self {
        self.recovery_check_interval = interval;
        self
    }
}

/// Point-in-time view of a breaker, suitable for dashboards and logs.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub in_flight: u32,
    pub adaptive_failure_threshold: u32,
    pub adaptive_timeout_ms: u64,
    /// Remaining open cooldown in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    /// Counted only while half-open.
    success_count: u32,
    last_failure: Option<Instant>,
    adaptive_failure_threshold: u32,
    adaptive_timeout: Duration,
    /// Rolling outcome window, `true` = success.
    outcomes: VecDeque<bool>,
}

/// Per-dependency circuit breaker with adaptive thresholds.
///
/// All state transitions go through the single internal mutex; admission is
/// non-blocking from the caller's perspective (an `execute` call either runs
/// the operation or returns a rejection immediately).
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<Inner>>,
    in_flight: Arc<AtomicU32>,
    half_open_probes: Arc<AtomicU32>,
    recovery_task: JoinHandle<()>,
}

/// Decrements the in-flight counters when a call finishes, including when the
/// call future is cancelled mid-flight.
struct InFlightGuard {
    in_flight: Arc<AtomicU32>,
    probes: Option<Arc<AtomicU32>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(probes) = &self.probes {
            probes.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl CircuitBreaker {
    /// Create a breaker for the given service identifier.
    ///
    /// Must be called within a tokio runtime: the breaker owns a scheduled
    /// recovery-check task that is torn down on drop.
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let service = service.into();
        let recovery_timeout = config
            .recovery_timeout
            .clamp(config.min_recovery_timeout, config.max_recovery_timeout);
        let inner = Arc::new(Mutex::new(Inner {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            adaptive_failure_threshold: config.failure_threshold.max(1),
            adaptive_timeout: recovery_timeout,
            outcomes: VecDeque::with_capacity(config.outcome_window),
        }));

        let recovery_task = tokio::spawn({
            let inner = Arc::clone(&inner);
            let service = service.clone();
            let check_interval = config.recovery_check_interval;
            async move {
                let mut ticker = tokio::time::interval(check_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let mut st = inner.lock().await;
                    Self::maybe_half_open(&mut st, &service);
                }
            }
        });

        Self {
            service,
            config,
            inner,
            in_flight: Arc::new(AtomicU32::new(0)),
            half_open_probes: Arc::new(AtomicU32::new(0)),
            recovery_task,
        }
    }

    /// Create with default configuration.
    pub fn with_defaults(service: impl Into<String>) -> Self {
        Self::new(service, CircuitBreakerConfig::default())
    }

    /// The service identifier this breaker guards.
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Execute `operation` through the breaker.
    ///
    /// The operation races a per-call timer; if the timer wins, the call is
    /// recorded as a failure and `Error::Timeout` is returned. An ordinary
    /// failure is recorded and the operation's own error passed through
    /// unchanged as `Error::Operation`. Rejections (`CircuitOpen`,
    /// `TooManyRequests`) never invoke the operation and never touch the
    /// counters.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, BoxError>>,
    {
        let _guard = self.admit().await?;

        match tokio::time::timeout(self.config.call_timeout, operation()).await {
            Ok(Ok(value)) => {
                self.on_success().await;
                Ok(value)
            }
            Ok(Err(err)) => {
                self.on_failure().await;
                Err(Error::Operation(err))
            }
            Err(_) => {
                self.on_failure().await;
                Err(Error::Timeout {
                    timeout: self.config.call_timeout,
                })
            }
        }
    }

    async fn admit(&self) -> Result<InFlightGuard> {
        let mut inner = self.inner.lock().await;
        Self::maybe_half_open(&mut inner, &self.service);

        match inner.state {
            CircuitState::Open => {
                let retry_after_ms = inner
                    .last_failure
                    .map(|t| {
                        inner
                            .adaptive_timeout
                            .saturating_sub(t.elapsed())
                            .as_millis() as u64
                    })
                    .unwrap_or(0);
                Err(Error::CircuitOpen {
                    service: self.service.clone(),
                    retry_after_ms,
                })
            }
            CircuitState::HalfOpen => {
                if self.half_open_probes.load(Ordering::SeqCst) >= self.config.half_open_max_probes
                {
                    // Probe slots are taken; callers keep treating the
                    // breaker as open until a probe closes it.
                    return Err(Error::CircuitOpen {
                        service: self.service.clone(),
                        retry_after_ms: 0,
                    });
                }
                self.half_open_probes.fetch_add(1, Ordering::SeqCst);
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                Ok(InFlightGuard {
                    in_flight: Arc::clone(&self.in_flight),
                    probes: Some(Arc::clone(&self.half_open_probes)),
                })
            }
            CircuitState::Closed => {
                let in_flight = self.in_flight.load(Ordering::SeqCst);
                if in_flight >= self.config.max_concurrent_requests {
                    return Err(Error::TooManyRequests {
                        service: self.service.clone(),
                        in_flight,
                        max_concurrent: self.config.max_concurrent_requests,
                    });
                }
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                Ok(InFlightGuard {
                    in_flight: Arc::clone(&self.in_flight),
                    probes: None,
                })
            }
        }
    }

    async fn on_success(&self) {
        let mut inner = self.inner.lock().await;
        Self::push_outcome(&mut inner, self.config.outcome_window, true);

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                debug!(
                    service = %self.service,
                    successes = inner.success_count,
                    threshold = self.config.success_threshold,
                    "half-open probe succeeded"
                );
                if inner.success_count >= self.config.success_threshold {
                    self.transition_closed(&mut inner);
                }
            }
            // Late completion after a manual trip; only the window records it.
            CircuitState::Open => {}
        }

        if self.config.adaptive {
            self.retune(&mut inner);
        }
    }

    async fn on_failure(&self) {
        let mut inner = self.inner.lock().await;
        Self::push_outcome(&mut inner, self.config.outcome_window, false);
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                debug!(
                    service = %self.service,
                    failures = inner.failure_count,
                    threshold = inner.adaptive_failure_threshold,
                    "failure recorded"
                );
                if inner.failure_count >= inner.adaptive_failure_threshold {
                    self.transition_open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                warn!(service = %self.service, "half-open probe failed, reopening");
                self.transition_open(&mut inner);
            }
            CircuitState::Open => {}
        }

        if self.config.adaptive {
            self.retune(&mut inner);
        }
    }

    /// Lazy Open→HalfOpen transition, shared by admission and the scheduled
    /// recovery check.
    fn maybe_half_open(inner: &mut Inner, service: &str) {
        if inner.state != CircuitState::Open {
            return;
        }
        let cooled_down = inner
            .last_failure
            .map(|t| t.elapsed() >= inner.adaptive_timeout)
            .unwrap_or(true);
        if cooled_down {
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
            info!(service, "circuit breaker entering half-open");
        }
    }

    fn transition_open(&self, inner: &mut Inner) {
        if inner.state != CircuitState::Open {
            info!(
                service = %self.service,
                failures = inner.failure_count,
                cooldown_ms = inner.adaptive_timeout.as_millis() as u64,
                "circuit breaker opened"
            );
            inner.state = CircuitState::Open;
        }
    }

    fn transition_closed(&self, inner: &mut Inner) {
        if inner.state != CircuitState::Closed {
            info!(service = %self.service, "circuit breaker closed");
        }
        inner.state = CircuitState::Closed;
        // Invariant: failure_count resets whenever entering Closed.
        inner.failure_count = 0;
        inner.success_count = 0;
    }

    fn push_outcome(inner: &mut Inner, window: usize, success: bool) {
        if inner.outcomes.len() == window {
            inner.outcomes.pop_front();
        }
        inner.outcomes.push_back(success);
    }

    /// Retune the adaptive threshold and cooldown from the rolling failure
    /// rate. Low failure rate (<10%) loosens the breaker: threshold grows,
    /// cooldown shrinks toward its floor. High failure rate (>50%) tightens
    /// it: threshold shrinks toward 1, cooldown grows toward its ceiling.
    fn retune(&self, inner: &mut Inner) {
        if inner.outcomes.len() < self.config.outcome_window {
            return;
        }
        let failures = inner.outcomes.iter().filter(|ok| !**ok).count();
        let rate = failures as f64 / inner.outcomes.len() as f64;

        if rate < 0.10 {
            inner.adaptive_failure_threshold =
                (inner.adaptive_failure_threshold + 1).min(self.config.max_failure_threshold);
            inner.adaptive_timeout = inner
                .adaptive_timeout
                .mul_f64(self.config.timeout_shrink_factor)
                .max(self.config.min_recovery_timeout);
        } else if rate > 0.50 {
            inner.adaptive_failure_threshold =
                inner.adaptive_failure_threshold.saturating_sub(1).max(1);
            inner.adaptive_timeout = inner
                .adaptive_timeout
                .mul_f64(self.config.timeout_grow_factor)
                .min(self.config.max_recovery_timeout);
        } else {
            return;
        }

        debug!(
            service = %self.service,
            failure_rate = rate,
            threshold = inner.adaptive_failure_threshold,
            cooldown_ms = inner.adaptive_timeout.as_millis() as u64,
            "adaptive parameters retuned"
        );
    }

    /// Current state. Read-only: the lazy half-open transition happens on the
    /// next admitted call or scheduled check, not here.
    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Force the breaker closed and clear all counters. Adaptive parameters
    /// return to their configured initial values.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        info!(service = %self.service, "circuit breaker manually reset");
        self.transition_closed(&mut inner);
        inner.last_failure = None;
        inner.outcomes.clear();
        inner.adaptive_failure_threshold = self.config.failure_threshold.max(1);
        inner.adaptive_timeout = self
            .config
            .recovery_timeout
            .clamp(self.config.min_recovery_timeout, self.config.max_recovery_timeout);
    }

    /// Force the breaker open, starting a fresh cooldown.
    pub async fn trip(&self) {
        let mut inner = self.inner.lock().await;
        warn!(service = %self.service, "circuit breaker manually tripped");
        inner.last_failure = Some(Instant::now());
        inner.state = CircuitState::Open;
    }

    /// Alias for [`trip`](Self::trip).
    pub async fn force_open(&self) {
        self.trip().await;
    }

    pub async fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock().await;
        let open_remaining_ms = match inner.state {
            CircuitState::Open => inner.last_failure.map(|t| {
                inner
                    .adaptive_timeout
                    .saturating_sub(t.elapsed())
                    .as_millis() as u64
            }),
            _ => None,
        };
        CircuitBreakerSnapshot {
            service: self.service.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            in_flight: self.in_flight.load(Ordering::SeqCst),
            adaptive_failure_threshold: inner.adaptive_failure_threshold,
            adaptive_timeout_ms: inner.adaptive_timeout.as_millis() as u64,
            open_remaining_ms,
        }
    }
}

impl Drop for CircuitBreaker {
    fn drop(&mut self) {
        self.recovery_task.abort();
    }
}
