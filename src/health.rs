//! Periodic service-health aggregation with recovery hooks.
//!
//! Services register a [`HealthProbe`] capability record at registration
//! time (no string-keyed dispatch); an owned sweep task runs all checks
//! concurrently at a fixed interval and keeps per-service health entries up
//! to date. The monitor computes an overall system-health verdict that
//! callers use to decide whether to degrade gracefully, and exposes a
//! recovery pass that re-checks unhealthy services after invoking their
//! recovery hook.

use crate::BoxError;
use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Health of a single registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceStatus {
    Healthy,
    Degraded,
    Unhealthy,
    /// No check has completed yet.
    Unknown,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "Healthy"),
            Self::Degraded => write!(f, "Degraded"),
            Self::Unhealthy => write!(f, "Unhealthy"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Aggregated verdict over all registered services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SystemHealth {
    Healthy,
    Degraded,
    Unhealthy,
    /// At least one critical service is not healthy.
    Critical,
    /// No service has been checked yet.
    Unknown,
}

/// Capability record for a monitored service.
///
/// `recover` has a generic no-op fallback for services without a dedicated
/// recovery action (cache clears, credential refreshes and the like override
/// it).
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> Result<ServiceStatus, BoxError>;

    async fn recover(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

type CheckFn =
    Box<dyn Fn() -> BoxFuture<'static, Result<ServiceStatus, BoxError>> + Send + Sync>;
type RecoverFn = Box<dyn Fn() -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Closure-based [`HealthProbe`] for callers who don't want a dedicated type.
pub struct FnProbe {
    check: CheckFn,
    recover: Option<RecoverFn>,
}

impl FnProbe {
    pub fn new<C, Fut>(check: C) -> Self
    where
        C: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ServiceStatus, BoxError>> + Send + 'static,
    {
        Self {
            check: Box::new(move || Box::pin(check())),
            recover: None,
        }
    }

    /// Attach a recovery action, replacing the generic fallback.
    pub fn with_recovery<R, Fut>(mut self, recover: R) -> Self
    where
        R: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.recover = Some(Box::new(move || Box::pin(recover())));
        self
    }
}

#[async_trait]
impl HealthProbe for FnProbe {
    async fn check(&self) -> Result<ServiceStatus, BoxError> {
        (self.check)().await
    }

    async fn recover(&self) -> Result<(), BoxError> {
        match &self.recover {
            Some(recover) => recover().await,
            None => Ok(()),
        }
    }
}

/// Configuration for [`ServiceHealthMonitor`].
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Interval of the periodic sweep.
    pub sweep_interval: Duration,
    /// Per-check timeout; a timed-out check counts as unhealthy.
    pub check_timeout: Duration,
    /// Smoothing factor of the uptime percentage.
    pub uptime_alpha: f64,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            check_timeout: Duration::from_secs(5),
            uptime_alpha: 0.1,
        }
    }
}

impl HealthMonitorConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the per-check timeout.
    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }
}

/// Health entry of a registered service, updated in place by every sweep.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub name: String,
    pub status: ServiceStatus,
    pub is_critical: bool,
    /// Unix ms of the last completed check, if any.
    pub last_check_ms: Option<u64>,
    /// Response time of the last check.
    pub response_time_ms: Option<u64>,
    /// Consecutive failed checks; resets on a healthy check.
    pub error_count: u32,
    /// Exponentially smoothed toward 100 when healthy, 0 otherwise.
    pub uptime_percentage: f64,
}

/// Aggregated summary of the last sweep.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub overall: SystemHealth,
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    /// Critical services whose last check was not healthy.
    pub critical_down: usize,
    pub avg_uptime_percentage: Option<f64>,
    pub avg_response_time_ms: Option<f64>,
    /// Unix ms of the last completed sweep, if any.
    pub last_sweep_ms: Option<u64>,
}

struct ServiceEntry {
    probe: Arc<dyn HealthProbe>,
    health: ServiceHealth,
}

struct MonitorState {
    services: HashMap<String, ServiceEntry>,
    last_sweep_ms: Option<u64>,
}

struct MonitorShared {
    config: HealthMonitorConfig,
    state: Mutex<MonitorState>,
}

/// Periodic aggregator over named services.
pub struct ServiceHealthMonitor {
    shared: Arc<MonitorShared>,
    sweep_task: JoinHandle<()>,
}

impl ServiceHealthMonitor {
    /// Create a monitor and start its sweep task. Must be called within a
    /// tokio runtime; the task is torn down on drop.
    pub fn new(config: HealthMonitorConfig) -> Self {
        let shared = Arc::new(MonitorShared {
            config,
            state: Mutex::new(MonitorState {
                services: HashMap::new(),
                last_sweep_ms: None,
            }),
        });
        let sweep_task = tokio::spawn({
            let shared = Arc::clone(&shared);
            async move {
                let mut ticker = tokio::time::interval(shared.config.sweep_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // The immediate first tick is skipped so services registered
                // right after construction are swept on a full interval.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    Self::sweep(&shared).await;
                }
            }
        });
        Self { shared, sweep_task }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(HealthMonitorConfig::default())
    }

    /// Register a service with its probe. Re-registering a name replaces the
    /// probe and resets the entry.
    pub async fn register_service(
        &self,
        name: impl Into<String>,
        is_critical: bool,
        probe: Arc<dyn HealthProbe>,
    ) {
        let name = name.into();
        let mut state = self.shared.state.lock().await;
        debug!(service = %name, is_critical, "service registered for health monitoring");
        state.services.insert(
            name.clone(),
            ServiceEntry {
                probe,
                health: ServiceHealth {
                    name,
                    status: ServiceStatus::Unknown,
                    is_critical,
                    last_check_ms: None,
                    response_time_ms: None,
                    error_count: 0,
                    uptime_percentage: 100.0,
                },
            },
        );
    }

    /// Register a closure check without a dedicated probe type.
    pub async fn register_service_fn<C, Fut>(
        &self,
        name: impl Into<String>,
        is_critical: bool,
        check: C,
    ) where
        C: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ServiceStatus, BoxError>> + Send + 'static,
    {
        self.register_service(name, is_critical, Arc::new(FnProbe::new(check)))
            .await;
    }

    /// Run one sweep now, outside the periodic schedule.
    pub async fn run_health_checks(&self) {
        Self::sweep(&self.shared).await;
    }

    async fn sweep(shared: &Arc<MonitorShared>) {
        let probes: Vec<(String, Arc<dyn HealthProbe>)> = {
            let state = shared.state.lock().await;
            state
                .services
                .iter()
                .map(|(name, entry)| (name.clone(), Arc::clone(&entry.probe)))
                .collect()
        };
        if probes.is_empty() {
            return;
        }

        // Fan-out: all checks run concurrently, each under its own timeout.
        let timeout = shared.config.check_timeout;
        let checks = probes.into_iter().map(|(name, probe)| async move {
            let started = Instant::now();
            let outcome = tokio::time::timeout(timeout, probe.check()).await;
            (name, outcome, started.elapsed())
        });
        let results = join_all(checks).await;

        let mut state = shared.state.lock().await;
        let mut healthy = 0usize;
        let total = results.len();
        for (name, outcome, elapsed) in results {
            if let Some(entry) = state.services.get_mut(&name) {
                Self::apply_check(&shared.config, entry, outcome, elapsed);
                if entry.health.status == ServiceStatus::Healthy {
                    healthy += 1;
                }
            }
        }
        state.last_sweep_ms = Some(unix_ms());
        info!(total, healthy, "health sweep completed");
    }

    /// Fold one check outcome into a service entry: status, response time,
    /// smoothed uptime, error counter.
    fn apply_check(
        config: &HealthMonitorConfig,
        entry: &mut ServiceEntry,
        outcome: std::result::Result<Result<ServiceStatus, BoxError>, tokio::time::error::Elapsed>,
        elapsed: Duration,
    ) {
        let status = match outcome {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => {
                debug!(service = %entry.health.name, error = %err, "health check failed");
                ServiceStatus::Unhealthy
            }
            Err(_) => {
                debug!(service = %entry.health.name, "health check timed out");
                ServiceStatus::Unhealthy
            }
        };

        let health = &mut entry.health;
        health.status = status;
        health.last_check_ms = Some(unix_ms());
        health.response_time_ms = Some(elapsed.as_millis() as u64);

        let target = if status == ServiceStatus::Healthy {
            100.0
        } else {
            0.0
        };
        let alpha = config.uptime_alpha;
        health.uptime_percentage = (1.0 - alpha) * health.uptime_percentage + alpha * target;

        if status == ServiceStatus::Healthy {
            health.error_count = 0;
        } else {
            health.error_count += 1;
        }
    }

    /// Invoke the recovery hook of every currently-unhealthy service, then
    /// immediately re-check it. Returns the number of services that came
    /// back healthy.
    pub async fn attempt_recovery(&self) -> usize {
        let unhealthy: Vec<(String, Arc<dyn HealthProbe>)> = {
            let state = self.shared.state.lock().await;
            state
                .services
                .iter()
                .filter(|(_, entry)| entry.health.status == ServiceStatus::Unhealthy)
                .map(|(name, entry)| (name.clone(), Arc::clone(&entry.probe)))
                .collect()
        };

        let timeout = self.shared.config.check_timeout;
        let mut recovered = 0usize;
        for (name, probe) in unhealthy {
            warn!(service = %name, "attempting recovery");
            if let Err(err) = probe.recover().await {
                warn!(service = %name, error = %err, "recovery action failed");
            }

            let started = Instant::now();
            let outcome = tokio::time::timeout(timeout, probe.check()).await;
            let elapsed = started.elapsed();

            let mut state = self.shared.state.lock().await;
            if let Some(entry) = state.services.get_mut(&name) {
                Self::apply_check(&self.shared.config, entry, outcome, elapsed);
                if entry.health.status == ServiceStatus::Healthy {
                    info!(service = %name, "service recovered");
                    recovered += 1;
                }
            }
        }
        recovered
    }

    /// Current health entries of all registered services.
    pub async fn services(&self) -> Vec<ServiceHealth> {
        let state = self.shared.state.lock().await;
        state
            .services
            .values()
            .map(|entry| entry.health.clone())
            .collect()
    }

    /// Aggregated summary.
    ///
    /// Verdict priority: any non-healthy critical service (that has been
    /// checked) wins as `Critical`, then any unhealthy, then any degraded.
    /// Before any check has completed the overall verdict is `Unknown`.
    pub async fn get_health_summary(&self) -> HealthSummary {
        let state = self.shared.state.lock().await;

        let mut healthy = 0usize;
        let mut degraded = 0usize;
        let mut unhealthy = 0usize;
        let mut unknown = 0usize;
        let mut critical_down = 0usize;
        let mut uptime_sum = 0.0f64;
        let mut response_sum = 0.0f64;
        let mut response_count = 0usize;

        for entry in state.services.values() {
            let health = &entry.health;
            match health.status {
                ServiceStatus::Healthy => healthy += 1,
                ServiceStatus::Degraded => degraded += 1,
                ServiceStatus::Unhealthy => unhealthy += 1,
                ServiceStatus::Unknown => unknown += 1,
            }
            if health.is_critical
                && matches!(
                    health.status,
                    ServiceStatus::Degraded | ServiceStatus::Unhealthy
                )
            {
                critical_down += 1;
            }
            uptime_sum += health.uptime_percentage;
            if let Some(ms) = health.response_time_ms {
                response_sum += ms as f64;
                response_count += 1;
            }
        }

        let total = state.services.len();
        let overall = if critical_down > 0 {
            SystemHealth::Critical
        } else if unhealthy > 0 {
            SystemHealth::Unhealthy
        } else if degraded > 0 {
            SystemHealth::Degraded
        } else if healthy > 0 {
            SystemHealth::Healthy
        } else {
            SystemHealth::Unknown
        };

        HealthSummary {
            overall,
            total,
            healthy,
            degraded,
            unhealthy,
            unknown,
            critical_down,
            avg_uptime_percentage: (total > 0).then(|| uptime_sum / total as f64),
            avg_response_time_ms: (response_count > 0)
                .then(|| response_sum / response_count as f64),
            last_sweep_ms: state.last_sweep_ms,
        }
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Drop for ServiceHealthMonitor {
    fn drop(&mut self) {
        self.sweep_task.abort();
    }
}
