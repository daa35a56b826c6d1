//! Bounded priority request queue with a fixed-size worker pool and
//! pluggable retry policies.
//!
//! The queue and the worker pool are the backpressure mechanism of this
//! layer: excess demand is rejected with `QueueFull` instead of buffered
//! unboundedly. Dispatch is cooperative: an owned task polls at a short fixed
//! interval and starts work whenever a worker slot and a queued request are
//! both available. Higher priority dispatches first; equal priority
//! dispatches in arrival order.

use crate::{BoxError, Error, Result};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Request priority. Ordered: `Critical` dispatches before `High`, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "Low"),
            Self::Normal => write!(f, "Normal"),
            Self::High => write!(f, "High"),
            Self::Critical => write!(f, "Critical"),
        }
    }
}

/// Retry policy applied by the queue after a failed attempt. Retries are
/// strictly local to the queue; the other components never retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Fail immediately on the first attempt error.
    None,
    /// Retry up to `max_retries` times with a constant delay.
    Fixed { max_retries: u32, delay: Duration },
    /// Retry up to `max_retries` times with exponential backoff:
    /// `delay = min(max_delay, base_delay * 2^retry_count)`.
    Exponential {
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
    },
}

impl RetryPolicy {
    /// The delay before the next attempt, or `None` when retries are
    /// exhausted. `retry_count` is the number of retries already performed.
    pub fn next_delay(&self, retry_count: u32) -> Option<Duration> {
        match *self {
            RetryPolicy::None => None,
            RetryPolicy::Fixed { max_retries, delay } => (retry_count < max_retries).then_some(delay),
            RetryPolicy::Exponential {
                max_retries,
                base_delay,
                max_delay,
            } => (retry_count < max_retries)
                .then(|| base_delay.saturating_mul(1u32 << retry_count.min(31)).min(max_delay)),
        }
    }
}

/// Configuration for [`RequestQueueManager`].
#[derive(Debug, Clone)]
pub struct RequestQueueConfig {
    /// Queue capacity; `enqueue` beyond it is rejected with `QueueFull`.
    pub max_queue_size: usize,
    /// Worker pool size: requests processed concurrently.
    pub max_concurrent_requests: usize,
    /// Dispatch polling interval.
    pub poll_interval: Duration,
    /// Completed-request history cap.
    pub history_size: usize,
    /// Smoothing factor of the average processing time.
    pub processing_time_alpha: f64,
}

impl Default for RequestQueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            max_concurrent_requests: 10,
            poll_interval: Duration::from_millis(10),
            history_size: 100,
            processing_time_alpha: 0.1,
        }
    }
}

impl RequestQueueConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the queue capacity.
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size.max(1);
        self
    }

    /// Set the worker pool size.
    pub fn with_max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max.max(1);
        self
    }

    /// Set the dispatch polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Record of a finished request, kept in a bounded rolling history.
#[derive(Debug, Clone, Serialize)]
pub struct CompletedRequest {
    pub id: Uuid,
    pub identifier: String,
    pub success: bool,
    pub processing_time_ms: u64,
    /// Unix timestamp in ms.
    pub completed_at_ms: u64,
    pub retry_count: u32,
}

/// Queue metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct QueueMetrics {
    pub queued: usize,
    pub processing: usize,
    pub max_queue_size: usize,
    pub max_concurrent_requests: usize,
    pub completed: u64,
    pub failed: u64,
    /// Completed / (completed + failed), once any request finished.
    pub success_rate: Option<f64>,
    /// Exponentially smoothed average processing time.
    pub avg_processing_ms: f64,
    pub queue_utilization: f64,
    pub worker_utilization: f64,
}

type AttemptFn = Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<(), Error>> + Send + Sync>;
type FailFn = Box<dyn FnOnce(Error) + Send>;

struct QueuedRequest {
    id: Uuid,
    identifier: String,
    priority: Priority,
    timeout: Duration,
    retry_policy: RetryPolicy,
    queued_at: Instant,
    retry_count: u32,
    /// Runs one attempt. Delivers the success value to the caller itself;
    /// returns the attempt error otherwise.
    attempt: AttemptFn,
    /// Resolves the caller's completion handle with the terminal error.
    fail: FailFn,
}

struct QueueInner {
    queue: VecDeque<QueuedRequest>,
    processing: usize,
    completed: u64,
    failed: u64,
    avg_processing_ms: f64,
    history: VecDeque<CompletedRequest>,
}

struct Shared {
    config: RequestQueueConfig,
    inner: Mutex<QueueInner>,
}

/// Bounded priority queue with a fixed-size worker pool.
///
/// `enqueue` suspends until the submitted operation completes, fails
/// terminally, or exhausts its retries; the only timeout involved is the
/// per-attempt execution timeout. Once accepted, a request is not cancelled
/// by the caller going away: dropping the `enqueue` future abandons the
/// completion handle but the request still runs to its terminal outcome.
pub struct RequestQueueManager {
    shared: Arc<Shared>,
    dispatch_task: JoinHandle<()>,
}

impl RequestQueueManager {
    /// Create a manager and start its dispatch task. Must be called within a
    /// tokio runtime; the task is torn down on drop.
    pub fn new(config: RequestQueueConfig) -> Self {
        let shared = Arc::new(Shared {
            config,
            inner: Mutex::new(QueueInner {
                queue: VecDeque::new(),
                processing: 0,
                completed: 0,
                failed: 0,
                avg_processing_ms: 0.0,
                history: VecDeque::new(),
            }),
        });
        let dispatch_task = tokio::spawn(Self::dispatch_loop(Arc::clone(&shared)));
        Self {
            shared,
            dispatch_task,
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(RequestQueueConfig::default())
    }

    pub fn config(&self) -> &RequestQueueConfig {
        &self.shared.config
    }

    /// Submit `operation` for prioritized, retried execution and suspend
    /// until its terminal outcome.
    ///
    /// `operation` is a factory invoked once per attempt. A full queue
    /// rejects the submission with `QueueFull` before any request state is
    /// allocated and without disturbing already-queued requests.
    pub async fn enqueue<T, F, Fut>(
        &self,
        operation: F,
        priority: Priority,
        timeout: Duration,
        retry_policy: RetryPolicy,
        identifier: impl Into<String>,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, BoxError>> + Send + 'static,
    {
        let identifier = identifier.into();
        let rx = {
            let mut inner = self.shared.inner.lock().await;
            if inner.queue.len() >= self.shared.config.max_queue_size {
                debug!(
                    identifier = %identifier,
                    capacity = self.shared.config.max_queue_size,
                    "queue full, rejecting request"
                );
                return Err(Error::QueueFull {
                    capacity: self.shared.config.max_queue_size,
                });
            }

            let (tx, rx) = oneshot::channel::<Result<T>>();
            // The completion handle is resolved exactly once, by whichever of
            // the success path or the terminal-failure path runs.
            let tx = Arc::new(std::sync::Mutex::new(Some(tx)));

            let attempt: AttemptFn = {
                let tx = Arc::clone(&tx);
                Arc::new(move || {
                    let fut = operation();
                    let tx = Arc::clone(&tx);
                    Box::pin(async move {
                        match fut.await {
                            Ok(value) => {
                                if let Ok(mut slot) = tx.lock() {
                                    if let Some(tx) = slot.take() {
                                        let _ = tx.send(Ok(value));
                                    }
                                }
                                Ok(())
                            }
                            Err(err) => Err(Error::Operation(err)),
                        }
                    })
                })
            };
            let fail: FailFn = Box::new(move |err| {
                if let Ok(mut slot) = tx.lock() {
                    if let Some(tx) = slot.take() {
                        let _ = tx.send(Err(err));
                    }
                }
            });

            let request = QueuedRequest {
                id: Uuid::new_v4(),
                identifier: identifier.clone(),
                priority,
                timeout,
                retry_policy,
                queued_at: Instant::now(),
                retry_count: 0,
                attempt,
                fail,
            };
            debug!(
                id = %request.id,
                identifier = %identifier,
                priority = %priority,
                queued = inner.queue.len() + 1,
                "request enqueued"
            );
            Self::insert_by_priority(&mut inner.queue, request);
            rx
        };

        rx.await.map_err(|_| Error::ChannelClosed)?
    }

    /// FIFO within priority: a new request goes after every queued request
    /// of equal or higher priority.
    fn insert_by_priority(queue: &mut VecDeque<QueuedRequest>, request: QueuedRequest) {
        let pos = queue
            .iter()
            .position(|queued| queued.priority < request.priority)
            .unwrap_or(queue.len());
        queue.insert(pos, request);
    }

    async fn dispatch_loop(shared: Arc<Shared>) {
        let mut ticker = tokio::time::interval(shared.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            while let Some(request) = Self::next_ready(&shared).await {
                tokio::spawn(Self::run_request(Arc::clone(&shared), request));
            }
        }
    }

    async fn next_ready(shared: &Arc<Shared>) -> Option<QueuedRequest> {
        let mut inner = shared.inner.lock().await;
        if inner.processing >= shared.config.max_concurrent_requests {
            return None;
        }
        let request = inner.queue.pop_front()?;
        inner.processing += 1;
        Some(request)
    }

    async fn run_request(shared: Arc<Shared>, mut request: QueuedRequest) {
        let started = Instant::now();
        debug!(
            id = %request.id,
            identifier = %request.identifier,
            attempt = request.retry_count + 1,
            wait_ms = started.duration_since(request.queued_at).as_millis() as u64,
            "request dispatched"
        );

        let error = match tokio::time::timeout(request.timeout, (request.attempt)()).await {
            Ok(Ok(())) => {
                let QueuedRequest {
                    id,
                    identifier,
                    retry_count,
                    ..
                } = request;
                Self::record_finished(&shared, id, identifier, retry_count, started, true).await;
                return;
            }
            Ok(Err(err)) => err,
            Err(_) => Error::Timeout {
                timeout: request.timeout,
            },
        };

        match request.retry_policy.next_delay(request.retry_count) {
            Some(delay) => {
                info!(
                    id = %request.id,
                    identifier = %request.identifier,
                    retry = request.retry_count + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "attempt failed, scheduling retry"
                );
                {
                    let mut inner = shared.inner.lock().await;
                    inner.processing -= 1;
                }
                request.retry_count += 1;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let mut inner = shared.inner.lock().await;
                    // Re-admission of an already-accepted request bypasses
                    // the capacity check; its slot was granted on the
                    // original enqueue.
                    Self::insert_by_priority(&mut inner.queue, request);
                });
            }
            None => {
                warn!(
                    id = %request.id,
                    identifier = %request.identifier,
                    retries = request.retry_count,
                    error = %error,
                    "request failed terminally"
                );
                let QueuedRequest {
                    id,
                    identifier,
                    retry_count,
                    fail,
                    ..
                } = request;
                fail(error);
                Self::record_finished(&shared, id, identifier, retry_count, started, false).await;
            }
        }
    }

    async fn record_finished(
        shared: &Arc<Shared>,
        id: Uuid,
        identifier: String,
        retry_count: u32,
        started: Instant,
        success: bool,
    ) {
        let elapsed = started.elapsed();
        let mut inner = shared.inner.lock().await;
        inner.processing -= 1;
        if success {
            inner.completed += 1;
        } else {
            inner.failed += 1;
        }

        let elapsed_ms = elapsed.as_millis() as f64;
        let alpha = shared.config.processing_time_alpha;
        inner.avg_processing_ms = if inner.completed + inner.failed == 1 {
            elapsed_ms
        } else {
            (1.0 - alpha) * inner.avg_processing_ms + alpha * elapsed_ms
        };

        if inner.history.len() == shared.config.history_size {
            inner.history.pop_front();
        }
        inner.history.push_back(CompletedRequest {
            id,
            identifier,
            success,
            processing_time_ms: elapsed.as_millis() as u64,
            completed_at_ms: unix_ms(),
            retry_count,
        });
    }

    /// Current metrics snapshot.
    pub async fn metrics(&self) -> QueueMetrics {
        let inner = self.shared.inner.lock().await;
        let finished = inner.completed + inner.failed;
        QueueMetrics {
            queued: inner.queue.len(),
            processing: inner.processing,
            max_queue_size: self.shared.config.max_queue_size,
            max_concurrent_requests: self.shared.config.max_concurrent_requests,
            completed: inner.completed,
            failed: inner.failed,
            success_rate: (finished > 0).then(|| inner.completed as f64 / finished as f64),
            avg_processing_ms: inner.avg_processing_ms,
            queue_utilization: inner.queue.len() as f64 / self.shared.config.max_queue_size as f64,
            worker_utilization: inner.processing as f64
                / self.shared.config.max_concurrent_requests as f64,
        }
    }

    /// Recent completed/failed requests, oldest first (bounded history).
    pub async fn history(&self) -> Vec<CompletedRequest> {
        self.shared.inner.lock().await.history.iter().cloned().collect()
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Drop for RequestQueueManager {
    fn drop(&mut self) {
        self.dispatch_task.abort();
    }
}
