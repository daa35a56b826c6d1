use std::time::Duration;
use thiserror::Error;

/// Boxed error type for operations guarded by this layer.
///
/// The underlying operation's own error is carried through unchanged; the
/// resilience layer never inspects or rewrites it.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Unified error type for the resilience layer.
///
/// `CircuitOpen`, `TooManyRequests`, `RateLimited` and `QueueFull` are
/// control-flow rejections: they are raised *before* the guarded operation
/// runs and never invoke it. `Timeout` and `Operation` describe the outcome
/// of an operation that was admitted.
#[derive(Debug, Error)]
pub enum Error {
    #[error("circuit breaker for '{service}' is open; retry in {retry_after_ms}ms")]
    CircuitOpen {
        service: String,
        retry_after_ms: u64,
    },

    #[error("too many concurrent requests for '{service}' ({in_flight}/{max_concurrent})")]
    TooManyRequests {
        service: String,
        in_flight: u32,
        max_concurrent: u32,
    },

    #[error("rate limited for '{service}'{}", retry_after_ms.map(|ms| format!("; retry in {}ms", ms)).unwrap_or_default())]
    RateLimited {
        service: String,
        retry_after_ms: Option<u64>,
    },

    #[error("request queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("request completion channel closed before a result was delivered")]
    ChannelClosed,

    #[error("operation timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error(transparent)]
    Operation(BoxError),
}

impl Error {
    /// Wrap an underlying operation error without modifying it.
    pub fn operation(err: impl Into<BoxError>) -> Self {
        Error::Operation(err.into())
    }

    /// True for control-flow rejections raised before the guarded operation
    /// ran. Callers typically treat these as a signal to degrade rather than
    /// as an operation failure.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::CircuitOpen { .. }
                | Error::TooManyRequests { .. }
                | Error::RateLimited { .. }
                | Error::QueueFull { .. }
        )
    }

    /// True if the error is a per-attempt timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}
