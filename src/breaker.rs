//! # Circuit Breakers for the Hot Data-Index Reads
//!
//! `get_data_attributes` and `get_data_parent` sit on every data-serving
//! request. When the data store degrades, these reads must fail fast and
//! report "unknown" instead of stacking up behind a 30-second busy timeout.
//!
//! State machine:
//!
//! ```text
//!            error rate ≥ 50% over the rolling window
//!   Closed ────────────────────────────────────────────► Open
//!     ▲                                                    │
//!     │ probe succeeds                 reset interval over │
//!     └──────────────────── HalfOpen ◄────────────────────┘
//!                              │ probe fails → Open again
//! ```
//!
//! An open breaker yields `None` — the caller MUST read that as "unknown",
//! never as "absent". Individual call failures and timeouts also yield
//! `None`; only the outcome bookkeeping differs.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;

// =============================================================================
// Configuration
// =============================================================================

/// Breaker tuning. The defaults match the serving path's tolerances: a 5 s
/// rolling window tripping at half errors, a 10 s cool-off before a probe.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Per-call timeout; an expired call counts as a failure.
    pub call_timeout: Duration,
    /// Rolling window over which the error rate is computed.
    pub window: Duration,
    /// Error fraction within the window that trips the breaker.
    pub error_threshold: f64,
    /// Outcomes required in the window before the rate is meaningful.
    pub min_samples: usize,
    /// How long the breaker stays open before a half-open probe.
    pub reset_after: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_millis(500),
            window: Duration::from_secs(5),
            error_threshold: 0.5,
            min_samples: 4,
            reset_after: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Circuit Breaker
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: State,
    opened_at: Option<Instant>,
    /// (when, succeeded) outcomes within the rolling window.
    outcomes: VecDeque<(Instant, bool)>,
}

/// A rolling-window circuit breaker returning `None` for any non-success.
pub struct CircuitBreaker {
    name: &'static str,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: BreakerConfig) -> Self {
        Self {
            name,
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                opened_at: None,
                outcomes: VecDeque::new(),
            }),
        }
    }

    /// Runs `fut` under the breaker.
    ///
    /// Open breaker: the future is not polled, `None` comes back immediately.
    /// Otherwise the call runs under the configured timeout; errors and
    /// expiries record a failure and come back as `None`.
    pub async fn call<T, F>(&self, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T>>,
    {
        if !self.admit() {
            debug!(breaker = self.name, "open, reporting unknown");
            return None;
        }

        let outcome = tokio::time::timeout(self.config.call_timeout, fut).await;
        match outcome {
            Ok(Ok(value)) => {
                self.record(true);
                Some(value)
            }
            Ok(Err(e)) => {
                debug!(breaker = self.name, error = %e, "call failed");
                self.record(false);
                None
            }
            Err(_) => {
                debug!(breaker = self.name, "call timed out");
                self.record(false);
                None
            }
        }
    }

    /// Whether a call may proceed; transitions Open → HalfOpen when the
    /// cool-off has elapsed (that caller becomes the probe).
    fn admit(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            State::Closed => true,
            State::HalfOpen => false, // one probe in flight already
            State::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.reset_after {
                    inner.state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record(&self, success: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");

        match inner.state {
            State::HalfOpen => {
                if success {
                    debug!(breaker = self.name, "probe succeeded, closing");
                    inner.state = State::Closed;
                    inner.opened_at = None;
                    inner.outcomes.clear();
                } else {
                    warn!(breaker = self.name, "probe failed, reopening");
                    inner.state = State::Open;
                    inner.opened_at = Some(now);
                }
            }
            State::Closed => {
                inner.outcomes.push_back((now, success));
                if let Some(horizon) = now.checked_sub(self.config.window) {
                    while matches!(inner.outcomes.front(), Some((at, _)) if *at < horizon) {
                        inner.outcomes.pop_front();
                    }
                }

                let total = inner.outcomes.len();
                let failures = inner.outcomes.iter().filter(|(_, ok)| !ok).count();
                if total >= self.config.min_samples
                    && failures as f64 / total as f64 >= self.config.error_threshold
                {
                    warn!(
                        breaker = self.name,
                        failures, total, "error rate tripped the breaker"
                    );
                    inner.state = State::Open;
                    inner.opened_at = Some(now);
                    inner.outcomes.clear();
                }
            }
            State::Open => {}
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn test_config() -> BreakerConfig {
        BreakerConfig {
            call_timeout: Duration::from_millis(100),
            window: Duration::from_secs(5),
            error_threshold: 0.5,
            min_samples: 4,
            reset_after: Duration::from_secs(10),
        }
    }

    async fn ok_call(breaker: &CircuitBreaker) -> Option<u32> {
        breaker.call(async { Ok(42u32) }).await
    }

    async fn failing_call(breaker: &CircuitBreaker) -> Option<u32> {
        breaker
            .call(async { Err::<u32, _>(Error::Schema("boom".into())) })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_breaker_passes_values_and_swallows_errors() {
        let breaker = CircuitBreaker::new("test", test_config());
        assert_eq!(ok_call(&breaker).await, Some(42));
        assert_eq!(failing_call(&breaker).await, None);
        // One failure out of two is under threshold-with-min-samples.
        assert_eq!(ok_call(&breaker).await, Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_rate_trips_and_open_short_circuits() {
        let breaker = CircuitBreaker::new("test", test_config());
        for _ in 0..4 {
            failing_call(&breaker).await;
        }
        // Tripped: even a would-succeed call reports unknown without running.
        assert_eq!(ok_call(&breaker).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let breaker = CircuitBreaker::new("test", test_config());
        for _ in 0..4 {
            let hung = breaker.call(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(1u32)
            });
            assert_eq!(hung.await, None);
        }
        assert_eq!(ok_call(&breaker).await, None, "breaker tripped on timeouts");
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_closes_on_success() {
        let breaker = CircuitBreaker::new("test", test_config());
        for _ in 0..4 {
            failing_call(&breaker).await;
        }
        assert_eq!(ok_call(&breaker).await, None);

        tokio::time::advance(Duration::from_secs(11)).await;
        // The probe runs and succeeds, closing the breaker.
        assert_eq!(ok_call(&breaker).await, Some(42));
        assert_eq!(ok_call(&breaker).await, Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_reopens_on_failure() {
        let breaker = CircuitBreaker::new("test", test_config());
        for _ in 0..4 {
            failing_call(&breaker).await;
        }

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(failing_call(&breaker).await, None); // probe fails
        assert_eq!(ok_call(&breaker).await, None, "reopened after failed probe");

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(ok_call(&breaker).await, Some(42), "second probe closes");
    }
}
