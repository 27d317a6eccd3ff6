//! # Circuit Breaker Implementation
//!
//! Per-operation fault isolation with three states: Closed (calls pass),
//! Open (calls fail fast) and Half-Open (a bounded number of probes test
//! recovery).
//!
//! The circuit opens on a failure *ratio* over a rolling window of the most
//! recent outcomes, once the window holds at least `min_samples` entries.
//! State transitions happen under a per-breaker mutex; the current state is
//! mirrored into an atomic so hot-path readers never take the lock.

use crate::resilience::{CircuitBreakerConfig, CircuitBreakerMetrics};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Lock-free counters for lifetime metrics
#[derive(Debug, Default)]
struct AtomicCounters {
    total_calls: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    timeout_count: AtomicU64,
    rejected_count: AtomicU64,
    fallback_count: AtomicU64,
    total_duration_nanos: AtomicU64,
}

impl AtomicCounters {
    #[inline]
    fn record(&self, failed: bool, timed_out: bool, duration: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.success_count.fetch_add(1, Ordering::Relaxed);
        }
        if timed_out {
            self.timeout_count.fetch_add(1, Ordering::Relaxed);
        }
        self.total_duration_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }
}

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed = 0,
    /// Failure mode - all calls fail fast without executing
    Open = 1,
    /// Testing recovery - limited probes allowed through
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        })
    }
}

/// Errors produced by a guarded call when no fallback is supplied
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// Circuit is open (or probe slots are exhausted); the call was not made
    #[error("Circuit breaker is open for {operation_key}")]
    Open { operation_key: String },

    /// The call did not finish before its deadline
    #[error("Guarded call timed out for {operation_key}")]
    TimedOut { operation_key: String },

    /// Operation failed and was recorded
    #[error("Operation failed: {0}")]
    Failed(E),
}

/// Why a fallback was invoked
#[derive(Debug)]
pub enum FallbackCause<E> {
    Open,
    Failed(E),
    TimedOut,
}

#[derive(Debug, Clone, Copy)]
struct Outcome {
    failed: bool,
    at: Instant,
}

#[derive(Debug)]
struct WindowState {
    outcomes: VecDeque<Outcome>,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
    probe_successes: u32,
    /// Bumped on every transition so outcomes admitted under an earlier
    /// state cannot influence the current one
    generation: u64,
}

impl WindowState {
    fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| o.failed).count()
    }

    fn failure_ratio(&self) -> f64 {
        if self.outcomes.is_empty() {
            0.0
        } else {
            self.failures() as f64 / self.outcomes.len() as f64
        }
    }
}

/// Core circuit breaker for one operation key
#[derive(Debug)]
pub struct CircuitBreaker {
    operation_key: String,
    state: AtomicU8,
    config: CircuitBreakerConfig,
    window: Mutex<WindowState>,
    counters: AtomicCounters,
}

/// Admission ticket for one guarded call
///
/// Settle it with [`CallPermit::success`] or [`CallPermit::failure`]. A
/// permit dropped unsettled (for example because the caller's future was
/// cancelled) gives its probe slot back without recording an outcome.
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    generation: u64,
    started: Instant,
    settled: bool,
}

impl CallPermit<'_> {
    /// Whether this call is a half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settle(false, false);
    }

    pub fn failure(mut self) {
        self.settle(true, false);
    }

    fn timed_out(mut self) {
        self.settle(true, true);
    }

    fn settle(&mut self, failed: bool, timed_out: bool) {
        self.settled = true;
        let duration = self.started.elapsed();
        self.breaker
            .record(self.probe, self.generation, failed, timed_out, duration);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe(self.generation);
        }
    }
}

impl CircuitBreaker {
    pub fn new(operation_key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let operation_key = operation_key.into();
        debug!(
            operation_key = %operation_key,
            failure_ratio_threshold = config.failure_ratio_threshold,
            window_size = config.window_size,
            min_samples = config.min_samples,
            cooldown_ms = config.cooldown.as_millis() as u64,
            "Circuit breaker initialized"
        );

        Self {
            operation_key,
            state: AtomicU8::new(CircuitState::Closed as u8),
            config,
            window: Mutex::new(WindowState {
                outcomes: VecDeque::new(),
                opened_at: None,
                probes_in_flight: 0,
                probe_successes: 0,
                generation: 0,
            }),
            counters: AtomicCounters::default(),
        }
    }

    /// Get current circuit state
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    pub fn operation_key(&self) -> &str {
        &self.operation_key
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Execute `call` under breaker protection
    ///
    /// The call is bounded by the earlier of `deadline` and the configured
    /// call timeout; a timeout is recorded as a failure. When the circuit
    /// rejects the call, or the call fails or times out, `fallback` (if
    /// given) produces the result instead of an error. The call is never
    /// invoked while the circuit is open.
    pub async fn execute<T, E, F, Fut, FB>(
        &self,
        call: F,
        fallback: Option<FB>,
        deadline: Option<Instant>,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce(FallbackCause<E>) -> T,
    {
        let deadline = self.effective_deadline(deadline);

        if let Some(deadline) = deadline {
            if deadline <= Instant::now() {
                debug!(operation_key = %self.operation_key, "Deadline already passed, call skipped");
                return self.fall_back(fallback, FallbackCause::TimedOut);
            }
        }

        let Some(permit) = self.try_acquire() else {
            return self.fall_back(fallback, FallbackCause::Open);
        };

        let result = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, call()).await.ok(),
            None => Some(call().await),
        };

        match result {
            Some(Ok(value)) => {
                permit.success();
                Ok(value)
            }
            Some(Err(err)) => {
                permit.failure();
                self.fall_back(fallback, FallbackCause::Failed(err))
            }
            None => {
                permit.timed_out();
                self.fall_back(fallback, FallbackCause::TimedOut)
            }
        }
    }

    /// Execute without fallback or caller deadline
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute(operation, None::<fn(FallbackCause<E>) -> T>, None)
            .await
    }

    /// Admit a call for manual recording, or `None` if the circuit rejects it
    pub fn try_acquire(&self) -> Option<CallPermit<'_>> {
        let now = Instant::now();
        let mut window = self.window.lock();

        let admitted = match self.state() {
            CircuitState::Closed => Some(false),
            CircuitState::Open => {
                let cooled_down = window
                    .opened_at
                    .map(|opened_at| now.duration_since(opened_at) >= self.config.cooldown)
                    .unwrap_or(true);
                if cooled_down {
                    self.transition_to_half_open(&mut window);
                    window.probes_in_flight = 1;
                    Some(true)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                if window.probes_in_flight < self.config.half_open_max_probes {
                    window.probes_in_flight += 1;
                    Some(true)
                } else {
                    if self.config.reopen_on_probe_overflow {
                        warn!(
                            operation_key = %self.operation_key,
                            probes_in_flight = window.probes_in_flight,
                            "Probe limit exceeded while half-open, reopening"
                        );
                        self.transition_to_open(&mut window, now);
                    }
                    None
                }
            }
        };

        match admitted {
            Some(probe) => Some(CallPermit {
                breaker: self,
                probe,
                generation: window.generation,
                started: now,
                settled: false,
            }),
            None => {
                self.counters.rejected_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Check whether a call would currently be admitted, without admitting it
    pub fn should_allow(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let window = self.window.lock();
                window
                    .opened_at
                    .map(|opened_at| opened_at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true)
            }
            CircuitState::HalfOpen => {
                self.window.lock().probes_in_flight < self.config.half_open_max_probes
            }
        }
    }

    fn effective_deadline(&self, deadline: Option<Instant>) -> Option<Instant> {
        let timeout_deadline = self.config.call_timeout.map(|t| Instant::now() + t);
        match (deadline, timeout_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn fall_back<T, E, FB>(
        &self,
        fallback: Option<FB>,
        cause: FallbackCause<E>,
    ) -> Result<T, BreakerError<E>>
    where
        FB: FnOnce(FallbackCause<E>) -> T,
    {
        if let Some(fallback) = fallback {
            self.counters.fallback_count.fetch_add(1, Ordering::Relaxed);
            return Ok(fallback(cause));
        }

        Err(match cause {
            FallbackCause::Open => BreakerError::Open {
                operation_key: self.operation_key.clone(),
            },
            FallbackCause::TimedOut => BreakerError::TimedOut {
                operation_key: self.operation_key.clone(),
            },
            FallbackCause::Failed(err) => BreakerError::Failed(err),
        })
    }

    fn record(
        &self,
        probe: bool,
        generation: u64,
        failed: bool,
        timed_out: bool,
        duration: Duration,
    ) {
        self.counters.record(failed, timed_out, duration);

        let now = Instant::now();
        let mut window = self.window.lock();

        if window.generation != generation {
            debug!(
                operation_key = %self.operation_key,
                failed,
                "Outcome from a previous breaker state ignored"
            );
            return;
        }

        if probe {
            window.probes_in_flight = window.probes_in_flight.saturating_sub(1);
            if failed {
                self.transition_to_open(&mut window, now);
            } else {
                window.probe_successes += 1;
                if window.probe_successes >= self.config.success_threshold {
                    self.transition_to_closed(&mut window);
                }
            }
            return;
        }

        if self.state() != CircuitState::Closed {
            return;
        }

        window.outcomes.push_back(Outcome { failed, at: now });
        self.prune(&mut window, now);

        let samples = window.outcomes.len();
        if samples >= self.config.min_samples
            && window.failure_ratio() >= self.config.failure_ratio_threshold
        {
            self.transition_to_open(&mut window, now);
        }
    }

    fn release_probe(&self, generation: u64) {
        let mut window = self.window.lock();
        if window.generation == generation {
            window.probes_in_flight = window.probes_in_flight.saturating_sub(1);
        }
    }

    fn prune(&self, window: &mut WindowState, now: Instant) {
        while window.outcomes.len() > self.config.window_size {
            window.outcomes.pop_front();
        }
        if let Some(max_age) = self.config.window_duration {
            while window
                .outcomes
                .front()
                .is_some_and(|o| now.duration_since(o.at) > max_age)
            {
                window.outcomes.pop_front();
            }
        }
    }

    fn transition_to_closed(&self, window: &mut WindowState) {
        window.outcomes.clear();
        window.opened_at = None;
        window.probes_in_flight = 0;
        window.probe_successes = 0;
        window.generation += 1;
        self.state
            .store(CircuitState::Closed as u8, Ordering::Release);

        info!(
            operation_key = %self.operation_key,
            total_calls = self.counters.total_calls.load(Ordering::Relaxed),
            "Circuit breaker closed (recovered)"
        );
    }

    fn transition_to_open(&self, window: &mut WindowState, now: Instant) {
        let samples = window.outcomes.len();
        let failure_ratio = window.failure_ratio();

        window.opened_at = Some(now);
        window.probes_in_flight = 0;
        window.probe_successes = 0;
        window.generation += 1;
        self.state.store(CircuitState::Open as u8, Ordering::Release);

        error!(
            operation_key = %self.operation_key,
            samples,
            failure_ratio,
            cooldown_ms = self.config.cooldown.as_millis() as u64,
            "Circuit breaker opened (failing fast)"
        );
    }

    fn transition_to_half_open(&self, window: &mut WindowState) {
        window.probes_in_flight = 0;
        window.probe_successes = 0;
        window.generation += 1;
        self.state
            .store(CircuitState::HalfOpen as u8, Ordering::Release);

        info!(
            operation_key = %self.operation_key,
            max_probes = self.config.half_open_max_probes,
            success_threshold = self.config.success_threshold,
            "Circuit breaker half-open (probing)"
        );
    }

    /// Force circuit to open state (for emergency situations)
    pub fn force_open(&self) {
        warn!(operation_key = %self.operation_key, "Circuit breaker forced open");
        let mut window = self.window.lock();
        self.transition_to_open(&mut window, Instant::now());
    }

    /// Force circuit to closed state (for emergency recovery)
    pub fn force_closed(&self) {
        warn!(operation_key = %self.operation_key, "Circuit breaker forced closed");
        let mut window = self.window.lock();
        self.transition_to_closed(&mut window);
    }

    /// Get current metrics snapshot
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let (window_samples, window_failure_ratio) = {
            let window = self.window.lock();
            (window.outcomes.len(), window.failure_ratio())
        };

        let c = &self.counters;
        let total_calls = c.total_calls.load(Ordering::Relaxed);
        let success_count = c.success_count.load(Ordering::Relaxed);
        let failure_count = c.failure_count.load(Ordering::Relaxed);
        let total_duration_nanos = c.total_duration_nanos.load(Ordering::Relaxed);

        let (failure_rate, success_rate, average_duration) = if total_calls > 0 {
            (
                failure_count as f64 / total_calls as f64,
                success_count as f64 / total_calls as f64,
                Duration::from_nanos(total_duration_nanos / total_calls),
            )
        } else {
            (0.0, 0.0, Duration::ZERO)
        };

        CircuitBreakerMetrics {
            total_calls,
            success_count,
            failure_count,
            timeout_count: c.timeout_count.load(Ordering::Relaxed),
            rejected_count: c.rejected_count.load(Ordering::Relaxed),
            fallback_count: c.fallback_count.load(Ordering::Relaxed),
            window_samples,
            window_failure_ratio,
            total_duration: Duration::from_nanos(total_duration_nanos),
            current_state: self.state(),
            failure_rate,
            success_rate,
            average_duration,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.metrics().is_healthy()
    }
}
