//! Per-provider circuit breakers: closed / open / half-open.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    recovery_probe_interval: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_probe_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
            failure_threshold,
            recovery_probe_interval,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state, transitioning Open → Half-Open once the probe interval
    /// has elapsed. Must be called with the lock held.
    fn current_state(inner: &mut BreakerInner, probe_interval: Duration) -> CircuitState {
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|at| at.elapsed())
                .unwrap_or(Duration::MAX);
            if elapsed >= probe_interval {
                inner.state = CircuitState::HalfOpen;
            }
        }
        inner.state
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        Self::current_state(&mut inner, self.recovery_probe_interval)
    }

    /// Whether a request may be sent. Half-open admits probes without
    /// serializing them; a small probe burst is acceptable.
    pub fn allow(&self) -> bool {
        let mut inner = self.lock();
        match Self::current_state(&mut inner, self.recovery_probe_interval) {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            // Probe succeeded.
            inner.state = CircuitState::Closed;
            inner.consecutive_failures = 0;
            inner.opened_at = None;
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                // Probe failed.
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::Open => {}
        }
    }
}

/// Lazily-created breaker per provider name.
#[derive(Debug)]
pub struct HealthTracker {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    failure_threshold: u32,
    recovery_probe_interval: Duration,
}

impl HealthTracker {
    pub fn new(failure_threshold: u32, recovery_probe_interval: Duration) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            failure_threshold,
            recovery_probe_interval,
        }
    }

    pub fn breaker(&self, provider: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().unwrap_or_else(|e| e.into_inner());
            if let Some(breaker) = breakers.get(provider) {
                return breaker.clone();
            }
        }

        let mut breakers = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        // Re-check after taking the write lock.
        if let Some(breaker) = breakers.get(provider) {
            return breaker.clone();
        }
        let breaker = Arc::new(CircuitBreaker::new(
            self.failure_threshold,
            self.recovery_probe_interval,
        ));
        breakers.insert(provider.to_string(), breaker.clone());
        breaker
    }

    pub fn is_available(&self, provider: &str) -> bool {
        self.breaker(provider).allow()
    }

    pub fn record_success(&self, provider: &str) {
        self.breaker(provider).record_success();
    }

    pub fn record_failure(&self, provider: &str) {
        self.breaker(provider).record_failure();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(breaker.allow());
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.allow());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn open_transitions_to_half_open_after_probe_interval() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure();
        assert!(!breaker.allow());
        std::thread::sleep(Duration::from_millis(15));
        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_success_closes_and_resets() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(1));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        // Counter was reset: one new failure must not reopen at threshold 2.
        let breaker = CircuitBreaker::new(2, Duration::from_millis(1));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        breaker.record_failure(); // half-open probe failure reopens
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(1));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn closed_success_does_not_reset_counter() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        // Two cumulative failures: successes in Closed do not reset.
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn tracker_creates_one_breaker_per_provider() {
        let tracker = HealthTracker::new(5, Duration::from_secs(15));
        let a = tracker.breaker("openai");
        let b = tracker.breaker("openai");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(tracker.is_available("anthropic"));
    }
}
