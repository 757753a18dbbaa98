use crate::error::ProxyError;
use serde_json::json;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
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

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub max_failures: u32,
    pub reset_timeout: Duration,
    pub half_open_timeout: Duration,
}

impl CircuitBreakerConfig {
    pub fn new(max_failures: u32, reset_timeout: Duration) -> Self {
        Self {
            max_failures,
            reset_timeout,
            half_open_timeout: reset_timeout / 2,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    state_changed_at: Instant,
}

/// Per-provider circuit breaker.
///
/// Only retryable failures count toward tripping. Timer-driven transitions
/// (open → half-open after `reset_timeout`, half-open → closed after
/// `half_open_timeout`) are applied lazily on the next observation.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
                state_changed_at: Instant::now(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, after applying any due timer transitions.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.advance_timers(&mut inner);
        inner.state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().expect("breaker lock poisoned").failure_count
    }

    fn advance_timers(&self, inner: &mut BreakerInner) {
        let elapsed = inner.state_changed_at.elapsed();
        match inner.state {
            CircuitState::Open if elapsed >= self.config.reset_timeout => {
                tracing::info!(circuit = %self.name, "circuit half-open, admitting probe");
                inner.state = CircuitState::HalfOpen;
                inner.state_changed_at = Instant::now();
            }
            CircuitState::HalfOpen if elapsed >= self.config.half_open_timeout => {
                tracing::info!(circuit = %self.name, "circuit closed after quiet half-open window");
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.state_changed_at = Instant::now();
            }
            _ => {}
        }
    }

    pub async fn execute<T, F, Fut>(&self, action: F) -> Result<T, ProxyError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ProxyError>>,
    {
        {
            let mut inner = self.inner.lock().expect("breaker lock poisoned");
            self.advance_timers(&mut inner);
            if inner.state == CircuitState::Open {
                // Not retryable: the caller's retry loop must surface this
                // immediately instead of hammering an open circuit.
                return Err(ProxyError::service_unavailable(format!(
                    "circuit breaker {} is open",
                    self.name
                ))
                .with_details(json!({"circuit": self.name, "state": "open"}))
                .with_retryable(false));
            }
        }

        match action().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(error) => {
                self.on_failure(error.retryable);
                Err(error)
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.advance_timers(&mut inner);
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                tracing::info!(circuit = %self.name, "probe succeeded, closing circuit");
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.state_changed_at = Instant::now();
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, retryable: bool) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.advance_timers(&mut inner);
        match inner.state {
            CircuitState::Closed => {
                if retryable {
                    inner.failure_count += 1;
                    inner.last_failure_at = Some(Instant::now());
                    if inner.failure_count >= self.config.max_failures {
                        tracing::warn!(
                            circuit = %self.name,
                            failures = inner.failure_count,
                            "failure threshold reached, opening circuit"
                        );
                        inner.state = CircuitState::Open;
                        inner.state_changed_at = Instant::now();
                    }
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(circuit = %self.name, "probe failed, reopening circuit");
                inner.state = CircuitState::Open;
                inner.last_failure_at = Some(Instant::now());
                inner.state_changed_at = Instant::now();
            }
            CircuitState::Open => {}
        }
    }
}
