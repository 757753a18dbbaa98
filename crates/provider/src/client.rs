//! Process-wide outbound HTTP client and the per-provider breaker registry.

use ccproxy_core::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use ccproxy_core::error::ProxyError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_MAX_IDLE_PER_HOST: usize = 8;

/// Build the shared outbound client: bounded idle pool, keep-alive, optional
/// egress proxy. Per-attempt deadlines are applied per request, not here.
pub fn build_http_client(proxy_url: Option<&str>) -> Result<reqwest::Client, ProxyError> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .tcp_keepalive(Duration::from_secs(60));

    if let Some(url) = proxy_url {
        let proxy = reqwest::Proxy::all(url)
            .map_err(|e| ProxyError::config(format!("invalid proxy url: {e}")))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| ProxyError::config(format!("failed to build HTTP client: {e}")))
}

/// Lazily-created circuit breakers, one per provider name. Two providers
/// sharing a hostname still get independent breakers.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().expect("breaker registry lock poisoned");
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    /// Current state per provider, for readiness introspection.
    pub fn states(&self) -> HashMap<String, CircuitState> {
        let breakers = self.breakers.lock().expect("breaker registry lock poisoned");
        breakers
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.state()))
            .collect()
    }
}
