use crate::breaker::CircuitBreakerConfig;
use crate::retry::RetryPolicy;
use arc_swap::ArcSwap;
use notify::{RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Digest;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

// ─── Route keys ────────────────────────────────────────────────────────────

pub const ROUTE_DEFAULT: &str = "default";
pub const ROUTE_LONG_CONTEXT: &str = "longContext";
pub const ROUTE_BACKGROUND: &str = "background";
pub const ROUTE_THINK: &str = "think";

// ─── Config ────────────────────────────────────────────────────────────────

/// Immutable configuration snapshot. Loaded at init, swapped atomically on
/// reload; readers hold one snapshot for the duration of a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub providers: Vec<ProviderConfig>,
    /// Route table keyed by `default`, `longContext`, `background`, `think`,
    /// or an exact model name.
    pub routes: HashMap<String, RouteEntry>,
    pub performance: PerformanceConfig,
    pub security: SecurityConfig,
    pub proxy_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3456,
            providers: Vec::new(),
            routes: HashMap::new(),
            performance: PerformanceConfig::default(),
            security: SecurityConfig::default(),
            proxy_url: None,
        }
    }
}

impl Config {
    /// Load config from a YAML file, sanitize, and validate.
    pub fn load(path: &str) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml_ng::from_str(&contents)?;
        config.sanitize();
        config.validate()?;
        Ok(config)
    }

    fn sanitize(&mut self) {
        for provider in &mut self.providers {
            while provider.base_url.ends_with('/') {
                provider.base_url.pop();
            }
        }
    }

    fn validate(&self) -> Result<(), anyhow::Error> {
        let mut names = HashSet::new();
        for provider in &self.providers {
            anyhow::ensure!(!provider.name.is_empty(), "provider with empty name");
            anyhow::ensure!(
                names.insert(provider.name.as_str()),
                "duplicate provider name: {}",
                provider.name
            );
        }
        for (key, route) in &self.routes {
            anyhow::ensure!(
                names.contains(route.provider.as_str()),
                "route {key} references unknown provider {}",
                route.provider
            );
        }
        Ok(())
    }

    pub fn find_provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    pub fn route(&self, key: &str) -> Option<&RouteEntry> {
        self.routes.get(key)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let retry = &self.performance.retry;
        RetryPolicy {
            max_attempts: retry.max_attempts,
            initial_delay: Duration::from_millis(retry.initial_delay),
            max_delay: Duration::from_millis(retry.max_delay),
            multiplier: retry.multiplier,
            jitter: retry.jitter,
            retryable_kinds: None,
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        let cb = &self.performance.circuit_breaker;
        CircuitBreakerConfig::new(cb.threshold, Duration::from_secs(cb.reset_timeout))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.performance.request_timeout)
    }
}

// ─── Providers ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProviderConfig {
    /// Unique provider identity; also selects the endpoint path and auth
    /// header variant for well-known names.
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    /// Models this provider accepts. Empty means all.
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Ordered transformer chain. Empty selects the default chain for the
    /// provider family.
    #[serde(default)]
    pub transformers: Vec<TransformerSpec>,
}

impl ProviderConfig {
    pub fn allows_model(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }
}

/// A transformer chain entry: either a bare name or `{name, options}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "TransformerSpecRepr")]
pub struct TransformerSpec {
    pub name: String,
    pub options: Value,
}

impl TransformerSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: Value::Null,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TransformerSpecRepr {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        options: Value,
    },
}

impl From<TransformerSpecRepr> for TransformerSpec {
    fn from(repr: TransformerSpecRepr) -> Self {
        match repr {
            TransformerSpecRepr::Name(name) => Self {
                name,
                options: Value::Null,
            },
            TransformerSpecRepr::Full { name, options } => Self { name, options },
        }
    }
}

// ─── Routes ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RouteEntry {
    pub provider: String,
    pub model: String,
    /// Merged into the request document when the route fires, for keys the
    /// request does not already set.
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,
}

// ─── Performance ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PerformanceConfig {
    /// Whole-request deadline in seconds.
    pub request_timeout: u64,
    /// Inbound body cap in bytes.
    pub max_request_body_size: usize,
    /// Tolerated transient read errors per relayed stream.
    pub stream_error_budget: u32,
    pub circuit_breaker: CircuitBreakerSettings,
    pub retry: RetrySettings,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            request_timeout: 300,
            max_request_body_size: 10 * 1024 * 1024,
            stream_error_budget: 10,
            circuit_breaker: CircuitBreakerSettings::default(),
            retry: RetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CircuitBreakerSettings {
    pub enabled: bool,
    pub threshold: u32,
    /// Seconds an open circuit waits before admitting a probe.
    pub reset_timeout: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 5,
            reset_timeout: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    /// Milliseconds.
    pub initial_delay: u64,
    /// Milliseconds.
    pub max_delay: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: 500,
            max_delay: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

// ─── Security ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct SecurityConfig {
    /// Inbound API key. When unset, only loopback clients are accepted.
    pub api_key: Option<String>,
    pub ip_allowlist: Vec<String>,
}

// ─── Config Watcher ────────────────────────────────────────────────────────

pub struct ConfigWatcher {
    _watcher: notify::RecommendedWatcher,
}

impl ConfigWatcher {
    /// Watch a config file. On changes (debounced 150ms, SHA256 dedup),
    /// reload and atomically swap the snapshot in via ArcSwap. A reload that
    /// fails validation keeps the previous snapshot.
    pub fn start(
        path: String,
        config: Arc<ArcSwap<Config>>,
        on_reload: impl Fn(&Config) + Send + Sync + 'static,
    ) -> Result<Self, anyhow::Error> {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(16);

        let mut watcher = notify::recommended_watcher(move |res: Result<notify::Event, _>| {
            if let Ok(event) = res
                && (event.kind.is_modify() || event.kind.is_create())
            {
                let _ = tx.blocking_send(());
            }
        })?;
        watcher.watch(Path::new(&path), RecursiveMode::NonRecursive)?;

        tokio::spawn(async move {
            let mut last_hash: Option<[u8; 32]> = None;
            let mut debounce: Option<tokio::time::Instant> = None;

            loop {
                tokio::select! {
                    Some(()) = rx.recv() => {
                        debounce = Some(tokio::time::Instant::now() + Duration::from_millis(150));
                    }
                    _ = async {
                        match debounce {
                            Some(deadline) => tokio::time::sleep_until(deadline).await,
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        debounce = None;
                        match std::fs::read(&path) {
                            Ok(contents) => {
                                let hash: [u8; 32] = sha2::Sha256::digest(&contents).into();
                                if last_hash.as_ref() == Some(&hash) {
                                    continue;
                                }
                                last_hash = Some(hash);

                                match Config::load(&path) {
                                    Ok(new_cfg) => {
                                        tracing::info!("configuration reloaded");
                                        on_reload(&new_cfg);
                                        config.store(Arc::new(new_cfg));
                                    }
                                    Err(e) => {
                                        tracing::error!("config reload failed: {e}");
                                    }
                                }
                            }
                            Err(e) => tracing::error!("config file read failed: {e}"),
                        }
                    }
                }
            }
        });

        Ok(Self { _watcher: watcher })
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 3456);
        assert_eq!(cfg.performance.request_timeout, 300);
        assert_eq!(cfg.performance.stream_error_budget, 10);
        assert_eq!(cfg.performance.circuit_breaker.threshold, 5);
        assert_eq!(cfg.performance.retry.max_attempts, 3);
        assert!(cfg.security.api_key.is_none());
    }

    #[test]
    fn test_yaml_deserialization() {
        let yaml = r#"
host: "0.0.0.0"
port: 9000
providers:
  - name: openai
    base-url: "https://api.openai.com/"
    api-key: "test-key"
    models: ["gpt-4"]
    transformers:
      - openai
      - name: maxtoken
        options:
          max: 16384
routes:
  default:
    provider: openai
    model: gpt-4
  longContext:
    provider: openai
    model: gpt-4-32k
    parameters:
      temperature: 0.5
"#;
        let mut config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        config.sanitize();
        config.validate().unwrap();

        assert_eq!(config.port, 9000);
        let provider = config.find_provider("openai").unwrap();
        assert_eq!(provider.base_url, "https://api.openai.com");
        assert!(provider.enabled);
        assert_eq!(provider.transformers.len(), 2);
        assert_eq!(provider.transformers[0].name, "openai");
        assert_eq!(provider.transformers[1].options["max"], 16384);

        let long = config.route(ROUTE_LONG_CONTEXT).unwrap();
        assert_eq!(long.model, "gpt-4-32k");
        assert_eq!(long.parameters["temperature"], 0.5);
    }

    #[test]
    fn test_validate_rejects_duplicate_providers() {
        let cfg = Config {
            providers: vec![
                ProviderConfig {
                    name: "openai".into(),
                    base_url: "https://a".into(),
                    api_key: String::new(),
                    models: vec![],
                    enabled: true,
                    transformers: vec![],
                },
                ProviderConfig {
                    name: "openai".into(),
                    base_url: "https://b".into(),
                    api_key: String::new(),
                    models: vec![],
                    enabled: true,
                    transformers: vec![],
                },
            ],
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_route_provider() {
        let mut cfg = Config::default();
        cfg.routes.insert(
            ROUTE_DEFAULT.to_string(),
            RouteEntry {
                provider: "ghost".into(),
                model: "gpt-4".into(),
                parameters: Default::default(),
            },
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "providers:\n  - name: ollama\n    base-url: http://localhost:11434\n",
        )
        .unwrap();
        let cfg = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.providers.len(), 1);
        assert!(cfg.find_provider("ollama").unwrap().allows_model("llama3"));
    }

    #[test]
    fn test_model_allowlist() {
        let provider = ProviderConfig {
            name: "openai".into(),
            base_url: "https://api.openai.com".into(),
            api_key: String::new(),
            models: vec!["gpt-4".into()],
            enabled: true,
            transformers: vec![],
        };
        assert!(provider.allows_model("gpt-4"));
        assert!(!provider.allows_model("gpt-3.5-turbo"));
    }
}
