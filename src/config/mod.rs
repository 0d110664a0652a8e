//! Application configuration.
//!
//! Loaded from a TOML file with documented defaults, then overridden by
//! `STREAMGATE_*` environment variables and finally by CLI flags. Every
//! timeout, TTL and worker knob the runtime uses lives here; nothing reads
//! the environment after startup.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub web: WebConfig,
    pub database: DatabaseConfig,
    pub fetch: FetchConfig,
    pub cache: CacheConfig,
    pub meta: MetaConfig,
    pub solver: SolverConfig,
    pub aggregator: AggregatorConfig,
    pub resolver: ResolverConfig,
    pub supervisor: SupervisorConfig,
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
    /// External base used when wrapping opaque URLs
    pub base_url: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7011,
            base_url: "http://localhost:7011".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./streamgate.db".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub retries: u32,
    /// First retry delay; subsequent delays double
    pub retry_backoff_ms: u64,
    pub max_body_bytes: usize,
    pub max_redirects: usize,
    pub user_agent: String,
    /// Outbound proxy for provider traffic, if any
    pub proxy_url: Option<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 8,
            retries: 1,
            retry_backoff_ms: 800,
            max_body_bytes: 2 * 1024 * 1024,
            max_redirects: 5,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0 Safari/537.36"
                .to_string(),
            proxy_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub meta_ttl_secs: u64,
    /// Default per-provider stream list TTL; providers may override
    pub streams_ttl_secs: u64,
    pub resolve_ttl_secs: u64,
    pub cookie_ttl_secs: u64,
    /// Bound per namespace in the in-process tier
    pub memory_max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            meta_ttl_secs: 3600,
            streams_ttl_secs: 6 * 3600,
            resolve_ttl_secs: 15 * 60,
            cookie_ttl_secs: 25 * 60,
            memory_max_entries: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub retries: u32,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            base_url: "https://v3-cinemeta.strem.io".to_string(),
            timeout_secs: 8,
            retries: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// External challenge-solver endpoint; empty disables solving
    pub url: Option<String>,
    pub session_ttl_secs: u64,
    /// `maxTimeout` forwarded to the solver, in milliseconds
    pub max_timeout_ms: u64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            url: None,
            session_ttl_secs: 600,
            max_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub deadline_secs: u64,
    pub provider_ceiling_secs: u64,
    /// Fraction of the deadline the metadata fetch may consume
    pub meta_deadline_fraction: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            deadline_secs: 30,
            provider_ceiling_secs: 20,
            meta_deadline_fraction: 0.25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub probe_batch: usize,
    pub probe_timeout_secs: u64,
    pub max_hops: usize,
    /// CDNs whose ranged-response behavior is assumed good; the probe is
    /// skipped for these
    pub trusted_hosts: Vec<String>,
    pub shortener_hosts: Vec<String>,
    pub intermediary_hosts: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            probe_batch: 2,
            probe_timeout_secs: 6,
            max_hops: 4,
            trusted_hosts: vec!["workers.dev".to_string(), "r2.dev".to_string()],
            shortener_hosts: vec![
                "ouo.io".to_string(),
                "ouo.press".to_string(),
                "shrinkme.io".to_string(),
            ],
            intermediary_hosts: vec![
                "gdflix".to_string(),
                "filesdl.in".to_string(),
                "filesdl.site".to_string(),
                "hubcloud".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// 0 = size from the formula below
    pub workers: usize,
    pub io_multiplier: usize,
    pub per_worker_memory_mb: u64,
    pub max_workers: usize,
    pub stagger_ms: u64,
    pub crash_window_secs: u64,
    pub max_restarts_in_window: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub drain_timeout_secs: u64,
    pub keep_alive_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            io_multiplier: 2,
            per_worker_memory_mb: 256,
            max_workers: 16,
            stagger_ms: 50,
            crash_window_secs: 60,
            max_restarts_in_window: 5,
            backoff_base_ms: 2_000,
            backoff_cap_ms: 30_000,
            drain_timeout_secs: 5,
            keep_alive_secs: 65,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub enabled: bool,
    /// Stream list TTL override for this provider
    #[serde(default)]
    pub streams_ttl_secs: Option<u64>,
    /// Background refresh overwrites cached entries instead of merging
    #[serde(default)]
    pub prefer_fresh: bool,
    /// Route every fetch through the solver; for permanently-challenged hosts
    #[serde(default)]
    pub solver_first: bool,
}

impl ProviderConfig {
    pub fn enabled_default(id: &str) -> Self {
        Self {
            id: id.to_string(),
            enabled: true,
            streams_ttl_secs: None,
            prefer_fresh: false,
            solver_first: false,
        }
    }
}

impl Config {
    /// Providers section defaulting to the full registry, all enabled.
    pub fn default_providers() -> Vec<ProviderConfig> {
        ["fourkhdhub", "moviesdrive", "uhdmovies"]
            .iter()
            .map(|id| ProviderConfig::enabled_default(id))
            .collect()
    }

    pub fn load(path: &str) -> Result<Self> {
        let mut config = if std::path::Path::new(path).exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str(&contents)?
        } else {
            let default_config = Self {
                providers: Self::default_providers(),
                ..Self::default()
            };
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::write(path, contents)?;
            default_config
        };

        if config.providers.is_empty() {
            config.providers = Self::default_providers();
        }
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// `STREAMGATE_*` environment overrides, applied after file load.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("STREAMGATE_HOST") {
            self.web.host = v;
        }
        if let Ok(v) = std::env::var("STREAMGATE_PORT") {
            if let Ok(port) = v.parse() {
                self.web.port = port;
            }
        }
        if let Ok(v) = std::env::var("STREAMGATE_BASE_URL") {
            self.web.base_url = v;
        }
        if let Ok(v) = std::env::var("STREAMGATE_DATABASE_URL") {
            self.database.url = v;
        }
        if let Ok(v) = std::env::var("STREAMGATE_SOLVER_URL") {
            self.solver.url = if v.is_empty() { None } else { Some(v) };
        }
        if let Ok(v) = std::env::var("STREAMGATE_PROXY_URL") {
            self.fetch.proxy_url = if v.is_empty() { None } else { Some(v) };
        }
        if let Ok(v) = std::env::var("STREAMGATE_WORKERS") {
            if let Ok(workers) = v.parse() {
                self.supervisor.workers = workers;
            }
        }
        if let Ok(v) = std::env::var("STREAMGATE_STREAMS_TTL_SECS") {
            if let Ok(ttl) = v.parse() {
                self.cache.streams_ttl_secs = ttl;
            }
        }
        if let Ok(v) = std::env::var("STREAMGATE_RESOLVE_TTL_SECS") {
            if let Ok(ttl) = v.parse() {
                self.cache.resolve_ttl_secs = ttl;
            }
        }
        // Comma-separated allowlist: providers absent from the list are
        // disabled, unknown names are ignored.
        if let Ok(v) = std::env::var("STREAMGATE_PROVIDERS") {
            let enabled: Vec<&str> = v.split(',').map(str::trim).collect();
            for provider in &mut self.providers {
                provider.enabled = enabled.contains(&provider.id.as_str());
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.aggregator.meta_deadline_fraction) {
            anyhow::bail!("aggregator.meta_deadline_fraction must be within 0.0..=1.0");
        }
        if self.resolver.probe_batch == 0 {
            anyhow::bail!("resolver.probe_batch must be at least 1");
        }
        Ok(())
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }

    pub fn streams_ttl(&self, provider_id: &str) -> Duration {
        let secs = self
            .provider(provider_id)
            .and_then(|p| p.streams_ttl_secs)
            .unwrap_or(self.cache.streams_ttl_secs);
        Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documented_defaults() {
        let config = Config::default();
        assert_eq!(config.fetch.timeout_secs, 8);
        assert_eq!(config.fetch.retries, 1);
        assert_eq!(config.fetch.max_body_bytes, 2 * 1024 * 1024);
        assert_eq!(config.fetch.max_redirects, 5);
        assert_eq!(config.cache.meta_ttl_secs, 3600);
        assert_eq!(config.cache.streams_ttl_secs, 6 * 3600);
        assert_eq!(config.cache.cookie_ttl_secs, 25 * 60);
        assert_eq!(config.aggregator.provider_ceiling_secs, 20);
        assert_eq!(config.resolver.probe_batch, 2);
        assert_eq!(config.supervisor.stagger_ms, 50);
        assert_eq!(config.supervisor.max_restarts_in_window, 5);
        assert_eq!(config.supervisor.backoff_base_ms, 2_000);
        assert_eq!(config.supervisor.backoff_cap_ms, 30_000);
        assert_eq!(config.supervisor.drain_timeout_secs, 5);
        assert_eq!(config.supervisor.keep_alive_secs, 65);
    }

    #[test]
    fn provider_ttl_override() {
        let mut config = Config {
            providers: Config::default_providers(),
            ..Config::default()
        };
        config.providers[0].streams_ttl_secs = Some(60);
        assert_eq!(config.streams_ttl(&config.providers[0].id.clone()), Duration::from_secs(60));
        assert_eq!(
            config.streams_ttl("moviesdrive"),
            Duration::from_secs(6 * 3600)
        );
    }

    #[test]
    fn toml_round_trip() {
        let config = Config {
            providers: Config::default_providers(),
            ..Config::default()
        };
        let rendered = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.providers.len(), 3);
        assert_eq!(parsed.web.port, config.web.port);
    }
}
