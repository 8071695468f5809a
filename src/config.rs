use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::resource;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Ordered list of upstream storage server base URLs.
    pub upstreams: Vec<String>,
    /// Registry UUIDs this proxy converges on.  Sorted and deduplicated at
    /// load time; fixed for the process lifetime.
    pub registries: Vec<String>,
    #[serde(default)]
    pub convergence: ConvergenceConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address the HTTP listener binds to.
    pub http_listen: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_listen: "0.0.0.0:8000".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Convergence loop
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    /// Interval (milliseconds) between convergence rounds.
    pub tick_interval_ms: u64,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
        }
    }
}

impl ConvergenceConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Fetch engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Number of coordination shards.  Must be a power of two.
    pub shard_count: usize,
    /// Deadline (seconds) for a single upstream HEAD probe.
    pub head_timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            shard_count: 1024,
            head_timeout_secs: 30,
        }
    }
}

impl FetchConfig {
    pub fn head_timeout(&self) -> Duration {
        Duration::from_secs(self.head_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding published cache entries.
    pub cache_dir: String,
    /// Scratch directory for in-progress downloads.  Must live on the same
    /// filesystem as `cache_dir` so the final rename is atomic.
    pub temp_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_dir: "cache".to_string(),
            temp_dir: "temp".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Read `path`, parse it as YAML, normalize the registry set and validate
/// the result.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config file {}", path.display()))?;
    let mut config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("config file {} is not valid YAML", path.display()))?;
    config.registries.sort();
    config.registries.dedup();
    validate_config(&config)?;
    Ok(config)
}

/// Reject configurations that deserialize fine but the proxy cannot run
/// with.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.upstreams.is_empty(),
        "at least one upstream storage server must be configured"
    );
    for upstream in &config.upstreams {
        let url = reqwest::Url::parse(upstream)
            .with_context(|| format!("invalid upstream URL: {upstream}"))?;
        anyhow::ensure!(
            matches!(url.scheme(), "http" | "https"),
            "upstream URL must be http or https: {upstream}"
        );
    }
    for uuid in &config.registries {
        anyhow::ensure!(
            resource::is_registry_uuid(uuid),
            "malformed registry UUID: {uuid}"
        );
    }
    config
        .proxy
        .http_listen
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid http_listen address: {}", config.proxy.http_listen))?;
    anyhow::ensure!(
        config.fetch.shard_count.is_power_of_two(),
        "fetch.shard_count must be a power of two"
    );
    anyhow::ensure!(
        config.convergence.tick_interval_ms > 0,
        "convergence.tick_interval_ms must be positive"
    );
    Ok(())
}
