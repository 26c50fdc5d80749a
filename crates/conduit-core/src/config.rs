use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18789;
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Top-level config (conduit.toml + CONDUIT_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConduitConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub lock: LockConfig,
}

impl Default for ConduitConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            database: DatabaseConfig::default(),
            agent: AgentConfig::default(),
            quota: QuotaConfig::default(),
            context: ContextConfig::default(),
            lock: LockConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// LLM node defaults. A single concrete provider is wired up in
/// `conduit-agent`; this just carries the model name and endpoint the
/// provider reads at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_model")]
    pub model: String,
    pub api_key: Option<String>,
    #[serde(default = "default_anthropic_base_url")]
    pub base_url: String,
    /// Maximum ReAct-style tool-loop iterations per request. The default
    /// strategy engine does a single round and never hits this.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            api_key: None,
            base_url: default_anthropic_base_url(),
            max_loop_iterations: default_max_loop_iterations(),
        }
    }
}

/// QuotaController admission limits (spec.md §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_tokens_per_day")]
    pub tokens_per_day: u64,
    #[serde(default = "default_concurrent_streams")]
    pub concurrent_streams: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            tokens_per_day: default_tokens_per_day(),
            concurrent_streams: default_concurrent_streams(),
        }
    }
}

/// ContextManager strategy thresholds (spec.md §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_management_threshold")]
    pub management_threshold: u64,
    #[serde(default = "default_strategy")]
    pub compression_strategy: ContextStrategy,
    #[serde(default = "bool_true")]
    pub auto_checkpoint: bool,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,
    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints: usize,
    #[serde(default = "default_compression_timeout_ms")]
    pub compression_timeout_ms: u64,
    #[serde(default = "default_compression_model")]
    pub compression_model: String,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            max_messages: default_max_messages(),
            management_threshold: default_management_threshold(),
            compression_strategy: default_strategy(),
            auto_checkpoint: true,
            checkpoint_interval: default_checkpoint_interval(),
            max_checkpoints: default_max_checkpoints(),
            compression_timeout_ms: default_compression_timeout_ms(),
            compression_model: default_compression_model(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStrategy {
    Truncate,
    Prune,
    Compact,
    Hybrid,
}

fn bool_true() -> bool {
    true
}
fn default_max_tokens() -> u64 {
    8_000
}
fn default_max_messages() -> usize {
    50
}
fn default_management_threshold() -> u64 {
    6_000
}
fn default_checkpoint_interval() -> usize {
    20
}
fn default_max_checkpoints() -> usize {
    10
}
fn default_compression_timeout_ms() -> u64 {
    30_000
}
fn default_compression_model() -> String {
    "claude-haiku-4-5".to_string()
}

/// DistributedLock defaults (spec.md §4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_lock_ttl_ms")]
    pub ttl_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: default_lock_timeout_ms(),
            ttl_ms: default_lock_ttl_ms(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_model() -> String {
    "claude-sonnet-4-6".to_string()
}
fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_max_loop_iterations() -> u32 {
    8
}
fn default_requests_per_minute() -> u32 {
    60
}
fn default_tokens_per_day() -> u64 {
    1_000_000
}
fn default_concurrent_streams() -> u32 {
    4
}
fn default_strategy() -> ContextStrategy {
    ContextStrategy::Hybrid
}
fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_cache_capacity() -> usize {
    2_000
}
fn default_lock_timeout_ms() -> u64 {
    5_000
}
fn default_lock_ttl_ms() -> u64 {
    10_000
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.conduit/conduit.db", home)
}

impl ConduitConfig {
    /// Load config from a TOML file with CONDUIT_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.conduit/conduit.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: ConduitConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CONDUIT_").split("_"))
            .extract()
            .map_err(|e| crate::error::ConduitError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.conduit/conduit.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let cfg = ConduitConfig::default();
        assert_eq!(cfg.gateway.port, DEFAULT_PORT);
        assert!(cfg.quota.requests_per_minute > 0);
        assert!(cfg.context.max_tokens > cfg.context.management_threshold);
    }
}
