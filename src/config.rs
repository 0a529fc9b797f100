//! Configuration management for the HTLC relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::chain::Chain;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub bitcoin: BitcoinConfig,
    pub ethereum: EthereumConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub instance_id: String,
    #[serde(default = "default_max_concurrent_actions")]
    pub max_concurrent_actions: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_requeue_delay_secs")]
    pub requeue_delay_secs: u64,
    #[serde(default = "default_idempotency_ttl_secs")]
    pub idempotency_ttl_secs: u64,
    #[serde(default = "default_idempotency_capacity")]
    pub idempotency_capacity: usize,
    #[serde(default = "default_refund_sweep_interval_secs")]
    pub refund_sweep_interval_secs: u64,
    /// Redeems whose target timelock is closer than this are dispatched first
    #[serde(default = "default_urgent_window_secs")]
    pub urgent_window_secs: u64,
    #[serde(default)]
    pub auto_refund_chains: Vec<Chain>,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one JSON record per order
    pub data_dir: Option<String>,
    /// Postgres connection string; takes precedence over `data_dir`
    pub database_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
    pub filter: Option<String>,
}

/// Polling behaviour shared by both chain watchers
#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    pub poll_interval_secs: u64,
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_start_retries")]
    pub start_retries: u32,
    #[serde(default)]
    pub resume_from_checkpoint: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BitcoinConfig {
    pub enabled: bool,
    pub network: String,
    pub rpc_url: String,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    pub watcher: WatcherConfig,
    pub resolver: BitcoinResolverConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BitcoinResolverConfig {
    pub enabled: bool,
    /// External signing service that holds the bitcoin keys
    pub signer_url: Option<String>,
    pub signer_key_id: Option<String>,
    #[serde(default = "default_fee_rate")]
    pub fee_rate_sat_vb: u64,
    /// Destination for redeemed funds; refunds go to the order's refund address
    pub redeem_address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EthereumConfig {
    pub enabled: bool,
    pub chain_id: u64,
    pub network: String,
    pub rpc_urls: Vec<String>,
    pub htlc_contract: String,
    pub watcher: WatcherConfig,
    pub resolver: EthereumResolverConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EthereumResolverConfig {
    pub enabled: bool,
    /// Hex private key (usually `${RELAYER_PRIVATE_KEY}`)
    pub private_key: Option<String>,
    /// Name of an environment variable holding the key, used when `private_key` is empty
    pub private_key_env: Option<String>,
}

fn default_max_concurrent_actions() -> usize {
    4
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_delay_ms() -> u64 {
    1_000
}
fn default_max_retry_delay_ms() -> u64 {
    60_000
}
fn default_requeue_delay_secs() -> u64 {
    60
}
fn default_idempotency_ttl_secs() -> u64 {
    6 * 3600
}
fn default_idempotency_capacity() -> usize {
    100_000
}
fn default_refund_sweep_interval_secs() -> u64 {
    60
}
fn default_urgent_window_secs() -> u64 {
    3600
}
fn default_health_check_interval_secs() -> u64 {
    30
}
fn default_max_connections() -> u32 {
    5
}
fn default_confirmations() -> u64 {
    1
}
fn default_reconnect_delay_secs() -> u64 {
    5
}
fn default_start_retries() -> u32 {
    3
}
fn default_fee_rate() -> u64 {
    10
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("HTLC_RELAYER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml(&config_str)
    }

    /// Parse and validate settings from TOML text
    pub fn from_toml(input: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(input);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        let has_dir = self.storage.data_dir.as_deref().is_some_and(|d| !d.is_empty());
        let has_db = self
            .storage
            .database_url
            .as_deref()
            .is_some_and(|u| !u.is_empty());
        if !has_dir && !has_db {
            anyhow::bail!("storage.data_dir or storage.database_url must be set");
        }

        if self.bitcoin.enabled {
            if self.bitcoin.rpc_url.is_empty() {
                anyhow::bail!("Bitcoin is enabled but has no rpc_url configured");
            }
            if self.bitcoin.watcher.poll_interval_secs == 0 {
                anyhow::bail!("bitcoin.watcher.poll_interval_secs must be positive");
            }
            let resolver = &self.bitcoin.resolver;
            if resolver.enabled {
                if resolver.signer_url.as_deref().unwrap_or_default().is_empty()
                    || resolver.signer_key_id.as_deref().unwrap_or_default().is_empty()
                {
                    anyhow::bail!(
                        "Bitcoin resolver is enabled but signer_url/signer_key_id is missing"
                    );
                }
                if resolver.redeem_address.as_deref().unwrap_or_default().is_empty() {
                    anyhow::bail!("Bitcoin resolver is enabled but redeem_address is missing");
                }
            }
        }

        if self.ethereum.enabled {
            if self.ethereum.rpc_urls.is_empty() {
                anyhow::bail!("Ethereum is enabled but has no RPC URLs configured");
            }
            if self.ethereum.htlc_contract.is_empty() {
                anyhow::bail!("Ethereum is enabled but htlc_contract is empty");
            }
            if self.ethereum.watcher.poll_interval_secs == 0 {
                anyhow::bail!("ethereum.watcher.poll_interval_secs must be positive");
            }
            if self.ethereum.resolver.enabled && self.ethereum.resolver.signing_key().is_none() {
                anyhow::bail!("Ethereum resolver is enabled but no signing key is available");
            }
        }

        for chain in &self.relayer.auto_refund_chains {
            if !self.resolver_enabled(*chain) {
                tracing::warn!("Auto refund requested for {} but its resolver is disabled", chain);
            }
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<Chain> {
        let mut chains = Vec::new();
        if self.bitcoin.enabled {
            chains.push(Chain::Bitcoin);
        }
        if self.ethereum.enabled {
            chains.push(Chain::Ethereum);
        }
        chains
    }

    pub fn resolver_enabled(&self, chain: Chain) -> bool {
        match chain {
            Chain::Bitcoin => self.bitcoin.enabled && self.bitcoin.resolver.enabled,
            Chain::Ethereum => self.ethereum.enabled && self.ethereum.resolver.enabled,
        }
    }

    pub fn watcher_config(&self, chain: Chain) -> &WatcherConfig {
        match chain {
            Chain::Bitcoin => &self.bitcoin.watcher,
            Chain::Ethereum => &self.ethereum.watcher,
        }
    }
}

impl EthereumResolverConfig {
    /// Resolve the signing key from inline config or the named environment variable
    pub fn signing_key(&self) -> Option<String> {
        if let Some(key) = self.private_key.as_deref().filter(|k| !k.is_empty()) {
            return Some(key.to_string());
        }
        self.private_key_env
            .as_deref()
            .and_then(|name| env::var(name).ok())
            .filter(|k| !k.is_empty())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");
    }

    let mut result = input.to_string();
    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
