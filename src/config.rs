//! Configuration management for chainward
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub service: ServiceConfig,
    pub chain: ChainConfig,
    pub resender: ResenderConfig,
    pub buffer: BufferConfig,
    pub keystore: KeystoreConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub instance_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
    /// Per-call RPC timeout; a batch fails rather than hangs
    pub rpc_timeout_secs: u64,
    pub gas_price_strategy: GasPriceStrategy,
    pub max_gas_price_gwei: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
}

/// Settings for the unconfirmed-transaction resender
#[derive(Debug, Clone, Deserialize)]
pub struct ResenderConfig {
    /// Age of `broadcast_at` after which an unconfirmed tx becomes bump-eligible
    pub bump_after_threshold_secs: u64,
    /// Consecutive fee bumps before a tx is reported stuck and resent at its last fee
    pub max_bump_cycles: u32,
    /// Max not-yet-confirmed transactions considered per address per cycle
    pub max_in_flight: usize,
    /// Cadence at which the service loop triggers a reconciliation cycle
    pub resend_interval_secs: u64,
    /// Max broadcast calls grouped per batched RPC round-trip
    pub rpc_default_batch_size: usize,
}

impl ResenderConfig {
    pub fn bump_after_threshold(&self) -> Duration {
        Duration::from_secs(self.bump_after_threshold_secs)
    }

    pub fn resend_interval(&self) -> Duration {
        Duration::from_secs(self.resend_interval_secs)
    }
}

/// Settings for the log event buffer
#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    /// Number of trailing blocks retained before eviction
    pub lookback: u32,
    /// Max logs retained per entity per `block_rate`-sized block window
    pub block_rate: u32,
    /// Fallback per-entity cap applied during dequeue
    pub default_entity_limit: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeystoreConfig {
    /// Environment variables holding hex private keys, one per sending address
    pub private_key_envs: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("CHAINWARD_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific path
    pub fn load_from(config_path: &PathBuf) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.chain.rpc_urls.is_empty() {
            anyhow::bail!("At least one RPC URL must be configured");
        }

        if self.resender.rpc_default_batch_size == 0 {
            anyhow::bail!("resender.rpc_default_batch_size must be positive");
        }

        if self.resender.max_in_flight == 0 {
            anyhow::bail!("resender.max_in_flight must be positive");
        }

        if self.buffer.block_rate == 0 {
            anyhow::bail!("buffer.block_rate must be positive");
        }

        if self.buffer.default_entity_limit == 0 {
            anyhow::bail!("buffer.default_entity_limit must be positive");
        }

        if self.keystore.private_key_envs.is_empty() {
            tracing::warn!("No sending keys configured - resender will be idle");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
