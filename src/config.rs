//! Configuration management for the swap watcher
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use ethers::types::Address;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub watcher: WatcherConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub sequencer: SequencerConfig,
    pub chain: ChainConfig,
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    /// Account whose swaps are tracked
    pub account: String,
    pub poll_interval_ms: u64,
    /// Pause after a cancel is sent before the new cycle is filed
    #[serde(default = "default_cancel_settle_ms")]
    pub cancel_settle_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
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

#[derive(Debug, Clone, Deserialize)]
pub struct SequencerConfig {
    /// Base URL of the sequencer operator
    pub operator_url: String,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub router_address: String,
    pub recorder_address: String,
    pub vault_address: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub private_key_env: Option<String>,
}

fn default_cancel_settle_ms() -> u64 {
    3000
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("SWAP_WATCHER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml(&config_str)
    }

    /// Parse settings from a TOML document
    pub fn from_toml(raw: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(raw);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.chain.rpc_urls.is_empty() {
            anyhow::bail!("Chain {} has no RPC URLs configured", self.chain.name);
        }

        for (name, value) in [
            ("watcher.account", &self.watcher.account),
            ("chain.router_address", &self.chain.router_address),
            ("chain.recorder_address", &self.chain.recorder_address),
            ("chain.vault_address", &self.chain.vault_address),
        ] {
            Address::from_str(value)
                .with_context(|| format!("{} is not a valid address: {:?}", name, value))?;
        }

        if self.watcher.poll_interval_ms == 0 {
            anyhow::bail!("watcher.poll_interval_ms must be positive");
        }

        if self.sequencer.operator_url.is_empty() {
            tracing::warn!("No sequencer operator URL configured - assignments will never resolve");
        }

        Ok(())
    }

    /// Tracked account
    pub fn account(&self) -> Result<Address> {
        Address::from_str(&self.watcher.account).context("invalid watcher.account")
    }
}

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid pattern");
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();

    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
