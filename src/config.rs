//! Configuration management for the swap engine
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::htlc::SecretHashAlgo;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub engine: EngineConfig,
    pub store: StoreConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub coins: HashMap<String, CoinConfig>,
    #[serde(default)]
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub instance_id: String,
    pub poll_interval_ms: u64,
    pub health_check_interval_secs: u64,
    /// Taker locktime is `started_at + lock_duration`, maker locktime twice that.
    pub lock_duration_secs: u64,
    pub locktime_safety_margin_secs: u64,
    pub negotiation_timeout_secs: u64,
    pub max_confirmation_wait_secs: u64,
    #[serde(default = "default_dex_fee_divisor")]
    pub dex_fee_divisor: u64,
    #[serde(default)]
    pub secret_hash_algo: SecretHashAlgo,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Attempts for steps without a chain deadline
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    #[serde(default = "default_store_path")]
    pub path: String,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    File,
    Postgres,
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
pub struct CoinConfig {
    pub family: CoinFamily,
    pub backend: CoinBackend,
    #[serde(default)]
    pub rpc_urls: Vec<String>,
    #[serde(default)]
    pub chain_id: u64,
    #[serde(default)]
    pub swap_contract_address: String,
    pub required_confirmations: Option<u64>,
    pub protected_confirmations: Option<u64>,
    #[serde(default)]
    pub requires_protection: bool,
    #[serde(default = "default_block_time")]
    pub block_time_secs: u64,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, serde::Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CoinFamily {
    /// Script-locked outputs (Bitcoin and forks)
    Utxo,
    /// Swap contract on an account-based chain
    Account,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CoinBackend {
    Simulated,
    Evm,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WalletConfig {
    pub private_key_env: Option<String>,
    pub seed_env: Option<String>,
}

fn default_dex_fee_divisor() -> u64 {
    777
}

fn default_store_path() -> String {
    "data/swaps".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_block_time() -> u64 {
    600
}

fn default_gas_limit() -> u64 {
    150_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_attempts: 8,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_id: "swap-engine".to_string(),
            poll_interval_ms: 1_000,
            health_check_interval_secs: 30,
            lock_duration_secs: 3_600,
            locktime_safety_margin_secs: 1_800,
            negotiation_timeout_secs: 60,
            max_confirmation_wait_secs: 3_600,
            dex_fee_divisor: default_dex_fee_divisor(),
            secret_hash_algo: SecretHashAlgo::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    pub fn max_confirmation_wait(&self) -> Duration {
        Duration::from_secs(self.max_confirmation_wait_secs)
    }
}

impl CoinConfig {
    /// Confirmation count for normal payments, falling back to a per-family table
    pub fn confirmations(&self) -> u64 {
        self.required_confirmations
            .unwrap_or_else(|| crate::chain::recommended_confirmations(self.family, self.chain_id))
    }

    /// Confirmation count under the protected profile
    pub fn protected(&self) -> u64 {
        self.protected_confirmations
            .unwrap_or_else(|| self.confirmations().saturating_mul(2))
    }
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("SWAP_ENGINE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml_str(&config_str)
    }

    /// Parse and validate settings from TOML text
    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_coins().is_empty() {
            anyhow::bail!("At least one coin must be enabled");
        }

        let engine = &self.engine;
        if engine.lock_duration_secs == 0 {
            anyhow::bail!("lock_duration_secs must be positive");
        }
        if engine.locktime_safety_margin_secs == 0 {
            anyhow::bail!("locktime_safety_margin_secs must be positive");
        }
        // Maker locktime exceeds taker locktime by exactly one lock duration.
        if engine.locktime_safety_margin_secs > engine.lock_duration_secs {
            anyhow::bail!(
                "locktime_safety_margin_secs ({}) exceeds lock_duration_secs ({})",
                engine.locktime_safety_margin_secs,
                engine.lock_duration_secs
            );
        }
        if engine.dex_fee_divisor == 0 {
            anyhow::bail!("dex_fee_divisor must be positive");
        }
        if engine.backoff.multiplier < 1.0 {
            anyhow::bail!("backoff multiplier must be at least 1.0");
        }

        if self.store.backend == StoreBackend::Postgres && self.store.url.is_empty() {
            anyhow::bail!("Postgres store requires a url");
        }

        for (ticker, coin) in &self.coins {
            if !coin.enabled {
                continue;
            }
            if coin.backend == CoinBackend::Evm {
                if coin.family != CoinFamily::Account {
                    anyhow::bail!("Coin {} uses the evm backend but is not account-style", ticker);
                }
                if coin.rpc_urls.is_empty() {
                    anyhow::bail!("Coin {} has no RPC URLs configured", ticker);
                }
                if coin.swap_contract_address.is_empty() {
                    anyhow::bail!("Coin {} has no swap contract address", ticker);
                }
            }
            if coin.protected() < coin.confirmations() {
                tracing::warn!(
                    "Coin {} protected confirmations below normal count - using normal count",
                    ticker
                );
            }
        }

        Ok(())
    }

    /// Get list of enabled coins
    pub fn enabled_coins(&self) -> Vec<(&String, &CoinConfig)> {
        self.coins.iter().filter(|(_, c)| c.enabled).collect()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");
    }

    ENV_VAR
        .replace_all(input, |cap: &regex::Captures| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned()
}
