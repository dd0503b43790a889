//! Configuration management for the spend engine.
//!
//! Wallet spending settings are stored in TOML format. Every field has a
//! default so a partial file (or an empty one) is valid. Fee rates are
//! written as decimal satoshis per virtual byte.
//!
//! ```toml
//! [wallet]
//! network = "testnet"
//! default_change_type = "bech32m"
//!
//! [fees]
//! min_fee = 1.0
//! fallback_fee = 20
//! allow_fallback_fee = true
//! ```
//!
//! `Config::to_policy` converts the file into the `WalletPolicy` snapshot
//! type the engine consumes.

use anyhow::{anyhow, Result};
use bitcoin::{Amount, Network};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::fee_estimation::FeeRate;
use crate::logging::LogConfig;
use crate::types::{OutputType, MAX_MONEY};
use crate::wallet_state::WalletPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub wallet: WalletConfig,

    #[serde(default)]
    pub fees: FeeConfig,

    #[serde(default)]
    pub logging: LogConfig,
}

/// Wallet-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    #[serde(default = "default_network")]
    pub network: String,

    /// Output type for change when a transaction does not choose one
    #[serde(default)]
    pub default_change_type: Option<OutputType>,

    /// Signal BIP125 replaceability by default
    #[serde(default = "default_true")]
    pub signal_rbf: bool,

    /// Allow spending unconfirmed change
    #[serde(default = "default_true")]
    pub spend_zero_conf_change: bool,

    /// Spend all coins sent to one address together
    #[serde(default)]
    pub avoid_partial_spends: bool,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            default_change_type: None,
            signal_rbf: default_true(),
            spend_zero_conf_change: default_true(),
            avoid_partial_spends: false,
        }
    }
}

/// Fee configuration, rates in sat/vB
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    /// Fixed rate to pay instead of estimating
    #[serde(default)]
    pub pay_tx_fee: Option<Decimal>,

    #[serde(default = "default_min_fee")]
    pub min_fee: Decimal,

    #[serde(default)]
    pub fallback_fee: Option<Decimal>,

    #[serde(default)]
    pub allow_fallback_fee: bool,

    #[serde(default = "default_discard_rate")]
    pub discard_rate: Decimal,

    #[serde(default)]
    pub consolidate_feerate: Option<Decimal>,

    /// Largest absolute fee in satoshis
    #[serde(default = "default_max_tx_fee")]
    pub max_tx_fee: u64,

    /// Default confirmation target in blocks
    #[serde(default = "default_confirm_target")]
    pub confirm_target: u32,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            pay_tx_fee: None,
            min_fee: default_min_fee(),
            fallback_fee: None,
            allow_fallback_fee: false,
            discard_rate: default_discard_rate(),
            consolidate_feerate: None,
            max_tx_fee: default_max_tx_fee(),
            confirm_target: default_confirm_target(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config file: {}", e))?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| anyhow!("Failed to parse config file: {}", e))
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| anyhow!("Failed to serialize config: {}", e))?;
        fs::write(path, content).map_err(|e| anyhow!("Failed to write config file: {}", e))?;
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        parse_network(&self.wallet.network)?;

        let rates = [
            ("pay_tx_fee", self.fees.pay_tx_fee),
            ("min_fee", Some(self.fees.min_fee)),
            ("fallback_fee", self.fees.fallback_fee),
            ("discard_rate", Some(self.fees.discard_rate)),
            ("consolidate_feerate", self.fees.consolidate_feerate),
        ];
        for (name, rate) in rates {
            if let Some(rate) = rate {
                if rate.is_sign_negative() {
                    anyhow::bail!("Invalid {}: must not be negative", name);
                }
                if rate > dec!(100000) {
                    anyhow::bail!("Invalid {}: {} sat/vB is unreasonably high", name, rate);
                }
            }
        }

        if self.fees.max_tx_fee == 0 || self.fees.max_tx_fee > MAX_MONEY {
            return Err(anyhow!("Invalid max_tx_fee: must be between 1 and {} satoshis", MAX_MONEY));
        }

        if self.fees.confirm_target == 0 {
            return Err(anyhow!("Invalid confirm_target: must be greater than 0"));
        }

        Ok(())
    }

    /// Convert to the policy snapshot used by construction attempts
    pub fn to_policy(&self) -> Result<WalletPolicy> {
        self.validate()?;

        Ok(WalletPolicy {
            network: parse_network(&self.wallet.network)?,
            consolidate_feerate: self.fees.consolidate_feerate.map(to_fee_rate).transpose()?,
            default_change_type: self.wallet.default_change_type,
            discard_rate: to_fee_rate(self.fees.discard_rate)?,
            pay_tx_fee: self.fees.pay_tx_fee.map(to_fee_rate).transpose()?,
            min_fee: to_fee_rate(self.fees.min_fee)?,
            fallback_fee: self.fees.fallback_fee.map(to_fee_rate).transpose()?,
            allow_fallback_fee: self.fees.allow_fallback_fee,
            signal_rbf: self.wallet.signal_rbf,
            max_tx_fee: Amount::from_sat(self.fees.max_tx_fee),
            spend_zero_conf_change: self.wallet.spend_zero_conf_change,
            avoid_partial_spends: self.wallet.avoid_partial_spends,
            default_confirm_target: self.fees.confirm_target,
        })
    }
}

/// Ensure a configuration file exists at the specified path
/// If it doesn't exist, create it with default values
pub fn ensure_config_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .map_err(|e| anyhow!("Failed to create config directory: {}", e))?;
            }
        }
        Config::default().save(path)?;
    }

    Ok(())
}

/// Parse a network name as written in the config file
pub fn parse_network(name: &str) -> Result<Network> {
    match name.trim().to_lowercase().as_str() {
        "bitcoin" | "mainnet" => Ok(Network::Bitcoin),
        "testnet" => Ok(Network::Testnet),
        "signet" => Ok(Network::Signet),
        "regtest" => Ok(Network::Regtest),
        other => Err(anyhow!("Invalid network type: {}", other)),
    }
}

fn to_fee_rate(sat_per_vb: Decimal) -> Result<FeeRate> {
    FeeRate::from_sat_per_vb_decimal(sat_per_vb)
        .ok_or_else(|| anyhow!("Invalid fee rate: {} sat/vB", sat_per_vb))
}

// Default value functions
fn default_network() -> String {
    "bitcoin".to_string()
}

fn default_true() -> bool {
    true
}

fn default_min_fee() -> Decimal {
    dec!(1.0)
}

fn default_discard_rate() -> Decimal {
    dec!(10.0)
}

fn default_max_tx_fee() -> u64 {
    crate::fee_estimation::defaults::DEFAULT_MAX_TX_FEE
}

fn default_confirm_target() -> u32 {
    crate::fee_estimation::defaults::DEFAULT_CONFIRM_TARGET
}
