//! Core domain types for the BitVault spend engine
//!
//! This module contains the value types that flow through a construction
//! attempt: payment recipients, output types and the engine-wide constants
//! that mirror standard relay policy.
//!
//! Bitcoin primitives (`Amount`, `OutPoint`, `ScriptBuf`) come from the
//! `bitcoin` crate and are used directly rather than wrapped.

use bitcoin::address::{NetworkUnchecked, WitnessVersion};
use bitcoin::{Address, Amount, Network, Script, ScriptBuf};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SpendError;
use crate::math;

/// Maximum weight of a transaction that will be relayed by standard nodes
pub const MAX_STANDARD_TX_WEIGHT: u64 = 400_000;

/// Default upper bound on coin depth accepted for selection
pub const DEFAULT_MAX_DEPTH: u32 = 9_999_999;

/// Raw change position value meaning "pick a random position"
pub const RANDOM_CHANGE_POSITION: i64 = -1;

/// Maximum amount of bitcoin that can ever exist, in satoshis
pub const MAX_MONEY: u64 = 21_000_000 * 100_000_000;

/// Script types the wallet can create as outputs and later spend
///
/// The serialized names match the ones used in the wallet configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputType {
    /// Pay to public key hash
    Legacy,
    /// Pay to witness public key hash nested in pay to script hash
    P2shSegwit,
    /// Native segwit v0
    Bech32,
    /// Native segwit v1 (taproot)
    Bech32m,
}

impl OutputType {
    /// All output types, in the order the wallet prefers them for new addresses
    pub const ALL: [OutputType; 4] = [
        OutputType::Bech32,
        OutputType::Bech32m,
        OutputType::P2shSegwit,
        OutputType::Legacy,
    ];

    /// Classify a script by the address type it represents
    ///
    /// Witness v0 programs of any length map to `Bech32` and v1 programs to
    /// `Bech32m`. Non-standard scripts return `None`.
    pub fn from_script(script: &Script) -> Option<Self> {
        if script.is_p2pkh() {
            Some(OutputType::Legacy)
        } else if script.is_p2sh() {
            Some(OutputType::P2shSegwit)
        } else {
            match script.witness_version() {
                Some(WitnessVersion::V0) => Some(OutputType::Bech32),
                Some(WitnessVersion::V1) => Some(OutputType::Bech32m),
                _ => None,
            }
        }
    }

    /// Length of the scriptPubKey for a single-key output of this type
    pub fn script_len(&self) -> usize {
        match self {
            OutputType::Legacy => 25,
            OutputType::P2shSegwit => 23,
            OutputType::Bech32 => 22,
            OutputType::Bech32m => 34,
        }
    }

    /// Serialized weight of an output of this type
    pub fn output_weight(&self) -> u64 {
        math::output_weight_for_script_len(self.script_len())
    }
}

impl fmt::Display for OutputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputType::Legacy => "legacy",
            OutputType::P2shSegwit => "p2sh-segwit",
            OutputType::Bech32 => "bech32",
            OutputType::Bech32m => "bech32m",
        };
        f.write_str(name)
    }
}

impl FromStr for OutputType {
    type Err = SpendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "legacy" => Ok(OutputType::Legacy),
            "p2sh-segwit" => Ok(OutputType::P2shSegwit),
            "bech32" => Ok(OutputType::Bech32),
            "bech32m" => Ok(OutputType::Bech32m),
            other => Err(SpendError::InvalidRequest(format!(
                "Unknown output type: {}",
                other
            ))),
        }
    }
}

/// A requested payment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    /// Destination script
    pub script_pubkey: ScriptBuf,
    /// Requested amount before any fee subtraction
    pub amount: Amount,
    /// Whether this output pays its share of the transaction fee
    pub subtract_fee_from_amount: bool,
}

impl Recipient {
    /// Create a recipient paying `amount` to `script_pubkey`
    pub fn new(script_pubkey: ScriptBuf, amount: Amount) -> Self {
        Self {
            script_pubkey,
            amount,
            subtract_fee_from_amount: false,
        }
    }

    /// Create a recipient from an address string, checked against `network`
    pub fn from_address(address: &str, network: Network, amount: Amount) -> Result<Self, SpendError> {
        Ok(Self::new(parse_destination(address, network)?, amount))
    }

    /// Mark this recipient as paying part of the fee
    pub fn subtract_fee(mut self) -> Self {
        self.subtract_fee_from_amount = true;
        self
    }
}

/// Parse an address string into the script it pays to
///
/// Fails with `InvalidDestination` when the address is malformed or belongs
/// to a different network.
pub fn parse_destination(address: &str, network: Network) -> Result<ScriptBuf, SpendError> {
    let unchecked = Address::<NetworkUnchecked>::from_str(address.trim())
        .map_err(|e| SpendError::InvalidDestination(format!("Invalid address format: {}", e)))?;

    let checked = unchecked.require_network(network).map_err(|_| {
        SpendError::InvalidDestination(format!("Address is not valid for {} network", network))
    })?;

    Ok(checked.script_pubkey())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_type_round_trips_through_strings() {
        for output_type in OutputType::ALL {
            let parsed: OutputType = output_type.to_string().parse().unwrap();
            assert_eq!(parsed, output_type);
        }
        assert!("p2wsh".parse::<OutputType>().is_err());
    }

    #[test]
    fn test_output_type_from_script() {
        let p2wpkh = ScriptBuf::from_bytes([vec![0x00, 0x14], vec![7u8; 20]].concat());
        let p2tr = ScriptBuf::from_bytes([vec![0x51, 0x20], vec![7u8; 32]].concat());
        let p2wsh = ScriptBuf::from_bytes([vec![0x00, 0x20], vec![7u8; 32]].concat());
        assert_eq!(OutputType::from_script(&p2wpkh), Some(OutputType::Bech32));
        assert_eq!(OutputType::from_script(&p2tr), Some(OutputType::Bech32m));
        assert_eq!(OutputType::from_script(&p2wsh), Some(OutputType::Bech32));
        assert_eq!(OutputType::from_script(&ScriptBuf::new()), None);

        let p2pkh = ScriptBuf::from_bytes([vec![0x76, 0xa9, 0x14], vec![7u8; 20], vec![0x88, 0xac]].concat());
        let p2sh = ScriptBuf::from_bytes([vec![0xa9, 0x14], vec![7u8; 20], vec![0x87]].concat());
        assert_eq!(OutputType::from_script(&p2pkh), Some(OutputType::Legacy));
        assert_eq!(OutputType::from_script(&p2sh), Some(OutputType::P2shSegwit));
    }

    #[test]
    fn test_parse_destination_rejects_wrong_network() {
        let mainnet = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";
        assert!(parse_destination(mainnet, Network::Bitcoin).is_ok());
        assert!(matches!(
            parse_destination(mainnet, Network::Testnet),
            Err(SpendError::InvalidDestination(_))
        ));
        assert!(matches!(
            parse_destination("not-an-address", Network::Bitcoin),
            Err(SpendError::InvalidDestination(_))
        ));
    }
}
