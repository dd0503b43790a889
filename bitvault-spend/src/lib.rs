//! BitVault Spend Engine
//!
//! This crate builds Bitcoin transactions for the BitVault wallet: it picks
//! which coins to spend, settles the fee and change, reserves the chosen
//! coins against concurrent attempts, and hands the result to a signer.
//!
//! # Modules
//!
//! - `types`: Output types, recipients and shared constants
//! - `math`: Transaction weight and dust calculations
//! - `fee_estimation`: Fee rates and the fee rate oracle
//! - `error`: The `SpendError` taxonomy
//! - `coin_control`: Per-attempt options
//! - `wallet_state`: Wallet-wide spending policy
//! - `config`: Configuration file handling
//! - `logging`: Logging setup and structured spend logging
//! - `events`: Spend event bus
//! - `utxo_selection`: Coin selection strategies and the selector
//! - `utxo_management`: Coin set view and reservations
//! - `change`: Change destination, type and position
//! - `network_status`: Chain tip access
//! - `transaction_builder`: Fee and change settlement, signing hand-off
//! - `spend`: The `SpendEngine` and `construct`
//! - `funding`: `fund` for partially built transactions
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use bitcoin::{Amount, OutPoint, ScriptBuf, Txid};
//! use bitvault_spend::{
//!     ChangePosition, CoinControl, FeeRate, MockChangeSource, MockFeeEstimator, Recipient, SpendEngine, Utxo,
//!     UtxoSet, WalletPolicy, WalletState,
//! };
//! use std::str::FromStr;
//!
//! let script = ScriptBuf::from_bytes([vec![0x00, 0x14], vec![7u8; 20]].concat());
//! let txid = Txid::from_str("0000000000000000000000000000000000000000000000000000000000000002").unwrap();
//! let coins = UtxoSet::new(vec![Utxo::new(OutPoint::new(txid, 0), Amount::from_sat(100_000), script.clone(), 6)]);
//!
//! let engine = SpendEngine::new(
//!     Arc::new(coins),
//!     Arc::new(MockFeeEstimator::new().with_fee_rate(6, FeeRate::from_sat_per_vb(2))),
//!     Arc::new(MockChangeSource::new()),
//!     Arc::new(WalletState::new(WalletPolicy::default())),
//! );
//!
//! let constructed = engine
//!     .construct(
//!         &[Recipient::new(script, Amount::from_sat(40_000))],
//!         ChangePosition::Random,
//!         &CoinControl::new(),
//!         false,
//!     )
//!     .unwrap();
//! assert!(constructed.change_output().is_some());
//! let _transaction = constructed.commit();
//! ```

/// Output types, recipients and shared constants
pub mod types;

/// Transaction weight and dust calculations
pub mod math;

/// Fee rates, estimators and the fee rate oracle
pub mod fee_estimation;

/// Error types for construction and funding
pub mod error;

/// Per-attempt coin control options
pub mod coin_control;

/// Wallet-wide spending policy
pub mod wallet_state;

/// Configuration management
pub mod config;

/// Logging setup and structured spend logging
pub mod logging;

/// Spend events
pub mod events;

/// UTXO selection algorithms and utilities
pub mod utxo_selection;

/// Coin set view and reservations
pub mod utxo_management;

/// Change destination, type and position
pub mod change;

/// Chain tip access
pub mod network_status;

/// Fee and change settlement, signing hand-off
pub mod transaction_builder;

/// Transaction construction engine
pub mod spend;

/// Funding of partially built transactions
pub mod funding;

use std::sync::Once;

/// Version of the spend engine
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

static INIT: Once = Once::new();

/// Initialize logging with the default configuration
///
/// Safe to call more than once; only the first call has an effect.
pub fn init() {
    INIT.call_once(|| {
        if let Err(e) = logging::init(&logging::LogConfig::default()) {
            eprintln!("Failed to initialize logging: {}", e);
        }
    });
}

pub use change::{ChangeAddressSource, ChangePosition, MockChangeSource};
pub use coin_control::CoinControl;
pub use error::{ErrorCategory, SpendError, SpendResult};
pub use events::{SpendEvent, SpendEventBus};
pub use fee_estimation::{FeeEstimator, FeeRate, FeeRateOracle, MockFeeEstimator};
pub use funding::FundRequest;
pub use network_status::{ChainState, MockChainState};
pub use spend::{ConstructedTransaction, SpendEngine};
pub use transaction_builder::{DraftTransaction, MockSigner, SignedTransaction, SignerError, TransactionSigner};
pub use types::{OutputType, Recipient};
pub use utxo_management::{CoinFilter, ReservationHandle, ReservationTable, UtxoSet, UtxoSetView};
pub use utxo_selection::{SelectionAlgorithm, Utxo};
pub use wallet_state::{WalletPolicy, WalletState};

// Re-export the Bitcoin types that appear in the public API
pub use bitcoin::{Amount, Network, OutPoint, ScriptBuf, Transaction, TxOut, Txid};
