//! UTXO selection module
//!
//! Chooses which of the wallet's coins fund a transaction.
//!
//! # Module Structure
//!
//! - `types.rs` - Coins, output groups, selection parameters and results
//! - `selector.rs` - `UtxoSelector`, which runs the strategies over eligibility tiers
//! - `strategies/` - Selection algorithms
//!   - `branch_and_bound.rs` - Search for a changeless input set
//!   - `knapsack.rs` - Randomized subset sum approximation
//!   - `single_random_draw.rs` - Random draw until change is affordable
//!   - `utils.rs` - Grouping and the waste metric
//!
//! # Waste
//!
//! Candidates from different strategies are compared by waste: the fee paid
//! for inputs now beyond what they would cost at the long-term rate, plus
//! either the cost of a change output or the excess dropped to the fee.
//!
//! # Typical Usage
//!
//! ```
//! use bitvault_spend::fee_estimation::FeeRate;
//! use bitvault_spend::utxo_selection::selector::{EligibilityFilter, SelectionRequest, UtxoSelector};
//! use bitvault_spend::utxo_selection::types::{SelectionParams, Utxo};
//! use bitcoin::{Amount, OutPoint, ScriptBuf, Txid};
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//! use std::str::FromStr;
//!
//! let script = ScriptBuf::from_bytes([vec![0x00, 0x14], vec![1u8; 20]].concat());
//! let txid = Txid::from_str("0000000000000000000000000000000000000000000000000000000000000001").unwrap();
//! let utxos = vec![Utxo::new(OutPoint::new(txid, 0), Amount::from_sat(50_000), script.clone(), 6)];
//!
//! let params = SelectionParams::new(
//!     FeeRate::from_sat_per_vb(2),
//!     None,
//!     FeeRate::from_sat_per_vb(3),
//!     &script,
//!     &[124],
//!     false,
//! );
//! let selector = UtxoSelector::new(params);
//!
//! let request = SelectionRequest {
//!     available: &utxos,
//!     presets: &[],
//!     payments: Amount::from_sat(20_000),
//!     extra_target: Amount::ZERO,
//!     allow_other_inputs: true,
//!     tiers: EligibilityFilter::tiers(true, false),
//! };
//! let selection = selector.select(&request, &mut StdRng::seed_from_u64(1)).unwrap();
//! assert_eq!(selection.input_count(), 1);
//! ```

pub mod selector;
pub mod strategies;
pub mod types;

// Re-export the most commonly used types
pub use selector::{EligibilityFilter, SelectionRequest, UtxoSelector};
pub use types::{OutputGroup, Selection, SelectionAlgorithm, SelectionParams, Utxo};
