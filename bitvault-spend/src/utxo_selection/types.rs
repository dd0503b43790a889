//! Core data structures for UTXO selection
//!
//! A `Utxo` is one spendable coin as the wallet sees it. Coins are selected
//! in `OutputGroup`s: usually one coin per group, or every coin paying the
//! same script when partial spends are avoided. Groups carry their values
//! already priced at the attempt's fee rates, so the strategies only ever
//! add and compare integers.

use bitcoin::{Amount, OutPoint, Script, ScriptBuf};
use std::fmt;

use crate::error::SpendError;
use crate::fee_estimation::FeeRate;
use crate::math::{self, InputWeight};
use crate::types::OutputType;

/// Represents an Unspent Transaction Output (UTXO)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    /// The transaction outpoint (txid and vout)
    pub outpoint: OutPoint,
    /// The amount in this UTXO
    pub amount: Amount,
    /// Script the coin is locked to
    pub script_pubkey: ScriptBuf,
    /// Number of confirmations (0 for unconfirmed)
    pub confirmations: u32,
    /// Whether this is a change output from one of our transactions
    pub is_change: bool,
    /// Whether the creating transaction was sent by this wallet
    pub from_me: bool,
    /// Whether the wallet can only watch this coin
    pub is_watch_only: bool,
    /// Whether the coin's script has received more than once
    pub address_reused: bool,
    /// Known spend weight, for scripts the wallet cannot size itself
    pub input_weight: Option<InputWeight>,
}

impl Utxo {
    /// Create a new UTXO with basic information
    ///
    /// # Arguments
    /// * `outpoint` - The transaction outpoint (txid and vout)
    /// * `amount` - The amount in this UTXO
    /// * `script_pubkey` - Script the coin is locked to
    /// * `confirmations` - Number of confirmations (0 for unconfirmed)
    pub fn new(outpoint: OutPoint, amount: Amount, script_pubkey: ScriptBuf, confirmations: u32) -> Self {
        Self {
            outpoint,
            amount,
            script_pubkey,
            confirmations,
            is_change: false,
            from_me: false,
            is_watch_only: false,
            address_reused: false,
            input_weight: None,
        }
    }

    /// Mark the coin as change from one of our own transactions
    pub fn as_change(mut self) -> Self {
        self.is_change = true;
        self.from_me = true;
        self
    }

    /// Mark the coin as created by a transaction this wallet sent
    pub fn from_me(mut self) -> Self {
        self.from_me = true;
        self
    }

    /// Mark the coin as watch-only
    pub fn watch_only(mut self) -> Self {
        self.is_watch_only = true;
        self
    }

    /// Mark the coin's script as reused
    pub fn reused(mut self) -> Self {
        self.address_reused = true;
        self
    }

    /// Provide the spend weight for a script the wallet cannot size
    pub fn with_input_weight(mut self, weight: InputWeight) -> Self {
        self.input_weight = Some(weight);
        self
    }

    /// Check if this UTXO is confirmed
    pub fn is_confirmed(&self) -> bool {
        self.confirmations > 0
    }

    /// Unconfirmed coins are only safe when they come from our own transactions
    pub fn is_safe(&self) -> bool {
        self.is_confirmed() || self.from_me
    }

    /// Output type of the coin's script, if standard
    pub fn output_type(&self) -> Option<OutputType> {
        OutputType::from_script(&self.script_pubkey)
    }

    /// Weight this coin adds when spent
    ///
    /// # Errors
    /// * `MissingSolvingData` when the script is not one the wallet can size
    ///   and no explicit weight was provided
    pub fn spend_weight(&self) -> Result<InputWeight, SpendError> {
        self.input_weight
            .or_else(|| math::input_weight_for_script(&self.script_pubkey))
            .ok_or(SpendError::MissingSolvingData(self.outpoint))
    }
}

/// A set of coins that is selected or skipped as a whole
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputGroup {
    /// Coins in this group
    pub utxos: Vec<Utxo>,
    /// Sum of the coins' values
    pub value: Amount,
    /// Fee to spend every coin at the attempt's rate
    pub fee: Amount,
    /// Fee to spend every coin at the long-term rate
    pub long_term_fee: Amount,
    /// Value the group contributes toward the target
    ///
    /// `value - fee`, or plain `value` when recipients pay the fee.
    pub effective_value: i64,
    /// Sum of the coins' spend weights
    pub weight: u64,
    /// Whether the group was chosen by the caller rather than a strategy
    pub preset: bool,
}

impl OutputGroup {
    /// Build a group from `utxos`, pricing it with `params`
    ///
    /// # Errors
    /// * `MissingSolvingData` if any coin cannot be sized
    pub fn new(utxos: Vec<Utxo>, params: &SelectionParams, preset: bool) -> Result<Self, SpendError> {
        let mut weight = 0;
        for utxo in &utxos {
            weight += utxo.spend_weight()?.weight;
        }

        let value: Amount = utxos.iter().map(|utxo| utxo.amount).sum();
        let fee = params.effective_feerate.fee_for_weight(weight);
        let long_term_fee = params
            .long_term_feerate
            .map(|rate| rate.fee_for_weight(weight))
            .unwrap_or(Amount::ZERO);

        let effective_value = if params.subtract_fee_outputs {
            value.to_sat() as i64
        } else {
            value.to_sat() as i64 - fee.to_sat() as i64
        };

        Ok(Self {
            utxos,
            value,
            fee,
            long_term_fee,
            effective_value,
            weight,
            preset,
        })
    }

    /// Fee spent now minus what the same inputs would cost later
    pub fn input_waste(&self) -> i64 {
        self.fee.to_sat() as i64 - self.long_term_fee.to_sat() as i64
    }
}

/// Algorithms that can produce a selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectionAlgorithm {
    /// Depth-first search for a changeless input set
    BranchAndBound,
    /// Randomized subset sum approximation
    Knapsack,
    /// Random coins until the target and a change output are covered
    SingleRandomDraw,
    /// Only coins the caller chose
    Manual,
}

impl SelectionAlgorithm {
    /// Short name used in logs and events
    pub fn name(&self) -> &'static str {
        match self {
            SelectionAlgorithm::BranchAndBound => "bnb",
            SelectionAlgorithm::Knapsack => "knapsack",
            SelectionAlgorithm::SingleRandomDraw => "srd",
            SelectionAlgorithm::Manual => "manual",
        }
    }
}

impl fmt::Display for SelectionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fee and change parameters for one selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionParams {
    /// Rate the transaction pays
    pub effective_feerate: FeeRate,
    /// Rate used to judge whether spending inputs now is wasteful
    pub long_term_feerate: Option<FeeRate>,
    /// Rate at which leftover is not worth a change output
    pub discard_feerate: FeeRate,
    /// Weight of the change output
    pub change_output_weight: u64,
    /// Weight of spending the change output later
    pub change_spend_weight: u64,
    /// Fee for adding the change output now
    pub change_fee: Amount,
    /// Creating the change output now plus spending it later
    pub cost_of_change: Amount,
    /// Smallest change value worth creating
    pub change_dust: Amount,
    /// Leftover needed before a change output is added
    pub min_change: Amount,
    /// Weight of the transaction before any input is added
    pub tx_noinputs_weight: u64,
    /// Whether recipients pay the fee out of their amounts
    pub subtract_fee_outputs: bool,
    /// Whether coins are grouped by script
    pub avoid_partial_spends: bool,
}

impl SelectionParams {
    /// Derive selection parameters for an attempt
    ///
    /// # Arguments
    /// * `effective_feerate` - Rate the transaction pays
    /// * `long_term_feerate` - Consolidation rate, if the wallet sets one
    /// * `discard_feerate` - Rate used for change dust and spending change
    /// * `change_script` - Script change would pay to
    /// * `payment_output_weights` - Weights of the non-change outputs
    /// * `subtract_fee_outputs` - Whether recipients pay the fee
    pub fn new(
        effective_feerate: FeeRate,
        long_term_feerate: Option<FeeRate>,
        discard_feerate: FeeRate,
        change_script: &Script,
        payment_output_weights: &[u64],
        subtract_fee_outputs: bool,
    ) -> Self {
        let change_output_weight = math::output_weight(change_script);
        let change_spend_weight = math::input_weight_for_script(change_script)
            .map(|input| input.weight)
            .unwrap_or(math::P2SH_P2WPKH_INPUT_WEIGHT);

        let change_fee = effective_feerate.fee_for_weight(change_output_weight);
        let cost_of_change = change_fee
            .checked_add(discard_feerate.fee_for_weight(change_spend_weight))
            .unwrap_or(Amount::from_sat(u64::MAX));
        let change_dust = math::dust_threshold(change_script, discard_feerate);

        Self {
            effective_feerate,
            long_term_feerate,
            discard_feerate,
            change_output_weight,
            change_spend_weight,
            change_fee,
            cost_of_change,
            change_dust,
            min_change: change_fee.checked_add(change_dust).unwrap_or(Amount::from_sat(u64::MAX)),
            tx_noinputs_weight: math::weight_without_inputs(payment_output_weights),
            subtract_fee_outputs,
            avoid_partial_spends: false,
        }
    }

    /// Group coins that pay the same script
    pub fn with_avoid_partial_spends(mut self, avoid: bool) -> Self {
        self.avoid_partial_spends = avoid;
        self
    }

    /// Amount the selected groups must reach for `payments`
    ///
    /// Recipients paying the fee means inputs only need to cover the
    /// payments themselves.
    ///
    /// # Errors
    /// * `InvalidRequest` if the payments plus the fixed fee cannot be represented
    pub fn selection_target(&self, payments: Amount) -> Result<i64, SpendError> {
        let required = if self.subtract_fee_outputs {
            Some(payments)
        } else {
            payments.checked_add(self.effective_feerate.fee_for_weight(self.tx_noinputs_weight))
        };

        required
            .and_then(|amount| i64::try_from(amount.to_sat()).ok())
            .ok_or_else(|| {
                SpendError::InvalidRequest(format!(
                    "Payments of {} plus the fee at {} overflow the selection target",
                    payments, self.effective_feerate
                ))
            })
    }
}

/// Coins chosen for an attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Selected groups, presets first
    pub groups: Vec<OutputGroup>,
    /// Strategy that produced the selection
    pub algorithm: SelectionAlgorithm,
    /// Target the groups were chosen against
    pub target: i64,
    /// Waste score of the selection
    pub waste: i64,
}

impl Selection {
    /// All selected coins, presets first
    pub fn utxos(&self) -> impl Iterator<Item = &Utxo> {
        self.groups.iter().flat_map(|group| group.utxos.iter())
    }

    /// Number of selected coins
    pub fn input_count(&self) -> usize {
        self.groups.iter().map(|group| group.utxos.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Txid;
    use std::str::FromStr;

    fn p2wpkh() -> ScriptBuf {
        ScriptBuf::from_bytes([vec![0x00, 0x14], vec![9u8; 20]].concat())
    }

    fn coin(vout: u32, sats: u64) -> Utxo {
        let txid = Txid::from_str("1111111111111111111111111111111111111111111111111111111111111111").unwrap();
        Utxo::new(OutPoint::new(txid, vout), Amount::from_sat(sats), p2wpkh(), 6)
    }

    #[test]
    fn test_group_effective_value() {
        let params = SelectionParams::new(
            FeeRate::from_sat_per_kwu(100),
            None,
            FeeRate::from_sat_per_vb(3),
            &p2wpkh(),
            &[124],
            false,
        );
        let group = OutputGroup::new(vec![coin(0, 5_000)], &params, false).unwrap();
        assert_eq!(group.weight, math::P2WPKH_INPUT_WEIGHT);
        assert_eq!(group.fee, Amount::from_sat(28));
        assert_eq!(group.effective_value, 4_972);
        assert_eq!(group.input_waste(), 28);
    }

    #[test]
    fn test_change_parameters() {
        let params = SelectionParams::new(
            FeeRate::from_sat_per_kwu(100),
            None,
            FeeRate::from_sat_per_vb(3),
            &p2wpkh(),
            &[124],
            false,
        );
        assert_eq!(params.change_fee, Amount::from_sat(13));
        assert_eq!(params.change_dust, Amount::from_sat(294));
        assert_eq!(params.min_change, Amount::from_sat(307));
        assert_eq!(params.selection_target(Amount::from_sat(6_000)), Ok(6_017));
    }

    #[test]
    fn test_selection_target_overflow_is_rejected() {
        let params = SelectionParams::new(
            FeeRate::from_sat_per_kwu(100),
            None,
            FeeRate::from_sat_per_vb(3),
            &p2wpkh(),
            &[124],
            false,
        );
        assert!(matches!(
            params.selection_target(Amount::from_sat(i64::MAX as u64)),
            Err(SpendError::InvalidRequest(_))
        ));
        assert!(matches!(
            params.selection_target(Amount::from_sat(u64::MAX - 10)),
            Err(SpendError::InvalidRequest(_))
        ));

        let huge_rate = SelectionParams::new(
            FeeRate::from_sat_per_kwu(u64::MAX),
            None,
            FeeRate::from_sat_per_vb(3),
            &p2wpkh(),
            &[124],
            false,
        );
        assert_eq!(huge_rate.cost_of_change, Amount::from_sat(u64::MAX));
        assert!(matches!(
            huge_rate.selection_target(Amount::from_sat(1_000)),
            Err(SpendError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_unknown_script_needs_solving_data() {
        let p2wsh = ScriptBuf::from_bytes([vec![0x00, 0x20], vec![1u8; 32]].concat());
        let mut utxo = coin(1, 10_000);
        utxo.script_pubkey = p2wsh;
        assert!(matches!(utxo.spend_weight(), Err(SpendError::MissingSolvingData(_))));

        let utxo = utxo.with_input_weight(InputWeight::witness(400));
        assert_eq!(utxo.spend_weight().unwrap().weight, 400);
    }
}
