//! Transaction assembly
//!
//! Turns a selected input set and the requested payments into a balanced
//! draft transaction. The fee depends on the transaction's weight, the weight
//! depends on whether a change output exists, and whether change exists
//! depends on what is left after the fee. The assembler settles this by
//! iterating until the change decision and the fee stop moving.
//!
//! When the inputs cannot pay for the settled fee the assembler does not
//! fail; it reports the shortfall so the caller can select again with a
//! larger target.
//!
//! Signing is delegated to a `TransactionSigner`. Whatever comes back is
//! checked against the draft before it is accepted.

use bitcoin::absolute::LockTime;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use rand::{Rng, RngCore};
use serde_json::json;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

use crate::change::ChangePosition;
use crate::error::SpendError;
use crate::fee_estimation::{defaults, FeeRate};
use crate::logging::{log_spend, LogContext, LogLevel};
use crate::math::{self, InputWeight};
use crate::network_status::ChainState;
use crate::types::{OutputType, MAX_MONEY, MAX_STANDARD_TX_WEIGHT};
use crate::utxo_selection::types::Utxo;

/// Rounds of fee and change recomputation before giving up
pub const MAX_FEE_ROUNDS: usize = 8;

/// Largest random lock time back-off, in blocks
pub const MAX_LOCKTIME_BACKOFF: u32 = 100;

/// Transaction version used for every constructed transaction
pub const TX_VERSION: i32 = 2;

/// A balanced but unsigned transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftTransaction {
    /// Coins spent, in transaction order
    pub inputs: Vec<Utxo>,
    /// Outputs in transaction order, change included
    pub outputs: Vec<TxOut>,
    /// Absolute fee: input value minus output value
    pub fee: Amount,
    /// Index of the change output, if any
    pub change_position: Option<usize>,
}

impl DraftTransaction {
    /// Draft with no change output and a zero fee
    ///
    /// This is the shape a caller hands to funding: outputs set, inputs
    /// possibly incomplete.
    pub fn new(inputs: Vec<Utxo>, outputs: Vec<TxOut>) -> Self {
        Self {
            inputs,
            outputs,
            fee: Amount::ZERO,
            change_position: None,
        }
    }

    pub fn input_value(&self) -> Amount {
        Amount::from_sat(self.inputs.iter().map(|utxo| utxo.amount.to_sat()).sum())
    }

    pub fn output_value(&self) -> Amount {
        Amount::from_sat(self.outputs.iter().map(|output| output.value).sum())
    }

    pub fn change_output(&self) -> Option<&TxOut> {
        self.change_position.and_then(|position| self.outputs.get(position))
    }

    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.inputs.iter().map(|utxo| utxo.outpoint).collect()
    }

    /// Estimated weight once every input is signed
    ///
    /// # Errors
    /// * `MissingSolvingData` if an input's spend size is unknown
    pub fn estimated_weight(&self) -> Result<u64, SpendError> {
        let inputs = self
            .inputs
            .iter()
            .map(Utxo::spend_weight)
            .collect::<Result<Vec<_>, _>>()?;
        let outputs: Vec<u64> = self
            .outputs
            .iter()
            .map(|output| math::output_weight(&output.script_pubkey))
            .collect();
        Ok(math::estimate_tx_weight(&inputs, &outputs))
    }

    /// Build the unsigned transaction
    ///
    /// # Arguments
    /// * `lock_time` - Absolute lock time for the transaction
    /// * `signal_rbf` - Whether inputs signal BIP125 replaceability
    pub fn to_unsigned_transaction(&self, lock_time: LockTime, signal_rbf: bool) -> Transaction {
        let sequence = if signal_rbf {
            Sequence::ENABLE_RBF_NO_LOCKTIME
        } else {
            Sequence::ENABLE_LOCKTIME_NO_RBF
        };

        Transaction {
            version: TX_VERSION,
            lock_time,
            input: self
                .inputs
                .iter()
                .map(|utxo| TxIn {
                    previous_output: utxo.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence,
                    witness: Witness::new(),
                })
                .collect(),
            output: self.outputs.clone(),
        }
    }
}

/// Result of one assembly attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyOutcome {
    /// The inputs pay for everything
    Assembled(Assembly),
    /// The inputs fall short of payments plus fee by this much
    Shortfall(Amount),
}

/// A settled draft and what it took to get there
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembly {
    pub draft: DraftTransaction,
    /// Estimated signed weight
    pub weight: u64,
    /// Value given to the fee beyond what the fee rate asks for
    pub excess_to_fee: Amount,
    /// Rounds the fee iteration needed
    pub rounds: usize,
}

/// One round's view of the fee and change decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Candidate {
    with_change: bool,
    fee: u64,
    change: u64,
    deduction: u64,
}

enum Step {
    Settle(Candidate),
    Shortfall(u64),
}

/// Builds balanced drafts for a fixed set of payments
///
/// The assembler is configured once per attempt and may then be run against
/// several input sets while the caller searches for one that is sufficient.
#[derive(Debug, Clone)]
pub struct TransactionAssembler {
    payments: Vec<TxOut>,
    subtract_fee_from: BTreeSet<usize>,
    change_script: ScriptBuf,
    change_position: ChangePosition,
    fee_rate: FeeRate,
    min_fee: Amount,
    change_dust: Amount,
    max_tx_fee: Amount,
}

impl TransactionAssembler {
    /// Create an assembler for `payments` at `fee_rate`
    ///
    /// Change, when created, pays to `change_script`. By default change must
    /// clear the relay dust threshold and there is no fee floor.
    pub fn new(payments: Vec<TxOut>, change_script: ScriptBuf, fee_rate: FeeRate) -> Self {
        let change_dust = math::dust_threshold(&change_script, defaults::DUST_RELAY_FEE);
        Self {
            payments,
            subtract_fee_from: BTreeSet::new(),
            change_script,
            change_position: ChangePosition::Random,
            fee_rate,
            min_fee: Amount::ZERO,
            change_dust,
            max_tx_fee: Amount::from_sat(defaults::DEFAULT_MAX_TX_FEE),
        }
    }

    /// Payment indices whose amounts pay the fee
    pub fn with_subtract_fee_from(mut self, indices: BTreeSet<usize>) -> Self {
        self.subtract_fee_from = indices;
        self
    }

    pub fn with_change_position(mut self, position: ChangePosition) -> Self {
        self.change_position = position;
        self
    }

    /// Floor on the absolute fee
    pub fn with_min_fee(mut self, min_fee: Amount) -> Self {
        self.min_fee = min_fee;
        self
    }

    /// Smallest change output worth creating
    pub fn with_change_dust(mut self, change_dust: Amount) -> Self {
        self.change_dust = change_dust;
        self
    }

    pub fn with_max_tx_fee(mut self, max_tx_fee: Amount) -> Self {
        self.max_tx_fee = max_tx_fee;
        self
    }

    pub fn payments(&self) -> &[TxOut] {
        &self.payments
    }

    pub fn payment_value(&self) -> Amount {
        Amount::from_sat(self.payments.iter().map(|output| output.value).sum())
    }

    pub fn subtracts_fee(&self) -> bool {
        !self.subtract_fee_from.is_empty()
    }

    /// Validate the payments before any coins are looked at
    ///
    /// # Errors
    /// * `InvalidRequest` for no outputs, an out-of-range subtraction index
    ///   or a total above the money supply
    /// * `AmountBelowDust` for a payment too small to relay that does not
    ///   pay part of the fee
    pub fn check_payments(&self) -> Result<(), SpendError> {
        if self.payments.is_empty() {
            return Err(SpendError::InvalidRequest(
                "Transaction must have at least one recipient".to_string(),
            ));
        }

        if let Some(&index) = self.subtract_fee_from.iter().find(|&&index| index >= self.payments.len()) {
            return Err(SpendError::InvalidRequest(format!(
                "Subtract fee index {} is out of bounds for {} outputs",
                index,
                self.payments.len()
            )));
        }

        let total = self
            .payments
            .iter()
            .try_fold(0u64, |total, output| total.checked_add(output.value))
            .filter(|total| *total <= MAX_MONEY);
        if total.is_none() {
            return Err(SpendError::InvalidRequest(
                "Payment total exceeds the money supply".to_string(),
            ));
        }

        for (index, output) in self.payments.iter().enumerate() {
            if self.subtract_fee_from.contains(&index) {
                continue;
            }
            let amount = Amount::from_sat(output.value);
            let threshold = math::dust_threshold(&output.script_pubkey, defaults::DUST_RELAY_FEE);
            if amount < threshold {
                return Err(SpendError::AmountBelowDust {
                    index,
                    amount,
                    threshold,
                });
            }
        }

        Ok(())
    }

    /// Settle fee and change for `inputs`
    ///
    /// # Arguments
    /// * `inputs` - Coins to spend, in the order they will appear
    /// * `rng` - Source for a random change position
    ///
    /// # Returns
    /// The settled draft, or the amount the inputs are short by
    ///
    /// # Errors
    /// * `FeeCalculationDidNotConverge` if the decision keeps changing
    /// * `RecipientBelowDustAfterFeeSubtraction` if a fee-paying output
    ///   becomes dust
    /// * `TransactionTooLarge` and `FeeExceedsMaximum` on the settled draft
    pub fn assemble(&self, inputs: &[Utxo], rng: &mut dyn RngCore) -> Result<AssemblyOutcome, SpendError> {
        self.check_payments()?;

        let input_weights = inputs
            .iter()
            .map(Utxo::spend_weight)
            .collect::<Result<Vec<_>, _>>()?;
        let balance = Balance {
            input_weights,
            payment_weights: self
                .payments
                .iter()
                .map(|output| math::output_weight(&output.script_pubkey))
                .collect(),
            change_weight: math::output_weight(&self.change_script),
            input_value: inputs.iter().map(|utxo| utxo.amount.to_sat()).sum(),
            payment_value: self.payment_value().to_sat(),
            assembler: self,
        };

        let mut previous: Option<Candidate> = None;
        let mut with_change = true;
        let mut rounds = 0;
        let settled = loop {
            if rounds == MAX_FEE_ROUNDS {
                log_spend(
                    LogLevel::Warn,
                    LogContext::Assembly,
                    "fee calculation did not converge",
                    Some(json!({ "rounds": rounds, "inputs": inputs.len() })),
                );
                return Err(SpendError::FeeCalculationDidNotConverge { rounds });
            }
            rounds += 1;

            let candidate = match balance.step(with_change) {
                Step::Settle(candidate) => candidate,
                Step::Shortfall(shortfall) => return Ok(AssemblyOutcome::Shortfall(Amount::from_sat(shortfall))),
            };
            if previous == Some(candidate) {
                break candidate;
            }
            with_change = candidate.with_change;
            previous = Some(candidate);
        };

        let mut outputs = self.payments.clone();
        if settled.deduction > 0 {
            self.deduct_fee(&mut outputs, settled.deduction)?;
        }

        let change_position = if settled.with_change {
            let position = self.change_position.resolve(outputs.len(), rng)?;
            outputs.insert(
                position,
                TxOut {
                    value: settled.change,
                    script_pubkey: self.change_script.clone(),
                },
            );
            Some(position)
        } else {
            None
        };

        let weight = balance.weight(settled.with_change);
        if weight > MAX_STANDARD_TX_WEIGHT {
            return Err(SpendError::TransactionTooLarge {
                weight,
                max: MAX_STANDARD_TX_WEIGHT,
            });
        }

        let fee = Amount::from_sat(settled.fee);
        if fee > self.max_tx_fee {
            return Err(SpendError::FeeExceedsMaximum {
                fee,
                max: self.max_tx_fee,
            });
        }

        let excess_to_fee = Amount::from_sat(settled.fee.saturating_sub(balance.fee(settled.with_change)));

        log_spend(
            LogLevel::Debug,
            LogContext::Assembly,
            "draft assembled",
            Some(json!({
                "inputs": inputs.len(),
                "outputs": outputs.len(),
                "fee": settled.fee,
                "weight": weight,
                "change": change_position.map(|_| settled.change),
                "rounds": rounds,
            })),
        );

        Ok(AssemblyOutcome::Assembled(Assembly {
            draft: DraftTransaction {
                inputs: inputs.to_vec(),
                outputs,
                fee,
                change_position,
            },
            weight,
            excess_to_fee,
            rounds,
        }))
    }

    /// Take `deduction` from the fee-paying outputs
    ///
    /// Each pays an even share; the first also pays the remainder.
    fn deduct_fee(&self, outputs: &mut [TxOut], deduction: u64) -> Result<(), SpendError> {
        let count = self.subtract_fee_from.len() as u64;
        let share = deduction / count;
        let remainder = deduction % count;

        for (n, &index) in self.subtract_fee_from.iter().enumerate() {
            let take = if n == 0 { share + remainder } else { share };
            let output = &mut outputs[index];
            let threshold = math::dust_threshold(&output.script_pubkey, defaults::DUST_RELAY_FEE);

            match output.value.checked_sub(take) {
                Some(value) if Amount::from_sat(value) >= threshold => output.value = value,
                remaining => {
                    return Err(SpendError::RecipientBelowDustAfterFeeSubtraction {
                        index,
                        value: Amount::from_sat(remaining.unwrap_or(0)),
                        threshold,
                    })
                }
            }
        }

        Ok(())
    }
}

/// Fixed quantities of one assembly run
struct Balance<'a> {
    input_weights: Vec<InputWeight>,
    payment_weights: Vec<u64>,
    change_weight: u64,
    input_value: u64,
    payment_value: u64,
    assembler: &'a TransactionAssembler,
}

impl Balance<'_> {
    fn weight(&self, with_change: bool) -> u64 {
        let mut outputs = self.payment_weights.clone();
        if with_change {
            outputs.push(self.change_weight);
        }
        math::estimate_tx_weight(&self.input_weights, &outputs)
    }

    fn fee(&self, with_change: bool) -> u64 {
        let by_rate = self.assembler.fee_rate.fee_for_weight(self.weight(with_change)).to_sat();
        by_rate.max(self.assembler.min_fee.to_sat())
    }

    fn step(&self, with_change: bool) -> Step {
        let fee = self.fee(with_change);
        let change_dust = self.assembler.change_dust.to_sat() as i64;
        let available = self.input_value as i64 - self.payment_value as i64;

        if self.assembler.subtracts_fee() {
            // Recipients pay the fee; what is left over is change or a tip
            if available < 0 {
                return Step::Shortfall(available.unsigned_abs());
            }
            if available >= change_dust {
                let fee = if with_change { fee } else { self.fee(true) };
                return Step::Settle(Candidate {
                    with_change: true,
                    fee,
                    change: available as u64,
                    deduction: fee,
                });
            }
            if with_change {
                return Step::Settle(Candidate {
                    with_change: false,
                    fee,
                    change: 0,
                    deduction: fee,
                });
            }
            let leftover = available as u64;
            let deduction = fee.saturating_sub(leftover);
            return Step::Settle(Candidate {
                with_change: false,
                fee: leftover + deduction,
                change: 0,
                deduction,
            });
        }

        if with_change {
            let leftover = available - fee as i64;
            return Step::Settle(if leftover >= change_dust {
                Candidate {
                    with_change: true,
                    fee,
                    change: leftover as u64,
                    deduction: 0,
                }
            } else {
                Candidate {
                    with_change: false,
                    fee,
                    change: 0,
                    deduction: 0,
                }
            });
        }

        if available < fee as i64 {
            return Step::Shortfall((fee as i64 - available) as u64);
        }

        let fee_with_change = self.fee(true);
        let leftover_with_change = available - fee_with_change as i64;
        Step::Settle(if leftover_with_change >= change_dust {
            Candidate {
                with_change: true,
                fee: fee_with_change,
                change: leftover_with_change as u64,
                deduction: 0,
            }
        } else {
            Candidate {
                with_change: false,
                fee: available as u64,
                change: 0,
                deduction: 0,
            }
        })
    }
}

/// Lock time that discourages fee sniping
///
/// Uses the current tip height, occasionally backed off by up to
/// `MAX_LOCKTIME_BACKOFF` blocks so that delayed broadcasts do not stand
/// out. Without a known tip the lock time is zero.
pub fn anti_fee_sniping_locktime(chain: Option<&dyn ChainState>, rng: &mut dyn RngCore) -> LockTime {
    let height = match chain.and_then(|chain| chain.current_height_and_tip_hash()) {
        Some((height, _)) => height,
        None => return LockTime::ZERO,
    };

    let height = if rng.random_bool(0.1) {
        height.saturating_sub(rng.random_range(0..MAX_LOCKTIME_BACKOFF))
    } else {
        height
    };

    LockTime::from_height(height).unwrap_or(LockTime::ZERO)
}

/// Check a finished transaction against the draft it came from
///
/// The signer may only add signatures. Inputs and outputs must match the
/// draft exactly, value must balance, and no output may be dust.
///
/// # Errors
/// * `InternalInvariant` naming the first check that failed
pub fn verify_transaction(transaction: &Transaction, draft: &DraftTransaction) -> Result<(), SpendError> {
    let spent: Vec<OutPoint> = transaction.input.iter().map(|input| input.previous_output).collect();
    if spent != draft.outpoints() {
        return Err(SpendError::InternalInvariant(
            "transaction inputs differ from the selected coins".to_string(),
        ));
    }

    let unique: HashSet<&OutPoint> = spent.iter().collect();
    if unique.len() != spent.len() {
        return Err(SpendError::InternalInvariant("transaction spends a coin twice".to_string()));
    }

    if transaction.output != draft.outputs {
        return Err(SpendError::InternalInvariant(
            "transaction outputs differ from the assembled draft".to_string(),
        ));
    }

    let output_value: u64 = transaction.output.iter().map(|output| output.value).sum();
    if draft.input_value().to_sat() != output_value + draft.fee.to_sat() {
        return Err(SpendError::InternalInvariant(format!(
            "inputs {} do not equal outputs {} plus fee {}",
            draft.input_value().to_sat(),
            output_value,
            draft.fee.to_sat()
        )));
    }

    let dust = transaction.output.iter().position(|output| {
        math::is_dust(Amount::from_sat(output.value), &output.script_pubkey, defaults::DUST_RELAY_FEE)
    });
    if let Some(index) = dust {
        return Err(SpendError::InternalInvariant(format!("output {} is dust", index)));
    }

    Ok(())
}

/// Errors a signer can report
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignerError {
    #[error("No key available for input {0}")]
    MissingKey(OutPoint),

    #[error("Signer rejected the transaction: {0}")]
    Rejected(String),

    #[error("Signer unavailable: {0}")]
    Unavailable(String),
}

impl From<SignerError> for SpendError {
    fn from(err: SignerError) -> Self {
        SpendError::SignFailure(err.to_string())
    }
}

/// A signed transaction and its actual weight
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub transaction: Transaction,
    pub weight: u64,
}

/// Produces signatures for a constructed transaction
pub trait TransactionSigner: Send + Sync {
    /// Sign every input of `unsigned`
    ///
    /// `inputs` holds the coins being spent, in input order.
    fn sign(&self, unsigned: &Transaction, inputs: &[Utxo]) -> Result<SignedTransaction, SignerError>;
}

/// Sign a draft and check the result
///
/// # Errors
/// * `SignFailure` if the signer fails
/// * `InternalInvariant` if the signed transaction does not match the draft
pub fn sign_draft(
    signer: &dyn TransactionSigner,
    draft: &DraftTransaction,
    unsigned: &Transaction,
) -> Result<SignedTransaction, SpendError> {
    let signed = signer.sign(unsigned, &draft.inputs)?;
    verify_transaction(&signed.transaction, draft)?;

    log_spend(
        LogLevel::Debug,
        LogContext::Signing,
        "transaction signed",
        Some(json!({ "txid": signed.transaction.txid().to_string(), "weight": signed.weight })),
    );
    Ok(signed)
}

/// Realized fee rate of `fee` over `weight`
pub fn realized_fee_rate(fee: Amount, weight: u64) -> FeeRate {
    if weight == 0 {
        return FeeRate::ZERO;
    }
    FeeRate::from_sat_per_kwu(fee.to_sat() * 1000 / weight)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum MockSignerMode {
    Honest,
    Failing(String),
    Tampering,
}

/// Signer producing placeholder signatures of realistic size
///
/// Signatures are 71 bytes, one shorter than the size estimates assume, so
/// realized weights come out slightly below the estimate the way real
/// low-R signatures often do. Not for production use.
#[derive(Debug)]
pub struct MockSigner {
    mode: MockSignerMode,
    calls: AtomicUsize,
}

impl Default for MockSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSigner {
    pub fn new() -> Self {
        Self {
            mode: MockSignerMode::Honest,
            calls: AtomicUsize::new(0),
        }
    }

    /// A signer that always refuses
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            mode: MockSignerMode::Failing(reason.into()),
            calls: AtomicUsize::new(0),
        }
    }

    /// A signer that quietly moves one satoshi into the first output
    pub fn tampering() -> Self {
        Self {
            mode: MockSignerMode::Tampering,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of sign requests received
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TransactionSigner for MockSigner {
    fn sign(&self, unsigned: &Transaction, inputs: &[Utxo]) -> Result<SignedTransaction, SignerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let MockSignerMode::Failing(reason) = &self.mode {
            return Err(SignerError::Rejected(reason.clone()));
        }
        if inputs.len() != unsigned.input.len() {
            return Err(SignerError::Rejected(format!(
                "{} coins given for {} inputs",
                inputs.len(),
                unsigned.input.len()
            )));
        }

        let signature = vec![0x30u8; 71];
        let pubkey = vec![0x02u8; 33];
        let mut transaction = unsigned.clone();

        for (input, utxo) in transaction.input.iter_mut().zip(inputs) {
            match utxo.output_type() {
                Some(OutputType::Bech32) => {
                    input.witness = Witness::from_slice(&[signature.clone(), pubkey.clone()]);
                }
                Some(OutputType::P2shSegwit) => {
                    let mut redeem = vec![0x16, 0x00, 0x14];
                    redeem.extend_from_slice(&[0u8; 20]);
                    input.script_sig = ScriptBuf::from_bytes(redeem);
                    input.witness = Witness::from_slice(&[signature.clone(), pubkey.clone()]);
                }
                Some(OutputType::Bech32m) => {
                    input.witness = Witness::from_slice(&[vec![0x01u8; 64]]);
                }
                Some(OutputType::Legacy) => {
                    let mut script_sig = vec![signature.len() as u8];
                    script_sig.extend_from_slice(&signature);
                    script_sig.push(pubkey.len() as u8);
                    script_sig.extend_from_slice(&pubkey);
                    input.script_sig = ScriptBuf::from_bytes(script_sig);
                }
                None => return Err(SignerError::MissingKey(utxo.outpoint)),
            }
        }

        if self.mode == MockSignerMode::Tampering {
            if let Some(output) = transaction.output.first_mut() {
                output.value += 1;
            }
        }

        let weight = transaction.weight().to_wu();
        Ok(SignedTransaction { transaction, weight })
    }
}
