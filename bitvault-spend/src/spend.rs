//! Spend engine
//!
//! `SpendEngine` runs construction and funding attempts against the
//! wallet's coins. One attempt:
//!
//! 1. snapshots the wallet policy and resolves the fee rate
//! 2. reserves a change destination
//! 3. takes the coarse coin-set lock
//! 4. selects coins and assembles a draft, selecting again with a larger
//!    target while the inputs fall short of the settled fee
//!
//!    Selection randomness is seeded from the candidate coins, payments and
//!    fee rate, so an unchanged wallet selects the same coins every time.
//!    The engine's own generator only places change and picks the lock time.
//! 5. reserves the chosen coins, which releases the lock
//! 6. signs and checks the result
//!
//! Every failure after step 5 drops the `ReservationHandle`, which returns
//! the coins to the pool. A successful attempt hands the handle to the
//! caller inside `ConstructedTransaction`.

use bitcoin::consensus::encode::serialize;
use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::{Amount, OutPoint, Transaction, TxOut, Txid};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use crate::change::{reserve_change, ChangeAddressSource, ChangePosition};
use crate::coin_control::CoinControl;
use crate::error::{ErrorCategory, SpendError};
use crate::events::{outpoint_infos, SpendEvent, SpendEventBus};
use crate::fee_estimation::{FeeEstimator, FeeRate, FeeRateOracle, FeeSource};
use crate::logging::{log_spend, sanitize_outpoint, LogContext, LogLevel};
use crate::math;
use crate::network_status::ChainState;
use crate::transaction_builder::{
    anti_fee_sniping_locktime, realized_fee_rate, sign_draft, verify_transaction, Assembly, AssemblyOutcome,
    DraftTransaction, TransactionAssembler, TransactionSigner,
};
use crate::types::Recipient;
use crate::utxo_management::{CoinFilter, ReservationHandle, ReservationLock, ReservationTable, UtxoSetView};
use crate::utxo_selection::{
    EligibilityFilter, Selection, SelectionAlgorithm, SelectionParams, SelectionRequest, Utxo, UtxoSelector,
};
use crate::wallet_state::WalletState;

/// Selections tried per attempt while the inputs fall short of the fee
pub const MAX_RESELECTIONS: usize = 4;

/// A constructed transaction and the coins it holds
///
/// The spent coins stay reserved while this value lives. Call `commit` once
/// the transaction is broadcast or stored, or `release` to give the coins
/// back; dropping it also releases them.
#[derive(Debug)]
pub struct ConstructedTransaction {
    /// Final transaction, signed if signing was requested
    pub transaction: Transaction,
    /// Draft the transaction was built from
    pub draft: DraftTransaction,
    /// Absolute fee
    pub fee: Amount,
    /// Weight of `transaction` once signed; estimated when unsigned
    pub weight: u64,
    /// Fee rate the transaction actually pays at `weight`
    pub fee_rate: FeeRate,
    /// Fee rate the attempt aimed for
    pub target_fee_rate: FeeRate,
    /// Where the target rate came from
    pub fee_source: FeeSource,
    /// Index of the change output, if any
    pub change_position: Option<usize>,
    /// Strategy whose selection was used
    pub algorithm: SelectionAlgorithm,
    /// Waste score of the selection
    pub waste: i64,
    /// Whether `transaction` carries signatures
    pub signed: bool,
    preset_inputs: usize,
    reservation: ReservationHandle,
}

impl ConstructedTransaction {
    pub fn txid(&self) -> Txid {
        self.transaction.txid()
    }

    /// Coins spent, in input order
    pub fn spent_outpoints(&self) -> &[OutPoint] {
        self.reservation.outpoints()
    }

    /// Inputs the engine added beyond the ones the caller supplied
    pub fn added_inputs(&self) -> &[Utxo] {
        &self.draft.inputs[self.preset_inputs..]
    }

    pub fn change_output(&self) -> Option<&TxOut> {
        self.draft.change_output()
    }

    /// Mark the spent coins as used and return the transaction
    pub fn commit(self) -> Transaction {
        self.reservation.commit();
        self.transaction
    }

    /// Give the spent coins back to the pool
    pub fn release(self) {
        self.reservation.release();
    }
}

/// One construction or funding attempt, described independently of the caller
#[derive(Debug, Clone)]
pub(crate) struct AttemptPlan {
    pub payments: Vec<TxOut>,
    pub subtract_fee_from: BTreeSet<usize>,
    pub presets: Vec<Utxo>,
    pub change_position: ChangePosition,
    pub coin_control: CoinControl,
    pub min_fee: Amount,
    pub sign: bool,
    pub lock_selected: bool,
    pub context: LogContext,
}

/// Transaction construction and funding engine
pub struct SpendEngine {
    view: Arc<dyn UtxoSetView>,
    oracle: FeeRateOracle,
    change_source: Arc<dyn ChangeAddressSource>,
    wallet_state: Arc<WalletState>,
    reservations: ReservationTable,
    signer: Option<Arc<dyn TransactionSigner>>,
    chain: Option<Arc<dyn ChainState>>,
    events: Option<Arc<SpendEventBus>>,
    rng: Mutex<StdRng>,
}

impl SpendEngine {
    /// Create an engine over the wallet's collaborators
    ///
    /// # Arguments
    /// * `view` - The wallet's coins
    /// * `estimator` - Fee estimates by confirmation target
    /// * `change_source` - Fresh internal change scripts
    /// * `wallet_state` - Wallet-wide policy
    pub fn new(
        view: Arc<dyn UtxoSetView>,
        estimator: Arc<dyn FeeEstimator>,
        change_source: Arc<dyn ChangeAddressSource>,
        wallet_state: Arc<WalletState>,
    ) -> Self {
        Self {
            view,
            oracle: FeeRateOracle::new(estimator),
            change_source,
            wallet_state,
            reservations: ReservationTable::new(),
            signer: None,
            chain: None,
            events: None,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Sign transactions with `signer` when an attempt asks for it
    pub fn with_signer(mut self, signer: Arc<dyn TransactionSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Use `chain` for anti-fee-sniping lock times
    pub fn with_chain_state(mut self, chain: Arc<dyn ChainState>) -> Self {
        self.chain = Some(chain);
        self
    }

    /// Publish attempt and reservation events on `bus`
    pub fn with_event_bus(mut self, bus: Arc<SpendEventBus>) -> Self {
        self.reservations = self.reservations.with_event_bus(Arc::clone(&bus));
        self.events = Some(bus);
        self
    }

    /// Share a reservation table with other engines over the same coins
    pub fn with_reservations(mut self, reservations: ReservationTable) -> Self {
        self.reservations = match &self.events {
            Some(bus) => reservations.with_event_bus(Arc::clone(bus)),
            None => reservations,
        };
        self
    }

    /// Make random choices reproducible
    pub fn with_rng_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    /// Reserved, locked and spent coins
    pub fn reservations(&self) -> &ReservationTable {
        &self.reservations
    }

    pub fn wallet_state(&self) -> &Arc<WalletState> {
        &self.wallet_state
    }

    /// Construct a transaction paying `recipients`
    ///
    /// # Arguments
    /// * `recipients` - Payments, in output order
    /// * `change_position` - Where change goes if there is any
    /// * `coin_control` - Per-attempt options
    /// * `sign` - Whether to sign the result
    ///
    /// # Returns
    /// The transaction with its spent coins reserved
    ///
    /// # Errors
    /// Any `SpendError`; reserved coins are released before it is returned
    pub fn construct(
        &self,
        recipients: &[Recipient],
        change_position: ChangePosition,
        coin_control: &CoinControl,
        sign: bool,
    ) -> Result<ConstructedTransaction, SpendError> {
        let plan = AttemptPlan {
            payments: recipients
                .iter()
                .map(|recipient| TxOut {
                    value: recipient.amount.to_sat(),
                    script_pubkey: recipient.script_pubkey.clone(),
                })
                .collect(),
            subtract_fee_from: recipients
                .iter()
                .enumerate()
                .filter(|(_, recipient)| recipient.subtract_fee_from_amount)
                .map(|(index, _)| index)
                .collect(),
            presets: Vec::new(),
            change_position,
            coin_control: coin_control.clone(),
            min_fee: Amount::ZERO,
            sign,
            lock_selected: false,
            context: LogContext::Assembly,
        };

        self.run(plan)
    }

    /// Run one attempt and report its failure
    pub(crate) fn run(&self, plan: AttemptPlan) -> Result<ConstructedTransaction, SpendError> {
        let context = plan.context;
        let result = self.attempt(plan);

        match &result {
            Ok(constructed) => log_spend(
                LogLevel::Info,
                context,
                "transaction constructed",
                Some(json!({
                    "txid": constructed.txid().to_string(),
                    "inputs": constructed.draft.inputs.len(),
                    "outputs": constructed.draft.outputs.len(),
                    "fee": constructed.fee.to_sat(),
                    "weight": constructed.weight,
                    "algorithm": constructed.algorithm.name(),
                })),
            ),
            Err(e) => {
                log_spend(
                    LogLevel::Warn,
                    context,
                    "attempt failed",
                    Some(json!({ "category": e.category().as_str(), "error": e.to_string() })),
                );
                self.publish(SpendEvent::ConstructionFailed { reason: e.to_string() });
            }
        }

        result
    }

    fn attempt(&self, plan: AttemptPlan) -> Result<ConstructedTransaction, SpendError> {
        let mut rng = StdRng::seed_from_u64(self.next_seed());
        let policy = self.wallet_state.snapshot();
        let coin_control = &plan.coin_control;

        let resolved = self.oracle.rate_for(coin_control, &policy)?;
        let discard_rate = self.oracle.discard_rate(&policy);
        let long_term_rate = self.oracle.long_term_rate(&policy);
        debug!("Fee rate {} from {:?}, discard rate {}", resolved.rate, resolved.source, discard_rate);

        plan.change_position.validate(plan.payments.len())?;

        let change = reserve_change(
            &self.change_source,
            coin_control,
            &policy,
            plan.payments.iter().map(|output| output.script_pubkey.as_script()),
        )?;

        let payment_weights: Vec<u64> = plan
            .payments
            .iter()
            .map(|output| math::output_weight(&output.script_pubkey))
            .collect();
        let params = SelectionParams::new(
            resolved.rate,
            long_term_rate,
            discard_rate,
            change.script(),
            &payment_weights,
            !plan.subtract_fee_from.is_empty(),
        )
        .with_avoid_partial_spends(policy.avoid_partial_spends || coin_control.avoid_partial_spends);

        let assembler = TransactionAssembler::new(plan.payments.clone(), change.script().to_owned(), resolved.rate)
            .with_subtract_fee_from(plan.subtract_fee_from.clone())
            .with_change_position(plan.change_position)
            .with_min_fee(plan.min_fee)
            .with_change_dust(params.change_dust)
            .with_max_tx_fee(policy.max_tx_fee);
        assembler.check_payments()?;

        let selector = UtxoSelector::new(params);
        let tiers = EligibilityFilter::tiers(policy.spend_zero_conf_change, coin_control.include_unsafe_inputs);

        let lock = self.reservations.begin();
        let presets = self.resolve_presets(&plan, &lock)?;
        let filter = CoinFilter::from_coin_control(coin_control);
        let coins = self.view.spendable_coins(&filter);

        let available: Vec<Utxo> = coins
            .iter()
            .filter(|utxo| lock.is_available(&utxo.outpoint))
            .cloned()
            .collect();
        let outcome = self.select_and_assemble(
            &selector,
            &assembler,
            &available,
            &presets,
            coin_control,
            &tiers,
            &mut rng,
        );

        let (selection, assembly) = match outcome {
            Ok(found) => found,
            Err(e) if plan.lock_selected && e.category() == ErrorCategory::Funds => {
                // Would the attempt have worked with the locked coins?
                let with_locked: Vec<Utxo> = coins
                    .iter()
                    .filter(|utxo| lock.is_unclaimed(&utxo.outpoint))
                    .cloned()
                    .collect();
                let retry = self.select_and_assemble(
                    &selector,
                    &assembler,
                    &with_locked,
                    &presets,
                    coin_control,
                    &tiers,
                    &mut rng,
                );
                return Err(match retry {
                    Ok((_, assembly)) => SpendError::LockedUnspentsConflict {
                        outpoints: assembly
                            .draft
                            .outpoints()
                            .into_iter()
                            .filter(|outpoint| lock.is_locked(outpoint))
                            .collect(),
                    },
                    Err(_) => e,
                });
            }
            Err(e) => return Err(e),
        };

        let reservation = lock.reserve(assembly.draft.outpoints())?;
        let draft = assembly.draft;

        let lock_time = anti_fee_sniping_locktime(self.chain.as_deref(), &mut rng);
        let signal_rbf = coin_control.signal_bip125_rbf.unwrap_or(policy.signal_rbf);
        let unsigned = draft.to_unsigned_transaction(lock_time, signal_rbf);

        let (transaction, weight) = if plan.sign {
            let signer = self
                .signer
                .as_ref()
                .ok_or_else(|| SpendError::SignFailure("No signer is configured".to_string()))?;
            let signed = sign_draft(signer.as_ref(), &draft, &unsigned)?;
            (signed.transaction, signed.weight)
        } else {
            verify_transaction(&unsigned, &draft)?;
            (unsigned, assembly.weight)
        };

        if plan.lock_selected {
            let added: Vec<OutPoint> = draft.inputs[presets.len()..].iter().map(|utxo| utxo.outpoint).collect();
            reservation.lock(&added)?;
        }

        if draft.change_position.is_some() {
            change.keep();
        } else {
            drop(change);
        }

        self.publish(SpendEvent::CoinsSelected {
            utxos: outpoint_infos(reservation.outpoints()),
            algorithm: selection.algorithm.name().to_string(),
            target_amount: selection.target.max(0) as u64,
            waste: selection.waste,
        });
        if assembly.excess_to_fee > Amount::ZERO {
            info!("Adding {} of leftover value to the fee", assembly.excess_to_fee);
            self.publish(SpendEvent::ExcessToFee {
                amount: assembly.excess_to_fee.to_sat(),
            });
        }

        Ok(ConstructedTransaction {
            fee: draft.fee,
            fee_rate: realized_fee_rate(draft.fee, weight),
            target_fee_rate: resolved.rate,
            fee_source: resolved.source,
            change_position: draft.change_position,
            algorithm: selection.algorithm,
            waste: selection.waste,
            signed: plan.sign,
            preset_inputs: presets.len(),
            transaction,
            weight,
            draft,
            reservation,
        })
    }

    /// Select coins and settle the fee, raising the target on shortfall
    #[allow(clippy::too_many_arguments)]
    fn select_and_assemble(
        &self,
        selector: &UtxoSelector,
        assembler: &TransactionAssembler,
        available: &[Utxo],
        presets: &[Utxo],
        coin_control: &CoinControl,
        tiers: &[EligibilityFilter],
        rng: &mut StdRng,
    ) -> Result<(Selection, Assembly), SpendError> {
        let mut candidates = available.to_vec();
        candidates.sort_by_key(|utxo| utxo.outpoint);
        let mut selection_rng = seeded_selection_rng(&candidates, presets, assembler.payments(), selector.params());
        let mut extra_target = Amount::ZERO;

        for round in 0..MAX_RESELECTIONS {
            let request = SelectionRequest {
                available: &candidates,
                presets,
                payments: assembler.payment_value(),
                extra_target,
                allow_other_inputs: coin_control.allow_other_inputs,
                tiers: tiers.to_vec(),
            };
            let selection = selector.select(&request, &mut selection_rng)?;
            let inputs: Vec<Utxo> = selection.utxos().cloned().collect();

            match assembler.assemble(&inputs, rng)? {
                AssemblyOutcome::Assembled(assembly) => return Ok((selection, assembly)),
                AssemblyOutcome::Shortfall(shortfall) => {
                    debug!("Selection {} short by {}, selecting again", round, shortfall);
                    extra_target += shortfall;
                }
            }
        }

        warn!("No sufficient selection after {} rounds", MAX_RESELECTIONS);
        let total: Amount = presets.iter().chain(available).map(|utxo| utxo.amount).sum();
        Err(SpendError::InsufficientFundsAfterFee {
            available: total,
            required: assembler.payment_value(),
            fee_rate: selector.params().effective_feerate,
        })
    }

    /// Coins the attempt must spend, in input order
    ///
    /// Inputs already on the plan come first, then coins selected in coin
    /// control. Each must be free; coin control selections must also be
    /// known to the wallet.
    fn resolve_presets(&self, plan: &AttemptPlan, lock: &ReservationLock<'_>) -> Result<Vec<Utxo>, SpendError> {
        let mut presets: Vec<Utxo> = Vec::with_capacity(plan.presets.len());

        for utxo in &plan.presets {
            if !lock.is_available(&utxo.outpoint) || presets.iter().any(|p| p.outpoint == utxo.outpoint) {
                return Err(SpendError::CoinUnavailable(utxo.outpoint));
            }
            presets.push(utxo.clone());
        }

        for outpoint in plan.coin_control.selected() {
            if presets.iter().any(|p| p.outpoint == *outpoint) {
                continue;
            }
            if !lock.is_available(outpoint) {
                return Err(SpendError::CoinUnavailable(*outpoint));
            }
            match self.view.coin(outpoint) {
                Some(utxo) => presets.push(utxo),
                None => {
                    debug!("Selected coin {} is unknown", sanitize_outpoint(outpoint));
                    return Err(SpendError::CoinUnavailable(*outpoint));
                }
            }
        }

        Ok(presets)
    }

    fn next_seed(&self) -> u64 {
        match self.rng.lock() {
            Ok(mut rng) => rng.random(),
            Err(poisoned) => poisoned.into_inner().random(),
        }
    }

    fn publish(&self, event: SpendEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}

/// Generator for coin selection, seeded from what is being selected
///
/// Presets are hashed in input order and `available` in the order given,
/// which callers keep sorted by outpoint.
fn seeded_selection_rng(available: &[Utxo], presets: &[Utxo], payments: &[TxOut], params: &SelectionParams) -> StdRng {
    let mut engine = sha256::Hash::engine();
    engine.input(&params.effective_feerate.sat_per_kwu().to_le_bytes());
    engine.input(&[params.subtract_fee_outputs as u8, params.avoid_partial_spends as u8]);

    engine.input(&(payments.len() as u64).to_le_bytes());
    for payment in payments {
        engine.input(&serialize(payment));
    }

    engine.input(&(presets.len() as u64).to_le_bytes());
    for utxo in presets.iter().chain(available) {
        engine.input(&serialize(&utxo.outpoint));
        engine.input(&utxo.amount.to_sat().to_le_bytes());
    }

    StdRng::from_seed(sha256::Hash::from_engine(engine).to_byte_array())
}
