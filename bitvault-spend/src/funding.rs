//! Funding of partially built transactions
//!
//! `fund` completes a draft whose outputs are set but whose inputs may not
//! cover them. The draft's inputs are spent first and in their original
//! order; the engine adds coins and, if worthwhile, a change output. Draft
//! outputs keep their order and values unless they are marked to pay the
//! fee.
//!
//! The caller can ask for a minimum fee, for example the fee of a
//! transaction being replaced plus the shortfall it must still cover. The
//! settled fee never goes below it.

use bitcoin::Amount;
use std::collections::BTreeSet;

use crate::change::ChangePosition;
use crate::coin_control::CoinControl;
use crate::error::SpendError;
use crate::logging::LogContext;
use crate::spend::{AttemptPlan, ConstructedTransaction, SpendEngine};
use crate::transaction_builder::DraftTransaction;

/// A draft to fund and how to fund it
#[derive(Debug, Clone)]
pub struct FundRequest {
    /// Inputs to keep and outputs to pay
    pub draft: DraftTransaction,
    /// Floor on the final fee
    pub min_fee: Amount,
    /// Lock the coins the engine adds against later automatic selection
    pub lock_selected_unspents: bool,
    /// Draft output indices whose amounts pay the fee
    pub subtract_fee_from_outputs: BTreeSet<usize>,
    pub change_position: ChangePosition,
    pub coin_control: CoinControl,
    /// Sign the funded transaction
    pub sign: bool,
}

impl FundRequest {
    pub fn new(draft: DraftTransaction) -> Self {
        Self {
            draft,
            min_fee: Amount::ZERO,
            lock_selected_unspents: false,
            subtract_fee_from_outputs: BTreeSet::new(),
            change_position: ChangePosition::Random,
            coin_control: CoinControl::default(),
            sign: false,
        }
    }

    pub fn with_min_fee(mut self, min_fee: Amount) -> Self {
        self.min_fee = min_fee;
        self
    }

    pub fn lock_selected(mut self) -> Self {
        self.lock_selected_unspents = true;
        self
    }

    /// Have draft output `index` pay part of the fee
    pub fn subtract_fee_from(mut self, index: usize) -> Self {
        self.subtract_fee_from_outputs.insert(index);
        self
    }

    pub fn with_change_position(mut self, position: ChangePosition) -> Self {
        self.change_position = position;
        self
    }

    pub fn with_coin_control(mut self, coin_control: CoinControl) -> Self {
        self.coin_control = coin_control;
        self
    }

    pub fn signed(mut self) -> Self {
        self.sign = true;
        self
    }
}

impl SpendEngine {
    /// Add inputs and change to a draft until it pays its outputs and fee
    ///
    /// # Arguments
    /// * `request` - The draft and funding options
    ///
    /// # Returns
    /// The funded transaction; `added_inputs` lists the coins the engine chose
    ///
    /// # Errors
    /// * `InvalidRequest` for an out-of-range subtraction index or a draft
    ///   without outputs
    /// * `CoinUnavailable` if a draft input is reserved, locked or spent
    /// * `LockedUnspentsConflict` if locking was requested and the draft can
    ///   only be funded with locked coins, or an added coin cannot be locked
    /// * Any other construction error
    pub fn fund(&self, request: FundRequest) -> Result<ConstructedTransaction, SpendError> {
        let FundRequest {
            draft,
            min_fee,
            lock_selected_unspents,
            subtract_fee_from_outputs,
            change_position,
            coin_control,
            sign,
        } = request;

        if let Some(&index) = subtract_fee_from_outputs
            .iter()
            .find(|&&index| index >= draft.outputs.len())
        {
            return Err(SpendError::InvalidRequest(format!(
                "Subtract fee index {} is out of bounds for {} outputs",
                index,
                draft.outputs.len()
            )));
        }

        let plan = AttemptPlan {
            payments: draft.outputs,
            subtract_fee_from: subtract_fee_from_outputs,
            presets: draft.inputs,
            change_position,
            coin_control,
            min_fee,
            sign,
            lock_selected: lock_selected_unspents,
            context: LogContext::Funding,
        };

        self.run(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fund_request_builder() {
        let request = FundRequest::new(DraftTransaction::new(Vec::new(), Vec::new()))
            .with_min_fee(Amount::from_sat(500))
            .subtract_fee_from(1)
            .subtract_fee_from(0)
            .lock_selected();

        assert_eq!(request.min_fee, Amount::from_sat(500));
        assert!(request.lock_selected_unspents);
        assert_eq!(request.subtract_fee_from_outputs.iter().copied().collect::<Vec<_>>(), vec![0, 1]);
        assert!(!request.sign);
    }
}
