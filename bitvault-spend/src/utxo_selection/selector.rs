//! UTXO selector
//!
//! `UtxoSelector` is the context of the strategy pattern: it prices coins
//! into groups, walks the eligibility tiers from strictest to loosest, asks
//! every strategy for a candidate within a tier and keeps the candidate with
//! the lowest waste. Ties go to the candidate with fewer inputs, then to the
//! strategy that ran first.
//!
//! Coins the caller selected manually are always spent. Other coins are only
//! added when they are allowed and the manual ones do not cover the target.

use bitcoin::{Amount, OutPoint};
use log::debug;
use rand::RngCore;
use serde_json::json;
use std::collections::HashSet;

use crate::error::SpendError;
use crate::logging::{log_spend, LogContext, LogLevel};
use crate::utxo_selection::strategies::{default_strategies, utils, Strategy};
use crate::utxo_selection::types::{OutputGroup, Selection, SelectionAlgorithm, SelectionParams, Utxo};

/// Confirmation requirements for one eligibility tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EligibilityFilter {
    /// Confirmations needed for coins from our own transactions
    pub conf_mine: u32,
    /// Confirmations needed for coins received from others
    pub conf_theirs: u32,
}

impl EligibilityFilter {
    pub const fn new(conf_mine: u32, conf_theirs: u32) -> Self {
        Self { conf_mine, conf_theirs }
    }

    /// Whether `utxo` has enough confirmations for this tier
    pub fn accepts(&self, utxo: &Utxo) -> bool {
        let needed = if utxo.from_me { self.conf_mine } else { self.conf_theirs };
        utxo.confirmations >= needed
    }

    /// Tiers tried in order, strictest first
    ///
    /// # Arguments
    /// * `spend_zero_conf_change` - Allow unconfirmed coins from our own transactions
    /// * `include_unsafe` - Allow unconfirmed coins from others
    pub fn tiers(spend_zero_conf_change: bool, include_unsafe: bool) -> Vec<Self> {
        let mut tiers = vec![Self::new(1, 6), Self::new(1, 1)];
        if spend_zero_conf_change {
            tiers.push(Self::new(0, 1));
        }
        if include_unsafe {
            tiers.push(Self::new(0, 0));
        }
        tiers
    }
}

/// Everything one selection call needs besides the fee parameters
#[derive(Debug, Clone)]
pub struct SelectionRequest<'a> {
    /// Candidate coins, already filtered by coin control and reservations
    pub available: &'a [Utxo],
    /// Coins that must be spent, in the order they will appear as inputs
    pub presets: &'a [Utxo],
    /// Sum of the payment outputs
    pub payments: Amount,
    /// Additional value the inputs must cover, beyond the payments and fee
    pub extra_target: Amount,
    /// Whether coins beyond the presets may be added
    pub allow_other_inputs: bool,
    /// Eligibility tiers, strictest first
    pub tiers: Vec<EligibilityFilter>,
}

/// UTXO selector that composes several strategies
pub struct UtxoSelector {
    params: SelectionParams,
    strategies: Vec<Box<dyn Strategy>>,
}

impl UtxoSelector {
    /// Create a selector running branch and bound, knapsack and single random draw
    pub fn new(params: SelectionParams) -> Self {
        Self::with_strategies(params, default_strategies())
    }

    /// Create a selector with a custom strategy list
    pub fn with_strategies(params: SelectionParams, strategies: Vec<Box<dyn Strategy>>) -> Self {
        Self { params, strategies }
    }

    /// Fee and change parameters this selector prices coins with
    pub fn params(&self) -> &SelectionParams {
        &self.params
    }

    /// Select coins for `request`
    ///
    /// # Errors
    /// * `InsufficientFunds` when the eligible coins do not cover the payments
    /// * `InsufficientFundsAfterFee` when they cover the payments but not the fee
    /// * `MissingSolvingData` when a coin cannot be sized
    pub fn select(&self, request: &SelectionRequest<'_>, rng: &mut dyn RngCore) -> Result<Selection, SpendError> {
        let params = &self.params;
        let target = params
            .selection_target(request.payments)?
            .checked_add_unsigned(request.extra_target.to_sat())
            .ok_or_else(|| SpendError::InvalidRequest(format!("Target raised by {} overflows", request.extra_target)))?;

        let preset_groups = request
            .presets
            .iter()
            .cloned()
            .map(|utxo| OutputGroup::new(vec![utxo], params, true))
            .collect::<Result<Vec<_>, _>>()?;
        let preset_effective: i64 = preset_groups.iter().map(|group| group.effective_value).sum();

        if !preset_groups.is_empty() && preset_effective >= target {
            debug!("Manually selected coins cover target {}", target);
            return Ok(self.finish(preset_groups, Vec::new(), SelectionAlgorithm::Manual, target));
        }

        if !request.allow_other_inputs {
            return Err(self.insufficient(request, &[]));
        }

        let preset_outpoints: HashSet<OutPoint> = request.presets.iter().map(|utxo| utxo.outpoint).collect();
        let candidates: Vec<Utxo> = request
            .available
            .iter()
            .filter(|utxo| !preset_outpoints.contains(&utxo.outpoint))
            .cloned()
            .collect();
        let groups = utils::group_outputs(candidates, params)?;
        let remaining = target - preset_effective;

        for tier in &request.tiers {
            let eligible: Vec<OutputGroup> = groups
                .iter()
                .filter(|group| group.effective_value > 0 && group.utxos.iter().all(|utxo| tier.accepts(utxo)))
                .cloned()
                .collect();
            if eligible.is_empty() {
                continue;
            }

            if let Some((algorithm, picked)) = self.choose(&eligible, remaining, rng) {
                let chosen = picked.into_iter().map(|index| eligible[index].clone()).collect();
                return Ok(self.finish(preset_groups, chosen, algorithm, target));
            }

            debug!(
                "No selection in tier ({}, {}) from {} groups",
                tier.conf_mine,
                tier.conf_theirs,
                eligible.len()
            );
        }

        let eligible: Vec<&Utxo> = groups
            .iter()
            .flat_map(|group| group.utxos.iter())
            .filter(|utxo| request.tiers.iter().any(|tier| tier.accepts(utxo)))
            .collect();
        Err(self.insufficient(request, &eligible))
    }

    /// Run every strategy and keep the best candidate
    fn choose(
        &self,
        groups: &[OutputGroup],
        target: i64,
        rng: &mut dyn RngCore,
    ) -> Option<(SelectionAlgorithm, Vec<usize>)> {
        let mut best: Option<(SelectionAlgorithm, Vec<usize>, i64, usize)> = None;

        for strategy in &self.strategies {
            let picked = match strategy.select(groups, target, &self.params, rng) {
                Some(picked) => picked,
                None => continue,
            };

            let waste = utils::calculate_waste(picked.iter().map(|&index| &groups[index]), target, &self.params);
            let inputs: usize = picked.iter().map(|&index| groups[index].utxos.len()).sum();
            debug!(
                "{} found {} groups, {} inputs, waste {}",
                strategy.algorithm(),
                picked.len(),
                inputs,
                waste
            );

            let better = match &best {
                None => true,
                Some((_, _, best_waste, best_inputs)) => {
                    waste < *best_waste || (waste == *best_waste && inputs < *best_inputs)
                }
            };
            if better {
                best = Some((strategy.algorithm(), picked, waste, inputs));
            }
        }

        best.map(|(algorithm, picked, _, _)| (algorithm, picked))
    }

    fn finish(
        &self,
        presets: Vec<OutputGroup>,
        chosen: Vec<OutputGroup>,
        algorithm: SelectionAlgorithm,
        target: i64,
    ) -> Selection {
        let mut groups = presets;
        groups.extend(chosen);
        let waste = utils::calculate_waste(&groups, target, &self.params);

        let selection = Selection {
            groups,
            algorithm,
            target,
            waste,
        };

        log_spend(
            LogLevel::Debug,
            LogContext::Selection,
            "coins selected",
            Some(json!({
                "algorithm": algorithm.name(),
                "inputs": selection.input_count(),
                "target": target,
                "waste": waste,
            })),
        );

        selection
    }

    /// Classify a failed selection by whether the payments alone are covered
    fn insufficient(&self, request: &SelectionRequest<'_>, others: &[&Utxo]) -> SpendError {
        let available: Amount = request
            .presets
            .iter()
            .chain(others.iter().copied())
            .map(|utxo| utxo.amount)
            .sum();

        if available < request.payments {
            SpendError::InsufficientFunds {
                available,
                required: request.payments,
            }
        } else {
            SpendError::InsufficientFundsAfterFee {
                available,
                required: request.payments,
                fee_rate: self.params.effective_feerate,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fee_estimation::FeeRate;
    use bitcoin::{ScriptBuf, Txid};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::str::FromStr;

    fn script(tag: u8) -> ScriptBuf {
        ScriptBuf::from_bytes([vec![0x00, 0x14], vec![tag; 20]].concat())
    }

    fn coin(vout: u32, sats: u64, confirmations: u32) -> Utxo {
        let txid = Txid::from_str("6666666666666666666666666666666666666666666666666666666666666666").unwrap();
        Utxo::new(OutPoint::new(txid, vout), Amount::from_sat(sats), script(vout as u8), confirmations)
    }

    fn selector(fee_rate: FeeRate) -> UtxoSelector {
        UtxoSelector::new(SelectionParams::new(
            fee_rate,
            None,
            FeeRate::from_sat_per_vb(3),
            &script(200),
            &[124],
            false,
        ))
    }

    fn request<'a>(available: &'a [Utxo], presets: &'a [Utxo], payments: u64) -> SelectionRequest<'a> {
        SelectionRequest {
            available,
            presets,
            payments: Amount::from_sat(payments),
            extra_target: Amount::ZERO,
            allow_other_inputs: true,
            tiers: EligibilityFilter::tiers(true, false),
        }
    }

    #[test]
    fn test_tiers() {
        assert_eq!(EligibilityFilter::tiers(false, false).len(), 2);
        assert_eq!(
            EligibilityFilter::tiers(true, true),
            vec![
                EligibilityFilter::new(1, 6),
                EligibilityFilter::new(1, 1),
                EligibilityFilter::new(0, 1),
                EligibilityFilter::new(0, 0),
            ]
        );

        let change = coin(0, 1_000, 0).as_change();
        assert!(!EligibilityFilter::new(1, 1).accepts(&change));
        assert!(EligibilityFilter::new(0, 1).accepts(&change));
    }

    #[test]
    fn test_knapsack_scenario() {
        let coins = vec![coin(0, 5_000, 6), coin(1, 3_000, 6), coin(2, 2_000, 6)];
        let selector = selector(FeeRate::from_sat_per_kwu(100));
        let mut rng = StdRng::seed_from_u64(42);

        let selection = selector.select(&request(&coins, &[], 6_000), &mut rng).unwrap();
        let mut values: Vec<u64> = selection.utxos().map(|utxo| utxo.amount.to_sat()).collect();
        values.sort_unstable();
        assert_eq!(values, vec![2_000, 5_000]);
        assert_eq!(selection.target, 6_017);
    }

    #[test]
    fn test_lowest_waste_wins_at_high_fee() {
        // 1500 sat/kwu against a 10249 target: the 20000 coin alone wastes 798,
        // every combination of the smaller coins at least 1151
        let coins = vec![coin(0, 6_000, 6), coin(1, 20_000, 6), coin(2, 5_400, 6), coin(3, 5_500, 6)];
        let selector = selector(FeeRate::from_sat_per_kwu(1_500));

        for seed in 0..10 {
            let mut rng = StdRng::seed_from_u64(seed);
            let selection = selector.select(&request(&coins, &[], 10_000), &mut rng).unwrap();
            assert_eq!(selection.input_count(), 1);
            assert_eq!(selection.utxos().next().unwrap().amount, Amount::from_sat(20_000));
            assert_eq!(selection.waste, 798);
        }
    }

    #[test]
    fn test_target_overflow_is_invalid_request() {
        let coins = vec![coin(0, 5_000, 6)];
        let mut rng = StdRng::seed_from_u64(1);

        let err = selector(FeeRate::from_sat_per_kwu(100))
            .select(&request(&coins, &[], u64::MAX), &mut rng)
            .unwrap_err();
        assert!(matches!(err, SpendError::InvalidRequest(_)), "{:?}", err);
    }

    #[test]
    fn test_prefers_confirmed_tier() {
        // The unconfirmed change alone would be an exact match, but a confirmed coin covers the target
        let coins = vec![coin(0, 20_000, 10), coin(1, 6_000, 0).as_change()];
        let selector = selector(FeeRate::ZERO);
        let mut rng = StdRng::seed_from_u64(1);

        let selection = selector.select(&request(&coins, &[], 6_000), &mut rng).unwrap();
        assert!(selection.utxos().all(|utxo| utxo.confirmations > 0));
    }

    #[test]
    fn test_manual_selection_covers_target() {
        let coins = vec![coin(0, 50_000, 6), coin(1, 8_000, 6)];
        let presets = vec![coins[1].clone()];
        let selector = selector(FeeRate::from_sat_per_kwu(100));
        let mut rng = StdRng::seed_from_u64(1);

        let selection = selector.select(&request(&coins, &presets, 6_000), &mut rng).unwrap();
        assert_eq!(selection.algorithm, SelectionAlgorithm::Manual);
        assert_eq!(selection.input_count(), 1);
        assert_eq!(selection.utxos().next().unwrap().outpoint, coins[1].outpoint);
    }

    #[test]
    fn test_manual_selection_is_extended() {
        let coins = vec![coin(0, 50_000, 6), coin(1, 3_000, 6)];
        let presets = vec![coins[1].clone()];
        let selector = selector(FeeRate::from_sat_per_kwu(100));
        let mut rng = StdRng::seed_from_u64(1);

        let selection = selector.select(&request(&coins, &presets, 6_000), &mut rng).unwrap();
        assert_eq!(selection.input_count(), 2);
        assert!(selection.groups[0].preset);
        assert_eq!(selection.groups[0].utxos[0].outpoint, coins[1].outpoint);
    }

    #[test]
    fn test_manual_only_reports_insufficient() {
        let coins = vec![coin(0, 50_000, 6), coin(1, 3_000, 6)];
        let presets = vec![coins[1].clone()];
        let selector = selector(FeeRate::from_sat_per_kwu(100));
        let mut rng = StdRng::seed_from_u64(1);

        let mut request = request(&coins, &presets, 6_000);
        request.allow_other_inputs = false;
        let err = selector.select(&request, &mut rng).unwrap_err();
        assert_eq!(
            err,
            SpendError::InsufficientFunds {
                available: Amount::from_sat(3_000),
                required: Amount::from_sat(6_000),
            }
        );
    }

    #[test]
    fn test_insufficient_classification() {
        let coins = vec![coin(0, 5_000, 6), coin(1, 1_000, 6)];
        let mut rng = StdRng::seed_from_u64(1);

        let err = selector(FeeRate::from_sat_per_kwu(100))
            .select(&request(&coins, &[], 7_000), &mut rng)
            .unwrap_err();
        assert!(matches!(err, SpendError::InsufficientFunds { .. }));

        let err = selector(FeeRate::from_sat_per_kwu(100))
            .select(&request(&coins, &[], 6_000), &mut rng)
            .unwrap_err();
        assert!(matches!(err, SpendError::InsufficientFundsAfterFee { .. }));
    }
}
