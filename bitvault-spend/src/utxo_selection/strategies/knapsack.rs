//! Knapsack selection
//!
//! Randomized subset sum approximation. Groups smaller than the target plus
//! the minimum change are candidates for a combination; the smallest group
//! larger than that is kept as a fallback. A stochastic search then looks
//! for the combination that overshoots the target by the least, first
//! aiming for an exact match and then for room for a change output.
//!
//! The combination is finally weighed against the single group with the
//! lowest waste that covers the target on its own, which is found without
//! randomness.

use log::trace;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore};

use crate::utxo_selection::strategies::utils::calculate_waste;
use crate::utxo_selection::strategies::Strategy;
use crate::utxo_selection::types::{OutputGroup, SelectionAlgorithm, SelectionParams};

/// Random restarts of the subset search
pub const APPROXIMATE_ITERATIONS: usize = 1_000;

/// Strategy approximating the smallest combination that reaches the target
#[derive(Debug, Clone)]
pub struct KnapsackStrategy {
    iterations: usize,
}

impl Default for KnapsackStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl KnapsackStrategy {
    /// Create a strategy with the default iteration count
    pub fn new() -> Self {
        Self {
            iterations: APPROXIMATE_ITERATIONS,
        }
    }
}

impl Strategy for KnapsackStrategy {
    fn algorithm(&self) -> SelectionAlgorithm {
        SelectionAlgorithm::Knapsack
    }

    fn select(
        &self,
        groups: &[OutputGroup],
        target: i64,
        params: &SelectionParams,
        rng: &mut dyn RngCore,
    ) -> Option<Vec<usize>> {
        let combined = self.combine(groups, target, params, rng)?;
        let combined_waste = calculate_waste(combined.iter().map(|&index| &groups[index]), target, params);

        match lowest_waste_single(groups, target, params) {
            Some((single, waste)) if waste < combined_waste => {
                trace!("Single group {} beats the combination, waste {} < {}", single, waste, combined_waste);
                Some(vec![single])
            }
            _ => Some(combined),
        }
    }
}

impl KnapsackStrategy {
    fn combine(
        &self,
        groups: &[OutputGroup],
        target: i64,
        params: &SelectionParams,
        rng: &mut dyn RngCore,
    ) -> Option<Vec<usize>> {
        let change_target = params.min_change.to_sat() as i64;

        let mut order: Vec<usize> = (0..groups.len()).collect();
        order.shuffle(rng);

        let mut applicable: Vec<usize> = Vec::new();
        let mut total_lower = 0i64;
        let mut lowest_larger: Option<usize> = None;

        for index in order {
            let value = groups[index].effective_value;
            if value == target {
                return Some(vec![index]);
            } else if value < target + change_target {
                applicable.push(index);
                total_lower += value;
            } else if lowest_larger.map_or(true, |larger| value < groups[larger].effective_value) {
                lowest_larger = Some(index);
            }
        }

        if total_lower == target {
            return Some(applicable);
        }

        if total_lower < target {
            return lowest_larger.map(|larger| vec![larger]);
        }

        applicable.sort_by(|&a, &b| groups[b].effective_value.cmp(&groups[a].effective_value));
        let values: Vec<i64> = applicable.iter().map(|&i| groups[i].effective_value).collect();

        let (mut best, mut best_value) = approximate_best_subset(rng, &values, total_lower, target, self.iterations);
        if best_value != target && total_lower >= target + change_target {
            let (retry, retry_value) =
                approximate_best_subset(rng, &values, total_lower, target + change_target, self.iterations);
            best = retry;
            best_value = retry_value;
        }

        // The single larger group wins when the combination misses both goals or is not smaller
        if let Some(larger) = lowest_larger {
            let missed = best_value != target && best_value < target + change_target;
            if missed || groups[larger].effective_value <= best_value {
                return Some(vec![larger]);
            }
        }

        trace!("Knapsack combination of {} groups totals {}", best.iter().filter(|b| **b).count(), best_value);

        Some(
            applicable
                .into_iter()
                .zip(best)
                .filter_map(|(index, included)| included.then_some(index))
                .collect(),
        )
    }
}

/// The group covering `target` alone with the lowest waste, and that waste
///
/// Ties go to the smaller group, then to the earlier one.
fn lowest_waste_single(groups: &[OutputGroup], target: i64, params: &SelectionParams) -> Option<(usize, i64)> {
    groups
        .iter()
        .enumerate()
        .filter(|(_, group)| group.effective_value >= target)
        .map(|(index, group)| (index, calculate_waste(std::iter::once(group), target, params)))
        .min_by_key(|&(index, waste)| (waste, groups[index].effective_value, index))
}

/// Randomized search for the subset of `values` closest above `target`
///
/// Each iteration includes values at random on a first pass and fills in
/// the rest on a second pass, recording every subset that reaches the target
/// with less value than the best so far.
///
/// # Returns
/// * Inclusion flags and the subset's total; all values when nothing better is found
fn approximate_best_subset(
    rng: &mut dyn RngCore,
    values: &[i64],
    total_lower: i64,
    target: i64,
    iterations: usize,
) -> (Vec<bool>, i64) {
    let mut best = vec![true; values.len()];
    let mut best_value = total_lower;

    for _ in 0..iterations {
        if best_value == target {
            break;
        }

        let mut included = vec![false; values.len()];
        let mut total = 0i64;
        let mut reached_target = false;

        for pass in 0..2 {
            if reached_target {
                break;
            }
            for i in 0..values.len() {
                let take = if pass == 0 { rng.random_bool(0.5) } else { !included[i] };
                if !take {
                    continue;
                }

                total += values[i];
                included[i] = true;
                if total >= target {
                    reached_target = true;
                    if total < best_value {
                        best_value = total;
                        best = included.clone();
                    }
                    total -= values[i];
                    included[i] = false;
                }
            }
        }
    }

    (best, best_value)
}
