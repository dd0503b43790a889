//! Branch and bound selection
//!
//! Depth-first search for a set of groups whose effective value lands in
//! `[target, target + cost_of_change]`, so the transaction needs no change
//! output. Among the sets found, the one with the lowest waste wins.
//!
//! The search walks groups from largest to smallest effective value. Each
//! step either includes the next group or, on backtrack, explores the branch
//! that omits the most recently included one. A branch is cut when it can no
//! longer reach the target, when it overshoots the window, or when its waste
//! already exceeds the best known solution while fees are high. A solution
//! with zero waste ends the search.

use rand::RngCore;

use crate::fee_estimation::FeeRate;
use crate::utxo_selection::strategies::Strategy;
use crate::utxo_selection::types::{OutputGroup, SelectionAlgorithm, SelectionParams};

/// Number of search steps before giving up
pub const TOTAL_TRIES: usize = 100_000;

/// Strategy searching for a changeless selection
#[derive(Debug, Clone)]
pub struct BranchAndBoundStrategy {
    max_tries: usize,
}

impl Default for BranchAndBoundStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl BranchAndBoundStrategy {
    /// Create a strategy with the default step limit
    pub fn new() -> Self {
        Self { max_tries: TOTAL_TRIES }
    }
}

impl Strategy for BranchAndBoundStrategy {
    fn algorithm(&self) -> SelectionAlgorithm {
        SelectionAlgorithm::BranchAndBound
    }

    fn select(
        &self,
        groups: &[OutputGroup],
        target: i64,
        params: &SelectionParams,
        _rng: &mut dyn RngCore,
    ) -> Option<Vec<usize>> {
        // Recipients paying the fee leave no room for an exact match
        if params.subtract_fee_outputs {
            return None;
        }

        let cost_of_change = params.cost_of_change.to_sat() as i64;
        let is_feerate_high = params.effective_feerate > params.long_term_feerate.unwrap_or(FeeRate::ZERO);

        let mut pool: Vec<usize> = (0..groups.len())
            .filter(|&i| groups[i].effective_value > 0)
            .collect();
        pool.sort_by(|&a, &b| groups[b].effective_value.cmp(&groups[a].effective_value));

        let value = |pool_index: usize| groups[pool[pool_index]].effective_value;
        let waste = |pool_index: usize| groups[pool[pool_index]].input_waste();
        let fee = |pool_index: usize| groups[pool[pool_index]].fee;

        let mut curr_available: i64 = pool.iter().map(|&i| groups[i].effective_value).sum();
        if curr_available < target {
            return None;
        }

        let mut curr_value = 0i64;
        let mut curr_waste = 0i64;
        let mut curr_selection: Vec<usize> = Vec::new();
        let mut best_selection: Vec<usize> = Vec::new();
        let mut best_waste = i64::MAX;

        let mut pool_index = 0usize;
        for _ in 0..self.max_tries {
            let mut backtrack = false;

            if curr_value + curr_available < target
                || curr_value > target + cost_of_change
                || (curr_waste > best_waste && is_feerate_high)
            {
                backtrack = true;
            } else if curr_value >= target {
                let excess = curr_value - target;
                if curr_waste + excess <= best_waste {
                    best_selection = curr_selection.clone();
                    best_waste = curr_waste + excess;
                    if best_waste == 0 {
                        break;
                    }
                }
                backtrack = true;
            }

            if backtrack {
                let last = match curr_selection.last() {
                    Some(&last) => last,
                    None => break,
                };

                // Put the groups after the last inclusion back into the lookahead
                pool_index -= 1;
                while pool_index > last {
                    curr_available += value(pool_index);
                    pool_index -= 1;
                }

                curr_value -= value(pool_index);
                curr_waste -= waste(pool_index);
                curr_selection.pop();
            } else {
                curr_available -= value(pool_index);

                // Omitting a group and then including an identical one explores the same sets
                let skip_equivalent = match curr_selection.last() {
                    Some(&last) => {
                        last != pool_index - 1
                            && value(pool_index) == value(pool_index - 1)
                            && fee(pool_index) == fee(pool_index - 1)
                    }
                    None => false,
                };

                if !skip_equivalent {
                    curr_selection.push(pool_index);
                    curr_value += value(pool_index);
                    curr_waste += waste(pool_index);
                }
            }

            pool_index += 1;
        }

        if best_selection.is_empty() {
            return None;
        }

        Some(best_selection.into_iter().map(|pool_index| pool[pool_index]).collect())
    }
}
