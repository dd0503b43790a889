//! UTXO selection strategies
//!
//! Each strategy is a pure search over an immutable slice of groups. It
//! returns the indices of the groups it would spend, or `None` when it
//! cannot reach the target. Comparing the candidates is left to the
//! selector.

use rand::RngCore;

use crate::utxo_selection::types::{OutputGroup, SelectionAlgorithm, SelectionParams};

pub mod branch_and_bound;
pub mod knapsack;
pub mod single_random_draw;
pub mod utils;

// Re-export implementations
pub use branch_and_bound::BranchAndBoundStrategy;
pub use knapsack::KnapsackStrategy;
pub use single_random_draw::SingleRandomDrawStrategy;

/// Trait defining a UTXO selection strategy
///
/// Any struct implementing this trait can be used as a strategy
/// for UTXO selection.
pub trait Strategy: Send + Sync {
    /// Algorithm this strategy implements
    fn algorithm(&self) -> SelectionAlgorithm;

    /// Select groups using this strategy
    ///
    /// # Arguments
    /// * `groups` - Candidate groups, all with positive effective value
    /// * `target` - Effective value the selection must reach
    /// * `params` - Fee and change parameters of the attempt
    /// * `rng` - Randomness source for shuffling and sampling
    ///
    /// # Returns
    /// * Indices into `groups`, or `None` if the strategy found nothing
    fn select(
        &self,
        groups: &[OutputGroup],
        target: i64,
        params: &SelectionParams,
        rng: &mut dyn RngCore,
    ) -> Option<Vec<usize>>;
}

/// The strategies tried for every selection, in tie-break order
pub fn default_strategies() -> Vec<Box<dyn Strategy>> {
    vec![
        Box::new(BranchAndBoundStrategy::new()),
        Box::new(KnapsackStrategy::new()),
        Box::new(SingleRandomDrawStrategy),
    ]
}
