//! Chain state used during construction
//!
//! The engine only needs the current tip to set a transaction's lock time.
//! Anything that tracks the chain (a node connection, an Electrum client)
//! can provide it through `ChainState`.

use bitcoin::hashes::Hash;
use bitcoin::BlockHash;
use std::sync::RwLock;

/// Source of the current chain tip
pub trait ChainState: Send + Sync {
    /// Height and hash of the best block, or `None` when not yet synced
    fn current_height_and_tip_hash(&self) -> Option<(u32, BlockHash)>;
}

/// Chain state with a settable tip, for tests and offline use
///
/// Using this mock in production would give transactions a lock time
/// unrelated to the real chain.
#[derive(Debug, Default)]
pub struct MockChainState {
    tip: RwLock<Option<(u32, BlockHash)>>,
}

impl MockChainState {
    /// Create a chain state with no known tip
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a chain state whose tip is at `height`
    pub fn at_height(height: u32) -> Self {
        let state = Self::new();
        state.set_height(height);
        state
    }

    /// Move the tip to `height`
    pub fn set_height(&self, height: u32) {
        let mut tip = match self.tip.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *tip = Some((height, BlockHash::all_zeros()));
    }

    /// Forget the tip, as if the wallet had not synced
    pub fn clear(&self) {
        let mut tip = match self.tip.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *tip = None;
    }
}

impl ChainState for MockChainState {
    fn current_height_and_tip_hash(&self) -> Option<(u32, BlockHash)> {
        match self.tip.read() {
            Ok(tip) => *tip,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_chain_state() {
        let chain = MockChainState::new();
        assert!(chain.current_height_and_tip_hash().is_none());

        chain.set_height(800_000);
        assert_eq!(chain.current_height_and_tip_hash().map(|(height, _)| height), Some(800_000));

        chain.clear();
        assert!(chain.current_height_and_tip_hash().is_none());
    }
}
