//! Single random draw selection
//!
//! Shuffles the groups and takes them in that order until the target plus
//! room for a change output is covered.

use rand::seq::SliceRandom;
use rand::RngCore;

use crate::utxo_selection::strategies::Strategy;
use crate::utxo_selection::types::{OutputGroup, SelectionAlgorithm, SelectionParams};

/// Strategy drawing random groups until a change output is affordable
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleRandomDrawStrategy;

impl Strategy for SingleRandomDrawStrategy {
    fn algorithm(&self) -> SelectionAlgorithm {
        SelectionAlgorithm::SingleRandomDraw
    }

    fn select(
        &self,
        groups: &[OutputGroup],
        target: i64,
        params: &SelectionParams,
        rng: &mut dyn RngCore,
    ) -> Option<Vec<usize>> {
        let needed = target + params.min_change.to_sat() as i64;

        let mut order: Vec<usize> = (0..groups.len()).collect();
        order.shuffle(rng);

        let mut selected = Vec::new();
        let mut selected_value = 0i64;
        for index in order {
            selected.push(index);
            selected_value += groups[index].effective_value;
            if selected_value >= needed {
                return Some(selected);
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fee_estimation::FeeRate;
    use crate::utxo_selection::strategies::utils::group_outputs;
    use crate::utxo_selection::types::Utxo;
    use bitcoin::{Amount, OutPoint, ScriptBuf, Txid};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::str::FromStr;

    fn script() -> ScriptBuf {
        ScriptBuf::from_bytes([vec![0x00, 0x14], vec![5u8; 20]].concat())
    }

    #[test]
    fn test_draws_until_change_is_affordable() {
        let params = SelectionParams::new(FeeRate::ZERO, None, FeeRate::from_sat_per_vb(3), &script(), &[124], false);
        let txid = Txid::from_str("5555555555555555555555555555555555555555555555555555555555555555").unwrap();
        let coins = (0..10)
            .map(|vout| Utxo::new(OutPoint::new(txid, vout), Amount::from_sat(1_000), script(), 6))
            .collect();
        let groups = group_outputs(coins, &params).unwrap();

        for seed in 0..10 {
            let mut rng = StdRng::seed_from_u64(seed);
            let picked = SingleRandomDrawStrategy.select(&groups, 3_000, &params, &mut rng).unwrap();
            // 3000 plus 294 of change dust needs four coins
            assert_eq!(picked.len(), 4);
        }

        let mut rng = StdRng::seed_from_u64(0);
        assert!(SingleRandomDrawStrategy.select(&groups, 9_800, &params, &mut rng).is_none());
    }
}
