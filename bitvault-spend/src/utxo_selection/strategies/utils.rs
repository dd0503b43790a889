//! Utility functions for UTXO selection
//!
//! Grouping of coins and the waste metric shared by every strategy.

use std::collections::HashMap;

use bitcoin::ScriptBuf;

use crate::error::SpendError;
use crate::utxo_selection::types::{OutputGroup, SelectionParams, Utxo};

/// Largest number of coins placed in one group when grouping by script
pub const OUTPUT_GROUP_MAX_ENTRIES: usize = 100;

/// Build selection groups from coins
///
/// Without `avoid_partial_spends` every coin is its own group. With it,
/// coins paying the same script are grouped in the order they are first
/// seen, and a script with more than `OUTPUT_GROUP_MAX_ENTRIES` coins is
/// split into several groups.
///
/// # Errors
/// * `MissingSolvingData` if a coin cannot be sized
pub fn group_outputs(utxos: Vec<Utxo>, params: &SelectionParams) -> Result<Vec<OutputGroup>, SpendError> {
    if !params.avoid_partial_spends {
        return utxos
            .into_iter()
            .map(|utxo| OutputGroup::new(vec![utxo], params, false))
            .collect();
    }

    let mut order: Vec<ScriptBuf> = Vec::new();
    let mut by_script: HashMap<ScriptBuf, Vec<Vec<Utxo>>> = HashMap::new();

    for utxo in utxos {
        let chunks = by_script.entry(utxo.script_pubkey.clone()).or_insert_with(|| {
            order.push(utxo.script_pubkey.clone());
            Vec::new()
        });
        match chunks.last_mut() {
            Some(chunk) if chunk.len() < OUTPUT_GROUP_MAX_ENTRIES => chunk.push(utxo),
            _ => chunks.push(vec![utxo]),
        }
    }

    let mut groups = Vec::new();
    for script in order {
        for chunk in by_script.remove(&script).unwrap_or_default() {
            groups.push(OutputGroup::new(chunk, params, false)?);
        }
    }
    Ok(groups)
}

/// Whether a selection worth `selected_effective` leaves enough for change
pub fn has_change(selected_effective: i64, target: i64, params: &SelectionParams) -> bool {
    selected_effective >= target + params.min_change.to_sat() as i64
}

/// Calculate the waste of spending `groups` against `target`
///
/// Waste is the fee paid for the inputs beyond what they would cost at the
/// long-term rate, plus either the cost of creating and later spending a
/// change output, or the excess given up to the fee when there is no change.
pub fn calculate_waste<'a>(
    groups: impl IntoIterator<Item = &'a OutputGroup>,
    target: i64,
    params: &SelectionParams,
) -> i64 {
    let mut waste = 0i64;
    let mut selected_effective = 0i64;
    for group in groups {
        waste += group.input_waste();
        selected_effective += group.effective_value;
    }

    if has_change(selected_effective, target, params) {
        waste + params.cost_of_change.to_sat() as i64
    } else {
        waste + (selected_effective - target)
    }
}
