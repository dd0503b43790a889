//! Weight and dust calculations for transaction construction
//!
//! Everything here works in weight units (WU). A virtual byte is four weight
//! units; non-witness bytes cost 4 WU each and witness bytes cost 1 WU each.
//!
//! Input weights assume single-key spends of the wallet's own script types.
//! Scripts the wallet cannot size (bare multisig, P2WSH) need an explicit
//! satisfaction weight on the coin.
//!
//! Example:
//! ```
//! use bitvault_spend::math;
//!
//! // One P2WPKH input paying one P2WPKH output
//! let weight = math::estimate_tx_weight(
//!     &[math::InputWeight::witness(math::P2WPKH_INPUT_WEIGHT)],
//!     &[math::output_weight_for_script_len(22)],
//! );
//! assert_eq!(weight, 438);
//! ```

use bitcoin::consensus::encode::VarInt;
use bitcoin::{Amount, Script};

use crate::fee_estimation::defaults::DUST_RELAY_FEE;
use crate::fee_estimation::FeeRate;

/// Version and lock time, 8 non-witness bytes
pub const TX_OVERHEAD_WEIGHT: u64 = 8 * 4;

/// Segwit marker and flag bytes
pub const SEGWIT_MARKER_WEIGHT: u64 = 2;

/// Outpoint, sequence and an empty scriptSig length byte
pub const TXIN_BASE_WEIGHT: u64 = (32 + 4 + 4) * 4;

/// P2PKH input: 107 byte scriptSig with signature and compressed key
pub const P2PKH_INPUT_WEIGHT: u64 = TXIN_BASE_WEIGHT + (1 + 107) * 4;

/// P2SH-P2WPKH input: 23 byte redeem script push plus a P2WPKH witness
pub const P2SH_P2WPKH_INPUT_WEIGHT: u64 = TXIN_BASE_WEIGHT + (1 + 23) * 4 + P2WPKH_WITNESS_WEIGHT;

/// P2WPKH input
pub const P2WPKH_INPUT_WEIGHT: u64 = TXIN_BASE_WEIGHT + 4 + P2WPKH_WITNESS_WEIGHT;

/// P2TR key path input with a default sighash schnorr signature
pub const P2TR_KEYSPEND_INPUT_WEIGHT: u64 = TXIN_BASE_WEIGHT + 4 + 1 + 1 + 64;

// item count, signature push, key push
const P2WPKH_WITNESS_WEIGHT: u64 = 1 + 1 + 72 + 1 + 33;

/// Weight of one input together with whether it carries witness data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputWeight {
    /// Full weight of the input, including any witness
    pub weight: u64,
    /// Whether the input spends a witness program
    pub has_witness: bool,
}

impl InputWeight {
    /// An input spending a witness program
    pub fn witness(weight: u64) -> Self {
        Self { weight, has_witness: true }
    }

    /// An input without witness data
    pub fn legacy(weight: u64) -> Self {
        Self { weight, has_witness: false }
    }
}

fn varint_len(n: u64) -> u64 {
    VarInt(n).len() as u64
}

/// Weight of an output whose scriptPubKey is `script_len` bytes
pub fn output_weight_for_script_len(script_len: usize) -> u64 {
    let len = script_len as u64;
    (8 + varint_len(len) + len) * 4
}

/// Weight of an output paying to `script`
pub fn output_weight(script: &Script) -> u64 {
    output_weight_for_script_len(script.len())
}

/// Estimate the weight of a complete, signed transaction
///
/// The segwit marker is only counted when at least one input has witness
/// data; in that case every non-witness input also pays for an empty
/// witness stack.
pub fn estimate_tx_weight(inputs: &[InputWeight], output_weights: &[u64]) -> u64 {
    let has_witness = inputs.iter().any(|input| input.has_witness);

    let mut weight = TX_OVERHEAD_WEIGHT
        + (varint_len(inputs.len() as u64) + varint_len(output_weights.len() as u64)) * 4;

    if has_witness {
        weight += SEGWIT_MARKER_WEIGHT;
    }

    for input in inputs {
        weight += input.weight;
        if has_witness && !input.has_witness {
            weight += 1;
        }
    }

    weight + output_weights.iter().sum::<u64>()
}

/// Weight of everything in a transaction except its inputs
///
/// Used as the fixed part of the selection target. The segwit marker is
/// always included, which over-estimates by two units for legacy-only
/// spends.
pub fn weight_without_inputs(output_weights: &[u64]) -> u64 {
    TX_OVERHEAD_WEIGHT
        + (1 + varint_len(output_weights.len() as u64)) * 4
        + SEGWIT_MARKER_WEIGHT
        + output_weights.iter().sum::<u64>()
}

/// Convert weight units to virtual bytes, rounding up
pub fn weight_to_vsize(weight: u64) -> u64 {
    (weight + 3) / 4
}

/// Full input weight for spending `script` with a single key
///
/// P2SH outputs are assumed to wrap a P2WPKH program, which is the only
/// P2SH form the wallet creates.
pub fn input_weight_for_script(script: &Script) -> Option<InputWeight> {
    if script.is_p2pkh() {
        Some(InputWeight::legacy(P2PKH_INPUT_WEIGHT))
    } else if script.is_p2sh() {
        Some(InputWeight::witness(P2SH_P2WPKH_INPUT_WEIGHT))
    } else if script.is_v0_p2wpkh() {
        Some(InputWeight::witness(P2WPKH_INPUT_WEIGHT))
    } else if script.is_v1_p2tr() {
        Some(InputWeight::witness(P2TR_KEYSPEND_INPUT_WEIGHT))
    } else {
        None
    }
}

/// Smallest value an output paying to `script` may carry at `dust_rate`
///
/// An output is dust when spending it would cost more than it is worth:
/// its own weight plus the weight of a typical input spending it, priced at
/// `dust_rate`. `Script::dust_value` prices that size at the relay dust
/// rate, so the size is recovered from it and repriced. Provably
/// unspendable outputs have no dust limit.
pub fn dust_threshold(script: &Script, dust_rate: FeeRate) -> Amount {
    let relay_dust = script.dust_value().to_sat();
    let weight = relay_dust * 1_000 / DUST_RELAY_FEE.sat_per_kwu();
    dust_rate.fee_for_weight(weight)
}

/// Determines if `value` would be dust for an output paying to `script`
pub fn is_dust(value: Amount, script: &Script, dust_rate: FeeRate) -> bool {
    value < dust_threshold(script, dust_rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::ScriptBuf;

    fn p2wpkh() -> ScriptBuf {
        ScriptBuf::from_bytes([vec![0x00, 0x14], vec![1u8; 20]].concat())
    }

    fn p2pkh() -> ScriptBuf {
        ScriptBuf::from_bytes([vec![0x76, 0xa9, 0x14], vec![1u8; 20], vec![0x88, 0xac]].concat())
    }

    #[test]
    fn test_input_weights_match_known_vsizes() {
        assert_eq!(weight_to_vsize(P2PKH_INPUT_WEIGHT), 148);
        assert_eq!(weight_to_vsize(P2SH_P2WPKH_INPUT_WEIGHT), 91);
        assert_eq!(weight_to_vsize(P2WPKH_INPUT_WEIGHT), 68);
        assert_eq!(weight_to_vsize(P2TR_KEYSPEND_INPUT_WEIGHT), 58);
    }

    #[test]
    fn test_standard_dust_limits() {
        let relay = FeeRate::from_sat_per_vb(3);
        assert_eq!(dust_threshold(&p2pkh(), relay), Amount::from_sat(546));
        assert_eq!(dust_threshold(&p2wpkh(), relay), Amount::from_sat(294));
        let p2tr = ScriptBuf::from_bytes([vec![0x51, 0x20], vec![1u8; 32]].concat());
        assert_eq!(dust_threshold(&p2tr, relay), Amount::from_sat(330));

        let op_return = ScriptBuf::from_bytes(vec![0x6a, 0x01, 0x01]);
        assert_eq!(dust_threshold(&op_return, relay), Amount::ZERO);
    }

    #[test]
    fn test_dust_scales_with_rate() {
        // 98 vbytes to create and spend a P2WPKH output
        assert_eq!(dust_threshold(&p2wpkh(), FeeRate::from_sat_per_vb(1)), Amount::from_sat(98));
        assert_eq!(dust_threshold(&p2wpkh(), FeeRate::from_sat_per_vb(10)), Amount::from_sat(980));
        assert!(is_dust(Amount::from_sat(293), &p2wpkh(), DUST_RELAY_FEE));
        assert!(!is_dust(Amount::from_sat(294), &p2wpkh(), DUST_RELAY_FEE));
    }

    #[test]
    fn test_legacy_input_pays_for_empty_witness_in_segwit_tx() {
        let mixed = estimate_tx_weight(
            &[
                InputWeight::witness(P2WPKH_INPUT_WEIGHT),
                InputWeight::legacy(P2PKH_INPUT_WEIGHT),
            ],
            &[output_weight(&p2wpkh())],
        );
        let expected = TX_OVERHEAD_WEIGHT + 8 + SEGWIT_MARKER_WEIGHT
            + P2WPKH_INPUT_WEIGHT + P2PKH_INPUT_WEIGHT + 1 + 124;
        assert_eq!(mixed, expected);
    }

    #[test]
    fn test_unknown_script_has_no_input_weight() {
        let p2wsh = ScriptBuf::from_bytes([vec![0x00, 0x20], vec![1u8; 32]].concat());
        assert!(input_weight_for_script(&p2wsh).is_none());
    }
}
