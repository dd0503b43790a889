//! Wallet-wide spending policy
//!
//! `WalletPolicy` is the immutable snapshot every construction attempt reads
//! its wallet-level settings from. `WalletState` owns the current policy and
//! exposes setters for runtime adjustments; an attempt captures one snapshot
//! when it starts, so a concurrent setter never changes a running attempt.

use bitcoin::{Amount, Network};
use log::debug;
use std::sync::RwLock;

use crate::fee_estimation::{defaults, FeeRate};
use crate::types::OutputType;

/// Wallet-level settings that shape every construction attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletPolicy {
    /// Network addresses are validated against
    pub network: Network,
    /// Long-term rate used to score input fees during selection
    pub consolidate_feerate: Option<FeeRate>,
    /// Output type for change when the attempt does not choose one
    pub default_change_type: Option<OutputType>,
    /// Upper bound for the rate at which leftover becomes fee instead of change
    pub discard_rate: FeeRate,
    /// Fixed rate to pay instead of estimating
    pub pay_tx_fee: Option<FeeRate>,
    /// Lowest rate the wallet pays without an override
    pub min_fee: FeeRate,
    /// Rate used when estimation is unavailable
    pub fallback_fee: Option<FeeRate>,
    /// Whether estimation failures may fall back
    pub allow_fallback_fee: bool,
    /// Default BIP125 signalling
    pub signal_rbf: bool,
    /// Largest absolute fee the wallet will pay
    pub max_tx_fee: Amount,
    /// Whether unconfirmed change may be spent
    pub spend_zero_conf_change: bool,
    /// Default for grouping coins by script
    pub avoid_partial_spends: bool,
    /// Confirmation target used when the attempt does not choose one
    pub default_confirm_target: u32,
}

impl Default for WalletPolicy {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            consolidate_feerate: None,
            default_change_type: None,
            discard_rate: defaults::DEFAULT_DISCARD_FEE,
            pay_tx_fee: None,
            min_fee: defaults::MIN_RELAY_FEE,
            fallback_fee: None,
            allow_fallback_fee: false,
            signal_rbf: true,
            max_tx_fee: Amount::from_sat(defaults::DEFAULT_MAX_TX_FEE),
            spend_zero_conf_change: true,
            avoid_partial_spends: false,
            default_confirm_target: defaults::DEFAULT_CONFIRM_TARGET,
        }
    }
}

/// Current wallet policy with runtime setters
#[derive(Debug, Default)]
pub struct WalletState {
    policy: RwLock<WalletPolicy>,
}

impl WalletState {
    /// Create wallet state holding `policy`
    pub fn new(policy: WalletPolicy) -> Self {
        Self {
            policy: RwLock::new(policy),
        }
    }

    /// Capture the current policy
    pub fn snapshot(&self) -> WalletPolicy {
        match self.policy.read() {
            Ok(policy) => policy.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the whole policy
    pub fn replace(&self, policy: WalletPolicy) {
        self.update("policy", |current| *current = policy);
    }

    pub fn set_consolidate_feerate(&self, rate: Option<FeeRate>) {
        self.update("consolidate_feerate", |p| p.consolidate_feerate = rate);
    }

    pub fn set_default_change_type(&self, output_type: Option<OutputType>) {
        self.update("default_change_type", |p| p.default_change_type = output_type);
    }

    pub fn set_discard_rate(&self, rate: FeeRate) {
        self.update("discard_rate", |p| p.discard_rate = rate);
    }

    pub fn set_pay_tx_fee(&self, rate: Option<FeeRate>) {
        self.update("pay_tx_fee", |p| p.pay_tx_fee = rate);
    }

    pub fn set_min_fee(&self, rate: FeeRate) {
        self.update("min_fee", |p| p.min_fee = rate);
    }

    pub fn set_fallback_fee(&self, rate: Option<FeeRate>) {
        self.update("fallback_fee", |p| p.fallback_fee = rate);
    }

    pub fn set_allow_fallback_fee(&self, allow: bool) {
        self.update("allow_fallback_fee", |p| p.allow_fallback_fee = allow);
    }

    pub fn set_signal_rbf(&self, signal: bool) {
        self.update("signal_rbf", |p| p.signal_rbf = signal);
    }

    pub fn set_max_tx_fee(&self, max: Amount) {
        self.update("max_tx_fee", |p| p.max_tx_fee = max);
    }

    pub fn set_spend_zero_conf_change(&self, allow: bool) {
        self.update("spend_zero_conf_change", |p| p.spend_zero_conf_change = allow);
    }

    pub fn set_avoid_partial_spends(&self, avoid: bool) {
        self.update("avoid_partial_spends", |p| p.avoid_partial_spends = avoid);
    }

    fn update(&self, field: &str, apply: impl FnOnce(&mut WalletPolicy)) {
        let mut guard = match self.policy.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        apply(&mut guard);
        debug!("Wallet policy updated: {}", field);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_is_isolated_from_later_updates() {
        let state = WalletState::new(WalletPolicy::default());
        let before = state.snapshot();

        state.set_fallback_fee(Some(FeeRate::from_sat_per_vb(20)));
        state.set_allow_fallback_fee(true);

        assert_eq!(before.fallback_fee, None);
        assert!(!before.allow_fallback_fee);

        let after = state.snapshot();
        assert_eq!(after.fallback_fee, Some(FeeRate::from_sat_per_vb(20)));
        assert!(after.allow_fallback_fee);
    }
}
