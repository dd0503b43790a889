//! Per-attempt coin control options
//!
//! A `CoinControl` value travels with one construction or funding attempt
//! and is never modified by the engine. Wallet-wide settings live in
//! `WalletPolicy`; anything here takes precedence over them for the attempt.

use bitcoin::OutPoint;

use crate::fee_estimation::FeeRate;
use crate::types::{OutputType, DEFAULT_MAX_DEPTH};

/// Options controlling input selection, fees and change for one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinControl {
    /// Address to send change to instead of a fresh internal one
    pub change_destination: Option<String>,
    /// Output type for a freshly reserved change script
    pub change_type: Option<OutputType>,
    /// Allow unconfirmed coins received from others
    pub include_unsafe_inputs: bool,
    /// Allow coins beyond the manually selected ones
    pub allow_other_inputs: bool,
    /// Allow coins the wallet can watch but not sign for
    pub allow_watch_only: bool,
    /// Use `fee_rate` verbatim, bypassing estimation and floors
    pub override_fee_rate: bool,
    /// Explicit fee rate for this attempt
    pub fee_rate: Option<FeeRate>,
    /// Confirmation target for fee estimation
    pub confirm_target: Option<u32>,
    /// Signal BIP125 replaceability; `None` uses the wallet default
    pub signal_bip125_rbf: Option<bool>,
    /// Spend all coins sent to the same script together
    pub avoid_partial_spends: bool,
    /// Skip coins whose script has received more than once
    pub avoid_address_reuse: bool,
    /// Minimum confirmation depth for eligible coins
    pub min_depth: u32,
    /// Maximum confirmation depth for eligible coins
    pub max_depth: u32,
    /// Manually selected coins, in the order they were selected
    selected: Vec<OutPoint>,
}

impl Default for CoinControl {
    fn default() -> Self {
        Self {
            change_destination: None,
            change_type: None,
            include_unsafe_inputs: false,
            allow_other_inputs: true,
            allow_watch_only: false,
            override_fee_rate: false,
            fee_rate: None,
            confirm_target: None,
            signal_bip125_rbf: None,
            avoid_partial_spends: false,
            avoid_address_reuse: false,
            min_depth: 0,
            max_depth: DEFAULT_MAX_DEPTH,
            selected: Vec::new(),
        }
    }
}

impl CoinControl {
    /// Create coin control with default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `rate` for this attempt, still subject to the wallet floor
    pub fn with_fee_rate(mut self, rate: FeeRate) -> Self {
        self.fee_rate = Some(rate);
        self
    }

    /// Use exactly `rate` for this attempt
    pub fn with_override_fee_rate(mut self, rate: FeeRate) -> Self {
        self.fee_rate = Some(rate);
        self.override_fee_rate = true;
        self
    }

    /// Set the confirmation target used for estimation
    pub fn with_confirm_target(mut self, blocks: u32) -> Self {
        self.confirm_target = Some(blocks);
        self
    }

    /// Send change to `address`
    pub fn with_change_destination(mut self, address: impl Into<String>) -> Self {
        self.change_destination = Some(address.into());
        self
    }

    /// Reserve change of `output_type`
    pub fn with_change_type(mut self, output_type: OutputType) -> Self {
        self.change_type = Some(output_type);
        self
    }

    /// Manually select `outpoints`
    pub fn with_selected(mut self, outpoints: impl IntoIterator<Item = OutPoint>) -> Self {
        for outpoint in outpoints {
            self.select(outpoint);
        }
        self
    }

    /// Restrict eligible coins to a depth range
    pub fn with_depth_range(mut self, min_depth: u32, max_depth: u32) -> Self {
        self.min_depth = min_depth;
        self.max_depth = max_depth;
        self
    }

    /// Manually select one coin
    ///
    /// Selecting a coin twice keeps its first position.
    pub fn select(&mut self, outpoint: OutPoint) {
        if !self.is_selected(&outpoint) {
            self.selected.push(outpoint);
        }
    }

    /// Remove a coin from the manual selection
    pub fn unselect(&mut self, outpoint: &OutPoint) {
        self.selected.retain(|selected| selected != outpoint);
    }

    /// Clear the manual selection
    pub fn unselect_all(&mut self) {
        self.selected.clear();
    }

    /// Whether `outpoint` is manually selected
    pub fn is_selected(&self, outpoint: &OutPoint) -> bool {
        self.selected.contains(outpoint)
    }

    /// Whether any coins are manually selected
    pub fn has_selected(&self) -> bool {
        !self.selected.is_empty()
    }

    /// Manually selected coins in selection order
    pub fn selected(&self) -> impl Iterator<Item = &OutPoint> {
        self.selected.iter()
    }
}
