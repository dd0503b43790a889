//! Fee rate resolution for transaction construction
//!
//! This module turns a construction attempt's policy into the fee rate the
//! transaction will pay. Rates come from one of several sources, checked in
//! order:
//!
//! 1. An explicit override on the attempt's `CoinControl`, returned as-is
//! 2. An explicit (non-override) rate on the attempt
//! 3. The wallet's configured `pay_tx_fee`
//! 4. Network fee estimation keyed by confirmation target
//! 5. The wallet's fallback fee, or the minimum-fee floor, when estimation is
//!    unavailable and fallback is allowed
//!
//! Every source other than the override is floored at the larger of the
//! wallet minimum fee and the minimum relay fee.
//!
//! Alongside the payment rate the oracle supplies the discard rate (used to
//! decide when change is worth creating) and the long-term rate used when
//! scoring selections.

use bitcoin::Amount;
use log::{debug, warn};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::coin_control::CoinControl;
use crate::error::SpendError;
use crate::wallet_state::WalletPolicy;

/// Errors reported by a fee estimator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeeEstimationError {
    #[error("Network connectivity error: {0}")]
    NetworkError(String),

    #[error("Data retrieval error: {0}")]
    DataError(String),

    #[error("Not enough data to estimate a fee for a {target} block target")]
    InsufficientData { target: u32 },
}

/// Fee rate in satoshis per 1000 weight units
///
/// Fees are always rounded up, so a transaction paying `fee_for_weight(w)`
/// never pays less than the rate asks for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeeRate {
    sat_per_kwu: u64,
}

impl FeeRate {
    /// A zero fee rate
    pub const ZERO: FeeRate = FeeRate { sat_per_kwu: 0 };

    /// Construct a fee rate from satoshis per 1000 weight units
    pub const fn from_sat_per_kwu(sat_per_kwu: u64) -> Self {
        Self { sat_per_kwu }
    }

    /// Construct a fee rate from whole satoshis per virtual byte
    pub const fn from_sat_per_vb(sat_per_vb: u64) -> Self {
        Self {
            sat_per_kwu: sat_per_vb * 250,
        }
    }

    /// Construct a fee rate from satoshis per 1000 virtual bytes, rounding up
    pub const fn from_sat_per_kvb(sat_per_kvb: u64) -> Self {
        Self {
            sat_per_kwu: (sat_per_kvb + 3) / 4,
        }
    }

    /// Construct a fee rate from a decimal sat/vB value, rounding up
    ///
    /// Returns `None` for negative or out of range values.
    pub fn from_sat_per_vb_decimal(sat_per_vb: Decimal) -> Option<Self> {
        if sat_per_vb.is_sign_negative() {
            return None;
        }
        let sat_per_kwu = (sat_per_vb * Decimal::from(250)).ceil().to_u64()?;
        Some(Self { sat_per_kwu })
    }

    /// Satoshis per 1000 weight units
    pub fn sat_per_kwu(&self) -> u64 {
        self.sat_per_kwu
    }

    /// This rate as decimal satoshis per virtual byte
    pub fn to_sat_per_vb_decimal(&self) -> Decimal {
        Decimal::from(self.sat_per_kwu) / Decimal::from(250)
    }

    /// Fee owed by a transaction of `weight` weight units
    pub fn fee_for_weight(&self, weight: u64) -> Amount {
        let numerator = self.sat_per_kwu as u128 * weight as u128;
        let fee = (numerator + 999) / 1000;
        Amount::from_sat(u64::try_from(fee).unwrap_or(u64::MAX))
    }

    /// Whether this rate is zero
    pub fn is_zero(&self) -> bool {
        self.sat_per_kwu == 0
    }
}

impl fmt::Display for FeeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sat/vB", self.to_sat_per_vb_decimal().normalize())
    }
}

impl From<bdk::FeeRate> for FeeRate {
    fn from(rate: bdk::FeeRate) -> Self {
        let sat_per_kwu = (rate.as_sat_per_vb() as f64 * 250.0).ceil();
        Self {
            sat_per_kwu: if sat_per_kwu.is_finite() && sat_per_kwu > 0.0 {
                sat_per_kwu as u64
            } else {
                0
            },
        }
    }
}

impl From<FeeRate> for bdk::FeeRate {
    fn from(rate: FeeRate) -> Self {
        bdk::FeeRate::from_sat_per_vb(rate.sat_per_kwu as f32 / 250.0)
    }
}

/// Relay policy constants and engine defaults
pub mod defaults {
    use super::FeeRate;

    /// Rate used to price dust for outputs the engine did not choose
    pub const DUST_RELAY_FEE: FeeRate = FeeRate::from_sat_per_vb(3);

    /// Lowest rate standard nodes relay
    pub const MIN_RELAY_FEE: FeeRate = FeeRate::from_sat_per_vb(1);

    /// Default upper bound for the discard rate
    pub const DEFAULT_DISCARD_FEE: FeeRate = FeeRate::from_sat_per_vb(10);

    /// Default confirmation target in blocks
    pub const DEFAULT_CONFIRM_TARGET: u32 = 6;

    /// Confirmation target used to cap the discard rate
    pub const DISCARD_ESTIMATE_TARGET: u32 = 1008;

    /// Default maximum absolute fee in satoshis (0.1 BTC)
    pub const DEFAULT_MAX_TX_FEE: u64 = 10_000_000;
}

/// Source of network fee estimates
pub trait FeeEstimator: Send + Sync {
    /// Estimate the rate needed to confirm within `confirm_target` blocks
    fn estimate(&self, confirm_target: u32) -> Result<FeeRate, FeeEstimationError>;
}

/// Where a resolved fee rate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeeSource {
    /// Caller override, not floored
    Override,
    /// Explicit rate on the attempt
    Explicit,
    /// Wallet `pay_tx_fee`
    PayTxFee,
    /// Network estimate for the given target
    Estimate { target: u32 },
    /// Wallet fallback fee
    Fallback,
    /// Wallet minimum fee used as the fallback
    MinimumFloor,
}

/// A fee rate together with its source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedFeeRate {
    /// The rate the transaction will pay
    pub rate: FeeRate,
    /// Where it came from
    pub source: FeeSource,
}

/// Resolves fee rates for construction attempts
#[derive(Clone)]
pub struct FeeRateOracle {
    estimator: Arc<dyn FeeEstimator>,
}

impl FeeRateOracle {
    /// Create an oracle backed by `estimator`
    pub fn new(estimator: Arc<dyn FeeEstimator>) -> Self {
        Self { estimator }
    }

    /// Resolve the fee rate for one attempt
    ///
    /// # Errors
    /// * `FeeEstimationUnavailable` when no override, explicit rate or
    ///   estimate exists and the wallet does not allow falling back
    pub fn rate_for(
        &self,
        coin_control: &CoinControl,
        policy: &WalletPolicy,
    ) -> Result<ResolvedFeeRate, SpendError> {
        if coin_control.override_fee_rate {
            if let Some(rate) = coin_control.fee_rate {
                debug!("Using override fee rate {}", rate);
                return Ok(ResolvedFeeRate {
                    rate,
                    source: FeeSource::Override,
                });
            }
        }

        let (candidate, source) = if let Some(rate) = coin_control.fee_rate {
            (rate, FeeSource::Explicit)
        } else if let Some(rate) = policy.pay_tx_fee {
            (rate, FeeSource::PayTxFee)
        } else {
            let target = coin_control
                .confirm_target
                .unwrap_or(policy.default_confirm_target);

            match self.estimator.estimate(target) {
                Ok(rate) if !rate.is_zero() => (rate, FeeSource::Estimate { target }),
                outcome => {
                    if let Err(e) = outcome {
                        warn!("Fee estimation for {} blocks failed: {}", target, e);
                    }
                    if !policy.allow_fallback_fee {
                        return Err(SpendError::FeeEstimationUnavailable {
                            confirm_target: target,
                        });
                    }
                    match policy.fallback_fee {
                        Some(rate) if !rate.is_zero() => (rate, FeeSource::Fallback),
                        _ => (Self::minimum_rate(policy), FeeSource::MinimumFloor),
                    }
                }
            }
        };

        let floor = Self::minimum_rate(policy);
        let rate = if candidate < floor {
            debug!("Raising fee rate {} to minimum {}", candidate, floor);
            floor
        } else {
            candidate
        };

        Ok(ResolvedFeeRate { rate, source })
    }

    /// Rate at which leftover value is considered not worth a change output
    ///
    /// The configured discard rate is capped by the long-horizon estimate and
    /// never falls below the dust relay fee.
    pub fn discard_rate(&self, policy: &WalletPolicy) -> FeeRate {
        let mut discard = policy.discard_rate;
        if let Ok(long_horizon) = self.estimator.estimate(defaults::DISCARD_ESTIMATE_TARGET) {
            if !long_horizon.is_zero() {
                discard = discard.min(long_horizon);
            }
        }
        discard.max(defaults::DUST_RELAY_FEE)
    }

    /// Rate used to price inputs in the long run, when configured
    pub fn long_term_rate(&self, policy: &WalletPolicy) -> Option<FeeRate> {
        policy.consolidate_feerate
    }

    /// Lowest rate any non-override attempt pays
    pub fn minimum_rate(policy: &WalletPolicy) -> FeeRate {
        policy.min_fee.max(defaults::MIN_RELAY_FEE)
    }
}

/// Fee estimator backed by a fixed table, for tests and offline use
///
/// Returns the estimate for the configured target closest to the requested
/// one. An empty table reports `InsufficientData`.
#[derive(Debug, Clone, Default)]
pub struct MockFeeEstimator {
    fee_rates: HashMap<u32, FeeRate>,
}

impl MockFeeEstimator {
    /// Create an estimator with no data
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an estimate for `target` blocks
    pub fn with_fee_rate(mut self, target: u32, rate: FeeRate) -> Self {
        self.fee_rates.insert(target, rate);
        self
    }
}

impl FeeEstimator for MockFeeEstimator {
    fn estimate(&self, confirm_target: u32) -> Result<FeeRate, FeeEstimationError> {
        self.fee_rates
            .iter()
            .min_by_key(|(target, _)| ((**target as i64 - confirm_target as i64).abs(), **target))
            .map(|(_, rate)| *rate)
            .ok_or(FeeEstimationError::InsufficientData {
                target: confirm_target,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_fee_for_weight_rounds_up() {
        let rate = FeeRate::from_sat_per_kwu(342);
        assert_eq!(rate.fee_for_weight(438), Amount::from_sat(150));
        assert_eq!(FeeRate::from_sat_per_vb(1).fee_for_weight(4), Amount::from_sat(1));
        assert_eq!(FeeRate::from_sat_per_vb(1).fee_for_weight(5), Amount::from_sat(2));
        assert_eq!(FeeRate::ZERO.fee_for_weight(1_000), Amount::ZERO);
    }

    #[test]
    fn test_decimal_conversion() {
        let rate = FeeRate::from_sat_per_vb_decimal(dec!(1.5)).unwrap();
        assert_eq!(rate.sat_per_kwu(), 375);
        assert_eq!(rate.to_sat_per_vb_decimal(), dec!(1.5));
        assert!(FeeRate::from_sat_per_vb_decimal(dec!(-1)).is_none());
        assert_eq!(FeeRate::from_sat_per_kvb(1000), FeeRate::from_sat_per_vb(1));
    }

    #[test]
    fn test_bdk_fee_rate_conversion() {
        let rate: FeeRate = bdk::FeeRate::from_sat_per_vb(2.0).into();
        assert_eq!(rate, FeeRate::from_sat_per_vb(2));
        let back: bdk::FeeRate = rate.into();
        assert!((back.as_sat_per_vb() - 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_mock_estimator_uses_closest_target() {
        let estimator = MockFeeEstimator::new()
            .with_fee_rate(2, FeeRate::from_sat_per_vb(20))
            .with_fee_rate(12, FeeRate::from_sat_per_vb(4));
        assert_eq!(estimator.estimate(3).unwrap(), FeeRate::from_sat_per_vb(20));
        assert_eq!(estimator.estimate(10).unwrap(), FeeRate::from_sat_per_vb(4));
        assert!(MockFeeEstimator::new().estimate(6).is_err());
    }
}
