//! Fee rate resolution through `FeeRateOracle`

mod test_helpers;

use bitvault_spend::fee_estimation::{defaults, FeeSource};
use bitvault_spend::{CoinControl, FeeEstimator, FeeRate, FeeRateOracle, MockFeeEstimator, WalletPolicy};
use std::sync::Arc;
use test_helpers::setup;

fn oracle(estimator: MockFeeEstimator) -> FeeRateOracle {
    setup();
    FeeRateOracle::new(Arc::new(estimator))
}

fn estimates() -> MockFeeEstimator {
    MockFeeEstimator::new()
        .with_fee_rate(2, FeeRate::from_sat_per_vb(20))
        .with_fee_rate(6, FeeRate::from_sat_per_vb(5))
        .with_fee_rate(1008, FeeRate::from_sat_per_vb(2))
}

#[test]
fn test_override_is_used_verbatim() {
    let oracle = oracle(estimates());
    let coin_control = CoinControl::new().with_override_fee_rate(FeeRate::from_sat_per_kwu(100));

    let resolved = oracle.rate_for(&coin_control, &WalletPolicy::default()).unwrap();
    assert_eq!(resolved.rate, FeeRate::from_sat_per_kwu(100));
    assert_eq!(resolved.source, FeeSource::Override);
}

#[test]
fn test_explicit_rate_is_floored() {
    let oracle = oracle(estimates());
    let policy = WalletPolicy {
        min_fee: FeeRate::from_sat_per_vb(2),
        ..WalletPolicy::default()
    };

    let low = CoinControl::new().with_fee_rate(FeeRate::from_sat_per_kwu(100));
    let resolved = oracle.rate_for(&low, &policy).unwrap();
    assert_eq!(resolved.rate, FeeRate::from_sat_per_vb(2));
    assert_eq!(resolved.source, FeeSource::Explicit);

    let high = CoinControl::new().with_fee_rate(FeeRate::from_sat_per_vb(40));
    assert_eq!(oracle.rate_for(&high, &policy).unwrap().rate, FeeRate::from_sat_per_vb(40));
}

#[test]
fn test_pay_tx_fee_beats_estimation() {
    let oracle = oracle(estimates());
    let policy = WalletPolicy {
        pay_tx_fee: Some(FeeRate::from_sat_per_vb(3)),
        ..WalletPolicy::default()
    };

    let resolved = oracle.rate_for(&CoinControl::new(), &policy).unwrap();
    assert_eq!(resolved.rate, FeeRate::from_sat_per_vb(3));
    assert_eq!(resolved.source, FeeSource::PayTxFee);
}

#[test]
fn test_estimate_for_confirm_target() {
    let oracle = oracle(estimates());
    let policy = WalletPolicy::default();

    let resolved = oracle.rate_for(&CoinControl::new(), &policy).unwrap();
    assert_eq!(resolved.rate, FeeRate::from_sat_per_vb(5));
    assert_eq!(resolved.source, FeeSource::Estimate { target: 6 });

    let urgent = CoinControl::new().with_confirm_target(2);
    let resolved = oracle.rate_for(&urgent, &policy).unwrap();
    assert_eq!(resolved.rate, FeeRate::from_sat_per_vb(20));
    assert_eq!(resolved.source, FeeSource::Estimate { target: 2 });
}

#[test]
fn test_fallback_when_estimation_unavailable() {
    let oracle = oracle(MockFeeEstimator::new());
    let mut policy = WalletPolicy::default();

    assert!(oracle.rate_for(&CoinControl::new(), &policy).is_err());

    policy.allow_fallback_fee = true;
    let resolved = oracle.rate_for(&CoinControl::new(), &policy).unwrap();
    assert_eq!(resolved.source, FeeSource::MinimumFloor);
    assert_eq!(resolved.rate, defaults::MIN_RELAY_FEE);

    policy.fallback_fee = Some(FeeRate::from_sat_per_vb(12));
    let resolved = oracle.rate_for(&CoinControl::new(), &policy).unwrap();
    assert_eq!(resolved.source, FeeSource::Fallback);
    assert_eq!(resolved.rate, FeeRate::from_sat_per_vb(12));
}

#[test]
fn test_discard_rate_bounds() {
    let policy = WalletPolicy::default();

    // Capped by the long-horizon estimate, but never below dust relay
    assert_eq!(oracle(estimates()).discard_rate(&policy), defaults::DUST_RELAY_FEE);

    let moderate = MockFeeEstimator::new().with_fee_rate(1008, FeeRate::from_sat_per_vb(4));
    assert_eq!(oracle(moderate).discard_rate(&policy), FeeRate::from_sat_per_vb(4));

    assert_eq!(oracle(MockFeeEstimator::new()).discard_rate(&policy), defaults::DEFAULT_DISCARD_FEE);
}

#[test]
fn test_long_term_rate_follows_policy() {
    let oracle = oracle(estimates());
    let mut policy = WalletPolicy::default();
    assert_eq!(oracle.long_term_rate(&policy), None);

    policy.consolidate_feerate = Some(FeeRate::from_sat_per_vb(8));
    assert_eq!(oracle.long_term_rate(&policy), Some(FeeRate::from_sat_per_vb(8)));
}

#[test]
fn test_mock_estimator_picks_closest_target() {
    let estimator = MockFeeEstimator::new()
        .with_fee_rate(1, FeeRate::from_sat_per_vb(30))
        .with_fee_rate(12, FeeRate::from_sat_per_vb(4));

    assert_eq!(estimator.estimate(10).unwrap(), FeeRate::from_sat_per_vb(4));
    assert_eq!(estimator.estimate(3).unwrap(), FeeRate::from_sat_per_vb(30));
    assert!(MockFeeEstimator::new().estimate(6).is_err());
}

#[test]
fn test_fee_rate_units() {
    assert_eq!(FeeRate::from_sat_per_kvb(1_000), FeeRate::from_sat_per_vb(1));
    assert_eq!(FeeRate::from_sat_per_vb(1).fee_for_weight(561).to_sat(), 141);
    assert_eq!(FeeRate::from_sat_per_vb(1).to_string(), "1 sat/vB");
}
