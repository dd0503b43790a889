//! Configuration file handling

use bitcoin::{Amount, Network};
use bitvault_spend::config::{ensure_config_exists, parse_network, Config};
use bitvault_spend::{FeeRate, OutputType, WalletPolicy};
use rust_decimal_macros::dec;
use tempfile::tempdir;

#[test]
fn test_empty_config_matches_default_policy() {
    let config = Config::from_toml("").unwrap();
    assert_eq!(config.to_policy().unwrap(), WalletPolicy::default());
}

#[test]
fn test_partial_config() {
    let config = Config::from_toml(
        r#"
        [wallet]
        network = "testnet"
        default_change_type = "bech32m"
        avoid_partial_spends = true

        [fees]
        min_fee = 1.5
        fallback_fee = 20
        allow_fallback_fee = true
        consolidate_feerate = "8"
        "#,
    )
    .unwrap();

    let policy = config.to_policy().unwrap();
    assert_eq!(policy.network, Network::Testnet);
    assert_eq!(policy.default_change_type, Some(OutputType::Bech32m));
    assert!(policy.avoid_partial_spends);
    assert_eq!(policy.min_fee, FeeRate::from_sat_per_kwu(375));
    assert_eq!(policy.fallback_fee, Some(FeeRate::from_sat_per_vb(20)));
    assert!(policy.allow_fallback_fee);
    assert_eq!(policy.consolidate_feerate, Some(FeeRate::from_sat_per_vb(8)));
    assert!(policy.signal_rbf);
}

#[test]
fn test_validate_rejects_bad_values() {
    let mut config = Config::default();
    config.wallet.network = "moonnet".to_string();
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.fees.min_fee = dec!(-1);
    assert!(config.to_policy().is_err());

    let mut config = Config::default();
    config.fees.max_tx_fee = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.fees.confirm_target = 0;
    assert!(config.validate().is_err());

    assert!(Config::from_toml("[fees]\nmin_fee = \"cheap\"").is_err());
}

#[test]
fn test_save_and_load() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("spend.toml");

    let mut config = Config::default();
    config.wallet.network = "signet".to_string();
    config.fees.pay_tx_fee = Some(dec!(4.25));
    config.fees.max_tx_fee = 250_000;
    config.save(&path).unwrap();

    let loaded = Config::load(&path).unwrap();
    let policy = loaded.to_policy().unwrap();
    assert_eq!(policy.network, Network::Signet);
    assert_eq!(policy.pay_tx_fee, Some(FeeRate::from_sat_per_kwu(1_063)));
    assert_eq!(policy.max_tx_fee, Amount::from_sat(250_000));
}

#[test]
fn test_ensure_config_exists() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("spend.toml");

    ensure_config_exists(&path).unwrap();
    assert!(path.exists());
    assert!(Config::load(&path).unwrap().validate().is_ok());

    // An existing file is left alone
    std::fs::write(&path, "[wallet]\nnetwork = \"regtest\"\n").unwrap();
    ensure_config_exists(&path).unwrap();
    assert_eq!(Config::load(&path).unwrap().wallet.network, "regtest");
}

#[test]
fn test_parse_network() {
    assert_eq!(parse_network("mainnet").unwrap(), Network::Bitcoin);
    assert_eq!(parse_network(" Testnet ").unwrap(), Network::Testnet);
    assert_eq!(parse_network("regtest").unwrap(), Network::Regtest);
    assert!(parse_network("litecoin").is_err());
}
