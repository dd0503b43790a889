//! Shared fixtures for the integration tests
#![allow(dead_code)]

use bitcoin::{Amount, OutPoint, ScriptBuf, Txid};
use bitvault_spend::logging::{self, LogConfig, LogLevel};
use bitvault_spend::{
    CoinControl, FeeRate, MockChainState, MockChangeSource, MockFeeEstimator, MockSigner, Recipient, SpendEngine,
    SpendEventBus, Utxo, UtxoSet, WalletPolicy, WalletState,
};
use std::str::FromStr;
use std::sync::{Arc, Once};

static INIT: Once = Once::new();

/// Initialize logging once for the whole test binary
pub fn setup() {
    INIT.call_once(|| {
        let config = LogConfig {
            level: LogLevel::Error,
            log_file: None,
            include_timestamps: false,
            include_source_location: false,
            json_format: false,
        };
        let _ = logging::init(&config);
    });
}

/// A P2WPKH script whose program is `tag` repeated
pub fn p2wpkh(tag: u8) -> ScriptBuf {
    ScriptBuf::from_bytes([vec![0x00, 0x14], vec![tag; 20]].concat())
}

/// A P2TR script whose program is `tag` repeated
pub fn p2tr(tag: u8) -> ScriptBuf {
    ScriptBuf::from_bytes([vec![0x51, 0x20], vec![tag; 32]].concat())
}

pub fn txid(n: u8) -> Txid {
    Txid::from_str(&format!("{:02x}", n).repeat(32)).unwrap()
}

pub fn outpoint(n: u8, vout: u32) -> OutPoint {
    OutPoint::new(txid(n), vout)
}

/// A confirmed P2WPKH coin received from someone else
pub fn coin(vout: u32, sats: u64) -> Utxo {
    Utxo::new(outpoint(0xab, vout), Amount::from_sat(sats), p2wpkh(0x99), 6)
}

/// Coins with distinct outpoints and the given values
pub fn coins(values: &[u64]) -> Vec<Utxo> {
    values.iter().enumerate().map(|(vout, sats)| coin(vout as u32, *sats)).collect()
}

pub fn recipient(sats: u64) -> Recipient {
    Recipient::new(p2wpkh(0x01), Amount::from_sat(sats))
}

/// Coin control paying exactly `sat_per_kwu`
pub fn fee_override(sat_per_kwu: u64) -> CoinControl {
    CoinControl::new().with_override_fee_rate(FeeRate::from_sat_per_kwu(sat_per_kwu))
}

/// An engine over an in-memory wallet, with handles to every collaborator
pub struct TestWallet {
    pub engine: Arc<SpendEngine>,
    pub coins: Arc<UtxoSet>,
    pub change: Arc<MockChangeSource>,
    pub signer: Arc<MockSigner>,
    pub chain: Arc<MockChainState>,
    pub events: Arc<SpendEventBus>,
    pub state: Arc<WalletState>,
}

impl TestWallet {
    /// Wallet holding `values`, estimating 1 sat/vB for every target
    pub fn new(values: &[u64]) -> Self {
        Self::with_coins(coins(values))
    }

    pub fn with_coins(utxos: Vec<Utxo>) -> Self {
        Self::build(
            utxos,
            MockFeeEstimator::new().with_fee_rate(6, FeeRate::from_sat_per_vb(1)),
            WalletPolicy::default(),
            Arc::new(MockSigner::new()),
        )
    }

    pub fn build(
        utxos: Vec<Utxo>,
        estimator: MockFeeEstimator,
        policy: WalletPolicy,
        signer: Arc<MockSigner>,
    ) -> Self {
        setup();

        let coins = Arc::new(UtxoSet::new(utxos));
        let change = Arc::new(MockChangeSource::new());
        let chain = Arc::new(MockChainState::at_height(850_000));
        let events = Arc::new(SpendEventBus::new());
        let state = Arc::new(WalletState::new(policy));

        let engine = SpendEngine::new(coins.clone(), Arc::new(estimator), change.clone(), state.clone())
            .with_signer(signer.clone())
            .with_chain_state(chain.clone())
            .with_event_bus(events.clone())
            .with_rng_seed(42);

        Self {
            engine: Arc::new(engine),
            coins,
            change,
            signer,
            chain,
            events,
            state,
        }
    }
}
