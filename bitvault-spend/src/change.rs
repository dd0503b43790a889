//! Change policy
//!
//! Decides where change goes, which script type it uses and where it sits
//! among the outputs. Whether change exists at all is settled by the
//! transaction assembler, which knows the final fee.
//!
//! A fresh change script is reserved from the wallet's `ChangeAddressSource`
//! before selection, because selection needs the change output's size. The
//! reservation is wrapped in a `ReservedChange` that returns the script to
//! the source when dropped, unless the attempt keeps it.

use bitcoin::{Script, ScriptBuf};
use log::debug;
use rand::{Rng, RngCore};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::coin_control::CoinControl;
use crate::error::SpendError;
use crate::logging::sanitize_script;
use crate::types::{parse_destination, OutputType, RANDOM_CHANGE_POSITION};
use crate::wallet_state::WalletPolicy;

/// Where the change output goes among the outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangePosition {
    /// Uniformly random position
    #[default]
    Random,
    /// Fixed index in the final output list
    At(usize),
}

impl ChangePosition {
    /// Parse a raw position where -1 means random
    ///
    /// # Errors
    /// * `InvalidRequest` for negative values other than -1
    pub fn from_index(index: i64) -> Result<Self, SpendError> {
        if index == RANDOM_CHANGE_POSITION {
            Ok(ChangePosition::Random)
        } else if index < 0 {
            Err(SpendError::InvalidRequest(format!("Invalid change position {}", index)))
        } else {
            Ok(ChangePosition::At(index as usize))
        }
    }

    /// Index of the change output when added to `payment_outputs` outputs
    ///
    /// # Errors
    /// * `InvalidRequest` when a fixed position is past the end
    pub fn resolve(&self, payment_outputs: usize, rng: &mut dyn RngCore) -> Result<usize, SpendError> {
        match *self {
            ChangePosition::Random => Ok(rng.random_range(0..=payment_outputs)),
            ChangePosition::At(index) if index <= payment_outputs => Ok(index),
            ChangePosition::At(index) => Err(SpendError::InvalidRequest(format!(
                "Change position {} is out of bounds for {} outputs",
                index, payment_outputs
            ))),
        }
    }

    /// Reject a fixed position past the end before any work is done
    pub fn validate(&self, payment_outputs: usize) -> Result<(), SpendError> {
        match *self {
            ChangePosition::At(index) if index > payment_outputs => Err(SpendError::InvalidRequest(format!(
                "Change position {} is out of bounds for {} outputs",
                index, payment_outputs
            ))),
            _ => Ok(()),
        }
    }
}

/// Wallet component that hands out internal change scripts
pub trait ChangeAddressSource: Send + Sync {
    /// Reserve a fresh change script of `output_type`
    fn reserve_change_script(&self, output_type: OutputType) -> Result<ScriptBuf, SpendError>;

    /// The reserved script was used; do not hand it out again
    fn keep_change_script(&self, script: &Script);

    /// The reserved script was not used; it may be handed out again
    fn return_change_script(&self, script: &Script);
}

/// A change script reserved for one attempt
pub struct ReservedChange {
    script: ScriptBuf,
    source: Option<Arc<dyn ChangeAddressSource>>,
}

impl ReservedChange {
    /// Change to a caller-chosen script; nothing to keep or return
    pub fn explicit(script: ScriptBuf) -> Self {
        Self { script, source: None }
    }

    /// Reserve a fresh script from `source`
    pub fn reserve(source: Arc<dyn ChangeAddressSource>, output_type: OutputType) -> Result<Self, SpendError> {
        let script = source.reserve_change_script(output_type)?;
        debug!("Reserved {} change script {}", output_type, sanitize_script(&script));
        Ok(Self {
            script,
            source: Some(source),
        })
    }

    /// Script change pays to
    pub fn script(&self) -> &Script {
        &self.script
    }

    /// Keep the script because the transaction uses it
    pub fn keep(mut self) {
        if let Some(source) = self.source.take() {
            source.keep_change_script(&self.script);
        }
    }
}

impl std::fmt::Debug for ReservedChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservedChange")
            .field("script", &sanitize_script(&self.script))
            .field("from_source", &self.source.is_some())
            .finish()
    }
}

impl Drop for ReservedChange {
    fn drop(&mut self) {
        if let Some(source) = self.source.take() {
            source.return_change_script(&self.script);
        }
    }
}

/// Output type for a freshly reserved change script
///
/// Coin control wins, then the wallet default. Otherwise change mirrors
/// the recipients so it does not stand out: taproot if any recipient is
/// taproot, native segwit if any is a witness program, else the type of the
/// first recipient.
pub fn change_output_type<'a>(
    coin_control: &CoinControl,
    policy: &WalletPolicy,
    recipient_scripts: impl IntoIterator<Item = &'a Script>,
) -> OutputType {
    if let Some(output_type) = coin_control.change_type.or(policy.default_change_type) {
        return output_type;
    }

    let types: Vec<Option<OutputType>> = recipient_scripts.into_iter().map(OutputType::from_script).collect();
    if types.contains(&Some(OutputType::Bech32m)) {
        OutputType::Bech32m
    } else if types.contains(&Some(OutputType::Bech32)) {
        OutputType::Bech32
    } else {
        types.first().copied().flatten().unwrap_or(OutputType::Bech32)
    }
}

/// Reserve the change destination for an attempt
///
/// An explicit destination in coin control is parsed against the wallet's
/// network; otherwise a fresh script is reserved from `source`.
///
/// # Errors
/// * `InvalidDestination` for a malformed or wrong-network change address
pub fn reserve_change<'a>(
    source: &Arc<dyn ChangeAddressSource>,
    coin_control: &CoinControl,
    policy: &WalletPolicy,
    recipient_scripts: impl IntoIterator<Item = &'a Script>,
) -> Result<ReservedChange, SpendError> {
    if let Some(address) = &coin_control.change_destination {
        let script = parse_destination(address, policy.network)?;
        return Ok(ReservedChange::explicit(script));
    }

    let output_type = change_output_type(coin_control, policy, recipient_scripts);
    ReservedChange::reserve(Arc::clone(source), output_type)
}

/// Change source deriving scripts from a counter, for tests and offline use
///
/// Records which scripts were kept and returned.
#[derive(Debug, Default)]
pub struct MockChangeSource {
    state: Mutex<MockChangeState>,
}

#[derive(Debug, Default)]
struct MockChangeState {
    next_index: u32,
    outstanding: HashSet<ScriptBuf>,
    kept: Vec<ScriptBuf>,
    returned: Vec<ScriptBuf>,
    exhausted: bool,
}

impl MockChangeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source that cannot hand out any script
    pub fn exhausted() -> Self {
        let source = Self::default();
        source.lock().exhausted = true;
        source
    }

    /// Scripts kept so far
    pub fn kept(&self) -> Vec<ScriptBuf> {
        self.lock().kept.clone()
    }

    /// Scripts returned so far
    pub fn returned(&self) -> Vec<ScriptBuf> {
        self.lock().returned.clone()
    }

    /// Scripts reserved and neither kept nor returned
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockChangeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Single-key script of `output_type` with a program derived from `index`
fn derive_script(output_type: OutputType, index: u32) -> ScriptBuf {
    let mut program = [0xc4u8; 32];
    program[..4].copy_from_slice(&index.to_be_bytes());

    let bytes = match output_type {
        OutputType::Legacy => [&[0x76, 0xa9, 0x14][..], &program[..20], &[0x88, 0xac][..]].concat(),
        OutputType::P2shSegwit => [&[0xa9, 0x14][..], &program[..20], &[0x87][..]].concat(),
        OutputType::Bech32 => [&[0x00, 0x14][..], &program[..20]].concat(),
        OutputType::Bech32m => [&[0x51, 0x20][..], &program[..]].concat(),
    };
    ScriptBuf::from_bytes(bytes)
}

impl ChangeAddressSource for MockChangeSource {
    fn reserve_change_script(&self, output_type: OutputType) -> Result<ScriptBuf, SpendError> {
        let mut state = self.lock();
        if state.exhausted {
            return Err(SpendError::InvalidDestination(
                "No change address available from the keypool".to_string(),
            ));
        }
        let script = derive_script(output_type, state.next_index);
        state.next_index += 1;
        state.outstanding.insert(script.clone());
        Ok(script)
    }

    fn keep_change_script(&self, script: &Script) {
        let mut state = self.lock();
        state.outstanding.remove(script);
        state.kept.push(script.to_owned());
    }

    fn return_change_script(&self, script: &Script) {
        let mut state = self.lock();
        state.outstanding.remove(script);
        state.returned.push(script.to_owned());
    }
}
