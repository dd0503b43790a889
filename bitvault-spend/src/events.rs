//! Spend events
//!
//! The engine reports notable decisions of each attempt on a `SpendEventBus`
//! so a wallet UI or audit log can follow along without parsing log lines.
//! Subscribers receive events over std mpsc channels, either for one event
//! kind or for all of them.
//!
//! ```
//! use bitvault_spend::events::{SpendEvent, SpendEventBus};
//!
//! let bus = SpendEventBus::new();
//! let receiver = bus.subscribe("excess_to_fee");
//!
//! bus.publish(SpendEvent::ExcessToFee { amount: 120 });
//! assert_eq!(receiver.try_recv().unwrap(), SpendEvent::ExcessToFee { amount: 120 });
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

/// Events published during construction and funding attempts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpendEvent {
    /// Inputs were chosen for an attempt
    CoinsSelected {
        /// The chosen coins
        utxos: Vec<OutPointInfo>,
        /// The strategy that produced the winning selection
        algorithm: String,
        /// Selection target in satoshis
        target_amount: u64,
        /// Waste score of the selection
        waste: i64,
    },
    /// Leftover value too small for change was added to the fee
    ExcessToFee {
        /// Satoshis added to the fee
        amount: u64,
    },
    /// Coins were reserved for an attempt
    Reserved { utxos: Vec<OutPointInfo> },
    /// Reserved coins were released without being spent
    Released { utxos: Vec<OutPointInfo> },
    /// Reserved coins were committed as spent
    Committed { utxos: Vec<OutPointInfo> },
    /// Coins were locked against automatic selection
    Locked { utxos: Vec<OutPointInfo> },
    /// An attempt failed
    ConstructionFailed {
        /// Error description
        reason: String,
    },
}

impl SpendEvent {
    /// Name used for subscriptions
    pub fn kind(&self) -> &'static str {
        match self {
            SpendEvent::CoinsSelected { .. } => "coins_selected",
            SpendEvent::ExcessToFee { .. } => "excess_to_fee",
            SpendEvent::Reserved { .. } => "reserved",
            SpendEvent::Released { .. } => "released",
            SpendEvent::Committed { .. } => "committed",
            SpendEvent::Locked { .. } => "locked",
            SpendEvent::ConstructionFailed { .. } => "construction_failed",
        }
    }
}

/// OutPointInfo is a serializable representation of a Bitcoin OutPoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPointInfo {
    /// Transaction ID as a string
    pub txid: String,
    /// Output index
    pub vout: u32,
}

impl From<&bitcoin::OutPoint> for OutPointInfo {
    fn from(outpoint: &bitcoin::OutPoint) -> Self {
        Self {
            txid: outpoint.txid.to_string(),
            vout: outpoint.vout,
        }
    }
}

/// Convert a list of outpoints for an event payload
pub fn outpoint_infos<'a>(outpoints: impl IntoIterator<Item = &'a bitcoin::OutPoint>) -> Vec<OutPointInfo> {
    outpoints.into_iter().map(OutPointInfo::from).collect()
}

/// Simple message bus for spend events
#[derive(Debug, Default)]
pub struct SpendEventBus {
    subscribers: Mutex<HashMap<String, Vec<Sender<SpendEvent>>>>,
}

impl SpendEventBus {
    /// Create a new spend event bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to all spend events
    pub fn subscribe_all(&self) -> Receiver<SpendEvent> {
        self.subscribe("all")
    }

    /// Subscribe to one kind of spend event
    ///
    /// # Arguments
    ///
    /// * `event_type` - An event kind such as "coins_selected" or "excess_to_fee",
    ///                  or "all" for every event
    pub fn subscribe(&self, event_type: &str) -> Receiver<SpendEvent> {
        let (sender, receiver) = mpsc::channel();

        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers
            .entry(event_type.to_lowercase())
            .or_insert_with(Vec::new)
            .push(sender);

        receiver
    }

    /// Publish a spend event
    ///
    /// Subscribers whose receiver has been dropped are pruned.
    pub fn publish(&self, event: SpendEvent) {
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        for key in [event.kind(), "all"] {
            if let Some(senders) = subscribers.get_mut(key) {
                senders.retain(|sender| sender.send(event.clone()).is_ok());
            }
        }
    }
}
