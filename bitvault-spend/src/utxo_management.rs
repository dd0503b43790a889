//! Coin set view and coin reservations
//!
//! `UtxoSetView` is how the engine reads the wallet's coins. The wallet owns
//! the coins and their storage; the engine only asks for the ones matching a
//! `CoinFilter`.
//!
//! `ReservationTable` tracks which coins are claimed:
//! - reserved coins belong to an attempt that has not committed or released yet
//! - locked coins were set aside by the user and are skipped by automatic selection
//! - spent coins were committed by an attempt and are never offered again
//!
//! The table's mutex is the coarse lock that serializes selection. An attempt
//! takes it with `ReservationTable::begin`, selects while holding it, and
//! gives it up by turning it into a `ReservationHandle`.

use bitcoin::{Amount, OutPoint};
use log::{debug, warn};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::coin_control::CoinControl;
use crate::error::SpendError;
use crate::events::{outpoint_infos, SpendEvent, SpendEventBus};
use crate::logging::sanitize_outpoint;
use crate::types::DEFAULT_MAX_DEPTH;
use crate::utxo_selection::Utxo;

/// Read access to the wallet's spendable coins
pub trait UtxoSetView: Send + Sync {
    /// Coins matching `filter`
    fn spendable_coins(&self, filter: &CoinFilter) -> Vec<Utxo>;

    /// Look up one coin regardless of filters
    fn coin(&self, outpoint: &OutPoint) -> Option<Utxo> {
        self.spendable_coins(&CoinFilter::everything())
            .into_iter()
            .find(|utxo| utxo.outpoint == *outpoint)
    }
}

/// Coin eligibility derived from coin control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoinFilter {
    /// Minimum confirmation depth
    pub min_depth: u32,
    /// Maximum confirmation depth
    pub max_depth: u32,
    /// Accept unconfirmed coins from others
    pub include_unsafe: bool,
    /// Accept coins the wallet cannot sign for
    pub allow_watch_only: bool,
    /// Reject coins whose script has been reused
    pub avoid_address_reuse: bool,
}

impl CoinFilter {
    /// Filter matching the options of one attempt
    pub fn from_coin_control(coin_control: &CoinControl) -> Self {
        Self {
            min_depth: coin_control.min_depth,
            max_depth: coin_control.max_depth,
            include_unsafe: coin_control.include_unsafe_inputs,
            allow_watch_only: coin_control.allow_watch_only,
            avoid_address_reuse: coin_control.avoid_address_reuse,
        }
    }

    /// Filter accepting every coin
    pub fn everything() -> Self {
        Self {
            min_depth: 0,
            max_depth: DEFAULT_MAX_DEPTH,
            include_unsafe: true,
            allow_watch_only: true,
            avoid_address_reuse: false,
        }
    }

    /// Whether `utxo` passes the filter
    pub fn matches(&self, utxo: &Utxo) -> bool {
        if utxo.confirmations < self.min_depth || utxo.confirmations > self.max_depth {
            return false;
        }
        if !self.include_unsafe && !utxo.is_safe() {
            return false;
        }
        if !self.allow_watch_only && utxo.is_watch_only {
            return false;
        }
        !(self.avoid_address_reuse && utxo.address_reused)
    }
}

/// In-memory coin set
///
/// Suitable for tests and for wallets that keep their coins in memory.
#[derive(Debug, Default)]
pub struct UtxoSet {
    utxos: RwLock<Vec<Utxo>>,
}

impl UtxoSet {
    /// Create a new UTXO set with the given UTXOs
    pub fn new(utxos: Vec<Utxo>) -> Self {
        Self {
            utxos: RwLock::new(utxos),
        }
    }

    /// Add a UTXO to the set
    ///
    /// # Returns
    /// * `true` if the UTXO was added, `false` if one with the same outpoint exists
    pub fn add(&self, utxo: Utxo) -> bool {
        let mut utxos = self.write();
        if utxos.iter().any(|u| u.outpoint == utxo.outpoint) {
            return false;
        }
        utxos.push(utxo);
        true
    }

    /// Remove a UTXO from the set
    pub fn remove(&self, outpoint: &OutPoint) -> Option<Utxo> {
        let mut utxos = self.write();
        let position = utxos.iter().position(|u| u.outpoint == *outpoint)?;
        Some(utxos.remove(position))
    }

    /// Get the total value of all UTXOs in the set
    pub fn total_value(&self) -> Amount {
        self.read().iter().map(|utxo| utxo.amount).sum()
    }

    /// Get the number of UTXOs in the set
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Check if the set is empty
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Utxo>> {
        match self.utxos.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Utxo>> {
        match self.utxos.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl UtxoSetView for UtxoSet {
    fn spendable_coins(&self, filter: &CoinFilter) -> Vec<Utxo> {
        self.read().iter().filter(|utxo| filter.matches(utxo)).cloned().collect()
    }

    fn coin(&self, outpoint: &OutPoint) -> Option<Utxo> {
        self.read().iter().find(|utxo| utxo.outpoint == *outpoint).cloned()
    }
}

#[derive(Debug, Default)]
struct ReservationState {
    reserved: HashSet<OutPoint>,
    locked: HashSet<OutPoint>,
    spent: HashSet<OutPoint>,
}

impl ReservationState {
    fn is_available(&self, outpoint: &OutPoint) -> bool {
        !self.reserved.contains(outpoint) && !self.locked.contains(outpoint) && !self.spent.contains(outpoint)
    }
}

/// Shared record of reserved, locked and spent coins
///
/// Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct ReservationTable {
    state: Arc<Mutex<ReservationState>>,
    events: Option<Arc<SpendEventBus>>,
}

impl ReservationTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish reservation events on `bus`
    pub fn with_event_bus(mut self, bus: Arc<SpendEventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    /// Take the coarse lock for one attempt
    ///
    /// Other attempts block here until the returned lock is dropped or
    /// turned into a reservation.
    pub fn begin(&self) -> ReservationLock<'_> {
        ReservationLock {
            table: self,
            state: self.state(),
        }
    }

    /// Lock coins against automatic selection
    ///
    /// # Errors
    /// * `LockedUnspentsConflict` listing the coins that are already locked
    ///   or spent; nothing is locked in that case
    pub fn lock_unspent(&self, outpoints: &[OutPoint]) -> Result<(), SpendError> {
        let mut state = self.state();
        let conflicts: Vec<OutPoint> = outpoints
            .iter()
            .filter(|outpoint| state.locked.contains(*outpoint) || state.spent.contains(*outpoint))
            .copied()
            .collect();
        if !conflicts.is_empty() {
            return Err(SpendError::LockedUnspentsConflict { outpoints: conflicts });
        }

        state.locked.extend(outpoints.iter().copied());
        drop(state);

        debug!("Locked {} coin(s)", outpoints.len());
        self.publish(SpendEvent::Locked {
            utxos: outpoint_infos(outpoints),
        });
        Ok(())
    }

    /// Unlock one coin
    ///
    /// # Returns
    /// * `true` if the coin was locked
    pub fn unlock_unspent(&self, outpoint: &OutPoint) -> bool {
        self.state().locked.remove(outpoint)
    }

    /// Unlock every coin
    pub fn unlock_all(&self) {
        self.state().locked.clear();
    }

    /// Whether `outpoint` is locked
    pub fn is_locked(&self, outpoint: &OutPoint) -> bool {
        self.state().locked.contains(outpoint)
    }

    /// Whether `outpoint` is reserved by an attempt
    pub fn is_reserved(&self, outpoint: &OutPoint) -> bool {
        self.state().reserved.contains(outpoint)
    }

    /// Whether `outpoint` was committed as spent
    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.state().spent.contains(outpoint)
    }

    /// Locked coins in outpoint order
    pub fn list_locked(&self) -> Vec<OutPoint> {
        let mut locked: Vec<OutPoint> = self.state().locked.iter().copied().collect();
        locked.sort();
        locked
    }

    /// Number of coins currently reserved
    pub fn reserved_count(&self) -> usize {
        self.state().reserved.len()
    }

    /// Drop spent records the coin set no longer reports
    pub fn forget_spent(&self, outpoints: &[OutPoint]) {
        let mut state = self.state();
        for outpoint in outpoints {
            state.spent.remove(outpoint);
        }
    }

    fn state(&self) -> MutexGuard<'_, ReservationState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Reservation table lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn publish(&self, event: SpendEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}

/// The coarse coin-set lock, held while an attempt selects
pub struct ReservationLock<'a> {
    table: &'a ReservationTable,
    state: MutexGuard<'a, ReservationState>,
}

impl ReservationLock<'_> {
    /// Whether `outpoint` is free for this attempt
    pub fn is_available(&self, outpoint: &OutPoint) -> bool {
        self.state.is_available(outpoint)
    }

    /// Whether `outpoint` is locked
    pub fn is_locked(&self, outpoint: &OutPoint) -> bool {
        self.state.locked.contains(outpoint)
    }

    /// Whether `outpoint` is neither reserved nor spent, locked or not
    pub fn is_unclaimed(&self, outpoint: &OutPoint) -> bool {
        !self.state.reserved.contains(outpoint) && !self.state.spent.contains(outpoint)
    }

    /// Reserve `outpoints` and release the lock
    ///
    /// # Errors
    /// * `CoinUnavailable` for the first coin that is already reserved,
    ///   locked or spent; nothing is reserved in that case
    pub fn reserve(mut self, outpoints: Vec<OutPoint>) -> Result<ReservationHandle, SpendError> {
        let mut seen = HashSet::new();
        for outpoint in &outpoints {
            if !self.state.is_available(outpoint) || !seen.insert(*outpoint) {
                return Err(SpendError::CoinUnavailable(*outpoint));
            }
        }

        self.state.reserved.extend(outpoints.iter().copied());
        let table = self.table.clone();
        drop(self);

        debug!(
            "Reserved {} coin(s): {}",
            outpoints.len(),
            outpoints.iter().map(sanitize_outpoint).collect::<Vec<_>>().join(", ")
        );
        table.publish(SpendEvent::Reserved {
            utxos: outpoint_infos(&outpoints),
        });

        Ok(ReservationHandle {
            table,
            outpoints,
            active: true,
        })
    }
}

/// Coins reserved by one attempt
///
/// Consumed by `commit` or `release`. Dropping an active handle releases
/// the coins.
#[derive(Debug)]
pub struct ReservationHandle {
    table: ReservationTable,
    outpoints: Vec<OutPoint>,
    active: bool,
}

impl ReservationHandle {
    /// Reserved coins, in input order
    pub fn outpoints(&self) -> &[OutPoint] {
        &self.outpoints
    }

    /// Lock some of the reserved coins against future automatic selection
    ///
    /// The locks outlive the reservation.
    pub fn lock(&self, outpoints: &[OutPoint]) -> Result<(), SpendError> {
        if let Some(outpoint) = outpoints.iter().find(|outpoint| !self.outpoints.contains(outpoint)) {
            return Err(SpendError::InternalInvariant(format!(
                "Cannot lock {} which this attempt did not reserve",
                sanitize_outpoint(outpoint)
            )));
        }
        self.table.lock_unspent(outpoints)
    }

    /// Mark the coins as spent
    pub fn commit(mut self) {
        self.finish(true);
    }

    /// Return the coins to the pool
    pub fn release(mut self) {
        self.finish(false);
    }

    fn finish(&mut self, spent: bool) {
        if !self.active {
            return;
        }
        self.active = false;

        {
            let mut state = self.table.state();
            for outpoint in &self.outpoints {
                state.reserved.remove(outpoint);
                if spent {
                    state.spent.insert(*outpoint);
                }
            }
        }

        let utxos = outpoint_infos(&self.outpoints);
        if spent {
            debug!("Committed {} coin(s)", self.outpoints.len());
            self.table.publish(SpendEvent::Committed { utxos });
        } else {
            debug!("Released {} coin(s)", self.outpoints.len());
            self.table.publish(SpendEvent::Released { utxos });
        }
    }
}

impl Drop for ReservationHandle {
    fn drop(&mut self) {
        self.finish(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{ScriptBuf, Txid};
    use std::str::FromStr;

    fn outpoint(vout: u32) -> OutPoint {
        let txid = Txid::from_str("7777777777777777777777777777777777777777777777777777777777777777").unwrap();
        OutPoint::new(txid, vout)
    }

    fn coin(vout: u32, confirmations: u32) -> Utxo {
        let script = ScriptBuf::from_bytes([vec![0x00, 0x14], vec![7u8; 20]].concat());
        Utxo::new(outpoint(vout), Amount::from_sat(10_000), script, confirmations)
    }

    #[test]
    fn test_filter() {
        let filter = CoinFilter::from_coin_control(&CoinControl::new());
        assert!(filter.matches(&coin(0, 1)));
        assert!(!filter.matches(&coin(0, 0)));
        assert!(filter.matches(&coin(0, 0).as_change()));
        assert!(!filter.matches(&coin(0, 3).watch_only()));
        assert!(filter.matches(&coin(0, 3).reused()));

        let mut coin_control = CoinControl::new().with_depth_range(2, 10);
        coin_control.avoid_address_reuse = true;
        let filter = CoinFilter::from_coin_control(&coin_control);
        assert!(!filter.matches(&coin(0, 1)));
        assert!(!filter.matches(&coin(0, 11)));
        assert!(!filter.matches(&coin(0, 3).reused()));
        assert!(filter.matches(&coin(0, 3)));
    }

    #[test]
    fn test_utxo_set() {
        let set = UtxoSet::new(vec![coin(0, 1), coin(1, 0)]);
        assert!(!set.add(coin(0, 5)));
        assert!(set.add(coin(2, 5)));
        assert_eq!(set.len(), 3);
        assert_eq!(set.total_value(), Amount::from_sat(30_000));

        let filter = CoinFilter::from_coin_control(&CoinControl::new());
        assert_eq!(set.spendable_coins(&filter).len(), 2);
        assert!(set.coin(&outpoint(1)).is_some());
        assert!(set.remove(&outpoint(1)).is_some());
        assert!(set.coin(&outpoint(1)).is_none());
    }

    #[test]
    fn test_reservation_lifecycle() {
        let table = ReservationTable::new();

        let handle = table.begin().reserve(vec![outpoint(0), outpoint(1)]).unwrap();
        assert!(table.is_reserved(&outpoint(0)));
        assert!(!table.begin().is_available(&outpoint(1)));
        assert!(matches!(
            table.begin().reserve(vec![outpoint(1)]),
            Err(SpendError::CoinUnavailable(_))
        ));

        handle.release();
        assert_eq!(table.reserved_count(), 0);

        let handle = table.begin().reserve(vec![outpoint(0)]).unwrap();
        handle.commit();
        assert!(table.is_spent(&outpoint(0)));
        assert!(!table.begin().is_available(&outpoint(0)));
    }

    #[test]
    fn test_drop_releases() {
        let table = ReservationTable::new();
        {
            let _handle = table.begin().reserve(vec![outpoint(3)]).unwrap();
            assert_eq!(table.reserved_count(), 1);
        }
        assert_eq!(table.reserved_count(), 0);
    }

    #[test]
    fn test_duplicate_outpoints_rejected() {
        let table = ReservationTable::new();
        assert!(table.begin().reserve(vec![outpoint(4), outpoint(4)]).is_err());
        assert_eq!(table.reserved_count(), 0);
    }

    #[test]
    fn test_locking() {
        let bus = Arc::new(SpendEventBus::new());
        let events = bus.subscribe("locked");
        let table = ReservationTable::new().with_event_bus(bus);

        table.lock_unspent(&[outpoint(5)]).unwrap();
        assert!(table.is_locked(&outpoint(5)));
        assert_eq!(table.list_locked(), vec![outpoint(5)]);
        assert!(matches!(
            table.lock_unspent(&[outpoint(5), outpoint(6)]),
            Err(SpendError::LockedUnspentsConflict { .. })
        ));
        assert!(!table.is_locked(&outpoint(6)));
        assert_eq!(events.try_iter().count(), 1);

        let handle = table.begin().reserve(vec![outpoint(6)]).unwrap();
        handle.lock(&[outpoint(6)]).unwrap();
        assert!(handle.lock(&[outpoint(7)]).is_err());
        handle.release();
        assert!(table.is_locked(&outpoint(6)));

        assert!(table.unlock_unspent(&outpoint(5)));
        table.unlock_all();
        assert!(table.list_locked().is_empty());
    }
}
