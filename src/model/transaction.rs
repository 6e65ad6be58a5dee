//! Transaction records and the per-connector transaction store.
//!
//! Records are append-only per connector, keyed by a connector-local
//! monotonic `tx_nr`. The connector holds the strong reference while a
//! transaction is active; the store keeps weak handles for by-number lookup
//! and reloads finished records from disk on demand.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::storage::adapter::SharedFilesystem;
use crate::storage::files::tx_file;
use crate::support::errors::PersistError;
use crate::support::time::Timestamp;

// ── Stop reasons ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    DeAuthorized,
    EmergencyStop,
    EVDisconnected,
    HardReset,
    Local,
    Other,
    PowerLoss,
    Reboot,
    Remote,
    SoftReset,
    UnlockCommand,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeAuthorized => "DeAuthorized",
            Self::EmergencyStop => "EmergencyStop",
            Self::EVDisconnected => "EVDisconnected",
            Self::HardReset => "HardReset",
            Self::Local => "Local",
            Self::Other => "Other",
            Self::PowerLoss => "PowerLoss",
            Self::Reboot => "Reboot",
            Self::Remote => "Remote",
            Self::SoftReset => "SoftReset",
            Self::UnlockCommand => "UnlockCommand",
        }
    }
}

// ── Transaction ────────────────────────────────────────────────

/// One charging session on one connector.
///
/// Lifecycle flags:
/// - `active`: the session has not ended locally yet.
/// - `running`: StartTransaction has been issued and StopTransaction has not.
/// - `start_sent` / `start_confirmed` / `stop_sent` / `stop_confirmed`:
///   delivery progress of the two framing messages.
/// - `silent`: never (or no longer) reported to the server; eligible for
///   removal without delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub connector_id: u32,
    pub tx_nr: u32,
    /// Server-assigned id; set exactly once, by the StartTransaction
    /// response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i32>,
    pub id_tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id_tag: Option<String>,
    pub authorized: bool,
    pub deauthorized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub begin_timestamp: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_timestamp: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_start: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_stop: Option<i32>,
    pub active: bool,
    pub running: bool,
    pub start_sent: bool,
    pub start_confirmed: bool,
    pub stop_sent: bool,
    pub stop_confirmed: bool,
    pub silent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_id_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<i32>,
}

impl Transaction {
    pub fn new(connector_id: u32, tx_nr: u32, silent: bool) -> Self {
        Self {
            connector_id,
            tx_nr,
            transaction_id: None,
            id_tag: String::new(),
            parent_id_tag: None,
            authorized: false,
            deauthorized: false,
            begin_timestamp: None,
            start_timestamp: None,
            stop_timestamp: None,
            meter_start: None,
            meter_stop: None,
            active: true,
            running: false,
            start_sent: false,
            start_confirmed: false,
            stop_sent: false,
            stop_confirmed: false,
            silent,
            stop_reason: None,
            stop_id_tag: None,
            reservation_id: None,
        }
    }

    /// Invariant: set exactly once, by the StartTransaction response.
    pub fn assign_transaction_id(&mut self, transaction_id: i32) {
        if self.transaction_id.is_some() {
            error!(
                connector_id = self.connector_id,
                tx_nr = self.tx_nr,
                "transactionId reassignment refused"
            );
            return;
        }
        self.transaction_id = Some(transaction_id);
    }

    /// Meter values may only be attributed to this transaction once the
    /// server can correlate them.
    pub fn accepts_meter_values(&self) -> bool {
        self.start_sent && !self.stop_sent && !self.silent
    }

    /// Both framing messages are through (or were never owed).
    pub fn is_settled(&self) -> bool {
        if self.silent {
            return !self.active;
        }
        if !self.start_sent {
            return !self.active;
        }
        self.start_confirmed && self.stop_confirmed
    }
}

// ── Store ──────────────────────────────────────────────────────

struct ConnectorTxStore {
    connector_id: u32,
    cached: Vec<Weak<RefCell<Transaction>>>,
    next_tx_nr: u32,
}

pub struct TransactionStore {
    fs: SharedFilesystem,
    connectors: Vec<ConnectorTxStore>,
}

impl TransactionStore {
    pub fn new(fs: SharedFilesystem, connector_count: u32) -> Self {
        let mut connectors = Vec::new();
        let names = fs.entries().unwrap_or_default();
        for connector_id in 1..=connector_count {
            let prefix = format!("tx-{connector_id}-");
            let max_nr = names
                .iter()
                .filter_map(|n| {
                    n.strip_prefix(&prefix)?
                        .strip_suffix(".jsn")?
                        .parse::<u32>()
                        .ok()
                })
                .max();
            connectors.push(ConnectorTxStore {
                connector_id,
                cached: Vec::new(),
                next_tx_nr: max_nr.map_or(0, |n| n + 1),
            });
        }
        Self { fs, connectors }
    }

    fn slot_mut(&mut self, connector_id: u32) -> Option<&mut ConnectorTxStore> {
        self.connectors
            .iter_mut()
            .find(|c| c.connector_id == connector_id)
    }

    pub fn next_tx_nr(&self, connector_id: u32) -> u32 {
        self.connectors
            .iter()
            .find(|c| c.connector_id == connector_id)
            .map_or(0, |c| c.next_tx_nr)
    }

    /// Highest transaction number already on record, for boot recovery.
    pub fn latest_tx_nr(&self, connector_id: u32) -> Option<u32> {
        let next = self.next_tx_nr(connector_id);
        next.checked_sub(1)
    }

    pub fn create(
        &mut self,
        connector_id: u32,
        tx_nr: u32,
        silent: bool,
    ) -> Rc<RefCell<Transaction>> {
        let tx = Rc::new(RefCell::new(Transaction::new(connector_id, tx_nr, silent)));
        if let Some(slot) = self.slot_mut(connector_id) {
            slot.next_tx_nr = slot.next_tx_nr.max(tx_nr + 1);
            slot.cached.push(Rc::downgrade(&tx));
        }
        tx
    }

    /// Atomic write of the record; every externally observable mutation
    /// must be committed before anything else reads it.
    pub fn commit(&self, tx: &Transaction) -> Result<(), PersistError> {
        let text = serde_json::to_string(tx)?;
        self.fs.write(&tx_file(tx.connector_id, tx.tx_nr), &text)
    }

    pub fn get(&mut self, connector_id: u32, tx_nr: u32) -> Option<Rc<RefCell<Transaction>>> {
        let slot = self.slot_mut(connector_id)?;
        slot.cached.retain(|w| w.strong_count() > 0);
        for weak in &slot.cached {
            if let Some(tx) = weak.upgrade() {
                if tx.borrow().tx_nr == tx_nr {
                    return Some(tx);
                }
            }
        }
        // Not in memory: reload from disk.
        let text = self.fs.read(&tx_file(connector_id, tx_nr)).ok()??;
        match serde_json::from_str::<Transaction>(&text) {
            Ok(record) => {
                let tx = Rc::new(RefCell::new(record));
                if let Some(slot) = self.slot_mut(connector_id) {
                    slot.cached.push(Rc::downgrade(&tx));
                }
                Some(tx)
            }
            Err(e) => {
                warn!(connector_id, tx_nr, "transaction record malformed: {e}");
                None
            }
        }
    }

    /// Read-only lookup: live handles and disk records, without touching
    /// the cache. For queue-side eligibility checks.
    pub fn peek(&self, connector_id: u32, tx_nr: u32) -> Option<Transaction> {
        if let Some(slot) = self
            .connectors
            .iter()
            .find(|c| c.connector_id == connector_id)
        {
            for weak in &slot.cached {
                if let Some(tx) = weak.upgrade() {
                    if tx.borrow().tx_nr == tx_nr {
                        return Some(tx.borrow().clone());
                    }
                }
            }
        }
        let text = self.fs.read(&tx_file(connector_id, tx_nr)).ok()??;
        serde_json::from_str(&text).ok()
    }

    /// Delete a settled record. Refused while delivery is still owed.
    pub fn remove(&mut self, connector_id: u32, tx_nr: u32) -> bool {
        if let Some(tx) = self.get(connector_id, tx_nr) {
            if !tx.borrow().is_settled() {
                warn!(connector_id, tx_nr, "transaction removal refused: not settled");
                return false;
            }
        }
        self.fs.remove(&tx_file(connector_id, tx_nr)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemFilesystem;

    fn store() -> (TransactionStore, Rc<MemFilesystem>) {
        let fs = Rc::new(MemFilesystem::new());
        (TransactionStore::new(fs.clone(), 2), fs)
    }

    #[test]
    fn create_commit_reload() {
        let (mut store, fs) = store();
        let tx = store.create(1, 0, false);
        {
            let mut tx = tx.borrow_mut();
            tx.id_tag = "TAG01".into();
            tx.meter_start = Some(100);
        }
        store.commit(&tx.borrow()).unwrap();
        assert!(fs.contains("tx-1-0.jsn"));

        // Same in-memory object while a strong ref exists.
        let again = store.get(1, 0).unwrap();
        assert!(Rc::ptr_eq(&tx, &again));

        // Reload from disk after the strong refs drop.
        drop(tx);
        drop(again);
        let reloaded = store.get(1, 0).unwrap();
        assert_eq!(reloaded.borrow().id_tag, "TAG01");
        assert_eq!(reloaded.borrow().meter_start, Some(100));
    }

    #[test]
    fn tx_nr_monotonic_across_reboot() {
        let (mut store, fs) = store();
        let tx = store.create(1, store.next_tx_nr(1), false);
        store.commit(&tx.borrow()).unwrap();
        assert_eq!(store.next_tx_nr(1), 1);

        let store2 = TransactionStore::new(fs, 2);
        assert_eq!(store2.next_tx_nr(1), 1);
        assert_eq!(store2.next_tx_nr(2), 0);
    }

    #[test]
    fn transaction_id_set_once() {
        let mut tx = Transaction::new(1, 0, false);
        tx.assign_transaction_id(42);
        tx.assign_transaction_id(43);
        assert_eq!(tx.transaction_id, Some(42));
    }

    #[test]
    fn removal_refused_until_settled() {
        let (mut store, fs) = store();
        let tx = store.create(1, 0, false);
        {
            let mut t = tx.borrow_mut();
            t.start_sent = true;
            t.start_confirmed = true;
        }
        store.commit(&tx.borrow()).unwrap();
        assert!(!store.remove(1, 0));
        {
            let mut t = tx.borrow_mut();
            t.active = false;
            t.stop_sent = true;
            t.stop_confirmed = true;
        }
        store.commit(&tx.borrow()).unwrap();
        assert!(store.remove(1, 0));
        assert!(!fs.contains("tx-1-0.jsn"));
    }

    #[test]
    fn silent_transaction_settles_without_delivery() {
        let mut tx = Transaction::new(1, 3, true);
        assert!(!tx.is_settled());
        tx.active = false;
        assert!(tx.is_settled());
        assert!(!tx.accepts_meter_values());
    }
}
