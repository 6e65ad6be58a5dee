//! Persistent numbering and storage of transaction-related requests.
//!
//! Operation numbers are assigned from a window `[opBegin, opEnd)` over the
//! modulo-`MAX_OPNR` number line. `opEnd` moves on reservation, `opBegin` on
//! completion; both cursors live in the client-state configuration container
//! and are flushed immediately, not lazily, because the window is the source
//! of truth for crash recovery.

use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::storage::adapter::SharedFilesystem;
use crate::storage::configuration::{ConfigHandle, ConfigService};
use crate::storage::files::{op_file, CLIENT_STATE_FN};
use crate::support::errors::PersistError;

/// Operation numbers wrap modulo this.
pub const MAX_OPNR: u32 = 10_000;

/// Wrap-aware distance from `x` back to the `end` cursor.
fn distance(x: u32, end: u32) -> u32 {
    (end + MAX_OPNR - x) % MAX_OPNR
}

/// `a` precedes `b` given the current `end` cursor. Assumes the window is
/// much smaller than `MAX_OPNR / 2`.
pub fn precedes(a: u32, b: u32, end: u32) -> bool {
    distance(a, end) > distance(b, end)
}

/// On-disk form of a persistent request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRequestRecord {
    pub op_nr: u32,
    pub action: String,
    pub payload: Value,
    /// Transaction binding, for operations that must find their
    /// transaction again after a reboot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_nr: Option<u32>,
}

pub struct RequestStore {
    fs: SharedFilesystem,
    cfg: Rc<ConfigService>,
    op_begin: ConfigHandle,
    op_end: ConfigHandle,
}

impl RequestStore {
    pub fn new(fs: SharedFilesystem, cfg: Rc<ConfigService>) -> Self {
        let op_begin = cfg.declare_state_int("opBegin", 0);
        let op_end = cfg.declare_state_int("opEnd", 0);
        let mut store = Self {
            fs,
            cfg,
            op_begin,
            op_end,
        };
        store.repair();
        store
    }

    pub fn op_begin(&self) -> u32 {
        (self.op_begin.int().max(0) as u32) % MAX_OPNR
    }

    pub fn op_end(&self) -> u32 {
        (self.op_end.int().max(0) as u32) % MAX_OPNR
    }

    /// Number of outstanding operation numbers.
    pub fn pending_count(&self) -> u32 {
        distance(self.op_begin(), self.op_end())
    }

    fn persist_cursors(&self) {
        if let Err(e) = self.cfg.save_now(CLIENT_STATE_FN) {
            // The window survives in memory; a stale cursor on disk is
            // repaired on next boot.
            warn!("op cursor persistence failed: {e}");
        }
    }

    /// Hand out `opEnd` and advance it. The caller must `commit` the record
    /// next; a crash in between leaves an orphan that `repair` trims.
    pub fn reserve_opnr(&mut self) -> Result<u32, PersistError> {
        if self.pending_count() >= MAX_OPNR - 1 {
            return Err(PersistError::OpNrWindowFull);
        }
        let nr = self.op_end();
        self.op_end.set_int(((nr + 1) % MAX_OPNR) as i32);
        self.cfg.save_now(CLIENT_STATE_FN)?;
        debug!(op_nr = nr, "operation number reserved");
        Ok(nr)
    }

    /// Write the record; after return it survives reboot.
    pub fn commit(&mut self, record: &StoredRequestRecord) -> Result<(), PersistError> {
        let text = serde_json::to_string(record)?;
        self.fs.write(&op_file(record.op_nr), &text)
    }

    pub fn fetch(&self, op_nr: u32) -> Option<StoredRequestRecord> {
        let text = match self.fs.read(&op_file(op_nr)) {
            Ok(Some(text)) => text,
            Ok(None) => return None,
            Err(e) => {
                warn!(op_nr, "stored request unreadable: {e}");
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(op_nr, "stored request malformed: {e}");
                None
            }
        }
    }

    /// Mark `op_nr` done. If it is the window head, `opBegin` advances past
    /// it and past any gaps left by non-contiguous completions.
    pub fn advance(&mut self, op_nr: u32) {
        if let Err(e) = self.fs.remove(&op_file(op_nr)) {
            warn!(op_nr, "stored request removal failed: {e}");
        }
        if op_nr != self.op_begin() {
            return;
        }
        let end = self.op_end();
        let mut begin = (op_nr + 1) % MAX_OPNR;
        while begin != end && self.fetch(begin).is_none() {
            begin = (begin + 1) % MAX_OPNR;
        }
        self.op_begin.set_int(begin as i32);
        self.persist_cursors();
    }

    /// Boot-time window repair.
    ///
    /// Trims an `opEnd` that advanced without a committed record (crash
    /// between reserve and commit), then skips leading gaps so `opBegin`
    /// points at a present record or equals `opEnd`.
    fn repair(&mut self) {
        let begin = self.op_begin();
        let mut end = self.op_end();
        let mut changed = false;

        while end != begin {
            let last = (end + MAX_OPNR - 1) % MAX_OPNR;
            if self.fetch(last).is_some() {
                break;
            }
            end = last;
            changed = true;
        }
        if changed {
            info!(op_end = end, "repaired orphan opEnd");
            self.op_end.set_int(end as i32);
        }

        let mut begin = self.op_begin();
        let mut moved = false;
        while begin != end && self.fetch(begin).is_none() {
            begin = (begin + 1) % MAX_OPNR;
            moved = true;
        }
        if moved {
            info!(op_begin = begin, "skipped leading gap in request store");
            self.op_begin.set_int(begin as i32);
        }

        if changed || moved {
            self.persist_cursors();
        }
    }

    /// Drop every stored request and collapse the window (ClearCache).
    pub fn clear(&mut self) {
        let names = match self.fs.entries() {
            Ok(names) => names,
            Err(e) => {
                warn!("request store enumeration failed: {e}");
                Vec::new()
            }
        };
        for name in names {
            if name.starts_with("op-") {
                let _ = self.fs.remove(&name);
            }
        }
        self.op_begin.set_int(self.op_end.int());
        self.persist_cursors();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::adapter::FilesystemAdapter;
    use crate::storage::{ConfigService, MemFilesystem};
    use serde_json::json;

    fn store_with_fs(fs: Rc<MemFilesystem>) -> RequestStore {
        let cfg = ConfigService::new(fs.clone());
        RequestStore::new(fs, cfg)
    }

    fn record(op_nr: u32) -> StoredRequestRecord {
        StoredRequestRecord {
            op_nr,
            action: "MeterValues".into(),
            payload: json!({"connectorId": 1}),
            connector_id: Some(1),
            tx_nr: None,
        }
    }

    #[test]
    fn reserve_commit_fetch_advance() {
        let fs = Rc::new(MemFilesystem::new());
        let mut store = store_with_fs(fs.clone());

        let nr = store.reserve_opnr().unwrap();
        assert_eq!(nr, 0);
        store.commit(&record(nr)).unwrap();
        assert!(fs.contains("op-0.jsn"));

        let fetched = store.fetch(nr).unwrap();
        assert_eq!(fetched.action, "MeterValues");

        store.advance(nr);
        assert!(!fs.contains("op-0.jsn"));
        assert_eq!(store.op_begin(), 1);
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn wrap_around_window() {
        let fs = Rc::new(MemFilesystem::new());
        {
            let cfg = ConfigService::new(fs.clone());
            cfg.declare_state_int("opBegin", 0).set_int(9998);
            cfg.declare_state_int("opEnd", 0).set_int(9998);
            cfg.save_now(CLIENT_STATE_FN).unwrap();
        }
        let mut store = store_with_fs(fs.clone());
        assert_eq!(store.op_begin(), 9998);

        let nrs: Vec<u32> = (0..3).map(|_| {
            let nr = store.reserve_opnr().unwrap();
            store.commit(&record(nr)).unwrap();
            nr
        }).collect();
        assert_eq!(nrs, vec![9998, 9999, 0]);
        assert!(fs.contains("op-9998.jsn"));
        assert!(fs.contains("op-9999.jsn"));
        assert!(fs.contains("op-0.jsn"));

        for nr in nrs {
            store.advance(nr);
        }
        assert_eq!(store.op_begin(), 1);
        assert_eq!(store.op_end(), 1);
    }

    #[test]
    fn orphan_op_end_repaired() {
        let fs = Rc::new(MemFilesystem::new());
        {
            let mut store = store_with_fs(fs.clone());
            let nr = store.reserve_opnr().unwrap();
            store.commit(&record(nr)).unwrap();
            // Crash after the next reserve, before its commit.
            let _orphan = store.reserve_opnr().unwrap();
        }
        let store = store_with_fs(fs);
        assert_eq!(store.op_begin(), 0);
        assert_eq!(store.op_end(), 1);
        assert!(store.fetch(0).is_some());
    }

    #[test]
    fn gap_skipped_on_advance() {
        let fs = Rc::new(MemFilesystem::new());
        let mut store = store_with_fs(fs);
        for _ in 0..3 {
            let nr = store.reserve_opnr().unwrap();
            store.commit(&record(nr)).unwrap();
        }
        // Middle record completes out of order.
        store.advance(1);
        assert_eq!(store.op_begin(), 0);
        // Head completes; begin must hop over the gap at 1.
        store.advance(0);
        assert_eq!(store.op_begin(), 2);
    }

    #[test]
    fn window_exhaustion_refused() {
        let fs = Rc::new(MemFilesystem::new());
        let mut store = store_with_fs(fs);
        for _ in 0..(MAX_OPNR - 1) {
            store.reserve_opnr().unwrap();
        }
        assert!(matches!(
            store.reserve_opnr(),
            Err(PersistError::OpNrWindowFull)
        ));
    }

    #[test]
    fn precedes_is_wrap_aware() {
        // Window near the wrap point: 9998 was assigned before 0.
        assert!(precedes(9998, 0, 1));
        assert!(precedes(9999, 0, 1));
        assert!(!precedes(0, 9998, 1));
        // Plain window.
        assert!(precedes(4, 7, 10));
    }

    #[test]
    fn clear_removes_all_records() {
        let fs = Rc::new(MemFilesystem::new());
        let mut store = store_with_fs(fs.clone());
        for _ in 0..3 {
            let nr = store.reserve_opnr().unwrap();
            store.commit(&record(nr)).unwrap();
        }
        store.clear();
        assert_eq!(store.pending_count(), 0);
        assert!(!fs.entries().unwrap().iter().any(|n| n.starts_with("op-")));
    }
}
