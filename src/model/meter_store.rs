//! Persistence of meter values captured during a transaction.
//!
//! Each captured value is written as its own `sd-<connectorId>-<txNr>-<seq>`
//! file and survives reboots until the StopTransaction that carries the data
//! has been committed to the request store.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::metering::MeterValue;
use crate::storage::adapter::SharedFilesystem;
use crate::storage::files::sd_file;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredMeterValue {
    seq: u32,
    value: MeterValue,
}

/// Ordered meter values of one transaction.
pub struct TransactionMeterData {
    connector_id: u32,
    tx_nr: u32,
    next_seq: u32,
    values: Vec<MeterValue>,
    finalized: bool,
}

impl TransactionMeterData {
    pub fn new(connector_id: u32, tx_nr: u32) -> Self {
        Self {
            connector_id,
            tx_nr,
            next_seq: 0,
            values: Vec::new(),
            finalized: false,
        }
    }

    /// Load the record back from disk; used when resuming a transaction
    /// after a reboot.
    pub fn restore(fs: &SharedFilesystem, connector_id: u32, tx_nr: u32) -> Self {
        let prefix = format!("sd-{connector_id}-{tx_nr}-");
        let mut found: Vec<(u32, MeterValue)> = Vec::new();
        for name in fs.entries().unwrap_or_default() {
            if !name.starts_with(&prefix) {
                continue;
            }
            let Ok(Some(text)) = fs.read(&name) else {
                continue;
            };
            match serde_json::from_str::<StoredMeterValue>(&text) {
                Ok(stored) => found.push((stored.seq, stored.value)),
                Err(e) => warn!(file = %name, "stored meter value malformed: {e}"),
            }
        }
        found.sort_by_key(|(seq, _)| *seq);
        let next_seq = found.last().map_or(0, |(seq, _)| seq + 1);
        let values = found.into_iter().map(|(_, v)| v).collect::<Vec<_>>();
        if !values.is_empty() {
            debug!(connector_id, tx_nr, count = values.len(), "restored tx meter data");
        }
        Self {
            connector_id,
            tx_nr,
            next_seq,
            values,
            finalized: false,
        }
    }

    pub fn tx_nr(&self) -> u32 {
        self.tx_nr
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Append one value; persisted before it becomes part of the record.
    /// A failed write keeps the value in memory (delivery degrades to
    /// best-effort for that sample).
    pub fn add(&mut self, fs: &SharedFilesystem, value: MeterValue) {
        if self.finalized {
            warn!(
                connector_id = self.connector_id,
                tx_nr = self.tx_nr,
                "meter data after finalize dropped"
            );
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let stored = StoredMeterValue {
            seq,
            value: value.clone(),
        };
        match serde_json::to_string(&stored) {
            Ok(text) => {
                if let Err(e) = fs.write(&sd_file(self.connector_id, self.tx_nr, seq), &text) {
                    warn!(
                        connector_id = self.connector_id,
                        tx_nr = self.tx_nr,
                        "meter data not persisted: {e}"
                    );
                }
            }
            Err(e) => warn!("meter data serialization failed: {e}"),
        }
        self.values.push(value);
    }

    /// Close the record and hand the values to StopTransaction.
    pub fn finalize(&mut self) -> Vec<MeterValue> {
        self.finalized = true;
        std::mem::take(&mut self.values)
    }
}

/// Delete every stored batch of one transaction.
pub fn remove_tx_meter_data(fs: &SharedFilesystem, connector_id: u32, tx_nr: u32) {
    let prefix = format!("sd-{connector_id}-{tx_nr}-");
    for name in fs.entries().unwrap_or_default() {
        if name.starts_with(&prefix) {
            let _ = fs.remove(&name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::metering::{MeterValue, SampledValue};
    use crate::support::time::Timestamp;
    use std::rc::Rc;

    fn sample(value: &str) -> MeterValue {
        MeterValue {
            timestamp: Timestamp::Relative { tick_ms: 0 },
            sampled_value: vec![SampledValue {
                value: value.into(),
                context: Some("Sample.Periodic".into()),
                format: None,
                measurand: Some("Energy.Active.Import.Register".into()),
                phase: None,
                location: None,
                unit: Some("Wh".into()),
            }],
        }
    }

    #[test]
    fn add_persists_and_restore_orders() {
        let fs: SharedFilesystem = Rc::new(crate::storage::MemFilesystem::new());
        let mut data = TransactionMeterData::new(1, 7);
        data.add(&fs, sample("10"));
        data.add(&fs, sample("20"));

        let restored = TransactionMeterData::restore(&fs, 1, 7);
        assert_eq!(restored.values.len(), 2);
        assert_eq!(restored.values[0].sampled_value[0].value, "10");
        assert_eq!(restored.values[1].sampled_value[0].value, "20");
        assert_eq!(restored.next_seq, 2);
    }

    #[test]
    fn finalize_blocks_further_samples() {
        let fs: SharedFilesystem = Rc::new(crate::storage::MemFilesystem::new());
        let mut data = TransactionMeterData::new(1, 0);
        data.add(&fs, sample("10"));
        let values = data.finalize();
        assert_eq!(values.len(), 1);
        data.add(&fs, sample("20"));
        assert!(data.values.is_empty());
    }

    #[test]
    fn remove_deletes_only_matching_files() {
        let fs: SharedFilesystem = Rc::new(crate::storage::MemFilesystem::new());
        let mut a = TransactionMeterData::new(1, 0);
        a.add(&fs, sample("10"));
        let mut b = TransactionMeterData::new(1, 1);
        b.add(&fs, sample("30"));

        remove_tx_meter_data(&fs, 1, 0);
        let restored_a = TransactionMeterData::restore(&fs, 1, 0);
        let restored_b = TransactionMeterData::restore(&fs, 1, 1);
        assert!(restored_a.values.is_empty());
        assert_eq!(restored_b.values.len(), 1);
    }
}
