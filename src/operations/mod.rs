//! OCPP message classes.
//!
//! Each operation implements the five-function shape of
//! [`crate::rpc::Operation`]; the runtime below stays version-agnostic and
//! the 2.0.1 differences are payload dialects inside the same operations
//! plus a separate inbound registration set.

pub mod v16;
pub mod v201;

use crate::model::ProtocolVersion;
use crate::rpc::registry::OperationRegistry;
use crate::rpc::request::Operation;
use crate::rpc::store::StoredRequestRecord;

/// Register the inbound handlers for the negotiated version.
pub fn register_all(version: ProtocolVersion, registry: &mut OperationRegistry) {
    match version {
        ProtocolVersion::V16 => v16::register(registry),
        ProtocolVersion::V201 => v201::register(registry),
    }
}

/// Rebuild a persistent operation from its stored record after a reboot.
/// Only transaction-related operations are restorable; anything else in the
/// store is skipped by the queue.
pub fn restore_operation(
    version: ProtocolVersion,
    record: &StoredRequestRecord,
) -> Option<Box<dyn Operation>> {
    let (connector_id, tx_nr) = (record.connector_id, record.tx_nr);
    let mut op: Box<dyn Operation> = match record.action.as_str() {
        "StartTransaction" => Box::new(v16::start_transaction::StartTransaction::new(
            version,
            connector_id?,
            tx_nr?,
        )),
        "StopTransaction" => Box::new(v16::stop_transaction::StopTransaction::new(
            version,
            connector_id?,
            tx_nr?,
        )),
        "MeterValues" => Box::new(v16::meter_values::MeterValues::new(
            version,
            connector_id?,
            tx_nr,
            Vec::new(),
        )),
        "TransactionEvent" => {
            // 2.0.1 folds start/stop into one action; the stored payload
            // tells them apart.
            match record.payload.get("eventType").and_then(|v| v.as_str()) {
                Some("Started") => Box::new(v16::start_transaction::StartTransaction::new(
                    version,
                    connector_id?,
                    tx_nr?,
                )),
                Some("Ended") => Box::new(v16::stop_transaction::StopTransaction::new(
                    version,
                    connector_id?,
                    tx_nr?,
                )),
                _ => return None,
            }
        }
        _ => return None,
    };
    op.restore(record).ok()?;
    Some(op)
}
