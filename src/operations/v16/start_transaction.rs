//! StartTransaction (outbound, persistent).
//!
//! Holds the transaction by `(connectorId, txNr)` and resolves it through
//! the store on every step, so the same code path serves freshly created
//! and reboot-restored requests.

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::model::{Model, ProtocolVersion, Transaction};
use crate::rpc::request::{ErrorDisposition, Operation};
use crate::rpc::store::StoredRequestRecord;
use crate::support::errors::{PersistError, RpcError};
use crate::support::poll::PollResult;
use crate::support::time::Clock;

pub struct StartTransaction {
    version: ProtocolVersion,
    connector_id: u32,
    tx_nr: u32,
    stored_payload: Option<Value>,
}

impl StartTransaction {
    pub fn new(version: ProtocolVersion, connector_id: u32, tx_nr: u32) -> Self {
        Self {
            version,
            connector_id,
            tx_nr,
            stored_payload: None,
        }
    }

    pub fn action_name(&self) -> &'static str {
        match self.version {
            ProtocolVersion::V16 => "StartTransaction",
            ProtocolVersion::V201 => "TransactionEvent",
        }
    }

    pub fn build_payload(&self, clock: &Clock, tx: &Transaction) -> Value {
        let timestamp = tx
            .begin_timestamp
            .map(|ts| clock.render(&ts))
            .unwrap_or_else(|| clock.render(&clock.timestamp()));
        match self.version {
            ProtocolVersion::V16 => {
                let mut payload = json!({
                    "connectorId": self.connector_id,
                    "idTag": tx.id_tag,
                    "meterStart": tx.meter_start.unwrap_or(0),
                    "timestamp": timestamp,
                });
                if let Some(reservation_id) = tx.reservation_id {
                    payload
                        .as_object_mut()
                        .unwrap()
                        .insert("reservationId".to_string(), Value::from(reservation_id));
                }
                payload
            }
            ProtocolVersion::V201 => json!({
                "eventType": "Started",
                "timestamp": timestamp,
                "triggerReason": "Authorized",
                "seqNo": 0,
                "transactionInfo": {
                    "transactionId": format!("{}-{}", self.connector_id, self.tx_nr),
                },
                "evse": { "id": self.connector_id, "connectorId": self.connector_id },
                "idToken": { "idToken": tx.id_tag, "type": "ISO14443" },
            }),
        }
    }
}

impl Operation for StartTransaction {
    fn operation_type(&self) -> &'static str {
        self.action_name()
    }

    fn create_req(&mut self, model: &mut Model) -> PollResult<Value> {
        if let Some(tx) = model.tx_store.get(self.connector_id, self.tx_nr) {
            let payload = self.build_payload(&model.clock, &tx.borrow());
            return PollResult::Ready(payload);
        }
        match &self.stored_payload {
            // The live record is gone; replay the persisted payload.
            Some(payload) => PollResult::Ready(payload.clone()),
            None => PollResult::Pending,
        }
    }

    fn on_sent(&mut self, model: &mut Model) {
        if let Some(tx) = model.tx_store.get(self.connector_id, self.tx_nr) {
            {
                let mut t = tx.borrow_mut();
                t.start_sent = true;
                if t.start_timestamp.is_none() {
                    t.start_timestamp = Some(model.clock.timestamp());
                }
            }
            if let Err(e) = model.tx_store.commit(&tx.borrow()) {
                warn!("transaction commit failed: {e}");
            }
        }
    }

    fn process_conf(&mut self, model: &mut Model, payload: &Value) {
        let Some(tx) = model.tx_store.get(self.connector_id, self.tx_nr) else {
            warn!(
                connector_id = self.connector_id,
                tx_nr = self.tx_nr,
                "StartTransaction.conf for unknown transaction"
            );
            return;
        };

        let accepted = match self.version {
            ProtocolVersion::V16 => {
                payload
                    .get("idTagInfo")
                    .and_then(|i| i.get("status"))
                    .and_then(|s| s.as_str())
                    == Some("Accepted")
            }
            ProtocolVersion::V201 => {
                // Absent idTokenInfo means accepted.
                payload
                    .get("idTokenInfo")
                    .and_then(|i| i.get("status"))
                    .and_then(|s| s.as_str())
                    .map_or(true, |s| s == "Accepted")
            }
        };

        {
            let mut t = tx.borrow_mut();
            t.start_confirmed = true;
            if self.version == ProtocolVersion::V16 {
                if let Some(id) = payload.get("transactionId").and_then(|v| v.as_i64()) {
                    t.assign_transaction_id(id as i32);
                }
            }
            if !accepted {
                info!(
                    connector_id = self.connector_id,
                    tx_nr = self.tx_nr,
                    "transaction deauthorized by server"
                );
                t.deauthorized = true;
            }
        }
        let tx_ref = tx.borrow();
        if let Err(e) = model.tx_store.commit(&tx_ref) {
            warn!("transaction commit failed: {e}");
        }
    }

    /// A CallError on StartTransaction silences the whole transaction: the
    /// server never learned about it, so nothing else of it may be sent.
    fn process_err(&mut self, model: &mut Model, error: &RpcError) -> ErrorDisposition {
        warn!(
            connector_id = self.connector_id,
            tx_nr = self.tx_nr,
            %error,
            "StartTransaction rejected, silencing transaction"
        );
        if let Some(tx) = model.tx_store.get(self.connector_id, self.tx_nr) {
            {
                let mut t = tx.borrow_mut();
                t.silent = true;
                t.deauthorized = true;
            }
            let _ = model.tx_store.commit(&tx.borrow());
        }
        ErrorDisposition::Abort
    }

    fn should_abandon(&self, model: &Model) -> bool {
        match model.tx_store.peek(self.connector_id, self.tx_nr) {
            Some(tx) => tx.silent,
            None => self.stored_payload.is_none(),
        }
    }

    fn restore(&mut self, record: &StoredRequestRecord) -> Result<(), PersistError> {
        self.stored_payload = Some(record.payload.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::time::parse_iso;

    #[test]
    fn v16_payload_shape() {
        let mut clock = Clock::with_source(Box::new(|| 0));
        clock.set_time(parse_iso("2024-06-01T12:00:00.000Z").unwrap());

        let mut tx = Transaction::new(1, 0, false);
        tx.id_tag = "TAG01".into();
        tx.meter_start = Some(0);
        tx.begin_timestamp = Some(clock.timestamp());

        let op = StartTransaction::new(ProtocolVersion::V16, 1, 0);
        let payload = op.build_payload(&clock, &tx);
        assert_eq!(payload["connectorId"], 1);
        assert_eq!(payload["idTag"], "TAG01");
        assert_eq!(payload["meterStart"], 0);
        assert_eq!(payload["timestamp"], "2024-06-01T12:00:00.000Z");
        assert!(payload.get("reservationId").is_none());
    }

    #[test]
    fn v201_payload_is_transaction_event() {
        let clock = Clock::with_source(Box::new(|| 0));
        let mut tx = Transaction::new(2, 5, false);
        tx.id_tag = "TAG01".into();

        let op = StartTransaction::new(ProtocolVersion::V201, 2, 5);
        assert_eq!(op.action_name(), "TransactionEvent");
        let payload = op.build_payload(&clock, &tx);
        assert_eq!(payload["eventType"], "Started");
        assert_eq!(payload["transactionInfo"]["transactionId"], "2-5");
        assert_eq!(payload["evse"]["id"], 2);
    }
}
