//! StopTransaction (outbound, persistent).
//!
//! Never sent before its StartTransaction is confirmed; the server-assigned
//! transactionId is back-filled into the payload at send time, which also
//! covers requests restored after a reboot.

use serde_json::{json, Value};
use tracing::warn;

use crate::model::metering::MeterValue;
use crate::model::meter_store::remove_tx_meter_data;
use crate::model::{Model, ProtocolVersion, StopReason, Transaction};
use crate::rpc::request::{ErrorDisposition, Operation};
use crate::rpc::store::StoredRequestRecord;
use crate::support::errors::{PersistError, RpcError, RpcErrorCode};
use crate::support::poll::PollResult;
use crate::support::time::Clock;

pub struct StopTransaction {
    version: ProtocolVersion,
    connector_id: u32,
    tx_nr: u32,
    stored_payload: Option<Value>,
}

impl StopTransaction {
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
            ProtocolVersion::V16 => "StopTransaction",
            ProtocolVersion::V201 => "TransactionEvent",
        }
    }

    pub fn build_payload(&self, clock: &Clock, tx: &Transaction, tx_data: &[MeterValue]) -> Value {
        let timestamp = tx
            .stop_timestamp
            .map(|ts| clock.render(&ts))
            .unwrap_or_else(|| clock.render(&clock.timestamp()));
        let reason = tx.stop_reason.unwrap_or(StopReason::Other);
        match self.version {
            ProtocolVersion::V16 => {
                let mut payload = json!({
                    "meterStop": tx.meter_stop.unwrap_or(0),
                    "timestamp": timestamp,
                    "reason": reason.as_str(),
                });
                let map = payload.as_object_mut().unwrap();
                if let Some(id) = tx.transaction_id {
                    map.insert("transactionId".to_string(), Value::from(id));
                }
                if let Some(id_tag) = &tx.stop_id_tag {
                    map.insert("idTag".to_string(), Value::String(id_tag.clone()));
                }
                if !tx_data.is_empty() {
                    let data: Vec<Value> = tx_data.iter().map(|mv| mv.render(clock)).collect();
                    map.insert("transactionData".to_string(), Value::Array(data));
                }
                payload
            }
            ProtocolVersion::V201 => {
                let meter_value: Vec<Value> = tx_data.iter().map(|mv| mv.render(clock)).collect();
                let mut payload = json!({
                    "eventType": "Ended",
                    "timestamp": timestamp,
                    "triggerReason": "StopAuthorized",
                    "seqNo": 1,
                    "transactionInfo": {
                        "transactionId": format!("{}-{}", self.connector_id, self.tx_nr),
                        "stoppedReason": reason.as_str(),
                    },
                    "evse": { "id": self.connector_id, "connectorId": self.connector_id },
                });
                if !meter_value.is_empty() {
                    payload
                        .as_object_mut()
                        .unwrap()
                        .insert("meterValue".to_string(), Value::Array(meter_value));
                }
                payload
            }
        }
    }

    fn finalize(&self, model: &mut Model) {
        remove_tx_meter_data(&model.fs, self.connector_id, self.tx_nr);
        model.tx_store.remove(self.connector_id, self.tx_nr);
    }
}

impl Operation for StopTransaction {
    fn operation_type(&self) -> &'static str {
        self.action_name()
    }

    fn create_req(&mut self, model: &mut Model) -> PollResult<Value> {
        let tx = model.tx_store.get(self.connector_id, self.tx_nr);

        if let Some(tx) = &tx {
            // Hold until the matching StartTransaction is confirmed, so the
            // server-assigned id can be carried.
            if !tx.borrow().start_confirmed && !tx.borrow().silent {
                return PollResult::Pending;
            }
        }

        let mut payload = match &self.stored_payload {
            Some(stored) => stored.clone(),
            None => match &tx {
                Some(tx) => self.build_payload(&model.clock, &tx.borrow(), &[]),
                None => return PollResult::Pending,
            },
        };

        if self.version == ProtocolVersion::V16 && payload.get("transactionId").is_none() {
            if let Some(id) = tx.as_ref().and_then(|t| t.borrow().transaction_id) {
                if let Some(map) = payload.as_object_mut() {
                    map.insert("transactionId".to_string(), Value::from(id));
                }
            }
        }
        PollResult::Ready(payload)
    }

    fn on_sent(&mut self, model: &mut Model) {
        if let Some(tx) = model.tx_store.get(self.connector_id, self.tx_nr) {
            tx.borrow_mut().stop_sent = true;
            if let Err(e) = model.tx_store.commit(&tx.borrow()) {
                warn!("transaction commit failed: {e}");
            }
        }
    }

    fn process_conf(&mut self, model: &mut Model, _payload: &Value) {
        if let Some(tx) = model.tx_store.get(self.connector_id, self.tx_nr) {
            tx.borrow_mut().stop_confirmed = true;
            if let Err(e) = model.tx_store.commit(&tx.borrow()) {
                warn!("transaction commit failed: {e}");
            }
        }
        self.finalize(model);
    }

    fn process_err(&mut self, model: &mut Model, error: &RpcError) -> ErrorDisposition {
        match error.code {
            // Server hiccups are worth another round; the record is
            // persistent either way.
            RpcErrorCode::InternalError | RpcErrorCode::GenericError => ErrorDisposition::Retry,
            _ => {
                warn!(
                    connector_id = self.connector_id,
                    tx_nr = self.tx_nr,
                    %error,
                    "StopTransaction rejected, dropping record"
                );
                if let Some(tx) = model.tx_store.get(self.connector_id, self.tx_nr) {
                    tx.borrow_mut().silent = true;
                    let _ = model.tx_store.commit(&tx.borrow());
                }
                self.finalize(model);
                ErrorDisposition::Abort
            }
        }
    }

    fn should_abandon(&self, model: &Model) -> bool {
        match model.tx_store.peek(self.connector_id, self.tx_nr) {
            Some(tx) => tx.silent && !tx.stop_sent,
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
    fn v16_payload_carries_reason_and_data() {
        let mut clock = Clock::with_source(Box::new(|| 0));
        clock.set_time(parse_iso("2024-06-01T12:30:00.000Z").unwrap());

        let mut tx = Transaction::new(1, 0, false);
        tx.transaction_id = Some(42);
        tx.meter_stop = Some(5000);
        tx.stop_reason = Some(StopReason::Local);
        tx.stop_timestamp = Some(clock.timestamp());

        let op = StopTransaction::new(ProtocolVersion::V16, 1, 0);
        let payload = op.build_payload(&clock, &tx, &[]);
        assert_eq!(payload["transactionId"], 42);
        assert_eq!(payload["meterStop"], 5000);
        assert_eq!(payload["reason"], "Local");
        assert!(payload.get("transactionData").is_none());
    }

    #[test]
    fn v16_payload_omits_unknown_transaction_id() {
        let clock = Clock::with_source(Box::new(|| 0));
        let mut tx = Transaction::new(1, 0, false);
        tx.stop_reason = Some(StopReason::PowerLoss);

        let op = StopTransaction::new(ProtocolVersion::V16, 1, 0);
        let payload = op.build_payload(&clock, &tx, &[]);
        assert!(payload.get("transactionId").is_none());
    }
}
