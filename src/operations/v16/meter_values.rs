//! MeterValues (outbound).
//!
//! Transaction-bound samples are persistent and ordered behind their
//! StartTransaction by operation number; idle samples are volatile.

use serde_json::{json, Value};

use crate::model::metering::MeterValue;
use crate::model::{Model, ProtocolVersion};
use crate::rpc::request::Operation;
use crate::rpc::store::StoredRequestRecord;
use crate::support::errors::PersistError;
use crate::support::poll::PollResult;
use crate::support::time::Clock;

pub struct MeterValues {
    version: ProtocolVersion,
    connector_id: u32,
    tx_nr: Option<u32>,
    values: Vec<MeterValue>,
    stored_payload: Option<Value>,
}

impl MeterValues {
    pub fn new(
        version: ProtocolVersion,
        connector_id: u32,
        tx_nr: Option<u32>,
        values: Vec<MeterValue>,
    ) -> Self {
        Self {
            version,
            connector_id,
            tx_nr,
            values,
            stored_payload: None,
        }
    }

    pub fn render_payload(
        version: ProtocolVersion,
        clock: &Clock,
        connector_id: u32,
        transaction_id: Option<i32>,
        values: &[MeterValue],
    ) -> Value {
        let rendered: Vec<Value> = values.iter().map(|mv| mv.render(clock)).collect();
        match version {
            ProtocolVersion::V16 => {
                let mut payload = json!({
                    "connectorId": connector_id,
                    "meterValue": rendered,
                });
                if let Some(id) = transaction_id {
                    payload
                        .as_object_mut()
                        .unwrap()
                        .insert("transactionId".to_string(), Value::from(id));
                }
                payload
            }
            ProtocolVersion::V201 => json!({
                "evseId": connector_id,
                "meterValue": rendered,
            }),
        }
    }
}

impl Operation for MeterValues {
    fn operation_type(&self) -> &'static str {
        "MeterValues"
    }

    fn create_req(&mut self, model: &mut Model) -> PollResult<Value> {
        let transaction_id = self
            .tx_nr
            .and_then(|tx_nr| model.tx_store.get(self.connector_id, tx_nr))
            .and_then(|tx| tx.borrow().transaction_id);

        if let Some(stored) = &self.stored_payload {
            let mut payload = stored.clone();
            if self.version == ProtocolVersion::V16 && payload.get("transactionId").is_none() {
                if let Some(id) = transaction_id {
                    if let Some(map) = payload.as_object_mut() {
                        map.insert("transactionId".to_string(), Value::from(id));
                    }
                }
            }
            return PollResult::Ready(payload);
        }

        PollResult::Ready(Self::render_payload(
            self.version,
            &model.clock,
            self.connector_id,
            transaction_id,
            &self.values,
        ))
    }

    fn should_abandon(&self, model: &Model) -> bool {
        let Some(tx_nr) = self.tx_nr else {
            return false;
        };
        match model.tx_store.peek(self.connector_id, tx_nr) {
            Some(tx) => tx.silent,
            None => false,
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
    use crate::model::metering::SampledValue;
    use crate::support::time::{parse_iso, Timestamp};

    fn meter_value(clock_time: &str) -> MeterValue {
        MeterValue {
            timestamp: Timestamp::Absolute(parse_iso(clock_time).unwrap()),
            sampled_value: vec![SampledValue {
                value: "1500".into(),
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
    fn v16_payload_shape() {
        let clock = Clock::with_source(Box::new(|| 0));
        let payload = MeterValues::render_payload(
            ProtocolVersion::V16,
            &clock,
            1,
            Some(42),
            &[meter_value("2024-06-01T12:01:00.000Z")],
        );
        assert_eq!(payload["connectorId"], 1);
        assert_eq!(payload["transactionId"], 42);
        assert_eq!(payload["meterValue"][0]["timestamp"], "2024-06-01T12:01:00.000Z");
        assert_eq!(
            payload["meterValue"][0]["sampledValue"][0]["measurand"],
            "Energy.Active.Import.Register"
        );
    }

    #[test]
    fn v201_payload_uses_evse_id() {
        let clock = Clock::with_source(Box::new(|| 0));
        let payload = MeterValues::render_payload(
            ProtocolVersion::V201,
            &clock,
            2,
            None,
            &[meter_value("2024-06-01T12:01:00.000Z")],
        );
        assert_eq!(payload["evseId"], 2);
        assert!(payload.get("connectorId").is_none());
    }
}
