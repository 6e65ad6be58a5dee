//! StatusNotification (outbound).
//!
//! The timestamp is captured when the status changes and rendered at send
//! time, so a pre-sync stamp gets adjusted once the boot exchange sets the
//! clock.

use serde_json::{json, Value};

use crate::model::{ChargePointStatus, ErrorData, Model, ProtocolVersion};
use crate::rpc::request::Operation;
use crate::support::poll::PollResult;
use crate::support::time::Timestamp;

pub struct StatusNotification {
    version: ProtocolVersion,
    connector_id: u32,
    status: ChargePointStatus,
    error: Option<ErrorData>,
    timestamp: Timestamp,
}

impl StatusNotification {
    pub fn new(
        version: ProtocolVersion,
        connector_id: u32,
        status: ChargePointStatus,
        error: Option<ErrorData>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            version,
            connector_id,
            status,
            error,
            timestamp,
        }
    }
}

impl Operation for StatusNotification {
    fn operation_type(&self) -> &'static str {
        "StatusNotification"
    }

    fn create_req(&mut self, model: &mut Model) -> PollResult<Value> {
        let timestamp = model.clock.render(&self.timestamp);
        let payload = match self.version {
            ProtocolVersion::V16 => {
                let error_code = self
                    .error
                    .as_ref()
                    .map(|e| e.error_code.as_str())
                    .unwrap_or("NoError");
                let mut payload = json!({
                    "connectorId": self.connector_id,
                    "errorCode": error_code,
                    "status": self.status.as_str(),
                    "timestamp": timestamp,
                });
                if let Some(error) = &self.error {
                    let map = payload.as_object_mut().unwrap();
                    if let Some(info) = &error.info {
                        map.insert("info".to_string(), Value::String(info.clone()));
                    }
                    if let Some(vendor_id) = &error.vendor_id {
                        map.insert("vendorId".to_string(), Value::String(vendor_id.clone()));
                    }
                    if let Some(code) = &error.vendor_error_code {
                        map.insert("vendorErrorCode".to_string(), Value::String(code.clone()));
                    }
                }
                payload
            }
            ProtocolVersion::V201 => json!({
                "timestamp": timestamp,
                "connectorStatus": self.status.as_v201_str(),
                "evseId": self.connector_id,
                "connectorId": self.connector_id,
            }),
        };
        PollResult::Ready(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BootData, ModelSetup, ProtocolVersion};
    use crate::storage::ConfigService;
    use crate::support::poll::PollResult;
    use crate::support::time::Clock;
    use std::rc::Rc;

    fn model() -> Model {
        let fs: crate::storage::SharedFilesystem = Rc::new(crate::storage::MemFilesystem::new());
        let cfg = ConfigService::new(fs.clone());
        Model::new(
            fs,
            cfg,
            Clock::with_source(Box::new(|| 0)),
            ModelSetup {
                version: ProtocolVersion::V16,
                connector_count: 1,
                boot_data: BootData::new("V", "M"),
            },
        )
    }

    #[test]
    fn v16_payload_reports_no_error() {
        let mut model = model();
        let mut op = StatusNotification::new(
            ProtocolVersion::V16,
            1,
            ChargePointStatus::Available,
            None,
            Timestamp::Relative { tick_ms: 0 },
        );
        let PollResult::Ready(payload) = op.create_req(&mut model) else {
            panic!("expected payload");
        };
        assert_eq!(payload["errorCode"], "NoError");
        assert_eq!(payload["status"], "Available");
    }

    #[test]
    fn v201_payload_aggregates_occupied() {
        let mut model = model();
        let mut op = StatusNotification::new(
            ProtocolVersion::V201,
            1,
            ChargePointStatus::Charging,
            None,
            Timestamp::Relative { tick_ms: 0 },
        );
        let PollResult::Ready(payload) = op.create_req(&mut model) else {
            panic!("expected payload");
        };
        assert_eq!(payload["connectorStatus"], "Occupied");
    }
}
