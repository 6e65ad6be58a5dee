//! BootNotification (outbound).

use serde_json::{json, Value};
use tracing::warn;

use crate::model::{Model, ProtocolVersion, RegistrationStatus};
use crate::rpc::request::{ErrorDisposition, Operation};
use crate::support::errors::RpcError;
use crate::support::poll::PollResult;
use crate::support::time::parse_iso;

pub struct BootNotification {
    version: ProtocolVersion,
}

impl BootNotification {
    pub fn new(version: ProtocolVersion) -> Self {
        Self { version }
    }
}

impl Operation for BootNotification {
    fn operation_type(&self) -> &'static str {
        "BootNotification"
    }

    fn create_req(&mut self, model: &mut Model) -> PollResult<Value> {
        let data = model.boot.data();
        let payload = match self.version {
            ProtocolVersion::V16 => {
                let mut payload = json!({
                    "chargePointVendor": data.charge_point_vendor,
                    "chargePointModel": data.charge_point_model,
                });
                let map = payload.as_object_mut().unwrap();
                let optional = [
                    ("chargePointSerialNumber", &data.charge_point_serial_number),
                    ("chargeBoxSerialNumber", &data.charge_box_serial_number),
                    ("firmwareVersion", &data.firmware_version),
                    ("iccid", &data.iccid),
                    ("imsi", &data.imsi),
                    ("meterType", &data.meter_type),
                    ("meterSerialNumber", &data.meter_serial_number),
                ];
                for (key, value) in optional {
                    if let Some(value) = value {
                        map.insert(key.to_string(), Value::String(value.clone()));
                    }
                }
                payload
            }
            ProtocolVersion::V201 => {
                let mut station = json!({
                    "model": data.charge_point_model,
                    "vendorName": data.charge_point_vendor,
                });
                let map = station.as_object_mut().unwrap();
                if let Some(serial) = &data.charge_point_serial_number {
                    map.insert("serialNumber".to_string(), Value::String(serial.clone()));
                }
                if let Some(fw) = &data.firmware_version {
                    map.insert("firmwareVersion".to_string(), Value::String(fw.clone()));
                }
                json!({
                    "reason": "PowerUp",
                    "chargingStation": station,
                })
            }
        };
        PollResult::Ready(payload)
    }

    fn process_conf(&mut self, model: &mut Model, payload: &Value) {
        if let Some(time) = payload
            .get("currentTime")
            .and_then(|v| v.as_str())
            .and_then(parse_iso)
        {
            model.clock.set_time(time);
        }

        let interval = payload.get("interval").and_then(|v| v.as_i64()).unwrap_or(0) as i32;
        let status = payload
            .get("status")
            .and_then(|v| v.as_str())
            .and_then(RegistrationStatus::from_wire);
        match status {
            Some(status) => {
                if status == RegistrationStatus::Accepted {
                    model.heartbeat.set_interval(interval);
                }
                model.boot.handle_conf(status, interval);
            }
            None => {
                warn!("BootNotification.conf without valid status");
                model.boot.handle_failure();
            }
        }
    }

    fn process_err(&mut self, model: &mut Model, _error: &RpcError) -> ErrorDisposition {
        model.boot.handle_failure();
        ErrorDisposition::Abort
    }
}
