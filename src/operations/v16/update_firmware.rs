//! UpdateFirmware (inbound).

use serde_json::{json, Value};
use tracing::warn;

use crate::model::{FirmwareUpdateRequest, Model};
use crate::rpc::request::Operation;
use crate::support::errors::HandlerError;
use crate::support::poll::PollResult;
use crate::support::time::parse_iso;

pub struct UpdateFirmware;

impl UpdateFirmware {
    pub fn new() -> Self {
        Self
    }
}

impl Operation for UpdateFirmware {
    fn operation_type(&self) -> &'static str {
        "UpdateFirmware"
    }

    fn process_req(&mut self, model: &mut Model, payload: &Value) -> Result<(), HandlerError> {
        let location = payload
            .get("location")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerError::formation_violation("location is required"))?;
        let retrieve_date = payload
            .get("retrieveDate")
            .and_then(|v| v.as_str())
            .and_then(parse_iso);

        let request = FirmwareUpdateRequest {
            location: location.to_string(),
            retrieve_date,
            retries: payload.get("retries").and_then(|v| v.as_i64()).map(|v| v as i32),
            retry_interval: payload
                .get("retryInterval")
                .and_then(|v| v.as_i64())
                .map(|v| v as i32),
        };
        if !model.firmware.request_update(request) {
            warn!("UpdateFirmware received but no download handler installed");
        }
        Ok(())
    }

    fn create_conf(&mut self, _model: &mut Model) -> PollResult<Result<Value, HandlerError>> {
        PollResult::Ready(Ok(json!({})))
    }
}
