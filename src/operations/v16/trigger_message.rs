//! TriggerMessage (inbound).
//!
//! Triggered messages are pre-boot eligible, so a CSMS can pull a
//! BootNotification or StatusNotification out of a gated charge point.

use serde_json::{json, Value};

use crate::model::Model;
use crate::rpc::request::Operation;
use crate::support::errors::HandlerError;
use crate::support::poll::PollResult;

pub struct TriggerMessage {
    status: &'static str,
}

impl TriggerMessage {
    pub fn new() -> Self {
        Self {
            status: "NotImplemented",
        }
    }
}

impl Operation for TriggerMessage {
    fn operation_type(&self) -> &'static str {
        "TriggerMessage"
    }

    fn process_req(&mut self, model: &mut Model, payload: &Value) -> Result<(), HandlerError> {
        let requested = payload
            .get("requestedMessage")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerError::formation_violation("requestedMessage is required"))?;
        let connector_id = payload
            .get("connectorId")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32);

        self.status = model.trigger_message(requested, connector_id).as_str();
        Ok(())
    }

    fn create_conf(&mut self, _model: &mut Model) -> PollResult<Result<Value, HandlerError>> {
        PollResult::Ready(Ok(json!({ "status": self.status })))
    }
}
