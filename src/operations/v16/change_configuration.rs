//! ChangeConfiguration (inbound).

use serde_json::{json, Value};
use tracing::info;

use crate::model::Model;
use crate::rpc::request::Operation;
use crate::support::errors::HandlerError;
use crate::support::poll::PollResult;

pub struct ChangeConfiguration {
    status: &'static str,
}

impl ChangeConfiguration {
    pub fn new() -> Self {
        Self { status: "Rejected" }
    }
}

impl Operation for ChangeConfiguration {
    fn operation_type(&self) -> &'static str {
        "ChangeConfiguration"
    }

    fn process_req(&mut self, model: &mut Model, payload: &Value) -> Result<(), HandlerError> {
        let key = payload
            .get("key")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerError::formation_violation("key is required"))?;
        let value = payload
            .get("value")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerError::formation_violation("value is required"))?;

        let Some(entry) = model.cfg.get(key) else {
            self.status = "NotSupported";
            return Ok(());
        };
        if !entry.writable_by_peer() || !entry.readable_by_peer() {
            self.status = "Rejected";
            return Ok(());
        }
        if !entry.set_from_wire(value) {
            self.status = "Rejected";
            return Ok(());
        }

        info!(key, value, "configuration changed by server");
        self.status = if entry.requires_reboot() {
            "RebootRequired"
        } else {
            "Accepted"
        };
        Ok(())
    }

    fn create_conf(&mut self, _model: &mut Model) -> PollResult<Result<Value, HandlerError>> {
        PollResult::Ready(Ok(json!({ "status": self.status })))
    }
}
