//! UnlockConnector (inbound).

use serde_json::{json, Value};

use crate::model::Model;
use crate::rpc::request::Operation;
use crate::support::errors::HandlerError;
use crate::support::poll::PollResult;

pub struct UnlockConnector {
    status: &'static str,
}

impl UnlockConnector {
    pub fn new() -> Self {
        Self {
            status: "NotSupported",
        }
    }
}

impl Operation for UnlockConnector {
    fn operation_type(&self) -> &'static str {
        "UnlockConnector"
    }

    fn process_req(&mut self, model: &mut Model, payload: &Value) -> Result<(), HandlerError> {
        let connector_id = payload
            .get("connectorId")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| HandlerError::formation_violation("connectorId is required"))?
            as u32;
        self.status = model.unlock_connector(connector_id).as_str();
        Ok(())
    }

    fn create_conf(&mut self, _model: &mut Model) -> PollResult<Result<Value, HandlerError>> {
        PollResult::Ready(Ok(json!({ "status": self.status })))
    }
}
