//! RemoteStartTransaction (inbound).

use serde_json::{json, Value};
use tracing::info;

use crate::model::Model;
use crate::rpc::request::Operation;
use crate::support::errors::HandlerError;
use crate::support::poll::PollResult;

pub struct RemoteStartTransaction {
    accepted: bool,
}

impl RemoteStartTransaction {
    pub fn new() -> Self {
        Self { accepted: false }
    }
}

impl Operation for RemoteStartTransaction {
    fn operation_type(&self) -> &'static str {
        "RemoteStartTransaction"
    }

    fn process_req(&mut self, model: &mut Model, payload: &Value) -> Result<(), HandlerError> {
        let id_tag = payload
            .get("idTag")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerError::formation_violation("idTag is required"))?;
        if id_tag.is_empty() || id_tag.len() > 20 {
            return Err(HandlerError::property_constraint("idTag out of range"));
        }
        let connector_id = payload
            .get("connectorId")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32);

        // chargingProfile is accepted but left to the schedule evaluator.
        self.accepted = model.remote_start(id_tag, connector_id);
        info!(id_tag, ?connector_id, accepted = self.accepted, "remote start");
        Ok(())
    }

    fn create_conf(&mut self, _model: &mut Model) -> PollResult<Result<Value, HandlerError>> {
        let status = if self.accepted { "Accepted" } else { "Rejected" };
        PollResult::Ready(Ok(json!({ "status": status })))
    }
}
