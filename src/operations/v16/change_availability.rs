//! ChangeAvailability (inbound).

use serde_json::{json, Value};

use crate::model::{AvailabilityChange, Model};
use crate::rpc::request::Operation;
use crate::support::errors::HandlerError;
use crate::support::poll::PollResult;

pub struct ChangeAvailability {
    status: &'static str,
}

impl ChangeAvailability {
    pub fn new() -> Self {
        Self { status: "Rejected" }
    }
}

impl Operation for ChangeAvailability {
    fn operation_type(&self) -> &'static str {
        "ChangeAvailability"
    }

    fn process_req(&mut self, model: &mut Model, payload: &Value) -> Result<(), HandlerError> {
        let connector_id = payload
            .get("connectorId")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| HandlerError::formation_violation("connectorId is required"))?
            as u32;
        let operative = match payload.get("type").and_then(|v| v.as_str()) {
            Some("Operative") => true,
            Some("Inoperative") => false,
            Some(_) => return Err(HandlerError::property_constraint("type out of range")),
            None => return Err(HandlerError::formation_violation("type is required")),
        };

        // connectorId 0 addresses the whole charge point.
        let targets: Vec<u32> = if connector_id == 0 {
            model.connectors.iter().map(|c| c.id()).collect()
        } else if model.connector(connector_id).is_some() {
            vec![connector_id]
        } else {
            self.status = "Rejected";
            return Ok(());
        };

        let mut scheduled = false;
        for id in targets {
            if let Some(connector) = model.connector_mut(id) {
                if connector.set_availability(operative) == AvailabilityChange::Scheduled {
                    scheduled = true;
                }
            }
        }
        self.status = if scheduled { "Scheduled" } else { "Accepted" };
        Ok(())
    }

    fn create_conf(&mut self, _model: &mut Model) -> PollResult<Result<Value, HandlerError>> {
        PollResult::Ready(Ok(json!({ "status": self.status })))
    }
}
