//! ReserveNow (inbound).

use serde_json::{json, Value};

use crate::model::{ChargePointStatus, Model, Reservation};
use crate::rpc::request::Operation;
use crate::support::errors::HandlerError;
use crate::support::poll::PollResult;
use crate::support::time::parse_iso;

pub struct ReserveNow {
    status: &'static str,
}

impl ReserveNow {
    pub fn new() -> Self {
        Self { status: "Rejected" }
    }
}

impl Operation for ReserveNow {
    fn operation_type(&self) -> &'static str {
        "ReserveNow"
    }

    fn process_req(&mut self, model: &mut Model, payload: &Value) -> Result<(), HandlerError> {
        let connector_id = payload
            .get("connectorId")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| HandlerError::formation_violation("connectorId is required"))?
            as u32;
        let reservation_id = payload
            .get("reservationId")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| HandlerError::formation_violation("reservationId is required"))?
            as i32;
        let id_tag = payload
            .get("idTag")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerError::formation_violation("idTag is required"))?;
        if id_tag.is_empty() || id_tag.len() > 20 {
            return Err(HandlerError::property_constraint("idTag out of range"));
        }
        let expiry_date = payload
            .get("expiryDate")
            .and_then(|v| v.as_str())
            .and_then(parse_iso)
            .ok_or_else(|| HandlerError::formation_violation("expiryDate is required"))?;
        let parent_id_tag = payload
            .get("parentIdTag")
            .and_then(|v| v.as_str())
            .map(String::from);

        // Reserving the whole charge point (connectorId 0) is not
        // supported by this implementation.
        let connector_state = model
            .connector(connector_id)
            .filter(|_| connector_id > 0)
            .map(|c| {
                (
                    c.reported_status(),
                    c.has_active_transaction() || c.has_session(),
                )
            });
        let Some((status, occupied)) = connector_state else {
            self.status = "Rejected";
            return Ok(());
        };
        let slot_taken = model
            .reservations
            .for_connector(connector_id)
            .is_some_and(|r| r.reservation_id != reservation_id);

        self.status = match status {
            Some(ChargePointStatus::Faulted) => "Faulted",
            Some(ChargePointStatus::Unavailable) => "Unavailable",
            _ if occupied || slot_taken => "Occupied",
            _ => {
                model.reservations.upsert(Reservation {
                    reservation_id,
                    connector_id,
                    expiry_date,
                    id_tag: id_tag.to_string(),
                    parent_id_tag,
                });
                "Accepted"
            }
        };
        Ok(())
    }

    fn create_conf(&mut self, _model: &mut Model) -> PollResult<Result<Value, HandlerError>> {
        PollResult::Ready(Ok(json!({ "status": self.status })))
    }
}
