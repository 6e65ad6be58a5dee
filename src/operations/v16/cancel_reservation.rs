//! CancelReservation (inbound).

use serde_json::{json, Value};

use crate::model::Model;
use crate::rpc::request::Operation;
use crate::support::errors::HandlerError;
use crate::support::poll::PollResult;

pub struct CancelReservation {
    accepted: bool,
}

impl CancelReservation {
    pub fn new() -> Self {
        Self { accepted: false }
    }
}

impl Operation for CancelReservation {
    fn operation_type(&self) -> &'static str {
        "CancelReservation"
    }

    fn process_req(&mut self, model: &mut Model, payload: &Value) -> Result<(), HandlerError> {
        let reservation_id = payload
            .get("reservationId")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| HandlerError::formation_violation("reservationId is required"))?
            as i32;
        self.accepted = model.reservations.cancel(reservation_id);
        Ok(())
    }

    fn create_conf(&mut self, _model: &mut Model) -> PollResult<Result<Value, HandlerError>> {
        let status = if self.accepted { "Accepted" } else { "Rejected" };
        PollResult::Ready(Ok(json!({ "status": status })))
    }
}
