//! Reset (inbound).
//!
//! Confirmed immediately; running transactions stop with the matching
//! reason and the host's `execute_reset` hook fires once the queue drains.

use serde_json::{json, Value};

use crate::model::{Model, ResetKind, StopReason};
use crate::rpc::request::Operation;
use crate::support::errors::HandlerError;
use crate::support::poll::PollResult;

pub struct Reset {
    accepted: bool,
}

impl Reset {
    pub fn new() -> Self {
        Self { accepted: false }
    }
}

impl Operation for Reset {
    fn operation_type(&self) -> &'static str {
        "Reset"
    }

    fn process_req(&mut self, model: &mut Model, payload: &Value) -> Result<(), HandlerError> {
        let kind = match payload.get("type").and_then(|v| v.as_str()) {
            Some("Soft") | Some("OnIdle") => ResetKind::Soft,
            Some("Hard") | Some("Immediate") => ResetKind::Hard,
            Some(_) => return Err(HandlerError::property_constraint("type out of range")),
            None => return Err(HandlerError::formation_violation("type is required")),
        };

        let now = model.clock.tick_ms();
        self.accepted = model.reset.request(kind, now);
        if self.accepted {
            let reason = match kind {
                ResetKind::Soft => StopReason::SoftReset,
                ResetKind::Hard => StopReason::HardReset,
            };
            model.stop_all_transactions(reason);
        }
        Ok(())
    }

    fn create_conf(&mut self, _model: &mut Model) -> PollResult<Result<Value, HandlerError>> {
        let status = if self.accepted { "Accepted" } else { "Rejected" };
        PollResult::Ready(Ok(json!({ "status": status })))
    }
}
