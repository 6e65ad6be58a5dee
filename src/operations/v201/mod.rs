//! OCPP 2.0.1 dispatch set.
//!
//! Deliberately thin: the runtime below is version-agnostic, outbound
//! payload dialects live inside the shared operations, and only the
//! 2.0.1-renamed inbound actions get their own small handlers here.
//! Everything not registered is answered `NotImplemented` by the registry.

use serde_json::{json, Value};

use crate::model::Model;
use crate::operations::v16;
use crate::rpc::registry::OperationRegistry;
use crate::rpc::request::Operation;
use crate::support::errors::HandlerError;
use crate::support::poll::PollResult;

pub fn register(registry: &mut OperationRegistry) {
    // Identical envelope and compatible payloads; shared handlers.
    registry.register("Reset", Box::new(|| Box::new(v16::reset::Reset::new())));
    registry.register("DataTransfer", Box::new(|| {
        Box::new(v16::data_transfer::DataTransfer::inbound())
    }));
    registry.register("TriggerMessage", Box::new(|| {
        Box::new(v16::trigger_message::TriggerMessage::new())
    }));

    // 2.0.1 renames of the remote-control pair.
    registry.register("RequestStartTransaction", Box::new(|| {
        Box::new(RequestStartTransaction::new())
    }));
    registry.register("RequestStopTransaction", Box::new(|| {
        Box::new(RequestStopTransaction::new())
    }));
}

// ── RequestStartTransaction ────────────────────────────────────

struct RequestStartTransaction {
    accepted: bool,
}

impl RequestStartTransaction {
    fn new() -> Self {
        Self { accepted: false }
    }
}

impl Operation for RequestStartTransaction {
    fn operation_type(&self) -> &'static str {
        "RequestStartTransaction"
    }

    fn process_req(&mut self, model: &mut Model, payload: &Value) -> Result<(), HandlerError> {
        let id_token = payload
            .get("idToken")
            .and_then(|t| t.get("idToken"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerError::formation_violation("idToken is required"))?;
        let evse_id = payload
            .get("evseId")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32);
        self.accepted = model.remote_start(id_token, evse_id);
        Ok(())
    }

    fn create_conf(&mut self, _model: &mut Model) -> PollResult<Result<Value, HandlerError>> {
        let status = if self.accepted { "Accepted" } else { "Rejected" };
        PollResult::Ready(Ok(json!({ "status": status })))
    }
}

// ── RequestStopTransaction ─────────────────────────────────────

struct RequestStopTransaction {
    accepted: bool,
}

impl RequestStopTransaction {
    fn new() -> Self {
        Self { accepted: false }
    }
}

impl Operation for RequestStopTransaction {
    fn operation_type(&self) -> &'static str {
        "RequestStopTransaction"
    }

    fn process_req(&mut self, model: &mut Model, payload: &Value) -> Result<(), HandlerError> {
        let transaction_id = payload
            .get("transactionId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerError::formation_violation("transactionId is required"))?;
        self.accepted = model.remote_stop_by_ref(transaction_id);
        Ok(())
    }

    fn create_conf(&mut self, _model: &mut Model) -> PollResult<Result<Value, HandlerError>> {
        let status = if self.accepted { "Accepted" } else { "Rejected" };
        PollResult::Ready(Ok(json!({ "status": status })))
    }
}
