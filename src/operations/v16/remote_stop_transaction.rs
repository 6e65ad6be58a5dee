//! RemoteStopTransaction (inbound).

use serde_json::{json, Value};
use tracing::info;

use crate::model::Model;
use crate::rpc::request::Operation;
use crate::support::errors::HandlerError;
use crate::support::poll::PollResult;

pub struct RemoteStopTransaction {
    accepted: bool,
}

impl RemoteStopTransaction {
    pub fn new() -> Self {
        Self { accepted: false }
    }
}

impl Operation for RemoteStopTransaction {
    fn operation_type(&self) -> &'static str {
        "RemoteStopTransaction"
    }

    fn process_req(&mut self, model: &mut Model, payload: &Value) -> Result<(), HandlerError> {
        let transaction_id = payload
            .get("transactionId")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| HandlerError::formation_violation("transactionId is required"))?
            as i32;
        self.accepted = model.remote_stop(transaction_id);
        info!(transaction_id, accepted = self.accepted, "remote stop");
        Ok(())
    }

    fn create_conf(&mut self, _model: &mut Model) -> PollResult<Result<Value, HandlerError>> {
        let status = if self.accepted { "Accepted" } else { "Rejected" };
        PollResult::Ready(Ok(json!({ "status": status })))
    }
}
