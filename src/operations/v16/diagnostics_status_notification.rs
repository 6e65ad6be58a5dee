//! DiagnosticsStatusNotification (outbound).

use serde_json::{json, Value};

use crate::model::{DiagnosticsStatus, Model};
use crate::rpc::request::Operation;
use crate::support::poll::PollResult;

pub struct DiagnosticsStatusNotification {
    status: DiagnosticsStatus,
}

impl DiagnosticsStatusNotification {
    pub fn new(status: DiagnosticsStatus) -> Self {
        Self { status }
    }
}

impl Operation for DiagnosticsStatusNotification {
    fn operation_type(&self) -> &'static str {
        "DiagnosticsStatusNotification"
    }

    fn create_req(&mut self, _model: &mut Model) -> PollResult<Value> {
        PollResult::Ready(json!({ "status": self.status.as_str() }))
    }
}
