//! FirmwareStatusNotification (outbound).

use serde_json::{json, Value};

use crate::model::{FirmwareStatus, Model};
use crate::rpc::request::Operation;
use crate::support::poll::PollResult;

pub struct FirmwareStatusNotification {
    status: FirmwareStatus,
}

impl FirmwareStatusNotification {
    pub fn new(status: FirmwareStatus) -> Self {
        Self { status }
    }
}

impl Operation for FirmwareStatusNotification {
    fn operation_type(&self) -> &'static str {
        "FirmwareStatusNotification"
    }

    fn create_req(&mut self, _model: &mut Model) -> PollResult<Value> {
        PollResult::Ready(json!({ "status": self.status.as_str() }))
    }
}
