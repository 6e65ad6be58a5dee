//! GetLocalListVersion (inbound).

use serde_json::{json, Value};

use crate::model::Model;
use crate::rpc::request::Operation;
use crate::support::errors::HandlerError;
use crate::support::poll::PollResult;

pub struct GetLocalListVersion {
    version: i32,
}

impl GetLocalListVersion {
    pub fn new() -> Self {
        Self { version: -1 }
    }
}

impl Operation for GetLocalListVersion {
    fn operation_type(&self) -> &'static str {
        "GetLocalListVersion"
    }

    fn process_req(&mut self, model: &mut Model, _payload: &Value) -> Result<(), HandlerError> {
        // -1 signals "local list not supported" per 1.6.
        self.version = if model.auth_list.is_enabled() {
            model.auth_list.list_version()
        } else {
            -1
        };
        Ok(())
    }

    fn create_conf(&mut self, _model: &mut Model) -> PollResult<Result<Value, HandlerError>> {
        PollResult::Ready(Ok(json!({ "listVersion": self.version })))
    }
}
