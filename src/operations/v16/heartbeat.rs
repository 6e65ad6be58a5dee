//! Heartbeat (outbound).

use serde_json::{json, Value};

use crate::model::{Model, ProtocolVersion};
use crate::rpc::request::Operation;
use crate::support::poll::PollResult;
use crate::support::time::parse_iso;

pub struct Heartbeat {
    _version: ProtocolVersion,
}

impl Heartbeat {
    pub fn new(version: ProtocolVersion) -> Self {
        Self { _version: version }
    }
}

impl Operation for Heartbeat {
    fn operation_type(&self) -> &'static str {
        "Heartbeat"
    }

    fn create_req(&mut self, _model: &mut Model) -> PollResult<Value> {
        PollResult::Ready(json!({}))
    }

    fn process_conf(&mut self, model: &mut Model, payload: &Value) {
        if let Some(time) = payload
            .get("currentTime")
            .and_then(|v| v.as_str())
            .and_then(parse_iso)
        {
            model.clock.set_time(time);
        }
    }
}
