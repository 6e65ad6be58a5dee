//! SecurityEventNotification (outbound, pre-boot eligible).

use serde_json::{json, Value};

use crate::model::Model;
use crate::rpc::request::Operation;
use crate::support::poll::PollResult;
use crate::support::time::Timestamp;

pub struct SecurityEventNotification {
    event_type: String,
    tech_info: Option<String>,
    timestamp: Timestamp,
}

impl SecurityEventNotification {
    pub fn new(event_type: String, tech_info: Option<String>, timestamp: Timestamp) -> Self {
        Self {
            event_type,
            tech_info,
            timestamp,
        }
    }
}

impl Operation for SecurityEventNotification {
    fn operation_type(&self) -> &'static str {
        "SecurityEventNotification"
    }

    fn create_req(&mut self, model: &mut Model) -> PollResult<Value> {
        let mut payload = json!({
            "type": self.event_type,
            "timestamp": model.clock.render(&self.timestamp),
        });
        if let Some(info) = &self.tech_info {
            payload
                .as_object_mut()
                .unwrap()
                .insert("techInfo".to_string(), Value::String(info.clone()));
        }
        PollResult::Ready(payload)
    }
}
