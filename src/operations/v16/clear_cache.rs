//! ClearCache (inbound).
//!
//! The actual file sweep runs in the context step so the request queue can
//! drop its live persistent requests in the same cycle.

use serde_json::{json, Value};

use crate::model::Model;
use crate::rpc::request::Operation;
use crate::support::errors::HandlerError;
use crate::support::poll::PollResult;

pub struct ClearCache;

impl ClearCache {
    pub fn new() -> Self {
        Self
    }
}

impl Operation for ClearCache {
    fn operation_type(&self) -> &'static str {
        "ClearCache"
    }

    fn process_req(&mut self, model: &mut Model, _payload: &Value) -> Result<(), HandlerError> {
        model.request_cache_clear();
        Ok(())
    }

    fn create_conf(&mut self, _model: &mut Model) -> PollResult<Result<Value, HandlerError>> {
        PollResult::Ready(Ok(json!({ "status": "Accepted" })))
    }
}
