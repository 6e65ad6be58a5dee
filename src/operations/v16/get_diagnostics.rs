//! GetDiagnostics (inbound).
//!
//! The transfer itself is the host's job; the handler only negotiates the
//! file name and flips the diagnostics service into `Uploading`.

use serde_json::{json, Value};

use crate::model::{DiagnosticsRequest, Model};
use crate::rpc::request::Operation;
use crate::support::errors::HandlerError;
use crate::support::poll::PollResult;
use crate::support::time::parse_iso;

pub struct GetDiagnostics {
    file_name: Option<String>,
}

impl GetDiagnostics {
    pub fn new() -> Self {
        Self { file_name: None }
    }
}

impl Operation for GetDiagnostics {
    fn operation_type(&self) -> &'static str {
        "GetDiagnostics"
    }

    fn process_req(&mut self, model: &mut Model, payload: &Value) -> Result<(), HandlerError> {
        let location = payload
            .get("location")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerError::formation_violation("location is required"))?;

        let request = DiagnosticsRequest {
            location: location.to_string(),
            retries: payload.get("retries").and_then(|v| v.as_i64()).map(|v| v as i32),
            retry_interval: payload
                .get("retryInterval")
                .and_then(|v| v.as_i64())
                .map(|v| v as i32),
            start_time: payload
                .get("startTime")
                .and_then(|v| v.as_str())
                .and_then(parse_iso),
            stop_time: payload
                .get("stopTime")
                .and_then(|v| v.as_str())
                .and_then(parse_iso),
        };
        self.file_name = model.diagnostics.request_upload(request);
        Ok(())
    }

    fn create_conf(&mut self, _model: &mut Model) -> PollResult<Result<Value, HandlerError>> {
        // An empty conf means "no diagnostics available".
        let payload = match self.file_name.take() {
            Some(file_name) => json!({ "fileName": file_name }),
            None => json!({}),
        };
        PollResult::Ready(Ok(payload))
    }
}
