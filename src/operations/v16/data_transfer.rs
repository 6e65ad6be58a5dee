//! DataTransfer, both directions.
//!
//! Inbound requests are answered by the integrator's vendor handler;
//! without one, every vendor id is unknown. Outbound transfers are
//! constructed by the host API.

use serde_json::{json, Value};

use crate::model::{DataTransferResult, Model};
use crate::rpc::request::Operation;
use crate::support::errors::HandlerError;
use crate::support::poll::PollResult;

pub struct DataTransfer {
    // Outbound fields.
    vendor_id: String,
    message_id: Option<String>,
    data: Option<Value>,
    // Inbound response.
    response: Option<Value>,
}

impl DataTransfer {
    pub fn outbound(vendor_id: String, message_id: Option<String>, data: Option<Value>) -> Self {
        Self {
            vendor_id,
            message_id,
            data,
            response: None,
        }
    }

    pub fn inbound() -> Self {
        Self::outbound(String::new(), None, None)
    }
}

impl Operation for DataTransfer {
    fn operation_type(&self) -> &'static str {
        "DataTransfer"
    }

    fn create_req(&mut self, _model: &mut Model) -> PollResult<Value> {
        let mut payload = json!({ "vendorId": self.vendor_id });
        let map = payload.as_object_mut().unwrap();
        if let Some(message_id) = &self.message_id {
            map.insert("messageId".to_string(), Value::String(message_id.clone()));
        }
        if let Some(data) = &self.data {
            map.insert("data".to_string(), data.clone());
        }
        PollResult::Ready(payload)
    }

    fn process_req(&mut self, model: &mut Model, payload: &Value) -> Result<(), HandlerError> {
        let vendor_id = payload
            .get("vendorId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerError::formation_violation("vendorId is required"))?;
        let message_id = payload.get("messageId").and_then(|v| v.as_str());
        let data = payload.get("data");

        let (status, data) = match model.handle_data_transfer(vendor_id, message_id, data) {
            DataTransferResult::Accepted(data) => ("Accepted", data),
            DataTransferResult::Rejected => ("Rejected", None),
            DataTransferResult::UnknownVendorId => ("UnknownVendorId", None),
            DataTransferResult::UnknownMessageId => ("UnknownMessageId", None),
        };
        let mut response = json!({ "status": status });
        if let Some(data) = data {
            response
                .as_object_mut()
                .unwrap()
                .insert("data".to_string(), data);
        }
        self.response = Some(response);
        Ok(())
    }

    fn create_conf(&mut self, _model: &mut Model) -> PollResult<Result<Value, HandlerError>> {
        PollResult::Ready(Ok(self
            .response
            .take()
            .unwrap_or_else(|| json!({ "status": "Rejected" }))))
    }
}
