//! SendLocalList (inbound).

use serde_json::{json, Value};

use crate::model::auth_list::AuthorizationData;
use crate::model::Model;
use crate::rpc::request::Operation;
use crate::support::errors::HandlerError;
use crate::support::poll::PollResult;
use crate::support::time::parse_iso;

pub struct SendLocalList {
    status: &'static str,
}

impl SendLocalList {
    pub fn new() -> Self {
        Self { status: "Failed" }
    }
}

fn parse_entry(value: &Value) -> Result<AuthorizationData, HandlerError> {
    let id_tag = value
        .get("idTag")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerError::formation_violation("idTag is required"))?;
    if id_tag.is_empty() || id_tag.len() > 20 {
        return Err(HandlerError::property_constraint("idTag out of range"));
    }
    let info = value.get("idTagInfo");
    Ok(AuthorizationData {
        id_tag: id_tag.to_string(),
        status: info
            .and_then(|i| i.get("status"))
            .and_then(|s| s.as_str())
            .map(String::from),
        expiry_date: info
            .and_then(|i| i.get("expiryDate"))
            .and_then(|d| d.as_str())
            .and_then(parse_iso),
        parent_id_tag: info
            .and_then(|i| i.get("parentIdTag"))
            .and_then(|p| p.as_str())
            .map(String::from),
    })
}

impl Operation for SendLocalList {
    fn operation_type(&self) -> &'static str {
        "SendLocalList"
    }

    fn process_req(&mut self, model: &mut Model, payload: &Value) -> Result<(), HandlerError> {
        let list_version = payload
            .get("listVersion")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| HandlerError::formation_violation("listVersion is required"))?
            as i32;
        let update_type = payload
            .get("updateType")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerError::formation_violation("updateType is required"))?;

        if !model.auth_list.is_enabled() {
            self.status = "NotSupported";
            return Ok(());
        }

        let entries = match payload.get("localAuthorizationList").and_then(|v| v.as_array()) {
            Some(list) => list.iter().map(parse_entry).collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        self.status = match update_type {
            "Full" => {
                model.auth_list.update_full(list_version, entries);
                "Accepted"
            }
            "Differential" => match model.auth_list.update_differential(list_version, entries) {
                Ok(()) => "Accepted",
                Err(_) => "VersionMismatch",
            },
            _ => return Err(HandlerError::property_constraint("updateType out of range")),
        };
        Ok(())
    }

    fn create_conf(&mut self, _model: &mut Model) -> PollResult<Result<Value, HandlerError>> {
        PollResult::Ready(Ok(json!({ "status": self.status })))
    }
}
