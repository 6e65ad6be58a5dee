//! Authorize (outbound).

use serde_json::{json, Value};
use tracing::info;

use crate::model::{Model, ProtocolVersion};
use crate::rpc::request::{ErrorDisposition, Operation};
use crate::support::errors::RpcError;
use crate::support::poll::PollResult;

pub struct Authorize {
    version: ProtocolVersion,
    connector_id: u32,
    id_tag: String,
}

impl Authorize {
    pub fn new(version: ProtocolVersion, connector_id: u32, id_tag: String) -> Self {
        Self {
            version,
            connector_id,
            id_tag,
        }
    }
}

impl Operation for Authorize {
    fn operation_type(&self) -> &'static str {
        "Authorize"
    }

    fn create_req(&mut self, _model: &mut Model) -> PollResult<Value> {
        let payload = match self.version {
            ProtocolVersion::V16 => json!({ "idTag": self.id_tag }),
            ProtocolVersion::V201 => json!({
                "idToken": { "idToken": self.id_tag, "type": "ISO14443" }
            }),
        };
        PollResult::Ready(payload)
    }

    fn process_conf(&mut self, model: &mut Model, payload: &Value) {
        let (accepted, parent) = match self.version {
            ProtocolVersion::V16 => {
                let info = payload.get("idTagInfo");
                let accepted = info
                    .and_then(|i| i.get("status"))
                    .and_then(|s| s.as_str())
                    == Some("Accepted");
                let parent = info
                    .and_then(|i| i.get("parentIdTag"))
                    .and_then(|p| p.as_str())
                    .map(String::from);
                (accepted, parent)
            }
            ProtocolVersion::V201 => {
                let info = payload.get("idTokenInfo");
                let accepted = info
                    .and_then(|i| i.get("status"))
                    .and_then(|s| s.as_str())
                    == Some("Accepted");
                let parent = info
                    .and_then(|i| i.get("groupIdToken"))
                    .and_then(|g| g.get("idToken"))
                    .and_then(|p| p.as_str())
                    .map(String::from);
                (accepted, parent)
            }
        };
        model.finish_authorization(self.connector_id, &self.id_tag, accepted, parent);
    }

    /// Authorization could not be delivered; fall back to the local policy.
    fn process_err(&mut self, model: &mut Model, error: &RpcError) -> ErrorDisposition {
        info!(id_tag = %self.id_tag, %error, "Authorize failed, using offline policy");
        model.authorize_offline_fallback(self.connector_id, &self.id_tag);
        ErrorDisposition::Abort
    }
}
