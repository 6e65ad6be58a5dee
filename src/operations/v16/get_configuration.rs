//! GetConfiguration (inbound).

use serde_json::{json, Value};

use crate::model::Model;
use crate::rpc::request::Operation;
use crate::support::errors::HandlerError;
use crate::support::poll::PollResult;

pub struct GetConfiguration {
    response: Option<Value>,
}

impl GetConfiguration {
    pub fn new() -> Self {
        Self { response: None }
    }
}

impl Operation for GetConfiguration {
    fn operation_type(&self) -> &'static str {
        "GetConfiguration"
    }

    fn process_req(&mut self, model: &mut Model, payload: &Value) -> Result<(), HandlerError> {
        let requested: Option<Vec<String>> = payload.get("key").and_then(|v| v.as_array()).map(|keys| {
            keys.iter()
                .filter_map(|k| k.as_str().map(String::from))
                .collect()
        });

        let max_keys = model
            .cfg
            .get("GetConfigurationMaxKeys")
            .map_or(50, |e| e.int().max(1)) as usize;

        let visible = model.cfg.peer_visible_entries();
        let mut configuration_key = Vec::new();
        let mut unknown_key = Vec::new();

        match requested {
            Some(keys) => {
                for key in keys {
                    match visible.iter().find(|e| e.key() == key) {
                        Some(entry) => configuration_key.push(json!({
                            "key": entry.key(),
                            "readonly": !entry.writable_by_peer(),
                            "value": entry.render(),
                        })),
                        None => unknown_key.push(Value::String(key)),
                    }
                    if configuration_key.len() >= max_keys {
                        break;
                    }
                }
            }
            None => {
                for entry in visible.iter().take(max_keys) {
                    configuration_key.push(json!({
                        "key": entry.key(),
                        "readonly": !entry.writable_by_peer(),
                        "value": entry.render(),
                    }));
                }
            }
        }

        let mut response = json!({ "configurationKey": configuration_key });
        if !unknown_key.is_empty() {
            response
                .as_object_mut()
                .unwrap()
                .insert("unknownKey".to_string(), Value::Array(unknown_key));
        }
        self.response = Some(response);
        Ok(())
    }

    fn create_conf(&mut self, _model: &mut Model) -> PollResult<Result<Value, HandlerError>> {
        PollResult::Ready(Ok(self
            .response
            .take()
            .unwrap_or_else(|| json!({ "configurationKey": [] }))))
    }
}
