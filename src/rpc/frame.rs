//! Encoding and decoding of the OCPP-J transport envelope.
//!
//! Every wire message is a JSON array whose first element selects the
//! shape: `[2, id, action, payload]` for a Call, `[3, id, payload]` for a
//! CallResult, `[4, id, code, description, details]` for a CallError. This
//! envelope is the only JSON the runtime interprets; payloads travel
//! through it as opaque objects and are left to the operation handlers.

use serde_json::{json, Value};
use thiserror::Error;

use crate::support::errors::{RpcError, RpcErrorCode};

// ── Message-type constants ─────────────────────────────────────

const MSG_TYPE_CALL: u64 = 2;
const MSG_TYPE_CALL_RESULT: u64 = 3;
const MSG_TYPE_CALL_ERROR: u64 = 4;

/// Inbound messages larger than this are rejected before parsing.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Longest unique id OCPP-J permits.
pub const MAX_UNIQUE_ID_LEN: usize = 36;

// ── Frame ──────────────────────────────────────────────────────

/// A parsed OCPP-J frame (version-agnostic transport envelope).
#[derive(Debug, Clone)]
pub enum Frame {
    /// `[2, uniqueId, action, payload]`
    Call {
        unique_id: String,
        action: String,
        payload: Value,
    },
    /// `[3, uniqueId, payload]`
    CallResult { unique_id: String, payload: Value },
    /// `[4, uniqueId, errorCode, errorDescription, errorDetails]`
    CallError {
        unique_id: String,
        error_code: String,
        error_description: String,
        error_details: Value,
    },
}

impl Frame {
    // ── Parsing ────────────────────────────────────────────

    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let arr: Vec<Value> =
            serde_json::from_str(text).map_err(|e| FrameError::InvalidJson(e.to_string()))?;

        if arr.is_empty() {
            return Err(FrameError::EmptyArray);
        }

        let msg_type = arr[0].as_u64().ok_or(FrameError::InvalidMessageType)?;

        match msg_type {
            MSG_TYPE_CALL => Self::parse_call(&arr),
            MSG_TYPE_CALL_RESULT => Self::parse_call_result(&arr),
            MSG_TYPE_CALL_ERROR => Self::parse_call_error(&arr),
            _ => Err(FrameError::UnknownMessageType(msg_type)),
        }
    }

    fn parse_unique_id(arr: &[Value]) -> Result<String, FrameError> {
        let id = arr
            .get(1)
            .and_then(|v| v.as_str())
            .ok_or(FrameError::FieldTypeMismatch("uniqueId must be a string"))?;
        if id.len() > MAX_UNIQUE_ID_LEN || !id.is_ascii() {
            return Err(FrameError::InvalidUniqueId);
        }
        Ok(id.to_string())
    }

    fn parse_call(arr: &[Value]) -> Result<Self, FrameError> {
        if arr.len() < 4 {
            return Err(FrameError::MissingFields {
                expected: 4,
                got: arr.len(),
            });
        }

        let unique_id = Self::parse_unique_id(arr)?;
        let action = arr[2]
            .as_str()
            .ok_or(FrameError::FieldTypeMismatch("action must be a string"))?
            .to_string();
        let payload = arr[3].clone();
        if !payload.is_object() {
            return Err(FrameError::FieldTypeMismatch("payload must be an object"));
        }

        Ok(Self::Call {
            unique_id,
            action,
            payload,
        })
    }

    fn parse_call_result(arr: &[Value]) -> Result<Self, FrameError> {
        if arr.len() < 3 {
            return Err(FrameError::MissingFields {
                expected: 3,
                got: arr.len(),
            });
        }

        let unique_id = Self::parse_unique_id(arr)?;
        let payload = arr[2].clone();
        if !payload.is_object() {
            return Err(FrameError::FieldTypeMismatch("payload must be an object"));
        }

        Ok(Self::CallResult { unique_id, payload })
    }

    fn parse_call_error(arr: &[Value]) -> Result<Self, FrameError> {
        if arr.len() < 4 {
            return Err(FrameError::MissingFields {
                expected: 4,
                got: arr.len(),
            });
        }

        let unique_id = Self::parse_unique_id(arr)?;
        let error_code = arr[2]
            .as_str()
            .ok_or(FrameError::FieldTypeMismatch("errorCode must be a string"))?
            .to_string();
        let error_description = arr
            .get(3)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let error_details = arr
            .get(4)
            .cloned()
            .unwrap_or(Value::Object(Default::default()));

        Ok(Self::CallError {
            unique_id,
            error_code,
            error_description,
            error_details,
        })
    }

    // ── Serialization ──────────────────────────────────────

    pub fn serialize(&self) -> String {
        let arr: Value = match self {
            Self::Call {
                unique_id,
                action,
                payload,
            } => Value::Array(vec![
                Value::Number(MSG_TYPE_CALL.into()),
                Value::String(unique_id.clone()),
                Value::String(action.clone()),
                payload.clone(),
            ]),

            Self::CallResult { unique_id, payload } => Value::Array(vec![
                Value::Number(MSG_TYPE_CALL_RESULT.into()),
                Value::String(unique_id.clone()),
                payload.clone(),
            ]),

            Self::CallError {
                unique_id,
                error_code,
                error_description,
                error_details,
            } => Value::Array(vec![
                Value::Number(MSG_TYPE_CALL_ERROR.into()),
                Value::String(unique_id.clone()),
                Value::String(error_code.clone()),
                Value::String(error_description.clone()),
                error_details.clone(),
            ]),
        };

        // The frame is assembled from Values, which have no
        // non-serializable states.
        serde_json::to_string(&arr).unwrap()
    }

    // ── Helpers ────────────────────────────────────────────

    pub fn unique_id(&self) -> &str {
        match self {
            Self::Call { unique_id, .. }
            | Self::CallResult { unique_id, .. }
            | Self::CallError { unique_id, .. } => unique_id,
        }
    }

    pub fn error_response(unique_id: impl Into<String>, err: &RpcError) -> Self {
        Self::CallError {
            unique_id: unique_id.into(),
            error_code: err.code.as_str().to_string(),
            error_description: err.description.clone(),
            error_details: err.details.clone(),
        }
    }

    /// CallError for an inbound text exceeding the JSON buffer cap. The
    /// unique id cannot be trusted at that size, so the reply carries an
    /// empty id.
    pub fn buffer_exceeded(max_capacity: usize, msg_length: usize) -> Self {
        Self::CallError {
            unique_id: String::new(),
            error_code: RpcErrorCode::GenericError.as_str().to_string(),
            error_description: "JSON too long or too many fields. Cannot deserialize".to_string(),
            error_details: json!({
                "max_capacity": max_capacity,
                "msg_length": msg_length,
            }),
        }
    }
}

// ── Errors ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("empty OCPP message array")]
    EmptyArray,

    #[error("message type is not a number")]
    InvalidMessageType,

    #[error("unknown message type: {0}")]
    UnknownMessageType(u64),

    #[error("expected at least {expected} fields, got {got}")]
    MissingFields { expected: usize, got: usize },

    #[error("field type mismatch: {0}")]
    FieldTypeMismatch(&'static str),

    #[error("unique id too long or not ASCII")]
    InvalidUniqueId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_server_call() {
        // A CSMS-initiated command, as it reaches the charge point.
        let text = r#"[2,"cs-0117","RemoteStartTransaction",{"connectorId":1,"idTag":"SIM-TAG-01"}]"#;
        let frame = Frame::parse(text).unwrap();
        match frame {
            Frame::Call {
                unique_id,
                action,
                payload,
            } => {
                assert_eq!(unique_id, "cs-0117");
                assert_eq!(action, "RemoteStartTransaction");
                assert_eq!(payload["idTag"], "SIM-TAG-01");
                assert_eq!(payload["connectorId"], 1);
            }
            _ => panic!("Expected Call frame"),
        }
    }

    #[test]
    fn parse_start_transaction_conf() {
        // The answer to a StartTransaction this client issued.
        let text = r#"[3,"0b54a7d2-3c1e-4f7a-9b0e-5d2f8c6a1e90",{"transactionId":42,"idTagInfo":{"status":"Accepted"}}]"#;
        let frame = Frame::parse(text).unwrap();
        match frame {
            Frame::CallResult { unique_id, payload } => {
                assert_eq!(unique_id, "0b54a7d2-3c1e-4f7a-9b0e-5d2f8c6a1e90");
                assert_eq!(payload["transactionId"], 42);
                assert_eq!(payload["idTagInfo"]["status"], "Accepted");
            }
            _ => panic!("Expected CallResult frame"),
        }
    }

    #[test]
    fn parse_server_call_error() {
        let text =
            r#"[4,"hb-3","InternalError","Backend database unavailable",{"retryAfter":30}]"#;
        let frame = Frame::parse(text).unwrap();
        match frame {
            Frame::CallError {
                unique_id,
                error_code,
                error_description,
                error_details,
            } => {
                assert_eq!(unique_id, "hb-3");
                assert_eq!(RpcErrorCode::from_wire(&error_code), RpcErrorCode::InternalError);
                assert_eq!(error_description, "Backend database unavailable");
                assert_eq!(error_details["retryAfter"], 30);
            }
            _ => panic!("Expected CallError frame"),
        }
    }

    #[test]
    fn roundtrip_status_notification_call() {
        // The busiest outbound shape of this client.
        let frame = Frame::Call {
            unique_id: "op-12".into(),
            action: "StatusNotification".into(),
            payload: serde_json::json!({
                "connectorId": 1,
                "errorCode": "NoError",
                "status": "Charging",
                "timestamp": "2024-06-01T12:00:05.250Z",
            }),
        };
        let parsed = Frame::parse(&frame.serialize()).unwrap();
        assert_eq!(parsed.unique_id(), "op-12");
        match parsed {
            Frame::Call { action, payload, .. } => {
                assert_eq!(action, "StatusNotification");
                assert_eq!(payload["status"], "Charging");
                assert_eq!(payload["timestamp"], "2024-06-01T12:00:05.250Z");
            }
            _ => panic!("Expected Call frame"),
        }
    }

    #[test]
    fn rejects_unknown_message_type() {
        assert!(matches!(
            Frame::parse(r#"[5,"id",{}]"#),
            Err(FrameError::UnknownMessageType(5))
        ));
    }

    #[test]
    fn rejects_non_object_payload() {
        assert!(Frame::parse(r#"[2,"id","Heartbeat",[]]"#).is_err());
        assert!(Frame::parse(r#"[3,"id","nope"]"#).is_err());
    }

    #[test]
    fn rejects_oversized_unique_id() {
        let id = "x".repeat(40);
        let text = format!(r#"[2,"{id}","Heartbeat",{{}}]"#);
        assert!(matches!(
            Frame::parse(&text),
            Err(FrameError::InvalidUniqueId)
        ));
    }

    #[test]
    fn buffer_exceeded_details() {
        let frame = Frame::buffer_exceeded(16384, 20000);
        match &frame {
            Frame::CallError {
                error_code,
                error_details,
                ..
            } => {
                assert_eq!(error_code, "GenericError");
                assert_eq!(error_details["max_capacity"], 16384);
                assert_eq!(error_details["msg_length"], 20000);
            }
            _ => panic!("Expected CallError frame"),
        }
        let parsed = Frame::parse(&frame.serialize()).unwrap();
        assert!(matches!(parsed, Frame::CallError { .. }));
    }
}
