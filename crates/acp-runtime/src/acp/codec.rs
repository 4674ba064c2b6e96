//! Envelope encoding and classification

use crate::error::{AcpError, Error, Result};
use crate::types::{JsonRpcError, RequestId, JSONRPC_VERSION};
use serde_json::{Map, Value};

/// One JSON-RPC unit on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    Response {
        id: RequestId,
        outcome: std::result::Result<Value, JsonRpcError>,
    },
}

impl Envelope {
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Envelope::Request {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Envelope::Notification {
            method: method.into(),
            params,
        }
    }

    pub fn success(id: RequestId, result: Value) -> Self {
        Envelope::Response {
            id,
            outcome: Ok(result),
        }
    }

    pub fn failure(id: RequestId, error: JsonRpcError) -> Self {
        Envelope::Response {
            id,
            outcome: Err(error),
        }
    }

    /// Method name for requests and notifications
    pub fn method(&self) -> Option<&str> {
        match self {
            Envelope::Request { method, .. } | Envelope::Notification { method, .. } => {
                Some(method)
            }
            Envelope::Response { .. } => None,
        }
    }
}

/// Serialize an envelope into a single-line JSON frame (no delimiter).
pub fn encode(envelope: &Envelope) -> Result<String> {
    let mut map = Map::new();
    map.insert("jsonrpc".to_string(), Value::from(JSONRPC_VERSION));

    match envelope {
        Envelope::Request { id, method, params } => {
            map.insert("id".to_string(), serde_json::to_value(id)?);
            map.insert("method".to_string(), Value::from(method.as_str()));
            if let Some(params) = params {
                map.insert("params".to_string(), params.clone());
            }
        }
        Envelope::Notification { method, params } => {
            map.insert("method".to_string(), Value::from(method.as_str()));
            if let Some(params) = params {
                map.insert("params".to_string(), params.clone());
            }
        }
        Envelope::Response { id, outcome } => {
            map.insert("id".to_string(), serde_json::to_value(id)?);
            match outcome {
                Ok(result) => {
                    map.insert("result".to_string(), result.clone());
                }
                Err(error) => {
                    map.insert("error".to_string(), serde_json::to_value(error)?);
                }
            }
        }
    }

    Ok(serde_json::to_string(&Value::Object(map))?)
}

/// Parse and classify a frame.
///
/// Returns `Decode` when the bytes are not a JSON object and
/// `ProtocolViolation` when the object does not have a valid envelope shape.
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| Error::Acp(AcpError::Decode(e.to_string())))?;
    classify(value)
}

/// Classify an already-parsed JSON value.
pub fn classify(value: Value) -> Result<Envelope> {
    let Value::Object(mut map) = value else {
        return Err(violation("frame is not a JSON object"));
    };

    let id = match map.remove("id") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(
            serde_json::from_value::<RequestId>(raw)
                .map_err(|_| violation("id must be a non-negative integer or a string"))?,
        ),
    };

    let method = match map.remove("method") {
        None => None,
        Some(Value::String(method)) => Some(method),
        Some(_) => return Err(violation("method must be a string")),
    };

    let result = map.remove("result");
    let error = map.remove("error");
    let params = map.remove("params");

    match (method, id) {
        (Some(method), id) => {
            if result.is_some() || error.is_some() {
                return Err(violation(format!(
                    "{} carries both a method and a result or error",
                    method
                )));
            }
            Ok(match id {
                Some(id) => Envelope::Request { id, method, params },
                None => Envelope::Notification { method, params },
            })
        }
        (None, Some(id)) => match (result, error) {
            (Some(result), None) => Ok(Envelope::Response {
                id,
                outcome: Ok(result),
            }),
            (None, Some(error)) => {
                let error: JsonRpcError = serde_json::from_value(error)
                    .map_err(|e| violation(format!("malformed error object for {}: {}", id, e)))?;
                Ok(Envelope::Response {
                    id,
                    outcome: Err(error),
                })
            }
            (Some(_), Some(_)) => Err(violation(format!(
                "response {} has both result and error",
                id
            ))),
            (None, None) => Err(violation(format!(
                "response {} has neither result nor error",
                id
            ))),
        },
        (None, None) => Err(violation("frame has neither method nor id")),
    }
}

fn violation(msg: impl Into<String>) -> Error {
    Error::Acp(AcpError::ProtocolViolation(msg.into()))
}

/// Offset of the first `{` when a line carries non-JSON noise in front of it
pub(crate) fn json_start(line: &[u8]) -> Option<usize> {
    line.iter().position(|b| *b == b'{').filter(|idx| *idx > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::METHOD_NOT_FOUND;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn decode_value(value: Value) -> Result<Envelope> {
        decode(value.to_string().as_bytes())
    }

    fn is_violation(result: Result<Envelope>) -> bool {
        matches!(result, Err(Error::Acp(AcpError::ProtocolViolation(_))))
    }

    #[test]
    fn test_classifies_request() {
        let envelope = decode_value(json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "requestToolCallConfirmation",
            "params": {"label": "x"}
        }))
        .unwrap();

        assert_eq!(
            envelope,
            Envelope::request(7u64, "requestToolCallConfirmation", Some(json!({"label": "x"})))
        );
    }

    #[test]
    fn test_classifies_notification() {
        let envelope = decode_value(json!({
            "jsonrpc": "2.0",
            "method": "streamAssistantMessageChunk",
            "params": {"chunk": {"text": "hi"}}
        }))
        .unwrap();
        assert!(matches!(envelope, Envelope::Notification { .. }));
        assert_eq!(envelope.method(), Some("streamAssistantMessageChunk"));
    }

    #[test]
    fn test_null_id_is_a_notification() {
        let envelope = decode_value(json!({"id": null, "method": "ping"})).unwrap();
        assert_eq!(envelope, Envelope::notification("ping", None));
    }

    #[test]
    fn test_classifies_responses() {
        let ok = decode_value(json!({"id": 3, "result": null})).unwrap();
        assert_eq!(ok, Envelope::success(RequestId::Number(3), Value::Null));

        let err = decode_value(json!({
            "id": "a",
            "error": {"code": -32601, "message": "nope"}
        }))
        .unwrap();
        match err {
            Envelope::Response { id, outcome: Err(e) } => {
                assert_eq!(id, RequestId::Str("a".into()));
                assert_eq!(e.code, METHOD_NOT_FOUND);
            }
            other => panic!("Expected error response, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_invalid_shapes() {
        assert!(is_violation(decode_value(json!({"id": 1}))));
        assert!(is_violation(decode_value(json!({"id": 1, "result": 1, "error": {"code": 1, "message": "x"}}))));
        assert!(is_violation(decode_value(json!({"id": 1, "method": "m", "result": 1}))));
        assert!(is_violation(decode_value(json!({"result": 1}))));
        assert!(is_violation(decode_value(json!({"id": 1, "method": 5}))));
        assert!(is_violation(decode_value(json!({"id": -4, "result": 1}))));
        assert!(is_violation(decode_value(json!({"id": 1, "error": "bad"}))));
        assert!(is_violation(decode_value(json!([1, 2]))));
    }

    #[test]
    fn test_non_json_is_decode_error() {
        assert!(matches!(
            decode(b"Loading model..."),
            Err(Error::Acp(AcpError::Decode(_)))
        ));
    }

    #[test]
    fn test_encode_request_keeps_id() {
        let frame = encode(&Envelope::request(1u64, "initialize", Some(json!({"protocolVersion": "1"})))).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            value,
            json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {"protocolVersion": "1"}})
        );
        assert!(!frame.contains('\n'));
    }

    #[test]
    fn test_encode_notification_has_no_id() {
        let frame = encode(&Envelope::notification("cancelSendMessage", None)).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value, json!({"jsonrpc": "2.0", "method": "cancelSendMessage"}));
    }

    #[test]
    fn test_encode_responses_are_exclusive() {
        let ok = encode(&Envelope::success(RequestId::Number(2), Value::Null)).unwrap();
        let ok: Value = serde_json::from_str(&ok).unwrap();
        assert_eq!(ok, json!({"jsonrpc": "2.0", "id": 2, "result": null}));

        let err = encode(&Envelope::failure(
            RequestId::Str("x".into()),
            JsonRpcError::new(METHOD_NOT_FOUND, "nope"),
        ))
        .unwrap();
        let err: Value = serde_json::from_str(&err).unwrap();
        assert_eq!(
            err,
            json!({"jsonrpc": "2.0", "id": "x", "error": {"code": -32601, "message": "nope"}})
        );
    }

    #[test]
    fn test_json_start() {
        assert_eq!(json_start(b"[agent] {\"id\":1}"), Some(8));
        assert_eq!(json_start(b"{\"id\":1}"), None);
        assert_eq!(json_start(b"no json here"), None);
    }
}
