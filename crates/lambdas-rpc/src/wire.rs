//! Wire frames. One JSON object per line.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::RpcError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Request(RpcRequest),
    Response(RpcResponse),
}

/// Outcome of classifying one inbound line.
#[derive(Debug)]
pub(crate) enum Inbound {
    Request(RpcRequest),
    Response(RpcResponse),
    /// A request frame we could not decode but whose id is known.
    BadRequest { id: u64, reason: String },
    Discard(String),
}

pub(crate) fn classify(line: &str) -> Inbound {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => return Inbound::Discard(format!("invalid json: {e}")),
    };
    if value.get("method").is_some() {
        let id = value.get("id").and_then(Value::as_u64);
        match serde_json::from_value::<RpcRequest>(value) {
            Ok(req) => Inbound::Request(req),
            Err(e) => match id {
                Some(id) => Inbound::BadRequest {
                    id,
                    reason: format!("malformed request: {e}"),
                },
                None => Inbound::Discard(format!("request without id: {e}")),
            },
        }
    } else {
        match serde_json::from_value::<RpcResponse>(value) {
            Ok(resp) => Inbound::Response(resp),
            Err(e) => Inbound::Discard(format!("malformed response: {e}")),
        }
    }
}

pub(crate) fn encode(msg: &RpcMessage) -> Result<String, RpcError> {
    let json = match msg {
        RpcMessage::Request(req) => serde_json::to_string(req)?,
        RpcMessage::Response(resp) => serde_json::to_string(resp)?,
    };
    Ok(json)
}

/// Write one serialized frame followed by a newline.
pub async fn write_line<W, T>(writer: &mut W, frame: &T) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_string(frame)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_requests_and_responses() {
        match classify(r#"{"id":3,"method":"register","params":[[],[]]}"#) {
            Inbound::Request(req) => {
                assert_eq!(req.id, 3);
                assert_eq!(req.method, "register");
                assert_eq!(req.params, vec![json!([]), json!([])]);
            }
            other => panic!("unexpected {other:?}"),
        }
        match classify(r#"{"id":3,"error":"boom"}"#) {
            Inbound::Response(resp) => assert_eq!(resp.error.as_deref(), Some("boom")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_request_with_id_is_answerable() {
        assert!(matches!(
            classify(r#"{"id":9,"method":"register","params":"nope"}"#),
            Inbound::BadRequest { id: 9, .. }
        ));
        assert!(matches!(classify(r#"{"method":"register"}"#), Inbound::Discard(_)));
        assert!(matches!(classify("not json"), Inbound::Discard(_)));
    }

    #[test]
    fn responses_omit_absent_fields() {
        let ok = serde_json::to_value(RpcResponse::ok(1, json!({"a": 1}))).unwrap();
        assert_eq!(ok, json!({"id": 1, "result": {"a": 1}}));
        let err = serde_json::to_value(RpcResponse::err(2, "nope")).unwrap();
        assert_eq!(err, json!({"id": 2, "error": "nope"}));
    }
}
