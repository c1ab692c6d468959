use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const MAX_FRAME_BYTES: usize = 1024 * 1024;
pub const MAX_ID_CHARS: usize = 100;
pub const MAX_METHOD_CHARS: usize = 100;
pub const MAX_CONNECTIONS: usize = 50;
pub const IDLE_TIMEOUT_SECS: u64 = 30;
pub const PROBE_TIMEOUT_MS: u64 = 300;

/// One request over the per-workspace socket: newline-delimited JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcResponse {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcResponse {
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IpcError {
    #[error("frame exceeds max size: {size} > {max}")]
    Oversized { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, IpcError> {
    let mut encoded = serde_json::to_vec(value).map_err(|err| IpcError::Encode(err.to_string()))?;
    if encoded.len() > MAX_FRAME_BYTES {
        return Err(IpcError::Oversized {
            size: encoded.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, IpcError> {
    let mut raw = bytes;
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.len() > MAX_FRAME_BYTES {
        return Err(IpcError::Oversized {
            size: raw.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    serde_json::from_slice(raw).map_err(|err| IpcError::Decode(err.to_string()))
}

pub fn validate_request(request: &IpcRequest) -> Result<(), IpcError> {
    if request.id.is_empty() || request.id.chars().count() > MAX_ID_CHARS {
        return Err(IpcError::InvalidRequest(format!(
            "id must be 1..={MAX_ID_CHARS} characters"
        )));
    }
    if request.method.is_empty() || request.method.chars().count() > MAX_METHOD_CHARS {
        return Err(IpcError::InvalidRequest(format!(
            "method must be 1..={MAX_METHOD_CHARS} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let request = IpcRequest {
            id: "req-1".to_string(),
            method: "get_status".to_string(),
            params: Some(serde_json::json!({"name": "api"})),
        };
        let frame = encode_frame(&request).unwrap();
        assert_eq!(frame.last(), Some(&b'\n'));
        let decoded: IpcRequest = decode_frame(&frame).unwrap();
        assert_eq!(decoded.method, "get_status");
    }

    #[test]
    fn oversize_frame_is_rejected() {
        let request = IpcRequest {
            id: "big".to_string(),
            method: "noop".to_string(),
            params: Some(Value::String("x".repeat(MAX_FRAME_BYTES))),
        };
        assert!(matches!(
            encode_frame(&request),
            Err(IpcError::Oversized { .. })
        ));
    }

    #[test]
    fn validation_limits_id_and_method() {
        let long = "m".repeat(MAX_METHOD_CHARS + 1);
        let bad_method = IpcRequest {
            id: "a".to_string(),
            method: long,
            params: None,
        };
        assert!(validate_request(&bad_method).is_err());

        let bad_id = IpcRequest {
            id: String::new(),
            method: "list_processes".to_string(),
            params: None,
        };
        assert!(validate_request(&bad_id).is_err());
    }

    #[test]
    fn error_envelope_shape() {
        let response = IpcResponse::err("req-9", "process not found: web");
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["ok"], false);
        assert_eq!(value["error"], "process not found: web");
        assert!(value.get("result").is_none());
    }
}
