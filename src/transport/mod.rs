//! Transport between the engine and a container process.
//!
//! `stdio_pipe` owns process launch and the concurrent stdout/stderr drain;
//! this module turns raw stdout into a protocol response.

pub mod protocol;
pub mod stdio_pipe;

pub use protocol::{ContainerErrorBody, ContainerRequest, ContainerResponse};
pub use stdio_pipe::{run_piped, PipedOutput};

use serde_json::Value;

use crate::error::{ExecutorError, Result};

/// Outputs longer than this are previewed as head + tail.
const PREVIEW_LIMIT: usize = 500;
/// Bytes kept from each end of a long output.
const PREVIEW_EDGE: usize = 200;

/// Encode a request as the full stdin payload.
pub fn encode_request(req: &ContainerRequest) -> Result<Vec<u8>> {
    serde_json::to_vec(req).map_err(|e| ExecutorError::json("marshal container request", e))
}

/// Decode stdout into the response's output value.
///
/// `ok=false` becomes a container error; malformed JSON becomes a decode
/// error carrying a bounded preview of what the container printed.
pub fn decode_response(raw: &[u8]) -> Result<Value> {
    let response: ContainerResponse =
        serde_json::from_slice(raw).map_err(|source| ExecutorError::Decode {
            source,
            length: raw.len(),
            preview: preview(raw),
        })?;

    if !response.ok {
        return Err(response.error.map_or(ExecutorError::NotOk, |e| {
            ExecutorError::Container {
                message: e.message,
                details: e.details,
            }
        }));
    }

    Ok(response.output.unwrap_or(Value::Null))
}

/// Head-and-tail preview of raw output for diagnostics.
pub fn preview(raw: &[u8]) -> String {
    if raw.len() <= PREVIEW_LIMIT {
        return String::from_utf8_lossy(raw).into_owned();
    }
    let head = String::from_utf8_lossy(&raw[..PREVIEW_EDGE]);
    let tail = String::from_utf8_lossy(&raw[raw.len() - PREVIEW_EDGE..]);
    format!(
        "{head}... [truncated {} bytes] ...{tail}",
        raw.len() - 2 * PREVIEW_EDGE
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_omits_absent_schemas() {
        let req = ContainerRequest {
            schema_in: None,
            schema_out: None,
            input: json!({"value": 3}),
        };
        let bytes = encode_request(&req).unwrap();
        assert_eq!(bytes, br#"{"input":{"value":3}}"#);
    }

    #[test]
    fn request_includes_schemas() {
        let req = ContainerRequest {
            schema_in: Some(json!({"type": "object"})),
            schema_out: Some(json!({"type": "object"})),
            input: json!({}),
        };
        let json = String::from_utf8(encode_request(&req).unwrap()).unwrap();
        assert!(json.contains("\"schema_in\""));
        assert!(json.contains("\"schema_out\""));
    }

    #[test]
    fn decode_ok_response() {
        let out = decode_response(br#"{"ok":true,"output":{"doubled":4}}"#).unwrap();
        assert_eq!(out, json!({"doubled": 4}));
    }

    #[test]
    fn decode_container_error() {
        let err = decode_response(
            br#"{"ok":false,"error":{"message":"bad input","details":"value missing"}}"#,
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "container error: bad input (details=value missing)"
        );
    }

    #[test]
    fn decode_ok_false_without_body() {
        let err = decode_response(br#"{"ok":false}"#).unwrap_err();
        assert!(matches!(err, ExecutorError::NotOk));
    }

    #[test]
    fn decode_malformed_reports_length() {
        let raw = b"Traceback (most recent call last)";
        let err = decode_response(raw).unwrap_err();
        match err {
            ExecutorError::Decode {
                length, preview, ..
            } => {
                assert_eq!(length, raw.len());
                assert!(preview.starts_with("Traceback"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn preview_truncates_long_output() {
        let raw = vec![b'x'; 2000];
        let p = preview(&raw);
        assert!(p.contains("[truncated 1600 bytes]"));
        assert!(p.len() < 500);
    }
}
