//! Container wire protocol.
//!
//! The engine writes exactly one request object to the container's stdin and
//! reads exactly one response object from its stdout. Diagnostics belong on
//! stderr.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request sent to the container on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_in: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_out: Option<Value>,
    pub input: Value,
}

/// Response read from the container's stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ContainerErrorBody>,
}

/// Error details reported by the container when `ok` is false.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerErrorBody {
    pub message: String,
    #[serde(default)]
    pub details: String,
}
