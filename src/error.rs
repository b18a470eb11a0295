//! Error taxonomy for the executor engine.
//!
//! Configuration errors surface at construction, validation errors on either
//! side of the process boundary, and process/protocol/build errors after a
//! container has been launched. Nothing here is retried automatically.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Which side of an executor contract a schema applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaSide {
    Input,
    Output,
}

impl fmt::Display for SchemaSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Bad executor, container or image configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A schema document that is not valid JSON or not a valid JSON Schema.
    #[error("invalid {side} schema: {message}")]
    Schema { side: SchemaSide, message: String },

    #[error("{side} validation failed: {message}")]
    Validation { side: SchemaSide, message: String },

    #[error("{context}: {source}")]
    Json {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("execution cancelled")]
    Cancelled,

    /// Non-zero exit from the runtime process. Stderr is always attached.
    #[error("container execution failed: {status}; stderr: {stderr}")]
    Process { status: String, stderr: String },

    #[error("parse container response: {source} (output length {length}, preview: {preview})")]
    Decode {
        #[source]
        source: serde_json::Error,
        length: usize,
        preview: String,
    },

    #[error("container error: {message} (details={details})")]
    Container { message: String, details: String },

    #[error("container execution failed with ok=false")]
    NotOk,

    /// Build failure; `output` keeps whatever the runtime printed before failing.
    #[error("image build failed for {name}: {message}")]
    Build {
        name: String,
        message: String,
        output: String,
    },

    #[error("execute function: {0}")]
    Function(#[source] anyhow::Error),

    #[error("get executor {id}: {source}")]
    Lookup {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("executor {0} is not active")]
    Inactive(String),
}

impl ExecutorError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) const fn json(context: &'static str, source: serde_json::Error) -> Self {
        Self::Json { context, source }
    }

    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}

pub type Result<T, E = ExecutorError> = std::result::Result<T, E>;
