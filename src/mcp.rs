//! MCP server implementation using rmcp.
//!
//! Exposes executor definitions as MCP tools.

use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::ExecutorError;
use crate::service::ExecutorService;

/// Service instantiation the server drives: JSON in, JSON out.
pub type JsonService = ExecutorService<Value, Value>;

/// MCP server for running executor definitions.
#[derive(Clone)]
pub struct ExecutorServer {
    service: Arc<JsonService>,
    shutdown: CancellationToken,
    tool_router: ToolRouter<Self>,
}

/// Parameters for the execute and validate_input tools.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteParams {
    #[schemars(description = "Identifier of the executor definition to run")]
    pub executor_id: String,

    #[schemars(description = "JSON input passed to the executor")]
    pub input: Value,
}

/// Parameters for the build_executor tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct BuildParams {
    #[schemars(description = "Identifier of the executor definition to build")]
    pub executor_id: String,
}

/// Lookup failures are the caller's fault; everything else is a tool error.
fn lookup_error(err: &ExecutorError) -> Option<McpError> {
    match err {
        ExecutorError::Lookup { .. } => Some(McpError::invalid_params(err.to_string(), None)),
        _ => None,
    }
}

fn tool_failure(action: &str, err: &ExecutorError) -> Result<CallToolResult, McpError> {
    if let Some(e) = lookup_error(err) {
        return Err(e);
    }
    error!(error = %err, "{action} failed");
    Ok(CallToolResult::error(vec![Content::text(format!(
        "{action} error: {err}"
    ))]))
}

#[tool_router]
impl ExecutorServer {
    pub fn new(service: Arc<JsonService>) -> Self {
        Self {
            service,
            shutdown: CancellationToken::new(),
            tool_router: Self::tool_router(),
        }
    }

    /// Token cancelled when the server stops; in-flight runs are aborted with it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    #[tool(description = "Run an executor definition in a container with a JSON input")]
    async fn execute(
        &self,
        Parameters(params): Parameters<ExecuteParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(executor = %params.executor_id, "Executing");

        let cancel = self.shutdown.child_token();
        match self
            .service
            .execute(&cancel, &params.executor_id, params.input)
            .await
        {
            Ok(result) => {
                let body = serde_json::to_string_pretty(&result)
                    .map_err(|e| McpError::internal_error(e.to_string(), None))?;
                Ok(CallToolResult::success(vec![Content::text(body)]))
            }
            Err(e) => tool_failure("Execution", &e),
        }
    }

    #[tool(description = "Check a JSON input against an executor's input schema without running it")]
    async fn validate_input(
        &self,
        Parameters(params): Parameters<ExecuteParams>,
    ) -> Result<CallToolResult, McpError> {
        match self
            .service
            .validate_input(&params.executor_id, &params.input)
            .await
        {
            Ok(()) => Ok(CallToolResult::success(vec![Content::text("input is valid")])),
            Err(e) if e.is_validation() => {
                Ok(CallToolResult::error(vec![Content::text(e.to_string())]))
            }
            Err(e) => tool_failure("Validation", &e),
        }
    }

    #[tool(description = "Build (or rebuild) the container image for an executor definition")]
    async fn build_executor(
        &self,
        Parameters(params): Parameters<BuildParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(executor = %params.executor_id, "Building executor image");

        let cancel = self.shutdown.child_token();
        match self
            .service
            .build_executor(&cancel, &params.executor_id)
            .await
        {
            Ok(()) => Ok(CallToolResult::success(vec![Content::text(format!(
                "built image for {}",
                params.executor_id
            ))])),
            Err(ExecutorError::Build { message, output, .. }) => {
                error!(error = %message, "Build failed");
                Ok(CallToolResult::error(vec![Content::text(format!(
                    "Build error: {message}\n--- output ---\n{output}"
                ))]))
            }
            Err(e) => tool_failure("Build", &e),
        }
    }
}

#[tool_handler]
impl ServerHandler for ExecutorServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "executor-engine".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Run user-defined executors in isolated containers.\n\
                 \n\
                 - execute: executor_id and a JSON input; returns output, timing and logs\n\
                 - validate_input: check an input against the executor's schema\n\
                 - build_executor: build the executor's image ahead of the first run"
                    .to_string(),
            ),
        }
    }
}

/// Serve the executor tools over stdio.
pub async fn serve_stdio(service: Arc<JsonService>) -> anyhow::Result<()> {
    let server = ExecutorServer::new(service);
    let shutdown = server.shutdown_token();

    info!("Starting MCP server on stdio");

    let running = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    let result = running
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"));
    shutdown.cancel();
    result?;

    Ok(())
}
