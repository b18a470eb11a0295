//! executor-engine library
//!
//! This crate runs user-defined executors:
//! - `Executor` trait with in-process and container implementations
//! - JSON Schema validation of inputs and outputs
//! - Image building through the container runtime CLI
//! - `ExecutorService` for persisted definitions, and an MCP server over it

pub mod builder;
pub mod config;
pub mod definition;
pub mod error;
pub mod executor;
pub mod mcp;
pub mod schema;
pub mod service;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{ExecutorError, Result};
pub use executor::{ContainerExecutor, Executor, LocalExecutor};
pub use service::{ExecuteResult, ExecutorService};
