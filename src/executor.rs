//! The `Executor` capability and its implementations.
//!
//! An executor turns a typed input into a typed output. `LocalExecutor`
//! runs trusted logic in-process; `ContainerExecutor` runs a runner image
//! and talks to it over the stdin/stdout JSON protocol.

mod container;
mod local;

pub use container::{ContainerExecutor, ContainerOutput};
pub use local::{execute_fn, ExecuteFn, LocalExecutor};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Transform an `A` into a `B`.
///
/// Implementations hold no per-call state and are safe to share across
/// tasks. Cancelling `cancel` aborts the call; each executor also applies
/// its own configured timeout.
#[async_trait]
pub trait Executor<A, B>: Send + Sync
where
    A: Send + 'static,
    B: Send + 'static,
{
    async fn execute(&self, cancel: &CancellationToken, input: A) -> Result<B>;
}
