//! In-process executor for trusted, compiled-in logic.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Executor;
use crate::config::LocalConfig;
use crate::error::{ExecutorError, Result};
use crate::schema::SchemaValidator;

/// Boxed function run by a `LocalExecutor`.
///
/// The token it receives is cancelled when the caller cancels or the
/// executor's timeout fires.
pub type ExecuteFn<A, B> =
    Arc<dyn Fn(CancellationToken, A) -> BoxFuture<'static, anyhow::Result<B>> + Send + Sync>;

/// Box an async closure into an `ExecuteFn`.
pub fn execute_fn<A, B, F, Fut>(f: F) -> ExecuteFn<A, B>
where
    F: Fn(CancellationToken, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<B>> + Send + 'static,
{
    Arc::new(move |cancel, input| f(cancel, input).boxed())
}

pub struct LocalExecutor<A, B> {
    config: LocalConfig,
    validator: Option<SchemaValidator>,
    func: ExecuteFn<A, B>,
}

impl<A, B> LocalExecutor<A, B> {
    /// Fails if `func` is missing or a configured schema does not compile.
    pub fn new(config: LocalConfig, func: Option<ExecuteFn<A, B>>) -> Result<Self> {
        let func = func.ok_or_else(|| {
            ExecutorError::Config("local executor requires an execute function".into())
        })?;

        let validator = if config.input_schema().is_some() || config.output_schema().is_some() {
            Some(SchemaValidator::new(
                config.input_schema(),
                config.output_schema(),
            )?)
        } else {
            None
        };

        Ok(Self {
            config,
            validator,
            func,
        })
    }
}

#[async_trait]
impl<A, B> Executor<A, B> for LocalExecutor<A, B>
where
    A: Serialize + Send + 'static,
    B: Serialize + Send + 'static,
{
    async fn execute(&self, cancel: &CancellationToken, input: A) -> Result<B> {
        if let Some(validator) = &self.validator {
            let value = serde_json::to_value(&input)
                .map_err(|e| ExecutorError::json("marshal input for validation", e))?;
            validator.validate_input(&value)?;
        }

        let call_token = cancel.child_token();
        let call = (self.func)(call_token.clone(), input);

        let timeout = self.config.timeout;
        let deadline = async {
            if timeout.is_zero() {
                std::future::pending::<()>().await;
            } else {
                tokio::time::sleep(timeout).await;
            }
        };

        // Cancellation wins over a function that returns in the same poll.
        let output = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(ExecutorError::Cancelled);
            }
            () = deadline => {
                call_token.cancel();
                debug!(timeout = ?timeout, "Local execution timed out");
                return Err(ExecutorError::Timeout(timeout));
            }
            result = call => result.map_err(ExecutorError::Function)?,
        };

        if let Some(validator) = &self.validator {
            let value = serde_json::to_value(&output)
                .map_err(|e| ExecutorError::json("marshal output for validation", e))?;
            validator.validate_output(&value)?;
        }

        Ok(output)
    }
}
