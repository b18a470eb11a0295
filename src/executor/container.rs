//! Container-backed executor.
//!
//! Each call launches one `<runtime> run --rm -i` process, writes a JSON
//! request to its stdin and decodes a JSON response from its stdout.

use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};

use super::Executor;
use crate::builder::ImageBuilder;
use crate::config::{
    ContainerConfig, DEFAULT_CONTAINER_TIMEOUT, DEFAULT_CPU_SHARES, DEFAULT_MEMORY_BYTES,
    DEFAULT_RUNTIME,
};
use crate::error::{ExecutorError, Result};
use crate::schema::SchemaValidator;
use crate::transport::{decode_response, encode_request, run_piped, ContainerRequest};

/// Outputs at or above this size are logged as large.
const LARGE_OUTPUT_BYTES: usize = 32 * 1024;

/// Typed output plus whatever the container wrote to stderr.
#[derive(Debug, Clone)]
pub struct ContainerOutput<B> {
    pub output: B,
    pub stderr: String,
}

pub struct ContainerExecutor<A, B> {
    config: ContainerConfig,
    runtime: String,
    validator: Option<SchemaValidator>,
    builder: Option<ImageBuilder>,
    _types: PhantomData<fn(A) -> B>,
}

impl<A, B> std::fmt::Debug for ContainerExecutor<A, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerExecutor")
            .field("image", &self.config.image)
            .field("runtime", &self.runtime)
            .field("validator", &self.validator)
            .finish_non_exhaustive()
    }
}

impl<A, B> ContainerExecutor<A, B> {
    /// Validate `config`, apply defaults, and compile schemas.
    ///
    /// Auto-build requires both a builder and a build config; this is
    /// checked here rather than on the first call.
    pub fn new(mut config: ContainerConfig, builder: Option<ImageBuilder>) -> Result<Self> {
        if config.image.trim().is_empty() {
            return Err(ExecutorError::Config("container image is required".into()));
        }
        if config.auto_build {
            if builder.is_none() {
                return Err(ExecutorError::Config(
                    "builder is required when auto_build is enabled".into(),
                ));
            }
            if config.build_config.is_none() {
                return Err(ExecutorError::Config(
                    "build_config is required when auto_build is enabled".into(),
                ));
            }
        }

        if config.base.timeout.is_zero() {
            config.base.timeout = DEFAULT_CONTAINER_TIMEOUT;
        }
        if config.memory_bytes <= 0 {
            config.memory_bytes = DEFAULT_MEMORY_BYTES;
        }
        if config.cpu_shares <= 0 {
            config.cpu_shares = DEFAULT_CPU_SHARES;
        }

        let validator = match (config.base.input_schema(), config.base.output_schema()) {
            (Some(schema_in), Some(schema_out)) => {
                Some(SchemaValidator::new(Some(schema_in), Some(schema_out))?)
            }
            _ => None,
        };

        let runtime = config
            .runtime
            .clone()
            .or_else(|| builder.as_ref().map(|b| b.runtime().to_string()))
            .unwrap_or_else(|| DEFAULT_RUNTIME.to_string());

        Ok(Self {
            config,
            runtime,
            validator,
            builder,
            _types: PhantomData,
        })
    }

    /// Effective configuration, defaults applied.
    pub const fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Runtime arguments for one `run`, in the order the runtime expects.
    pub fn run_args(&self) -> Vec<String> {
        let c = &self.config;
        let mut args: Vec<String> = vec!["run".into(), "--rm".into(), "-i".into()];

        if c.disable_net {
            args.extend(["--network".into(), "none".into()]);
        }
        if c.read_only_fs {
            args.push("--read-only".into());
        }
        if let Some(user) = c.user.as_deref().filter(|u| !u.is_empty()) {
            args.extend(["--user".into(), user.to_string()]);
        }
        if c.memory_bytes > 0 {
            args.extend(["--memory".into(), c.memory_bytes.to_string()]);
        }
        if c.cpu_shares > 0 {
            args.extend(["--cpu-shares".into(), c.cpu_shares.to_string()]);
        }
        if let Some(dir) = c.work_dir.as_deref().filter(|d| !d.is_empty()) {
            args.extend(["-w".into(), dir.to_string()]);
        }
        for var in &c.env {
            args.extend(["-e".into(), var.clone()]);
        }
        for mount in &c.mounts {
            args.extend(["-v".into(), mount.to_arg()]);
        }

        args.push(c.image.clone());
        args.extend(c.cmd.iter().cloned());
        args
    }

    /// Build the image first when auto-build is on and it is missing (or forced).
    async fn ensure_image(&self, cancel: &CancellationToken) -> Result<()> {
        let (Some(builder), Some(build_config)) = (&self.builder, &self.config.build_config)
        else {
            return Ok(());
        };
        if !self.config.auto_build {
            return Ok(());
        }

        let image = &self.config.image;
        let should_build = self.config.force_build || {
            let exists = builder.image_exists(cancel, image).await.map_err(|e| {
                error!(image = %image, error = %e, "Failed to check image existence");
                e
            })?;
            !exists
        };

        if !should_build {
            debug!(image = %image, "Using existing container image");
            return Ok(());
        }

        debug!(image = %image, force = self.config.force_build, "Building container image");
        let result = builder.build_image(cancel, build_config).await;
        if let Err(e) = result.check() {
            error!(image = %image, error = %e, output = %result.output, "Container image build failed");
            return Err(e);
        }
        debug!(image = %image, "Container image built");
        Ok(())
    }
}

impl<A, B> ContainerExecutor<A, B>
where
    A: Serialize + Send,
    B: DeserializeOwned,
{
    /// Run one container and return its typed output along with stderr.
    #[instrument(skip_all, fields(image = %self.config.image, timeout = ?self.config.base.timeout))]
    pub async fn execute_detailed(
        &self,
        cancel: &CancellationToken,
        input: A,
    ) -> Result<ContainerOutput<B>> {
        self.ensure_image(cancel).await?;

        let input = serde_json::to_value(&input)
            .map_err(|e| ExecutorError::json("marshal input", e))?;
        if let Some(validator) = &self.validator {
            validator.validate_input(&input)?;
        }

        let request = ContainerRequest {
            schema_in: self.validator.as_ref().and_then(|v| v.input_schema().cloned()),
            schema_out: self.validator.as_ref().and_then(|v| v.output_schema().cloned()),
            input,
        };
        let payload = encode_request(&request)?;

        let args = self.run_args();
        debug!(args = ?args, "Running container");

        let timeout = self.config.base.timeout;
        let out = run_piped(&self.runtime, &args, Some(payload), Some(timeout), cancel)
            .await
            .map_err(|e| {
                error!(error = %e, "Container execution did not complete");
                e
            })?;

        let stderr = out.stderr_lossy();
        if out.stdout.len() >= LARGE_OUTPUT_BYTES {
            debug!(stdout_size = out.stdout.len(), stderr_size = out.stderr.len(), "Large container output received");
        }
        if !stderr.is_empty() {
            debug!(stderr = %stderr, "Container stderr output");
        }

        if !out.status.success() {
            error!(status = %out.status, stderr = %stderr, "Container execution failed");
            return Err(ExecutorError::Process {
                status: out.status.to_string(),
                stderr,
            });
        }

        let raw_output = decode_response(&out.stdout).map_err(|e| {
            error!(error = %e, output_length = out.stdout.len(), "Failed to parse container response");
            e
        })?;

        if let Some(validator) = &self.validator {
            validator.validate_output(&raw_output)?;
        }

        let output = serde_json::from_value(raw_output)
            .map_err(|e| ExecutorError::json("unmarshal output", e))?;

        Ok(ContainerOutput { output, stderr })
    }
}

#[async_trait]
impl<A, B> Executor<A, B> for ContainerExecutor<A, B>
where
    A: Serialize + Send + 'static,
    B: DeserializeOwned + Send + 'static,
{
    async fn execute(&self, cancel: &CancellationToken, input: A) -> Result<B> {
        self.execute_detailed(cancel, input).await.map(|o| o.output)
    }
}
