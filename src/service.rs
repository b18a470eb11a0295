//! Runs persisted executor definitions in containers.
//!
//! For each call the service looks up the definition, writes its code to a
//! private temp dir, and hands a `ContainerExecutor` the mounts, limits and
//! schemas the definition asks for. The per-definition image is built on
//! first use and reused until the definition's version changes.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::builder::{runner_dockerfile, ImageBuilder, ImageConfig};
use crate::config::{ContainerConfig, ExecutorConfig, Mount};
use crate::definition::{ExecutorDefinition, ExecutorRepository, ExtraFile};
use crate::error::{ExecutorError, Result};
use crate::executor::ContainerExecutor;
use crate::schema::SchemaValidator;

const MIB: i64 = 1024 * 1024;

/// Output of one definition run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteResult<B> {
    pub output: B,
    /// Wall-clock time of the container call, build included.
    pub execution_time_ms: u64,
    /// Whatever the container wrote to stderr.
    pub logs: String,
}

pub struct ExecutorService<A, B> {
    repo: Arc<dyn ExecutorRepository>,
    builder: ImageBuilder,
    project_root: PathBuf,
    _types: PhantomData<fn(A) -> B>,
}

impl<A, B> std::fmt::Debug for ExecutorService<A, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorService")
            .field("builder", &self.builder)
            .field("project_root", &self.project_root)
            .finish_non_exhaustive()
    }
}

impl<A, B> ExecutorService<A, B> {
    /// `project_root` is where runner Dockerfiles are resolved from.
    pub fn new(
        repo: Arc<dyn ExecutorRepository>,
        builder: ImageBuilder,
        project_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            repo,
            builder,
            project_root: project_root.into(),
            _types: PhantomData,
        }
    }

    pub const fn builder(&self) -> &ImageBuilder {
        &self.builder
    }

    pub async fn get_executor(&self, id: &str) -> Result<ExecutorDefinition> {
        self.repo
            .get(id)
            .await
            .map_err(|source| ExecutorError::Lookup {
                id: id.to_string(),
                source,
            })
    }

    /// Build the definition's image. Nothing is written to disk.
    #[instrument(skip(self, cancel))]
    pub async fn build_executor(&self, cancel: &CancellationToken, id: &str) -> Result<()> {
        let def = self.get_executor(id).await?;
        let image = self.image_config(&def);
        self.builder.build_image(cancel, &image).await.check()?;
        info!(tag = %def.image_tag(), "Executor image built");
        Ok(())
    }

    fn image_config(&self, def: &ExecutorDefinition) -> ImageConfig {
        let packages = def
            .language
            .additional_packages(def.dependencies.as_deref());
        ImageConfig {
            name: def.image_name(),
            dockerfile_path: runner_dockerfile(&self.project_root, def.language),
            build_args: BTreeMap::from([("ADDITIONAL_PACKAGES".to_string(), Some(packages))]),
            tags: vec![def.image_tag()],
            ..ImageConfig::default()
        }
    }
}

impl<A, B> ExecutorService<A, B>
where
    A: Serialize + Send,
    B: DeserializeOwned,
{
    /// Run the definition `id` against `input`.
    #[instrument(skip(self, cancel, input))]
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        id: &str,
        input: A,
    ) -> Result<ExecuteResult<B>> {
        let def = self.get_executor(id).await?;
        if !def.is_active {
            return Err(ExecutorError::Inactive(def.id));
        }

        // Removed when dropped, on every exit path below.
        let workdir = tempfile::Builder::new()
            .prefix(&format!("executor-{}-", def.id))
            .tempdir()
            .map_err(|e| ExecutorError::io("create temp dir", e))?;
        let mounts = materialize(&def, &workdir).await?;

        let config = ContainerConfig {
            base: ExecutorConfig {
                timeout: Duration::from_secs(def.timeout),
                schema_in: def.schema_in.clone(),
                schema_out: def.schema_out.clone(),
            },
            image: def.image_tag(),
            env: def.parsed_env(),
            mounts,
            cpu_shares: def.cpu_shares,
            memory_bytes: def.memory_mb.saturating_mul(MIB),
            auto_build: true,
            force_build: false,
            build_config: Some(self.image_config(&def)),
            runtime: Some(self.builder.runtime().to_string()),
            ..ContainerConfig::default()
        };
        let executor = ContainerExecutor::<A, B>::new(config, Some(self.builder.clone()))?;

        let start = Instant::now();
        let result = executor.execute_detailed(cancel, input).await;
        let elapsed = start.elapsed();
        let detailed = result?;

        let execution_time_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        debug!(execution_time_ms, "Executor finished");

        Ok(ExecuteResult {
            output: detailed.output,
            execution_time_ms,
            logs: detailed.stderr,
        })
    }

    /// Check `input` against the definition's input schema without running it.
    pub async fn validate_input(&self, id: &str, input: &A) -> Result<()> {
        let def = self.get_executor(id).await?;
        let Some(schema) = def.schema_in.as_deref().filter(|s| !s.trim().is_empty()) else {
            return Ok(());
        };
        let value =
            serde_json::to_value(input).map_err(|e| ExecutorError::json("marshal input", e))?;
        SchemaValidator::new(Some(schema), None)?.validate_input(&value)
    }
}

impl<A, B> ExecutorService<A, B>
where
    B: Serialize,
{
    /// Check `output` against the definition's output schema.
    pub async fn validate_output(&self, id: &str, output: &B) -> Result<()> {
        let def = self.get_executor(id).await?;
        let Some(schema) = def.schema_out.as_deref().filter(|s| !s.trim().is_empty()) else {
            return Ok(());
        };
        let value =
            serde_json::to_value(output).map_err(|e| ExecutorError::json("marshal output", e))?;
        SchemaValidator::new(None, Some(schema))?.validate_output(&value)
    }
}

/// Write the code and extra files into `workdir` and return their mounts.
async fn materialize(def: &ExecutorDefinition, workdir: &TempDir) -> Result<Vec<Mount>> {
    let execute_file = def.language.execute_file_name();
    let code_path = workdir.path().join(execute_file);
    tokio::fs::write(&code_path, &def.execute_code)
        .await
        .map_err(|e| ExecutorError::io(format!("write {execute_file}"), e))?;

    let mut mounts = vec![Mount {
        source: code_path,
        target: format!("/app/src/{execute_file}"),
        read_only: true,
    }];

    for ExtraFile { path, content } in def.parsed_extra_files() {
        let relative = safe_relative(&path)?;
        let host_path = workdir.path().join(relative);
        if let Some(parent) = host_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ExecutorError::io(format!("create directory for {path}"), e))?;
        }
        tokio::fs::write(&host_path, content)
            .await
            .map_err(|e| ExecutorError::io(format!("write extra file {path}"), e))?;

        mounts.push(Mount {
            source: host_path,
            target: format!("/app/{path}"),
            read_only: true,
        });
    }

    Ok(mounts)
}

/// Extra files must stay inside the temp dir.
fn safe_relative(path: &str) -> Result<&Path> {
    let candidate = Path::new(path);
    let escapes = candidate
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if path.trim().is_empty() || escapes {
        return Err(ExecutorError::Config(format!(
            "extra file path {path:?} must be relative and stay inside the executor directory"
        )));
    }
    Ok(candidate)
}
