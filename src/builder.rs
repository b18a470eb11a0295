//! Container image building.
//!
//! The builder drives the runtime CLI (`docker build`, `docker image
//! inspect`). Its only state is the runtime program to invoke; it is cheap
//! to clone and is injected into every component that needs it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::config::DEFAULT_RUNTIME;
use crate::error::{ExecutorError, Result};
use crate::definition::ExecutorLanguage;
use crate::transport::run_piped;

/// How to build one image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageConfig {
    /// Human-readable name for logs.
    pub name: String,
    pub dockerfile_path: PathBuf,
    /// `None` values are passed as bare `--build-arg KEY`.
    pub build_args: BTreeMap<String, Option<String>>,
    pub tags: Vec<String>,
    /// Stage for multi-stage builds.
    pub target: Option<String>,
    pub no_cache: bool,
}

impl ImageConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ExecutorError::Config("image name is required".into()));
        }
        if self.dockerfile_path.as_os_str().is_empty() {
            return Err(ExecutorError::Config("dockerfile path is required".into()));
        }
        if self.tags.is_empty() {
            return Err(ExecutorError::Config(
                "at least one image tag is required".into(),
            ));
        }
        Ok(())
    }

    /// Build context: the directory holding the Dockerfile.
    fn context_dir(&self) -> &Path {
        match self.dockerfile_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        }
    }

    fn cli_args(&self) -> Vec<String> {
        let mut args = vec![
            "build".to_string(),
            "-f".to_string(),
            self.dockerfile_path.display().to_string(),
        ];
        for (key, value) in &self.build_args {
            args.push("--build-arg".to_string());
            args.push(value.as_ref().map_or_else(|| key.clone(), |v| format!("{key}={v}")));
        }
        if let Some(target) = &self.target {
            args.push("--target".to_string());
            args.push(target.clone());
        }
        if self.no_cache {
            args.push("--no-cache".to_string());
        }
        for tag in &self.tags {
            args.push("-t".to_string());
            args.push(tag.clone());
        }
        args.push(self.context_dir().display().to_string());
        args
    }
}

/// Outcome of one build.
///
/// A failed build is reported in `error` with whatever output the runtime
/// produced; `error` is `None` only when the image was built and tagged.
#[derive(Debug, Clone, Default)]
pub struct BuildResult {
    pub name: String,
    pub tags: Vec<String>,
    pub output: String,
    pub error: Option<String>,
}

impl BuildResult {
    pub const fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Turn a failed build into an error, keeping its output.
    pub fn check(&self) -> Result<()> {
        match &self.error {
            None => Ok(()),
            Some(message) => Err(ExecutorError::Build {
                name: self.name.clone(),
                message: message.clone(),
                output: self.output.clone(),
            }),
        }
    }
}

/// Lowercased `image inspect` stderr fragments meaning "absent" (docker, podman).
const MISSING_IMAGE_MARKERS: &[&str] = &[
    "no such image",
    "no such object",
    "not found",
    "image not known",
];

/// Builds and inspects images through the container runtime CLI.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    runtime: String,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_RUNTIME)
    }
}

impl ImageBuilder {
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
        }
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    /// Build a single image. Never panics or returns early without a result.
    #[instrument(skip_all, fields(name = %config.name, tags = ?config.tags))]
    pub async fn build_image(&self, cancel: &CancellationToken, config: &ImageConfig) -> BuildResult {
        let mut result = BuildResult {
            name: config.name.clone(),
            tags: config.tags.clone(),
            ..BuildResult::default()
        };

        if let Err(e) = config.validate() {
            error!(error = %e, "Image configuration validation failed");
            result.error = Some(e.to_string());
            return result;
        }

        debug!(dockerfile = %config.dockerfile_path.display(), "Starting image build");

        match run_piped(&self.runtime, &config.cli_args(), None, None, cancel).await {
            Ok(out) => {
                result.output = out.combined_lossy();
                if out.status.success() {
                    info!("Image built successfully");
                } else {
                    let message = format!("{} build exited with {}", self.runtime, out.status);
                    error!(error = %message, output = %result.output, "Image build failed");
                    result.error = Some(message);
                }
            }
            Err(e) => {
                error!(error = %e, "Image build failed");
                result.error = Some(e.to_string());
            }
        }

        result
    }

    /// Build every config concurrently, one task per config.
    ///
    /// Results line up with `configs` by index. A failing build never
    /// cancels or blocks the others.
    pub async fn build_images(
        &self,
        cancel: &CancellationToken,
        configs: Vec<ImageConfig>,
    ) -> Vec<BuildResult> {
        let handles: Vec<_> = configs
            .into_iter()
            .map(|config| {
                let builder = self.clone();
                let cancel = cancel.clone();
                let fallback = BuildResult {
                    name: config.name.clone(),
                    tags: config.tags.clone(),
                    ..BuildResult::default()
                };
                let handle =
                    tokio::spawn(async move { builder.build_image(&cancel, &config).await });
                (handle, fallback)
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (handle, mut fallback) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    fallback.error = Some(format!("build task failed: {e}"));
                    fallback
                }
            };
            results.push(result);
        }
        results
    }

    /// Whether `tag` exists in the local image store. Never pulls or builds.
    #[instrument(skip(self, cancel))]
    pub async fn image_exists(&self, cancel: &CancellationToken, tag: &str) -> Result<bool> {
        let args = vec!["image".to_string(), "inspect".to_string(), tag.to_string()];
        let out = run_piped(&self.runtime, &args, None, None, cancel).await?;

        if out.status.success() {
            debug!("Image exists locally");
            return Ok(true);
        }

        let stderr = out.stderr_lossy();
        let lowered = stderr.to_lowercase();
        if MISSING_IMAGE_MARKERS.iter().any(|m| lowered.contains(m)) {
            debug!("Image not found locally");
            return Ok(false);
        }

        error!(stderr = %stderr, "Failed to inspect image");
        Err(ExecutorError::Process {
            status: format!("inspect image {tag}: {}", out.status),
            stderr,
        })
    }
}

/// Base runner image tag for a language.
pub fn runner_tag(language: ExecutorLanguage) -> String {
    format!("runner-{}:latest", language.as_str())
}

/// Canonical Dockerfile for a language's runner under `project_root`.
pub fn runner_dockerfile(project_root: &Path, language: ExecutorLanguage) -> PathBuf {
    project_root
        .join("deployments/containers/runners")
        .join(language.as_str())
        .join("Dockerfile")
}

/// One build configuration per supported runner language.
pub fn runner_configs(project_root: &Path) -> Vec<ImageConfig> {
    ExecutorLanguage::ALL
        .iter()
        .map(|&language| ImageConfig {
            name: format!("{}-runner", language.as_str()),
            dockerfile_path: runner_dockerfile(project_root, language),
            tags: vec![runner_tag(language)],
            ..ImageConfig::default()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str, tags: &[&str]) -> ImageConfig {
        ImageConfig {
            name: name.to_string(),
            dockerfile_path: PathBuf::from("/srv/runners/node/Dockerfile"),
            tags: tags.iter().map(ToString::to_string).collect(),
            ..ImageConfig::default()
        }
    }

    #[test]
    fn validate_requires_fields() {
        assert!(config("", &["a:latest"]).validate().is_err());
        assert!(config("node", &[]).validate().is_err());
        let mut no_dockerfile = config("node", &["a:latest"]);
        no_dockerfile.dockerfile_path = PathBuf::new();
        assert!(no_dockerfile.validate().is_err());
        config("node", &["a:latest"]).validate().unwrap();
    }

    #[test]
    fn build_args_layout() {
        let mut cfg = config("node", &["executor-1:v2", "executor-1:latest"]);
        cfg.build_args
            .insert("ADDITIONAL_PACKAGES".to_string(), Some("lodash zod".to_string()));
        cfg.build_args.insert("HTTP_PROXY".to_string(), None);
        cfg.target = Some("runtime".to_string());
        cfg.no_cache = true;

        assert_eq!(
            cfg.cli_args(),
            vec![
                "build",
                "-f",
                "/srv/runners/node/Dockerfile",
                "--build-arg",
                "ADDITIONAL_PACKAGES=lodash zod",
                "--build-arg",
                "HTTP_PROXY",
                "--target",
                "runtime",
                "--no-cache",
                "-t",
                "executor-1:v2",
                "-t",
                "executor-1:latest",
                "/srv/runners/node",
            ]
        );
    }

    #[test]
    fn runner_configs_cover_every_language() {
        let configs = runner_configs(Path::new("/repo"));
        assert_eq!(configs.len(), ExecutorLanguage::ALL.len());
        for cfg in &configs {
            cfg.validate().unwrap();
            assert!(cfg.dockerfile_path.starts_with("/repo/deployments/containers/runners"));
        }
        assert!(configs
            .iter()
            .any(|c| c.tags == vec!["runner-python:latest".to_string()]));
    }

    #[tokio::test]
    async fn invalid_config_is_reported_in_result() {
        let builder = ImageBuilder::new("/definitely/not/a/runtime");
        let result = builder
            .build_image(&CancellationToken::new(), &config("node", &[]))
            .await;
        assert!(!result.is_success());
        assert!(result.error.as_deref().unwrap().contains("tag"));
        assert!(matches!(result.check(), Err(ExecutorError::Build { .. })));
    }

    #[tokio::test]
    async fn build_images_keeps_input_order() {
        let builder = ImageBuilder::new("/definitely/not/a/runtime");
        let configs = vec![
            config("first", &["a:1"]),
            config("", &["b:1"]),
            config("third", &[]),
        ];
        let results = builder
            .build_images(&CancellationToken::new(), configs)
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].name, "first");
        assert_eq!(results[1].name, "");
        assert_eq!(results[2].name, "third");
        // Every result is either a success with tags or carries an error.
        for r in &results {
            assert!(r.error.is_some() || !r.tags.is_empty());
        }
    }

    #[cfg(unix)]
    mod fake_runtime {
        use super::*;
        use crate::test_support::fake_runtime as script;

        #[tokio::test]
        async fn successful_build_captures_output() {
            let dir = tempfile::tempdir().unwrap();
            let runtime = script(dir.path(), r#"echo "building $*"; echo "step 1/1" >&2"#);
            let result = ImageBuilder::new(runtime)
                .build_image(&CancellationToken::new(), &config("node", &["n:1"]))
                .await;
            assert!(result.is_success(), "{:?}", result.error);
            assert!(result.output.contains("building build -f"));
            assert!(result.output.contains("-t n:1"));
            assert!(result.output.contains("step 1/1"));
            assert_eq!(result.tags, vec!["n:1".to_string()]);
        }

        #[tokio::test]
        async fn failed_build_keeps_partial_output() {
            let dir = tempfile::tempdir().unwrap();
            let runtime = script(dir.path(), r#"echo "step 1/3"; echo "RUN failed" >&2; exit 1"#);
            let result = ImageBuilder::new(runtime)
                .build_image(&CancellationToken::new(), &config("node", &["n:1"]))
                .await;
            assert!(!result.is_success());
            assert!(result.output.contains("step 1/3"));
            match result.check() {
                Err(ExecutorError::Build { output, .. }) => assert!(output.contains("RUN failed")),
                other => panic!("expected build error, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn image_exists_maps_inspect_results() {
            let dir = tempfile::tempdir().unwrap();
            let runtime = script(
                dir.path(),
                r#"case "$3" in
  present:*) echo '[{}]' ;;
  broken:*) echo 'Cannot connect to the daemon' >&2; exit 1 ;;
  *) echo "Error: No such image: $3" >&2; exit 1 ;;
esac"#,
            );
            let builder = ImageBuilder::new(runtime);
            let cancel = CancellationToken::new();
            assert!(builder.image_exists(&cancel, "present:latest").await.unwrap());
            assert!(!builder.image_exists(&cancel, "absent:latest").await.unwrap());
            assert!(builder.image_exists(&cancel, "broken:latest").await.is_err());
        }

        #[tokio::test]
        async fn image_exists_understands_podman_missing_image() {
            let dir = tempfile::tempdir().unwrap();
            let runtime = script(dir.path(), r#"echo "Error: $3: image not known" >&2; exit 125"#);
            let exists = ImageBuilder::new(runtime)
                .image_exists(&CancellationToken::new(), "executor-x:v1")
                .await
                .unwrap();
            assert!(!exists);
        }
    }

    #[tokio::test]
    async fn image_exists_false_for_absent_tag_with_docker() {
        if std::env::var("EXECUTOR_DOCKER_TEST").is_err() {
            return;
        }
        let exists = ImageBuilder::default()
            .image_exists(
                &CancellationToken::new(),
                "executor-engine/nonexistent-image-12345:latest",
            )
            .await
            .unwrap();
        assert!(!exists);
    }
}
