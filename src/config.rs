//! Engine and executor configuration.
//!
//! `EngineConfig` is the process-level configuration read from the
//! environment. `ExecutorConfig` and `ContainerConfig` describe a single
//! executor instance and are normally built in code.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::builder::ImageConfig;

/// Container runtime CLI used when nothing else is configured.
pub const DEFAULT_RUNTIME: &str = "docker";

/// Default container timeout when `ExecutorConfig::timeout` is zero.
pub const DEFAULT_CONTAINER_TIMEOUT: Duration = Duration::from_secs(30);

/// Default container memory limit (256 MiB).
pub const DEFAULT_MEMORY_BYTES: i64 = 256 * 1024 * 1024;

/// Default relative CPU weight.
pub const DEFAULT_CPU_SHARES: i64 = 512;

/// Top-level configuration for the engine binary.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Container runtime CLI (`docker`, `podman`, or an absolute path).
    #[serde(default = "default_runtime")]
    pub runtime: String,

    /// Root that runner Dockerfiles are resolved against.
    #[serde(default = "default_project_root")]
    pub project_root: PathBuf,

    /// JSON file holding executor definitions (optional).
    #[serde(default)]
    pub definitions: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            project_root: default_project_root(),
            definitions: None,
        }
    }
}

fn default_runtime() -> String {
    DEFAULT_RUNTIME.into()
}

fn default_project_root() -> PathBuf {
    ".".into()
}

impl EngineConfig {
    /// Load configuration from the environment.
    ///
    /// `EXECUTOR_ENGINE_CONFIG` may hold the whole configuration as JSON;
    /// `EXECUTOR_RUNTIME` and `EXECUTOR_PROJECT_ROOT` override single fields.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("EXECUTOR_ENGINE_CONFIG") {
            Ok(json) => Self::from_json(&json).context("Failed to parse EXECUTOR_ENGINE_CONFIG")?,
            Err(_) => Self::default(),
        };

        if let Ok(runtime) = std::env::var("EXECUTOR_RUNTIME") {
            if !runtime.trim().is_empty() {
                config.runtime = runtime;
            }
        }
        if let Ok(root) = std::env::var("EXECUTOR_PROJECT_ROOT") {
            config.project_root = PathBuf::from(root);
        }

        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }
}

/// Settings shared by every executor.
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    /// Execution bound. Zero means "use the executor's default".
    pub timeout: Duration,

    /// Raw JSON Schema for the input side.
    pub schema_in: Option<String>,

    /// Raw JSON Schema for the output side.
    pub schema_out: Option<String>,
}

impl ExecutorConfig {
    /// Input schema, treating blank documents as absent.
    pub fn input_schema(&self) -> Option<&str> {
        non_blank(self.schema_in.as_deref())
    }

    /// Output schema, treating blank documents as absent.
    pub fn output_schema(&self) -> Option<&str> {
        non_blank(self.schema_out.as_deref())
    }
}

fn non_blank(doc: Option<&str>) -> Option<&str> {
    doc.filter(|d| !d.trim().is_empty())
}

/// Configuration for the in-process executor.
pub type LocalConfig = ExecutorConfig;

/// Host-to-container bind mount for a single invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    /// Render as a `-v` argument: `source:target[:ro]`.
    pub fn to_arg(&self) -> String {
        let mut arg = format!("{}:{}", self.source.display(), self.target);
        if self.read_only {
            arg.push_str(":ro");
        }
        arg
    }
}

/// Configuration for a container-backed executor.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    pub base: ExecutorConfig,

    /// Image reference to run (required).
    pub image: String,
    /// Optional command override, appended after the image.
    pub cmd: Vec<String>,
    pub work_dir: Option<String>,
    /// `KEY=VALUE` entries passed with `-e`.
    pub env: Vec<String>,
    pub mounts: Vec<Mount>,

    /// Relative CPU weight. Zero means default.
    pub cpu_shares: i64,
    /// Memory limit in bytes. Zero means default.
    pub memory_bytes: i64,

    pub disable_net: bool,
    pub read_only_fs: bool,
    /// User to run as, e.g. `1000:1000`.
    pub user: Option<String>,

    /// Build the image on demand before running.
    pub auto_build: bool,
    /// Required when `auto_build` is set.
    pub build_config: Option<ImageConfig>,
    /// Rebuild even if the image already exists.
    pub force_build: bool,

    /// Runtime CLI override; falls back to the builder's runtime, then `docker`.
    pub runtime: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_engine_config_defaults() {
        let config = EngineConfig::from_json("{}").unwrap();
        assert_eq!(config.runtime, "docker");
        assert_eq!(config.project_root, PathBuf::from("."));
        assert!(config.definitions.is_none());
    }

    #[test]
    fn parse_engine_config_full() {
        let json = r#"{
            "runtime": "podman",
            "project_root": "/srv/platform",
            "definitions": "/etc/executors.json"
        }"#;
        let config = EngineConfig::from_json(json).unwrap();
        assert_eq!(config.runtime, "podman");
        assert_eq!(config.project_root, PathBuf::from("/srv/platform"));
        assert_eq!(
            config.definitions,
            Some(PathBuf::from("/etc/executors.json"))
        );
    }

    #[test]
    fn parse_engine_config_rejects_garbage() {
        assert!(EngineConfig::from_json("not json").is_err());
    }

    #[test]
    fn blank_schemas_are_absent() {
        let config = ExecutorConfig {
            timeout: Duration::ZERO,
            schema_in: Some("   ".to_string()),
            schema_out: Some(r#"{"type":"object"}"#.to_string()),
        };
        assert!(config.input_schema().is_none());
        assert_eq!(config.output_schema(), Some(r#"{"type":"object"}"#));
    }

    #[test]
    fn mount_arg_format() {
        let rw = Mount {
            source: PathBuf::from("/tmp/a"),
            target: "/app/a".to_string(),
            read_only: false,
        };
        let ro = Mount {
            read_only: true,
            ..rw.clone()
        };
        assert_eq!(rw.to_arg(), "/tmp/a:/app/a");
        assert_eq!(ro.to_arg(), "/tmp/a:/app/a:ro");
    }
}
