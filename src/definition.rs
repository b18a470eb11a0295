//! Executor definitions and the repository they are read from.
//!
//! Definitions are owned by a persistence collaborator. The engine only
//! reads them; versioning and storage happen elsewhere.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Languages that have a runner image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorLanguage {
    Nodejs,
    Python,
    Go,
}

impl ExecutorLanguage {
    pub const ALL: [Self; 3] = [Self::Nodejs, Self::Python, Self::Go];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Nodejs => "node",
            Self::Python => "python",
            Self::Go => "go",
        }
    }

    /// File name the runner image expects the user code under.
    pub const fn execute_file_name(self) -> &'static str {
        match self {
            Self::Nodejs => "execute.ts",
            Self::Python => "execute.py",
            Self::Go => "execute.go",
        }
    }

    /// Turn a dependency manifest into the `ADDITIONAL_PACKAGES` build arg.
    ///
    /// Node reads dependency names from a `package.json`, Python keeps the
    /// non-blank, non-comment lines of a requirements list. Go has no
    /// resolution strategy yet and yields nothing. Unparseable manifests
    /// yield an empty list instead of failing the build.
    pub fn additional_packages(self, manifest: Option<&str>) -> String {
        let Some(manifest) = manifest else {
            return String::new();
        };

        match self {
            Self::Nodejs => {
                let parsed: serde_json::Value = match serde_json::from_str(manifest) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "Ignoring unparseable package manifest");
                        return String::new();
                    }
                };
                parsed
                    .get("dependencies")
                    .and_then(serde_json::Value::as_object)
                    .map(|deps| deps.keys().cloned().collect::<Vec<_>>().join(" "))
                    .unwrap_or_default()
            }
            Self::Python => manifest
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .collect::<Vec<_>>()
                .join(" "),
            Self::Go => String::new(),
        }
    }
}

/// A supporting file shipped alongside the execute code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraFile {
    pub path: String,
    pub content: String,
}

/// A persisted, user-supplied executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorDefinition {
    pub id: String,
    pub language: ExecutorLanguage,
    pub execute_code: String,
    /// JSON array of `{path, content}` objects.
    #[serde(default)]
    pub extra_files: Option<String>,
    /// `package.json` for Node, a requirements list for Python.
    #[serde(default)]
    pub dependencies: Option<String>,
    #[serde(default)]
    pub schema_in: Option<String>,
    #[serde(default)]
    pub schema_out: Option<String>,
    /// JSON array of `KEY=VALUE` strings.
    #[serde(default)]
    pub env: Option<String>,
    /// Seconds. Zero means the container default.
    #[serde(default)]
    pub timeout: u64,
    #[serde(default)]
    pub memory_mb: i64,
    #[serde(default)]
    pub cpu_shares: i64,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

const fn default_version() -> u32 {
    1
}

const fn default_active() -> bool {
    true
}

impl ExecutorDefinition {
    /// Versioned tag for this definition's image. A version bump yields a
    /// new tag and therefore a rebuild.
    pub fn image_tag(&self) -> String {
        format!("executor-{}:v{}", self.id, self.version)
    }

    pub fn image_name(&self) -> String {
        format!("executor-{}", self.id)
    }

    pub fn parsed_extra_files(&self) -> Vec<ExtraFile> {
        parse_json_list(self.extra_files.as_deref(), "extra_files", &self.id)
    }

    pub fn parsed_env(&self) -> Vec<String> {
        parse_json_list(self.env.as_deref(), "env", &self.id)
    }
}

/// Lenient parse of a JSON array field; malformed data is logged and dropped.
fn parse_json_list<T: serde::de::DeserializeOwned>(
    raw: Option<&str>,
    field: &str,
    id: &str,
) -> Vec<T> {
    let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
        return Vec::new();
    };
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!(executor = %id, field = %field, error = %e, "Ignoring malformed definition field");
        Vec::new()
    })
}

/// Lookup of executor definitions, supplied by persistence.
#[async_trait]
pub trait ExecutorRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<ExecutorDefinition>;
}

/// Repository backed by a map, optionally loaded from a JSON file.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    definitions: RwLock<HashMap<String, ExecutorDefinition>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON array of definitions.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read definitions from {}", path.display()))?;
        let definitions: Vec<ExecutorDefinition> = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse definitions in {}", path.display()))?;

        info!(count = definitions.len(), path = %path.display(), "Loaded executor definitions");
        Ok(Self::from_definitions(definitions))
    }

    pub fn from_definitions(definitions: impl IntoIterator<Item = ExecutorDefinition>) -> Self {
        let map = definitions
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();
        Self {
            definitions: RwLock::new(map),
        }
    }

    /// Insert or replace a definition.
    pub async fn upsert(&self, definition: ExecutorDefinition) {
        self.definitions
            .write()
            .await
            .insert(definition.id.clone(), definition);
    }
}

#[async_trait]
impl ExecutorRepository for InMemoryRepository {
    async fn get(&self, id: &str) -> Result<ExecutorDefinition> {
        self.definitions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("executor {id} not found"))
    }
}
