//! executor-engine
//!
//! Runs user-defined executors in containers, either as an MCP server over
//! stdio or through one-shot subcommands. Configuration comes from
//! `EXECUTOR_ENGINE_CONFIG`, `EXECUTOR_RUNTIME` and `EXECUTOR_PROJECT_ROOT`.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use executor_engine::builder::{runner_configs, ImageBuilder};
use executor_engine::config::EngineConfig;
use executor_engine::definition::InMemoryRepository;
use executor_engine::mcp::{self, JsonService};

#[derive(Parser, Debug)]
#[command(name = "executor-engine")]
#[command(about = "Run user-defined executors in isolated containers")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve executor tools over MCP
    Serve {
        /// Run in stdio mode (for MCP clients)
        #[arg(long)]
        stdio: bool,
    },
    /// Build the base runner image for every language
    BuildRunners,
    /// Check whether an image tag exists locally
    ImageExists { tag: String },
    /// Build the image for an executor definition
    Build { id: String },
    /// Run an executor definition once and print the result as JSON
    Execute {
        id: String,
        /// JSON input for the executor
        #[arg(long, default_value = "{}")]
        input: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout stays free for MCP and command output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = EngineConfig::from_env().context("Failed to load configuration")?;
    info!(
        runtime = %config.runtime,
        project_root = %config.project_root.display(),
        "Loaded configuration"
    );

    let builder = ImageBuilder::new(config.runtime.clone());
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling");
                cancel.cancel();
            }
        });
    }

    match args.command {
        Command::Serve { stdio } => {
            if !stdio {
                anyhow::bail!("Only --stdio mode is currently supported");
            }
            mcp::serve_stdio(Arc::new(service(&config, builder)?)).await?;
        }
        Command::BuildRunners => {
            let results = builder
                .build_images(&cancel, runner_configs(&config.project_root))
                .await;
            let mut failed = 0;
            for result in &results {
                match &result.error {
                    None => println!("{}: built {}", result.name, result.tags.join(", ")),
                    Some(e) => {
                        failed += 1;
                        println!("{}: FAILED: {e}\n{}", result.name, result.output);
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{failed} of {} runner builds failed", results.len());
            }
        }
        Command::ImageExists { tag } => {
            let exists = builder.image_exists(&cancel, &tag).await?;
            println!("{exists}");
            if !exists {
                std::process::exit(1);
            }
        }
        Command::Build { id } => {
            service(&config, builder)?.build_executor(&cancel, &id).await?;
            println!("built {id}");
        }
        Command::Execute { id, input } => {
            let input: Value =
                serde_json::from_str(&input).context("--input must be valid JSON")?;
            let result = service(&config, builder)?
                .execute(&cancel, &id, input)
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}

fn service(config: &EngineConfig, builder: ImageBuilder) -> Result<JsonService> {
    let repo = match &config.definitions {
        Some(path) => InMemoryRepository::from_file(path)?,
        None => {
            warn!("No definitions file configured; every lookup will fail");
            InMemoryRepository::new()
        }
    };
    Ok(JsonService::new(
        Arc::new(repo),
        builder,
        config.project_root.clone(),
    ))
}
