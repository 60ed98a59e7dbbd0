mod cli;
mod config;
mod toolset;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{error, info};

use tern_mcp::{McpServer, StdioTransport};
use tern_tool_runtime::{builtin_registry, PermissionDecision, PermissionGate};

use crate::cli::{CliArgs, Command};
use crate::config::CliConfig;
use crate::toolset::Toolset;

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries protocol traffic under `serve`, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::parse();

    let config = CliConfig::load(args.config.as_deref())
        .context("failed to load configuration")?;

    let project_dir = match args.project.or_else(|| config.project_dir.clone()) {
        Some(dir) => dir,
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };

    let outcome = match args.command {
        Command::Tools => list_tools(&config, &project_dir).await,
        Command::Check { tool, input } => check(&config, &project_dir, &tool, &input).await,
        Command::Serve => serve(&project_dir).await,
    };
    if let Err(e) = &outcome {
        error!(error = %e, "command failed");
    }
    outcome
}

async fn list_tools(config: &CliConfig, project_dir: &Path) -> Result<()> {
    let toolset = Toolset::assemble(config, project_dir)?;
    let resolved = toolset.resolve().await;
    toolset.shutdown().await;
    let resolved = resolved?;

    for handle in resolved.handles() {
        let descriptor = handle.descriptor();
        println!(
            "{:<20} {:<8} {:<20} {}",
            descriptor.name,
            handle.kind(),
            handle.source(),
            descriptor.permission
        );
    }
    for o in &resolved.overrides {
        println!("override: '{}' from {} replaces {}", o.name, o.source, o.replaced_source);
    }
    for d in &resolved.degraded {
        println!("unavailable: {} ({})", d.source, d.error);
    }
    Ok(())
}

async fn check(config: &CliConfig, project_dir: &Path, tool: &str, input: &str) -> Result<()> {
    let input: Value = serde_json::from_str(input).context("arguments must be JSON")?;
    let gate = PermissionGate::from_rules(&config.policy.permissions)?;

    let toolset = Toolset::assemble(config, project_dir)?;
    let resolved = toolset.resolve().await;
    toolset.shutdown().await;
    let resolved = resolved?;

    let Some(handle) = resolved.get(tool) else {
        bail!("unknown tool '{}'", tool);
    };
    if let Err(e) = handle.validate(&input) {
        println!("invalid arguments: {}", e);
    }
    match gate.decide(handle.descriptor(), &input) {
        PermissionDecision::Allow => println!("allow"),
        PermissionDecision::Ask => println!("ask"),
        PermissionDecision::Deny(reason) => println!("deny: {}", reason),
    }
    Ok(())
}

async fn serve(project_dir: &Path) -> Result<()> {
    let mut server = McpServer::new(&builtin_registry()?)?.with_working_directory(project_dir);
    info!(dir = %project_dir.display(), "serving built-in tools on stdio");
    let mut transport = StdioTransport::stdio();
    server.run(&mut transport).await?;
    Ok(())
}
