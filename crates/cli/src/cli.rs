use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Inspect and serve the tools available to a tern agent.
#[derive(Parser, Debug)]
#[command(name = "tern", about = "Tool resolution and permissions for tern agents")]
pub struct CliArgs {
    /// Path to config file (default: ~/.config/tern/config.toml)
    #[arg(long, global = true, env = "TERN_CONFIG")]
    pub config: Option<String>,

    /// Project directory holding `.tern/tools/` (default: current directory)
    #[arg(long, global = true)]
    pub project: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Resolve every tool source and list the result
    Tools,

    /// Show how the permission gate treats a call
    Check {
        /// Tool name
        tool: String,
        /// Arguments as a JSON object
        #[arg(default_value = "{}")]
        input: String,
    },

    /// Serve the built-in tools as an MCP server on stdio
    Serve,
}
