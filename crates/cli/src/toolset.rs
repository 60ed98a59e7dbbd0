//! Tool sources assembled from configuration, in precedence order.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use tern_mcp::{discover_plugins, McpToolSource};
use tern_tool_runtime::{builtin_registry, LocalToolSource, ResolvedTools, ToolResolver, ToolSource};

use crate::config::CliConfig;

pub struct Toolset {
    sources: Vec<Arc<dyn ToolSource>>,
    remotes: Vec<Arc<McpToolSource>>,
    required: Vec<String>,
}

impl Toolset {
    /// Built-ins, then project tools, then configured servers, then plugins.
    /// A later source wins a name clash.
    pub fn assemble(config: &CliConfig, project_dir: &Path) -> Result<Self> {
        let mut sources: Vec<Arc<dyn ToolSource>> = vec![
            Arc::new(builtin_registry()?),
            Arc::new(LocalToolSource::new(project_dir)),
        ];

        let mut server_configs = config.mcp_servers.clone();
        for plugin in discover_plugins(&config.plugins_dir()?, &config.disabled_plugins) {
            match plugin.server_config() {
                Some(server) => server_configs.push(server),
                None => info!(plugin = %plugin.name, "plugin has no server, nothing to resolve"),
            }
        }

        let remotes: Vec<Arc<McpToolSource>> = server_configs
            .into_iter()
            .map(|c| Arc::new(McpToolSource::new(c)))
            .collect();
        sources.extend(remotes.iter().map(|r| Arc::clone(r) as Arc<dyn ToolSource>));

        Ok(Self {
            sources,
            remotes,
            required: config.required_sources(),
        })
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    pub async fn resolve(&self) -> Result<ResolvedTools> {
        let resolver = ToolResolver::new(self.required.iter().cloned());
        Ok(resolver.resolve_all(&self.sources).await?)
    }

    /// Close every remote connection that was opened.
    pub async fn shutdown(&self) {
        for remote in &self.remotes {
            remote.shutdown().await;
        }
    }
}
