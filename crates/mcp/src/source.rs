//! Remote tool servers as a `ToolSource`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

use tern_tool_runtime::handle::HandleKind;
use tern_tool_runtime::permission::PermissionClass;
use tern_tool_runtime::resolver::{SourceError, ToolSource};
use tern_tool_runtime::tool::Tool;

use crate::channel::{HttpChannel, RpcChannel, StreamChannel};
use crate::client::McpClient;
use crate::error::McpError;

fn default_startup_timeout() -> u64 {
    30
}

/// One `[[mcp_servers]]` entry.
///
/// ```toml
/// [[mcp_servers]]
/// name = "search"
/// transport = "stdio"
/// command = "search-server"
/// args = ["--index", "./idx"]
/// permission = "always"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    #[serde(flatten)]
    pub transport: McpTransportConfig,
    /// Permission class given to every tool of this server
    #[serde(default)]
    pub permission: PermissionClass,
    /// Fail resolution when this server cannot be reached
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum McpTransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        cwd: Option<PathBuf>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

impl McpServerConfig {
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            transport: McpTransportConfig::Stdio {
                command: command.into(),
                args,
                env: BTreeMap::new(),
                cwd: None,
            },
            permission: PermissionClass::default(),
            required: false,
            startup_timeout_secs: default_startup_timeout(),
        }
    }

    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: McpTransportConfig::Http {
                url: url.into(),
                headers: BTreeMap::new(),
            },
            permission: PermissionClass::default(),
            required: false,
            startup_timeout_secs: default_startup_timeout(),
        }
    }

    /// Open the transport and run the handshake.
    pub async fn connect(&self) -> Result<McpClient, McpError> {
        let channel: Arc<dyn RpcChannel> = match &self.transport {
            McpTransportConfig::Stdio { command, args, env, cwd } => {
                Arc::new(StreamChannel::spawn(&self.name, command, args, env, cwd.as_deref())?)
            }
            McpTransportConfig::Http { url, headers } => Arc::new(HttpChannel::new(&self.name, url, headers)?),
        };
        McpClient::connect(&self.name, channel, Duration::from_secs(self.startup_timeout_secs)).await
    }
}

/// A remote server's tools. The connection is opened on first listing and
/// kept for the lifetime of the source.
pub struct McpToolSource {
    config: McpServerConfig,
    client: OnceCell<Arc<McpClient>>,
}

impl McpToolSource {
    pub fn new(config: McpServerConfig) -> Self {
        Self {
            config,
            client: OnceCell::new(),
        }
    }

    /// Use an already connected client.
    pub fn with_client(config: McpServerConfig, client: Arc<McpClient>) -> Self {
        Self {
            config,
            client: OnceCell::new_with(Some(client)),
        }
    }

    pub fn config(&self) -> &McpServerConfig {
        &self.config
    }

    async fn client(&self) -> Result<&Arc<McpClient>, McpError> {
        self.client
            .get_or_try_init(|| async { self.config.connect().await.map(Arc::new) })
            .await
    }

    pub async fn shutdown(&self) {
        if let Some(client) = self.client.get() {
            client.shutdown().await;
        }
    }
}

#[async_trait]
impl ToolSource for McpToolSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> HandleKind {
        HandleKind::Remote
    }

    async fn list_tools(&self) -> Result<Vec<Arc<dyn Tool>>, SourceError> {
        let client = self
            .client()
            .await
            .map_err(|e| SourceError::Unavailable(format!("{}: {}", self.config.name, e)))?;
        let infos = client
            .list_tools()
            .await
            .map_err(|e| SourceError::Unavailable(format!("{}: {}", self.config.name, e)))?;
        Ok(client
            .tools(infos, self.config.permission)
            .into_iter()
            .map(|tool| Arc::new(tool) as Arc<dyn Tool>)
            .collect())
    }
}
