//! Installed plugins that bring their own MCP server.
//!
//! A plugins directory holds one sub-directory per plugin. Its manifest is
//! the first of [`MANIFEST_PATHS`] that exists.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use tern_tool_runtime::permission::PermissionClass;

use crate::source::{McpServerConfig, McpTransportConfig};

pub const MANIFEST_PATHS: [&str; 4] = [
    ".tern-plugin/manifest.json",
    ".claude-plugin/plugin.json",
    "plugin.json",
    "manifest.json",
];

const DEFAULT_VERSION: &str = "1.0.0";

/// How to reach a plugin's server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PluginServer {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    name: Option<String>,
    version: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    author: Option<Value>,
    #[serde(default, alias = "mcpServer")]
    mcp_server: Option<PluginServer>,
    /// Extension-list manifests describe the plugin in their first entry.
    #[serde(default)]
    extensions: Option<Vec<RawExtension>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawExtension {
    name: Option<String>,
    version: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    developer: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: Option<String>,
    pub mcp_server: Option<PluginServer>,
    /// The plugin's directory
    pub path: PathBuf,
}

impl PluginManifest {
    /// Source configuration for the plugin's server, named `plugin:<name>`.
    pub fn server_config(&self) -> Option<McpServerConfig> {
        let transport = match self.mcp_server.as_ref()? {
            PluginServer::Stdio { command, args, env } => McpTransportConfig::Stdio {
                command: self.resolve_command(command),
                args: args.clone(),
                env: env.clone(),
                cwd: Some(self.path.clone()),
            },
            PluginServer::Http { url, headers } => McpTransportConfig::Http {
                url: url.clone(),
                headers: headers.clone(),
            },
        };
        Some(McpServerConfig {
            name: format!("plugin:{}", self.name),
            transport,
            permission: PermissionClass::Ask,
            required: false,
            startup_timeout_secs: 30,
        })
    }

    /// Relative paths are taken from the plugin directory; a bare program
    /// name is left for `PATH` lookup.
    fn resolve_command(&self, command: &str) -> String {
        let path = Path::new(command);
        let is_bare = path.components().count() == 1 && matches!(path.components().next(), Some(Component::Normal(_)));
        if path.is_absolute() || is_bare {
            command.to_string()
        } else {
            self.path.join(path).to_string_lossy().into_owned()
        }
    }
}

fn author_name(author: Option<Value>) -> Option<String> {
    match author? {
        Value::String(name) if !name.is_empty() => Some(name),
        Value::Object(map) => map.get("name").and_then(Value::as_str).map(String::from),
        _ => None,
    }
}

/// Read the manifest of the plugin at `dir`, if it has one.
///
/// Candidates are tried in [`MANIFEST_PATHS`] order; one that cannot be
/// read or parsed falls through to the next.
pub fn load_manifest(dir: &Path) -> Option<PluginManifest> {
    let dir_name = dir.file_name()?.to_string_lossy().into_owned();
    for path in MANIFEST_PATHS.iter().map(|p| dir.join(p)).filter(|p| p.is_file()) {
        match read_raw(&path) {
            Ok(raw) => return Some(convert(raw, dir, dir_name)),
            Err(e) => warn!(path = %path.display(), error = %e, "unreadable plugin manifest, trying the next"),
        }
    }
    debug!(plugin = %dir_name, "no usable manifest, skipping");
    None
}

fn read_raw(path: &Path) -> Result<RawManifest, String> {
    let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&content).map_err(|e| e.to_string())
}

fn convert(raw: RawManifest, dir: &Path, dir_name: String) -> PluginManifest {
    let (name, version, description, author) = match raw.extensions {
        Some(extensions) => {
            let ext = extensions.into_iter().next().unwrap_or_default();
            (ext.name, ext.version, ext.description, author_name(ext.developer))
        }
        None => (raw.name, raw.version, raw.description, author_name(raw.author)),
    };
    PluginManifest {
        name: name.filter(|n| !n.is_empty()).unwrap_or(dir_name),
        version: version.unwrap_or_else(|| DEFAULT_VERSION.to_string()),
        description,
        author,
        mcp_server: raw.mcp_server,
        path: dir.to_path_buf(),
    }
}

/// Enabled plugins under `plugins_dir`, sorted by name.
pub fn discover_plugins(plugins_dir: &Path, disabled: &[String]) -> Vec<PluginManifest> {
    let entries = match std::fs::read_dir(plugins_dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(path = %plugins_dir.display(), error = %e, "no plugins directory");
            return Vec::new();
        }
    };

    let mut plugins: Vec<PluginManifest> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter_map(|p| load_manifest(&p))
        .filter(|m| {
            let off = disabled.iter().any(|d| d == &m.name);
            if off {
                debug!(plugin = %m.name, "plugin disabled");
            }
            !off
        })
        .collect();
    plugins.sort_by(|a, b| a.name.cmp(&b.name));
    info!(count = plugins.len(), path = %plugins_dir.display(), "discovered plugins");
    plugins
}
