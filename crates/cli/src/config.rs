use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

use tern_mcp::McpServerConfig;
use tern_tool_runtime::AgentPolicy;

/// CLI configuration loaded from TOML file.
///
/// ```toml
/// disabled_plugins = ["noisy"]
///
/// [policy.permissions]
/// allow = ["bash(git status*)"]
///
/// [[mcp_servers]]
/// name = "search"
/// transport = "stdio"
/// command = "search-server"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub policy: AgentPolicy,

    /// Remote tool servers, resolved after built-in and project tools
    pub mcp_servers: Vec<McpServerConfig>,

    /// Directory scanned for plugins (default: ~/.config/tern/plugins)
    pub plugins_dir: Option<PathBuf>,

    /// Plugin names to skip
    pub disabled_plugins: Vec<String>,

    /// Project whose `.tern/tools/` are loaded, unless `--project` is given
    pub project_dir: Option<PathBuf>,
}

impl CliConfig {
    /// Return the default config directory path: ~/.config/tern/
    pub fn default_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("could not determine user config directory")?
            .join("tern");
        Ok(config_dir)
    }

    /// Return the default config file path.
    pub fn default_config_path() -> Result<PathBuf> {
        Ok(Self::default_config_dir()?.join("config.toml"))
    }

    /// Load config from the given path, or the default path.
    /// Returns default config if the file does not exist.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config_path = match path {
            Some(p) => PathBuf::from(p),
            None => Self::default_config_path()?,
        };

        if !config_path.exists() {
            debug!(?config_path, "Config file not found, using defaults");
            return Ok(Self::default());
        }

        debug!(?config_path, "Loading config");
        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read config: {}", config_path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("failed to parse config: {}", config_path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.policy.validate()?;
        Ok(config)
    }

    /// The plugins directory, falling back to the one next to the config file.
    pub fn plugins_dir(&self) -> Result<PathBuf> {
        match &self.plugins_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(Self::default_config_dir()?.join("plugins")),
        }
    }

    /// Sources that must resolve: the policy's list plus servers marked `required`.
    pub fn required_sources(&self) -> Vec<String> {
        let mut required = self.policy.required_sources.clone();
        for server in self.mcp_servers.iter().filter(|s| s.required) {
            if !required.contains(&server.name) {
                required.push(server.name.clone());
            }
        }
        required
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_tool_runtime::permission::PermissionClass;

    #[test]
    fn test_default_config() {
        let config = CliConfig::default();
        assert!(config.mcp_servers.is_empty());
        assert_eq!(config.policy, AgentPolicy::default());
        assert!(config.required_sources().is_empty());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = CliConfig::load(Some(path.to_str().unwrap())).unwrap();
        assert!(config.disabled_plugins.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn test_parse_full_config() {
        let config = CliConfig::parse(
            r#"
            plugins_dir = "/opt/tern/plugins"
            project_dir = "/work/app"
            disabled_plugins = ["noisy"]

            [policy]
            required_sources = ["builtin"]

            [policy.permissions]
            deny = ["bash(rm -rf *)"]

            [[mcp_servers]]
            name = "search"
            transport = "stdio"
            command = "search-server"
            required = true

            [[mcp_servers]]
            name = "docs"
            transport = "http"
            url = "https://docs.example.com/mcp"
            permission = "always"
            "#,
        )
        .unwrap();

        assert_eq!(config.plugins_dir().unwrap(), PathBuf::from("/opt/tern/plugins"));
        assert_eq!(config.disabled_plugins, vec!["noisy"]);
        assert_eq!(config.project_dir, Some(PathBuf::from("/work/app")));
        assert_eq!(config.mcp_servers[1].permission, PermissionClass::Always);
        assert_eq!(config.required_sources(), vec!["builtin", "search"]);
    }

    #[test]
    fn test_invalid_policy_is_rejected() {
        let err = CliConfig::parse(
            r#"
            [policy]
            max_concurrent_tools = 0
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_concurrent_tools"));
    }
}
