//! Project-local tool definitions.
//!
//! Every `*.toml` file under `<project>/.tern/tools/` may declare tools that
//! wrap a shell command:
//!
//! ```toml
//! [[tool]]
//! name = "fmt_file"
//! description = "Format one source file"
//! command = "rustfmt {path}"
//! permission = "always"
//! match_argument = "path"
//! ```
//!
//! `{arg}` placeholders are replaced by the shell-quoted argument value, also
//! when the template puts the placeholder inside quotes.
//! Without an explicit `input_schema` every placeholder becomes a required
//! string property.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::handle::HandleKind;
use crate::permission::PermissionClass;
use crate::resolver::{SourceError, ToolSource};
use crate::tool::{Tool, ToolContext, ToolDescriptor, ToolError, ToolOutput};
use crate::tools::bash::run_shell;

const TOOLS_DIR: &str = ".tern/tools";
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, Deserialize)]
struct LocalToolFile {
    #[serde(default)]
    tool: Vec<LocalToolDef>,
}

/// One `[[tool]]` entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LocalToolDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub command: String,
    #[serde(default)]
    pub input_schema: Option<Value>,
    #[serde(default)]
    pub permission: PermissionClass,
    #[serde(default)]
    pub allow_patterns: Vec<String>,
    #[serde(default)]
    pub deny_patterns: Vec<String>,
    #[serde(default)]
    pub match_argument: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl LocalToolDef {
    fn descriptor(&self) -> ToolDescriptor {
        let schema = self
            .input_schema
            .clone()
            .unwrap_or_else(|| placeholder_schema(&self.command));
        ToolDescriptor {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: schema,
            permission: self.permission,
            allow_patterns: self.allow_patterns.clone(),
            deny_patterns: self.deny_patterns.clone(),
            match_argument: self.match_argument.clone(),
            timeout_secs: self.timeout_secs,
        }
    }
}

/// Names of `{ident}` placeholders, in order of first appearance.
fn placeholders(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                if is_ident(name) && !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
                rest = &after[close + 1..];
            }
            None => break,
        }
    }
    names
}

fn is_ident(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn placeholder_schema(template: &str) -> Value {
    let names = placeholders(template);
    let properties: Map<String, Value> = names
        .iter()
        .map(|n| (n.clone(), json!({"type": "string"})))
        .collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": names,
    })
}

/// Quote `value` for `sh`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[derive(Clone, Copy, PartialEq)]
enum Quote {
    None,
    Single,
    Double,
}

/// The identifier of a `{ident}` placeholder starting right after a `{`.
fn placeholder_at(after: &str) -> Option<&str> {
    let close = after.find('}')?;
    let name = &after[..close];
    is_ident(name).then_some(name)
}

/// Substitute placeholders with shell-quoted argument values.
///
/// A placeholder inside a quoted span of the template closes that span around
/// the value, so the value is always single-quoted when `sh` reads it.
pub fn render_command(template: &str, input: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut quote = Quote::None;
    let mut chars = template.char_indices();
    while let Some((i, c)) = chars.next() {
        match (quote, c) {
            (Quote::None, '\'') => quote = Quote::Single,
            (Quote::Single, '\'') => quote = Quote::None,
            (Quote::None, '"') => quote = Quote::Double,
            (Quote::Double, '"') => quote = Quote::None,
            (Quote::None | Quote::Double, '\\') => {
                out.push(c);
                if let Some((_, escaped)) = chars.next() {
                    out.push(escaped);
                }
                continue;
            }
            (_, '{') => {
                if let Some(name) = placeholder_at(&template[i + 1..]) {
                    let value = match input.get(name) {
                        Some(Value::String(s)) => s.clone(),
                        Some(Value::Null) | None => String::new(),
                        Some(other) => other.to_string(),
                    };
                    let quoted = shell_quote(&value);
                    match quote {
                        Quote::None => out.push_str(&quoted),
                        Quote::Single => out.push_str(&format!("'{}'", quoted)),
                        Quote::Double => out.push_str(&format!("\"{}\"", quoted)),
                    }
                    // identifiers are ASCII, so bytes and chars agree
                    chars.nth(name.len());
                    continue;
                }
            }
            _ => {}
        }
        out.push(c);
    }
    out
}

/// A tool backed by a command template.
pub struct LocalCommandTool {
    def: LocalToolDef,
}

impl LocalCommandTool {
    pub fn new(def: LocalToolDef) -> Self {
        Self { def }
    }
}

#[async_trait]
impl Tool for LocalCommandTool {
    fn descriptor(&self) -> ToolDescriptor {
        self.def.descriptor()
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let command = render_command(&self.def.command, &input);
        debug!(tool = %self.def.name, command = %command, "running local tool");
        let timeout = Duration::from_secs(self.def.timeout_secs.unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS));
        run_shell(&command, &context.working_directory, timeout, context).await
    }
}

/// Tools defined by the project under `.tern/tools/`.
pub struct LocalToolSource {
    name: String,
    project_dir: PathBuf,
}

impl LocalToolSource {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: "project".to_string(),
            project_dir: project_dir.into(),
        }
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.project_dir.join(TOOLS_DIR)
    }

    /// Parse every definition file, later files overriding earlier names.
    pub fn load_definitions(&self) -> Result<Vec<LocalToolDef>, SourceError> {
        let dir = self.tools_dir();
        if !dir.is_dir() {
            debug!(path = %dir.display(), "no project tool directory");
            return Ok(Vec::new());
        }

        let entries = std::fs::read_dir(&dir)
            .map_err(|e| SourceError::Unavailable(format!("{}: {}", dir.display(), e)))?;
        let mut paths: Vec<_> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|e| e == "toml"))
            .collect();
        paths.sort();

        let mut defs: BTreeMap<String, LocalToolDef> = BTreeMap::new();
        for path in paths {
            let Some(file) = parse_file(&path) else {
                continue;
            };
            for def in file.tool {
                if defs.contains_key(&def.name) {
                    warn!(tool = %def.name, path = %path.display(), "duplicate project tool, later definition wins");
                }
                defs.insert(def.name.clone(), def);
            }
        }
        info!(count = defs.len(), path = %dir.display(), "loaded project tools");
        Ok(defs.into_values().collect())
    }
}

fn parse_file(path: &Path) -> Option<LocalToolFile> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read tool definition file");
            return None;
        }
    };
    match toml::from_str(&content) {
        Ok(file) => Some(file),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "skipping unparseable tool definition file");
            None
        }
    }
}

#[async_trait]
impl ToolSource for LocalToolSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> HandleKind {
        HandleKind::Local
    }

    async fn list_tools(&self) -> Result<Vec<Arc<dyn Tool>>, SourceError> {
        Ok(self
            .load_definitions()?
            .into_iter()
            .map(|def| Arc::new(LocalCommandTool::new(def)) as Arc<dyn Tool>)
            .collect())
    }
}
