use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::handle::HandleKind;
use crate::resolver::{SourceError, ToolSource};
use crate::tool::{Tool, ToolDefinition, ToolDescriptor};

/// In-process tools, the first source handed to the resolver.
pub struct ToolRegistry {
    name: String,
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::named("builtin")
    }

    /// A registry that reports itself under a different source name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: BTreeMap::new(),
        }
    }

    /// Register a tool. Returns error if name already registered.
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let name = tool.descriptor().name;
        if self.tools.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Descriptors of every registered tool, sorted by name.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.values().map(|t| t.descriptor()).collect()
    }

    /// List all registered tool definitions (for sending to LLM).
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.descriptor().definition()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolSource for ToolRegistry {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> HandleKind {
        HandleKind::Builtin
    }

    async fn list_tools(&self) -> Result<Vec<Arc<dyn Tool>>, SourceError> {
        Ok(self.tools.values().cloned().collect())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Tool with name '{0}' is already registered")]
    DuplicateName(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::EchoTool;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool).unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.get("echo").is_some());
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool).unwrap();
        let err = registry.register(EchoTool).unwrap_err();
        assert!(err.to_string().contains("echo"));
    }

    #[test]
    fn test_definitions_are_llm_view() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool).unwrap();

        let defs = registry.definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");
        assert_eq!(registry.descriptors()[0].match_argument.as_deref(), Some("message"));
    }

    #[tokio::test]
    async fn test_registry_is_a_builtin_source() {
        let mut registry = ToolRegistry::named("core");
        registry.register(EchoTool).unwrap();
        assert_eq!(registry.name(), "core");
        assert_eq!(registry.kind(), HandleKind::Builtin);
        assert_eq!(registry.list_tools().await.unwrap().len(), 1);
    }
}
