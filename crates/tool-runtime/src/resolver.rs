//! Tool resolution: many sources in, one name→handle mapping out.
//!
//! Sources are consulted in the order given. A later source that offers a
//! tool name already seen replaces the earlier tool; every replacement is
//! logged and recorded in [`ResolvedTools::overrides`]. A source that fails
//! to enumerate is recorded as degraded and contributes nothing, unless it
//! is required.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::handle::{HandleKind, ToolHandle};
use crate::tool::{Tool, ToolDefinition, ToolDescriptor};

/// A provider of tools: built-in registry, project definitions, remote server.
#[async_trait]
pub trait ToolSource: Send + Sync {
    /// Source name used in logs, overrides and `required_sources`.
    fn name(&self) -> &str;

    fn kind(&self) -> HandleKind;

    /// Enumerate the tools this source currently offers.
    async fn list_tools(&self) -> Result<Vec<Arc<dyn Tool>>, SourceError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source unreachable: {0}")]
    Unavailable(String),
    #[error("invalid tool definition: {0}")]
    InvalidDefinition(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("required tool source '{source_name}' is unavailable: {reason}")]
    RequiredSourceUnavailable { source_name: String, reason: String },
    #[error(
        "tool '{tool}' from required source '{required}' would be overridden by source '{source_name}'"
    )]
    RequiredSourceConflict {
        tool: String,
        required: String,
        source_name: String,
    },
    #[error("required tool source '{source_name}' has an invalid tool: {reason}")]
    InvalidSchema { source_name: String, reason: String },
    #[error("two tool sources are named '{0}'")]
    DuplicateSource(String),
}

/// A tool name that a later source took over from an earlier one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolOverride {
    pub name: String,
    pub replaced_source: String,
    pub source: String,
}

/// A source whose tools are absent from the mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DegradedSource {
    pub source: String,
    pub error: String,
}

/// Outcome of [`ToolResolver::resolve_all`].
#[derive(Debug, Clone, Default)]
pub struct ResolvedTools {
    tools: BTreeMap<String, ToolHandle>,
    pub overrides: Vec<ToolOverride>,
    pub degraded: Vec<DegradedSource>,
}

impl ResolvedTools {
    /// Build a mapping directly from handles, later handles winning.
    pub fn from_handles(handles: impl IntoIterator<Item = ToolHandle>) -> Self {
        let mut tools = BTreeMap::new();
        for handle in handles {
            tools.insert(handle.name().to_string(), handle);
        }
        Self {
            tools,
            ..Default::default()
        }
    }

    pub fn get(&self, name: &str) -> Option<&ToolHandle> {
        self.tools.get(name)
    }

    /// Handles in name order.
    pub fn handles(&self) -> impl Iterator<Item = &ToolHandle> {
        self.tools.values()
    }

    /// Definitions sent to the model, in name order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|h| h.descriptor().definition()).collect()
    }

    /// Comparable snapshot of the mapping: name, source, kind and descriptor.
    pub fn fingerprint(&self) -> Vec<(String, String, HandleKind, ToolDescriptor)> {
        self.tools
            .iter()
            .map(|(name, h)| (name.clone(), h.source().to_string(), h.kind(), h.descriptor().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Unifies tool sources into one mapping.
#[derive(Debug, Clone, Default)]
pub struct ToolResolver {
    required: HashSet<String>,
}

impl ToolResolver {
    pub fn new(required_sources: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            required: required_sources.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_required(&self, source: &str) -> bool {
        self.required.contains(source)
    }

    /// Enumerate every source concurrently, then merge in source order.
    pub async fn resolve_all(
        &self,
        sources: &[Arc<dyn ToolSource>],
    ) -> Result<ResolvedTools, ResolveError> {
        // Overrides and required membership are tracked by source name.
        let mut names = HashSet::new();
        if let Some(dup) = sources.iter().map(|s| s.name()).find(|n| !names.insert(*n)) {
            return Err(ResolveError::DuplicateSource(dup.to_string()));
        }

        let listings = futures::future::join_all(sources.iter().map(|s| s.list_tools())).await;

        let mut resolved = ResolvedTools::default();
        for (source, listing) in sources.iter().zip(listings) {
            let source_name = source.name();
            let required = self.is_required(source_name);

            let tools = match listing {
                Ok(tools) => tools,
                Err(e) if required => {
                    return Err(ResolveError::RequiredSourceUnavailable {
                        source_name: source_name.to_string(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!(source = %source_name, error = %e, "tool source unavailable, its tools are skipped");
                    resolved.degraded.push(DegradedSource {
                        source: source_name.to_string(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            debug!(source = %source_name, count = tools.len(), "tool source enumerated");
            for tool in tools {
                let handle = match ToolHandle::new(tool, source.kind(), source_name) {
                    Ok(handle) => handle,
                    Err(e) if required => {
                        return Err(ResolveError::InvalidSchema {
                            source_name: source_name.to_string(),
                            reason: e.to_string(),
                        });
                    }
                    Err(e) => {
                        warn!(source = %source_name, error = %e, "skipping tool with invalid schema");
                        continue;
                    }
                };
                self.insert(&mut resolved, handle)?;
            }
        }

        info!(
            tools = resolved.len(),
            overrides = resolved.overrides.len(),
            degraded = resolved.degraded.len(),
            "tool resolution complete"
        );
        Ok(resolved)
    }

    fn insert(&self, resolved: &mut ResolvedTools, handle: ToolHandle) -> Result<(), ResolveError> {
        let name = handle.name().to_string();
        if let Some(previous) = resolved.tools.get(&name) {
            if previous.source() == handle.source() {
                // Same source listing a name twice: keep the last, nothing to report.
                resolved.tools.insert(name, handle);
                return Ok(());
            }
            if self.is_required(previous.source()) {
                return Err(ResolveError::RequiredSourceConflict {
                    tool: name,
                    required: previous.source().to_string(),
                    source_name: handle.source().to_string(),
                });
            }
            warn!(
                tool = %name,
                replaced = %previous.source(),
                source = %handle.source(),
                "tool overridden by later source"
            );
            resolved.overrides.push(ToolOverride {
                name: name.clone(),
                replaced_source: previous.source().to_string(),
                source: handle.source().to_string(),
            });
        }
        resolved.tools.insert(name, handle);
        Ok(())
    }
}
