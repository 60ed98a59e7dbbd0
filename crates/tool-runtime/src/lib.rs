//! Agent turn orchestration: tool resolution, permission gating, middleware
//! and the backend contract for a single agent's conversation.

pub mod approval;
pub mod bridge;
pub mod config;
pub mod conversation;
pub mod event;
pub mod handle;
pub mod local;
pub mod middleware;
pub mod permission;
pub mod provider;
pub mod registry;
pub mod resolver;
pub mod retry;
pub mod runtime;
pub mod schema;
pub mod stream;
pub mod tool;
pub mod tools;
pub mod turn;

pub use approval::{ApprovalDecision, ApprovalTable, ApprovalToken};
pub use bridge::{Completion, CompletionProvider, LlmProviderBridge};
pub use config::{AgentPolicy, PolicyError};
pub use conversation::{Conversation, ConversationMessage};
pub use event::AgentEvent;
pub use handle::{HandleKind, ToolHandle};
pub use local::LocalToolSource;
pub use middleware::{Middleware, MiddlewareChain, MiddlewareVerdict};
pub use permission::{PermissionClass, PermissionDecision, PermissionGate};
pub use provider::{BackendRequest, LlmError, ToolAwareLlmProvider};
pub use registry::ToolRegistry;
pub use resolver::{ResolvedTools, ToolResolver, ToolSource};
pub use runtime::{AgenticLoop, TurnContext, TurnHandle};
pub use stream::StreamEvent;
pub use tool::{Tool, ToolCall, ToolContext, ToolDefinition, ToolDescriptor, ToolError, ToolOutput, ToolResult};
pub use tools::{builtin_registry, BashTool, ListDirTool, ReadFileTool, WriteFileTool};
pub use turn::{AbortReason, TurnOutcome, TurnStatus};
