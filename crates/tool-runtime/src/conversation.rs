use crate::tool::{ToolCall, ToolResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// A message in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConversationMessage {
    /// User's text input
    User(String),
    /// Assistant's response (may contain text and/or tool calls)
    Assistant(AssistantContent),
    /// Result of a tool execution
    ToolResult(ToolResult),
}

/// Content from the assistant that can contain mixed text and tool calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantContent {
    /// Assigned when the message is appended
    #[serde(default)]
    pub message_id: String,
    /// Text blocks in the response
    pub text: Option<String>,
    /// Tool calls requested by the assistant
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConversationError {
    #[error("tool result '{0}' does not match any outstanding tool call")]
    UnmatchedResult(String),
    #[error("tool call '{0}' has no result")]
    MissingResult(String),
    #[error("tool result '{0}' appears more than once")]
    DuplicateResult(String),
    #[error("tool results must follow the assistant message that requested them")]
    NoOutstandingCalls,
}

/// Append-only conversation history.
///
/// Only the orchestrator writes to a conversation while a turn is running;
/// compaction replaces it wholesale between model calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<ConversationMessage>,
    /// System prompt (always retained)
    system_prompt: Option<String>,
    /// Number of user turns started so far
    turns: u64,
    /// Index of the user message that opened the current turn
    turn_start: usize,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    /// Open a new turn with the user's message.
    pub fn begin_turn(&mut self, text: impl Into<String>) -> u64 {
        self.turns += 1;
        self.turn_start = self.messages.len();
        self.messages.push(ConversationMessage::User(text.into()));
        self.turns
    }

    pub fn turns(&self) -> u64 {
        self.turns
    }

    /// Index of the first message of the current turn.
    pub fn current_turn_start(&self) -> usize {
        self.turn_start
    }

    /// Append an assistant response, assigning its message id and linking
    /// every tool call to it. Returns the message id.
    pub fn add_assistant_response(&mut self, mut content: AssistantContent) -> String {
        if content.message_id.is_empty() {
            content.message_id = Uuid::new_v4().to_string();
        }
        for call in &mut content.tool_calls {
            call.message_id = content.message_id.clone();
        }
        let id = content.message_id.clone();
        self.messages.push(ConversationMessage::Assistant(content));
        id
    }

    /// Append the results for the latest assistant message.
    ///
    /// The results must answer exactly the outstanding calls of that message;
    /// they are stored in the order given.
    pub fn append_tool_results(&mut self, results: Vec<ToolResult>) -> Result<(), ConversationError> {
        let outstanding = self.outstanding_calls().ok_or(ConversationError::NoOutstandingCalls)?;
        let expected: HashSet<&str> = outstanding.iter().map(|c| c.id.as_str()).collect();

        let mut seen = HashSet::new();
        for result in &results {
            if !expected.contains(result.tool_call_id.as_str()) {
                return Err(ConversationError::UnmatchedResult(result.tool_call_id.clone()));
            }
            if !seen.insert(result.tool_call_id.as_str()) {
                return Err(ConversationError::DuplicateResult(result.tool_call_id.clone()));
            }
        }
        if let Some(missing) = outstanding.iter().find(|c| !seen.contains(c.id.as_str())) {
            return Err(ConversationError::MissingResult(missing.id.clone()));
        }

        self.messages
            .extend(results.into_iter().map(ConversationMessage::ToolResult));
        Ok(())
    }

    /// Calls of the last message if it is an assistant message with calls.
    fn outstanding_calls(&self) -> Option<&[ToolCall]> {
        match self.messages.last() {
            Some(ConversationMessage::Assistant(content)) if !content.tool_calls.is_empty() => {
                Some(&content.tool_calls)
            }
            _ => None,
        }
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Drop the first `count` messages, keeping the current turn intact.
    ///
    /// Used by compaction. Returns how many messages were actually removed.
    pub fn drop_oldest(&mut self, count: usize) -> usize {
        let count = count.min(self.turn_start);
        self.messages.drain(..count);
        self.turn_start -= count;
        count
    }

    /// Approximate token count using character count / 4 heuristic.
    pub fn approximate_tokens(&self) -> usize {
        let prompt = self.system_prompt.as_ref().map_or(0, |p| p.len());
        let chars: usize = self.messages.iter().map(message_chars).sum();
        (prompt + chars) / 4
    }
}

pub(crate) fn message_chars(message: &ConversationMessage) -> usize {
    match message {
        ConversationMessage::User(text) => text.len(),
        ConversationMessage::Assistant(content) => {
            content.text.as_ref().map_or(0, |t| t.len())
                + content
                    .tool_calls
                    .iter()
                    .map(|tc| tc.name.len() + tc.input.to_string().len())
                    .sum::<usize>()
        }
        ConversationMessage::ToolResult(result) => result.content.len(),
    }
}
