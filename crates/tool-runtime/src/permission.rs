use glob::Pattern;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::tool::ToolDescriptor;

/// Static default governing whether a tool call needs approval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionClass {
    /// Tool executes without asking the user
    Always,
    /// User must confirm before execution
    #[default]
    Ask,
    /// Tool is blocked from executing
    Never,
}

impl PermissionClass {
    fn strictness(self) -> u8 {
        match self {
            PermissionClass::Always => 0,
            PermissionClass::Ask => 1,
            PermissionClass::Never => 2,
        }
    }
}

impl fmt::Display for PermissionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PermissionClass::Always => "always",
            PermissionClass::Ask => "ask",
            PermissionClass::Never => "never",
        };
        f.write_str(s)
    }
}

/// Outcome of evaluating a call against the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    Deny(String),
    /// Needs an out-of-band approval before the call may run.
    Ask,
}

/// Permission section of the agent policy, as written in configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionRules {
    /// Rules that always allow, e.g. `"bash(git status*)"`, `"list_dir"`
    pub allow: Vec<String>,
    /// Rules that always deny, e.g. `"bash(rm -rf *)"`
    pub deny: Vec<String>,
    /// Run-level class overrides keyed by tool name or tool glob
    pub overrides: BTreeMap<String, PermissionClass>,
    /// Prompt for every `ask` call instead of once per argument shape
    pub ask_every_time: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    #[error("invalid permission rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },
}

/// A parsed `tool_glob` or `tool_glob(argument_glob)` rule.
#[derive(Debug, Clone)]
pub struct ToolRule {
    raw: String,
    tool: Pattern,
    argument: Option<Pattern>,
}

impl ToolRule {
    pub fn matches(&self, tool_name: &str, subject: &str) -> bool {
        self.tool.matches(tool_name)
            && self
                .argument
                .as_ref()
                .map_or(true, |pattern| pattern.matches(subject))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for ToolRule {
    type Err = PermissionError;

    fn from_str(rule: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| PermissionError::InvalidRule {
            rule: rule.to_string(),
            reason,
        };
        let trimmed = rule.trim();
        let (tool, argument) = match trimmed.find('(') {
            Some(open) => {
                let inner = trimmed[open + 1..]
                    .strip_suffix(')')
                    .ok_or_else(|| invalid("missing closing ')'".to_string()))?;
                (&trimmed[..open], Some(inner))
            }
            None => (trimmed, None),
        };
        if tool.is_empty() {
            return Err(invalid("empty tool pattern".to_string()));
        }
        let tool = Pattern::new(tool).map_err(|e| invalid(e.to_string()))?;
        let argument = argument
            .map(Pattern::new)
            .transpose()
            .map_err(|e| invalid(e.to_string()))?;
        Ok(Self {
            raw: trimmed.to_string(),
            tool,
            argument,
        })
    }
}

/// Decides allow / ask / deny for a tool call.
///
/// Evaluation order: deny patterns, allow patterns, the tool's declared
/// class, then run-level overrides. Overrides never loosen `never`.
#[derive(Debug, Clone, Default)]
pub struct PermissionGate {
    allow: Vec<ToolRule>,
    deny: Vec<ToolRule>,
    exact_overrides: HashMap<String, PermissionClass>,
    glob_overrides: Vec<(Pattern, PermissionClass)>,
    ask_every_time: bool,
}

impl PermissionGate {
    pub fn from_rules(rules: &PermissionRules) -> Result<Self, PermissionError> {
        let parse = |list: &[String]| -> Result<Vec<ToolRule>, PermissionError> {
            list.iter().map(|r| r.parse()).collect()
        };

        let mut exact_overrides = HashMap::new();
        let mut glob_overrides = Vec::new();
        for (name, class) in &rules.overrides {
            if name.contains(['*', '?', '[']) {
                let pattern = Pattern::new(name).map_err(|e| PermissionError::InvalidRule {
                    rule: name.clone(),
                    reason: e.to_string(),
                })?;
                glob_overrides.push((pattern, *class));
            } else {
                exact_overrides.insert(name.clone(), *class);
            }
        }

        Ok(Self {
            allow: parse(&rules.allow)?,
            deny: parse(&rules.deny)?,
            exact_overrides,
            glob_overrides,
            ask_every_time: rules.ask_every_time,
        })
    }

    pub fn ask_every_time(&self) -> bool {
        self.ask_every_time
    }

    pub fn decide(&self, descriptor: &ToolDescriptor, input: &Value) -> PermissionDecision {
        let name = descriptor.name.as_str();
        let subject = descriptor.argument_subject(input);

        if let Some(pattern) = first_matching_pattern(&descriptor.deny_patterns, &subject) {
            return PermissionDecision::Deny(format!(
                "'{}' matches deny pattern '{}' of tool '{}'",
                subject, pattern, name
            ));
        }
        if let Some(rule) = self.deny.iter().find(|r| r.matches(name, &subject)) {
            return PermissionDecision::Deny(format!(
                "tool '{}' is denied by rule '{}'",
                name,
                rule.as_str()
            ));
        }

        if first_matching_pattern(&descriptor.allow_patterns, &subject).is_some()
            || self.allow.iter().any(|r| r.matches(name, &subject))
        {
            debug!(tool = %name, "allowed by pattern");
            return PermissionDecision::Allow;
        }

        let mut class = descriptor.permission;
        if let Some(requested) = self.override_for(name) {
            if class == PermissionClass::Never && requested.strictness() < class.strictness() {
                warn!(
                    tool = %name,
                    requested = %requested,
                    "run-level override cannot loosen a 'never' tool; keeping 'never'"
                );
            } else {
                if requested != class {
                    debug!(tool = %name, from = %class, to = %requested, "run-level override applied");
                }
                class = requested;
            }
        }

        match class {
            PermissionClass::Always => PermissionDecision::Allow,
            PermissionClass::Ask => PermissionDecision::Ask,
            PermissionClass::Never => {
                PermissionDecision::Deny(format!("Tool '{}' is denied by policy", name))
            }
        }
    }

    fn override_for(&self, tool_name: &str) -> Option<PermissionClass> {
        if let Some(&class) = self.exact_overrides.get(tool_name) {
            return Some(class);
        }
        self.glob_overrides
            .iter()
            .find(|(pattern, _)| pattern.matches(tool_name))
            .map(|(_, class)| *class)
    }
}

fn first_matching_pattern<'a>(patterns: &'a [String], subject: &str) -> Option<&'a str> {
    patterns
        .iter()
        .find(|p| match Pattern::new(p) {
            Ok(pattern) => pattern.matches(subject),
            Err(e) => {
                warn!(pattern = %p, error = %e, "ignoring malformed tool pattern");
                false
            }
        })
        .map(String::as_str)
}

/// Approval answers remembered for the rest of one turn.
///
/// Keyed by tool name and argument subject. A fresh cache is created for
/// every turn, so answers never carry over.
#[derive(Debug, Default)]
pub struct ApprovalCache {
    ask_every_time: bool,
    answers: HashMap<(String, String), bool>,
}

impl ApprovalCache {
    pub fn new(ask_every_time: bool) -> Self {
        Self {
            ask_every_time,
            answers: HashMap::new(),
        }
    }

    pub fn key(descriptor: &ToolDescriptor, input: &Value) -> (String, String) {
        (descriptor.name.clone(), descriptor.argument_subject(input))
    }

    pub fn get(&self, key: &(String, String)) -> Option<bool> {
        if self.ask_every_time {
            return None;
        }
        self.answers.get(key).copied()
    }

    pub fn record(&mut self, key: (String, String), approved: bool) {
        if !self.ask_every_time {
            self.answers.insert(key, approved);
        }
    }

    pub fn len(&self) -> usize {
        self.answers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }
}
