//! Tool argument validation.
//!
//! Schemas are compiled once per tool when a handle is built; every call is
//! checked against the compiled validator before the tool runs.

use serde_json::Value;

#[derive(Debug, thiserror::Error)]
#[error("invalid input schema for tool '{tool}': {reason}")]
pub struct SchemaError {
    pub tool: String,
    pub reason: String,
}

/// Compiled JSON Schema for one tool's arguments.
pub struct ArgumentValidator {
    validator: Option<jsonschema::Validator>,
}

impl ArgumentValidator {
    /// Compile `schema`. A `null` schema accepts any arguments.
    pub fn compile(tool: &str, schema: &Value) -> Result<Self, SchemaError> {
        if schema.is_null() {
            return Ok(Self { validator: None });
        }
        let validator = jsonschema::validator_for(schema).map_err(|e| SchemaError {
            tool: tool.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            validator: Some(validator),
        })
    }

    /// Check `input`, returning every violation found.
    pub fn validate(&self, input: &Value) -> Result<(), Vec<String>> {
        let Some(validator) = &self.validator else {
            return Ok(());
        };
        let errors: Vec<String> = validator
            .iter_errors(input)
            .map(|e| e.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl std::fmt::Debug for ArgumentValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArgumentValidator")
            .field("compiled", &self.validator.is_some())
            .finish()
    }
}
