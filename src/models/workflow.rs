// Workflow definitions - declarative documents driving the engine

//! # Workflow Definitions
//!
//! A [`WorkflowDefinition`] is the parsed form of a declarative workflow
//! document. It names the step script (`instructions`) and the external
//! configuration document (`config_source`) and carries a free-form variable
//! map seeding the execution scope.
//!
//! A [`Step`] is one numbered block of the step script. Steps are numbered
//! from 1 and must be contiguous; the script parser enforces that at load
//! time.

use crate::{OrchestratorError, Result};
use serde_json::Value;
use std::collections::HashMap;

/// Sentinel value in the `date` field replaced with the current UTC date at
/// load time.
pub const SYSTEM_GENERATED: &str = "system-generated";

/// Parsed declarative workflow document.
///
/// `name`, `instructions`, and `config_source` are required; loading fails
/// without them. Keys the loader does not recognise are preserved inside
/// `variables`, so workflow authors can stash arbitrary data next to the
/// reserved fields.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    pub name: String,
    pub description: Option<String>,
    pub author: Option<String>,
    /// Path to the external configuration document
    pub config_source: String,
    /// Path to the step script
    pub instructions: String,
    pub output_folder: Option<String>,
    pub installed_path: Option<String>,
    /// Literal `system-generated` is replaced with the current UTC date
    /// (`YYYY-MM-DD`) at load time
    pub date: Option<String>,
    /// Free-form variable map; also receives unrecognised top-level keys
    pub variables: HashMap<String, Value>,
}

impl WorkflowDefinition {
    /// Validate the required-field invariants.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(OrchestratorError::WorkflowParse(
                "workflow definition is missing required field 'name'".to_string(),
            ));
        }
        if self.instructions.trim().is_empty() {
            return Err(OrchestratorError::WorkflowParse(
                "workflow definition is missing required field 'instructions'".to_string(),
            ));
        }
        if self.config_source.trim().is_empty() {
            return Err(OrchestratorError::WorkflowParse(
                "workflow definition is missing required field 'config_source'".to_string(),
            ));
        }
        Ok(())
    }
}

/// One numbered step of a step script.
///
/// The `content` is the raw inner text of the `<step>` block, preserved
/// verbatim; the engine re-parses it into tags at execution time so that
/// nested blocks keep their original formatting.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// 1-based step number; contiguous across the script
    pub number: u32,
    pub goal: String,
    /// Inner block content, verbatim
    pub content: String,
    /// Optional `if="expr"` guard; step is skipped when it evaluates false
    pub condition: Option<String>,
    /// Steps marked `optional="true"` are skipped in yolo mode
    pub optional: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition {
            name: "plan-project".to_string(),
            description: Some("Planning workflow".to_string()),
            author: None,
            config_source: "bmad/config.yaml".to_string(),
            instructions: "instructions.md".to_string(),
            output_folder: None,
            installed_path: None,
            date: Some(SYSTEM_GENERATED.to_string()),
            variables: HashMap::new(),
        }
    }

    #[test]
    fn validate_accepts_complete_definition() {
        assert!(definition().validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_required_fields() {
        for field in ["name", "instructions", "config_source"] {
            let mut def = definition();
            match field {
                "name" => def.name = String::new(),
                "instructions" => def.instructions = "  ".to_string(),
                _ => def.config_source = String::new(),
            }
            let err = def.validate().unwrap_err();
            assert!(
                err.to_string().contains(field),
                "expected error naming {field}, got: {err}"
            );
        }
    }
}
