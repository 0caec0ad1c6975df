// Step script parsing - tagged blocks into typed steps

//! # Step Script Parser
//!
//! A step script is a text document containing `<step>` blocks:
//!
//! ```text
//! <step n="1" goal="Collect inputs" optional="true" if="mode == 'full'">
//!   <action>Read the brief</action>
//!   <ask>Which template applies?</ask>
//! </step>
//! ```
//!
//! The parser extracts the step list ordered by `n` with inner content
//! preserved verbatim, tolerating free text between blocks. Step numbers
//! must be contiguous from 1; a gap or duplicate is a load-time error.
//!
//! Inner content is parsed separately ([`parse_step_tags`]) into the tag
//! stream the engine executes: `<action>`, `<output>`, `<ask>`,
//! `<elicit-required>`, `<template-output file="…">`, `<check if="…">`
//! (nesting allowed), and `<invoke-workflow path="…"/>`.

use crate::models::Step;
use crate::{OrchestratorError, Result};
use std::collections::HashMap;

/// One executable tag inside a step body, in document order.
#[derive(Debug, Clone, PartialEq)]
pub enum StepTag {
    /// Log-and-advance instruction text
    Action(String),
    /// Log-and-advance output description
    Output(String),
    /// Elicitation answered autonomously or escalated
    Ask(String),
    /// Like `<ask>`, but the step cannot complete without an answer
    ElicitRequired(String),
    /// Document emission requiring approval outside yolo mode
    TemplateOutput { file: String, content: String },
    /// Conditional sub-block
    Check { condition: String, body: Vec<StepTag> },
    /// Recursive workflow invocation sharing the current scope
    InvokeWorkflow { path: String },
}

/// Parse a full step script into contiguous, ordered steps.
pub fn parse_step_script(script: &str) -> Result<Vec<Step>> {
    let mut steps = Vec::new();
    let mut cursor = 0;

    while let Some(found) = find_tag_open(script, cursor, "step") {
        let (attrs, content, next) = read_element(script, found, "step")?;
        let number = attrs
            .get("n")
            .ok_or_else(|| {
                OrchestratorError::WorkflowParse("<step> is missing the 'n' attribute".to_string())
            })?
            .parse::<u32>()
            .map_err(|_| {
                OrchestratorError::WorkflowParse(format!(
                    "<step> has a non-numeric 'n' attribute: {:?}",
                    attrs.get("n")
                ))
            })?;

        steps.push(Step {
            number,
            goal: attrs.get("goal").cloned().unwrap_or_default(),
            content,
            condition: attrs.get("if").cloned(),
            optional: attrs.get("optional").map(String::as_str) == Some("true"),
        });
        cursor = next;
    }

    if steps.is_empty() {
        return Err(OrchestratorError::WorkflowParse(
            "step script contains no <step> blocks".to_string(),
        ));
    }

    steps.sort_by_key(|s| s.number);
    for (index, step) in steps.iter().enumerate() {
        let expected = index as u32 + 1;
        if step.number != expected {
            return Err(OrchestratorError::WorkflowParse(format!(
                "step numbers must be contiguous from 1: expected step {expected}, found {}",
                step.number
            )));
        }
    }

    Ok(steps)
}

/// Parse a step body into its executable tag stream. Text outside tags is
/// ignored; tags the engine does not know are a load-time error so typos
/// fail loudly instead of silently skipping work.
pub fn parse_step_tags(content: &str) -> Result<Vec<StepTag>> {
    let mut tags = Vec::new();
    let mut cursor = 0;

    while let Some(open) = content[cursor..].find('<').map(|i| cursor + i) {
        // Closing tags at this level belong to an enclosing element
        if content[open..].starts_with("</") {
            cursor = open + 2;
            continue;
        }
        let Some(name) = element_name(content, open) else {
            cursor = open + 1;
            continue;
        };

        match name.as_str() {
            "action" | "output" | "ask" | "elicit-required" => {
                let (_, body, next) = read_element(content, open, &name)?;
                let text = body.trim().to_string();
                tags.push(match name.as_str() {
                    "action" => StepTag::Action(text),
                    "output" => StepTag::Output(text),
                    "ask" => StepTag::Ask(text),
                    _ => StepTag::ElicitRequired(text),
                });
                cursor = next;
            }
            "template-output" => {
                let (attrs, body, next) = read_element(content, open, &name)?;
                let file = attrs.get("file").cloned().ok_or_else(|| {
                    OrchestratorError::WorkflowParse(
                        "<template-output> is missing the 'file' attribute".to_string(),
                    )
                })?;
                tags.push(StepTag::TemplateOutput {
                    file,
                    content: body.trim().to_string(),
                });
                cursor = next;
            }
            "check" => {
                let (attrs, body, next) = read_element(content, open, &name)?;
                let condition = attrs.get("if").cloned().ok_or_else(|| {
                    OrchestratorError::WorkflowParse(
                        "<check> is missing the 'if' attribute".to_string(),
                    )
                })?;
                tags.push(StepTag::Check {
                    condition,
                    body: parse_step_tags(&body)?,
                });
                cursor = next;
            }
            "invoke-workflow" => {
                let (attrs, _, next) = read_element(content, open, &name)?;
                let path = attrs.get("path").cloned().ok_or_else(|| {
                    OrchestratorError::WorkflowParse(
                        "<invoke-workflow> is missing the 'path' attribute".to_string(),
                    )
                })?;
                tags.push(StepTag::InvokeWorkflow { path });
                cursor = next;
            }
            other => {
                return Err(OrchestratorError::WorkflowParse(format!(
                    "unknown step tag <{other}>"
                )));
            }
        }
    }

    Ok(tags)
}

/// Find the next `<name` opening at or after `from`, matching the whole tag
/// name (so `<stepper>` does not match `step`).
fn find_tag_open(text: &str, from: usize, name: &str) -> Option<usize> {
    let needle = format!("<{name}");
    let mut cursor = from;
    while let Some(found) = text[cursor..].find(&needle).map(|i| cursor + i) {
        let after = text[found + needle.len()..].chars().next();
        if matches!(after, Some(c) if c == '>' || c == '/' || c.is_whitespace()) {
            return Some(found);
        }
        cursor = found + needle.len();
    }
    None
}

/// Name of the element opening at `open` (which points at `<`).
fn element_name(text: &str, open: usize) -> Option<String> {
    let rest = &text[open + 1..];
    let end = rest.find(|c: char| c == '>' || c == '/' || c.is_whitespace())?;
    let name: String = rest[..end].to_string();
    let starts_with_letter = name.chars().next().is_some_and(|c| c.is_ascii_alphabetic());
    if !starts_with_letter || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return None;
    }
    Some(name)
}

/// Read the element opening at `open`. Returns (attributes, inner content,
/// index just past the element). Self-closing elements have empty content.
/// Same-name nesting is tracked so `<check>` blocks may contain `<check>`.
fn read_element(text: &str, open: usize, name: &str) -> Result<(HashMap<String, String>, String, usize)> {
    let header_start = open + 1 + name.len();
    let header_end = text[header_start..]
        .find('>')
        .map(|i| header_start + i)
        .ok_or_else(|| {
            OrchestratorError::WorkflowParse(format!("unterminated <{name}> tag"))
        })?;
    let header = &text[header_start..header_end];
    let attrs = parse_attributes(header)?;

    if header.trim_end().ends_with('/') {
        return Ok((attrs, String::new(), header_end + 1));
    }

    let close_tag = format!("</{name}>");
    let mut depth = 1;
    let mut cursor = header_end + 1;
    let content_start = cursor;
    loop {
        let next_open = find_tag_open(text, cursor, name);
        let next_close = text[cursor..].find(&close_tag).map(|i| cursor + i);
        match (next_open, next_close) {
            (Some(o), Some(c)) if o < c => {
                // Nested opening; self-closing nested tags do not deepen
                let nested_header_end = text[o..].find('>').map(|i| o + i);
                let self_closing = nested_header_end
                    .is_some_and(|e| text[..e].trim_end().ends_with('/'));
                if !self_closing {
                    depth += 1;
                }
                cursor = nested_header_end.map_or(o + 1, |e| e + 1);
            }
            (_, Some(c)) => {
                depth -= 1;
                if depth == 0 {
                    let content = text[content_start..c].to_string();
                    return Ok((attrs, content, c + close_tag.len()));
                }
                cursor = c + close_tag.len();
            }
            _ => {
                return Err(OrchestratorError::WorkflowParse(format!(
                    "missing closing tag {close_tag}"
                )))
            }
        }
    }
}

/// Parse `key="value"` attribute pairs from a tag header.
fn parse_attributes(header: &str) -> Result<HashMap<String, String>> {
    let mut attrs = HashMap::new();
    let chars: Vec<char> = header.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        if chars[i].is_whitespace() || chars[i] == '/' {
            i += 1;
            continue;
        }
        let key_start = i;
        while i < chars.len() && chars[i] != '=' && !chars[i].is_whitespace() && chars[i] != '/' {
            i += 1;
        }
        let key: String = chars[key_start..i].iter().collect();
        if i >= chars.len() || chars[i] != '=' {
            // Bare attribute without a value; record as empty
            if !key.is_empty() {
                attrs.insert(key, String::new());
            }
            continue;
        }
        i += 1; // '='
        let Some(&quote) = chars.get(i).filter(|c| **c == '"' || **c == '\'') else {
            return Err(OrchestratorError::WorkflowParse(format!(
                "attribute '{key}' value must be quoted"
            )));
        };
        i += 1;
        let value_start = i;
        while i < chars.len() && chars[i] != quote {
            i += 1;
        }
        if i == chars.len() {
            return Err(OrchestratorError::WorkflowParse(format!(
                "unterminated value for attribute '{key}'"
            )));
        }
        let value: String = chars[value_start..i].iter().collect();
        i += 1; // closing quote
        attrs.insert(key, value);
    }

    Ok(attrs)
}
