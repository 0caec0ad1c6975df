// Template rendering: variable substitution, conditionals, each-loops

//! # Template Renderer
//!
//! Step content and template files use a small mustache-style dialect:
//!
//! - `{{name}}`: substitution from the variable scope; dotted paths reach
//!   into nested maps (`{{nested.key}}`)
//! - `{{name|default}}`: the default text is used when `name` is undefined
//! - `{{#if name}}…{{else}}…{{/if}}`: truthiness conditional
//! - `{{#each items}}…{{/each}}`: iteration over arrays and maps, exposing
//!   `{{this}}`, `{{@index}}`, `{{@first}}`, `{{@last}}`, and (for maps)
//!   `{{@key}}` inside the body
//!
//! Rendering is a parse → AST → evaluate pipeline. In
//! [`TemplateMode::Strict`] an undefined variable without a default raises
//! [`crate::OrchestratorError::VariableUndefined`]; in
//! [`TemplateMode::Lenient`] it renders as the empty string.

use crate::engine::config::value_to_display_string;
use crate::{OrchestratorError, Result};
use serde_json::Value;
use std::collections::HashMap;

/// Undefined-variable policy during rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateMode {
    Strict,
    Lenient,
}

/// Render `template` against `variables`.
pub fn render_template(
    template: &str,
    variables: &HashMap<String, Value>,
    mode: TemplateMode,
) -> Result<String> {
    let nodes = parse(template)?;
    let scope = Scope::Root(variables);
    let mut out = String::with_capacity(template.len());
    render_nodes(&nodes, &scope, mode, &mut out)?;
    Ok(out)
}

/// Load and render a template file. A missing file raises
/// [`crate::OrchestratorError::TemplateNotFound`].
pub async fn render_template_file(
    path: impl AsRef<std::path::Path>,
    variables: &HashMap<String, Value>,
    mode: TemplateMode,
) -> Result<String> {
    let path = path.as_ref();
    let template = tokio::fs::read_to_string(path).await.map_err(|e| {
        OrchestratorError::TemplateNotFound(format!("{}: {e}", path.display()))
    })?;
    render_template(&template, variables, mode)
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    /// `{{path}}` or `{{path|default}}`
    Var {
        path: String,
        default: Option<String>,
    },
    If {
        path: String,
        then_body: Vec<Node>,
        else_body: Vec<Node>,
    },
    Each {
        path: String,
        body: Vec<Node>,
    },
}

enum FrameKind {
    If {
        path: String,
        /// Set once `{{else}}` has been seen; holds the then-branch
        then_body: Option<Vec<Node>>,
    },
    Each {
        path: String,
    },
}

struct Frame {
    kind: FrameKind,
    collected: Vec<Node>,
}

fn parse(template: &str) -> Result<Vec<Node>> {
    let mut root = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();

    fn sink<'a>(root: &'a mut Vec<Node>, stack: &'a mut Vec<Frame>) -> &'a mut Vec<Node> {
        match stack.last_mut() {
            Some(frame) => &mut frame.collected,
            None => root,
        }
    }

    let mut rest = template;
    loop {
        let Some(open) = rest.find("{{") else {
            if !rest.is_empty() {
                sink(&mut root, &mut stack).push(Node::Text(rest.to_string()));
            }
            break;
        };
        if open > 0 {
            sink(&mut root, &mut stack).push(Node::Text(rest[..open].to_string()));
        }
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            return Err(OrchestratorError::TemplateSyntax(
                "unterminated '{{' placeholder".to_string(),
            ));
        };
        let tag = after[..close].trim();
        rest = &after[close + 2..];

        if let Some(path) = tag.strip_prefix("#if ") {
            stack.push(Frame {
                kind: FrameKind::If {
                    path: path.trim().to_string(),
                    then_body: None,
                },
                collected: Vec::new(),
            });
        } else if let Some(path) = tag.strip_prefix("#each ") {
            stack.push(Frame {
                kind: FrameKind::Each {
                    path: path.trim().to_string(),
                },
                collected: Vec::new(),
            });
        } else if tag == "else" {
            match stack.last_mut() {
                Some(Frame {
                    kind: FrameKind::If { then_body, .. },
                    collected,
                }) if then_body.is_none() => {
                    *then_body = Some(std::mem::take(collected));
                }
                _ => {
                    return Err(OrchestratorError::TemplateSyntax(
                        "'{{else}}' outside an '#if' block".to_string(),
                    ))
                }
            }
        } else if tag == "/if" {
            let Some(frame) = stack.pop() else {
                return Err(OrchestratorError::TemplateSyntax(
                    "'{{/if}}' without a matching '#if'".to_string(),
                ));
            };
            let FrameKind::If { path, then_body } = frame.kind else {
                return Err(OrchestratorError::TemplateSyntax(
                    "'{{/if}}' closes an '#each' block".to_string(),
                ));
            };
            let node = match then_body {
                Some(then_body) => Node::If {
                    path,
                    then_body,
                    else_body: frame.collected,
                },
                None => Node::If {
                    path,
                    then_body: frame.collected,
                    else_body: Vec::new(),
                },
            };
            sink(&mut root, &mut stack).push(node);
        } else if tag == "/each" {
            let Some(frame) = stack.pop() else {
                return Err(OrchestratorError::TemplateSyntax(
                    "'{{/each}}' without a matching '#each'".to_string(),
                ));
            };
            let FrameKind::Each { path } = frame.kind else {
                return Err(OrchestratorError::TemplateSyntax(
                    "'{{/each}}' closes an '#if' block".to_string(),
                ));
            };
            sink(&mut root, &mut stack).push(Node::Each {
                path,
                body: frame.collected,
            });
        } else if tag.starts_with('#') || tag.starts_with('/') {
            return Err(OrchestratorError::TemplateSyntax(format!(
                "unknown block tag '{{{{{tag}}}}}'"
            )));
        } else {
            let (path, default) = match tag.split_once('|') {
                Some((path, default)) => (path.trim().to_string(), Some(default.to_string())),
                None => (tag.to_string(), None),
            };
            if path.is_empty() {
                return Err(OrchestratorError::TemplateSyntax(
                    "empty '{{}}' placeholder".to_string(),
                ));
            }
            sink(&mut root, &mut stack).push(Node::Var { path, default });
        }
    }

    if let Some(frame) = stack.last() {
        let kind = match frame.kind {
            FrameKind::If { .. } => "#if",
            FrameKind::Each { .. } => "#each",
        };
        return Err(OrchestratorError::TemplateSyntax(format!(
            "unclosed '{kind}' block"
        )));
    }

    Ok(root)
}

/// Lookup scope: the root variable map, optionally shadowed by each-frames.
enum Scope<'a> {
    Root(&'a HashMap<String, Value>),
    Each {
        parent: &'a Scope<'a>,
        item: &'a Value,
        meta: HashMap<&'static str, Value>,
    },
}

impl Scope<'_> {
    fn lookup(&self, path: &str) -> Option<Value> {
        match self {
            Scope::Root(vars) => {
                let mut parts = path.split('.');
                let first = parts.next()?;
                let mut current = vars.get(first)?;
                for segment in parts {
                    current = current.as_object()?.get(segment)?;
                }
                Some(current.clone())
            }
            Scope::Each { parent, item, meta } => {
                if let Some(meta_value) = meta.get(path) {
                    return Some(meta_value.clone());
                }
                if path == "this" {
                    return Some((*item).clone());
                }
                // Object items expose their fields directly
                let mut parts = path.split('.');
                let first = parts.next()?;
                if let Some(first_value) = item.as_object().and_then(|o| o.get(first)) {
                    let mut current = first_value;
                    for segment in parts {
                        current = current.as_object()?.get(segment)?;
                    }
                    return Some(current.clone());
                }
                parent.lookup(path)
            }
        }
    }
}

fn render_nodes(
    nodes: &[Node],
    scope: &Scope<'_>,
    mode: TemplateMode,
    out: &mut String,
) -> Result<()> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Var { path, default } => match scope.lookup(path) {
                Some(value) if !value.is_null() => {
                    out.push_str(&value_to_display_string(&value));
                }
                _ => match (default, mode) {
                    (Some(default), _) => out.push_str(default),
                    (None, TemplateMode::Lenient) => {}
                    (None, TemplateMode::Strict) => {
                        return Err(OrchestratorError::VariableUndefined(path.clone()));
                    }
                },
            },
            Node::If {
                path,
                then_body,
                else_body,
            } => {
                let truthy = scope.lookup(path).is_some_and(|v| match v {
                    Value::Null => false,
                    Value::Bool(b) => b,
                    Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
                    Value::String(s) => !s.is_empty(),
                    Value::Array(a) => !a.is_empty(),
                    Value::Object(o) => !o.is_empty(),
                });
                let body = if truthy { then_body } else { else_body };
                render_nodes(body, scope, mode, out)?;
            }
            Node::Each { path, body } => {
                let Some(collection) = scope.lookup(path) else {
                    if mode == TemplateMode::Strict {
                        return Err(OrchestratorError::VariableUndefined(path.clone()));
                    }
                    continue;
                };
                match collection {
                    Value::Array(items) => {
                        let len = items.len();
                        for (index, item) in items.iter().enumerate() {
                            let child = Scope::Each {
                                parent: scope,
                                item,
                                meta: each_meta(index, len, None),
                            };
                            render_nodes(body, &child, mode, out)?;
                        }
                    }
                    Value::Object(map) => {
                        let len = map.len();
                        for (index, (key, item)) in map.iter().enumerate() {
                            let child = Scope::Each {
                                parent: scope,
                                item,
                                meta: each_meta(index, len, Some(key)),
                            };
                            render_nodes(body, &child, mode, out)?;
                        }
                    }
                    _ => {
                        return Err(OrchestratorError::TemplateSyntax(format!(
                            "'#each {path}' target is not an array or map"
                        )))
                    }
                }
            }
        }
    }
    Ok(())
}

fn each_meta(index: usize, len: usize, key: Option<&str>) -> HashMap<&'static str, Value> {
    let mut meta = HashMap::new();
    meta.insert("@index", Value::from(index));
    meta.insert("@first", Value::from(index == 0));
    meta.insert("@last", Value::from(index + 1 == len));
    if let Some(key) = key {
        meta.insert("@key", Value::from(key));
    }
    meta
}
