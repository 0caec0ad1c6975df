// External configuration source referenced by workflow definitions

//! # Configuration Source
//!
//! Workflow definitions point at an external YAML configuration document via
//! `config_source`. Step instructions and definition fields may then pull
//! scalar values out of it with `{config_source}:dotted.path` references.
//! A reference that resolves to nothing is a fatal load error; workflows
//! must not run against an incomplete configuration.

use crate::{OrchestratorError, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A loaded configuration document with dotted-path lookup.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    path: PathBuf,
    root: Value,
}

impl ConfigSource {
    /// Load and parse the document at `path`.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            OrchestratorError::WorkflowParse(format!(
                "cannot read config source {}: {e}",
                path.display()
            ))
        })?;
        let yaml: serde_yaml::Value = serde_yaml::from_str(&text).map_err(|e| {
            OrchestratorError::WorkflowParse(format!(
                "invalid config source {}: {e}",
                path.display()
            ))
        })?;
        debug!(path = %path.display(), "loaded config source");
        Ok(Self {
            path: path.to_path_buf(),
            root: yaml_to_json(yaml),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up a possibly-dotted path. Returns `None` when any segment is
    /// missing.
    pub fn get(&self, dotted: &str) -> Option<&Value> {
        lookup_path(&self.root, dotted)
    }

    /// Look up a dotted path, failing fatally when it is absent.
    pub fn require(&self, dotted: &str) -> Result<&Value> {
        self.get(dotted).ok_or_else(|| {
            OrchestratorError::Fatal(format!(
                "config source {} has no value at '{dotted}'",
                self.path.display()
            ))
        })
    }

    /// `require` rendered to the string form used in variable substitution.
    pub fn require_string(&self, dotted: &str) -> Result<String> {
        Ok(value_to_display_string(self.require(dotted)?))
    }
}

/// Walk a dotted path through nested objects.
pub(crate) fn lookup_path<'a>(root: &'a Value, dotted: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in dotted.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Render a JSON value the way it appears after substitution into text.
pub(crate) fn value_to_display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Convert a parsed YAML tree into the JSON value model used by the
/// variable scope. Non-string mapping keys are rendered through their YAML
/// string form; tagged values collapse to their inner value.
pub(crate) fn yaml_to_json(yaml: serde_yaml::Value) -> Value {
    match yaml {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                n.as_f64().map(Value::from).unwrap_or(Value::Null)
            }
        }
        serde_yaml::Value::String(s) => Value::String(s),
        serde_yaml::Value::Sequence(seq) => {
            Value::Array(seq.into_iter().map(yaml_to_json).collect())
        }
        serde_yaml::Value::Mapping(map) => {
            let mut object = serde_json::Map::new();
            for (key, value) in map {
                let key = match key {
                    serde_yaml::Value::String(s) => s,
                    other => serde_yaml::to_string(&other)
                        .map(|s| s.trim().to_string())
                        .unwrap_or_default(),
                };
                object.insert(key, yaml_to_json(value));
            }
            Value::Object(object)
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(tagged.value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    async fn source_from(text: &str) -> ConfigSource {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        ConfigSource::load(file.path()).await.unwrap()
    }

    #[tokio::test]
    async fn dotted_lookup_reaches_nested_scalars() {
        let source = source_from(
            "project:\n  name: demo\n  levels:\n    max: 4\noutput_folder: docs\n",
        )
        .await;
        assert_eq!(source.require_string("project.name").unwrap(), "demo");
        assert_eq!(source.require_string("project.levels.max").unwrap(), "4");
        assert_eq!(source.require_string("output_folder").unwrap(), "docs");
    }

    #[tokio::test]
    async fn missing_path_is_a_fatal_error() {
        let source = source_from("a: 1\n").await;
        let err = source.require("a.b.c").unwrap_err();
        assert!(matches!(err, OrchestratorError::Fatal(_)));
    }

    #[tokio::test]
    async fn unreadable_file_is_a_parse_error() {
        let err = ConfigSource::load("/nonexistent/config.yaml")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::WorkflowParse(_)));
    }

    #[test]
    fn yaml_numbers_and_bools_convert_losslessly() {
        let yaml: serde_yaml::Value =
            serde_yaml::from_str("i: 3\nf: 1.5\nb: true\nlist: [1, 2]\n").unwrap();
        let json = yaml_to_json(yaml);
        assert_eq!(json["i"], 3);
        assert_eq!(json["f"], 1.5);
        assert_eq!(json["b"], true);
        assert_eq!(json["list"][1], 2);
    }
}
