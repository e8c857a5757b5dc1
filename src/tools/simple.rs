//! Convenience tool registration.
//!
//! [`SimpleTool`] derives a full function-calling schema from declared
//! parameters and a doc text whose `Args:` section supplies per-parameter
//! descriptions, equivalent to writing the schema by hand.

use std::collections::HashMap;

use super::registry::{ToolEntry, ToolHandler};
use super::schema::{FunctionSchema, JsonType, PropertySchema};

/// Parse a doc text into a description and per-parameter descriptions.
///
/// Lines after an `Args:` marker are matched as `name (type): description`;
/// the type annotation is optional. Everything before the marker is the tool
/// description.
pub fn parse_args_doc(doc: &str) -> (String, HashMap<String, String>) {
    let lines: Vec<&str> = doc
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    let args_at = lines
        .iter()
        .position(|l| l.to_ascii_lowercase().starts_with("args:"));

    let (desc_lines, arg_lines) = match args_at {
        Some(i) => (&lines[..i], &lines[i + 1..]),
        None => (&lines[..], &[][..]),
    };

    let mut description = desc_lines.join(" ");
    if description.is_empty() {
        description = "(no description provided for this tool)".to_string();
    }

    let mut params = HashMap::new();
    for line in arg_lines {
        let Some((head, desc)) = line.split_once(':') else {
            continue;
        };
        let name = head
            .split('(')
            .next()
            .unwrap_or(head)
            .trim()
            .trim_end_matches(')');
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            continue;
        }
        let desc = desc.trim();
        let desc = if desc.is_empty() {
            format!("Parameter {name}")
        } else {
            desc.to_string()
        };
        params.insert(name.to_string(), desc);
    }

    (description, params)
}

/// Builder for schema-derived tools.
pub struct SimpleTool {
    name: String,
    description: String,
    param_docs: HashMap<String, String>,
    params: Vec<(String, JsonType, bool)>,
}

impl SimpleTool {
    /// Start a builder from a tool name and its doc text.
    pub fn new(name: impl Into<String>, doc: &str) -> Self {
        let (description, param_docs) = parse_args_doc(doc);
        Self {
            name: name.into(),
            description,
            param_docs,
            params: Vec::new(),
        }
    }

    /// Declare a required parameter.
    pub fn param(mut self, name: impl Into<String>, kind: JsonType) -> Self {
        self.params.push((name.into(), kind, true));
        self
    }

    /// Declare an optional parameter.
    pub fn optional(mut self, name: impl Into<String>, kind: JsonType) -> Self {
        self.params.push((name.into(), kind, false));
        self
    }

    /// The derived schema.
    pub fn schema(&self) -> FunctionSchema {
        let mut schema = FunctionSchema::new(&self.name, &self.description);
        for (name, kind, required) in &self.params {
            let desc = self
                .param_docs
                .get(name)
                .cloned()
                .unwrap_or_else(|| format!("Parameter {name}"));
            schema = schema.property(name, PropertySchema::new(*kind, desc), *required);
        }
        schema
    }

    /// Finish the builder with a default-mode handler.
    pub fn build<F, Fut>(self, f: F) -> ToolEntry
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        ToolEntry::new(self.schema(), ToolHandler::default_fn(f))
    }
}
