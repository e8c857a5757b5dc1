//! Tool registration and lookup.
//!
//! A [`ToolRegistry`] is one layer of tools; the engine unions the global
//! layer with a session layer on each request, filtered by each tool's
//! `enable_if` predicate and the configured tool-calling mode.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, RwLock};

use futures::future::BoxFuture;
use serde_json::Value;

use crate::chat::ChatHandle;
use crate::config::AmritaConfig;
use crate::error::AmritaError;

use super::schema::FunctionSchema;

/// Context handed to custom-run tools.
///
/// Custom-run tools may stream side responses through the turn handle; the
/// handle must not be retained past the invocation.
pub struct ToolContext {
    pub args: Value,
    pub turn: ChatHandle,
}

type DefaultHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync>;
type CustomHandler =
    Arc<dyn Fn(ToolContext) -> BoxFuture<'static, anyhow::Result<Option<String>>> + Send + Sync>;

/// Invocation mode of a registered tool.
#[derive(Clone)]
pub enum ToolHandler {
    /// Receives validated arguments, returns the tool-result string.
    Default(DefaultHandler),
    /// Receives a [`ToolContext`]; returning `None` appends no tool result.
    Custom(CustomHandler),
}

impl ToolHandler {
    pub fn default_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        ToolHandler::Default(Arc::new(move |args| Box::pin(f(args))))
    }

    pub fn custom_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(ToolContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Option<String>>> + Send + 'static,
    {
        ToolHandler::Custom(Arc::new(move |ctx| Box::pin(f(ctx))))
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, ToolHandler::Custom(_))
    }
}

type EnableIf = Arc<dyn Fn(&AmritaConfig) -> bool + Send + Sync>;

/// A registered tool: schema, handler, and optional enablement predicate.
#[derive(Clone)]
pub struct ToolEntry {
    pub schema: FunctionSchema,
    pub handler: ToolHandler,
    pub enable_if: Option<EnableIf>,
}

impl ToolEntry {
    pub fn new(schema: FunctionSchema, handler: ToolHandler) -> Self {
        Self {
            schema,
            handler,
            enable_if: None,
        }
    }

    pub fn enable_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&AmritaConfig) -> bool + Send + Sync + 'static,
    {
        self.enable_if = Some(Arc::new(predicate));
        self
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    fn enabled_for(&self, config: &AmritaConfig) -> bool {
        self.enable_if.as_ref().is_none_or(|f| f(config))
    }
}

#[derive(Default)]
struct RegistryInner {
    tools: HashMap<String, Arc<ToolEntry>>,
    /// Registration order, for deterministic tool lists on the wire.
    order: Vec<String>,
    disabled: HashSet<String>,
}

/// One layer of registered tools.
#[derive(Default)]
pub struct ToolRegistry {
    inner: RwLock<RegistryInner>,
}

static DEFAULT_TOOLS: LazyLock<Arc<ToolRegistry>> = LazyLock::new(|| Arc::new(ToolRegistry::new()));

/// The process-wide global tool layer.
pub fn default_tools() -> Arc<ToolRegistry> {
    DEFAULT_TOOLS.clone()
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Fails if the name is already taken.
    pub fn register(&self, entry: ToolEntry) -> Result<(), AmritaError> {
        let mut inner = self.inner.write().expect("tool registry lock poisoned");
        let name = entry.name().to_string();
        if inner.tools.contains_key(&name) {
            return Err(AmritaError::Configuration(format!(
                "tool {name} is already registered"
            )));
        }
        inner.order.push(name.clone());
        inner.tools.insert(name, Arc::new(entry));
        Ok(())
    }

    /// Remove a tool and forget its disabled state. Idempotent.
    pub fn remove(&self, name: &str) {
        let mut inner = self.inner.write().expect("tool registry lock poisoned");
        inner.tools.remove(name);
        inner.order.retain(|n| n != name);
        inner.disabled.remove(name);
    }

    /// Whether the tool exists and is not disabled.
    pub fn has(&self, name: &str) -> bool {
        let inner = self.inner.read().expect("tool registry lock poisoned");
        !inner.disabled.contains(name) && inner.tools.contains_key(name)
    }

    /// Look up a tool, honoring the disabled set.
    pub fn get(&self, name: &str) -> Option<Arc<ToolEntry>> {
        let inner = self.inner.read().expect("tool registry lock poisoned");
        if inner.disabled.contains(name) {
            return None;
        }
        inner.tools.get(name).cloned()
    }

    /// Hide a tool without removing it.
    pub fn disable(&self, name: &str) -> Result<(), AmritaError> {
        let mut inner = self.inner.write().expect("tool registry lock poisoned");
        if !inner.tools.contains_key(name) {
            return Err(AmritaError::not_found("tool", name));
        }
        inner.disabled.insert(name.to_string());
        Ok(())
    }

    /// Undo [`ToolRegistry::disable`].
    pub fn enable(&self, name: &str) -> Result<(), AmritaError> {
        let mut inner = self.inner.write().expect("tool registry lock poisoned");
        if !inner.disabled.remove(name) {
            return Err(AmritaError::not_found("disabled tool", name));
        }
        Ok(())
    }

    pub fn disabled(&self) -> Vec<String> {
        let inner = self.inner.read().expect("tool registry lock poisoned");
        inner.disabled.iter().cloned().collect()
    }

    /// Enabled tools in registration order, filtered by `enable_if`.
    pub fn active(&self, config: &AmritaConfig) -> Vec<Arc<ToolEntry>> {
        let inner = self.inner.read().expect("tool registry lock poisoned");
        inner
            .order
            .iter()
            .filter(|name| !inner.disabled.contains(*name))
            .filter_map(|name| inner.tools.get(name))
            .filter(|entry| entry.enabled_for(config))
            .cloned()
            .collect()
    }
}

/// Union of the global and session layers; the session layer wins on name
/// conflicts.
pub fn union_active(
    global: &ToolRegistry,
    session: Option<&ToolRegistry>,
    config: &AmritaConfig,
) -> Vec<Arc<ToolEntry>> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut tools = Vec::new();
    if let Some(session) = session {
        for entry in session.active(config) {
            seen.insert(entry.name().to_string());
            tools.push(entry);
        }
    }
    for entry in global.active(config) {
        if seen.insert(entry.name().to_string()) {
            tools.push(entry);
        }
    }
    tools
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::schema::{JsonType, PropertySchema};

    fn entry(name: &str) -> ToolEntry {
        ToolEntry::new(
            FunctionSchema::new(name, "test tool").property(
                "x",
                PropertySchema::new(JsonType::String, "input"),
                true,
            ),
            ToolHandler::default_fn(|_args| async move { Ok("ok".to_string()) }),
        )
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = ToolRegistry::new();
        registry.register(entry("echo")).unwrap();
        assert!(registry.register(entry("echo")).is_err());
    }

    #[test]
    fn disabled_tools_are_invisible_until_enabled() {
        let registry = ToolRegistry::new();
        registry.register(entry("echo")).unwrap();
        registry.disable("echo").unwrap();

        assert!(!registry.has("echo"));
        assert!(registry.get("echo").is_none());
        assert_eq!(registry.disabled(), vec!["echo".to_string()]);

        registry.enable("echo").unwrap();
        assert!(registry.has("echo"));
        assert!(registry.enable("echo").is_err());
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = ToolRegistry::new();
        registry.register(entry("echo")).unwrap();
        registry.remove("echo");
        registry.remove("echo");
        assert!(!registry.has("echo"));
    }

    #[test]
    fn enable_if_filters_active_tools() {
        let registry = ToolRegistry::new();
        registry.register(entry("always")).unwrap();
        registry
            .register(entry("gated").enable_if(|cfg| cfg.function.agent_middle_message))
            .unwrap();

        let mut config = AmritaConfig::default();
        let names: Vec<_> = registry
            .active(&config)
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        assert_eq!(names, vec!["always", "gated"]);

        config.function.agent_middle_message = false;
        let names: Vec<_> = registry
            .active(&config)
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        assert_eq!(names, vec!["always"]);
    }

    #[test]
    fn session_layer_shadows_global() {
        let global = ToolRegistry::new();
        let session = ToolRegistry::new();
        global.register(entry("echo")).unwrap();
        global.register(entry("global_only")).unwrap();
        session.register(entry("echo")).unwrap();

        let config = AmritaConfig::default();
        let tools = union_active(&global, Some(&session), &config);
        assert_eq!(tools.len(), 2);
        let echo_count = tools.iter().filter(|t| t.name() == "echo").count();
        assert_eq!(echo_count, 1);
    }
}
