//! Interface-level MCP client support.
//!
//! The wire protocol lives outside the core: a transport implements
//! [`McpTransport`], and the manager imports its tools into a tool registry,
//! remapping duplicate names, and removes them again on teardown.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::AmritaError;
use crate::tools::{FunctionSchema, ToolEntry, ToolHandler, ToolRegistry};

/// A connected MCP server, at interface level.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// The server script or URI this transport talks to.
    fn identity(&self) -> &str;

    /// Tool definitions exported by the server.
    async fn list_tools(&self) -> anyhow::Result<Vec<FunctionSchema>>;

    /// Invoke a tool by its original (pre-remap) name.
    async fn call_tool(&self, name: &str, args: Value) -> anyhow::Result<String>;

    /// Release the connection.
    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Builds a transport from a configured server script.
pub type TransportFactory =
    Arc<dyn Fn(&str) -> anyhow::Result<Arc<dyn McpTransport>> + Send + Sync>;

static FACTORY: RwLock<Option<TransportFactory>> = RwLock::new(None);

/// Install the process-wide transport factory used when sessions materialize
/// their configured MCP servers.
pub fn set_transport_factory(factory: TransportFactory) {
    *FACTORY.write().expect("transport factory lock poisoned") = Some(factory);
}

pub(crate) fn transport_factory() -> Option<TransportFactory> {
    FACTORY
        .read()
        .expect("transport factory lock poisoned")
        .clone()
}

struct ClientEntry {
    transport: Arc<dyn McpTransport>,
    /// Names registered into the tool registry, post-remap.
    registered: Vec<String>,
}

#[derive(Default)]
struct McpInner {
    clients: Vec<ClientEntry>,
    remap_seq: u32,
}

/// Tracks attached transports and the tools they injected.
#[derive(Default)]
pub struct McpManager {
    inner: tokio::sync::Mutex<McpInner>,
}

impl McpManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn client_count(&self) -> usize {
        self.inner.lock().await.clients.len()
    }

    /// Import a transport's tools into the registry.
    ///
    /// A tool whose name is already taken is remapped to
    /// `referred_<n>_<name>`; calls are forwarded under the original name.
    /// Returns the number of tools registered.
    pub async fn attach(
        &self,
        transport: Arc<dyn McpTransport>,
        tools: &ToolRegistry,
    ) -> Result<usize, AmritaError> {
        let schemas = transport.list_tools().await.map_err(|e| {
            AmritaError::Configuration(format!(
                "failed to list tools of MCP server {}: {e}",
                transport.identity()
            ))
        })?;

        let mut inner = self.inner.lock().await;
        let mut registered = Vec::new();

        for mut schema in schemas {
            let original = schema.name.clone();
            if tools.has(&schema.name) {
                inner.remap_seq += 1;
                let remapped = format!("referred_{}_{}", inner.remap_seq, schema.name);
                warn!(
                    tool = %schema.name,
                    remapped = %remapped,
                    server = %transport.identity(),
                    "tool name already registered, remapping"
                );
                schema.name = remapped;
            }

            let registered_name = schema.name.clone();
            let call_transport = transport.clone();
            let handler = ToolHandler::default_fn(move |args| {
                let transport = call_transport.clone();
                let name = original.clone();
                async move {
                    match transport.call_tool(&name, args).await {
                        Ok(result) => Ok(result),
                        Err(e) => Ok(serde_json::json!({
                            "success": false,
                            "error": e.to_string(),
                        })
                        .to_string()),
                    }
                }
            });

            tools.register(ToolEntry::new(schema, handler))?;
            registered.push(registered_name);
        }

        info!(
            server = %transport.identity(),
            tools = registered.len(),
            "attached MCP server"
        );
        inner.clients.push(ClientEntry {
            transport,
            registered,
        });
        Ok(inner.clients.last().map_or(0, |c| c.registered.len()))
    }

    /// Remove every imported tool and shut the transports down. Idempotent.
    pub async fn detach_all(&self, tools: &ToolRegistry) {
        let mut inner = self.inner.lock().await;
        for client in inner.clients.drain(..) {
            for name in &client.registered {
                tools.remove(name);
            }
            if let Err(e) = client.transport.shutdown().await {
                warn!(
                    server = %client.transport.identity(),
                    error = %e,
                    "MCP transport shutdown failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AmritaConfig;
    use crate::tools::{JsonType, PropertySchema};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeTransport {
        shut_down: AtomicBool,
    }

    impl FakeTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                shut_down: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl McpTransport for FakeTransport {
        fn identity(&self) -> &str {
            "fake://server"
        }

        async fn list_tools(&self) -> anyhow::Result<Vec<FunctionSchema>> {
            Ok(vec![
                FunctionSchema::new("lookup", "Look something up").property(
                    "query",
                    PropertySchema::new(JsonType::String, "Query"),
                    true,
                ),
            ])
        }

        async fn call_tool(&self, name: &str, args: Value) -> anyhow::Result<String> {
            Ok(format!("{name}:{}", args["query"].as_str().unwrap_or("")))
        }

        async fn shutdown(&self) -> anyhow::Result<()> {
            self.shut_down.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn attach_registers_and_detach_removes() {
        let manager = McpManager::new();
        let tools = ToolRegistry::new();
        let transport = FakeTransport::new();

        let count = manager.attach(transport.clone(), &tools).await.unwrap();
        assert_eq!(count, 1);
        assert!(tools.has("lookup"));
        assert_eq!(manager.client_count().await, 1);

        manager.detach_all(&tools).await;
        assert!(!tools.has("lookup"));
        assert_eq!(manager.client_count().await, 0);
        assert!(transport.shut_down.load(Ordering::SeqCst));

        manager.detach_all(&tools).await;
    }

    #[tokio::test]
    async fn duplicate_names_are_remapped() {
        let manager = McpManager::new();
        let tools = ToolRegistry::new();
        tools
            .register(ToolEntry::new(
                FunctionSchema::new("lookup", "native lookup"),
                ToolHandler::default_fn(|_args| async move { Ok("native".to_string()) }),
            ))
            .unwrap();

        manager.attach(FakeTransport::new(), &tools).await.unwrap();
        assert!(tools.has("referred_1_lookup"));

        // The remapped wrapper still calls the original tool name.
        let entry = tools.get("referred_1_lookup").unwrap();
        let ToolHandler::Default(handler) = &entry.handler else {
            panic!("expected default handler");
        };
        let out = handler(serde_json::json!({"query": "x"})).await.unwrap();
        assert_eq!(out, "lookup:x");

        let config = AmritaConfig::default();
        assert_eq!(tools.active(&config).len(), 2);
    }

    #[tokio::test]
    async fn transport_errors_fold_into_result_string() {
        struct Failing;

        #[async_trait]
        impl McpTransport for Failing {
            fn identity(&self) -> &str {
                "fail://server"
            }
            async fn list_tools(&self) -> anyhow::Result<Vec<FunctionSchema>> {
                Ok(vec![FunctionSchema::new("boom", "always fails")])
            }
            async fn call_tool(&self, _name: &str, _args: Value) -> anyhow::Result<String> {
                anyhow::bail!("connection reset")
            }
        }

        let manager = McpManager::new();
        let tools = ToolRegistry::new();
        manager.attach(Arc::new(Failing), &tools).await.unwrap();

        let entry = tools.get("boom").unwrap();
        let ToolHandler::Default(handler) = &entry.handler else {
            panic!("expected default handler");
        };
        let out = handler(serde_json::json!({})).await.unwrap();
        assert!(out.contains("connection reset"));
        assert!(out.contains("\"success\":false"));
    }
}
