//! Amrita Core - the runtime core of an AI agent framework.
//!
//! One user turn runs through a reasoning/tool-use loop against a streaming
//! chat-completion adapter, with isolated sessions, an event/hook pipeline
//! with dependency injection, schema-driven tool dispatch, preset fallback,
//! and automatic conversation-memory compression.

// ============================================================================
// Core Infrastructure
// ============================================================================

pub mod config;
pub mod error;
pub mod tokens;
pub mod types;

// ============================================================================
// Domain
// ============================================================================

pub mod adapter;
pub mod chat;
pub mod hook;
pub mod mcp;
pub mod memory;
pub mod preset;
pub mod session;
pub mod tools;

use std::sync::Once;
use std::sync::Arc;

use tracing::{info, warn};

pub use adapter::{
    AdapterContext, AdapterError, AdapterRegistry, CompletionStream, ModelAdapter, OpenAiAdapter,
    StreamItem, default_adapters,
};
pub use chat::{ChatHandle, ChatTurn, ChatTurnBuilder, Registries, default_tracker};
pub use config::{
    AgentThoughtMode, AmritaConfig, CookieConfig, FunctionConfig, LLMConfig, ToolCallingMode,
    config_lookup, get_config, set_config,
};
pub use error::{AmritaError, ErrorKind};
pub use hook::{
    CompletionEvent, CustomEvent, Dependency, Event, EventKind, FallbackEvent, HookArgs,
    MatcherRegistry, ParamSpec, PreCompletionEvent, default_matchers, hook_value,
};
pub use preset::{PresetRegistry, default_presets};
pub use session::{SessionRegistry, default_sessions};
pub use tokens::{TokenOracle, set_token_oracle, token_count};
pub use tools::{
    FunctionSchema, JsonType, PropertySchema, SimpleTool, ToolEntry, ToolHandler, ToolRegistry,
    default_tools,
};
pub use types::{
    Chunk, MemoryModel, Message, MessageContent, ModelConfig, ModelPreset, Role, ToolCall,
    UniResponse, Usage,
};

static INIT: Once = Once::new();

/// Prepare the core: built-in tools, the reference adapter, and the token
/// oracle. Idempotent; call once at startup, before the first turn.
pub fn init() {
    INIT.call_once(|| {
        tools::register_builtins(&tools::default_tools());
        if let Err(e) = default_adapters().register(&["openai"], true, |ctx| {
            Arc::new(OpenAiAdapter::new(ctx)) as Arc<dyn ModelAdapter>
        }) {
            warn!(error = %e, "failed to register reference adapter");
        }
        set_token_oracle(Arc::new(tokens::EstimateOracle));
        info!("amrita core initialized");
    });
}

/// Load configured MCP servers into the global tool layer. Must follow
/// [`set_config`].
pub async fn load_amrita() -> Result<(), AmritaError> {
    let config = get_config()?;
    if !config.function.agent_mcp_client_enable
        || config.function.agent_mcp_server_scripts.is_empty()
    {
        return Ok(());
    }

    let Some(factory) = mcp::transport_factory() else {
        warn!("MCP servers configured but no transport factory installed, skipping");
        return Ok(());
    };

    let manager = global_mcp();
    let tools = tools::default_tools();
    for script in &config.function.agent_mcp_server_scripts {
        match factory(script) {
            Ok(transport) => {
                if let Err(e) = manager.attach(transport, &tools).await {
                    warn!(script = %script, error = %e, "failed to attach MCP server");
                }
            }
            Err(e) => {
                warn!(script = %script, error = %e, "failed to build MCP transport");
            }
        }
    }
    Ok(())
}

fn global_mcp() -> &'static mcp::McpManager {
    static GLOBAL_MCP: std::sync::LazyLock<mcp::McpManager> =
        std::sync::LazyLock::new(mcp::McpManager::new);
    &GLOBAL_MCP
}
