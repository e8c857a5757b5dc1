//! Session registry: isolated per-conversation containers.
//!
//! Each session owns its memory, tool layer, presets, configuration
//! override, and MCP clients. Cross-session access goes through the
//! registry's `get`; no two sessions share mutable state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, RwLock};

use dashmap::DashMap;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::config::{AmritaConfig, get_config};
use crate::error::AmritaError;
use crate::mcp::{McpManager, transport_factory};
use crate::preset::PresetRegistry;
use crate::tools::ToolRegistry;
use crate::types::MemoryModel;

pub const SESSION_ID_PREFIX: &str = "session_";

/// Container for all session-scoped state.
pub struct SessionData {
    session_id: String,
    memory: Mutex<MemoryModel>,
    pub tools: ToolRegistry,
    pub presets: PresetRegistry,
    config: RwLock<Option<AmritaConfig>>,
    pub mcp: McpManager,
    mcp_ready: AtomicBool,
}

impl SessionData {
    fn new(session_id: String, config: Option<AmritaConfig>) -> Self {
        Self {
            session_id,
            memory: Mutex::new(MemoryModel::new()),
            tools: ToolRegistry::new(),
            presets: PresetRegistry::new(),
            config: RwLock::new(config),
            mcp: McpManager::new(),
            mcp_ready: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.session_id
    }

    /// Snapshot of the session memory.
    pub fn memory(&self) -> MemoryModel {
        self.memory.lock().expect("session memory lock poisoned").clone()
    }

    /// Atomically replace the session memory (the turn-end commit).
    pub fn replace_memory(&self, memory: MemoryModel) {
        *self.memory.lock().expect("session memory lock poisoned") = memory;
    }

    pub fn config_override(&self) -> Option<AmritaConfig> {
        self.config
            .read()
            .expect("session config lock poisoned")
            .clone()
    }

    pub fn set_config_override(&self, config: Option<AmritaConfig>) {
        *self.config.write().expect("session config lock poisoned") = config;
    }

    /// Session override, else the global configuration, else defaults.
    pub fn effective_config(&self) -> AmritaConfig {
        self.config_override()
            .or_else(|| get_config().ok())
            .unwrap_or_else(AmritaConfig::normalized_default)
    }
}

/// Registry of live sessions. Thread-safe and cheap to clone.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Arc<SessionData>>>,
}

static DEFAULT_SESSIONS: LazyLock<SessionRegistry> = LazyLock::new(SessionRegistry::new);

/// The process-wide session registry.
pub fn default_sessions() -> SessionRegistry {
    DEFAULT_SESSIONS.clone()
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session with a fresh opaque id.
    pub fn new_session(&self, config: Option<AmritaConfig>) -> String {
        let id = format!("{}{}", SESSION_ID_PREFIX, Ulid::new());
        self.sessions
            .insert(id.clone(), Arc::new(SessionData::new(id.clone(), config)));
        debug!(session_id = %id, "created session");
        id
    }

    /// Materialize a session's resources: creates the entry when absent and
    /// connects configured MCP servers. Idempotent.
    pub async fn init(&self, session_id: &str) -> Result<(), AmritaError> {
        let session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(SessionData::new(session_id.to_string(), None)))
            .clone();

        let config = session.effective_config();
        if !config.function.agent_mcp_client_enable
            || config.function.agent_mcp_server_scripts.is_empty()
        {
            return Ok(());
        }
        if session.mcp_ready.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let Some(factory) = transport_factory() else {
            warn!(
                session_id = %session_id,
                "MCP servers configured but no transport factory installed, skipping"
            );
            return Ok(());
        };

        for script in &config.function.agent_mcp_server_scripts {
            match factory(script) {
                Ok(transport) => {
                    if let Err(e) = session.mcp.attach(transport, &session.tools).await {
                        warn!(session_id = %session_id, script = %script, error = %e,
                            "failed to attach MCP server");
                    }
                }
                Err(e) => {
                    warn!(session_id = %session_id, script = %script, error = %e,
                        "failed to build MCP transport");
                }
            }
        }

        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Result<Arc<SessionData>, AmritaError> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AmritaError::not_found("session", session_id))
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Tear down a session: terminate its running turns, detach MCP clients,
    /// and remove the entry. Idempotent.
    pub async fn drop_session(&self, session_id: &str) {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return;
        };
        crate::chat::default_tracker().terminate_session(session_id);
        session.mcp.detach_all(&session.tools).await;
        info!(session_id = %session_id, "dropped session");
    }

    pub fn list(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
