//! Runtime configuration: record types, the process-wide registry, and the
//! session-override lookup.

use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::sync::RwLock;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::AmritaError;
use crate::session::SessionRegistry;

// ============================================================================
// FunctionConfig
// ============================================================================

/// Tool calling mode for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallingMode {
    Agent,
    Rag,
    None,
}

/// Thought mode in agent workflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentThoughtMode {
    #[serde(rename = "reasoning")]
    Reasoning,
    #[serde(rename = "chat")]
    Chat,
    #[serde(rename = "reasoning-required")]
    ReasoningRequired,
    #[serde(rename = "reasoning-optional")]
    ReasoningOptional,
}

/// How tool-call progress is surfaced to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallNotice {
    Hide,
    Notify,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionConfig {
    /// Minimal context sends only the system prompts plus the last user
    /// message; full context sends the whole message list.
    #[serde(default = "default_true")]
    pub use_minimal_context: bool,
    #[serde(default = "default_tool_calling_mode")]
    pub tool_calling_mode: ToolCallingMode,
    #[serde(default = "default_thought_mode")]
    pub agent_thought_mode: AgentThoughtMode,
    #[serde(default = "default_tool_call_notice")]
    pub agent_tool_call_notice: ToolCallNotice,
    #[serde(default)]
    pub agent_reasoning_hide: bool,
    #[serde(default = "default_true")]
    pub agent_middle_message: bool,
    #[serde(default = "default_max_tool_calls")]
    pub agent_max_tool_calls: u32,
    #[serde(default)]
    pub agent_mcp_client_enable: bool,
    #[serde(default)]
    pub agent_mcp_server_scripts: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_tool_calling_mode() -> ToolCallingMode {
    ToolCallingMode::Agent
}

fn default_thought_mode() -> AgentThoughtMode {
    AgentThoughtMode::Chat
}

fn default_tool_call_notice() -> ToolCallNotice {
    ToolCallNotice::Hide
}

fn default_max_tool_calls() -> u32 {
    10
}

impl Default for FunctionConfig {
    fn default() -> Self {
        Self {
            use_minimal_context: true,
            tool_calling_mode: default_tool_calling_mode(),
            agent_thought_mode: default_thought_mode(),
            agent_tool_call_notice: default_tool_call_notice(),
            agent_reasoning_hide: false,
            agent_middle_message: true,
            agent_max_tool_calls: default_max_tool_calls(),
            agent_mcp_client_enable: false,
            agent_mcp_server_scripts: Vec::new(),
        }
    }
}

// ============================================================================
// LLMConfig
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LLMConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout")]
    pub llm_timeout_s: u64,
    #[serde(default = "default_true")]
    pub auto_retry: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Forces at least one tool call per agent-mode request.
    #[serde(default)]
    pub require_tools: bool,
    /// Maximum non-system messages kept in memory; 0 disables compression.
    #[serde(default = "default_memory_length_limit")]
    pub memory_length_limit: usize,
    #[serde(default = "default_true")]
    pub enable_memory_abstract: bool,
    /// Fraction of the window summarized away on compression, in (0, 1].
    #[serde(default = "default_abstract_proportion")]
    pub memory_abstract_proportion: f64,
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_llm_timeout() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_memory_length_limit() -> usize {
    50
}

fn default_abstract_proportion() -> f64 {
    0.15
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            llm_timeout_s: default_llm_timeout(),
            auto_retry: true,
            max_retries: default_max_retries(),
            require_tools: false,
            memory_length_limit: default_memory_length_limit(),
            enable_memory_abstract: true,
            memory_abstract_proportion: default_abstract_proportion(),
        }
    }
}

// ============================================================================
// CookieConfig
// ============================================================================

/// Prompt-injection leak detection via a random marker in system context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CookieConfig {
    #[serde(default = "default_true")]
    pub enable_cookie: bool,
    /// Opaque marker string; generated when left empty.
    #[serde(default)]
    pub cookie: String,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            enable_cookie: true,
            cookie: String::new(),
        }
    }
}

impl CookieConfig {
    /// The effective marker, generating one on first use if unset.
    pub fn marker(&mut self) -> &str {
        if self.cookie.is_empty() {
            self.cookie = random_alnum(16);
        }
        &self.cookie
    }
}

pub(crate) fn random_alnum(len: usize) -> String {
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

// ============================================================================
// AmritaConfig
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AmritaConfig {
    #[serde(default)]
    pub function: FunctionConfig,
    #[serde(default)]
    pub llm: LLMConfig,
    #[serde(default)]
    pub cookie: CookieConfig,
}

impl AmritaConfig {
    /// Load configuration from a YAML file. A missing file yields defaults;
    /// a malformed file is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AmritaError> {
        let contents = match std::fs::read_to_string(path.as_ref()) {
            Ok(c) => c,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Self::normalized_default()),
            Err(e) => {
                return Err(AmritaError::Configuration(format!(
                    "failed to read config file: {e}"
                )));
            }
        };
        let mut config: AmritaConfig = serde_saphyr::from_str(&contents)
            .map_err(|e| AmritaError::Configuration(format!("failed to parse config file: {e}")))?;
        config.cookie.marker();
        Ok(config)
    }

    /// Defaults with the cookie marker materialized.
    pub fn normalized_default() -> Self {
        let mut config = Self::default();
        config.cookie.marker();
        config
    }
}

// ============================================================================
// Process-wide registry
// ============================================================================

static GLOBAL: RwLock<Option<AmritaConfig>> = RwLock::new(None);

/// Install the process-wide configuration. Replaces any previous value.
pub fn set_config(mut config: AmritaConfig) {
    config.cookie.marker();
    *GLOBAL.write().expect("config lock poisoned") = Some(config);
}

/// The process-wide configuration; fails before the first [`set_config`].
pub fn get_config() -> Result<AmritaConfig, AmritaError> {
    GLOBAL
        .read()
        .expect("config lock poisoned")
        .clone()
        .ok_or(AmritaError::NotInitialized(
            "global config is not set, call set_config first",
        ))
}

/// Session override when one is set, otherwise the global configuration.
pub fn config_lookup(
    sessions: &SessionRegistry,
    session_id: Option<&str>,
) -> Result<AmritaConfig, AmritaError> {
    if let Some(id) = session_id
        && let Ok(session) = sessions.get(id)
        && let Some(config) = session.config_override()
    {
        return Ok(config);
    }
    get_config()
}
