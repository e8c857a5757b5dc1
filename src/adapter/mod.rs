//! Provider-agnostic model adapters.
//!
//! An adapter turns a request into a lazy stream of content deltas followed
//! by exactly one terminal [`UniResponse`]. Adapters are constructed from a
//! preset through a registry keyed by protocol tag.

mod openai;
mod sse;

pub use openai::OpenAiAdapter;
pub use sse::{SseEvent, SseEventStream};

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, LazyLock, RwLock};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use thiserror::Error;
use tracing::warn;

use crate::config::AmritaConfig;
use crate::error::AmritaError;
use crate::tools::FunctionSchema;
use crate::types::{Message, ModelPreset, UniResponse};

// ============================================================================
// Errors
// ============================================================================

/// Errors produced by model adapters.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// HTTP request failed.
    #[error("http request failed: {0}")]
    Request(reqwest::Error),

    /// The API returned an error response.
    #[error("api error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// The response body could not be decoded.
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    /// The request deadline elapsed.
    #[error("request timed out")]
    Timeout,

    /// The byte stream broke mid-response.
    #[error("stream error: {0}")]
    Stream(String),

    /// The stream ended without a terminal response.
    #[error("adapter stream ended without a terminal response")]
    MissingFinal,
}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AdapterError::Timeout
        } else {
            AdapterError::Request(e)
        }
    }
}

// ============================================================================
// Contract
// ============================================================================

/// One item of an adapter stream.
#[derive(Debug, Clone)]
pub enum StreamItem {
    /// Incremental assistant content.
    Delta(String),
    /// The terminal response; exactly one per stream, always last.
    Final(UniResponse),
}

/// A lazy adapter response.
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<StreamItem, AdapterError>> + Send>>;

/// The streaming chat-completion contract every provider implements.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// Send the request and return the response stream.
    ///
    /// The stream yields zero or more [`StreamItem::Delta`] chunks and then
    /// exactly one [`StreamItem::Final`]. When the preset disables
    /// streaming, only the terminal item is yielded.
    async fn call_api(
        &self,
        messages: &[Message],
        tools: &[FunctionSchema],
    ) -> Result<CompletionStream, AdapterError>;
}

/// Drain a completion stream and return its terminal response.
pub async fn drain_final(mut stream: CompletionStream) -> Result<UniResponse, AdapterError> {
    let mut last = None;
    while let Some(item) = stream.next().await {
        if let StreamItem::Final(response) = item? {
            last = Some(response);
        }
    }
    last.ok_or(AdapterError::MissingFinal)
}

// ============================================================================
// Registry
// ============================================================================

/// Construction inputs handed to adapter constructors.
#[derive(Clone)]
pub struct AdapterContext {
    pub preset: ModelPreset,
    pub config: AmritaConfig,
    /// Shared HTTP client for connection pooling across adapters.
    pub client: reqwest::Client,
}

type AdapterCtor = Arc<dyn Fn(AdapterContext) -> Arc<dyn ModelAdapter> + Send + Sync>;

/// Protocol tag → adapter constructor.
pub struct AdapterRegistry {
    ctors: RwLock<HashMap<String, AdapterCtor>>,
    client: reqwest::Client,
}

static DEFAULT_ADAPTERS: LazyLock<Arc<AdapterRegistry>> =
    LazyLock::new(|| Arc::new(AdapterRegistry::new()));

/// The process-wide adapter registry.
pub fn default_adapters() -> Arc<AdapterRegistry> {
    DEFAULT_ADAPTERS.clone()
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            ctors: RwLock::new(HashMap::new()),
            client: reqwest::Client::new(),
        }
    }

    /// Bind a constructor to one or more protocol tags.
    ///
    /// Binding an already-taken tag fails unless `override_existing` is set,
    /// in which case the previous binding is replaced with a warning.
    pub fn register<F>(
        &self,
        tags: &[&str],
        override_existing: bool,
        ctor: F,
    ) -> Result<(), AmritaError>
    where
        F: Fn(AdapterContext) -> Arc<dyn ModelAdapter> + Send + Sync + 'static,
    {
        let ctor: AdapterCtor = Arc::new(ctor);
        let mut ctors = self.ctors.write().expect("adapter registry lock poisoned");
        for tag in tags {
            if ctors.contains_key(*tag) {
                if !override_existing {
                    return Err(AmritaError::Configuration(format!(
                        "adapter protocol {tag} is already registered"
                    )));
                }
                warn!(protocol = %tag, "replacing registered adapter protocol");
            }
        }
        for tag in tags {
            ctors.insert((*tag).to_string(), ctor.clone());
        }
        Ok(())
    }

    /// Whether a protocol tag is bound.
    pub fn has(&self, protocol: &str) -> bool {
        self.ctors
            .read()
            .expect("adapter registry lock poisoned")
            .contains_key(protocol)
    }

    /// Construct the adapter bound to the preset's protocol tag.
    pub fn resolve(
        &self,
        preset: &ModelPreset,
        config: &AmritaConfig,
    ) -> Result<Arc<dyn ModelAdapter>, AmritaError> {
        let ctor = {
            let ctors = self.ctors.read().expect("adapter registry lock poisoned");
            ctors
                .get(&preset.protocol)
                .cloned()
                .ok_or_else(|| AmritaError::not_found("adapter protocol", &preset.protocol))?
        };
        Ok(ctor(AdapterContext {
            preset: preset.clone(),
            config: config.clone(),
            client: self.client.clone(),
        }))
    }
}
