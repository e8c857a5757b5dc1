//! Event types dispatched through the matcher registry.
//!
//! Events are shared mutable records: handlers run sequentially in
//! registration order, so a mutation by an earlier handler is visible to
//! every later one and, for pre-completion events, to the engine itself.

use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::chat::ChatHandle;
use crate::config::AmritaConfig;
use crate::types::{Message, ModelPreset, UniResponse};

/// Kind tag used for matcher routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    PreCompletion,
    Completion,
    Fallback,
    Custom(String),
}

impl EventKind {
    pub fn custom(name: impl Into<String>) -> Self {
        EventKind::Custom(name.into())
    }
}

/// Fired before each adapter call; handlers may rewrite the outbound
/// request messages.
pub struct PreCompletionEvent {
    messages: Mutex<Vec<Message>>,
    pub chat: ChatHandle,
}

impl PreCompletionEvent {
    pub fn new(messages: Vec<Message>, chat: ChatHandle) -> Self {
        Self {
            messages: Mutex::new(messages),
            chat,
        }
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().expect("event lock poisoned").clone()
    }

    pub fn set_messages(&self, messages: Vec<Message>) {
        *self.messages.lock().expect("event lock poisoned") = messages;
    }

    pub fn push_message(&self, message: Message) {
        self.messages
            .lock()
            .expect("event lock poisoned")
            .push(message);
    }
}

/// Fired after each terminal adapter response; handlers may rewrite it.
pub struct CompletionEvent {
    response: Mutex<UniResponse>,
    pub chat: ChatHandle,
}

impl CompletionEvent {
    pub fn new(response: UniResponse, chat: ChatHandle) -> Self {
        Self {
            response: Mutex::new(response),
            chat,
        }
    }

    pub fn response(&self) -> UniResponse {
        self.response.lock().expect("event lock poisoned").clone()
    }

    pub fn set_response(&self, response: UniResponse) {
        *self.response.lock().expect("event lock poisoned") = response;
    }

    pub fn set_content(&self, content: impl Into<String>) {
        self.response.lock().expect("event lock poisoned").content = content.into();
    }
}

/// Fired when an adapter call fails; handlers may switch the preset for the
/// retry or abort the turn via [`FallbackEvent::fail`].
pub struct FallbackEvent {
    preset: Mutex<ModelPreset>,
    /// Rendered adapter error.
    pub error: String,
    /// Retry attempt number, starting at 1 for the first failure.
    pub term: u32,
    pub config: AmritaConfig,
    failed: Mutex<Option<String>>,
}

impl FallbackEvent {
    pub fn new(preset: ModelPreset, error: String, term: u32, config: AmritaConfig) -> Self {
        Self {
            preset: Mutex::new(preset),
            error,
            term,
            config,
            failed: Mutex::new(None),
        }
    }

    pub fn preset(&self) -> ModelPreset {
        self.preset.lock().expect("event lock poisoned").clone()
    }

    pub fn set_preset(&self, preset: ModelPreset) {
        *self.preset.lock().expect("event lock poisoned") = preset;
    }

    /// Abort the turn with `FallbackFailed` instead of retrying.
    pub fn fail(&self, reason: impl Into<String>) {
        *self.failed.lock().expect("event lock poisoned") = Some(reason.into());
    }

    pub fn failure(&self) -> Option<String> {
        self.failed.lock().expect("event lock poisoned").clone()
    }
}

/// A user-defined event routed by name.
pub struct CustomEvent {
    pub name: String,
    payload: Mutex<Value>,
    pub chat: Option<ChatHandle>,
}

impl CustomEvent {
    pub fn new(name: impl Into<String>, payload: Value, chat: Option<ChatHandle>) -> Self {
        Self {
            name: name.into(),
            payload: Mutex::new(payload),
            chat,
        }
    }

    pub fn payload(&self) -> Value {
        self.payload.lock().expect("event lock poisoned").clone()
    }

    pub fn set_payload(&self, payload: Value) {
        *self.payload.lock().expect("event lock poisoned") = payload;
    }
}

/// Any dispatchable event.
#[derive(Clone)]
pub enum Event {
    PreCompletion(Arc<PreCompletionEvent>),
    Completion(Arc<CompletionEvent>),
    Fallback(Arc<FallbackEvent>),
    Custom(Arc<CustomEvent>),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::PreCompletion(_) => EventKind::PreCompletion,
            Event::Completion(_) => EventKind::Completion,
            Event::Fallback(_) => EventKind::Fallback,
            Event::Custom(e) => EventKind::Custom(e.name.clone()),
        }
    }

    pub fn as_pre_completion(&self) -> Option<&Arc<PreCompletionEvent>> {
        match self {
            Event::PreCompletion(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_completion(&self) -> Option<&Arc<CompletionEvent>> {
        match self {
            Event::Completion(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_fallback(&self) -> Option<&Arc<FallbackEvent>> {
        match self {
            Event::Fallback(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_custom(&self) -> Option<&Arc<CustomEvent>> {
        match self {
            Event::Custom(e) => Some(e),
            _ => None,
        }
    }
}
