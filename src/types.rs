//! Core data types: messages, memory, model presets, and the unified
//! completion response shared by every adapter.

use std::fmt;

use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

// ============================================================================
// Roles & content
// ============================================================================

/// The role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        write!(f, "{s}")
    }
}

/// One structured part of a multimodal message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    Image { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// Message content: either a bare string or a list of structured parts.
///
/// Deserialization accepts a string, a parts list, or null (empty text).
/// Persisted serialization preserves the variant so memory round-trips;
/// [`MessageContent::wire_value`] collapses a single-text parts list to a
/// bare string for providers that require the compact form.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

impl MessageContent {
    /// Concatenated text of the content, ignoring non-text parts.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(s) => s.is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
        }
    }

    /// Wire form: a single-text parts list collapses to a bare string.
    pub fn wire_value(&self) -> Value {
        match self {
            MessageContent::Text(s) => Value::String(s.clone()),
            MessageContent::Parts(parts) => match parts.as_slice() {
                [ContentPart::Text { text }] => Value::String(text.clone()),
                _ => serde_json::to_value(parts).unwrap_or(Value::Null),
            },
        }
    }
}

impl Serialize for MessageContent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MessageContent::Text(s) => serializer.serialize_str(s),
            MessageContent::Parts(parts) => parts.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for MessageContent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ContentVisitor;

        impl<'de> Visitor<'de> for ContentVisitor {
            type Value = MessageContent;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string, a list of content parts, or null")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(MessageContent::Text(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
                Ok(MessageContent::Text(v))
            }

            fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(MessageContent::default())
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(MessageContent::default())
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut parts = Vec::new();
                while let Some(part) = seq.next_element::<ContentPart>()? {
                    parts.push(part);
                }
                Ok(MessageContent::Parts(parts))
            }
        }

        deserializer.deserialize_any(ContentVisitor)
    }
}

// ============================================================================
// Tool calls
// ============================================================================

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_call_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn function_call_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Raw JSON string as sent by the provider.
    pub arguments: String,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: function_call_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

// ============================================================================
// Messages
// ============================================================================

/// A message in the conversation memory or an outbound request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// An assistant message carrying tool calls (content may be empty).
    pub fn assistant_with_calls(
        content: impl Into<MessageContent>,
        tool_calls: Vec<ToolCall>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Some(tool_calls),
            tool_call_id: None,
            name: None,
        }
    }

    /// A tool-result message answering the given call id.
    pub fn tool_result(
        name: impl Into<String>,
        content: impl Into<MessageContent>,
        tool_call_id: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
        }
    }

    pub fn text(&self) -> String {
        self.content.text()
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }

    fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }

    /// An assistant message must carry content or tool calls.
    pub fn validate(&self) -> Result<(), String> {
        if self.role == Role::Assistant && self.content.is_empty() && !self.has_tool_calls() {
            return Err("assistant message with empty content and no tool calls".to_string());
        }
        Ok(())
    }

    /// Wire form for OpenAI-compatible providers.
    pub fn wire_value(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("role".into(), Value::String(self.role.to_string()));
        if self.content.is_empty() && self.has_tool_calls() {
            obj.insert("content".into(), Value::Null);
        } else {
            obj.insert("content".into(), self.content.wire_value());
        }
        if let Some(calls) = &self.tool_calls {
            obj.insert(
                "tool_calls".into(),
                serde_json::to_value(calls).unwrap_or(Value::Null),
            );
        }
        if let Some(id) = &self.tool_call_id {
            obj.insert("tool_call_id".into(), Value::String(id.clone()));
        }
        if let Some(name) = &self.name {
            obj.insert("name".into(), Value::String(name.clone()));
        }
        Value::Object(obj)
    }
}

// ============================================================================
// Conversation memory
// ============================================================================

/// Ordered conversation memory with a running summary.
///
/// Invariants: messages are chronological; every `tool` message is preceded
/// by an `assistant` message listing the matching `tool_call_id`; `abstract`
/// is authoritative for messages that have been compacted away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryModel {
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Creation time, unix seconds.
    #[serde(default)]
    pub time: i64,
    #[serde(rename = "abstract", default)]
    pub abstract_: String,
}

impl Default for MemoryModel {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryModel {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            time: chrono::Utc::now().timestamp(),
            abstract_: String::new(),
        }
    }

    /// Count of non-system messages, the unit of the compression policy.
    pub fn non_system_len(&self) -> usize {
        self.messages.iter().filter(|m| !m.is_system()).count()
    }
}

// ============================================================================
// Unified response
// ============================================================================

/// Token usage statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn accumulate(total: Option<Usage>, next: Option<Usage>) -> Option<Usage> {
        match (total, next) {
            (Some(a), Some(b)) => Some(Usage {
                prompt_tokens: a.prompt_tokens + b.prompt_tokens,
                completion_tokens: a.completion_tokens + b.completion_tokens,
                total_tokens: a.total_tokens + b.total_tokens,
            }),
            (a, b) => a.or(b),
        }
    }
}

/// The terminal item of every adapter stream: assembled content, usage, and
/// any tool calls, in a provider-independent shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniResponse {
    #[serde(default = "assistant_role")]
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

fn assistant_role() -> String {
    "assistant".to_string()
}

impl UniResponse {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            role: assistant_role(),
            content: content.into(),
            usage: None,
            tool_calls: None,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }
}

// ============================================================================
// Model presets
// ============================================================================

/// Generation parameters for a preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub top_k: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default)]
    pub thought_chain_model: bool,
    #[serde(default)]
    pub multimodal: bool,
}

fn default_top_p() -> f32 {
    1.0
}

fn default_temperature() -> f32 {
    0.7
}

fn default_stream() -> bool {
    true
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            top_k: 0,
            top_p: default_top_p(),
            temperature: default_temperature(),
            stream: default_stream(),
            thought_chain_model: false,
            multimodal: false,
        }
    }
}

/// A named bundle of model identity, endpoint, credentials, and generation
/// parameters. Round-trips through a JSON preset file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPreset {
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub config: ModelConfig,
    #[serde(default)]
    pub extra: serde_json::Map<String, Value>,
}

fn default_protocol() -> String {
    "openai".to_string()
}

impl ModelPreset {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            base_url: String::new(),
            api_key: String::new(),
            protocol: default_protocol(),
            config: ModelConfig::default(),
            extra: serde_json::Map::new(),
        }
    }
}

// ============================================================================
// Stream chunks
// ============================================================================

/// One unit of streamed output.
///
/// Plain text chunks carry model content; metadata chunks carry side-channel
/// notices (tool-call progress, reasoning steps, diagnostics) that consumers
/// may render but that are not part of the assistant's final answer.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Text(String),
    WithMeta { content: String, metadata: Value },
}

impl Chunk {
    pub fn text(content: impl Into<String>) -> Self {
        Chunk::Text(content.into())
    }

    pub fn with_meta(content: impl Into<String>, metadata: Value) -> Self {
        Chunk::WithMeta {
            content: content.into(),
            metadata,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Chunk::Text(s) => s,
            Chunk::WithMeta { content, .. } => content,
        }
    }

    pub fn is_meta(&self) -> bool {
        matches!(self, Chunk::WithMeta { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_deserializes_from_string_list_and_null() {
        let m: Message = serde_json::from_str(r#"{"role":"user","content":"hi"}"#).unwrap();
        assert_eq!(m.content, MessageContent::Text("hi".into()));

        let m: Message = serde_json::from_str(
            r#"{"role":"user","content":[{"type":"text","text":"a"},{"type":"image_url","image_url":{"url":"u"}}]}"#,
        )
        .unwrap();
        match &m.content {
            MessageContent::Parts(parts) => assert_eq!(parts.len(), 2),
            other => panic!("expected parts, got {other:?}"),
        }

        let m: Message =
            serde_json::from_str(r#"{"role":"assistant","content":null,"tool_calls":[]}"#).unwrap();
        assert!(m.content.is_empty());
    }

    #[test]
    fn wire_value_collapses_single_text_part() {
        let content = MessageContent::Parts(vec![ContentPart::Text { text: "hi".into() }]);
        assert_eq!(content.wire_value(), Value::String("hi".into()));

        let content = MessageContent::Parts(vec![
            ContentPart::Text { text: "a".into() },
            ContentPart::Text { text: "b".into() },
        ]);
        assert!(content.wire_value().is_array());
    }

    #[test]
    fn memory_serialization_round_trips() {
        let mut memory = MemoryModel::new();
        memory.messages.push(Message::user("hello"));
        memory.messages.push(Message::assistant_with_calls(
            "",
            vec![ToolCall::new("t1", "echo", r#"{"x":"y"}"#)],
        ));
        memory
            .messages
            .push(Message::tool_result("echo", "y!", "t1"));
        memory.abstract_ = "earlier talk".into();

        let json = serde_json::to_string(&memory).unwrap();
        let restored: MemoryModel = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, memory);
    }

    #[test]
    fn empty_assistant_message_is_invalid() {
        let m = Message::assistant("");
        assert!(m.validate().is_err());

        let m = Message::assistant_with_calls("", vec![ToolCall::new("t1", "echo", "{}")]);
        assert!(m.validate().is_ok());

        let m = Message::assistant("hi");
        assert!(m.validate().is_ok());
    }

    #[test]
    fn assistant_tool_call_wire_form_has_null_content() {
        let m = Message::assistant_with_calls("", vec![ToolCall::new("t1", "echo", "{}")]);
        let wire = m.wire_value();
        assert!(wire["content"].is_null());
        assert_eq!(wire["tool_calls"][0]["id"], "t1");
    }

    #[test]
    fn preset_round_trips_through_json() {
        let mut preset = ModelPreset::new("main", "gpt-test");
        preset.base_url = "https://example.invalid/v1".into();
        preset.api_key = "sk-demo".into();
        preset.config.temperature = 0.2;
        preset.extra.insert("org".into(), Value::String("acme".into()));

        let json = serde_json::to_string_pretty(&preset).unwrap();
        let restored: ModelPreset = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, preset);
    }

    #[test]
    fn usage_accumulates_across_iterations() {
        let a = Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        };
        let b = Usage {
            prompt_tokens: 3,
            completion_tokens: 2,
            total_tokens: 5,
        };
        let sum = Usage::accumulate(Some(a), Some(b)).unwrap();
        assert_eq!(sum.total_tokens, 20);
        assert_eq!(Usage::accumulate(None, Some(b)), Some(b));
        assert_eq!(Usage::accumulate(None, None), None);
    }
}
