//! Built-in agent workflow tools.

use serde_json::json;

use crate::types::Chunk;

use super::registry::{ToolEntry, ToolHandler, ToolRegistry};
use super::schema::{FunctionSchema, JsonType, PropertySchema};

pub const STOP_TOOL: &str = "agent_stop";
pub const REASONING_TOOL: &str = "think_and_reason";
pub const PROCESS_MESSAGE_TOOL: &str = "processing_message";

pub const BUILTIN_TOOL_NAMES: [&str; 3] = [STOP_TOOL, REASONING_TOOL, PROCESS_MESSAGE_TOOL];

pub fn is_builtin(name: &str) -> bool {
    BUILTIN_TOOL_NAMES.contains(&name)
}

pub fn stop_schema() -> FunctionSchema {
    FunctionSchema::new(
        STOP_TOOL,
        "Call this tool to indicate that you have gathered enough information and are ready \
         to formulate the final answer to the user. After calling this, you should NOT call \
         any other tools, but directly provide the completion.",
    )
    .property(
        "result",
        PropertySchema::new(
            JsonType::String,
            "Briefly illustrate what you did during the chat task. (Optional)",
        ),
        false,
    )
}

pub fn reasoning_schema() -> FunctionSchema {
    FunctionSchema::new(
        REASONING_TOOL,
        "Think about what you should do next; always call this tool to think when completing \
         a tool call.",
    )
    .property(
        "content",
        PropertySchema::new(JsonType::String, "What you should do next"),
        true,
    )
}

pub fn process_message_schema() -> FunctionSchema {
    FunctionSchema::new(
        PROCESS_MESSAGE_TOOL,
        "Describe what the agent is currently doing and express the agent's internal thoughts \
         to the user. Use this when you need to communicate your current actions or reasoning \
         to the user, not for the final completion.",
    )
    .property(
        "content",
        PropertySchema::new(
            JsonType::String,
            "Message content; describe what you are doing or say to the user.",
        ),
        true,
    )
}

fn stop_entry() -> ToolEntry {
    ToolEntry::new(
        stop_schema(),
        ToolHandler::default_fn(|args| async move {
            let mut response = "You have indicated readiness to provide the final answer. \
                                Now generate the final, comprehensive response for the user."
                .to_string();
            if let Some(result) = args.get("result").and_then(|v| v.as_str()) {
                response.push_str("\nWork summary:\n");
                response.push_str(result);
            }
            Ok(response)
        }),
    )
}

fn reasoning_entry() -> ToolEntry {
    ToolEntry::new(
        reasoning_schema(),
        ToolHandler::default_fn(|args| async move {
            match args.get("content").and_then(|v| v.as_str()) {
                Some(content) if !content.is_empty() => Ok(content.to_string()),
                _ => anyhow::bail!("reasoning tool was called without content"),
            }
        }),
    )
}

fn process_message_entry() -> ToolEntry {
    ToolEntry::new(
        process_message_schema(),
        ToolHandler::custom_fn(|ctx| async move {
            let content = ctx
                .args
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            tracing::debug!(content = %content, "processing_message relayed to consumer");
            ctx.turn
                .yield_response(Chunk::with_meta(
                    content.clone(),
                    json!({"type": "processing_message"}),
                ))
                .await?;
            Ok(Some(format!(
                "Sent a message to the user:\n\n```text\n{content}\n```\n"
            )))
        }),
    )
    .enable_if(|config| config.function.agent_middle_message)
}

/// Register the built-in tools into a registry. Idempotent: names that are
/// already present are left untouched.
pub fn register_builtins(registry: &ToolRegistry) {
    for entry in [stop_entry(), reasoning_entry(), process_message_entry()] {
        if !registry.has(entry.name()) {
            let _ = registry.register(entry);
        }
    }
}
