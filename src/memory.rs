//! Conversation-memory compression.
//!
//! When the non-system message count reaches the configured limit, the
//! oldest slice of the conversation is summarized through the model and
//! replaced by a single system message, keeping the running `abstract`
//! authoritative for everything compacted away.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::adapter::{ModelAdapter, drain_final};
use crate::config::AmritaConfig;
use crate::error::AmritaError;
use crate::types::{MemoryModel, Message, Role};

const SUMMARY_INSTRUCTIONS: &str = "You are a professional context summarizer. Summarize the \
following conversation preserving entities, decisions, and unresolved tasks. Keep the summary \
concise, accurate, and complete. Do not add explanations, comments, or supplementary \
information, and do not alter the meaning of the original.";

const ABSTRACT_SEPARATOR: &str = "\n\n";

/// Build the request window for an adapter call.
///
/// Minimal context sends the system prompts plus the current turn only: the
/// last user message and everything after it, so tool-call exchanges of the
/// running turn stay visible. Full context sends the whole message list.
pub fn build_request_messages(
    train: &[Message],
    memory: &MemoryModel,
    use_minimal_context: bool,
) -> Vec<Message> {
    let mut request: Vec<Message> = train.to_vec();
    if use_minimal_context {
        let start = memory
            .messages
            .iter()
            .rposition(|m| m.role == Role::User)
            .unwrap_or(0);
        request.extend(memory.messages[start..].iter().cloned());
    } else {
        request.extend(memory.messages.iter().cloned());
    }
    request
}

/// Indices of the victim window: the oldest `ceil(p · limit)` non-system
/// messages, extended so an assistant message is never separated from the
/// tool results of its calls.
fn victim_window(memory: &MemoryModel, target: usize) -> Vec<usize> {
    let mut victims = Vec::new();
    let mut counted = 0usize;
    let mut open_call_ids: HashSet<String> = HashSet::new();

    for (i, message) in memory.messages.iter().enumerate() {
        if message.is_system() {
            continue;
        }
        let group_tail = message.role == Role::Tool
            && message
                .tool_call_id
                .as_ref()
                .is_some_and(|id| open_call_ids.contains(id));
        if counted >= target && !group_tail {
            break;
        }
        victims.push(i);
        counted += 1;
        if let Some(calls) = &message.tool_calls {
            for call in calls {
                open_call_ids.insert(call.id.clone());
            }
        }
    }

    victims
}

fn serialize_window(memory: &MemoryModel, victims: &[usize]) -> String {
    victims
        .iter()
        .map(|&i| {
            let message = &memory.messages[i];
            let tag = match message.role {
                Role::User => "<User's query>",
                Role::Assistant => "<BOT's response>",
                Role::Tool => "<Tool call>",
                Role::System => "<System>",
            };
            format!("{tag}{}", message.text())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Apply the compression policy to `memory`.
///
/// Returns whether a compression happened. A summarization failure leaves
/// the window intact so the policy retries on the next turn.
pub async fn compress(
    memory: &mut MemoryModel,
    config: &AmritaConfig,
    adapter: Arc<dyn ModelAdapter>,
) -> Result<bool, AmritaError> {
    let limit = config.llm.memory_length_limit;
    if !config.llm.enable_memory_abstract || limit == 0 {
        return Ok(false);
    }
    let count = memory.non_system_len();
    if count < limit {
        return Ok(false);
    }

    let proportion = config.llm.memory_abstract_proportion.clamp(0.0, 1.0);
    let target = ((proportion * limit as f64).ceil() as usize).clamp(1, count);
    let victims = victim_window(memory, target);
    if victims.is_empty() {
        return Ok(false);
    }

    debug!(
        count,
        limit,
        window = victims.len(),
        "compressing conversation memory"
    );

    let window_text = serialize_window(memory, &victims);
    let request = [
        Message::system(SUMMARY_INSTRUCTIONS),
        Message::user(format!("Message list:\n```text\n{window_text}\n```")),
    ];

    let summary = match adapter.call_api(&request, &[]).await {
        Ok(stream) => match drain_final(stream).await {
            Ok(response) => response.content,
            Err(e) => {
                warn!(error = %e, "memory summarization failed, keeping window intact");
                return Ok(false);
            }
        },
        Err(e) => {
            warn!(error = %e, "memory summarization failed, keeping window intact");
            return Ok(false);
        }
    };

    let combined = if memory.abstract_.is_empty() {
        summary
    } else {
        format!("{}{}{}", memory.abstract_, ABSTRACT_SEPARATOR, summary)
    };

    // The replacement message carries the full abstract, so the summary
    // message of an earlier compression is superseded and removed with the
    // window.
    let mut removals = victims;
    if !memory.abstract_.is_empty() {
        for (i, message) in memory.messages.iter().enumerate() {
            if message.is_system() && message.text() == memory.abstract_ {
                removals.push(i);
            }
        }
    }
    removals.sort_unstable();
    removals.dedup();

    let insert_at = removals[0];
    for &i in removals.iter().rev() {
        memory.messages.remove(i);
    }
    memory
        .messages
        .insert(insert_at, Message::system(combined.clone()));
    memory.abstract_ = combined;

    Ok(true)
}
