//! The per-turn agent loop.
//!
//! One turn iterates model call → tool dispatch until the model produces a
//! response without tool calls, coordinating hooks, fallback retries,
//! streaming delivery, and the end-of-turn memory commit.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::adapter::{AdapterError, ModelAdapter, StreamItem};
use crate::config::{AgentThoughtMode, AmritaConfig, ToolCallNotice, ToolCallingMode};
use crate::error::{AmritaError, ErrorKind};
use crate::hook::{
    CompletionEvent, CustomEvent, Event, FallbackEvent, HookArgs, PreCompletionEvent,
};
use crate::memory::{build_request_messages, compress};
use crate::tokens::token_count;
use crate::tools::{
    self, FunctionSchema, REASONING_TOOL, STOP_TOOL, ToolContext, ToolEntry, ToolHandler,
    validate_args,
};
use crate::types::{Chunk, MemoryModel, Message, MessageContent, Role, ToolCall, UniResponse, Usage};

use super::turn::{ChatHandle, Registries, TurnShared};

const REASONING_DIRECTIVE: &str = "Think first: call the think_and_reason tool to plan your \
next step before doing anything else.";

/// Everything a turn needs to run, resolved at build time.
pub(crate) struct TurnInputs {
    pub session_id: String,
    pub user_input: MessageContent,
    pub train: BTreeMap<String, String>,
    pub config: AmritaConfig,
    pub preset: crate::types::ModelPreset,
    pub memory: MemoryModel,
    pub hook_args: HookArgs,
    pub exception_ignored: Vec<ErrorKind>,
    pub registries: Registries,
}

/// Entry point of the spawned turn task.
pub(crate) async fn run_turn(shared: Arc<TurnShared>, inputs: TurnInputs) {
    let tracker = inputs.registries.tracker.clone();
    let session_id = inputs.session_id.clone();
    let stream_id = shared.stream_id().to_string();

    shared.mark_running();
    let result = drive_turn(&shared, inputs).await;
    match result {
        Ok(()) => {
            debug!(stream_id = %stream_id, "turn completed");
            shared.mark_done(None);
            shared.post_done().await;
        }
        Err(e) => {
            warn!(stream_id = %stream_id, error = %e, "turn failed");
            let kind = e.kind();
            let message = e.to_string();
            shared.mark_done(Some((kind, message.clone())));
            shared.post_failed(kind, message).await;
        }
    }
    tracker.finish(&session_id, &stream_id);
}

fn train_messages(train: &BTreeMap<String, String>) -> Vec<Message> {
    train
        .iter()
        .map(|(role, content)| {
            let role = match role.as_str() {
                "user" => Role::User,
                "assistant" => Role::Assistant,
                _ => Role::System,
            };
            Message::new(role, content.clone())
        })
        .collect()
}

/// Active tools for the next request, honoring the calling mode, the
/// thought mode, and a requested stop.
fn select_tools(
    config: &AmritaConfig,
    registries: &Registries,
    session_tools: &crate::tools::ToolRegistry,
    rag_spent: bool,
    stop_requested: bool,
) -> Vec<Arc<ToolEntry>> {
    if stop_requested {
        return Vec::new();
    }
    match config.function.tool_calling_mode {
        ToolCallingMode::None => Vec::new(),
        ToolCallingMode::Rag if rag_spent => Vec::new(),
        mode => {
            let mut entries =
                tools::union_active(&registries.global_tools, Some(session_tools), config);
            entries.retain(|entry| match entry.name() {
                REASONING_TOOL => {
                    mode == ToolCallingMode::Agent
                        && config.function.agent_thought_mode != AgentThoughtMode::Chat
                }
                STOP_TOOL => mode == ToolCallingMode::Agent,
                _ => true,
            });
            entries
        }
    }
}

async fn drive_turn(shared: &Arc<TurnShared>, inputs: TurnInputs) -> Result<(), AmritaError> {
    let TurnInputs {
        session_id,
        user_input,
        train,
        config,
        preset,
        mut memory,
        hook_args,
        exception_ignored,
        registries,
    } = inputs;

    let session = registries.sessions.get(&session_id)?;
    let handle = ChatHandle(shared.clone());
    let train = train_messages(&train);

    memory.messages.push(Message::new(Role::User, user_input));

    let mut preset = preset;
    let mut term: u32 = 0;
    let mut attempts: u32 = 0;
    let mut stop_requested = false;
    let mut rag_spent = false;
    let mut non_builtin_calls: u32 = 0;
    let mut total_tool_calls: u32 = 0;
    let final_response: UniResponse;

    let agent_mode = config.function.tool_calling_mode == ToolCallingMode::Agent;
    let inject_reasoning_directive =
        agent_mode && config.function.agent_thought_mode == AgentThoughtMode::Reasoning;

    loop {
        if shared.cancel_token().is_cancelled() {
            return Err(AmritaError::Cancelled("turn cancelled".to_string()));
        }

        // Request window: system prompts, the dedicated cookie message, the
        // first-iteration reasoning directive, then the memory window.
        let mut effective_train = train.clone();
        if config.cookie.enable_cookie && !config.cookie.cookie.is_empty() {
            effective_train.push(Message::system(format!(
                "<HIDDEN>{}</HIDDEN>",
                config.cookie.cookie
            )));
        }
        if term == 0 && inject_reasoning_directive {
            effective_train.push(Message::system(REASONING_DIRECTIVE));
        }
        let request = build_request_messages(
            &effective_train,
            &memory,
            config.function.use_minimal_context,
        );

        let tool_entries = select_tools(
            &config,
            &registries,
            &session.tools,
            rag_spent,
            stop_requested,
        );
        let tool_schemas: Vec<FunctionSchema> =
            tool_entries.iter().map(|e| e.schema.clone()).collect();

        let pre_event = Arc::new(PreCompletionEvent::new(request, handle.clone()));
        registries
            .matchers
            .trigger_event(
                &Event::PreCompletion(pre_event.clone()),
                &config,
                &hook_args,
                &exception_ignored,
            )
            .await?;
        let request = pre_event.messages();

        // Adapter call with fallback retries. Deltas are held back until the
        // iteration's terminal response is known: only the final,
        // non-tool-call response streams to the consumer.
        let (deltas, mut response) = loop {
            let adapter = registries.adapters.resolve(&preset, &config)?;
            match stream_completion(shared, adapter, &request, &tool_schemas).await {
                Ok(pair) => break pair,
                Err(AmritaError::Adapter(e)) => {
                    attempts += 1;
                    warn!(
                        term = attempts,
                        preset = %preset.name,
                        error = %e,
                        "adapter call failed, entering fallback"
                    );
                    let fallback = Arc::new(FallbackEvent::new(
                        preset.clone(),
                        e.to_string(),
                        attempts,
                        config.clone(),
                    ));
                    registries
                        .matchers
                        .trigger_event(
                            &Event::Fallback(fallback.clone()),
                            &config,
                            &hook_args,
                            &exception_ignored,
                        )
                        .await?;
                    if let Some(reason) = fallback.failure() {
                        return Err(AmritaError::FallbackFailed(reason));
                    }
                    if config.llm.auto_retry && attempts < config.llm.max_retries {
                        preset = fallback.preset();
                        continue;
                    }
                    return Err(AmritaError::Adapter(e));
                }
                Err(other) => return Err(other),
            }
        };

        if response.usage.is_none() {
            response.usage = Some(estimate_usage(&request, &response));
        }

        let assistant = match &response.tool_calls {
            Some(calls) if !calls.is_empty() => {
                Message::assistant_with_calls(response.content.clone(), calls.clone())
            }
            _ => Message::assistant(response.content.clone()),
        };
        if assistant.validate().is_ok() {
            memory.messages.push(assistant);
        }

        let completion_event = Arc::new(CompletionEvent::new(response.clone(), handle.clone()));
        registries
            .matchers
            .trigger_event(
                &Event::Completion(completion_event.clone()),
                &config,
                &hook_args,
                &exception_ignored,
            )
            .await?;
        let response = completion_event.response();

        if !response.has_tool_calls() {
            flush_deltas(&handle, deltas, &response).await?;
            final_response = response;
            break;
        }

        let calls = response.tool_calls.clone().unwrap_or_default();

        // Reasoning enforcement: in reasoning-required mode an iteration
        // without a think_and_reason call is rejected wholesale.
        if agent_mode
            && config.function.agent_thought_mode == AgentThoughtMode::ReasoningRequired
            && !calls.iter().any(|c| c.function.name == REASONING_TOOL)
        {
            debug!("rejecting tool calls: reasoning required");
            for call in &calls {
                memory.messages.push(Message::tool_result(
                    &call.function.name,
                    "reasoning required: call think_and_reason before other tools",
                    &call.id,
                ));
            }
            term += 1;
            continue;
        }

        for call in &calls {
            if shared.cancel_token().is_cancelled() {
                return Err(AmritaError::Cancelled(
                    "turn cancelled during tool dispatch".to_string(),
                ));
            }
            total_tool_calls += 1;
            dispatch_tool_call(
                DispatchContext {
                    shared,
                    handle: &handle,
                    config: &config,
                    memory: &mut memory,
                    tool_entries: &tool_entries,
                    rag_spent: &mut rag_spent,
                    stop_requested: &mut stop_requested,
                    non_builtin_calls: &mut non_builtin_calls,
                },
                call,
            )
            .await?;
            if stop_requested {
                break;
            }
        }

        if total_tool_calls > config.function.agent_max_tool_calls {
            info!(
                total_tool_calls,
                limit = config.function.agent_max_tool_calls,
                "tool call budget exhausted, forcing completion"
            );
            stop_requested = true;
        }
        term += 1;
    }

    // Cookie leak scan over the delivered content.
    if config.cookie.enable_cookie
        && !config.cookie.cookie.is_empty()
        && final_response.content.contains(&config.cookie.cookie)
    {
        warn!(
            stream_id = %shared.stream_id(),
            session_id = %session_id,
            "cookie marker leaked into user-visible output, flagging prompt injection"
        );
        shared.set_injection_detected();
        let event = Arc::new(CustomEvent::new(
            "cookie_leak",
            json!({
                "stream_id": shared.stream_id(),
                "session_id": session_id,
            }),
            Some(handle.clone()),
        ));
        if let Err(e) = registries
            .matchers
            .trigger_event(&Event::Custom(event), &config, &hook_args, &exception_ignored)
            .await
        {
            warn!(error = %e, "cookie_leak event dispatch failed");
        }
    }

    // End-of-turn compression, then the atomic memory commit.
    if let Ok(adapter) = registries.adapters.resolve(&preset, &config)
        && let Err(e) = compress(&mut memory, &config, adapter).await
    {
        warn!(error = %e, "memory compression failed");
    }
    session.replace_memory(memory);

    Ok(())
}

/// Consume an adapter stream into its deltas and terminal response,
/// honoring cancellation.
async fn stream_completion(
    shared: &Arc<TurnShared>,
    adapter: Arc<dyn ModelAdapter>,
    request: &[Message],
    tools: &[FunctionSchema],
) -> Result<(Vec<String>, UniResponse), AmritaError> {
    let mut stream = adapter.call_api(request, tools).await?;

    let mut deltas = Vec::new();
    let mut response = None;
    loop {
        let item = tokio::select! {
            _ = shared.cancel_token().cancelled() => {
                return Err(AmritaError::Cancelled(
                    "turn cancelled during adapter stream".to_string(),
                ));
            }
            item = stream.next() => item,
        };
        match item {
            Some(Ok(StreamItem::Delta(delta))) => deltas.push(delta),
            Some(Ok(StreamItem::Final(r))) => response = Some(r),
            Some(Err(e)) => return Err(AmritaError::Adapter(e)),
            None => break,
        }
    }

    let response = response.ok_or(AmritaError::Adapter(AdapterError::MissingFinal))?;
    Ok((deltas, response))
}

/// Stream the final iteration's content to the consumer.
///
/// When a completion hook rewrote the content, the original deltas no longer
/// add up to it; the rewritten content is delivered as one chunk instead.
async fn flush_deltas(
    handle: &ChatHandle,
    deltas: Vec<String>,
    response: &UniResponse,
) -> Result<(), AmritaError> {
    let streamed: String = deltas.concat();
    if streamed == response.content {
        for delta in deltas {
            handle.yield_response(Chunk::Text(delta)).await?;
        }
    } else if !response.content.is_empty() {
        handle
            .yield_response(Chunk::Text(response.content.clone()))
            .await?;
    }
    Ok(())
}

fn estimate_usage(request: &[Message], response: &UniResponse) -> Usage {
    let prompt: usize = request.iter().map(|m| token_count(&m.text())).sum();
    let completion = token_count(&response.content);
    Usage {
        prompt_tokens: prompt as u32,
        completion_tokens: completion as u32,
        total_tokens: (prompt + completion) as u32,
    }
}

struct DispatchContext<'a> {
    shared: &'a Arc<TurnShared>,
    handle: &'a ChatHandle,
    config: &'a AmritaConfig,
    memory: &'a mut MemoryModel,
    tool_entries: &'a [Arc<ToolEntry>],
    rag_spent: &'a mut bool,
    stop_requested: &'a mut bool,
    non_builtin_calls: &'a mut u32,
}

/// Execute one tool call and append its result message.
async fn dispatch_tool_call(
    ctx: DispatchContext<'_>,
    call: &ToolCall,
) -> Result<(), AmritaError> {
    let name = call.function.name.as_str();
    let builtin = tools::is_builtin(name);
    debug!(tool = %name, call_id = %call.id, "dispatching tool call");

    // agent_stop marks the turn ready for its final completion.
    if name == STOP_TOOL {
        info!(stream_id = %ctx.shared.stream_id(), "agent signalled completion");
        let mut text = "You have indicated readiness to provide the final answer. Now \
                        generate the final, comprehensive response for the user."
            .to_string();
        if let Ok(args) = serde_json::from_str::<Value>(&call.function.arguments)
            && let Some(result) = args.get("result").and_then(|v| v.as_str())
        {
            text.push_str("\nWork summary:\n");
            text.push_str(result);
        }
        ctx.memory
            .messages
            .push(Message::tool_result(STOP_TOOL, text, &call.id));
        *ctx.stop_requested = true;
        return Ok(());
    }

    // RAG mode allows a single invocation per turn.
    if ctx.config.function.tool_calling_mode == ToolCallingMode::Rag && *ctx.rag_spent && !builtin {
        ctx.memory.messages.push(Message::tool_result(
            name,
            "ERR: tool calls are limited to one per turn",
            &call.id,
        ));
        return Ok(());
    }

    let Some(entry) = ctx.tool_entries.iter().find(|e| e.name() == name) else {
        warn!(tool = %name, "model requested an unavailable tool");
        ctx.memory.messages.push(Message::tool_result(
            name,
            format!("ERR: tool {name} not found"),
            &call.id,
        ));
        return Ok(());
    };

    let args: Value = match serde_json::from_str(&call.function.arguments) {
        Ok(args) => args,
        Err(e) => {
            ctx.memory.messages.push(Message::tool_result(
                name,
                format!("ERR: schema violation: arguments are not valid JSON: {e}"),
                &call.id,
            ));
            return Ok(());
        }
    };
    if let Err(violation) = validate_args(&entry.schema.parameters, &args) {
        debug!(tool = %name, violation = %violation, "tool arguments rejected");
        ctx.memory.messages.push(Message::tool_result(
            name,
            format!("ERR: schema violation: {violation}"),
            &call.id,
        ));
        return Ok(());
    }

    // The configured budget bounds non-built-in invocations.
    if !builtin {
        if *ctx.non_builtin_calls >= ctx.config.function.agent_max_tool_calls {
            ctx.memory.messages.push(Message::tool_result(
                name,
                "ERR: tool call limit reached, provide the final answer",
                &call.id,
            ));
            *ctx.stop_requested = true;
            return Ok(());
        }
        *ctx.non_builtin_calls += 1;
    }

    let notify = !builtin && ctx.config.function.agent_tool_call_notice == ToolCallNotice::Notify;
    if notify {
        ctx.handle
            .yield_response(Chunk::with_meta(
                format!("Calling function {name}"),
                json!({
                    "type": "function_call",
                    "function_name": name,
                    "is_done": false,
                    "tool_id": call.id,
                }),
            ))
            .await?;
    }

    // think_and_reason records a reasoning step without ending the loop.
    if name == REASONING_TOOL && let ToolHandler::Default(handler) = &entry.handler {
        match handler(args).await {
            Ok(reasoning) => {
                debug!(reasoning = %reasoning, "recorded reasoning step");
                if !ctx.config.function.agent_reasoning_hide {
                    ctx.handle
                        .yield_response(Chunk::with_meta(
                            format!("Thought:\n\n{reasoning}"),
                            json!({"type": "reasoning"}),
                        ))
                        .await?;
                }
                ctx.memory
                    .messages
                    .push(Message::tool_result(REASONING_TOOL, reasoning, &call.id));
            }
            Err(e) => {
                ctx.memory.messages.push(Message::tool_result(
                    REASONING_TOOL,
                    format!("ERR: tool {REASONING_TOOL} execution failed: {e}"),
                    &call.id,
                ));
            }
        }
        return Ok(());
    }

    match &entry.handler {
        ToolHandler::Default(handler) => match handler(args).await {
            Ok(result) => {
                ctx.memory
                    .messages
                    .push(Message::tool_result(name, result, &call.id));
            }
            Err(e) => {
                warn!(tool = %name, error = %e, "tool execution failed");
                ctx.memory.messages.push(Message::tool_result(
                    name,
                    format!("ERR: tool {name} execution failed: {e}"),
                    &call.id,
                ));
            }
        },
        ToolHandler::Custom(handler) => {
            let tool_ctx = ToolContext {
                args,
                turn: ctx.handle.clone(),
            };
            match handler(tool_ctx).await {
                Ok(Some(result)) => {
                    ctx.memory
                        .messages
                        .push(Message::tool_result(name, result, &call.id));
                }
                Ok(None) => {
                    debug!(tool = %name, "custom tool returned no content");
                }
                Err(e) => {
                    warn!(tool = %name, error = %e, "tool execution failed");
                    ctx.memory.messages.push(Message::tool_result(
                        name,
                        format!("ERR: tool {name} execution failed: {e}"),
                        &call.id,
                    ));
                }
            }
        }
    }

    if ctx.config.function.tool_calling_mode == ToolCallingMode::Rag && !builtin {
        *ctx.rag_spent = true;
    }

    if notify {
        ctx.handle
            .yield_response(Chunk::with_meta(
                format!("Called tool {name}"),
                json!({
                    "type": "function_call",
                    "function_name": name,
                    "is_done": true,
                    "tool_id": call.id,
                }),
            ))
            .await?;
    }

    Ok(())
}
