//! Reference OpenAI-compatible adapter.
//!
//! Works against any `{base_url}/chat/completions` endpoint. Streaming mode
//! consumes server-sent deltas, accumulating content and per-index tool-call
//! fragments into the terminal [`UniResponse`]; non-streaming mode parses a
//! single JSON body and yields only the terminal item. Content deltas are
//! the only chunks surfaced; tool-call JSON fragments never are.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, stream};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::tools::FunctionSchema;
use crate::types::{FunctionCall, Message, ToolCall, UniResponse, Usage};

use super::sse::SseEventStream;
use super::{AdapterContext, AdapterError, CompletionStream, ModelAdapter, StreamItem};

/// Adapter for OpenAI-compatible chat-completion APIs.
pub struct OpenAiAdapter {
    ctx: AdapterContext,
}

impl OpenAiAdapter {
    pub fn new(ctx: AdapterContext) -> Self {
        Self { ctx }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.ctx.preset.base_url.trim_end_matches('/')
        )
    }

    fn request_body(&self, messages: &[Message], tools: &[FunctionSchema], stream: bool) -> Value {
        let preset = &self.ctx.preset;
        let mut body = json!({
            "model": preset.model,
            "messages": messages.iter().map(Message::wire_value).collect::<Vec<_>>(),
            "temperature": preset.config.temperature,
            "top_p": preset.config.top_p,
            "max_tokens": self.ctx.config.llm.max_tokens,
            "stream": stream,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(FunctionSchema::wire_value).collect());
            body["tool_choice"] = Value::String(
                if self.ctx.config.llm.require_tools {
                    "required"
                } else {
                    "auto"
                }
                .to_string(),
            );
        }
        if stream {
            body["stream_options"] = json!({"include_usage": true});
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, AdapterError> {
        let mut request = self
            .ctx
            .client
            .post(self.endpoint())
            .timeout(Duration::from_secs(self.ctx.config.llm.llm_timeout_s))
            .header("Content-Type", "application/json");
        if !self.ctx.preset.api_key.is_empty() {
            request = request.header(
                "Authorization",
                format!("Bearer {}", self.ctx.preset.api_key),
            );
        }

        let response = request.json(body).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(AdapterError::Api { status, message });
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelAdapter for OpenAiAdapter {
    async fn call_api(
        &self,
        messages: &[Message],
        tools: &[FunctionSchema],
    ) -> Result<CompletionStream, AdapterError> {
        let streaming = self.ctx.preset.config.stream;
        let body = self.request_body(messages, tools, streaming);
        let response = self.send(&body).await?;

        if streaming {
            let sse = SseEventStream::new(Box::pin(response.bytes_stream()));
            Ok(Box::pin(OpenAiStream::new(sse)))
        } else {
            let completion: Completion = response.json().await?;
            Ok(Box::pin(stream::iter(vec![Ok(StreamItem::Final(
                completion.into_uni_response(),
            ))])))
        }
    }
}

// ============================================================================
// Non-streaming wire types
// ============================================================================

#[derive(Deserialize)]
struct Completion {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

impl Completion {
    fn into_uni_response(mut self) -> UniResponse {
        let message = if self.choices.is_empty() {
            CompletionMessage {
                content: None,
                tool_calls: None,
            }
        } else {
            self.choices.remove(0).message
        };
        UniResponse {
            role: "assistant".to_string(),
            content: message.content.unwrap_or_default(),
            usage: self.usage,
            tool_calls: message.tool_calls.filter(|c| !c.is_empty()),
        }
    }
}

// ============================================================================
// Streaming state machine
// ============================================================================

/// Accumulates one tool call from per-index delta fragments.
#[derive(Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

struct OpenAiStream<S> {
    inner: SseEventStream<S>,
    done: bool,
    content: String,
    tool_calls: Vec<ToolCallAccumulator>,
    usage: Option<Usage>,
}

impl<S> OpenAiStream<S> {
    fn new(inner: SseEventStream<S>) -> Self {
        Self {
            inner,
            done: false,
            content: String::new(),
            tool_calls: Vec::new(),
            usage: None,
        }
    }

    fn finalize(&mut self) -> UniResponse {
        let tool_calls: Vec<ToolCall> = std::mem::take(&mut self.tool_calls)
            .into_iter()
            .filter(|acc| !acc.id.is_empty())
            .map(|acc| ToolCall {
                id: acc.id,
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: acc.name,
                    arguments: acc.arguments,
                },
            })
            .collect();
        UniResponse {
            role: "assistant".to_string(),
            content: std::mem::take(&mut self.content),
            usage: self.usage.take(),
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        }
    }

    fn absorb_chunk(&mut self, chunk: StreamChunk) -> Option<String> {
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }
        let choice = chunk.choices.into_iter().next()?;

        if let Some(tool_calls) = choice.delta.tool_calls {
            for tc in tool_calls {
                while self.tool_calls.len() <= tc.index {
                    self.tool_calls.push(ToolCallAccumulator::default());
                }
                let acc = &mut self.tool_calls[tc.index];
                if let Some(id) = tc.id {
                    acc.id = id;
                }
                if let Some(function) = tc.function {
                    if let Some(name) = function.name {
                        acc.name = name;
                    }
                    if let Some(arguments) = function.arguments {
                        acc.arguments.push_str(&arguments);
                    }
                }
            }
        }

        match choice.delta.content {
            Some(content) if !content.is_empty() => {
                self.content.push_str(&content);
                Some(content)
            }
            _ => None,
        }
    }
}

impl<S> Stream for OpenAiStream<S>
where
    S: Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Unpin,
{
    type Item = Result<StreamItem, AdapterError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    if event.data.is_empty() {
                        continue;
                    }
                    if event.data == "[DONE]" {
                        self.done = true;
                        let response = self.finalize();
                        return Poll::Ready(Some(Ok(StreamItem::Final(response))));
                    }
                    match serde_json::from_str::<StreamChunk>(&event.data) {
                        Ok(chunk) => {
                            if let Some(delta) = self.absorb_chunk(chunk) {
                                return Poll::Ready(Some(Ok(StreamItem::Delta(delta))));
                            }
                        }
                        Err(e) => {
                            tracing::debug!(data = %event.data, error = %e, "unparseable SSE chunk");
                        }
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    let response = self.finalize();
                    return Poll::Ready(Some(Ok(StreamItem::Final(response))));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// One streamed completion chunk.
#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Deserialize)]
struct StreamToolCall {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionCall>,
}

#[derive(Deserialize)]
struct StreamFunctionCall {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn stream_over(
        frames: &[&str],
    ) -> OpenAiStream<impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Unpin> {
        let chunks: Vec<Result<bytes::Bytes, reqwest::Error>> = frames
            .iter()
            .map(|f| Ok(bytes::Bytes::copy_from_slice(f.as_bytes())))
            .collect();
        OpenAiStream::new(SseEventStream::new(stream::iter(chunks)))
    }

    #[tokio::test]
    async fn content_deltas_then_final() {
        let frames = [
            r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#,
            "\n\n",
            r#"data: {"choices":[{"delta":{"content":"!"}}]}"#,
            "\n\n",
            r#"data: {"choices":[{"delta":{}}],"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7}}"#,
            "\n\ndata: [DONE]\n\n",
        ];
        let items: Vec<_> = stream_over(&frames).map(|r| r.unwrap()).collect().await;

        assert_eq!(items.len(), 3);
        assert!(matches!(&items[0], StreamItem::Delta(s) if s == "Hi"));
        assert!(matches!(&items[1], StreamItem::Delta(s) if s == "!"));
        match &items[2] {
            StreamItem::Final(response) => {
                assert_eq!(response.content, "Hi!");
                assert_eq!(response.usage.unwrap().total_tokens, 7);
                assert!(response.tool_calls.is_none());
            }
            other => panic!("expected final, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tool_call_fragments_accumulate_by_index() {
        let frames = [
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"t1","function":{"name":"echo","arguments":"{\"x\":"}}]}}]}"#,
            "\n\n",
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"hello\"}"}}]}}]}"#,
            "\n\ndata: [DONE]\n\n",
        ];
        let items: Vec<_> = stream_over(&frames).map(|r| r.unwrap()).collect().await;

        // Tool-call fragments must never surface as deltas.
        assert_eq!(items.len(), 1);
        match &items[0] {
            StreamItem::Final(response) => {
                let calls = response.tool_calls.as_ref().unwrap();
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].id, "t1");
                assert_eq!(calls[0].function.name, "echo");
                assert_eq!(calls[0].function.arguments, r#"{"x":"hello"}"#);
            }
            other => panic!("expected final, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_end_without_done_still_finalizes() {
        let frames = [r#"data: {"choices":[{"delta":{"content":"partial"}}]}"#, "\n\n"];
        let items: Vec<_> = stream_over(&frames).map(|r| r.unwrap()).collect().await;
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[1], StreamItem::Final(r) if r.content == "partial"));
    }

    #[test]
    fn non_streaming_body_parses_tool_calls() {
        let body = r#"{
            "choices":[{"message":{"content":null,"tool_calls":[
                {"id":"t1","type":"function","function":{"name":"echo","arguments":"{}"}}
            ]}}],
            "usage":{"prompt_tokens":1,"completion_tokens":2,"total_tokens":3}
        }"#;
        let completion: Completion = serde_json::from_str(body).unwrap();
        let response = completion.into_uni_response();
        assert!(response.content.is_empty());
        assert_eq!(response.tool_calls.unwrap()[0].function.name, "echo");
        assert_eq!(response.usage.unwrap().total_tokens, 3);
    }
}
