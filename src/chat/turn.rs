//! The per-turn chat object: construction, output sinks, and consumers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::Stream;
use futures::future::BoxFuture;
use futures::stream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use ulid::Ulid;

use crate::adapter::{AdapterError, AdapterRegistry, default_adapters};
use crate::config::{AmritaConfig, get_config};
use crate::error::{AmritaError, ErrorKind};
use crate::hook::{HookArgs, MatcherRegistry, default_matchers};
use crate::preset::default_presets;
use crate::session::{SessionRegistry, default_sessions};
use crate::tools::{ToolRegistry, default_tools};
use crate::types::{Chunk, MemoryModel, MessageContent, ModelPreset};

use super::engine::{self, TurnInputs};
use super::queue::{QueueItem, ResponseQueue};
use super::tracker::{TurnTracker, default_tracker};

/// Async chunk callback: invoked under a per-turn lock, in serial order.
pub type ChunkCallback = Arc<dyn Fn(Chunk) -> BoxFuture<'static, ()> + Send + Sync>;

pub(crate) struct CallbackSink {
    pub f: ChunkCallback,
    pub lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub(crate) enum Sink {
    Queue(Arc<ResponseQueue>),
    Callback(Arc<CallbackSink>),
}

#[derive(Default)]
struct TurnState {
    running: bool,
    done: bool,
    error: Option<(ErrorKind, String)>,
    ended_at: Option<DateTime<Utc>>,
    injection_detected: bool,
}

/// Shared core of a turn; hooks and tools see it through [`ChatHandle`].
pub struct TurnShared {
    stream_id: String,
    session_id: String,
    started_at: DateTime<Utc>,
    /// Human-readable timestamp header for prompt builders.
    timestamp: String,
    sink: Mutex<Sink>,
    consumer_taken: AtomicBool,
    cancel: CancellationToken,
    state: Mutex<TurnState>,
}

impl TurnShared {
    fn new(session_id: String, sink: Sink) -> Self {
        let now = Utc::now();
        Self {
            stream_id: Ulid::new().to_string(),
            session_id,
            started_at: now,
            timestamp: format!("[{}]", now.format("%Y-%m-%d %A %H:%M:%S")),
            sink: Mutex::new(sink),
            consumer_taken: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            state: Mutex::new(TurnState::default()),
        }
    }

    fn sink(&self) -> Sink {
        self.sink.lock().expect("sink lock poisoned").clone()
    }

    pub(crate) async fn yield_chunk(&self, chunk: Chunk) -> Result<(), AmritaError> {
        match self.sink() {
            Sink::Queue(queue) => queue.push(QueueItem::Chunk(chunk)).await,
            Sink::Callback(callback) => {
                let _guard = callback.lock.lock().await;
                (callback.f)(chunk).await;
                Ok(())
            }
        }
    }

    pub(crate) async fn post_done(&self) {
        if let Sink::Queue(queue) = self.sink() {
            let _ = queue.push(QueueItem::Done).await;
        }
    }

    pub(crate) async fn post_failed(&self, kind: ErrorKind, message: String) {
        if let Sink::Queue(queue) = self.sink() {
            let _ = queue.push(QueueItem::Failed(kind, message)).await;
        }
    }

    pub(crate) fn mark_running(&self) {
        self.state.lock().expect("state lock poisoned").running = true;
    }

    pub(crate) fn mark_done(&self, error: Option<(ErrorKind, String)>) {
        let mut state = self.state.lock().expect("state lock poisoned");
        state.running = false;
        state.done = true;
        state.ended_at = Some(Utc::now());
        state.error = error;
    }

    pub(crate) fn set_injection_detected(&self) {
        self.state
            .lock()
            .expect("state lock poisoned")
            .injection_detected = true;
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().expect("state lock poisoned").running
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().expect("state lock poisoned").done
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().expect("state lock poisoned").ended_at
    }

    pub fn injection_detected(&self) -> bool {
        self.state
            .lock()
            .expect("state lock poisoned")
            .injection_detected
    }

    /// The turn error, when it ended Failed.
    pub fn error(&self) -> Option<(ErrorKind, String)> {
        self.state.lock().expect("state lock poisoned").error.clone()
    }
}

/// Cloneable handle to a running turn, handed to hooks and custom-run tools.
/// Holders must not retain it past their invocation.
#[derive(Clone)]
pub struct ChatHandle(pub(crate) Arc<TurnShared>);

impl ChatHandle {
    /// Stream a chunk to the turn's consumer.
    pub async fn yield_response(&self, chunk: Chunk) -> Result<(), AmritaError> {
        self.0.yield_chunk(chunk).await
    }

    /// Close the stream early (end-of-stream sentinel).
    pub async fn set_queue_done(&self) {
        self.0.post_done().await;
    }

    pub fn stream_id(&self) -> &str {
        self.0.stream_id()
    }

    pub fn session_id(&self) -> &str {
        self.0.session_id()
    }

    pub fn timestamp(&self) -> &str {
        self.0.timestamp()
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancel.is_cancelled()
    }
}

/// Registries a turn runs against. Defaults to the process-wide instances;
/// tests provide isolated ones.
#[derive(Clone)]
pub struct Registries {
    pub sessions: SessionRegistry,
    pub matchers: Arc<MatcherRegistry>,
    pub global_tools: Arc<ToolRegistry>,
    pub adapters: Arc<AdapterRegistry>,
    pub tracker: Arc<TurnTracker>,
}

impl Default for Registries {
    fn default() -> Self {
        Self {
            sessions: default_sessions(),
            matchers: default_matchers(),
            global_tools: default_tools(),
            adapters: default_adapters(),
            tracker: default_tracker(),
        }
    }
}

const DEFAULT_QUEUE_SIZE: usize = 25;
const DEFAULT_OVERFLOW_QUEUE_SIZE: usize = 45;

/// Builder for [`ChatTurn`].
pub struct ChatTurnBuilder {
    session_id: String,
    user_input: MessageContent,
    train: BTreeMap<String, String>,
    callback: Option<ChunkCallback>,
    config: Option<AmritaConfig>,
    preset: Option<ModelPreset>,
    context: Option<MemoryModel>,
    hook_args: HookArgs,
    exception_ignored: Vec<ErrorKind>,
    auto_create_session: bool,
    queue_size: usize,
    overflow_queue_size: usize,
    registries: Option<Registries>,
}

impl ChatTurnBuilder {
    pub fn train(mut self, train: BTreeMap<String, String>) -> Self {
        self.train = train;
        self
    }

    pub fn system_prompt(mut self, content: impl Into<String>) -> Self {
        self.train.insert("system".to_string(), content.into());
        self
    }

    pub fn callback<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Chunk) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.callback = Some(Arc::new(move |chunk| Box::pin(f(chunk))));
        self
    }

    pub fn config(mut self, config: AmritaConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn preset(mut self, preset: ModelPreset) -> Self {
        self.preset = Some(preset);
        self
    }

    /// Run against an explicit memory instead of the session's.
    pub fn context(mut self, memory: MemoryModel) -> Self {
        self.context = Some(memory);
        self
    }

    pub fn hook_args(mut self, hook_args: HookArgs) -> Self {
        self.hook_args = hook_args;
        self
    }

    pub fn exception_ignored(mut self, kinds: Vec<ErrorKind>) -> Self {
        self.exception_ignored = kinds;
        self
    }

    pub fn auto_create_session(mut self, auto: bool) -> Self {
        self.auto_create_session = auto;
        self
    }

    pub fn queue_size(mut self, size: usize) -> Self {
        self.queue_size = size;
        self
    }

    pub fn overflow_queue_size(mut self, size: usize) -> Self {
        self.overflow_queue_size = size;
        self
    }

    pub fn registries(mut self, registries: Registries) -> Self {
        self.registries = Some(registries);
        self
    }

    /// Resolve the session, configuration, and preset, and produce the turn.
    pub async fn build(self) -> Result<ChatTurn, AmritaError> {
        let registries = self.registries.unwrap_or_default();

        if !registries.sessions.contains(&self.session_id) {
            if !self.auto_create_session {
                return Err(AmritaError::not_found("session", &self.session_id));
            }
            registries.sessions.init(&self.session_id).await?;
        }
        let session = registries.sessions.get(&self.session_id)?;

        let config = match self.config {
            Some(config) => config,
            None => match session.config_override() {
                Some(config) => config,
                None => get_config()?,
            },
        };

        let preset = match self.preset {
            Some(preset) => preset,
            None => session
                .presets
                .default_preset()
                .or_else(|_| default_presets().default_preset())?,
        };

        let memory = match self.context {
            Some(memory) => memory,
            None => session.memory(),
        };

        let sink = match self.callback {
            Some(f) => Sink::Callback(Arc::new(CallbackSink {
                f,
                lock: tokio::sync::Mutex::new(()),
            })),
            None => Sink::Queue(Arc::new(ResponseQueue::new(
                self.queue_size,
                self.overflow_queue_size,
            ))),
        };

        let shared = Arc::new(TurnShared::new(self.session_id.clone(), sink));

        Ok(ChatTurn {
            shared,
            inputs: Some(TurnInputs {
                session_id: self.session_id,
                user_input: self.user_input,
                train: self.train,
                config,
                preset,
                memory,
                hook_args: self.hook_args,
                exception_ignored: self.exception_ignored,
                registries,
            }),
            task: None,
        })
    }
}

/// One user turn through the agent loop.
pub struct ChatTurn {
    shared: Arc<TurnShared>,
    inputs: Option<TurnInputs>,
    task: Option<JoinHandle<()>>,
}

impl ChatTurn {
    pub fn builder(
        session_id: impl Into<String>,
        user_input: impl Into<MessageContent>,
    ) -> ChatTurnBuilder {
        ChatTurnBuilder {
            session_id: session_id.into(),
            user_input: user_input.into(),
            train: BTreeMap::new(),
            callback: None,
            config: None,
            preset: None,
            context: None,
            hook_args: HookArgs::new(),
            exception_ignored: Vec::new(),
            auto_create_session: false,
            queue_size: DEFAULT_QUEUE_SIZE,
            overflow_queue_size: DEFAULT_OVERFLOW_QUEUE_SIZE,
            registries: None,
        }
    }

    pub fn handle(&self) -> ChatHandle {
        ChatHandle(self.shared.clone())
    }

    /// Stream a side-channel chunk into this turn's sink.
    pub async fn yield_response(&self, chunk: Chunk) -> Result<(), AmritaError> {
        self.shared.yield_chunk(chunk).await
    }

    pub fn shared(&self) -> &TurnShared {
        &self.shared
    }

    pub fn stream_id(&self) -> &str {
        self.shared.stream_id()
    }

    pub fn session_id(&self) -> &str {
        self.shared.session_id()
    }

    /// Switch to callback delivery. Fails once a queue consumer exists or a
    /// callback is already set: a turn has exactly one sink.
    pub fn set_callback<F, Fut>(&self, f: F) -> Result<(), AmritaError>
    where
        F: Fn(Chunk) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.shared.consumer_taken.load(Ordering::SeqCst) {
            return Err(AmritaError::Configuration(
                "response is already being consumed from the queue".to_string(),
            ));
        }
        let mut sink = self.shared.sink.lock().expect("sink lock poisoned");
        if matches!(*sink, Sink::Callback(_)) {
            return Err(AmritaError::Configuration(
                "the callback of this turn is already set".to_string(),
            ));
        }
        *sink = Sink::Callback(Arc::new(CallbackSink {
            f: Arc::new(move |chunk| Box::pin(f(chunk))),
            lock: tokio::sync::Mutex::new(()),
        }));
        Ok(())
    }

    /// Start the turn. Fails on a second call.
    pub fn begin(&mut self) -> Result<(), AmritaError> {
        let inputs = self.inputs.take().ok_or_else(|| {
            AmritaError::Configuration("this turn has already been started".to_string())
        })?;
        debug!(
            stream_id = %self.shared.stream_id(),
            session_id = %self.shared.session_id(),
            "starting chat turn"
        );
        inputs.registries.tracker.register(
            self.shared.session_id(),
            self.shared.stream_id(),
            self.shared.cancel.clone(),
        );
        let shared = self.shared.clone();
        self.task = Some(tokio::spawn(engine::run_turn(shared, inputs)));
        Ok(())
    }

    /// Cancel the turn: aborts the adapter stream, drops pending tool
    /// invocations, marks the turn Failed.
    pub fn terminate(&self) {
        self.shared.cancel.cancel();
    }

    /// Wait for the turn task to settle.
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Stream chunks until the engine signals completion. One-shot.
    pub fn response_generator(
        &self,
    ) -> Result<impl Stream<Item = Result<Chunk, AmritaError>> + Send + 'static, AmritaError> {
        let queue = match self.shared.sink() {
            Sink::Queue(queue) => queue,
            Sink::Callback(_) => {
                return Err(AmritaError::Configuration(
                    "this turn delivers through a callback".to_string(),
                ));
            }
        };
        if self.shared.consumer_taken.swap(true, Ordering::SeqCst) {
            return Err(AmritaError::Configuration(
                "response is already being consumed".to_string(),
            ));
        }

        Ok(stream::unfold(
            (queue, false),
            |(queue, finished)| async move {
                if finished {
                    return None;
                }
                match queue.pop().await {
                    QueueItem::Chunk(chunk) => Some((Ok(chunk), (queue, false))),
                    QueueItem::Done => None,
                    QueueItem::Failed(kind, message) => {
                        Some((Err(rebuild_error(kind, message)), (queue, true)))
                    }
                }
            },
        ))
    }

    /// Drain the stream and return the concatenated assistant text. One-shot.
    ///
    /// Metadata chunks (tool notices, reasoning steps) are not part of the
    /// assistant's answer and are skipped.
    pub async fn full_response(&self) -> Result<String, AmritaError> {
        use futures::StreamExt;

        let mut stream = std::pin::pin!(self.response_generator()?);
        let mut out = String::new();
        while let Some(item) = stream.next().await {
            let chunk = item?;
            if !chunk.is_meta() {
                out.push_str(chunk.content());
            }
        }
        Ok(out)
    }
}

fn rebuild_error(kind: ErrorKind, message: String) -> AmritaError {
    match kind {
        ErrorKind::Cancelled => AmritaError::Cancelled(message),
        ErrorKind::FallbackFailed => AmritaError::FallbackFailed(message),
        ErrorKind::Adapter => AmritaError::Adapter(AdapterError::Stream(message)),
        ErrorKind::QueueClosed => AmritaError::QueueClosed,
        ErrorKind::NotInitialized => AmritaError::NotInitialized("turn failed before start"),
        ErrorKind::NotFound => AmritaError::Configuration(message),
        ErrorKind::SchemaViolation => AmritaError::SchemaViolation(message),
        ErrorKind::DependencyResolution => AmritaError::DependencyResolution(vec![message]),
        ErrorKind::Configuration => AmritaError::Configuration(message),
    }
}
