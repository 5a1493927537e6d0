//! bevy wiring: provider driver, cross-thread inbox, per-frame flush and the
//! events uis read.
//!
//! producers (the built-in `llm` driver or the host's own transport) push into
//! a bounded inbox. the main thread drains it in arrival order into each
//! session's `Conversation`, then commits buffered text once per frame.

use bevy::prelude::*;
use bevy::tasks::AsyncComputeTaskPool;
use flume::{Receiver, Sender, TryRecvError, TrySendError};
use futures_lite::StreamExt;
use serde_json::Value;
use std::any::type_name_of_val;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::buffer::{FrameFlushQueue, TickScheduler};
use crate::config::StreamConfig;
use crate::conversation::Conversation;
use crate::error::StreamError;
use crate::model::{AssistantEvent, Message, MessageId, RawReasoningEvent};
use crate::{ChatMessage, ChatRole, LLMProvider, StreamChoice, StreamDelta, StreamResponse};

/// ready-to-use `llm` providers.
///
/// - `default`: used when a `ChatSession` doesn't name a `key`
/// - `per_key`: named providers for multiple backends/models
#[derive(Resource, Clone)]
pub struct Providers {
    pub default: Arc<dyn LLMProvider>,
    pub per_key: HashMap<String, Arc<dyn LLMProvider>>,
}

impl Providers {
    pub fn new(default: Arc<dyn LLMProvider>) -> Self {
        Self { default, per_key: HashMap::new() }
    }

    pub fn with(mut self, key: impl Into<String>, provider: Arc<dyn LLMProvider>) -> Self {
        self.per_key.insert(key.into(), provider);
        self
    }

    fn get(&self, key: Option<&str>) -> Arc<dyn LLMProvider> {
        key.and_then(|k| self.per_key.get(k))
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// on native a small tokio runtime drives the `llm` futures so neither the
/// main thread nor bevy's compute pool blocks on network reads.
#[cfg(not(target_arch = "wasm32"))]
#[derive(Resource, Clone)]
pub struct TokioRt(pub Arc<tokio::runtime::Runtime>);

#[cfg(not(target_arch = "wasm32"))]
impl Default for TokioRt {
    fn default() -> Self {
        info!(target: "bevy_llm_stream", "initializing tokio multi-thread runtime (native)");
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("tokio runtime");
        Self(Arc::new(rt))
    }
}

#[derive(SystemSet, Debug, Hash, PartialEq, Eq, Clone)]
pub enum StreamSet {
    /// inbox applied to conversations, stop requests handled
    Drain,
    /// buffered text committed, `MessageCommitted` emitted
    Flush,
}

/// attach to an entity you want to chat on. a `Conversation` is added to it
/// automatically.
#[derive(Component, Clone, Debug, Default)]
pub struct ChatSession {
    /// picks a provider from `Providers::per_key`.
    pub key: Option<String>,
    /// stream (`chat_stream_struct`) or one-shot (`chat`).
    pub stream: bool,
}

/// insert to start a turn on a session entity. only the *new* messages; the
/// provider keeps its own history.
#[derive(Component, Clone, Debug)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
}

pub fn send_user_text(commands: &mut Commands, target: Entity, text: impl Into<String>) {
    let text = text.into();
    debug!(target: "bevy_llm_stream", "send_user_text -> entity={:?} len={}", target, text.len());
    let msg = ChatMessage::user().content(text).build();
    commands.entity(target).insert(ChatRequest { messages: vec![msg] });
}

/// ask the session to cancel its in-flight turn.
#[derive(Event, Debug, Clone, Copy)]
pub struct StopStreaming {
    pub entity: Entity,
}

#[derive(Event, Debug)]
pub struct ChatStarted {
    pub entity: Entity,
    pub message: MessageId,
}

/// buffered text landed on `message` this frame.
#[derive(Event, Debug)]
pub struct MessageCommitted {
    pub entity: Entity,
    pub message: MessageId,
}

#[derive(Event, Debug)]
pub struct ReasoningUpdated {
    pub entity: Entity,
    pub message: MessageId,
    pub finished: bool,
}

#[derive(Event, Debug)]
pub struct ChatCompletedEvt {
    pub entity: Entity,
    pub message: MessageId,
}

#[derive(Event, Debug)]
pub struct ChatErrorEvt {
    pub entity: Entity,
    pub error: String,
}

/// what producers push. `turn` pins a message to the turn it was produced
/// for; `None` follows whatever turn is open.
#[derive(Debug)]
pub(crate) enum StreamMsg {
    Fragment { entity: Entity, turn: Option<MessageId>, text: String },
    Reasoning { entity: Entity, turn: Option<MessageId>, event: RawReasoningEvent },
    Tool { entity: Entity, turn: Option<MessageId>, calls: Vec<Value> },
    Done { entity: Entity, turn: Option<MessageId>, final_text: Option<String> },
    Err { entity: Entity, turn: Option<MessageId>, error: String },
}

impl StreamMsg {
    fn route(&self) -> (Entity, Option<MessageId>) {
        match self {
            Self::Fragment { entity, turn, .. }
            | Self::Reasoning { entity, turn, .. }
            | Self::Tool { entity, turn, .. }
            | Self::Done { entity, turn, .. }
            | Self::Err { entity, turn, .. } => (*entity, *turn),
        }
    }
}

/// cross-thread inbox; producers send, the main thread drains. bounded so a
/// stalled frame applies backpressure instead of growing without limit.
#[derive(Resource, Clone)]
pub struct StreamInbox {
    tx: Sender<StreamMsg>,
    rx: Receiver<StreamMsg>,
}

impl StreamInbox {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity);
        Self { tx, rx }
    }

    /// a handle for a host-owned transport feeding `entity`.
    pub fn sender(&self, entity: Entity) -> StreamSender {
        StreamSender { tx: self.tx.clone(), entity, turn: None }
    }
}

impl Default for StreamInbox {
    fn default() -> Self {
        Self::new(StreamConfig::default().inbox_capacity)
    }
}

/// producer handle for one session. the async methods wait for inbox space;
/// the `try_` methods never block and are safe to call from systems.
#[derive(Clone)]
pub struct StreamSender {
    tx: Sender<StreamMsg>,
    entity: Entity,
    turn: Option<MessageId>,
}

impl StreamSender {
    async fn send(&self, msg: StreamMsg) -> Result<(), StreamError> {
        self.tx.send_async(msg).await.map_err(|_| StreamError::InboxClosed)
    }

    fn try_send(&self, msg: StreamMsg) -> Result<(), StreamError> {
        self.tx.try_send(msg).map_err(|err| match err {
            TrySendError::Full(_) => StreamError::InboxFull,
            TrySendError::Disconnected(_) => StreamError::InboxClosed,
        })
    }

    pub async fn fragment(&self, text: impl Into<String>) -> Result<(), StreamError> {
        let (entity, turn) = (self.entity, self.turn);
        self.send(StreamMsg::Fragment { entity, turn, text: text.into() }).await
    }

    pub async fn reasoning(&self, event: RawReasoningEvent) -> Result<(), StreamError> {
        let (entity, turn) = (self.entity, self.turn);
        self.send(StreamMsg::Reasoning { entity, turn, event }).await
    }

    pub async fn tool_calls(&self, calls: Vec<Value>) -> Result<(), StreamError> {
        let (entity, turn) = (self.entity, self.turn);
        self.send(StreamMsg::Tool { entity, turn, calls }).await
    }

    pub async fn done(&self, final_text: Option<String>) -> Result<(), StreamError> {
        let (entity, turn) = (self.entity, self.turn);
        self.send(StreamMsg::Done { entity, turn, final_text }).await
    }

    pub async fn error(&self, error: impl Into<String>) -> Result<(), StreamError> {
        let (entity, turn) = (self.entity, self.turn);
        self.send(StreamMsg::Err { entity, turn, error: error.into() }).await
    }

    pub fn try_fragment(&self, text: impl Into<String>) -> Result<(), StreamError> {
        let (entity, turn) = (self.entity, self.turn);
        self.try_send(StreamMsg::Fragment { entity, turn, text: text.into() })
    }

    pub fn try_reasoning(&self, event: RawReasoningEvent) -> Result<(), StreamError> {
        let (entity, turn) = (self.entity, self.turn);
        self.try_send(StreamMsg::Reasoning { entity, turn, event })
    }

    pub fn try_done(&self, final_text: Option<String>) -> Result<(), StreamError> {
        let (entity, turn) = (self.entity, self.turn);
        self.try_send(StreamMsg::Done { entity, turn, final_text })
    }
}

/// hand a reasoning envelope from the host's own transport to `entity`.
pub fn push_reasoning_event(
    inbox: &StreamInbox,
    entity: Entity,
    event: RawReasoningEvent,
) -> Result<(), StreamError> {
    inbox.sender(entity).try_reasoning(event)
}

/// wires resources, events and systems. insert a `Providers` resource to use
/// the built-in `llm` driver; without it, feed sessions through
/// `StreamInbox::sender`.
pub struct StreamPlugin;

impl Plugin for StreamPlugin {
    fn build(&self, app: &mut App) {
        let config = app
            .world()
            .get_resource::<StreamConfig>()
            .cloned()
            .unwrap_or_default();
        info!(target: "bevy_llm_stream", "StreamPlugin: build() inbox_capacity={}", config.inbox_capacity);

        app.insert_resource(StreamInbox::new(config.inbox_capacity))
            .insert_resource(config)
            .init_resource::<FrameFlushQueue>()
            .add_event::<StopStreaming>()
            .add_event::<ChatStarted>()
            .add_event::<MessageCommitted>()
            .add_event::<ReasoningUpdated>()
            .add_event::<ChatCompletedEvt>()
            .add_event::<ChatErrorEvt>()
            .configure_sets(Update, (StreamSet::Drain, StreamSet::Flush).chain())
            .add_systems(
                Update,
                (attach_conversations, spawn_chat_requests)
                    .chain()
                    .before(StreamSet::Drain),
            )
            .add_systems(
                Update,
                (handle_stop_requests, drain_stream_inbox)
                    .chain()
                    .in_set(StreamSet::Drain),
            )
            .add_systems(Update, flush_scheduled_buffers.in_set(StreamSet::Flush));

        #[cfg(not(target_arch = "wasm32"))]
        if app.world().get_resource::<TokioRt>().is_none() {
            app.insert_resource(TokioRt::default());
        }
    }
}

fn attach_conversations(
    mut commands: Commands,
    config: Res<StreamConfig>,
    q: Query<Entity, (With<ChatSession>, Without<Conversation>)>,
) {
    for e in q.iter() {
        commands
            .entity(e)
            .insert(Conversation::new(config.keep_raw_payloads));
    }
}

/// begins a turn per pending request and hands the provider call off-thread.
fn spawn_chat_requests(
    mut commands: Commands,
    providers: Option<Res<Providers>>,
    inbox: Res<StreamInbox>,
    mut flush_queue: ResMut<FrameFlushQueue>,
    mut q: Query<(Entity, &ChatSession, &ChatRequest, &mut Conversation)>,
    mut ev_start: EventWriter<ChatStarted>,
    #[cfg(not(target_arch = "wasm32"))] rt: Res<TokioRt>,
) {
    for (e, session, req, mut conv) in q.iter_mut() {
        commands.entity(e).remove::<ChatRequest>();
        let Some(providers) = providers.as_ref() else {
            warn!(target: "bevy_llm_stream", "chat request on {:?} without a Providers resource, dropping", e);
            continue;
        };
        let provider = providers.get(session.key.as_deref());

        for m in req.messages.iter().filter(|m| matches!(m.role, ChatRole::User)) {
            conv.add_message(Message::human(m.content.clone()));
        }
        let cancel = CancellationToken::new();
        let turn = conv.begin_assistant_turn(cancel.clone(), &mut flush_queue.scheduler_for(e));
        ev_start.write(ChatStarted { entity: e, message: turn });

        info!(target: "bevy_llm_stream",
            "spawn_chat_requests: entity={:?} turn={} provider={} stream={} msgs={}",
            e, turn, type_name_of_val(provider.as_ref()), session.stream, req.messages.len()
        );

        let out = StreamSender { tx: inbox.tx.clone(), entity: e, turn: Some(turn) };
        let messages = req.messages.clone();
        let run = drive_turn(provider, messages, session.stream, out, cancel);

        #[cfg(not(target_arch = "wasm32"))]
        let rt = rt.0.clone();
        AsyncComputeTaskPool::get()
            .spawn(async move {
                #[cfg(target_arch = "wasm32")]
                {
                    run.await;
                }
                #[cfg(not(target_arch = "wasm32"))]
                {
                    let _ = rt.spawn(run).await;
                }
            })
            .detach();
    }
}

async fn drive_turn(
    provider: Arc<dyn LLMProvider>,
    messages: Vec<ChatMessage>,
    stream: bool,
    out: StreamSender,
    cancel: CancellationToken,
) {
    let result = if stream {
        stream_turn(provider.as_ref(), &messages, &out, &cancel).await
    } else {
        one_shot_turn(provider.as_ref(), &messages, &out).await
    };
    let reported = match result {
        Ok(final_text) => {
            debug!(target: "bevy_llm_stream", "turn completed: final_len={}", final_text.as_ref().map_or(0, String::len));
            out.done(final_text).await
        }
        Err(StreamError::Cancelled) => {
            debug!(target: "bevy_llm_stream", "turn cancelled");
            Ok(())
        }
        Err(err) => {
            error!(target: "bevy_llm_stream", "chat error: {}", err);
            out.error(err.to_string()).await
        }
    };
    if let Err(err) = reported {
        debug!(target: "bevy_llm_stream", "turn outcome not delivered: {}", err);
    }
}

async fn one_shot_turn(
    provider: &dyn LLMProvider,
    messages: &[ChatMessage],
    out: &StreamSender,
) -> Result<Option<String>, StreamError> {
    let resp = provider.chat(messages).await?;
    let text = resp.text().unwrap_or_default();
    if text.is_empty() {
        return Ok(None);
    }
    out.fragment(text.clone()).await?;
    Ok(Some(text))
}

async fn stream_turn(
    provider: &dyn LLMProvider,
    messages: &[ChatMessage],
    out: &StreamSender,
    cancel: &CancellationToken,
) -> Result<Option<String>, StreamError> {
    let mut s = match provider.chat_stream_struct(messages).await {
        Ok(s) => s,
        Err(err) => {
            warn!(target: "bevy_llm_stream",
                "structured streaming failed for provider {}: {err}. falling back to one-shot chat()",
                type_name_of_val(provider)
            );
            return one_shot_turn(provider, messages, out).await;
        }
    };

    let mut full = String::new();
    loop {
        let next = futures_lite::future::or(
            async {
                cancel.cancelled().await;
                None
            },
            s.next(),
        )
        .await;
        if cancel.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        let Some(item) = next else {
            break;
        };
        let StreamResponse { choices, .. } = item?;
        for StreamChoice { delta: StreamDelta { content, tool_calls } } in choices {
            if let Some(txt) = content
                && !txt.is_empty()
            {
                full.push_str(&txt);
                out.fragment(txt).await?;
            }
            if let Some(calls) = tool_calls
                && !calls.is_empty()
            {
                let calls = calls
                    .iter()
                    .filter_map(|c| serde_json::to_value(c).ok())
                    .collect();
                out.tool_calls(calls).await?;
            }
        }
    }
    Ok((!full.is_empty()).then_some(full))
}

fn handle_stop_requests(
    mut ev: EventReader<StopStreaming>,
    mut flush_queue: ResMut<FrameFlushQueue>,
    mut sessions: Query<&mut Conversation>,
) {
    for StopStreaming { entity } in ev.read() {
        let Ok(mut conv) = sessions.get_mut(*entity) else {
            warn!(target: "bevy_llm_stream", "stop requested for {:?}, which has no conversation", entity);
            continue;
        };
        if let Some(message) = conv.stop_streaming(&mut flush_queue.scheduler_for(*entity)) {
            info!(target: "bevy_llm_stream", "stopped streaming: entity={:?} message={}", entity, message);
        }
    }
}

/// applies inbox messages in arrival order. fragments go through the session
/// buffer; reasoning, tool calls and completion apply immediately.
fn drain_stream_inbox(
    inbox: Res<StreamInbox>,
    config: Res<StreamConfig>,
    mut flush_queue: ResMut<FrameFlushQueue>,
    mut sessions: Query<&mut Conversation>,
    mut ev_reasoning: EventWriter<ReasoningUpdated>,
    mut ev_done: EventWriter<ChatCompletedEvt>,
    mut ev_err: EventWriter<ChatErrorEvt>,
) {
    for _ in 0..config.max_inbox_per_frame {
        let msg = match inbox.rx.try_recv() {
            Ok(m) => m,
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        };
        let (entity, turn) = msg.route();
        let Ok(mut conv) = sessions.get_mut(entity) else {
            warn!(target: "bevy_llm_stream", "stream message for {:?}, which has no conversation", entity);
            continue;
        };
        let open = conv.active_message().map(|m| m.id);
        if turn.is_some() && turn != open {
            debug!(target: "bevy_llm_stream", "dropping stream message for stale turn on {:?}", entity);
            continue;
        }

        match msg {
            StreamMsg::Fragment { text, .. } => {
                conv.append_to_buffer(&text, &mut flush_queue.scheduler_for(entity));
            }
            StreamMsg::Reasoning { event, .. } => {
                if let Some(message) = conv.apply_reasoning_event(&event) {
                    let finished = conv
                        .message(message)
                        .and_then(|m| m.reasoning.as_ref())
                        .is_some_and(|r| r.completed);
                    ev_reasoning.write(ReasoningUpdated { entity, message, finished });
                }
            }
            StreamMsg::Tool { calls, .. } => {
                debug!(target: "bevy_llm_stream", "tool calls: {}", calls.len());
                conv.append_assistant_event(AssistantEvent::ToolCalls { calls });
            }
            StreamMsg::Done { final_text, .. } => {
                flush_queue.scheduler_for(entity).cancel();
                if let Some(message) = conv.complete_stream(final_text.as_deref()) {
                    ev_done.write(ChatCompletedEvt { entity, message });
                }
            }
            StreamMsg::Err { error, .. } => {
                // keep what already arrived, then freeze the turn
                conv.flush_buffer();
                conv.stop_streaming(&mut flush_queue.scheduler_for(entity));
                ev_err.write(ChatErrorEvt { entity, error });
            }
        }
    }
}

/// the per-frame tick: one commit per scheduled session.
fn flush_scheduled_buffers(
    mut flush_queue: ResMut<FrameFlushQueue>,
    mut sessions: Query<&mut Conversation>,
    mut ev_commit: EventWriter<MessageCommitted>,
) {
    for entity in flush_queue.take() {
        let Ok(mut conv) = sessions.get_mut(entity) else {
            continue;
        };
        if let Some(message) = conv.flush_buffer() {
            ev_commit.write(MessageCommitted { entity, message });
        }
    }
}
