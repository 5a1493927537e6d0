//! bevy_llm_stream: turns an llm response stream into a growing chat message
//! plus a titled reasoning trace, committed at most once per frame.
//!
//! - fragments are coalesced per frame (`buffer`) and committed to the open
//!   assistant message of a session's `Conversation`.
//! - reasoning envelopes of unknown shape are normalized (`reasoning`) into
//!   ordered steps; restated text is merged, not duplicated (`merge`).
//! - the built-in driver streams from any `llm` provider off the main thread;
//!   hosts with their own transport push through `StreamInbox::sender`.
//!
//! api docs for the provider side: https://docs.rs/llm

pub mod buffer;
pub mod config;
pub mod conversation;
pub mod error;
pub mod merge;
pub mod model;
pub mod plugin;
pub mod reasoning;

pub use buffer::{FrameFlushQueue, StreamBuffer, TickScheduler};
pub use config::StreamConfig;
pub use conversation::Conversation;
pub use error::StreamError;
pub use merge::merge_content;
pub use model::{
    AssistantEvent, Feedback, Message, MessageId, MessageRole, MessageStatus,
    ParsedReasoningUpdate, RawReasoningEvent, ReasoningStep, ReasoningTrace, StepStatus,
    StepUpdate,
};
pub use plugin::{
    push_reasoning_event, send_user_text, ChatCompletedEvt, ChatErrorEvt, ChatRequest,
    ChatSession, ChatStarted, MessageCommitted, Providers, ReasoningUpdated, StopStreaming,
    StreamInbox, StreamPlugin, StreamSender, StreamSet,
};
#[cfg(not(target_arch = "wasm32"))]
pub use plugin::TokioRt;
pub use reasoning::{normalize_step_text, parse_reasoning_event, StepDisplay};

/// re-export the llm types so downstream code can use the same structs/enums.
pub use llm::{
    builder::{LLMBackend, LLMBuilder},
    chat::{ChatMessage, ChatProvider, ChatRole, StreamChoice, StreamDelta, StreamResponse},
    error::LLMError,
    LLMProvider,
    ToolCall,
};
