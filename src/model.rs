//! conversation data model: messages, reasoning traces and their steps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// who produced a message. exactly one side is populated per message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    Human { text: String },
    Assistant { text: String },
}

/// lifecycle of an assistant message. human messages are always `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// created, nothing committed yet
    #[default]
    Pending,
    Streaming,
    Complete,
    Cancelled,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feedback {
    Positive,
    Negative,
}

/// side-channel entries attached to an assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssistantEvent {
    /// provider tool calls, kept in their serialized form.
    ToolCalls { calls: Vec<Value> },
    Custom { name: String, data: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: MessageRole,
    pub reasoning: Option<ReasoningTrace>,
    pub events: Vec<AssistantEvent>,
    /// stamped on insertion into a conversation when absent.
    pub created_at: Option<DateTime<Utc>>,
    pub feedback: Option<Feedback>,
    pub status: MessageStatus,
}

impl Message {
    pub fn human(text: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role: MessageRole::Human { text: text.into() },
            reasoning: None,
            events: Vec::new(),
            created_at: None,
            feedback: None,
            status: MessageStatus::Complete,
        }
    }

    pub fn assistant() -> Self {
        Self {
            id: MessageId::new(),
            role: MessageRole::Assistant { text: String::new() },
            reasoning: None,
            events: Vec::new(),
            created_at: None,
            feedback: None,
            status: MessageStatus::Pending,
        }
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self.role, MessageRole::Assistant { .. })
    }

    pub fn text(&self) -> &str {
        match &self.role {
            MessageRole::Human { text } | MessageRole::Assistant { text } => text,
        }
    }

    /// mutable assistant text, `None` for human messages.
    pub(crate) fn assistant_text_mut(&mut self) -> Option<&mut String> {
        match &mut self.role {
            MessageRole::Assistant { text } => Some(text),
            MessageRole::Human { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Active,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningStep {
    /// position key; unique within a trace.
    pub index: u32,
    /// order declared by the provider, may differ from `index`.
    pub order: Option<u32>,
    pub title: Option<String>,
    pub body: String,
    /// last raw payload that touched this step, for diagnostics.
    pub raw: Option<Value>,
    pub status: StepStatus,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReasoningTrace {
    /// sorted by `index` at all times.
    pub steps: Vec<ReasoningStep>,
    pub completed: bool,
    pub total_steps: Option<u32>,
    /// flattened text, computed once on completion.
    pub rendered: Option<String>,
}

impl ReasoningTrace {
    pub fn step(&self, index: u32) -> Option<&ReasoningStep> {
        self.steps
            .binary_search_by_key(&index, |s| s.index)
            .ok()
            .map(|i| &self.steps[i])
    }

    /// one past the last index. saturates, so past `u32::MAX` updates merge
    /// into the last step.
    pub(crate) fn next_local_index(&self) -> u32 {
        self.steps.last().map_or(1, |s| s.index.saturating_add(1))
    }
}

/// a reasoning envelope as delivered by the transport: an optional event
/// name and a payload of unknown shape.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawReasoningEvent {
    pub event: Option<String>,
    pub data: Value,
}

impl RawReasoningEvent {
    pub fn new(event: Option<&str>, data: Value) -> Self {
        Self { event: event.map(str::to_string), data }
    }
}

/// one step worth of text recovered from a reasoning payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StepUpdate {
    pub content: String,
    pub order: Option<u32>,
    pub total_steps: Option<u32>,
    pub title: Option<String>,
    pub raw: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParsedReasoningUpdate {
    pub steps: Vec<StepUpdate>,
    pub finished: bool,
    pub total_steps: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn role_is_exclusive() {
        let h = Message::human("hi");
        let a = Message::assistant();
        assert!(!h.is_assistant());
        assert!(a.is_assistant());
        assert_eq!(h.text(), "hi");
        assert_eq!(h.status, MessageStatus::Complete);
        assert_eq!(a.status, MessageStatus::Pending);
    }

    #[test]
    fn trace_lookup_by_index() {
        let mut trace = ReasoningTrace::default();
        assert_eq!(trace.next_local_index(), 1);
        for index in [1, 4] {
            trace.steps.push(ReasoningStep {
                index,
                order: Some(index),
                title: None,
                body: format!("step {index}"),
                raw: None,
                status: StepStatus::Active,
            });
        }
        assert_eq!(trace.step(4).map(|s| s.body.as_str()), Some("step 4"));
        assert!(trace.step(2).is_none());
        assert_eq!(trace.next_local_index(), 5);
    }

    #[test]
    fn next_local_index_saturates() {
        let mut trace = ReasoningTrace::default();
        trace.steps.push(ReasoningStep {
            index: u32::MAX,
            order: Some(u32::MAX),
            title: None,
            body: "last".into(),
            raw: None,
            status: StepStatus::Active,
        });
        assert_eq!(trace.next_local_index(), u32::MAX);
    }
}
