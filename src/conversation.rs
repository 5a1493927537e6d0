//! the message aggregator: conversation state for one chat session entity.
//!
//! fed by the stream plugin (or the host's own transport) and observed by the
//! ui. all mutation goes through `&mut Conversation`, so within a bevy world
//! there is exactly one writer at a time.

use bevy::prelude::*;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::buffer::{StreamBuffer, TickScheduler};
use crate::error::StreamError;
use crate::merge::merge_content;
use crate::model::{
    AssistantEvent, Feedback, Message, MessageId, MessageStatus, RawReasoningEvent,
    ReasoningStep, ReasoningTrace, StepStatus, StepUpdate,
};
use crate::reasoning::{normalize_step_text, parse_reasoning_event};

#[derive(Component, Debug)]
pub struct Conversation {
    messages: Vec<Message>,
    /// index of the in-flight assistant message
    active: Option<usize>,
    buffer: StreamBuffer,
    cancel: Option<CancellationToken>,
    keep_raw_payloads: bool,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Conversation {
    pub fn new(keep_raw_payloads: bool) -> Self {
        Self {
            messages: Vec::new(),
            active: None,
            buffer: StreamBuffer::default(),
            cancel: None,
            keep_raw_payloads,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn active_message(&self) -> Option<&Message> {
        self.active.map(|i| &self.messages[i])
    }

    pub fn is_streaming(&self) -> bool {
        self.active.is_some()
    }

    pub fn buffer(&self) -> &StreamBuffer {
        &self.buffer
    }

    /// append a message, stamping its creation time if absent.
    pub fn add_message(&mut self, mut message: Message) -> MessageId {
        if message.created_at.is_none() {
            message.created_at = Some(Utc::now());
        }
        let id = message.id;
        self.messages.push(message);
        id
    }

    /// start a new assistant turn and make it the active message. a turn
    /// still in flight is cancelled first.
    pub fn begin_assistant_turn(
        &mut self,
        cancel: CancellationToken,
        scheduler: &mut impl TickScheduler,
    ) -> MessageId {
        if let Some(prev) = self.stop_streaming(scheduler) {
            warn!(target: "bevy_llm_stream", "begin_assistant_turn: cancelled overlapping turn {}", prev);
        }
        let id = self.add_message(Message::assistant());
        self.active = Some(self.messages.len() - 1);
        self.cancel = Some(cancel);
        id
    }

    /// the message stream updates go to: the active turn, else the most recent
    /// assistant message that is still open.
    fn target_index(&self) -> Option<usize> {
        if let Some(i) = self.active {
            return Some(i);
        }
        self.messages
            .iter()
            .rposition(Message::is_assistant)
            .filter(|&i| !self.messages[i].status.is_terminal())
    }

    pub fn append_to_buffer(&mut self, text: &str, scheduler: &mut impl TickScheduler) {
        if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return;
        }
        let Some(idx) = self.target_index() else {
            debug!(target: "bevy_llm_stream", "append_to_buffer: no open assistant message, ignoring {} bytes", text.len());
            return;
        };
        let msg = &mut self.messages[idx];
        if msg.status == MessageStatus::Pending {
            msg.status = MessageStatus::Streaming;
        }
        self.buffer.append(text, scheduler);
    }

    /// commit the pending buffer to the open assistant message. returns the
    /// id of the message that grew.
    pub fn flush_buffer(&mut self) -> Option<MessageId> {
        let pending = self.buffer.take_pending()?;
        let Some(idx) = self.target_index() else {
            warn!(target: "bevy_llm_stream", "flush_buffer: no streaming assistant message, dropping {} bytes", pending.len());
            return None;
        };
        let msg = &mut self.messages[idx];
        let text = msg.assistant_text_mut()?;
        text.push_str(&pending);
        msg.status = MessageStatus::Streaming;
        Some(msg.id)
    }

    /// create or grow the step at the update's index. returns that index.
    pub fn append_reasoning_step(&mut self, update: StepUpdate) -> Option<u32> {
        let Some(idx) = self.target_index() else {
            warn!(target: "bevy_llm_stream", "append_reasoning_step: no open assistant message");
            return None;
        };
        let keep_raw = self.keep_raw_payloads;
        let msg = &mut self.messages[idx];
        if msg.status == MessageStatus::Pending {
            msg.status = MessageStatus::Streaming;
        }
        let trace = msg.reasoning.get_or_insert_with(ReasoningTrace::default);
        if trace.completed {
            debug!(target: "bevy_llm_stream", "append_reasoning_step: trace already complete, ignoring");
            return None;
        }

        let StepUpdate { content, order, total_steps, title, raw } = update;
        let display = normalize_step_text(&content);
        let title = title.or(display.title);
        let raw = raw.filter(|_| keep_raw);
        let index = order.unwrap_or_else(|| trace.next_local_index());

        match trace.steps.binary_search_by_key(&index, |s| s.index) {
            Ok(pos) => {
                let step = &mut trace.steps[pos];
                step.body = merge_content(Some(step.body.as_str()), &display.body);
                if title.is_some() {
                    step.title = title;
                }
                if order.is_some() {
                    step.order = order;
                }
                if raw.is_some() {
                    step.raw = raw;
                }
            }
            Err(pos) => {
                for earlier in &mut trace.steps[..pos] {
                    earlier.status = StepStatus::Done;
                }
                trace.steps.insert(
                    pos,
                    ReasoningStep {
                        index,
                        order,
                        title,
                        body: display.body,
                        raw,
                        status: StepStatus::Active,
                    },
                );
            }
        }
        if let Some(total) = total_steps {
            raise_total(trace, total);
        }
        Some(index)
    }

    /// parse a raw reasoning envelope and apply it. returns the message whose
    /// trace changed; `None` when the envelope carried nothing to apply or no
    /// assistant message is open.
    pub fn apply_reasoning_event(&mut self, event: &RawReasoningEvent) -> Option<MessageId> {
        let parsed = parse_reasoning_event(Some(event))?;
        let Some(target) = self.target_index() else {
            warn!(target: "bevy_llm_stream", "apply_reasoning_event: no open assistant message");
            return None;
        };
        let id = self.messages[target].id;
        for step in parsed.steps {
            self.append_reasoning_step(step);
        }
        if parsed.finished {
            self.finalize_reasoning(parsed.total_steps);
        } else if let Some(total) = parsed.total_steps
            && let Some(idx) = self.target_index()
        {
            let trace = self.messages[idx]
                .reasoning
                .get_or_insert_with(ReasoningTrace::default);
            raise_total(trace, total);
        }
        Some(id)
    }

    /// mark the open trace complete and compute its flattened text.
    pub fn finalize_reasoning(&mut self, total_steps: Option<u32>) -> bool {
        let Some(idx) = self.target_index() else {
            warn!(target: "bevy_llm_stream", "finalize_reasoning: no open assistant message");
            return false;
        };
        let trace = self.messages[idx]
            .reasoning
            .get_or_insert_with(ReasoningTrace::default);
        finalize_trace(trace, total_steps);
        true
    }

    pub fn append_assistant_event(&mut self, event: AssistantEvent) -> bool {
        match self.target_index() {
            Some(idx) => {
                self.messages[idx].events.push(event);
                true
            }
            None => {
                debug!(target: "bevy_llm_stream", "append_assistant_event: no open assistant message");
                false
            }
        }
    }

    /// normal end of stream: commit the tail, reconcile the provider's final
    /// text, close the trace and freeze the message.
    pub fn complete_stream(&mut self, final_text: Option<&str>) -> Option<MessageId> {
        self.flush_buffer();
        let idx = self.target_index()?;
        let msg = &mut self.messages[idx];
        if let Some(final_text) = final_text
            && let Some(text) = msg.assistant_text_mut()
        {
            *text = merge_content(Some(text.as_str()), final_text);
        }
        if let Some(trace) = msg.reasoning.as_mut()
            && !trace.completed
        {
            finalize_trace(trace, None);
        }
        msg.status = MessageStatus::Complete;
        self.active = None;
        self.cancel = None;
        Some(msg.id)
    }

    /// cancel the in-flight read and drop any unflushed tail. committed text
    /// stays; the message is frozen as cancelled.
    pub fn stop_streaming(&mut self, scheduler: &mut impl TickScheduler) -> Option<MessageId> {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        self.buffer.discard(scheduler);
        let idx = self.target_index()?;
        self.active = None;
        let msg = &mut self.messages[idx];
        msg.status = MessageStatus::Cancelled;
        Some(msg.id)
    }

    pub fn set_feedback(&mut self, id: MessageId, feedback: Option<Feedback>) -> Result<(), StreamError> {
        let msg = self
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(StreamError::MessageNotFound(id))?;
        msg.feedback = feedback;
        Ok(())
    }
}

fn raise_total(trace: &mut ReasoningTrace, total: u32) {
    trace.total_steps = Some(trace.total_steps.map_or(total, |t| t.max(total)));
}

fn finalize_trace(trace: &mut ReasoningTrace, total_steps: Option<u32>) {
    if trace.completed {
        return;
    }
    trace.completed = true;
    let observed = u32::try_from(trace.steps.len()).unwrap_or(u32::MAX);
    trace.total_steps = total_steps.or(trace.total_steps).or(Some(observed));
    for step in &mut trace.steps {
        step.status = StepStatus::Done;
    }
    let bodies: Vec<&str> = trace.steps.iter().map(|s| s.body.as_str()).collect();
    trace.rendered = Some(bodies.join("\n\n"));
}
