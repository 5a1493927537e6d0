//! normalizes provider reasoning envelopes into ordered step updates.
//!
//! providers wrap reasoning text in arbitrarily nested, inconsistently named
//! objects, sometimes re-encoded as json strings. the walk is breadth-first
//! over owned values; every object is run through an ordered table of shape
//! rules, each a `(predicate, extractor)` pair.

use bevy::log::debug;
use serde_json::{Map, Value};
use std::collections::VecDeque;

use crate::model::{ParsedReasoningUpdate, RawReasoningEvent, StepUpdate};

/// nesting below this depth is ignored.
pub const MAX_DEPTH: usize = 32;
/// upper bound on values visited per event.
pub const MAX_NODES: usize = 4096;

const CONTAINER_KEYS: &[&str] = &[
    "data", "payload", "delta", "output", "result", "item", "choices", "summary",
];
const TEXT_KEYS: &[&str] = &[
    "thought",
    "thinking",
    "content",
    "message",
    "analysis",
    "reasoning",
    "reasoning_content",
    "details",
    "text",
];
const ORDER_KEYS: &[&str] = &[
    "order",
    "step",
    "index",
    "stepIndex",
    "step_index",
    "thoughtNumber",
    "thought_number",
];
const TOTAL_KEYS: &[&str] = &["totalSteps", "totalThoughts", "total_steps", "total_thoughts"];
const DONE_KEYS: &[&str] = &["done", "completed", "isFinal", "is_final", "finished"];
// false means nothing more is coming
const NEEDS_MORE_KEYS: &[&str] = &[
    "nextThoughtNeeded",
    "next_thought_needed",
    "needsMore",
    "needs_more",
];
const DONE_EVENT_WORDS: &[&str] = &[
    "end", "ended", "finish", "finished", "complete", "completed", "done",
];

type Predicate = fn(&Map<String, Value>) -> bool;
type Extractor = fn(&mut Map<String, Value>, &mut Walk);

struct ShapeRule {
    name: &'static str,
    matches: Predicate,
    extract: Extractor,
}

/// every matching rule runs, in this order.
const SHAPE_RULES: &[ShapeRule] = &[
    ShapeRule { name: "nested", matches: has_nested, extract: lift_nested },
    ShapeRule { name: "counters", matches: has_counters, extract: record_counters },
    ShapeRule { name: "completion", matches: has_completion_flag, extract: record_completion },
    ShapeRule { name: "step", matches: is_step_shape, extract: emit_step },
    ShapeRule { name: "loose_text", matches: is_loose_text, extract: emit_loose_text },
];

#[derive(Default)]
struct Walk {
    queue: VecDeque<(Value, usize)>,
    steps: Vec<StepUpdate>,
    finished: bool,
    total: Option<u32>,
    max_order: Option<u32>,
    depth: usize,
    raw: Option<Value>,
}

impl Walk {
    fn push(&mut self, value: Value) {
        let depth = self.depth + 1;
        if depth > MAX_DEPTH {
            debug!(target: "bevy_llm_stream", "reasoning payload nested deeper than {MAX_DEPTH}, skipping");
            return;
        }
        self.queue.push_back((value, depth));
    }

    fn push_step(&mut self, step: StepUpdate) {
        if step.content.is_empty() {
            return;
        }
        self.steps.push(step);
    }
}

/// parse one reasoning envelope. `None` means there is nothing to apply:
/// no step text and no completion signal.
pub fn parse_reasoning_event(event: Option<&RawReasoningEvent>) -> Option<ParsedReasoningUpdate> {
    let event = event?;
    let mut walk = Walk::default();
    walk.queue.push_back((event.data.clone(), 0));

    let mut visited = 0usize;
    while let Some((value, depth)) = walk.queue.pop_front() {
        visited += 1;
        if visited > MAX_NODES {
            debug!(target: "bevy_llm_stream", "reasoning payload exceeded {MAX_NODES} nodes, truncating");
            break;
        }
        walk.depth = depth;
        match value {
            Value::String(s) => match decode_document(&s) {
                Some(doc) => walk.push(doc),
                None => walk.push_step(StepUpdate {
                    content: s.trim().to_string(),
                    ..Default::default()
                }),
            },
            Value::Array(items) => {
                for item in items {
                    walk.push(item);
                }
            }
            Value::Object(map) => visit_object(map, &mut walk),
            _ => {}
        }
    }

    if !walk.finished
        && let Some(name) = event.event.as_deref()
        && is_done_event(name)
    {
        walk.finished = true;
    }

    if walk.steps.is_empty() {
        walk.total = walk.total.or(walk.max_order);
        if !walk.finished {
            return None;
        }
    }

    Some(ParsedReasoningUpdate {
        steps: walk.steps,
        finished: walk.finished,
        total_steps: walk.total,
    })
}

fn visit_object(mut map: Map<String, Value>, walk: &mut Walk) {
    walk.raw = has_any(&map, TEXT_KEYS).then(|| Value::Object(map.clone()));
    for rule in SHAPE_RULES {
        if (rule.matches)(&map) {
            debug!(target: "bevy_llm_stream", "reasoning shape rule '{}' at depth {}", rule.name, walk.depth);
            (rule.extract)(&mut map, walk);
        }
    }
    walk.raw = None;
}

/// strings that look like a json object or array and decode as one.
fn decode_document(s: &str) -> Option<Value> {
    let t = s.trim();
    let looks_like_doc = (t.starts_with('{') && t.ends_with('}')) || (t.starts_with('[') && t.ends_with(']'));
    if !looks_like_doc {
        return None;
    }
    serde_json::from_str::<Value>(t)
        .ok()
        .filter(|v| v.is_object() || v.is_array())
}

fn has_any(map: &Map<String, Value>, keys: &[&str]) -> bool {
    keys.iter().any(|k| map.contains_key(*k))
}

fn is_nested_value(value: &Value) -> bool {
    match value {
        Value::Object(_) | Value::Array(_) => true,
        Value::String(s) => decode_document(s).is_some(),
        _ => false,
    }
}

fn has_nested(map: &Map<String, Value>) -> bool {
    CONTAINER_KEYS.iter().any(|k| map.contains_key(*k))
        || TEXT_KEYS.iter().any(|k| map.get(*k).is_some_and(is_nested_value))
}

/// moves nested containers (and text fields that hold documents) off the
/// object and onto the work queue.
fn lift_nested(map: &mut Map<String, Value>, walk: &mut Walk) {
    for key in CONTAINER_KEYS {
        if let Some(value) = map.remove(*key) {
            walk.push(value);
        }
    }
    for key in TEXT_KEYS {
        if map.get(*key).is_some_and(is_nested_value)
            && let Some(value) = map.remove(*key)
        {
            walk.push(value);
        }
    }
}

fn number_of(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64))
            .and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    }
}

fn first_number(map: &Map<String, Value>, keys: &[&str]) -> Option<u32> {
    keys.iter().find_map(|k| map.get(*k).and_then(number_of))
}

fn first_text(map: &Map<String, Value>) -> Option<String> {
    TEXT_KEYS.iter().find_map(|k| {
        map.get(*k)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

fn has_counters(map: &Map<String, Value>) -> bool {
    has_any(map, ORDER_KEYS) || has_any(map, TOTAL_KEYS)
}

fn record_counters(map: &mut Map<String, Value>, walk: &mut Walk) {
    if let Some(total) = first_number(map, TOTAL_KEYS) {
        walk.total = Some(walk.total.map_or(total, |t| t.max(total)));
    }
    if let Some(order) = first_number(map, ORDER_KEYS) {
        walk.max_order = Some(walk.max_order.map_or(order, |o| o.max(order)));
    }
}

fn has_completion_flag(map: &Map<String, Value>) -> bool {
    DONE_KEYS.iter().chain(NEEDS_MORE_KEYS).any(|k| map.get(*k).is_some_and(Value::is_boolean))
}

fn record_completion(map: &mut Map<String, Value>, walk: &mut Walk) {
    let done = DONE_KEYS.iter().any(|k| map.get(*k).and_then(Value::as_bool) == Some(true));
    let no_more = NEEDS_MORE_KEYS
        .iter()
        .any(|k| map.get(*k).and_then(Value::as_bool) == Some(false));
    if done || no_more {
        walk.finished = true;
    }
}

fn is_step_shape(map: &Map<String, Value>) -> bool {
    first_text(map).is_some()
        && (has_counters(map) || map.contains_key("title") || has_completion_flag(map))
}

fn emit_step(map: &mut Map<String, Value>, walk: &mut Walk) {
    let Some(content) = first_text(map) else {
        return;
    };
    let title = map
        .get("title")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    let step = StepUpdate {
        content,
        order: first_number(map, ORDER_KEYS),
        total_steps: first_number(map, TOTAL_KEYS),
        title,
        raw: walk.raw.clone(),
    };
    walk.push_step(step);
}

fn is_loose_text(map: &Map<String, Value>) -> bool {
    !is_step_shape(map) && first_text(map).is_some()
}

/// best-effort: unrecognized shapes still surface readable text.
fn emit_loose_text(map: &mut Map<String, Value>, walk: &mut Walk) {
    if let Some(content) = first_text(map) {
        let raw = walk.raw.clone();
        walk.push_step(StepUpdate { content, raw, ..Default::default() });
    }
}

/// word match on the event tag, splitting on punctuation and camel case,
/// so "reasoning.done" and "ThinkingEnd" match but "pending" does not.
fn is_done_event(name: &str) -> bool {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in name.chars() {
        if !c.is_alphanumeric() {
            words.push(std::mem::take(&mut current));
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase();
        current.extend(c.to_lowercase());
    }
    words.push(current);
    words.iter().any(|w| DONE_EVENT_WORDS.contains(&w.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn parse(event: Option<&str>, data: Value) -> Option<ParsedReasoningUpdate> {
        parse_reasoning_event(Some(&RawReasoningEvent::new(event, data)))
    }

    #[test]
    fn no_event_is_nothing_to_apply() {
        assert_eq!(parse_reasoning_event(None), None);
    }

    #[test]
    fn flat_step_with_order_and_total() {
        let out = parse(None, json!({ "content": "分析中", "order": 1, "totalSteps": 3 })).unwrap();
        assert_eq!(out.steps.len(), 1);
        assert_eq!(out.steps[0].content, "分析中");
        assert_eq!(out.steps[0].order, Some(1));
        assert_eq!(out.steps[0].total_steps, Some(3));
        assert_eq!(out.total_steps, Some(3));
        assert!(!out.finished);
    }

    #[test]
    fn completion_flag_without_text() {
        let out = parse(None, json!({ "done": true })).unwrap();
        assert!(out.steps.is_empty());
        assert!(out.finished);
    }

    #[test]
    fn negated_needs_more_flag_finishes() {
        let out = parse(
            None,
            json!({ "thought": "last one", "thoughtNumber": 5, "totalThoughts": 5, "nextThoughtNeeded": false }),
        )
        .unwrap();
        assert!(out.finished);
        assert_eq!(out.steps[0].order, Some(5));

        let more = parse(None, json!({ "thought": "x", "nextThoughtNeeded": true })).unwrap();
        assert!(!more.finished);
    }

    #[test]
    fn every_alias_is_recognized() {
        for key in TEXT_KEYS {
            let out = parse(None, json!({ (*key): "aliased text", "order": 2 })).unwrap();
            assert_eq!(out.steps.len(), 1, "text key {key}");
            assert_eq!(out.steps[0].content, "aliased text", "text key {key}");
            assert_eq!(out.steps[0].order, Some(2), "text key {key}");
        }
        for key in ORDER_KEYS {
            let out = parse(None, json!({ "thought": "x", (*key): 3 })).unwrap();
            assert_eq!(out.steps[0].order, Some(3), "order key {key}");
        }
        for key in TOTAL_KEYS {
            let out = parse(None, json!({ "thought": "x", (*key): 5 })).unwrap();
            assert_eq!(out.steps[0].total_steps, Some(5), "total key {key}");
            assert_eq!(out.total_steps, Some(5), "total key {key}");
        }
        for key in CONTAINER_KEYS {
            let out = parse(None, json!({ (*key): { "thought": "inside" } })).unwrap();
            assert_eq!(out.steps[0].content, "inside", "container key {key}");
        }
        for key in DONE_KEYS {
            assert!(parse(None, json!({ (*key): true })).unwrap().finished, "done key {key}");
            assert_eq!(parse(None, json!({ (*key): false })), None, "done key {key}");
        }
        for key in NEEDS_MORE_KEYS {
            assert!(parse(None, json!({ (*key): false })).unwrap().finished, "needs-more key {key}");
            assert_eq!(parse(None, json!({ (*key): true })), None, "needs-more key {key}");
        }
    }

    #[test]
    fn openai_reasoning_content_delta() {
        let out = parse(
            None,
            json!({ "id": "chatcmpl-1", "choices": [{ "index": 0, "delta": { "reasoning_content": "weigh both options" } }] }),
        )
        .unwrap();
        assert_eq!(out.steps.len(), 1);
        assert_eq!(out.steps[0].content, "weigh both options");
        assert!(!out.finished);
    }

    #[test]
    fn order_bounds() {
        let max = parse(None, json!({ "content": "a", "order": 4294967295u64 })).unwrap();
        assert_eq!(max.steps[0].order, Some(u32::MAX));
        let over = parse(None, json!({ "content": "a", "order": 4294967296u64 })).unwrap();
        assert_eq!(over.steps[0].order, None);
        let negative = parse(None, json!({ "content": "a", "order": -1 })).unwrap();
        assert_eq!(negative.steps[0].order, None);
    }

    #[test]
    fn nested_wrappers_and_encoded_documents() {
        let inner = json!({ "thought": "look at the data", "stepIndex": "2", "title": "Inspect" });
        let payload = json!({
            "payload": {
                "delta": { "text": inner.to_string() }
            }
        });
        let out = parse(Some("reasoning"), payload).unwrap();
        assert_eq!(out.steps.len(), 1);
        let step = &out.steps[0];
        assert_eq!(step.content, "look at the data");
        assert_eq!(step.order, Some(2));
        assert_eq!(step.title.as_deref(), Some("Inspect"));
        assert_eq!(step.raw, Some(inner));
    }

    #[test]
    fn anthropic_style_thinking_delta() {
        let out = parse(
            Some("content_block_delta"),
            json!({ "type": "content_block_delta", "index": 0, "delta": { "type": "thinking_delta", "thinking": "consider x" } }),
        )
        .unwrap();
        assert_eq!(out.steps.len(), 1);
        assert_eq!(out.steps[0].content, "consider x");
        assert!(!out.finished);
    }

    #[test]
    fn arrays_keep_arrival_order() {
        let out = parse(
            None,
            json!([
                { "content": "first", "step": 1 },
                "plain second",
                { "analysis": "third", "step": 3 }
            ]),
        )
        .unwrap();
        let texts: Vec<_> = out.steps.iter().map(|s| s.content.as_str()).collect();
        assert_eq!(texts, vec!["first", "plain second", "third"]);
    }

    #[test]
    fn unparsable_document_is_literal_text() {
        let out = parse(None, json!("{ not json")).unwrap();
        assert_eq!(out.steps[0].content, "{ not json");
    }

    #[test]
    fn unknown_shape_still_surfaces_text() {
        let out = parse(None, json!({ "kind": "mystery", "details": "  something useful  " })).unwrap();
        assert_eq!(out.steps.len(), 1);
        assert_eq!(out.steps[0].content, "something useful");
        assert_eq!(out.steps[0].order, None);
    }

    #[test]
    fn blank_text_is_dropped() {
        assert_eq!(parse(None, json!({ "content": "   " })), None);
    }

    #[test]
    fn total_is_running_maximum() {
        let out = parse(
            None,
            json!([{ "content": "a", "totalSteps": 2 }, { "content": "b", "total_steps": 4 }, { "content": "c", "totalSteps": 3 }]),
        )
        .unwrap();
        assert_eq!(out.total_steps, Some(4));
    }

    #[test]
    fn done_event_name_completes() {
        let out = parse(Some("reasoning.DONE"), json!({})).unwrap();
        assert!(out.finished);
        assert!(parse(Some("ThinkingEnd"), json!(null)).unwrap().finished);
        assert_eq!(parse(Some("pending"), json!({})), None);
    }

    #[test]
    fn order_without_text_becomes_implied_total() {
        let out = parse(Some("thinking_complete"), json!({ "step": 6 })).unwrap();
        assert!(out.steps.is_empty());
        assert_eq!(out.total_steps, Some(6));
    }

    #[test]
    fn self_similar_nesting_terminates() {
        let mut value = json!({ "content": "unreachable" });
        for _ in 0..200 {
            value = json!({ "data": value });
        }
        assert_eq!(parse(None, value), None);

        let mut shallow = json!({ "content": "reachable", "step": 1 });
        for _ in 0..10 {
            shallow = json!({ "data": shallow });
        }
        assert_eq!(parse(None, shallow).unwrap().steps.len(), 1);
    }

    #[test]
    fn node_budget_bounds_wide_payloads() {
        let wide = Value::Array((0..10_000).map(|i| json!(format!("t{i}"))).collect());
        let out = parse(None, wide).unwrap();
        assert!(out.steps.len() < MAX_NODES);
        assert_eq!(out.steps[0].content, "t0");
    }
}
