// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Chat message repair: every tool invocation gets a paired response.
//!
//! Agent clients occasionally send histories in which an assistant message
//! declares `tool_calls` but the matching `role: "tool"` responses were
//! dropped (crashed tool, truncated history, client bug). The primary
//! upstream rejects such payloads outright. [`repair_messages`] walks the
//! sequence and inserts a synthesized `"failed"` tool response for every
//! dangling invocation, immediately before the first following message that
//! is not a tool response (or at the tail).
//!
//! The walk keeps pending invocation ids in insertion order so synthesized
//! responses appear in the order the invocations were declared. Orphan tool
//! responses (an id never declared by any assistant message) pass through
//! untouched.

use serde_json::{json, Value};
use tracing::warn;

/// Repair a chat completion payload in place of its `messages` array.
///
/// Returns `Some(fixed_payload)` only when repair actually added messages;
/// `None` means the payload is already well-formed (or carries no messages
/// array) and the original bytes should be forwarded untouched.
pub fn repair_request(payload: &Value) -> Option<Value> {
    let messages = payload.get("messages")?.as_array()?;
    let fixed = repair_messages(messages);
    if fixed.len() > messages.len() {
        let mut out = payload.clone();
        out["messages"] = Value::Array(fixed);
        Some(out)
    } else {
        None
    }
}

/// The pure repair walk. The input is never mutated; the output embeds every
/// input message in order.
pub fn repair_messages(messages: &[Value]) -> Vec<Value> {
    let mut fixed: Vec<Value> = Vec::with_capacity(messages.len());
    // Invocation ids still waiting for a response, in declaration order.
    // Arities are small; linear removal is fine.
    let mut pending: Vec<String> = Vec::new();

    for msg in messages {
        if is_assistant_with_calls(msg) {
            fixed.push(msg.clone());
            if let Some(calls) = msg.get("tool_calls").and_then(Value::as_array) {
                for call in calls {
                    if let Some(id) = call.get("id").and_then(Value::as_str) {
                        pending.push(id.to_string());
                    }
                }
            }
            continue;
        }

        if let Some(answered) = tool_response_id(msg) {
            if let Some(pos) = pending.iter().position(|id| id == answered) {
                pending.remove(pos);
            }
            fixed.push(msg.clone());
            continue;
        }

        if !pending.is_empty() {
            warn!(
                dangling = pending.len(),
                "tool invocations without responses, synthesizing failures"
            );
            for id in pending.drain(..) {
                fixed.push(synthesized_response(&id));
            }
        }
        fixed.push(msg.clone());
    }

    if !pending.is_empty() {
        warn!(
            dangling = pending.len(),
            "tool invocations without responses at end of history, synthesizing failures"
        );
        for id in pending.drain(..) {
            fixed.push(synthesized_response(&id));
        }
    }

    fixed
}

fn is_assistant_with_calls(msg: &Value) -> bool {
    msg.get("role").and_then(Value::as_str) == Some("assistant")
        && msg.get("tool_calls").is_some()
}

fn tool_response_id(msg: &Value) -> Option<&str> {
    if msg.get("role").and_then(Value::as_str) != Some("tool") {
        return None;
    }
    msg.get("tool_call_id").and_then(Value::as_str)
}

fn synthesized_response(id: &str) -> Value {
    json!({
        "role": "tool",
        "tool_call_id": id,
        "content": "failed"
    })
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn user(text: &str) -> Value {
        json!({ "role": "user", "content": text })
    }

    fn assistant_calls(ids: &[&str]) -> Value {
        let calls: Vec<Value> = ids
            .iter()
            .map(|id| {
                json!({
                    "id": id,
                    "type": "function",
                    "function": { "name": "shell", "arguments": "{}" }
                })
            })
            .collect();
        json!({ "role": "assistant", "tool_calls": calls })
    }

    fn tool(id: &str, content: &str) -> Value {
        json!({ "role": "tool", "tool_call_id": id, "content": content })
    }

    #[test]
    fn well_formed_history_is_unchanged() {
        let msgs = vec![
            user("hi"),
            assistant_calls(&["t1"]),
            tool("t1", "ok"),
            user("thanks"),
        ];
        assert_eq!(repair_messages(&msgs), msgs);
        assert!(repair_request(&json!({ "messages": msgs })).is_none());
    }

    #[test]
    fn dangling_call_gets_failed_response_before_next_message() {
        let msgs = vec![user("hi"), assistant_calls(&["t1"]), user("still there?")];
        let fixed = repair_messages(&msgs);
        assert_eq!(fixed.len(), 4);
        assert_eq!(fixed[2], tool("t1", "failed"));
        assert_eq!(fixed[3], user("still there?"));
    }

    #[test]
    fn dangling_call_at_tail_gets_failed_response_at_tail() {
        let msgs = vec![user("hi"), assistant_calls(&["t1"])];
        let fixed = repair_messages(&msgs);
        assert_eq!(fixed.len(), 3);
        assert_eq!(fixed[2], tool("t1", "failed"));
    }

    #[test]
    fn synthesized_responses_keep_declaration_order() {
        let msgs = vec![assistant_calls(&["a", "b", "c"]), tool("b", "ok"), user("next")];
        let fixed = repair_messages(&msgs);
        // "b" was answered; "a" then "c" are synthesized in declaration order.
        assert_eq!(fixed[2], tool("a", "failed"));
        assert_eq!(fixed[3], tool("c", "failed"));
        assert_eq!(fixed[4], user("next"));
    }

    #[test]
    fn pending_ids_span_multiple_assistant_messages() {
        let msgs = vec![
            assistant_calls(&["t1"]),
            tool("t1", "ok"),
            assistant_calls(&["t2", "t3"]),
            user("go on"),
        ];
        let fixed = repair_messages(&msgs);
        assert_eq!(fixed[3], tool("t2", "failed"));
        assert_eq!(fixed[4], tool("t3", "failed"));
    }

    #[test]
    fn orphan_tool_response_passes_through() {
        let msgs = vec![user("hi"), tool("ghost", "spooky"), user("bye")];
        assert_eq!(repair_messages(&msgs), msgs);
    }

    #[test]
    fn repair_is_idempotent() {
        let msgs = vec![
            user("hi"),
            assistant_calls(&["t1", "t2"]),
            user("hello?"),
            assistant_calls(&["t3"]),
        ];
        let once = repair_messages(&msgs);
        let twice = repair_messages(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn output_embeds_input_in_order() {
        let msgs = vec![
            user("one"),
            assistant_calls(&["t1"]),
            user("two"),
            assistant_calls(&["t2"]),
        ];
        let fixed = repair_messages(&msgs);
        // Every input message appears, in order, within the output.
        let mut cursor = 0;
        for original in &msgs {
            let found = fixed[cursor..]
                .iter()
                .position(|m| m == original)
                .expect("input message missing from output");
            cursor += found + 1;
        }
    }

    #[test]
    fn every_invocation_is_answered_exactly_once() {
        let msgs = vec![
            assistant_calls(&["t1", "t2"]),
            tool("t2", "ok"),
            user("hm"),
            assistant_calls(&["t3"]),
        ];
        let fixed = repair_messages(&msgs);
        for id in ["t1", "t2", "t3"] {
            let answers = fixed
                .iter()
                .filter(|m| {
                    m.get("role").and_then(Value::as_str) == Some("tool")
                        && m.get("tool_call_id").and_then(Value::as_str) == Some(id)
                })
                .count();
            assert_eq!(answers, 1, "invocation {id} must have exactly one answer");
        }
    }

    #[test]
    fn assistant_without_calls_flushes_pending() {
        let msgs = vec![
            assistant_calls(&["t1"]),
            json!({ "role": "assistant", "content": "thinking out loud" }),
        ];
        let fixed = repair_messages(&msgs);
        assert_eq!(fixed[1], tool("t1", "failed"));
        assert_eq!(fixed[2]["content"], "thinking out loud");
    }

    #[test]
    fn calls_without_ids_are_ignored() {
        let msgs = vec![
            json!({
                "role": "assistant",
                "tool_calls": [{ "type": "function", "function": { "name": "f" } }]
            }),
            user("next"),
        ];
        assert_eq!(repair_messages(&msgs), msgs);
    }

    #[test]
    fn repair_request_rewrites_only_messages() {
        let payload = json!({
            "model": "m",
            "temperature": 0.3,
            "messages": [assistant_calls(&["t1"])]
        });
        let fixed = repair_request(&payload).unwrap();
        assert_eq!(fixed["model"], "m");
        assert_eq!(fixed["temperature"], 0.3);
        assert_eq!(fixed["messages"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn repair_request_ignores_bodies_without_messages() {
        assert!(repair_request(&json!({ "input": "text" })).is_none());
        assert!(repair_request(&json!({ "messages": "not an array" })).is_none());
        assert!(repair_request(&json!(42)).is_none());
    }
}
