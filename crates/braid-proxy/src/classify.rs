// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Routing and outcome classification.
//!
//! Two kinds of decisions live here, both deterministic and side-effect
//! free:
//!
//! 1. **Pre-dispatch routing** — should this request skip the primary
//!    entirely? Oversize payloads (estimated from `Content-Length`) and
//!    vision payloads (an `image_url` content part) go straight to the
//!    rescue upstreams.
//! 2. **Response classification** — given an upstream status and body, what
//!    does the forward engine do next: return it, rotate the credential, or
//!    hand off to rescue?

use axum::http::StatusCode;
use serde_json::Value;

/// Substring the primary embeds in a 200 response when an account's quota
/// is exhausted. This must stay a plain substring match on the first
/// choice's content — the upstream reports the failure as assistant text,
/// not as a structured error.
const EMBEDDED_QUOTA_MARKER: &str = "token quota is not enough";

/// Error code on a 400 that means the payload outgrew the primary's
/// context window.
const CONTEXT_LENGTH_CODE: &str = "context_length_exceeded";

/// What an upstream response means for the forward engine.
///
/// Transport-level failures (connection reset, timeout) never produce a
/// response to classify; the engine treats them as credential-suspect at
/// the call site and rotates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Status < 400 and no embedded failure: mirror to the client.
    Ok,
    /// 429 or 500: cool the credential and retry with the next one. The
    /// primary's 500s track credentials falling out of rotation, not
    /// persistent server bugs, so both statuses cool.
    KeyPressure,
    /// 400 with `context_length_exceeded`: the primary will never take
    /// this payload; rescue if possible.
    OverContext,
    /// 503: primary is down; rescue if possible.
    Unavailable,
    /// 2xx whose first choice admits quota exhaustion in its content.
    EmbeddedQuota,
    /// Anything else: the client gets it verbatim.
    Other,
}

impl Outcome {
    /// Classify an upstream response from its status and (buffered) body.
    pub fn classify(status: StatusCode, body: &[u8]) -> Outcome {
        match status.as_u16() {
            429 | 500 => Outcome::KeyPressure,
            503 => Outcome::Unavailable,
            400 if has_context_length_code(body) => Outcome::OverContext,
            code if code < 400 => {
                if has_embedded_quota(body) {
                    Outcome::EmbeddedQuota
                } else {
                    Outcome::Ok
                }
            }
            _ => Outcome::Other,
        }
    }
}

/// True when the path targets the chat completion route (with or without
/// the `v1/` prefix already stripped).
pub fn is_chat_completions(path: &str) -> bool {
    path.contains("chat/completions")
}

/// Strip one leading `v1/` segment — the upstream base URLs already carry
/// it, and `/v1/v1/...` is never what anyone wants. The query string is
/// preserved.
pub fn normalize_target(uri: &axum::http::Uri) -> String {
    let path = uri.path().trim_start_matches('/');
    let path = path.strip_prefix("v1/").unwrap_or(path);
    match uri.query() {
        Some(q) => format!("{path}?{q}"),
        None => path.to_string(),
    }
}

/// True when any message carries an OpenAI-style image content part.
pub fn has_image_content(payload: &Value) -> bool {
    let Some(messages) = payload.get("messages").and_then(Value::as_array) else {
        return false;
    };
    messages.iter().any(|msg| {
        msg.get("content")
            .and_then(Value::as_array)
            .is_some_and(|parts| {
                parts
                    .iter()
                    .any(|p| p.get("type").and_then(Value::as_str) == Some("image_url"))
            })
    })
}

fn has_context_length_code(body: &[u8]) -> bool {
    let Ok(v) = serde_json::from_slice::<Value>(body) else {
        return false;
    };
    // Either {"error": {"code": ...}} or a bare {"code": ...}.
    let code = v
        .get("error")
        .and_then(|e| e.get("code"))
        .or_else(|| v.get("code"))
        .and_then(Value::as_str);
    code == Some(CONTEXT_LENGTH_CODE)
}

fn has_embedded_quota(body: &[u8]) -> bool {
    let Ok(v) = serde_json::from_slice::<Value>(body) else {
        return false;
    };
    v.get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .is_some_and(|content| content.contains(EMBEDDED_QUOTA_MARKER))
}

// ── Unit tests ────────────────────────────────────────────────────────────────
