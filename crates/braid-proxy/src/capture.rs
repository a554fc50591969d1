// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Request/response capture to disk.
//!
//! One JSON document per served response, under a date-partitioned tree:
//!
//! ```text
//! <log_dir>/2026-08-01/20260801_142233_123456_POST_chat_completions_1a2b3c4d.json
//! ```
//!
//! The recorded inbound body is always the client's original bytes — the
//! repaired body only exists on the upstream leg. `Authorization` header
//! values are redacted before they touch disk. A capture failure is logged
//! and otherwise ignored; persistence must never change what the client
//! receives.

use std::path::{Path, PathBuf};

use axum::body::Bytes;
use axum::http::{header::AUTHORIZATION, HeaderMap};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{debug, error};
use uuid::Uuid;

/// Everything one capture document records.
#[derive(Debug, Clone)]
pub struct CaptureEntry {
    pub method: String,
    /// Target path as routed; rescue captures prefix it with `[SYNTHETIC]`
    /// or `[ZAI]` so they can be filtered out of primary-only analysis.
    pub path: String,
    pub request_headers: HeaderMap,
    pub request_body: Bytes,
    pub response_status: u16,
    pub response_headers: HeaderMap,
    pub response_body: Bytes,
    pub duration_ms: f64,
}

/// Async file sink for capture documents. Clone is cheap; every record
/// writes a uniquely named file, so no locking is needed.
#[derive(Debug, Clone)]
pub struct CaptureSink {
    dir: PathBuf,
}

impl CaptureSink {
    /// Create the sink, ensuring the root directory exists.
    pub fn new(dir: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Persist one entry. Failures are logged at error level and dropped.
    pub async fn record(&self, entry: CaptureEntry) {
        match self.write(entry).await {
            Ok(path) => debug!(path = %path.display(), "capture written"),
            Err(e) => error!(error = %e, "failed to write capture"),
        }
    }

    async fn write(&self, entry: CaptureEntry) -> anyhow::Result<PathBuf> {
        let now = Utc::now();
        let date_dir = self.dir.join(now.format("%Y-%m-%d").to_string());
        let request_id = Uuid::new_v4().to_string()[..8].to_string();
        let filename = format!(
            "{}_{}_{}_{}.json",
            now.format("%Y%m%d_%H%M%S_%6f"),
            entry.method,
            safe_path(&entry.path),
            request_id
        );

        let document = json!({
            "timestamp": now.to_rfc3339(),
            "request_id": request_id,
            "request": {
                "method": entry.method,
                "path": entry.path,
                "headers": sanitize_headers(&entry.request_headers),
                "body": decode_body(&entry.request_body),
            },
            "response": {
                "status": entry.response_status,
                "headers": headers_to_json(&entry.response_headers),
                "body": decode_body(&entry.response_body),
            },
            "duration_ms": entry.duration_ms,
        });

        tokio::fs::create_dir_all(&date_dir).await?;
        let file = date_dir.join(filename);
        tokio::fs::write(&file, serde_json::to_vec_pretty(&document)?).await?;
        Ok(file)
    }
}

/// Header map → JSON object with `Authorization` values redacted.
pub fn sanitize_headers(headers: &HeaderMap) -> Value {
    let mut map = Map::new();
    for (name, value) in headers {
        let rendered = if name == AUTHORIZATION {
            "[REDACTED]".to_string()
        } else {
            String::from_utf8_lossy(value.as_bytes()).into_owned()
        };
        map.insert(name.to_string(), Value::String(rendered));
    }
    Value::Object(map)
}

fn headers_to_json(headers: &HeaderMap) -> Value {
    let mut map = Map::new();
    for (name, value) in headers {
        map.insert(
            name.to_string(),
            Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
        );
    }
    Value::Object(map)
}

/// Best-effort body decode: JSON, then UTF-8 text (SSE streams land here),
/// then base64.
fn decode_body(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    if let Ok(v) = serde_json::from_slice::<Value>(body) {
        return v;
    }
    match std::str::from_utf8(body) {
        Ok(text) => Value::String(text.to_string()),
        Err(_) => json!({ "_binary": STANDARD.encode(body) }),
    }
}

/// Filename-safe rendition of the routed path.
fn safe_path(path: &str) -> String {
    path.replace(['/', '\\'], "_").chars().take(50).collect()
}

/// List capture files under a sink directory (test helper for callers).
pub fn capture_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let Ok(days) = std::fs::read_dir(dir) else {
        return files;
    };
    for day in days.flatten() {
        if let Ok(entries) = std::fs::read_dir(day.path()) {
            for entry in entries.flatten() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    files
}

// ── Unit tests ────────────────────────────────────────────────────────────────
