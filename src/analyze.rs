// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Capture-log token ratio analysis.
//!
//! The oversize routing threshold assumes a bytes-per-token ratio; this
//! report recomputes the observed ratio from real traffic. Each primary
//! chat completion capture contributes one sample: characters of user and
//! system prompt content vs the `prompt_tokens` the upstream reported.
//! Rescue captures (`[SYNTHETIC]`, `[ZAI]`) are skipped — their models
//! tokenize differently.

use std::path::Path;

use serde_json::Value;
use walkdir::WalkDir;

struct Sample {
    file: String,
    chars: usize,
    tokens: u64,
    ratio: f64,
}

pub fn run(dir: &Path) -> anyhow::Result<()> {
    let mut samples = Vec::new();

    for entry in WalkDir::new(dir).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let name = path.to_string_lossy();
        if name.contains("[SYNTHETIC]") || name.contains("[ZAI]") {
            continue;
        }
        if !name.contains("chat_completions") {
            continue;
        }
        if let Some(sample) = analyze_file(path) {
            samples.push(sample);
        }
    }

    if samples.is_empty() {
        println!("No usable capture files under {}", dir.display());
        return Ok(());
    }

    samples.sort_by_key(|s| s.tokens);

    println!("{:<50} {:>10} {:>10} {:>8}", "File", "Chars", "Tokens", "Ratio");
    for s in &samples {
        println!("{:<50} {:>10} {:>10} {:>8.2}", s.file, s.chars, s.tokens, s.ratio);
    }

    let ratios: Vec<f64> = samples.iter().map(|s| s.ratio).collect();
    let avg = ratios.iter().sum::<f64>() / ratios.len() as f64;
    let min = ratios.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = ratios.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    println!();
    println!("Samples:       {}", samples.len());
    println!("Average ratio: {avg:.2} chars/token");
    println!("Min ratio:     {min:.2} chars/token");
    println!("Max ratio:     {max:.2} chars/token");
    println!(
        "Configured:    {:.2} bytes/token (threshold {} bytes)",
        braid_config::BYTES_PER_TOKEN,
        braid_config::CONTENT_LENGTH_THRESHOLD
    );
    Ok(())
}

fn analyze_file(path: &Path) -> Option<Sample> {
    let doc: Value = serde_json::from_slice(&std::fs::read(path).ok()?).ok()?;
    let messages = doc["request"]["body"]["messages"].as_array()?;
    let tokens = doc["response"]["body"]["usage"]["prompt_tokens"].as_u64()?;
    if tokens == 0 {
        return None;
    }
    let chars = count_prompt_chars(messages);
    if chars == 0 {
        return None;
    }
    Some(Sample {
        file: path.file_name()?.to_string_lossy().into_owned(),
        chars,
        tokens,
        ratio: chars as f64 / tokens as f64,
    })
}

/// Characters in user and system message content. Assistant turns and tool
/// results are excluded — the ratio calibrates inbound prompt size.
fn count_prompt_chars(messages: &[Value]) -> usize {
    let mut total = 0;
    for msg in messages {
        match msg.get("role").and_then(Value::as_str) {
            Some("user") | Some("system") => {}
            _ => continue,
        }
        match msg.get("content") {
            Some(Value::String(text)) => total += text.len(),
            Some(Value::Array(parts)) => {
                for part in parts {
                    if let Some(text) = part.get("text").and_then(Value::as_str) {
                        total += text.len();
                    }
                }
            }
            _ => {}
        }
    }
    total
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn counts_user_and_system_text_only() {
        let messages = vec![
            json!({ "role": "system", "content": "abcd" }),
            json!({ "role": "user", "content": "efgh" }),
            json!({ "role": "assistant", "content": "ignored" }),
            json!({ "role": "tool", "tool_call_id": "t", "content": "ignored" }),
        ];
        assert_eq!(count_prompt_chars(&messages), 8);
    }

    #[test]
    fn counts_text_parts_in_content_arrays() {
        let messages = vec![json!({
            "role": "user",
            "content": [
                { "type": "text", "text": "12345" },
                { "type": "image_url", "image_url": { "url": "data:,x" } }
            ]
        })];
        assert_eq!(count_prompt_chars(&messages), 5);
    }

    #[test]
    fn analyze_file_computes_ratio_from_capture_doc() {
        let dir = tempfile::tempdir().unwrap();
        let doc = json!({
            "request": { "body": { "messages": [
                { "role": "user", "content": "x".repeat(470) }
            ]}},
            "response": { "body": { "usage": { "prompt_tokens": 100 } } }
        });
        let path = dir.path().join("20260801_POST_chat_completions_ab.json");
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        let sample = analyze_file(&path).unwrap();
        assert_eq!(sample.chars, 470);
        assert_eq!(sample.tokens, 100);
        assert!((sample.ratio - 4.7).abs() < 1e-9);
    }

    #[test]
    fn analyze_file_rejects_docs_without_usage() {
        let dir = tempfile::tempdir().unwrap();
        let doc = json!({
            "request": { "body": { "messages": [{ "role": "user", "content": "hi" }] } },
            "response": { "body": "streaming text" }
        });
        let path = dir.path().join("capture.json");
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();
        assert!(analyze_file(&path).is_none());
    }
}
