// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Proxy configuration loaded from the environment.
//!
//! All knobs are environment variables (the proxy is container-first; there
//! is no config file). Every default is safe to run with except
//! `CEREBRAS_API_KEYS`, which `braid serve` requires to be a non-empty JSON
//! object of `{name: secret}` pairs.
//!
//! | Variable | Effect |
//! |---|---|
//! | `CEREBRAS_API_KEYS` | JSON object populating the credential pool |
//! | `CEREBRAS_API_BASE` | primary upstream base URL |
//! | `CEREBRAS_COOLDOWN` | per-credential cooldown seconds (default 60) |
//! | `SYNTHETIC_API_KEY` | bearer for the first rescue upstream |
//! | `ZAI_API_KEY` | bearer for the second rescue upstream |
//! | `ENABLE_INCOMING_AUTH` | require inbound bearer authentication |
//! | `INCOMING_KEY_DB` | client key store path |
//! | `FALLBACK_ON_COOLDOWN` | rescue when the whole pool is cooling |
//! | `LOG_REQUESTS` / `LOG_DIR` | capture sink enable + destination |

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

/// Default primary upstream (Cerebras-compatible chat completion API).
pub const DEFAULT_PRIMARY_BASE: &str = "https://api.cerebras.ai/v1/";

/// First rescue upstream.
pub const SYNTHETIC_BASE: &str = "https://api.synthetic.new/openai/v1/";
pub const SYNTHETIC_MODEL: &str = "hf:zai-org/GLM-4.6";
pub const SYNTHETIC_VISION_MODEL: &str = "hf:Qwen/Qwen3-VL-235B-A22B-Instruct";

/// Second rescue upstream.
pub const ZAI_BASE: &str = "https://api.z.ai/api/coding/paas/v4/";
pub const ZAI_MODEL: &str = "glm-4.6";

/// Request-size routing threshold, estimated from the `Content-Length`
/// header. 4.7 bytes/token comes from measured capture logs (`braid
/// analyze`); 120k tokens is the primary's practical context ceiling.
pub const TOKEN_THRESHOLD: u64 = 120_000;
pub const BYTES_PER_TOKEN: f64 = 4.7;
pub const CONTENT_LENGTH_THRESHOLD: u64 = (TOKEN_THRESHOLD as f64 * BYTES_PER_TOKEN) as u64;

const DEFAULT_COOLDOWN_SECS: u64 = 60;
const DEFAULT_KEY_DB: &str = "./data/incoming_keys.db";
const DEFAULT_LOG_DIR: &str = "./logs";

/// A named upstream credential as configured in `CEREBRAS_API_KEYS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedSecret {
    pub name: String,
    pub secret: String,
}

/// Fully resolved proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Primary upstream base URL, trailing slash preserved.
    pub primary_base: String,
    /// Credential pool entries, ordered by name.
    pub upstream_keys: Vec<NamedSecret>,
    /// How long a credential rests after a 429/500/transport failure.
    pub cooldown: Duration,
    /// Bearer for the first rescue upstream; `None` disables it.
    pub synthetic_api_key: Option<String>,
    /// Bearer for the second rescue upstream; `None` disables it.
    pub zai_api_key: Option<String>,
    /// Require inbound `Authorization: Bearer` validation.
    pub enable_incoming_auth: bool,
    /// Client key store location (SQLite).
    pub incoming_key_db: PathBuf,
    /// Rescue instead of sleeping when every credential is cooling.
    pub fallback_on_cooldown: bool,
    /// Persist request/response capture documents.
    pub log_requests: bool,
    /// Capture destination directory.
    pub log_dir: PathBuf,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// Extracted so tests can feed a map instead of mutating the process
    /// environment.
    pub fn from_lookup<F>(get: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let upstream_keys = match get("CEREBRAS_API_KEYS") {
            Some(raw) => parse_key_map(&raw)?,
            None => Vec::new(),
        };

        let cooldown_secs = match get("CEREBRAS_COOLDOWN") {
            Some(raw) => raw
                .parse::<u64>()
                .with_context(|| format!("invalid CEREBRAS_COOLDOWN: {raw:?}"))?,
            None => DEFAULT_COOLDOWN_SECS,
        };

        Ok(Self {
            primary_base: get("CEREBRAS_API_BASE")
                .unwrap_or_else(|| DEFAULT_PRIMARY_BASE.to_string()),
            upstream_keys,
            cooldown: Duration::from_secs(cooldown_secs),
            synthetic_api_key: get("SYNTHETIC_API_KEY").filter(|k| !k.is_empty()),
            zai_api_key: get("ZAI_API_KEY").filter(|k| !k.is_empty()),
            enable_incoming_auth: get("ENABLE_INCOMING_AUTH")
                .map(|v| is_truthy(&v))
                .unwrap_or(false),
            incoming_key_db: get("INCOMING_KEY_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_KEY_DB)),
            fallback_on_cooldown: get("FALLBACK_ON_COOLDOWN")
                .map(|v| is_truthy(&v))
                .unwrap_or(false),
            log_requests: get("LOG_REQUESTS").map(|v| is_truthy(&v)).unwrap_or(true),
            log_dir: get("LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
        })
    }

    /// True when at least one rescue upstream has a credential.
    pub fn any_rescue_configured(&self) -> bool {
        self.synthetic_api_key.is_some() || self.zai_api_key.is_some()
    }
}

/// Parse the `CEREBRAS_API_KEYS` JSON object into `(name, secret)` pairs.
///
/// A `BTreeMap` keeps the pool ring in a deterministic order (JSON object
/// key order is not something the format guarantees).
fn parse_key_map(raw: &str) -> anyhow::Result<Vec<NamedSecret>> {
    let map: BTreeMap<String, String> =
        serde_json::from_str(raw).context("CEREBRAS_API_KEYS is not a JSON object of strings")?;
    Ok(map
        .into_iter()
        .map(|(name, secret)| NamedSecret { name, secret })
        .collect())
}

/// Flag parsing for `ENABLE_INCOMING_AUTH` and friends.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

// ── Unit tests ────────────────────────────────────────────────────────────────
