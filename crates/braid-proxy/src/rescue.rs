// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Rescue routing: sequenced fallback over the alternative upstreams.
//!
//! When the primary cannot serve a request — payload too large, vision
//! content, context overflow, outage, or a fully cooling credential pool —
//! the request is rewritten for an alternative upstream and sent there
//! instead. Two alternatives are tried in order:
//!
//! 1. **alternative-A** (`[SYNTHETIC]`) — gets the request first; a status
//!    `< 400` wins, anything else falls through.
//! 2. **alternative-B** (`[ZAI]`) — one shot; its response is returned to
//!    the client whatever the status.
//!
//! Each alternative has exactly one credential and its own model name; the
//! payload's `model` field is substituted before dispatch. No retries, no
//! rotation.

use std::time::Instant;

use axum::{
    body::Bytes,
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use braid_config::{SYNTHETIC_BASE, SYNTHETIC_MODEL, ZAI_BASE, ZAI_MODEL};

use crate::{
    forward::{mirror_upstream, record_exchange},
    headers,
    server::ProxyState,
};

/// One alternative upstream: base URL, single bearer credential, model to
/// substitute, and the tag used to mark its capture records.
#[derive(Debug, Clone)]
pub struct RescueUpstream {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub label: &'static str,
}

impl RescueUpstream {
    pub fn synthetic(api_key: String) -> Self {
        Self {
            base_url: SYNTHETIC_BASE.to_string(),
            api_key,
            model: SYNTHETIC_MODEL.to_string(),
            label: "SYNTHETIC",
        }
    }

    pub fn zai(api_key: String) -> Self {
        Self {
            base_url: ZAI_BASE.to_string(),
            api_key,
            model: ZAI_MODEL.to_string(),
            label: "ZAI",
        }
    }
}

/// Everything the rescue router needs from the original request.
pub struct RescueRequest<'a> {
    pub method: Method,
    /// Normalized target path (plus query), no leading slash.
    pub target: &'a str,
    pub inbound_headers: &'a HeaderMap,
    /// The client's bytes, recorded in captures.
    pub original_body: &'a Bytes,
    /// Parsed (possibly repaired) chat payload; `model` is rewritten per
    /// upstream before dispatch.
    pub payload: &'a Value,
    /// Overrides alternative-A's default model (vision requests).
    pub model_override: Option<&'a str>,
    pub started: Instant,
}

/// Route a request through the rescue sequence and mirror the outcome.
pub async fn dispatch(state: &ProxyState, req: RescueRequest<'_>) -> Response {
    let settings = state.settings();

    if let Some(alt) = &settings.synthetic {
        let model = req.model_override.unwrap_or(&alt.model);
        info!(upstream = alt.label, model, "routing request to rescue upstream");
        match attempt(state, alt, model, &req).await {
            Ok((status, resp_headers, resp_body)) if status.as_u16() < 400 => {
                info!(upstream = alt.label, status = status.as_u16(), "rescue succeeded");
                return finish(state, alt, &req, status, resp_headers, resp_body).await;
            }
            Ok((status, ..)) => {
                warn!(
                    upstream = alt.label,
                    status = status.as_u16(),
                    "rescue upstream returned an error, falling back"
                );
            }
            Err(e) => {
                warn!(upstream = alt.label, error = %e, "rescue upstream failed, falling back");
            }
        }
    }

    if let Some(alt) = &settings.zai {
        info!(upstream = alt.label, model = %alt.model, "routing request to rescue upstream");
        match attempt(state, alt, &alt.model, &req).await {
            // Success or failure, this is what the client gets.
            Ok((status, resp_headers, resp_body)) => {
                info!(upstream = alt.label, status = status.as_u16(), "rescue completed");
                return finish(state, alt, &req, status, resp_headers, resp_body).await;
            }
            Err(e) => {
                error!(upstream = alt.label, error = %e, "rescue upstream failed");
                return unavailable(state, &req, format!("All alternative APIs failed: {e}")).await;
            }
        }
    }

    error!("no rescue upstream configured");
    unavailable(state, &req, "No alternative APIs configured".to_string()).await
}

/// Terminal 503 when no rescue upstream could serve the request. Captured
/// like any other served response.
async fn unavailable(state: &ProxyState, req: &RescueRequest<'_>, message: String) -> Response {
    record_exchange(
        state,
        &req.method,
        req.target,
        req.inbound_headers,
        req.original_body,
        StatusCode::SERVICE_UNAVAILABLE,
        &HeaderMap::new(),
        &Bytes::from(message.clone()),
        req.started,
    )
    .await;
    (StatusCode::SERVICE_UNAVAILABLE, message).into_response()
}

/// One shot at one alternative: substitute the model, serialize compact,
/// post with the alternative's own credential.
async fn attempt(
    state: &ProxyState,
    alt: &RescueUpstream,
    model: &str,
    req: &RescueRequest<'_>,
) -> anyhow::Result<(StatusCode, HeaderMap, Bytes)> {
    let mut payload = req.payload.clone();
    if payload.get("model").is_some() {
        payload["model"] = json!(model);
    }
    let body = serde_json::to_vec(&payload)?;

    let url = format!("{}{}", alt.base_url, req.target);
    let resp = state
        .client()
        .request(req.method.clone(), &url)
        .headers(headers::outbound_request_headers(req.inbound_headers))
        .bearer_auth(&alt.api_key)
        .body(body)
        .send()
        .await?;

    let status = resp.status();
    let resp_headers = resp.headers().clone();
    let resp_body = resp.bytes().await?;
    Ok((status, resp_headers, resp_body))
}

async fn finish(
    state: &ProxyState,
    alt: &RescueUpstream,
    req: &RescueRequest<'_>,
    status: StatusCode,
    resp_headers: HeaderMap,
    resp_body: Bytes,
) -> Response {
    let recorded_path = format!("[{}] {}", alt.label, req.target);
    record_exchange(
        state,
        &req.method,
        &recorded_path,
        req.inbound_headers,
        req.original_body,
        status,
        &resp_headers,
        &resp_body,
        req.started,
    )
    .await;
    mirror_upstream(status, &resp_headers, resp_body)
}
