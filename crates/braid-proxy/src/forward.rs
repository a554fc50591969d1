// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The per-request forwarding engine.
//!
//! ```text
//! AUTH → CLASSIFY → REPAIR → ATTEMPT{k = 0..2N} → RETURN | RESCUE | FAIL
//! ```
//!
//! The attempt loop allows two full sweeps of the credential ring. Each
//! attempt selects a credential (possibly waiting out a cooldown), issues
//! the upstream call, and acts on the classified outcome: mirror it back,
//! cool the credential and retry, or hand off to the rescue router. Rescue
//! is only reachable when the request carries a parseable chat payload —
//! the alternatives need a `model` substitution to accept it.

use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{header::CONTENT_LENGTH, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::Value;
use tracing::{error, info, warn};

use braid_config::SYNTHETIC_VISION_MODEL;

use crate::{
    auth,
    capture::CaptureEntry,
    classify::{self, Outcome},
    headers, repair,
    rescue::{self, RescueRequest},
    server::ProxyState,
};

/// Fallback handler: everything that is not `/_status` lands here.
pub async fn proxy_handler(State(state): State<ProxyState>, req: Request) -> Response {
    let started = Instant::now();
    let (parts, body) = req.into_parts();
    let method = parts.method;
    let inbound_headers = parts.headers;
    let target = classify::normalize_target(&parts.uri);
    let is_chat = classify::is_chat_completions(&target);

    // AUTH — rejections answer immediately and are never captured.
    if let Some(store) = state.keys() {
        if let Err(rejection) = auth::authenticate(store, &inbound_headers).await {
            return rejection;
        }
    }

    let declared_len = inbound_headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let original_body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "failed to read request body");
            return (StatusCode::BAD_REQUEST, "failed to read request body").into_response();
        }
    };

    // Oversize pre-routing: the Content-Length header lets us skip the
    // primary before inspecting the payload. An unparseable body reverts to
    // the primary, which will produce its own error.
    if is_chat && declared_len.is_some_and(|len| len > state.settings().oversize_threshold) {
        match serde_json::from_slice::<Value>(&original_body) {
            Ok(payload) => {
                info!(
                    bytes = declared_len.unwrap_or(0),
                    threshold = state.settings().oversize_threshold,
                    "request size exceeds threshold, rescuing"
                );
                return rescue::dispatch(
                    &state,
                    RescueRequest {
                        method,
                        target: &target,
                        inbound_headers: &inbound_headers,
                        original_body: &original_body,
                        payload: &payload,
                        model_override: None,
                        started,
                    },
                )
                .await;
            }
            Err(_) => warn!("oversize request is not valid JSON, continuing with primary"),
        }
    }

    // REPAIR — chat completion POSTs only. The original bytes stay around
    // for capture; the upstream gets the repaired serialization.
    let mut forward_body = original_body.clone();
    let mut payload: Option<Value> = None;
    if is_chat && method == Method::POST && !original_body.is_empty() {
        if let Ok(parsed) = serde_json::from_slice::<Value>(&original_body) {
            match repair::repair_request(&parsed) {
                Some(fixed) => match serde_json::to_vec(&fixed) {
                    Ok(bytes) => {
                        info!(
                            before = message_count(&parsed),
                            after = message_count(&fixed),
                            "synthesized missing tool responses"
                        );
                        forward_body = Bytes::from(bytes);
                        payload = Some(fixed);
                    }
                    Err(e) => {
                        error!(error = %e, "repaired body failed to serialize, forwarding original");
                        payload = Some(parsed);
                    }
                },
                None => payload = Some(parsed),
            }
        }
    }

    // Vision routing needs the parsed payload, so it runs post-repair.
    if let Some(data) = payload.as_ref() {
        if classify::has_image_content(data) {
            if state.settings().synthetic.is_some() {
                info!("image content detected, rescuing to vision model");
                return rescue::dispatch(
                    &state,
                    RescueRequest {
                        method,
                        target: &target,
                        inbound_headers: &inbound_headers,
                        original_body: &original_body,
                        payload: data,
                        model_override: Some(SYNTHETIC_VISION_MODEL),
                        started,
                    },
                )
                .await;
            }
            warn!("image content detected but no vision-capable rescue upstream configured");
        }
    }

    let rescue_possible = state.settings().any_rescue() && payload.is_some();

    // Pre-dispatch cooldown fallback: don't queue behind a sleeping pool
    // when an alternative can take the request right now.
    if state.settings().fallback_on_cooldown && rescue_possible && state.pool().all_cooling().await
    {
        warn!("all credentials cooling, rescuing before dispatch");
        return rescue::dispatch(
            &state,
            RescueRequest {
                method,
                target: &target,
                inbound_headers: &inbound_headers,
                original_body: &original_body,
                payload: payload.as_ref().expect("rescue_possible implies payload"),
                model_override: None,
                started,
            },
        )
        .await;
    }

    // ATTEMPT — two full sweeps of the ring.
    let outbound = headers::outbound_request_headers(&inbound_headers);
    let url = format!("{}{}", state.settings().primary_base, target);
    let max_attempts = 2 * state.pool().len().await;

    for attempt in 1..=max_attempts {
        let secret = state.pool().select().await;

        let mut builder = state
            .client()
            .request(method.clone(), &url)
            .headers(outbound.clone())
            .bearer_auth(&secret);
        if !forward_body.is_empty() {
            builder = builder.body(forward_body.clone());
        }

        let upstream = match builder.send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(attempt, error = %e, "transport failure, cooling credential");
                state.pool().mark_cooled(&secret).await;
                continue;
            }
        };

        let status = upstream.status();
        let resp_headers = upstream.headers().clone();
        let resp_body = match upstream.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(attempt, error = %e, "failed to read upstream body, cooling credential");
                state.pool().mark_cooled(&secret).await;
                continue;
            }
        };

        let rescue_req = || RescueRequest {
            method: method.clone(),
            target: &target,
            inbound_headers: &inbound_headers,
            original_body: &original_body,
            payload: payload.as_ref().expect("guarded by rescue_possible"),
            model_override: None,
            started,
        };

        match Outcome::classify(status, &resp_body) {
            Outcome::KeyPressure => {
                warn!(status = status.as_u16(), attempt, "key pressure, rotating credential");
                state.pool().mark_cooled(&secret).await;
                if state.settings().fallback_on_cooldown
                    && rescue_possible
                    && state.pool().all_cooling().await
                {
                    warn!("all credentials now cooling, rescuing");
                    return rescue::dispatch(&state, rescue_req()).await;
                }
                continue;
            }
            Outcome::OverContext => {
                if rescue_possible {
                    warn!("context length exceeded, rescuing");
                    return rescue::dispatch(&state, rescue_req()).await;
                }
                info!(status = status.as_u16(), "request completed");
                return finish(&state, &method, &target, &inbound_headers, &original_body,
                    status, resp_headers, resp_body, started).await;
            }
            Outcome::Unavailable => {
                if rescue_possible {
                    warn!("primary unavailable, rescuing");
                    return rescue::dispatch(&state, rescue_req()).await;
                }
                info!(status = status.as_u16(), "request completed");
                return finish(&state, &method, &target, &inbound_headers, &original_body,
                    status, resp_headers, resp_body, started).await;
            }
            Outcome::EmbeddedQuota => {
                state.pool().mark_success(&secret).await;
                if rescue_possible {
                    warn!("embedded quota exhaustion in response content, rescuing");
                    return rescue::dispatch(&state, rescue_req()).await;
                }
                info!(status = status.as_u16(), "request completed");
                return finish(&state, &method, &target, &inbound_headers, &original_body,
                    status, resp_headers, resp_body, started).await;
            }
            Outcome::Ok => {
                state.pool().mark_success(&secret).await;
                info!(status = status.as_u16(), "request completed");
                return finish(&state, &method, &target, &inbound_headers, &original_body,
                    status, resp_headers, resp_body, started).await;
            }
            Outcome::Other => {
                info!(status = status.as_u16(), "request completed");
                return finish(&state, &method, &target, &inbound_headers, &original_body,
                    status, resp_headers, resp_body, started).await;
            }
        }
    }

    error!(max_attempts, "maximum retry attempts exceeded");
    let message = "Service unavailable: Maximum retries exceeded.";
    record_exchange(
        &state,
        &method,
        &target,
        &inbound_headers,
        &original_body,
        StatusCode::SERVICE_UNAVAILABLE,
        &HeaderMap::new(),
        &Bytes::from_static(message.as_bytes()),
        started,
    )
    .await;
    (StatusCode::SERVICE_UNAVAILABLE, message).into_response()
}

/// Capture the exchange, then mirror the upstream response to the client.
#[allow(clippy::too_many_arguments)]
async fn finish(
    state: &ProxyState,
    method: &Method,
    recorded_path: &str,
    inbound_headers: &HeaderMap,
    original_body: &Bytes,
    status: StatusCode,
    resp_headers: HeaderMap,
    resp_body: Bytes,
    started: Instant,
) -> Response {
    record_exchange(
        state,
        method,
        recorded_path,
        inbound_headers,
        original_body,
        status,
        &resp_headers,
        &resp_body,
        started,
    )
    .await;
    mirror_upstream(status, &resp_headers, resp_body)
}

/// Write one capture document when the sink is enabled. Never fails the
/// request.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn record_exchange(
    state: &ProxyState,
    method: &Method,
    recorded_path: &str,
    inbound_headers: &HeaderMap,
    original_body: &Bytes,
    status: StatusCode,
    resp_headers: &HeaderMap,
    resp_body: &Bytes,
    started: Instant,
) {
    if let Some(sink) = state.capture() {
        sink.record(CaptureEntry {
            method: method.to_string(),
            path: recorded_path.to_string(),
            request_headers: inbound_headers.clone(),
            request_body: original_body.clone(),
            response_status: status.as_u16(),
            response_headers: resp_headers.clone(),
            response_body: resp_body.clone(),
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        })
        .await;
    }
}

/// Mirror an upstream response: status and body verbatim, hop-by-hop
/// headers stripped (the transport re-derives them).
pub(crate) fn mirror_upstream(status: StatusCode, resp_headers: &HeaderMap, body: Bytes) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers::forwarded_response_headers(resp_headers);
    response
}

fn message_count(payload: &Value) -> usize {
    payload
        .get("messages")
        .and_then(Value::as_array)
        .map(|m| m.len())
        .unwrap_or(0)
}
