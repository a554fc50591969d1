// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Inbound bearer-token authentication against the client key store.
//!
//! When enabled, every proxied request must carry
//! `Authorization: Bearer sk-…` with a key issued by `braid keys add`.
//! Failures answer with the OpenAI-style structured error body so existing
//! SDKs surface them cleanly:
//!
//! ```json
//! {"error": {"message": "...", "type": "invalid_request_error", "code": "..."}}
//! ```

use axum::{
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{error, warn};

use braid_keys::ClientKeyStore;

/// Validate the inbound `Authorization` header against the key store.
///
/// `Err` carries the ready-to-send rejection response.
pub async fn authenticate(store: &ClientKeyStore, headers: &HeaderMap) -> Result<(), Response> {
    let Some(raw) = headers.get(AUTHORIZATION) else {
        warn!("request rejected: missing Authorization header");
        return Err(rejection("Missing Authorization header", "missing_authorization"));
    };

    let Ok(value) = raw.to_str() else {
        warn!("request rejected: non-ASCII Authorization header");
        return Err(rejection("Invalid Authorization header format", "invalid_authorization"));
    };

    let mut parts = value.split_whitespace();
    let token = match (parts.next(), parts.next(), parts.next()) {
        (Some(scheme), Some(token), None) if scheme.eq_ignore_ascii_case("bearer") => token,
        _ => {
            warn!("request rejected: malformed Authorization header");
            return Err(rejection("Invalid Authorization header format", "invalid_authorization"));
        }
    };

    match store.verify(token).await {
        Ok(true) => Ok(()),
        Ok(false) => {
            warn!("request rejected: invalid or revoked client key");
            Err(rejection("Invalid API key", "invalid_api_key"))
        }
        Err(e) => {
            error!(error = %e, "client key store unavailable");
            Err((StatusCode::INTERNAL_SERVER_ERROR, "key store unavailable").into_response())
        }
    }
}

fn rejection(message: &str, code: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": {
                "message": message,
                "type": "invalid_request_error",
                "code": code
            }
        })),
    )
        .into_response()
}

// ── Unit tests ────────────────────────────────────────────────────────────────
