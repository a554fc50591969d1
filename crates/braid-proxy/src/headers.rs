// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Header filtering for both proxy boundaries.
//!
//! Outbound: the inbound `Authorization` must never reach an upstream (each
//! upstream gets its own credential), `Host` belongs to the upstream URL,
//! and `Content-Length` is re-derived from the (possibly rewritten) body.
//!
//! Inbound: upstream `Content-Length`, `Transfer-Encoding` and
//! `Content-Encoding` are hop-by-hop — the transport re-derives them for
//! the client connection.

use axum::http::header::{
    HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_ENCODING, CONTENT_LENGTH, HOST,
    TRANSFER_ENCODING, USER_AGENT,
};

/// User agent presented to every upstream.
pub const PROXY_USER_AGENT: &str = "Cerebras-Proxy/1.0";

/// Build the header set for an upstream request from the inbound headers.
pub fn outbound_request_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(inbound.len() + 1);
    for (name, value) in inbound {
        if name == AUTHORIZATION || name == HOST || name == CONTENT_LENGTH {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out.insert(USER_AGENT, HeaderValue::from_static(PROXY_USER_AGENT));
    out
}

/// Build the header set mirrored back to the client from an upstream
/// response.
pub fn forwarded_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING || name == CONTENT_ENCODING {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_strips_authorization_host_and_length() {
        let mut inbound = HeaderMap::new();
        inbound.insert(AUTHORIZATION, "Bearer sk-client".parse().unwrap());
        inbound.insert(HOST, "proxy.local".parse().unwrap());
        inbound.insert(CONTENT_LENGTH, "42".parse().unwrap());
        inbound.insert("x-request-tag", "abc".parse().unwrap());

        let out = outbound_request_headers(&inbound);
        assert!(out.get(AUTHORIZATION).is_none());
        assert!(out.get(HOST).is_none());
        assert!(out.get(CONTENT_LENGTH).is_none());
        assert_eq!(out.get("x-request-tag").unwrap(), "abc");
    }

    #[test]
    fn outbound_sets_proxy_user_agent() {
        let mut inbound = HeaderMap::new();
        inbound.insert(USER_AGENT, "curl/8.0".parse().unwrap());
        let out = outbound_request_headers(&inbound);
        assert_eq!(out.get(USER_AGENT).unwrap(), PROXY_USER_AGENT);
    }

    #[test]
    fn response_strips_hop_by_hop_headers() {
        let mut upstream = HeaderMap::new();
        upstream.insert(CONTENT_LENGTH, "10".parse().unwrap());
        upstream.insert(TRANSFER_ENCODING, "chunked".parse().unwrap());
        upstream.insert(CONTENT_ENCODING, "gzip".parse().unwrap());
        upstream.insert("content-type", "application/json".parse().unwrap());

        let out = forwarded_response_headers(&upstream);
        assert!(out.get(CONTENT_LENGTH).is_none());
        assert!(out.get(TRANSFER_ENCODING).is_none());
        assert!(out.get(CONTENT_ENCODING).is_none());
        assert_eq!(out.get("content-type").unwrap(), "application/json");
    }

    #[test]
    fn repeated_header_values_are_kept() {
        let mut inbound = HeaderMap::new();
        inbound.append("x-tag", "one".parse().unwrap());
        inbound.append("x-tag", "two".parse().unwrap());
        let out = outbound_request_headers(&inbound);
        let values: Vec<_> = out.get_all("x-tag").iter().collect();
        assert_eq!(values.len(), 2);
    }
}
