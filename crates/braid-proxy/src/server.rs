// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Server assembly: shared state, router, and the serve loop.
//!
//! The router is two routes deep: `GET /_status` returns the credential
//! pool snapshot, and everything else falls through to the forwarding
//! engine. All shared state lives behind one cheap-to-clone [`ProxyState`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{extract::State, response::Json, routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use braid_config::{Config, CONTENT_LENGTH_THRESHOLD};
use braid_keys::ClientKeyStore;
use braid_pool::CredentialPool;

use crate::{capture::CaptureSink, forward, rescue::RescueUpstream};

/// Upstream call timeout. Streaming completions can legitimately run for
/// minutes.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(600);

/// Static routing configuration derived from [`braid_config::Config`].
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Primary upstream base URL, guaranteed to end with `/`.
    pub primary_base: String,
    /// Rescue instead of waiting when the whole pool is cooling.
    pub fallback_on_cooldown: bool,
    /// `Content-Length` bytes above which chat requests skip the primary.
    pub oversize_threshold: u64,
    pub synthetic: Option<RescueUpstream>,
    pub zai: Option<RescueUpstream>,
}

impl ProxySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            primary_base: with_trailing_slash(&config.primary_base),
            fallback_on_cooldown: config.fallback_on_cooldown,
            oversize_threshold: CONTENT_LENGTH_THRESHOLD,
            synthetic: config
                .synthetic_api_key
                .clone()
                .map(RescueUpstream::synthetic),
            zai: config.zai_api_key.clone().map(RescueUpstream::zai),
        }
    }

    /// True when at least one rescue upstream is configured.
    pub fn any_rescue(&self) -> bool {
        self.synthetic.is_some() || self.zai.is_some()
    }
}

fn with_trailing_slash(url: &str) -> String {
    let mut s = url.to_string();
    if !s.ends_with('/') {
        s.push('/');
    }
    s
}

struct StateInner {
    settings: ProxySettings,
    pool: Arc<CredentialPool>,
    keys: Option<ClientKeyStore>,
    capture: Option<CaptureSink>,
    client: reqwest::Client,
}

/// Shared per-process state threaded through every handler.
#[derive(Clone)]
pub struct ProxyState {
    inner: Arc<StateInner>,
}

impl ProxyState {
    /// Assemble the state; `keys == None` disables inbound authentication
    /// and `capture == None` disables the capture sink.
    pub fn new(
        settings: ProxySettings,
        pool: Arc<CredentialPool>,
        keys: Option<ClientKeyStore>,
        capture: Option<CaptureSink>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()
            .context("building upstream HTTP client")?;
        Ok(Self {
            inner: Arc::new(StateInner { settings, pool, keys, capture, client }),
        })
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.inner.settings
    }

    pub fn pool(&self) -> &CredentialPool {
        &self.inner.pool
    }

    pub fn keys(&self) -> Option<&ClientKeyStore> {
        self.inner.keys.as_ref()
    }

    pub fn capture(&self) -> Option<&CaptureSink> {
        self.inner.capture.as_ref()
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.inner.client
    }
}

/// Build the proxy router.
pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/_status", get(status_handler))
        .fallback(forward::proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: ProxyState, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(bind = %listener.local_addr()?, "proxy listening");
    axum::serve(listener, router(state))
        .await
        .context("serving HTTP")?;
    Ok(())
}

/// `GET /_status` — credential pool snapshot.
async fn status_handler(State(state): State<ProxyState>) -> Json<braid_pool::PoolStatus> {
    Json(state.pool().status().await)
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let map: std::collections::HashMap<&str, &str> = pairs.iter().copied().collect();
        Config::from_lookup(|k| map.get(k).map(|v| v.to_string())).unwrap()
    }

    #[test]
    fn settings_default_to_no_rescue() {
        let s = ProxySettings::from_config(&config_from(&[]));
        assert!(s.synthetic.is_none());
        assert!(s.zai.is_none());
        assert!(!s.any_rescue());
        assert_eq!(s.oversize_threshold, CONTENT_LENGTH_THRESHOLD);
    }

    #[test]
    fn settings_build_rescue_upstreams_from_keys() {
        let s = ProxySettings::from_config(&config_from(&[
            ("SYNTHETIC_API_KEY", "syn-key"),
            ("ZAI_API_KEY", "zai-key"),
        ]));
        let synthetic = s.synthetic.unwrap();
        assert_eq!(synthetic.api_key, "syn-key");
        assert_eq!(synthetic.model, braid_config::SYNTHETIC_MODEL);
        assert_eq!(synthetic.label, "SYNTHETIC");
        let zai = s.zai.unwrap();
        assert_eq!(zai.model, braid_config::ZAI_MODEL);
        assert_eq!(zai.label, "ZAI");
    }

    #[test]
    fn primary_base_gains_trailing_slash() {
        let s = ProxySettings::from_config(&config_from(&[(
            "CEREBRAS_API_BASE",
            "http://127.0.0.1:9000/v1",
        )]));
        assert_eq!(s.primary_base, "http://127.0.0.1:9000/v1/");
    }
}
