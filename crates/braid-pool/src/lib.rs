// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Upstream credential pool with cooldown-aware sticky selection.
//!
//! The pool owns every bearer secret for the primary upstream and hands out
//! **one** of them per request. Selection is pinned-until-failed: the same
//! credential keeps being chosen until it takes a rate-limit class failure,
//! at which point it is put on cooldown and the cursor advances to the next
//! position in the ring. Round-robin would spread load across credentials
//! whose rate budgets are independent, burning budget on cold credentials
//! for no gain.
//!
//! When every credential is cooling, [`CredentialPool::select`] sleeps until
//! the soonest `cooling_until` and then returns that credential. The sleep
//! happens with the pool lock **released**, so `/_status` and concurrent
//! bookkeeping calls never stall behind a waiting request.

use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One upstream bearer secret and its liveness state.
///
/// Identity is the secret itself; names exist for logs and `/_status`.
#[derive(Debug, Clone)]
struct Credential {
    name: String,
    secret: String,
    /// `None` = never cooled. The credential is available once the instant
    /// has passed.
    cooling_until: Option<Instant>,
    error_count: u32,
}

impl Credential {
    fn is_available(&self) -> bool {
        match self.cooling_until {
            None => true,
            Some(until) => Instant::now() >= until,
        }
    }

    fn cooling_remaining(&self) -> Duration {
        self.cooling_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }
}

struct PoolState {
    credentials: Vec<Credential>,
    /// Ring cursor: the most recently selected credential.
    current: usize,
}

/// Shared, serialized credential pool. Cheap to share behind an `Arc`.
pub struct CredentialPool {
    state: Mutex<PoolState>,
    cooldown: Duration,
}

/// Value snapshot of one credential for `/_status`.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    pub name: String,
    pub available: bool,
    /// Seconds until the credential leaves cooldown (0 when available).
    pub rate_limited_for: f64,
    pub error_count: u32,
}

/// Value snapshot of the whole pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub keys: Vec<CredentialStatus>,
    pub current_key: String,
}

impl CredentialPool {
    /// Build a pool from `(name, secret)` pairs.
    ///
    /// # Panics
    /// Panics when `keys` is empty — a pool with nothing to hand out cannot
    /// serve; callers validate configuration before construction.
    pub fn new(keys: Vec<(String, String)>, cooldown: Duration) -> Self {
        assert!(!keys.is_empty(), "credential pool requires at least one key");
        let credentials: Vec<Credential> = keys
            .into_iter()
            .map(|(name, secret)| Credential {
                name,
                secret,
                cooling_until: None,
                error_count: 0,
            })
            .collect();
        info!(
            keys = credentials.len(),
            cooldown_secs = cooldown.as_secs(),
            "credential pool initialized"
        );
        Self {
            state: Mutex::new(PoolState { credentials, current: 0 }),
            cooldown,
        }
    }

    /// Number of credentials in the ring.
    pub async fn len(&self) -> usize {
        self.state.lock().await.credentials.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Return the secret to use for the next upstream attempt.
    ///
    /// Sticky: the cursor does not move on success, so the same credential
    /// is returned until it fails. When the current credential is cooling
    /// the cursor advances through the ring looking for an available one.
    /// When the whole ring is cooling, the cursor moves to the credential
    /// with the soonest `cooling_until`, the lock is dropped, and the call
    /// sleeps until that instant before returning that credential.
    pub async fn select(&self) -> String {
        let (secret, wait) = {
            let mut st = self.state.lock().await;
            let n = st.credentials.len();
            for _ in 0..n {
                let cred = &st.credentials[st.current];
                if cred.is_available() {
                    debug!(key = %cred.name, "using credential");
                    return cred.secret.clone();
                }
                debug!(key = %cred.name, "credential cooling, advancing");
                st.current = (st.current + 1) % n;
            }

            // Every credential is cooling: pick the one that recovers first.
            let (idx, remaining) = st
                .credentials
                .iter()
                .enumerate()
                .map(|(i, c)| (i, c.cooling_remaining()))
                .min_by_key(|(_, remaining)| *remaining)
                .expect("pool is never empty");
            st.current = idx;
            warn!(
                key = %st.credentials[idx].name,
                wait_ms = remaining.as_millis() as u64,
                "all credentials cooling, waiting for soonest recovery"
            );
            (st.credentials[idx].secret.clone(), remaining)
        };

        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        secret
    }

    /// Put `secret` on cooldown, bump its error count, advance the cursor.
    ///
    /// Unknown secrets are ignored — credentials are never removed
    /// mid-flight, so a miss can only come from a stale caller.
    pub async fn mark_cooled(&self, secret: &str) {
        let mut st = self.state.lock().await;
        let n = st.credentials.len();
        if let Some(idx) = st.credentials.iter().position(|c| c.secret == secret) {
            let until = Instant::now() + self.cooldown;
            let cred = &mut st.credentials[idx];
            cred.cooling_until = Some(until);
            cred.error_count += 1;
            warn!(
                key = %cred.name,
                cooldown_secs = self.cooldown.as_secs(),
                error_count = cred.error_count,
                "credential cooling"
            );
            st.current = (idx + 1) % n;
            info!(key = %st.credentials[st.current].name, "rotated to next credential");
        }
    }

    /// Reset the error count after a successful response. The cursor stays
    /// where it is — selection remains pinned to this credential.
    pub async fn mark_success(&self, secret: &str) {
        let mut st = self.state.lock().await;
        if let Some(cred) = st.credentials.iter_mut().find(|c| c.secret == secret) {
            if cred.error_count > 0 {
                info!(key = %cred.name, was_errors = cred.error_count, "credential recovered");
            }
            cred.error_count = 0;
        }
    }

    /// True iff every credential is currently cooling.
    pub async fn all_cooling(&self) -> bool {
        let st = self.state.lock().await;
        st.credentials.iter().all(|c| !c.is_available())
    }

    /// Value snapshot for the status endpoint. No lock is held by the
    /// caller after this returns.
    pub async fn status(&self) -> PoolStatus {
        let st = self.state.lock().await;
        PoolStatus {
            keys: st
                .credentials
                .iter()
                .map(|c| CredentialStatus {
                    name: c.name.clone(),
                    available: c.is_available(),
                    rate_limited_for: c.cooling_remaining().as_secs_f64(),
                    error_count: c.error_count,
                })
                .collect(),
            current_key: st.credentials[st.current].name.clone(),
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(names: &[&str], cooldown_ms: u64) -> CredentialPool {
        let keys = names
            .iter()
            .map(|n| (n.to_string(), format!("sk-{n}")))
            .collect();
        CredentialPool::new(keys, Duration::from_millis(cooldown_ms))
    }

    #[tokio::test]
    async fn select_is_sticky_on_success() {
        let pool = pool_of(&["a", "b"], 100);
        assert_eq!(pool.select().await, "sk-a");
        pool.mark_success("sk-a").await;
        assert_eq!(pool.select().await, "sk-a");
    }

    #[tokio::test]
    async fn mark_cooled_advances_to_next_available() {
        let pool = pool_of(&["a", "b"], 10_000);
        assert_eq!(pool.select().await, "sk-a");
        pool.mark_cooled("sk-a").await;

        // "a" is cooling; "b" must come back immediately, no sleeping.
        let start = Instant::now();
        assert_eq!(pool.select().await, "sk-b");
        assert!(start.elapsed() < Duration::from_millis(100), "select must not block");
    }

    #[tokio::test]
    async fn cooled_credential_becomes_available_again() {
        let pool = pool_of(&["a"], 50);
        pool.mark_cooled("sk-a").await;
        assert!(pool.all_cooling().await);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!pool.all_cooling().await);
        assert_eq!(pool.select().await, "sk-a");
    }

    #[tokio::test]
    async fn select_blocks_until_soonest_recovery_when_all_cooling() {
        let pool = pool_of(&["a", "b"], 150);
        pool.mark_cooled("sk-a").await;
        pool.mark_cooled("sk-b").await;

        let start = Instant::now();
        let secret = pool.select().await;
        let waited = start.elapsed();

        // Both cooled at ~the same time; the wait is bounded by the cooldown.
        assert!(waited >= Duration::from_millis(50), "must actually wait");
        assert!(waited < Duration::from_millis(1_000), "must not overshoot");
        // "a" was cooled first so it recovers first.
        assert_eq!(secret, "sk-a");
    }

    #[tokio::test]
    async fn status_answers_while_a_select_is_sleeping() {
        use std::sync::Arc;

        let pool = Arc::new(pool_of(&["a"], 300));
        pool.mark_cooled("sk-a").await;

        let sleeper = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.select().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The sleeping select must not hold the lock.
        let start = Instant::now();
        let status = pool.status().await;
        assert!(start.elapsed() < Duration::from_millis(100));
        assert!(!status.keys[0].available);
        assert!(status.keys[0].rate_limited_for > 0.0);

        assert_eq!(sleeper.await.unwrap(), "sk-a");
    }

    #[tokio::test]
    async fn mark_cooled_unknown_secret_is_a_noop() {
        let pool = pool_of(&["a"], 100);
        pool.mark_cooled("sk-nope").await;
        assert!(!pool.all_cooling().await);
        assert_eq!(pool.select().await, "sk-a");
    }

    #[tokio::test]
    async fn mark_success_resets_error_count_only() {
        let pool = pool_of(&["a", "b"], 10);
        pool.mark_cooled("sk-a").await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        pool.mark_success("sk-a").await;
        let status = pool.status().await;
        let a = status.keys.iter().find(|k| k.name == "a").unwrap();
        assert_eq!(a.error_count, 0);
        // Cursor stays on "b" (mark_success never moves it).
        assert_eq!(status.current_key, "b");
    }

    #[tokio::test]
    async fn status_snapshot_shape() {
        let pool = pool_of(&["a", "b"], 60_000);
        pool.mark_cooled("sk-b").await;
        let status = pool.status().await;

        assert_eq!(status.keys.len(), 2);
        let b = status.keys.iter().find(|k| k.name == "b").unwrap();
        assert!(!b.available);
        assert!(b.rate_limited_for > 59.0 && b.rate_limited_for <= 60.0);
        assert_eq!(b.error_count, 1);

        // Serializes to the wire shape used by /_status.
        let json = serde_json::to_value(&status).unwrap();
        assert!(json["keys"][0]["name"].is_string());
        assert!(json["current_key"].is_string());
    }

    #[test]
    #[should_panic(expected = "at least one key")]
    fn empty_pool_panics() {
        let _ = CredentialPool::new(Vec::new(), Duration::from_secs(1));
    }
}
