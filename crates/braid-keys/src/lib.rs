// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Persistent client-credential store backed by SQLite.
//!
//! Clients of the proxy authenticate with `Authorization: Bearer sk-…`
//! tokens issued by the `braid keys` CLI. The table keeps the full issue /
//! revoke lifecycle plus usage counters:
//!
//! ```text
//! api_keys(id, api_key UNIQUE, name, created_at,
//!          revoked, revoked_at, last_used_at, request_count)
//! ```
//!
//! The serving path consumes exactly one operation, [`ClientKeyStore::verify`],
//! which runs on the blocking thread pool so SQLite never stalls a request
//! worker. Administrative operations are synchronous — they run from the CLI.

use std::path::Path;
use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

/// Errors from the client key store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("blocking task failed: {0}")]
    Task(String),
}

/// One row of the `api_keys` table.
#[derive(Debug, Clone)]
pub struct ClientKey {
    pub id: i64,
    pub api_key: String,
    pub name: String,
    pub created_at: String,
    pub revoked: bool,
    pub revoked_at: Option<String>,
    pub last_used_at: Option<String>,
    pub request_count: i64,
}

/// Aggregate counts for `braid keys stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyStats {
    pub total: i64,
    pub active: i64,
    pub revoked: i64,
}

/// How a CLI argument identifies a key: numeric id, the key value itself,
/// or the human-readable name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyIdent {
    Id(i64),
    Key(String),
    Name(String),
}

impl KeyIdent {
    /// Auto-detect the identifier kind: all digits → id, `sk-` prefix →
    /// key value, anything else → name.
    pub fn parse(raw: &str) -> Self {
        if let Ok(id) = raw.parse::<i64>() {
            KeyIdent::Id(id)
        } else if raw.starts_with("sk-") {
            KeyIdent::Key(raw.to_string())
        } else {
            KeyIdent::Name(raw.to_string())
        }
    }
}

/// SQLite-backed key store, shareable across tasks.
#[derive(Clone)]
pub struct ClientKeyStore {
    conn: Arc<Mutex<Connection>>,
}

impl ClientKeyStore {
    /// Open (or create) the store at `path`, creating parent directories
    /// and the table as needed.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                info!(dir = %dir.display(), "creating key store directory");
                std::fs::create_dir_all(dir)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS api_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                api_key TEXT UNIQUE NOT NULL,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL,
                revoked INTEGER DEFAULT 0,
                revoked_at TEXT,
                last_used_at TEXT,
                request_count INTEGER DEFAULT 0
            )",
            [],
        )?;
        info!(path = %path.display(), "client key store ready");

        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Check a presented key: valid iff present and not revoked. A valid
    /// check also stamps `last_used_at` and bumps `request_count`.
    ///
    /// Runs on the blocking pool — this is the only store call on the
    /// serving path.
    pub async fn verify(&self, api_key: &str) -> Result<bool, StoreError> {
        let conn = self.conn.clone();
        let api_key = api_key.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            verify_sync(&conn, &api_key)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Issue a new key for `name` and return it. The key value is only
    /// ever shown at generation time.
    pub fn generate(&self, name: &str) -> Result<String, StoreError> {
        let conn = self.conn.lock().unwrap();
        loop {
            let api_key = random_key();
            let created_at = Utc::now().to_rfc3339();
            match conn.execute(
                "INSERT INTO api_keys (api_key, name, created_at) VALUES (?1, ?2, ?3)",
                params![api_key, name, created_at],
            ) {
                Ok(_) => {
                    info!(name, "generated client key");
                    return Ok(api_key);
                }
                // 32 random bytes colliding is astronomically unlikely,
                // but the UNIQUE constraint makes a retry trivially safe.
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    warn!("client key collision, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Revoke a key. Returns false when the key does not exist or is
    /// already revoked.
    pub fn revoke(&self, ident: &KeyIdent) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let changed = match ident {
            KeyIdent::Id(id) => conn.execute(
                "UPDATE api_keys SET revoked = 1, revoked_at = ?1 WHERE id = ?2 AND revoked = 0",
                params![now, id],
            )?,
            KeyIdent::Key(key) => conn.execute(
                "UPDATE api_keys SET revoked = 1, revoked_at = ?1 WHERE api_key = ?2 AND revoked = 0",
                params![now, key],
            )?,
            KeyIdent::Name(name) => conn.execute(
                "UPDATE api_keys SET revoked = 1, revoked_at = ?1 WHERE name = ?2 AND revoked = 0",
                params![now, name],
            )?,
        };
        if changed > 0 {
            info!(?ident, "revoked client key");
        } else {
            warn!(?ident, "revoke matched no active key");
        }
        Ok(changed > 0)
    }

    /// Re-enable a revoked key. Returns false when the key does not exist
    /// or is not revoked.
    pub fn enable(&self, ident: &KeyIdent) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = match ident {
            KeyIdent::Id(id) => conn.execute(
                "UPDATE api_keys SET revoked = 0, revoked_at = NULL WHERE id = ?1 AND revoked = 1",
                params![id],
            )?,
            KeyIdent::Key(key) => conn.execute(
                "UPDATE api_keys SET revoked = 0, revoked_at = NULL WHERE api_key = ?1 AND revoked = 1",
                params![key],
            )?,
            KeyIdent::Name(name) => conn.execute(
                "UPDATE api_keys SET revoked = 0, revoked_at = NULL WHERE name = ?1 AND revoked = 1",
                params![name],
            )?,
        };
        if changed > 0 {
            info!(?ident, "re-enabled client key");
        } else {
            warn!(?ident, "enable matched no revoked key");
        }
        Ok(changed > 0)
    }

    /// All keys, newest first.
    pub fn list(&self) -> Result<Vec<ClientKey>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, api_key, name, created_at, revoked, revoked_at,
                    last_used_at, request_count
             FROM api_keys ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ClientKey {
                id: row.get(0)?,
                api_key: row.get(1)?,
                name: row.get(2)?,
                created_at: row.get(3)?,
                revoked: row.get::<_, i64>(4)? != 0,
                revoked_at: row.get(5)?,
                last_used_at: row.get(6)?,
                request_count: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Total / active / revoked counts.
    pub fn stats(&self) -> Result<KeyStats, StoreError> {
        let conn = self.conn.lock().unwrap();
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM api_keys", [], |r| r.get(0))?;
        let revoked: i64 =
            conn.query_row("SELECT COUNT(*) FROM api_keys WHERE revoked = 1", [], |r| r.get(0))?;
        Ok(KeyStats { total, active: total - revoked, revoked })
    }
}

fn verify_sync(conn: &Connection, api_key: &str) -> Result<bool, StoreError> {
    let row: Option<(i64, i64)> = conn
        .query_row(
            "SELECT id, revoked FROM api_keys WHERE api_key = ?1",
            params![api_key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let (id, revoked) = match row {
        Some(r) => r,
        None => {
            warn!(prefix = key_prefix(api_key), "unknown client key presented");
            return Ok(false);
        }
    };
    if revoked != 0 {
        warn!(prefix = key_prefix(api_key), "revoked client key presented");
        return Ok(false);
    }

    conn.execute(
        "UPDATE api_keys SET last_used_at = ?1, request_count = request_count + 1 WHERE id = ?2",
        params![Utc::now().to_rfc3339(), id],
    )?;
    Ok(true)
}

fn random_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("sk-{}", URL_SAFE_NO_PAD.encode(bytes))
}

/// First few characters of a key, safe for logs.
fn key_prefix(api_key: &str) -> &str {
    &api_key[..api_key.len().min(10)]
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, ClientKeyStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ClientKeyStore::open(&dir.path().join("keys.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn generated_keys_have_prefix_and_are_unique() {
        let (_dir, store) = temp_store();
        let a = store.generate("alice").unwrap();
        let b = store.generate("bob").unwrap();
        assert!(a.starts_with("sk-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn verify_accepts_issued_key_and_counts_usage() {
        let (_dir, store) = temp_store();
        let key = store.generate("client").unwrap();

        assert!(store.verify(&key).await.unwrap());
        assert!(store.verify(&key).await.unwrap());

        let rows = store.list().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].request_count, 2);
        assert!(rows[0].last_used_at.is_some());
    }

    #[tokio::test]
    async fn verify_rejects_unknown_key() {
        let (_dir, store) = temp_store();
        assert!(!store.verify("sk-never-issued").await.unwrap());
    }

    #[tokio::test]
    async fn revoked_key_fails_verify_until_enabled() {
        let (_dir, store) = temp_store();
        let key = store.generate("client").unwrap();

        assert!(store.revoke(&KeyIdent::Key(key.clone())).unwrap());
        assert!(!store.verify(&key).await.unwrap());

        assert!(store.enable(&KeyIdent::Key(key.clone())).unwrap());
        assert!(store.verify(&key).await.unwrap());
    }

    #[test]
    fn revoke_by_name_and_id() {
        let (_dir, store) = temp_store();
        store.generate("alpha").unwrap();
        store.generate("beta").unwrap();

        assert!(store.revoke(&KeyIdent::Name("alpha".into())).unwrap());
        // Second revoke of the same key reports false.
        assert!(!store.revoke(&KeyIdent::Name("alpha".into())).unwrap());

        let beta_id = store
            .list()
            .unwrap()
            .iter()
            .find(|k| k.name == "beta")
            .unwrap()
            .id;
        assert!(store.revoke(&KeyIdent::Id(beta_id)).unwrap());

        let stats = store.stats().unwrap();
        assert_eq!(stats, KeyStats { total: 2, active: 0, revoked: 2 });
    }

    #[test]
    fn enable_requires_a_revoked_key() {
        let (_dir, store) = temp_store();
        let key = store.generate("client").unwrap();
        assert!(!store.enable(&KeyIdent::Key(key)).unwrap(), "active key cannot be enabled");
    }

    #[test]
    fn stats_counts_split_by_revocation() {
        let (_dir, store) = temp_store();
        store.generate("a").unwrap();
        store.generate("b").unwrap();
        store.revoke(&KeyIdent::Name("a".into())).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.revoked, 1);
    }

    #[test]
    fn ident_parse_detects_kind() {
        assert_eq!(KeyIdent::parse("42"), KeyIdent::Id(42));
        assert_eq!(KeyIdent::parse("sk-abc"), KeyIdent::Key("sk-abc".into()));
        assert_eq!(KeyIdent::parse("laptop"), KeyIdent::Name("laptop".into()));
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("data/nested/keys.db");
        let store = ClientKeyStore::open(&nested).unwrap();
        store.generate("x").unwrap();
        assert!(nested.exists());
    }
}
