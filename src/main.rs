// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod analyze;
mod cli;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use braid_config::Config;
use braid_keys::{ClientKeyStore, KeyIdent};
use braid_pool::CredentialPool;
use braid_proxy::{capture::CaptureSink, server, ProxySettings, ProxyState};
use cli::{Cli, Commands, KeyCommands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Serve { bind } => serve(&bind).await,
        Commands::Keys { command, db } => run_keys_command(&command, db),
        Commands::Analyze { dir } => {
            let dir = dir.unwrap_or_else(|| env_path("LOG_DIR", "./logs"));
            analyze::run(&dir)
        }
    }
}

// ── Serve ─────────────────────────────────────────────────────────────────────

async fn serve(bind: &str) -> anyhow::Result<()> {
    let config = Config::from_env().context("loading configuration from environment")?;
    anyhow::ensure!(
        !config.upstream_keys.is_empty(),
        "CEREBRAS_API_KEYS must be a non-empty JSON object of {{name: secret}} pairs"
    );

    let pool = Arc::new(CredentialPool::new(
        config
            .upstream_keys
            .iter()
            .map(|k| (k.name.clone(), k.secret.clone()))
            .collect(),
        config.cooldown,
    ));

    let keys = if config.enable_incoming_auth {
        info!(db = %config.incoming_key_db.display(), "inbound authentication enabled");
        Some(
            ClientKeyStore::open(&config.incoming_key_db)
                .context("opening client key store")?,
        )
    } else {
        info!("inbound authentication disabled (set ENABLE_INCOMING_AUTH=true to enable)");
        None
    };

    let capture = if config.log_requests {
        info!(dir = %config.log_dir.display(), "request capture enabled");
        Some(CaptureSink::new(config.log_dir.clone()).context("creating capture directory")?)
    } else {
        None
    };

    if config.synthetic_api_key.is_some() {
        info!("rescue upstream A configured (oversize/vision/overflow requests)");
    }
    if config.zai_api_key.is_some() {
        info!("rescue upstream B configured");
    }
    if config.fallback_on_cooldown && !config.any_rescue_configured() {
        warn!("FALLBACK_ON_COOLDOWN is set but no rescue upstream is configured");
    }

    let state = ProxyState::new(ProxySettings::from_config(&config), pool, keys, capture)?;
    server::serve(state, bind).await
}

// ── Key administration ────────────────────────────────────────────────────────

fn run_keys_command(command: &KeyCommands, db: Option<PathBuf>) -> anyhow::Result<()> {
    let db = db.unwrap_or_else(|| env_path("INCOMING_KEY_DB", "./data/incoming_keys.db"));
    let store = ClientKeyStore::open(&db).context("opening client key store")?;

    match command {
        KeyCommands::Add { name } => {
            let key = store.generate(name)?;
            println!();
            println!("API key created");
            println!("  Name: {name}");
            println!("  Key:  {key}");
            println!();
            println!("Store this key securely - it won't be shown again.");
        }
        KeyCommands::List => {
            let keys = store.list()?;
            if keys.is_empty() {
                println!("No API keys found.");
                return Ok(());
            }
            println!(
                "{:<4} {:<20} {:<48} {:<8} {:>8}  {}",
                "ID", "Name", "Key", "Status", "Requests", "Last used"
            );
            for key in &keys {
                let status = if key.revoked { "REVOKED" } else { "ACTIVE" };
                println!(
                    "{:<4} {:<20} {:<48} {:<8} {:>8}  {}",
                    key.id,
                    key.name,
                    truncated(&key.api_key, 45),
                    status,
                    key.request_count,
                    key.last_used_at.as_deref().unwrap_or("never"),
                );
            }
            let stats = store.stats()?;
            println!();
            println!(
                "Total: {} | Active: {} | Revoked: {}",
                stats.total, stats.active, stats.revoked
            );
        }
        KeyCommands::Revoke { identifier } => {
            let ident = KeyIdent::parse(identifier);
            anyhow::ensure!(
                store.revoke(&ident)?,
                "no active key matches {identifier:?}"
            );
            println!("Revoked {identifier}");
        }
        KeyCommands::Enable { identifier } => {
            let ident = KeyIdent::parse(identifier);
            anyhow::ensure!(
                store.enable(&ident)?,
                "no revoked key matches {identifier:?}"
            );
            println!("Re-enabled {identifier}");
        }
        KeyCommands::Stats => {
            let stats = store.stats()?;
            println!("Total keys:   {}", stats.total);
            println!("Active keys:  {}", stats.active);
            println!("Revoked keys: {}", stats.revoked);
        }
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn env_path(var: &str, default: &str) -> PathBuf {
    std::env::var(var)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

fn truncated(s: &str, max: usize) -> String {
    if s.len() > max {
        format!("{}...", &s[..max])
    } else {
        s.to_string()
    }
}

fn init_logging(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbosity {
        0 => EnvFilter::new("info"),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
