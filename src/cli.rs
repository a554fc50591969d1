// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "braid",
    about = "Authenticating reverse proxy for Cerebras-compatible chat APIs",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG overrides
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the proxy.
    ///
    /// Reads its configuration from the environment: CEREBRAS_API_KEYS
    /// (required), CEREBRAS_API_BASE, CEREBRAS_COOLDOWN, SYNTHETIC_API_KEY,
    /// ZAI_API_KEY, ENABLE_INCOMING_AUTH, INCOMING_KEY_DB,
    /// FALLBACK_ON_COOLDOWN, LOG_REQUESTS, LOG_DIR.
    Serve {
        /// host:port to listen on.
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,
    },

    /// Manage client API keys for inbound authentication.
    Keys {
        #[command(subcommand)]
        command: KeyCommands,

        /// Path to the key database (default: INCOMING_KEY_DB or
        /// ./data/incoming_keys.db).
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Estimate the chars-per-token ratio from capture logs.
    ///
    /// Scans primary-upstream chat completion captures (rescue captures are
    /// skipped) and compares prompt character counts against the
    /// prompt_tokens the upstream reported. Used to calibrate the oversize
    /// routing threshold.
    Analyze {
        /// Capture directory (default: LOG_DIR or ./logs).
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum KeyCommands {
    /// Issue a new key. The key value is printed once — store it securely.
    Add {
        /// Descriptive name for the key holder.
        name: String,
    },

    /// List all keys, newest first.
    List,

    /// Revoke a key by id, name, or the key value itself.
    Revoke {
        /// Numeric id, `sk-…` key value, or name.
        identifier: String,
    },

    /// Re-enable a revoked key by id, name, or the key value itself.
    Enable {
        /// Numeric id, `sk-…` key value, or name.
        identifier: String,
    },

    /// Show aggregate key counts.
    Stats,
}
