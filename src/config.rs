//! Configuration loading for the directory process.
//!
//! Configuration is a TOML file (default: `pairlink.toml`); every field has
//! a default so an empty file, or no file at all, yields a runnable local
//! setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Root configuration for the directory process.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP control plane.
    #[serde(default)]
    pub http: HttpConfig,
    /// Matchmaking listener and peer dial-out ports.
    #[serde(default)]
    pub matchmaking: MatchmakingConfig,
    /// Relay liveness and session migration.
    #[serde(default)]
    pub relays: RelayConfig,
    /// Hardened-transport certificate material.
    #[serde(default)]
    pub tls: TlsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Bind address for the REST surface (default: 0.0.0.0:8080).
    #[serde(default = "default_http_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchmakingConfig {
    /// Bind address for the matchmaking stream listener (default: 0.0.0.0:8081).
    #[serde(default = "default_matchmaking_bind")]
    pub bind: String,
    /// Port peers accept chat requests on (default: 3001).
    #[serde(default = "default_chat_request_port")]
    pub chat_request_port: u16,
    /// Milliseconds between AWAITING_REQ heartbeats while the callee decides
    /// (default: 50). The heartbeat is a UI affordance for the requester.
    #[serde(default = "default_awaiting_heartbeat_ms")]
    pub awaiting_heartbeat_ms: u64,
    /// Rewrite the IPv6 loopback to `localhost` before dialing a callee.
    /// Local-testing convenience only; never applies to routable addresses
    /// (default: false).
    #[serde(default)]
    pub dev_loopback_rewrite: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Seconds a relay stays live after its last heartbeat (default: 10).
    #[serde(default = "default_relay_ttl_secs")]
    pub ttl_secs: u64,
    /// Seconds between session re-optimization ticks (default: 4).
    #[serde(default = "default_migration_tick_secs")]
    pub migration_tick_secs: u64,
    /// Port peers listen on for relay-switch notifications (default: 3003).
    #[serde(default = "default_migration_port")]
    pub migration_port: u16,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TlsConfig {
    /// PEM leaf certificate for the hardened matchmaking listener.
    pub cert_path: Option<PathBuf>,
    /// PKCS#8 RSA private key matching `cert_path`.
    pub key_path: Option<PathBuf>,
}

fn default_http_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_matchmaking_bind() -> String {
    "0.0.0.0:8081".to_string()
}

fn default_chat_request_port() -> u16 {
    3001
}

fn default_awaiting_heartbeat_ms() -> u64 {
    50
}

fn default_relay_ttl_secs() -> u64 {
    10
}

fn default_migration_tick_secs() -> u64 {
    4
}

fn default_migration_port() -> u16 {
    3003
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { bind: default_http_bind() }
    }
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            bind: default_matchmaking_bind(),
            chat_request_port: default_chat_request_port(),
            awaiting_heartbeat_ms: default_awaiting_heartbeat_ms(),
            dev_loopback_rewrite: false,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_relay_ttl_secs(),
            migration_tick_secs: default_migration_tick_secs(),
            migration_port: default_migration_port(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn relay_ttl(&self) -> Duration {
        Duration::from_secs(self.relays.ttl_secs)
    }

    pub fn migration_tick(&self) -> Duration {
        Duration::from_secs(self.relays.migration_tick_secs)
    }

    pub fn awaiting_heartbeat(&self) -> Duration {
        Duration::from_millis(self.matchmaking.awaiting_heartbeat_ms)
    }
}
