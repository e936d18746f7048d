//! # Pairlink - Latency-Aware Matchmaking and Routing Fabric
//!
//! Pairlink pairs two end users of a peer-to-peer chat product, selects the
//! relay that minimizes the *worse* of the two user-to-relay latencies,
//! brokers the handshake between the peers, and keeps re-evaluating the
//! choice — migrating live sessions when network conditions change. A
//! from-scratch TLS 1.2 record/handshake stack provides the hardened
//! transport between endpoints.
//!
//! ## Architecture
//!
//! A single directory process owns all shared state and exposes three
//! surfaces:
//!
//! - an HTTP control plane for registration, relay heartbeats and latency
//!   reports
//! - a long-lived TCP matchmaking stream that brokers one pairing per
//!   connection
//! - a background loop that re-optimizes live sessions every few seconds
//!
//! The directory is authoritative but non-durable: a restart drops every
//! binding and peers re-register lazily on their next interaction.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `directory` | Users↔addresses, relay liveness, latency tables, sessions |
//! | `selector` | Minimax relay choice over two latency tables |
//! | `matchmaking` | Per-connection pairing state machine |
//! | `migration` | Periodic re-optimization + live session migration |
//! | `api` | HTTP control plane (axum) |
//! | `tls` | TLS 1.2 record layer, PRF, key schedule, certificates |
//! | `handshake` | TLS 1.2 client/server handshake controllers |
//! | `config` | TOML configuration |

pub mod api;
pub mod config;
pub mod directory;
pub mod handshake;
pub mod matchmaking;
pub mod migration;
pub mod selector;
pub mod tls;

pub use config::Config;
pub use directory::{ChatSession, Directory, DirectoryError, InMemoryDirectory};
pub use matchmaking::MatchmakingServer;
pub use migration::MigrationLoop;
pub use selector::{optimal_relay, SelectorError};
pub use tls::{ConnectionEnd, TlsConnection, TlsError};
