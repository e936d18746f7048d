//! Matchmaking Session Protocol
//!
//! Per-connection state machine brokering exactly one pairing. Control
//! messages are LF-terminated ASCII lines over a plain byte stream:
//!
//! ```text
//! AWAIT_REQ_NAME ── read(name) ──► VALIDATE
//! VALIDATE ── requester unknown ──► "Unauthorized", close
//! VALIDATE ── callee empty/unknown/self ──► USER_NOT_FOUND, close
//! VALIDATE ── ok ──► ACK, dial callee:3001
//! DIAL_CALLEE ── ok ──► spawn forward task, REQ_SENT, wait
//! WAIT ── 50 ms without a decision ──► AWAITING_REQ, wait again
//! WAIT ── accepted ──► REQ_ACCEPTED, select relay
//! WAIT ── declined ──► USER_NOT_FOUND, close
//! MATCH ── selector fails ──► SERVER_ERROR on both streams, close
//! MATCH ── ok ──► "IP:<relay>\nRoomID:<room>" on both, record session, close
//! ```
//!
//! # Architecture
//!
//! Two tasks per pairing: the accept task drives the requester's stream and
//! owns the state machine; a forward task relays the request to the callee's
//! chat-request port and reports the decision through a one-slot rendezvous
//! channel. The wait state is a blocking receive with a timeout — each
//! expiry emits exactly one `AWAITING_REQ` heartbeat, a UI affordance for
//! the requester, not a correctness requirement.
//!
//! The requester is identified by the source address of the connection;
//! unbound addresses are rejected before the callee name is even read.
//!
//! # Hardened transport
//!
//! When the configuration carries a TLS certificate and key, every accepted
//! requester connection is upgraded with the server-side handshake from
//! [`crate::handshake`] before the protocol runs; each control message then
//! rides one application-data record instead of a bare line. The forward
//! stream to the callee's chat-request port stays plain either way.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::directory::{ChatSession, Directory};
use crate::selector::optimal_relay;
use crate::tls::{TlsConnection, TlsError};

// ============================================================================
// Control vocabulary (LF-terminated on the wire)
// ============================================================================

pub const ACK_CONN: &[u8] = b"ACK\n";
pub const MSG_REQ_SENT: &[u8] = b"REQ_SENT\n";
pub const AWAITING_REQ: &[u8] = b"AWAITING_REQ\n";
pub const USER_NOT_FOUND: &[u8] = b"USER_NOT_FOUND\n";
pub const REQ_ACCEPTED: &[u8] = b"REQ_ACCEPTED\n";
pub const SERVER_ERROR: &[u8] = b"SERVER_ERROR\n";
pub const UNAUTHORIZED: &[u8] = b"Unauthorized\n";
/// The callee's acceptance token, compared after trimming.
pub const ACCEPT_REQ: &str = "ACCEPT_REQ";

/// Decision relayed from the forward task. Acceptance carries the callee's
/// write half so the accept task can deliver the relay assignment (or a
/// server error) on the same stream.
enum CalleeDecision {
    Accepted { callee_writer: OwnedWriteHalf },
    Declined,
}

/// Requester-facing stream: plain TCP, or the hardened TLS transport where
/// one control message maps to one application-data record.
enum RequesterStream {
    Plain { reader: BufReader<OwnedReadHalf>, writer: OwnedWriteHalf },
    Tls(Box<TlsConnection<TcpStream>>),
}

impl RequesterStream {
    async fn read_message(&mut self) -> Result<String> {
        match self {
            RequesterStream::Plain { reader, .. } => Ok(read_trimmed_line(reader).await?),
            RequesterStream::Tls(conn) => {
                let data = conn.read_application_data().await?;
                Ok(String::from_utf8_lossy(&data).trim().to_string())
            }
        }
    }

    async fn write_message(&mut self, message: &[u8]) -> Result<()> {
        match self {
            RequesterStream::Plain { writer, .. } => Ok(writer.write_all(message).await?),
            RequesterStream::Tls(conn) => Ok(conn.write_application_data(message).await?),
        }
    }
}

// ============================================================================
// Room identifiers
// ============================================================================

/// `YYYYMMDDhhmmss-<32 hex chars>`; the random half comes from the CSPRNG,
/// making collisions over a process lifetime a non-concern.
pub fn generate_room_id() -> String {
    let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
    let mut random = [0u8; 16];
    // Room id generation failing means the CSPRNG is gone; nothing below
    // this layer can limp along without it.
    getrandom::getrandom(&mut random).expect("failed to generate cryptographically secure room id");
    format!("{}-{}", stamp, hex::encode(random))
}

// ============================================================================
// Server
// ============================================================================

/// The matchmaking listener. One instance per process, sharing the
/// directory with the control plane and the migration loop.
pub struct MatchmakingServer {
    directory: Arc<dyn Directory>,
    chat_request_port: u16,
    awaiting_heartbeat: Duration,
    dev_loopback_rewrite: bool,
    /// `(cert, key)` paths enabling the hardened transport. Certificate
    /// material is loaded at connection construction, per connection.
    tls: Option<(PathBuf, PathBuf)>,
}

impl MatchmakingServer {
    pub fn new(directory: Arc<dyn Directory>, config: &Config) -> Self {
        let tls = match (&config.tls.cert_path, &config.tls.key_path) {
            (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
            _ => None,
        };
        Self {
            directory,
            chat_request_port: config.matchmaking.chat_request_port,
            awaiting_heartbeat: config.awaiting_heartbeat(),
            dev_loopback_rewrite: config.matchmaking.dev_loopback_rewrite,
            tls,
        }
    }

    /// Accept loop. Each connection gets its own task; accept errors are
    /// logged and skipped.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr().context("matchmaking listener has no local addr")?;
        info!(addr = %local, hardened = self.tls.is_some(), "matchmaking server listening");

        loop {
            match listener.accept().await {
                Ok((conn, peer)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        let peer_ip = peer.ip().to_string();
                        let stream = match server.upgrade(conn).await {
                            Ok(stream) => stream,
                            Err(e) => {
                                warn!(peer = %peer_ip, error = %e, "hardened transport setup failed");
                                return;
                            }
                        };
                        if let Err(e) = server.handle_connection(stream, &peer_ip).await {
                            debug!(peer = %peer_ip, error = %e, "matchmaking connection ended");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "failed to accept matchmaking connection"),
            }
        }
    }

    /// Wrap a fresh connection for the protocol: a bare split in the plain
    /// deployment, a completed server-side handshake in the hardened one. A
    /// failed handshake drops the connection; no alert, no retry.
    async fn upgrade(&self, conn: TcpStream) -> std::result::Result<RequesterStream, TlsError> {
        match &self.tls {
            None => {
                let (read_half, writer) = conn.into_split();
                Ok(RequesterStream::Plain { reader: BufReader::new(read_half), writer })
            }
            Some((cert_path, key_path)) => {
                let mut tls = TlsConnection::server(conn, cert_path, key_path)?;
                tls.handshake().await?;
                Ok(RequesterStream::Tls(Box::new(tls)))
            }
        }
    }

    async fn handle_connection(&self, mut stream: RequesterStream, peer_ip: &str) -> Result<()> {
        // The source address is the requester's identity.
        let requester = match self.directory.lookup_by_addr(peer_ip) {
            Ok(name) => name,
            Err(_) => {
                warn!(peer = %peer_ip, "unregistered client attempted matchmaking");
                stream.write_message(UNAUTHORIZED).await?;
                return Ok(());
            }
        };
        debug!(peer = %peer_ip, requester = %requester, "matchmaking connection");

        let callee = stream.read_message().await?;
        if callee.is_empty() || callee == requester {
            stream.write_message(USER_NOT_FOUND).await?;
            return Ok(());
        }
        let callee_addr = match self.directory.lookup_by_name(&callee) {
            Ok(addr) => addr,
            Err(_) => {
                stream.write_message(USER_NOT_FOUND).await?;
                return Ok(());
            }
        };
        stream.write_message(ACK_CONN).await?;

        // Dial the callee's chat-request port. A dial failure closes the
        // requester's stream without a protocol line.
        let dial_host = self.dial_host(&callee_addr);
        let callee_conn =
            match TcpStream::connect((dial_host.as_str(), self.chat_request_port)).await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(callee = %callee, addr = %dial_host, error = %e, "failed to dial callee");
                    return Ok(());
                }
            };

        let (decision_tx, mut decision_rx) = mpsc::channel::<CalleeDecision>(1);
        tokio::spawn(forward_request(callee_conn, requester.clone(), decision_tx));
        stream.write_message(MSG_REQ_SENT).await?;

        // Blocking receive with a heartbeat: one AWAITING_REQ per expiry.
        let decision = loop {
            match timeout(self.awaiting_heartbeat, decision_rx.recv()).await {
                Ok(Some(decision)) => break decision,
                Ok(None) => break CalleeDecision::Declined,
                Err(_) => stream.write_message(AWAITING_REQ).await?,
            }
        };

        let mut callee_writer = match decision {
            CalleeDecision::Accepted { callee_writer } => callee_writer,
            CalleeDecision::Declined => {
                stream.write_message(USER_NOT_FOUND).await?;
                return Ok(());
            }
        };
        stream.write_message(REQ_ACCEPTED).await?;

        // Relay selection over both latency tables. Any miss is a server
        // error on both streams; no retry, no session recorded.
        let relay = match self.select_relay(&requester, &callee) {
            Some(relay) => relay,
            None => {
                stream.write_message(SERVER_ERROR).await?;
                let _ = callee_writer.write_all(SERVER_ERROR).await;
                return Ok(());
            }
        };

        let room_id = generate_room_id();
        let response = format!("IP:{}\nRoomID:{}\n", relay, room_id);
        stream.write_message(response.as_bytes()).await?;
        let _ = callee_writer.write_all(response.as_bytes()).await;

        // A fresh pairing supersedes anything either member was in.
        self.directory.remove_sessions_for_user(&requester);
        self.directory.remove_sessions_for_user(&callee);
        self.directory.insert_session(ChatSession::new(
            room_id.clone(),
            relay.clone(),
            [requester.clone(), callee.clone()],
        ));
        info!(room = %room_id, relay = %relay, a = %requester, b = %callee, "pairing committed");
        Ok(())
    }

    fn select_relay(&self, requester: &str, callee: &str) -> Option<String> {
        let first = self.directory.get_delays(requester).ok()?;
        let second = self.directory.get_delays(callee).ok()?;
        match optimal_relay(&first, &second) {
            Ok(relay) => Some(relay),
            Err(e) => {
                warn!(requester = %requester, callee = %callee, error = %e, "relay selection failed");
                None
            }
        }
    }

    /// Loopback convenience for local testing: the IPv6 loopback literal is
    /// rewritten to `localhost` when the dev flag is set. Routable
    /// addresses always pass through untouched.
    fn dial_host(&self, addr: &str) -> String {
        if self.dev_loopback_rewrite && addr == "::1" {
            "localhost".to_string()
        } else {
            addr.to_string()
        }
    }
}

/// Forward task: deliver the requester's name to the callee and translate
/// the one-line response into a decision. Any transport error is a decline.
async fn forward_request(
    callee_conn: TcpStream,
    requester: String,
    decision_tx: mpsc::Sender<CalleeDecision>,
) {
    let (read_half, mut callee_writer) = callee_conn.into_split();
    let mut reader = BufReader::new(read_half);

    if let Err(e) = callee_writer.write_all(format!("{}\n", requester).as_bytes()).await {
        debug!(error = %e, "failed to send request to callee");
        let _ = decision_tx.send(CalleeDecision::Declined).await;
        return;
    }

    let decision = match read_trimmed_line(&mut reader).await {
        Ok(response) if response == ACCEPT_REQ => CalleeDecision::Accepted { callee_writer },
        Ok(_) | Err(_) => CalleeDecision::Declined,
    };
    let _ = decision_tx.send(decision).await;
}

async fn read_trimmed_line(reader: &mut BufReader<OwnedReadHalf>) -> std::io::Result<String> {
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    Ok(line.trim().to_string())
}

// ============================================================================
// Tests
// ============================================================================
