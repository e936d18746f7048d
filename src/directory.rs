//! Directory Store
//!
//! Process-wide registry backing the matchmaking fabric:
//!
//! - **User bindings**: address ↔ username, both unique at every instant
//! - **Relay liveness**: last-heartbeat timestamps with a pull-time TTL check
//! - **Latency tables**: per-user `relay → delay (ms)` snapshots
//! - **Chat sessions**: `(room, relay, members)` records owned exclusively here
//!
//! The directory is the only shared mutable state in the process (together
//! with the latency tables it also holds). It is deliberately non-durable:
//! a restart drops every binding and peers re-register lazily.
//!
//! # Locking
//!
//! One `RwLock` over the whole store. Readers (`lookup_*`, `list_*`,
//! `get_delays`) take the read lock; every mutation takes the write lock.
//! No I/O ever happens under the lock, and `list_sessions` hands out an
//! owned snapshot so callers iterate without holding it.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tracing::debug;

/// Relays whose last heartbeat is older than this are invisible to reads.
pub const DEFAULT_RELAY_TTL: Duration = Duration::from_secs(10);

// ============================================================================
// Errors
// ============================================================================

/// Error type for directory lookups and mutations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// The username is already bound to a different address.
    NameTaken { name: String, addr: String },
    /// No user binding for the given address.
    AddrNotFound(String),
    /// No user binding for the given username.
    NameNotFound(String),
    /// No latency table has been reported for the user.
    DelaysNotFound(String),
    /// No relay registered under the given address.
    RelayNotFound(String),
    /// No session recorded under the given room id.
    SessionNotFound(String),
}

impl std::fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryError::NameTaken { name, addr } => {
                write!(f, "username {} is already associated with IP {}", name, addr)
            }
            DirectoryError::AddrNotFound(addr) => write!(f, "IP {} not found", addr),
            DirectoryError::NameNotFound(name) => write!(f, "username {} not found", name),
            DirectoryError::DelaysNotFound(name) => {
                write!(f, "delays for username {} not found", name)
            }
            DirectoryError::RelayNotFound(addr) => write!(f, "IP {} not found", addr),
            DirectoryError::SessionNotFound(room) => {
                write!(f, "chat session with room id {} not found", room)
            }
        }
    }
}

impl std::error::Error for DirectoryError {}

// ============================================================================
// Session record
// ============================================================================

/// One active chat pairing. Members are stored by username, never by
/// reference, so no ownership cycle with the user table arises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSession {
    /// `YYYYMMDDhhmmss-<32 hex>` — globally unique for the process lifetime.
    pub room_id: String,
    /// Address of the relay currently carrying the room.
    pub relay: String,
    /// The two paired usernames.
    pub members: [String; 2],
    pub active: bool,
}

impl ChatSession {
    pub fn new(room_id: String, relay: String, members: [String; 2]) -> Self {
        Self { room_id, relay, members, active: true }
    }

    pub fn has_member(&self, user: &str) -> bool {
        self.members.iter().any(|m| m == user)
    }
}

// ============================================================================
// Directory capability set
// ============================================================================

/// The directory's narrow operation set. One in-memory implementation ships;
/// the trait is the seam the matchmaking protocol, the control plane and the
/// migration loop are written against.
pub trait Directory: Send + Sync {
    /// Bind `name` to `addr`. Fails with [`DirectoryError::NameTaken`] when
    /// the username is already bound elsewhere; re-registering the same pair
    /// is idempotent, and an address may rebind itself to a new name.
    fn register_user(&self, addr: &str, name: &str) -> Result<(), DirectoryError>;
    fn lookup_by_addr(&self, addr: &str) -> Result<String, DirectoryError>;
    fn lookup_by_name(&self, name: &str) -> Result<String, DirectoryError>;
    /// Remove the binding for `addr`, returning the released username.
    /// Sessions mentioning that user are dropped with it.
    fn remove_by_addr(&self, addr: &str) -> Result<String, DirectoryError>;

    /// Replace the user's latency table wholesale. Values are trusted
    /// verbatim; unreachable relays carry `f64::INFINITY`.
    fn put_delays(&self, user: &str, delays: HashMap<String, f64>);
    fn get_delays(&self, user: &str) -> Result<HashMap<String, f64>, DirectoryError>;

    /// Register a relay or refresh its heartbeat.
    fn upsert_relay_heartbeat(&self, addr: &str);
    /// Refresh an already-registered relay. Fails when the relay is unknown.
    fn refresh_relay_heartbeat(&self, addr: &str) -> Result<(), DirectoryError>;
    /// Addresses of relays whose heartbeat is within the TTL, unordered.
    fn list_live_relays(&self) -> Vec<String>;
    /// Remove a relay outright, together with sessions recorded against it.
    fn remove_relay(&self, addr: &str) -> Result<(), DirectoryError>;

    fn insert_session(&self, session: ChatSession);
    fn remove_session(&self, room_id: &str) -> Result<(), DirectoryError>;
    /// Drop every session carried by `relay`; returns the affected room ids.
    fn remove_sessions_for_relay(&self, relay: &str) -> Vec<String>;
    /// Drop every session mentioning `user`; returns the affected room ids.
    fn remove_sessions_for_user(&self, user: &str) -> Vec<String>;
    /// Point an existing session at a new relay, preserving room id and
    /// members. This is the migration swap, serialized as one mutation.
    fn update_session_relay(&self, room_id: &str, relay: &str) -> Result<(), DirectoryError>;
    /// Owned snapshot of every recorded session.
    fn list_sessions(&self) -> Vec<ChatSession>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Default)]
struct DirectoryState {
    /// address → username. The inverse mapping is scanned on demand; the
    /// table is small (one entry per online user).
    users: HashMap<String, String>,
    /// relay address → last heartbeat.
    relays: HashMap<String, Instant>,
    /// username → (relay address → measured delay, ms).
    delays: HashMap<String, HashMap<String, f64>>,
    sessions: Vec<ChatSession>,
}

/// Thread-safe in-memory [`Directory`]. Constructed once at process start
/// and shared by handle.
pub struct InMemoryDirectory {
    state: RwLock<DirectoryState>,
    relay_ttl: Duration,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::with_relay_ttl(DEFAULT_RELAY_TTL)
    }

    /// TTL override used by the control plane (config-driven) and by tests,
    /// which shrink the window instead of sleeping through the real one.
    pub fn with_relay_ttl(relay_ttl: Duration) -> Self {
        Self { state: RwLock::new(DirectoryState::default()), relay_ttl }
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl Directory for InMemoryDirectory {
    fn register_user(&self, addr: &str, name: &str) -> Result<(), DirectoryError> {
        let mut state = self.state.write().expect("directory lock poisoned");

        if let Some((existing_addr, _)) =
            state.users.iter().find(|(a, n)| n.as_str() == name && a.as_str() != addr)
        {
            return Err(DirectoryError::NameTaken {
                name: name.to_string(),
                addr: existing_addr.clone(),
            });
        }

        state.users.insert(addr.to_string(), name.to_string());
        debug!(addr, name, "registered user");
        Ok(())
    }

    fn lookup_by_addr(&self, addr: &str) -> Result<String, DirectoryError> {
        let state = self.state.read().expect("directory lock poisoned");
        state
            .users
            .get(addr)
            .cloned()
            .ok_or_else(|| DirectoryError::AddrNotFound(addr.to_string()))
    }

    fn lookup_by_name(&self, name: &str) -> Result<String, DirectoryError> {
        let state = self.state.read().expect("directory lock poisoned");
        state
            .users
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(a, _)| a.clone())
            .ok_or_else(|| DirectoryError::NameNotFound(name.to_string()))
    }

    fn remove_by_addr(&self, addr: &str) -> Result<String, DirectoryError> {
        let mut state = self.state.write().expect("directory lock poisoned");
        let name = state
            .users
            .remove(addr)
            .ok_or_else(|| DirectoryError::AddrNotFound(addr.to_string()))?;
        state.delays.remove(&name);
        state.sessions.retain(|s| !s.has_member(&name));
        debug!(addr, name, "removed user");
        Ok(name)
    }

    fn put_delays(&self, user: &str, delays: HashMap<String, f64>) {
        let mut state = self.state.write().expect("directory lock poisoned");
        state.delays.insert(user.to_string(), delays);
    }

    fn get_delays(&self, user: &str) -> Result<HashMap<String, f64>, DirectoryError> {
        let state = self.state.read().expect("directory lock poisoned");
        state
            .delays
            .get(user)
            .cloned()
            .ok_or_else(|| DirectoryError::DelaysNotFound(user.to_string()))
    }

    fn upsert_relay_heartbeat(&self, addr: &str) {
        let mut state = self.state.write().expect("directory lock poisoned");
        state.relays.insert(addr.to_string(), Instant::now());
    }

    fn refresh_relay_heartbeat(&self, addr: &str) -> Result<(), DirectoryError> {
        let mut state = self.state.write().expect("directory lock poisoned");
        match state.relays.get_mut(addr) {
            Some(beat) => {
                *beat = Instant::now();
                Ok(())
            }
            None => Err(DirectoryError::RelayNotFound(addr.to_string())),
        }
    }

    fn list_live_relays(&self) -> Vec<String> {
        let state = self.state.read().expect("directory lock poisoned");
        let now = Instant::now();
        state
            .relays
            .iter()
            .filter(|(_, beat)| now.duration_since(**beat) <= self.relay_ttl)
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    fn remove_relay(&self, addr: &str) -> Result<(), DirectoryError> {
        let mut state = self.state.write().expect("directory lock poisoned");
        state
            .relays
            .remove(addr)
            .ok_or_else(|| DirectoryError::RelayNotFound(addr.to_string()))?;
        state.sessions.retain(|s| s.relay != addr);
        debug!(addr, "removed relay");
        Ok(())
    }

    fn insert_session(&self, session: ChatSession) {
        let mut state = self.state.write().expect("directory lock poisoned");
        debug!(room = %session.room_id, relay = %session.relay, "recorded session");
        state.sessions.push(session);
    }

    fn remove_session(&self, room_id: &str) -> Result<(), DirectoryError> {
        let mut state = self.state.write().expect("directory lock poisoned");
        let before = state.sessions.len();
        state.sessions.retain(|s| s.room_id != room_id);
        if state.sessions.len() == before {
            return Err(DirectoryError::SessionNotFound(room_id.to_string()));
        }
        Ok(())
    }

    fn remove_sessions_for_relay(&self, relay: &str) -> Vec<String> {
        let mut state = self.state.write().expect("directory lock poisoned");
        let (dropped, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut state.sessions).into_iter().partition(|s| s.relay == relay);
        state.sessions = kept;
        dropped.into_iter().map(|s| s.room_id).collect()
    }

    fn remove_sessions_for_user(&self, user: &str) -> Vec<String> {
        let mut state = self.state.write().expect("directory lock poisoned");
        let (dropped, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut state.sessions).into_iter().partition(|s| s.has_member(user));
        state.sessions = kept;
        dropped.into_iter().map(|s| s.room_id).collect()
    }

    fn update_session_relay(&self, room_id: &str, relay: &str) -> Result<(), DirectoryError> {
        let mut state = self.state.write().expect("directory lock poisoned");
        let session = state
            .sessions
            .iter_mut()
            .find(|s| s.room_id == room_id)
            .ok_or_else(|| DirectoryError::SessionNotFound(room_id.to_string()))?;
        session.relay = relay.to_string();
        Ok(())
    }

    fn list_sessions(&self) -> Vec<ChatSession> {
        let state = self.state.read().expect("directory lock poisoned");
        state.sessions.clone()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn session(room: &str, relay: &str, a: &str, b: &str) -> ChatSession {
        ChatSession::new(room.to_string(), relay.to_string(), [a.to_string(), b.to_string()])
    }

    #[test]
    fn register_and_lookup_both_directions() {
        let dir = InMemoryDirectory::new();
        dir.register_user("10.0.0.1", "alice").unwrap();

        assert_eq!(dir.lookup_by_addr("10.0.0.1").unwrap(), "alice");
        assert_eq!(dir.lookup_by_name("alice").unwrap(), "10.0.0.1");
    }

    #[test]
    fn name_taken_by_other_address_is_rejected() {
        let dir = InMemoryDirectory::new();
        dir.register_user("10.0.0.1", "alice").unwrap();

        let err = dir.register_user("10.0.0.2", "alice").unwrap_err();
        assert_eq!(
            err,
            DirectoryError::NameTaken { name: "alice".into(), addr: "10.0.0.1".into() }
        );
        assert_eq!(
            err.to_string(),
            "username alice is already associated with IP 10.0.0.1"
        );
    }

    #[test]
    fn reregistration_from_same_address_is_idempotent() {
        let dir = InMemoryDirectory::new();
        dir.register_user("10.0.0.1", "alice").unwrap();
        dir.register_user("10.0.0.1", "alice").unwrap();
        assert_eq!(dir.lookup_by_name("alice").unwrap(), "10.0.0.1");
    }

    #[test]
    fn address_may_rebind_to_new_name() {
        let dir = InMemoryDirectory::new();
        dir.register_user("10.0.0.1", "alice").unwrap();
        dir.register_user("10.0.0.1", "alicia").unwrap();

        assert_eq!(dir.lookup_by_addr("10.0.0.1").unwrap(), "alicia");
        assert!(dir.lookup_by_name("alice").is_err());
    }

    #[test]
    fn remove_by_addr_releases_name_and_sessions() {
        let dir = InMemoryDirectory::new();
        dir.register_user("10.0.0.1", "alice").unwrap();
        dir.register_user("10.0.0.2", "bob").unwrap();
        dir.insert_session(session("r1", "relay-1", "alice", "bob"));

        assert_eq!(dir.remove_by_addr("10.0.0.1").unwrap(), "alice");
        assert!(dir.lookup_by_name("alice").is_err());
        assert!(dir.list_sessions().is_empty());

        // The released name is free for someone else.
        dir.register_user("10.0.0.3", "alice").unwrap();
    }

    #[test]
    fn delays_replaced_wholesale() {
        let dir = InMemoryDirectory::new();
        assert!(matches!(dir.get_delays("alice"), Err(DirectoryError::DelaysNotFound(_))));

        dir.put_delays("alice", HashMap::from([("r1".into(), 10.0), ("r2".into(), 80.0)]));
        dir.put_delays("alice", HashMap::from([("r3".into(), 5.0)]));

        let table = dir.get_delays("alice").unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table["r3"], 5.0);
    }

    #[test]
    fn stale_relays_filtered_at_read_time() {
        let dir = InMemoryDirectory::with_relay_ttl(Duration::from_millis(40));
        dir.upsert_relay_heartbeat("relay-1");
        dir.upsert_relay_heartbeat("relay-2");
        assert_eq!(dir.list_live_relays().len(), 2);

        std::thread::sleep(Duration::from_millis(60));
        dir.upsert_relay_heartbeat("relay-2");

        assert_eq!(dir.list_live_relays(), vec!["relay-2".to_string()]);
    }

    #[test]
    fn refresh_requires_existing_relay() {
        let dir = InMemoryDirectory::new();
        assert!(matches!(
            dir.refresh_relay_heartbeat("relay-1"),
            Err(DirectoryError::RelayNotFound(_))
        ));

        dir.upsert_relay_heartbeat("relay-1");
        dir.refresh_relay_heartbeat("relay-1").unwrap();
    }

    #[test]
    fn remove_relay_drops_its_sessions() {
        let dir = InMemoryDirectory::new();
        dir.upsert_relay_heartbeat("relay-1");
        dir.insert_session(session("r1", "relay-1", "alice", "bob"));
        dir.insert_session(session("r2", "relay-2", "carol", "dave"));

        dir.remove_relay("relay-1").unwrap();
        let left = dir.list_sessions();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].room_id, "r2");
    }

    #[test]
    fn session_swap_preserves_room_and_members() {
        let dir = InMemoryDirectory::new();
        dir.insert_session(session("r1", "relay-1", "alice", "bob"));

        dir.update_session_relay("r1", "relay-2").unwrap();
        let sessions = dir.list_sessions();
        assert_eq!(sessions[0].room_id, "r1");
        assert_eq!(sessions[0].relay, "relay-2");
        assert_eq!(sessions[0].members, ["alice".to_string(), "bob".to_string()]);

        assert!(matches!(
            dir.update_session_relay("nope", "relay-2"),
            Err(DirectoryError::SessionNotFound(_))
        ));
    }

    #[test]
    fn remove_sessions_for_user_returns_every_match() {
        let dir = InMemoryDirectory::new();
        dir.insert_session(session("r1", "relay-1", "alice", "bob"));
        dir.insert_session(session("r2", "relay-1", "alice", "carol"));
        dir.insert_session(session("r3", "relay-1", "dave", "erin"));

        let mut dropped = dir.remove_sessions_for_user("alice");
        dropped.sort();
        assert_eq!(dropped, vec!["r1".to_string(), "r2".to_string()]);
        assert_eq!(dir.list_sessions().len(), 1);
    }

    #[test]
    fn snapshot_is_detached_from_the_store() {
        let dir = InMemoryDirectory::new();
        dir.insert_session(session("r1", "relay-1", "alice", "bob"));

        let snapshot = dir.list_sessions();
        dir.remove_session("r1").unwrap();

        assert_eq!(snapshot.len(), 1);
        assert!(dir.list_sessions().is_empty());
    }
}
