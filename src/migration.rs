//! Session Migration Loop
//!
//! Background re-optimization of live pairings. Every tick the loop takes a
//! snapshot of recorded sessions, re-runs the relay selector over each
//! pair's current latency tables and, when a better relay exists, swaps the
//! session's relay in the directory and tells both peers to move.
//!
//! Peers learn about the move over a transient stream to their
//! migration-listen port: the new relay's address in ASCII, then close.
//! Notification is best effort — the directory is updated first, so a peer
//! that misses the push catches up on its next reconnect or is evicted by
//! the relay's join protocol.
//!
//! The snapshot is taken under the directory's read lock and released before
//! any dialing happens; the loop never holds the lock across I/O.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::directory::{ChatSession, Directory};
use crate::selector::optimal_relay;

/// The periodic re-optimization task. One long-lived instance per process.
pub struct MigrationLoop {
    directory: Arc<dyn Directory>,
    migration_port: u16,
    tick: Duration,
}

impl MigrationLoop {
    pub fn new(directory: Arc<dyn Directory>, config: &Config) -> Self {
        Self {
            directory,
            migration_port: config.relays.migration_port,
            tick: config.migration_tick(),
        }
    }

    /// Tick forever. The first tick fires after one full interval.
    pub async fn run(self) {
        info!(interval = ?self.tick, "session migration loop started");
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await; // completes immediately; skip it
        loop {
            interval.tick().await;
            self.tick_once().await;
        }
    }

    /// One re-optimization pass over a snapshot of the session table.
    pub async fn tick_once(&self) {
        for session in self.directory.list_sessions() {
            self.reoptimize(&session).await;
        }
    }

    async fn reoptimize(&self, session: &ChatSession) {
        let [user_a, user_b] = &session.members;

        let (delays_a, delays_b) =
            match (self.directory.get_delays(user_a), self.directory.get_delays(user_b)) {
                (Ok(a), Ok(b)) => (a, b),
                _ => {
                    debug!(room = %session.room_id, "skipping session without both delay tables");
                    return;
                }
            };

        let best = match optimal_relay(&delays_a, &delays_b) {
            Ok(relay) => relay,
            Err(e) => {
                debug!(room = %session.room_id, error = %e, "skipping session");
                return;
            }
        };
        if best == session.relay {
            return;
        }

        // Swap first. A session that vanished since the snapshot (member
        // disconnected, re-matched) is simply no longer ours to move.
        if self.directory.update_session_relay(&session.room_id, &best).is_err() {
            debug!(room = %session.room_id, "session disappeared during migration");
            return;
        }
        info!(
            room = %session.room_id,
            from = %session.relay,
            to = %best,
            "migrating session to better relay"
        );

        for user in &session.members {
            if let Err(e) = self.notify_peer(user, &best).await {
                warn!(user = %user, relay = %best, error = %e, "failed to notify peer of migration");
            }
        }
    }

    /// Push the new relay address to one peer's migration listener.
    async fn notify_peer(&self, user: &str, relay: &str) -> anyhow::Result<()> {
        let addr = self.directory.lookup_by_name(user)?;
        let mut conn = TcpStream::connect((addr.as_str(), self.migration_port)).await?;
        conn.write_all(relay.as_bytes()).await?;
        conn.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryDirectory;
    use std::collections::HashMap;

    fn table(entries: &[(&str, f64)]) -> HashMap<String, f64> {
        entries.iter().map(|(r, d)| (r.to_string(), *d)).collect()
    }

    fn loop_with(directory: Arc<dyn Directory>) -> MigrationLoop {
        // Unroutable port: notification failures must not affect the swap.
        let mut config = Config::default();
        config.relays.migration_port = 1;
        MigrationLoop::new(directory, &config)
    }

    #[tokio::test]
    async fn tick_moves_session_to_better_relay_and_keeps_room_id() {
        let directory: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        // Loopback members so the doomed notification dials fail fast.
        directory.register_user("127.0.0.1", "alice").unwrap();
        directory.register_user("127.0.0.2", "bob").unwrap();
        directory.insert_session(ChatSession::new(
            "room-1".into(),
            "R1".into(),
            ["alice".into(), "bob".into()],
        ));
        directory.put_delays("alice", table(&[("R1", 200.0), ("R2", 20.0)]));
        directory.put_delays("bob", table(&[("R1", 10.0), ("R2", 20.0)]));

        loop_with(Arc::clone(&directory)).tick_once().await;

        let sessions = directory.list_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].room_id, "room-1");
        assert_eq!(sessions[0].relay, "R2");
        assert_eq!(sessions[0].members, ["alice".to_string(), "bob".to_string()]);
    }

    #[tokio::test]
    async fn tick_leaves_optimal_session_alone() {
        let directory: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        directory.insert_session(ChatSession::new(
            "room-1".into(),
            "R1".into(),
            ["alice".into(), "bob".into()],
        ));
        directory.put_delays("alice", table(&[("R1", 10.0), ("R2", 80.0)]));
        directory.put_delays("bob", table(&[("R1", 70.0), ("R2", 20.0)]));

        loop_with(Arc::clone(&directory)).tick_once().await;
        assert_eq!(directory.list_sessions()[0].relay, "R1");
    }

    #[tokio::test]
    async fn sessions_without_delay_tables_are_skipped() {
        let directory: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        directory.insert_session(ChatSession::new(
            "room-1".into(),
            "R1".into(),
            ["alice".into(), "bob".into()],
        ));
        directory.put_delays("alice", table(&[("R2", 1.0)]));
        // bob never reported; alice alone can't move the session.

        loop_with(Arc::clone(&directory)).tick_once().await;
        assert_eq!(directory.list_sessions()[0].relay, "R1");
    }

    #[tokio::test]
    async fn disjoint_tables_leave_session_in_place() {
        let directory: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        directory.insert_session(ChatSession::new(
            "room-1".into(),
            "R1".into(),
            ["alice".into(), "bob".into()],
        ));
        directory.put_delays("alice", table(&[("R2", 1.0)]));
        directory.put_delays("bob", table(&[("R3", 1.0)]));

        loop_with(Arc::clone(&directory)).tick_once().await;
        assert_eq!(directory.list_sessions()[0].relay, "R1");
    }
}
