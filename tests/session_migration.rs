//! Integration test for the session migration loop: a deteriorating relay
//! gets the session moved, the room id survives, and both peers receive the
//! new relay address on their migration listeners.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

use pairlink::{ChatSession, Config, Directory, InMemoryDirectory, MigrationLoop};

const ALICE_IP: &str = "127.0.0.1";
const BOB_IP: &str = "127.0.0.2";

fn table(entries: &[(&str, f64)]) -> HashMap<String, f64> {
    entries.iter().map(|(r, d)| (r.to_string(), *d)).collect()
}

/// Read one ASCII payload to EOF from the next connection on `listener`.
async fn receive_notification(listener: TcpListener) -> String {
    let (mut conn, _) = listener.accept().await.unwrap();
    let mut payload = String::new();
    conn.read_to_string(&mut payload).await.unwrap();
    payload.trim().to_string()
}

#[tokio::test]
async fn migration_tick_moves_the_session_and_notifies_both_peers() {
    // Both peers listen on the same migration port, one loopback address
    // each — grab a free port first, then mirror it on 127.0.0.2.
    let alice_listener = TcpListener::bind((ALICE_IP, 0)).await.unwrap();
    let migration_port = alice_listener.local_addr().unwrap().port();
    let bob_listener = TcpListener::bind((BOB_IP, migration_port)).await.unwrap();

    let directory: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
    directory.register_user(ALICE_IP, "alice").unwrap();
    directory.register_user(BOB_IP, "bob").unwrap();
    directory.insert_session(ChatSession::new(
        "20260802120000-00112233445566778899aabbccddeeff".into(),
        "198.51.100.1".into(),
        ["alice".into(), "bob".into()],
    ));

    // The session sits on 198.51.100.1 and that relay just got worse for
    // alice: max drops from 200 to 20 by moving.
    directory.put_delays("alice", table(&[("198.51.100.1", 200.0), ("198.51.100.2", 20.0)]));
    directory.put_delays("bob", table(&[("198.51.100.1", 10.0), ("198.51.100.2", 20.0)]));

    let mut config = Config::default();
    config.relays.migration_port = migration_port;
    let migration = MigrationLoop::new(Arc::clone(&directory), &config);

    let alice_notified = tokio::spawn(receive_notification(alice_listener));
    let bob_notified = tokio::spawn(receive_notification(bob_listener));

    migration.tick_once().await;

    assert_eq!(alice_notified.await.unwrap(), "198.51.100.2");
    assert_eq!(bob_notified.await.unwrap(), "198.51.100.2");

    let sessions = directory.list_sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].room_id, "20260802120000-00112233445566778899aabbccddeeff");
    assert_eq!(sessions[0].relay, "198.51.100.2");
}

#[tokio::test]
async fn unnotifiable_peers_do_not_block_the_swap() {
    // No listeners at all: dials fail, the directory still moves the
    // session, and the peers catch up on their next reconnect.
    let directory: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
    directory.register_user(ALICE_IP, "alice").unwrap();
    directory.register_user(BOB_IP, "bob").unwrap();
    directory.insert_session(ChatSession::new(
        "room-1".into(),
        "198.51.100.1".into(),
        ["alice".into(), "bob".into()],
    ));
    directory.put_delays("alice", table(&[("198.51.100.1", 90.0), ("198.51.100.2", 5.0)]));
    directory.put_delays("bob", table(&[("198.51.100.1", 90.0), ("198.51.100.2", 5.0)]));

    let mut config = Config::default();
    config.relays.migration_port = 1; // nothing listens there
    MigrationLoop::new(Arc::clone(&directory), &config).tick_once().await;

    assert_eq!(directory.list_sessions()[0].relay, "198.51.100.2");
}
