//! Ticket file round trips and concurrent access

use std::sync::{Arc, Barrier};
use std::thread;

use p4rpc::rpc::tickets::ServerIdentity;
use p4rpc::rpc::{AuthStore, LockPolicy, TicketStore};
use tempfile::TempDir;

fn file_store(dir: &TempDir) -> TicketStore {
    TicketStore::new(AuthStore::file(dir.path().join("p4tickets"), LockPolicy::default()))
}

#[test]
fn test_ticket_round_trip_and_clear() {
    let temp = TempDir::new().unwrap();
    let store = file_store(&temp);

    store
        .save_ticket("alice", "perforce:1666", Some("ABCDEF0123"))
        .unwrap();
    assert_eq!(
        store.get_ticket("alice", "perforce:1666").unwrap().as_deref(),
        Some("ABCDEF0123")
    );

    // A bare port is stored under localhost.
    store.save_ticket("bob", "1666", Some("0011")).unwrap();
    assert_eq!(
        store.get_ticket("bob", "localhost:1666").unwrap().as_deref(),
        Some("0011")
    );

    store.save_ticket("alice", "perforce:1666", None).unwrap();
    assert_eq!(store.get_ticket("alice", "perforce:1666").unwrap(), None);
    assert_eq!(store.list_tickets().unwrap().len(), 1);
}

#[test]
fn test_blank_user_or_address_is_ignored() {
    let temp = TempDir::new().unwrap();
    let store = file_store(&temp);
    store.save_ticket("", "perforce:1666", Some("AB")).unwrap();
    store.save_ticket("alice", "  ", Some("AB")).unwrap();
    assert!(store.list_tickets().unwrap().is_empty());
    assert_eq!(store.get_ticket("", "perforce:1666").unwrap(), None);
}

#[test]
fn test_server_identity_prefers_server_id() {
    let temp = TempDir::new().unwrap();
    let store = file_store(&temp);
    let identity = ServerIdentity {
        host_port: "perforce:1666".to_string(),
        server_id: Some("edge-1".to_string()),
        cluster_id: None,
        case_insensitive: true,
    };

    store.save_for(&identity, "Alice", Some("C0FFEE")).unwrap();
    assert_eq!(
        store.load_for(&identity, "ALICE").unwrap().as_deref(),
        Some("C0FFEE")
    );
    assert_eq!(store.get_ticket("alice", "perforce:1666").unwrap(), None);

    // A stale address-keyed ticket is purged when the ticket is cleared.
    store.save_ticket("alice", "perforce:1666", Some("0BSOLETE")).unwrap();
    store.save_for(&identity, "alice", None).unwrap();
    assert!(store.list_tickets().unwrap().is_empty());
}

#[test]
fn test_concurrent_writers_then_readers() {
    const WRITERS: usize = 8;
    const READERS: usize = 4;

    let temp = TempDir::new().unwrap();
    let path = temp.path().join("p4tickets");
    let barrier = Arc::new(Barrier::new(WRITERS));

    let writers: Vec<_> = (0..WRITERS)
        .map(|i| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                // Each thread opens its own store so the file lock is what
                // serialises them.
                let store = TicketStore::new(AuthStore::file(path, LockPolicy::default()));
                barrier.wait();
                store
                    .save_ticket(&format!("user{i}"), "perforce:1666", Some(&format!("{i:04X}")))
                    .unwrap();
            })
        })
        .collect();
    for handle in writers {
        handle.join().unwrap();
    }

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let path = path.clone();
            thread::spawn(move || {
                let store = TicketStore::new(AuthStore::file(path, LockPolicy::default()));
                for i in 0..WRITERS {
                    let ticket = store.get_ticket(&format!("user{i}"), "perforce:1666").unwrap();
                    assert_eq!(ticket, Some(format!("{i:04X}")));
                }
                store.list_tickets().unwrap().len()
            })
        })
        .collect();
    for handle in readers {
        assert_eq!(handle.join().unwrap(), WRITERS);
    }
}
