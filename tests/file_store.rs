//! Durability tests for the transport over the file store.

use capped_transport::{
    Capacity, FileStore, FileStoreConfig, LogStore, Outcome, Sequence, Status,
    SubscriptionConfig, Transport, TransportConfig,
};
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_millis(100);

fn open_transport(dir: &TempDir, capacity: Capacity) -> Transport<FileStore> {
    let store = FileStore::open_or_create(FileStoreConfig {
        path: dir.path().join("store"),
        sync_every: 1,
        ..Default::default()
    })
    .unwrap();

    Transport::open(
        store,
        TransportConfig {
            name: "durable".to_string(),
            capacity,
            ..Default::default()
        },
    )
    .unwrap()
}

#[test]
fn test_messages_survive_restart() {
    let dir = TempDir::new().unwrap();

    {
        let transport = open_transport(&dir, Capacity::default());
        for i in 1..=3 {
            transport.publish("t", &json!({ "i": i })).unwrap();
        }
    }

    let transport = open_transport(&dir, Capacity::default());
    let stats = transport.stats().unwrap();
    assert_eq!(stats.entries, 3);
    assert_eq!(stats.last_sequence, Sequence(3));

    let mut sub = transport
        .subscribe_with("t", &SubscriptionConfig::earliest())
        .unwrap();
    for i in 1..=3 {
        let msg = sub.recv_timeout(WAIT).unwrap().unwrap();
        assert_eq!(msg.decode::<serde_json::Value>().unwrap(), json!({ "i": i }));
    }

    // Numbering continues where it left off.
    let next = transport.publish("t", &json!({"i": 4})).unwrap();
    assert_eq!(next.sequence, Sequence(4));
}

#[test]
fn test_claims_are_not_redelivered_after_restart() {
    let dir = TempDir::new().unwrap();

    {
        let transport = open_transport(&dir, Capacity::default());
        let mut sub = transport.subscribe("t").unwrap();
        for i in 1..=4 {
            transport.publish("t", &json!({ "i": i })).unwrap();
        }

        let first = sub.recv_timeout(WAIT).unwrap().unwrap();
        let second = sub.recv_timeout(WAIT).unwrap().unwrap();
        assert!(transport.acknowledge(first.sequence, Outcome::Success).unwrap());
        assert_eq!(second.sequence, Sequence(2));
    }

    let transport = open_transport(&dir, Capacity::default());
    assert_eq!(
        transport.get(Sequence(1)).unwrap().unwrap().status,
        Status::Success
    );
    assert_eq!(
        transport.get(Sequence(2)).unwrap().unwrap().status,
        Status::Processed
    );

    let mut sub = transport
        .subscribe_with("t", &SubscriptionConfig::earliest())
        .unwrap();
    let delivered: Vec<Sequence> = (0..2)
        .map(|_| sub.recv_timeout(WAIT).unwrap().unwrap().sequence)
        .collect();
    assert_eq!(delivered, vec![Sequence(3), Sequence(4)]);
    assert!(sub.recv_timeout(WAIT).unwrap().is_none());
}

#[test]
fn test_capacity_enforced_across_restart() {
    let dir = TempDir::new().unwrap();
    let capacity = Capacity::new(1024 * 1024, Some(5));

    {
        let transport = open_transport(&dir, capacity);
        for i in 0..12 {
            transport.publish("t", &json!({ "i": i })).unwrap();
        }
    }

    let transport = open_transport(&dir, capacity);
    let pending: Vec<Sequence> = transport
        .pending("t")
        .unwrap()
        .iter()
        .map(|m| m.sequence)
        .collect();
    assert_eq!(pending, (8..=12).map(Sequence).collect::<Vec<_>>());
}

#[test]
fn test_clear_on_file_store() {
    let dir = TempDir::new().unwrap();

    {
        let transport = open_transport(&dir, Capacity::default());
        transport.publish("t", &json!({"old": true})).unwrap();
        transport.clear().unwrap();
        transport.publish("t", &json!({"new": true})).unwrap();
    }

    let transport = open_transport(&dir, Capacity::default());
    let pending = transport.pending("t").unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].sequence, Sequence(1));
    assert_eq!(
        pending[0].decode::<serde_json::Value>().unwrap(),
        json!({"new": true})
    );
    assert_eq!(transport.store().log_names().unwrap(), vec!["durable".to_string()]);
}

#[test]
fn test_reopen_with_other_capacity_fails() {
    let dir = TempDir::new().unwrap();
    drop(open_transport(&dir, Capacity::default()));

    let store = FileStore::open_or_create(FileStoreConfig {
        path: dir.path().join("store"),
        ..Default::default()
    })
    .unwrap();
    let result = Transport::open(
        store,
        TransportConfig {
            name: "durable".to_string(),
            capacity: Capacity::new(2048, None),
            ..Default::default()
        },
    );
    assert!(result.is_err());
}
