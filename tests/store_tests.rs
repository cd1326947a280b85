//! Store Tests
//!
//! These tests verify, through the public `DriftMap` API:
//! - Basic put/get/remove semantics
//! - Relocation when a value outgrows its slot, and free-slot reuse
//! - Capacity exhaustion
//! - Tombstone reclamation after the cleanup timeout
//! - Owner-thread confinement and use after close

use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use driftkv::interop::{encode, U32Interop, Utf8Interop};
use driftkv::{ApplyOutcome, Config, DriftError, DriftMap, ReplicatedEntry, ReplicationConfig, Stamp};

// =============================================================================
// Helper Functions
// =============================================================================

fn open_default() -> DriftMap<String, String> {
    DriftMap::open(Config::builder().segments(4).entries(1024).build()).unwrap()
}

/// One segment sized for a handful of small entries
fn open_tiny() -> DriftMap<u32, String> {
    let config = Config::builder()
        .segments(1)
        .entries(8)
        .average_key_size(4)
        .average_value_size(8)
        .build();
    DriftMap::open(config).unwrap()
}

fn s(value: &str) -> String {
    value.to_string()
}

// =============================================================================
// Basic Operations
// =============================================================================

#[test]
fn test_put_get_remove() {
    let map = open_default();

    assert_eq!(map.get(&s("missing")).unwrap(), None);
    assert_eq!(map.put(&s("a"), &s("1")).unwrap(), None);
    assert_eq!(map.put(&s("b"), &s("2")).unwrap(), None);
    assert_eq!(map.put(&s("a"), &s("3")).unwrap(), Some(s("1")));

    assert_eq!(map.get(&s("a")).unwrap(), Some(s("3")));
    assert_eq!(map.get(&s("b")).unwrap(), Some(s("2")));

    assert_eq!(map.remove(&s("a")).unwrap(), Some(s("3")));
    assert_eq!(map.get(&s("a")).unwrap(), None);
    assert!(!map.contains_key(&s("a")).unwrap());
    assert!(map.contains_key(&s("b")).unwrap());
}

#[test]
fn test_remove_absent_returns_none() {
    let map = open_default();
    assert_eq!(map.remove(&s("never")).unwrap(), None);

    map.put(&s("k"), &s("v")).unwrap();
    map.remove(&s("k")).unwrap();
    assert_eq!(map.remove(&s("k")).unwrap(), None);
}

#[test]
fn test_put_after_remove() {
    let map = open_default();
    map.put(&s("k"), &s("v1")).unwrap();
    map.remove(&s("k")).unwrap();
    assert_eq!(map.put(&s("k"), &s("v2")).unwrap(), None);
    assert_eq!(map.get(&s("k")).unwrap(), Some(s("v2")));
}

#[test]
fn test_many_keys_across_segments() {
    let map: DriftMap<u32, u64> =
        DriftMap::open(Config::builder().segments(8).entries(4096).build()).unwrap();
    for i in 0..2000u32 {
        map.put(&i, &(i as u64 * 3)).unwrap();
    }
    for i in 0..2000u32 {
        assert_eq!(map.get(&i).unwrap(), Some(i as u64 * 3), "key {}", i);
    }
    for i in (0..2000u32).step_by(2) {
        assert_eq!(map.remove(&i).unwrap(), Some(i as u64 * 3));
    }
    for i in 0..2000u32 {
        assert_eq!(map.get(&i).unwrap().is_some(), i % 2 == 1, "key {}", i);
    }
}

// =============================================================================
// Slot Management
// =============================================================================

#[test]
fn test_growing_value_relocates() {
    let map = open_default();
    map.put(&s("grow"), &s("x")).unwrap();
    map.put(&s("neighbour"), &s("n")).unwrap();

    for len in [16, 200, 1000, 3] {
        let value = "y".repeat(len);
        map.put(&s("grow"), &value).unwrap();
        assert_eq!(map.get(&s("grow")).unwrap(), Some(value));
    }
    assert_eq!(map.get(&s("neighbour")).unwrap(), Some(s("n")));
}

#[test]
fn test_freed_slots_are_reused() {
    // far more writes than the arena could hold without reuse
    let map = open_tiny();
    for round in 0..2000u32 {
        let key = round % 4;
        let value = if round % 2 == 0 { s("short") } else { s("a bit longer") };
        map.put(&key, &value).unwrap();
        if round % 3 == 0 {
            map.remove(&key).unwrap();
        }
    }
}

#[test]
fn test_capacity_exhausted() {
    let map = open_tiny();
    let mut stored = 0u32;
    let err = loop {
        match map.put(&stored, &s("value")) {
            Ok(_) => stored += 1,
            Err(e) => break e,
        }
        assert!(stored < 1000, "store never filled up");
    };

    assert!(matches!(err, DriftError::CapacityExhausted(_)));
    assert!(!err.is_retryable());
    assert!(stored > 0);
    for key in 0..stored {
        assert_eq!(map.get(&key).unwrap(), Some(s("value")));
    }
}

#[test]
fn test_oversized_value_rejected_without_damage() {
    let map = open_tiny();
    map.put(&1, &s("kept")).unwrap();

    let huge = "z".repeat(10_000);
    assert!(matches!(
        map.put(&1, &huge),
        Err(DriftError::CapacityExhausted(_))
    ));
    assert_eq!(map.get(&1).unwrap(), Some(s("kept")));
}

#[test]
fn test_unencodable_key_rejected() {
    // arena large enough that only the key's encoding can fail
    let map: DriftMap<String, String> =
        DriftMap::open(Config::builder().segments(1).build()).unwrap();
    let long_key = "k".repeat(70_000);
    assert!(matches!(
        map.put(&long_key, &s("v")),
        Err(DriftError::Encoding(_))
    ));
    assert_eq!(map.get(&s("other")).unwrap(), None);
}

// =============================================================================
// Tombstone Reclamation
// =============================================================================

#[test]
fn test_tombstone_blocks_older_writes_until_reclaimed() {
    let config = Config::builder()
        .segments(2)
        .entries(64)
        .removed_entry_cleanup_timeout(Duration::from_millis(100))
        .replication(ReplicationConfig::builder(1).build())
        .build();
    let map: DriftMap<u32, String> = DriftMap::open(config).unwrap();

    map.put(&7, &s("live")).unwrap();
    map.remove(&7).unwrap();

    let old_write = ReplicatedEntry::put(
        Stamp::new(2, 1),
        encode(&U32Interop, &7).unwrap(),
        encode(&Utf8Interop, &s("ancient")).unwrap(),
    );
    assert_eq!(map.apply_remote(old_write.clone()).unwrap(), ApplyOutcome::Stale);
    assert_eq!(map.get(&7).unwrap(), None);

    // once the tombstone is gone nothing remembers the deletion
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if map.apply_remote(old_write.clone()).unwrap() == ApplyOutcome::Applied {
            break;
        }
        assert!(Instant::now() < deadline, "tombstone never reclaimed");
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(map.get(&7).unwrap(), Some(s("ancient")));
}

#[test]
fn test_remote_tombstone_for_unknown_key() {
    let map: DriftMap<u32, String> = DriftMap::open(Config::default()).unwrap();
    let tombstone = ReplicatedEntry::tombstone(Stamp::new(3, 50), encode(&U32Interop, &1).unwrap());
    assert_eq!(map.apply_remote(tombstone).unwrap(), ApplyOutcome::Applied);
    assert_eq!(map.get(&1).unwrap(), None);
}

#[test]
fn test_malformed_remote_value_is_encoding_error_on_read() {
    let map: DriftMap<u32, String> = DriftMap::open(Config::default()).unwrap();
    let entry = ReplicatedEntry::put(
        Stamp::new(3, 50),
        encode(&U32Interop, &1).unwrap(),
        Bytes::from_static(&[0xff]),
    );
    map.apply_remote(entry).unwrap();
    assert!(matches!(map.get(&1), Err(DriftError::Encoding(_))));
}

// =============================================================================
// Access Guard
// =============================================================================

#[test]
fn test_foreign_thread_is_rejected() {
    let map = open_default();
    map.put(&s("k"), &s("v")).unwrap();

    thread::scope(|scope| {
        let result = scope.spawn(|| map.get(&s("k"))).join().unwrap();
        assert!(matches!(result, Err(DriftError::WrongThread { .. })));

        let result = scope.spawn(|| map.close()).join().unwrap();
        assert!(matches!(result, Err(DriftError::WrongThread { .. })));
    });

    // the failed close from another thread left the map open
    assert!(map.is_open());
    assert_eq!(map.get(&s("k")).unwrap(), Some(s("v")));
}

#[test]
fn test_every_operation_fails_after_close() {
    let map = open_default();
    map.put(&s("k"), &s("v")).unwrap();
    map.close().unwrap();

    assert!(matches!(map.get(&s("k")), Err(DriftError::Closed)));
    assert!(matches!(map.put(&s("k"), &s("v")), Err(DriftError::Closed)));
    assert!(matches!(map.remove(&s("k")), Err(DriftError::Closed)));
    assert!(matches!(map.contains_key(&s("k")), Err(DriftError::Closed)));
    assert!(matches!(map.peers(), Err(DriftError::Closed)));
    assert!(map.get(&s("k")).unwrap_err().is_usage_error());

    // closing again is fine
    map.close().unwrap();
}

#[test]
fn test_drop_without_close() {
    let map = open_default();
    map.put(&s("k"), &s("v")).unwrap();
    drop(map);
}

#[test]
fn test_invalid_config_rejected() {
    let result: driftkv::Result<DriftMap<u32, u32>> =
        DriftMap::open(Config::builder().segments(0).build());
    assert!(matches!(result, Err(DriftError::Config(_))));

    let replication = ReplicationConfig::builder(0).build();
    let result: driftkv::Result<DriftMap<u32, u32>> =
        DriftMap::open(Config::builder().replication(replication).build());
    assert!(matches!(result, Err(DriftError::Config(_))));
}
