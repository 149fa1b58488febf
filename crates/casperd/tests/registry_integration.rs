//! Integration tests for the connection registry.
//!
//! Exercises link consistency under every removal position, removal while
//! walking a snapshot, and handle staleness across slot reuse.
//!
//! Tests CAN use `.unwrap()` and `.expect()` - this is allowed.

use std::os::fd::RawFd;

use casperd::registry::{ConnHandle, Descriptor, Registry, RegistryError};

// ============================================================================
// Test Helpers
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
struct FakeConn {
    fd: RawFd,
}

impl Descriptor for FakeConn {
    fn descriptor(&self) -> RawFd {
        self.fd
    }
}

/// Registers descriptors `first..first + n`; returns handles in registration order.
fn populate(registry: &mut Registry<FakeConn>, first: RawFd, n: usize) -> Vec<ConnHandle> {
    (0..n)
        .map(|i| {
            let fd = first + RawFd::try_from(i).unwrap();
            registry.register(FakeConn { fd }).unwrap()
        })
        .collect()
}

/// Forward and backward walks must describe the same sequence, sized `len()`.
fn assert_links_consistent(registry: &Registry<FakeConn>) {
    let forward = registry.handles();
    let mut backward = registry.handles_rev();
    backward.reverse();

    assert_eq!(forward, backward, "prev/next links disagree");
    assert_eq!(forward.len(), registry.len());
    assert_eq!(registry.is_empty(), forward.is_empty());
}

fn descriptors(registry: &Registry<FakeConn>) -> Vec<RawFd> {
    registry.iter().map(|(_, conn)| conn.fd).collect()
}

// ============================================================================
// Removal Position Tests
// ============================================================================

#[test]
fn test_remove_head() {
    let mut registry = Registry::new(10);
    let handles = populate(&mut registry, 10, 3);

    // newest is the head
    let removed = registry.unregister(handles[2]).unwrap();
    assert_eq!(removed.fd, 12);

    assert_eq!(descriptors(&registry), vec![11, 10]);
    assert_links_consistent(&registry);
}

#[test]
fn test_remove_tail() {
    let mut registry = Registry::new(10);
    let handles = populate(&mut registry, 10, 3);

    registry.unregister(handles[0]).unwrap();

    assert_eq!(descriptors(&registry), vec![12, 11]);
    assert_links_consistent(&registry);
}

#[test]
fn test_remove_middle() {
    let mut registry = Registry::new(10);
    let handles = populate(&mut registry, 10, 3);

    registry.unregister(handles[1]).unwrap();

    assert_eq!(descriptors(&registry), vec![12, 10]);
    assert_links_consistent(&registry);
}

#[test]
fn test_remove_sole_entry() {
    let mut registry = Registry::new(10);
    let handles = populate(&mut registry, 10, 1);

    registry.unregister(handles[0]).unwrap();

    assert!(registry.is_empty());
    assert!(registry.handles().is_empty());
    assert!(registry.handles_rev().is_empty());

    // an emptied list accepts new entries normally
    let again = registry.register(FakeConn { fd: 20 }).unwrap();
    assert_eq!(registry.handles(), vec![again]);
    assert_links_consistent(&registry);
}

// ============================================================================
// Mutation During Iteration
// ============================================================================

#[test]
fn test_remove_every_other_while_walking() {
    let mut registry = Registry::new(16);
    populate(&mut registry, 100, 8);

    let mut visited = Vec::new();
    for (i, handle) in registry.handles().into_iter().enumerate() {
        let fd = registry.get(handle).unwrap().fd;
        visited.push(fd);
        if i % 2 == 0 {
            registry.unregister(handle).unwrap();
        }
    }

    assert_eq!(visited, vec![107, 106, 105, 104, 103, 102, 101, 100]);
    assert_eq!(descriptors(&registry), vec![106, 104, 102, 100]);
    assert_links_consistent(&registry);
}

#[test]
fn test_removing_unvisited_entry_skips_it() {
    let mut registry = Registry::new(16);
    let handles = populate(&mut registry, 100, 4);

    let mut visited = Vec::new();
    for handle in registry.handles() {
        let Some(conn) = registry.get(handle) else {
            continue;
        };
        visited.push(conn.fd);
        // first visit removes the oldest entry before it is reached
        if conn.fd == 103 {
            registry.unregister(handles[0]).unwrap();
        }
    }

    assert_eq!(visited, vec![103, 102, 101]);
    assert_links_consistent(&registry);
}

#[test]
fn test_len_tracks_register_and_unregister() {
    let mut registry = Registry::new(32);
    let mut live = Vec::new();

    for round in 0..5 {
        live.extend(populate(&mut registry, round * 10, 4));
        let drop_count = 3;
        for handle in live.drain(..drop_count) {
            registry.unregister(handle).unwrap();
        }
        assert_eq!(registry.len(), live.len());
        assert_links_consistent(&registry);
    }
}

// ============================================================================
// Handle Tests
// ============================================================================

#[test]
fn test_stale_handle_after_slot_reuse() {
    let mut registry = Registry::new(4);
    let old = registry.register(FakeConn { fd: 7 }).unwrap();
    registry.unregister(old).unwrap();

    let new = registry.register(FakeConn { fd: 8 }).unwrap();
    assert_eq!(old.index(), new.index(), "slot reused");

    assert!(registry.get(old).is_none());
    assert!(registry.unregister(old).is_none());
    assert_eq!(registry.get(new).unwrap().fd, 8);
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_lookup_by_descriptor() {
    let mut registry = Registry::new(4);
    let handles = populate(&mut registry, 40, 3);

    assert_eq!(registry.lookup(41), Some(handles[1]));
    registry.unregister(handles[1]).unwrap();
    assert_eq!(registry.lookup(41), None);

    // descriptor numbers are recycled by the OS
    let reused = registry.register(FakeConn { fd: 41 }).unwrap();
    assert_eq!(registry.lookup(41), Some(reused));
}

#[test]
fn test_full_registry_rejects_until_space_frees() {
    let mut registry = Registry::new(2);
    let handles = populate(&mut registry, 1, 2);
    assert!(registry.is_full());

    let err = registry.register(FakeConn { fd: 3 }).unwrap_err();
    assert_eq!(err, RegistryError::RegistryFull { max: 2 });

    registry.unregister(handles[0]).unwrap();
    assert!(registry.register(FakeConn { fd: 3 }).is_ok());
}

// ============================================================================
// Drain Tests
// ============================================================================

#[test]
fn test_drain_returns_everything_in_order() {
    let mut registry = Registry::new(8);
    let handles = populate(&mut registry, 50, 5);

    let drained: Vec<RawFd> = registry.drain().into_iter().map(|c| c.fd).collect();
    assert_eq!(drained, vec![54, 53, 52, 51, 50]);

    assert!(registry.is_empty());
    assert_links_consistent(&registry);
    assert!(handles.iter().all(|h| registry.get(*h).is_none()));
    assert_eq!(registry.lookup(50), None);
}
