//! Tests for handoff placement, the handoff store and replay.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use nimbus_client::{ClientError, ClientResult};
use nimbus_types::{NodeName, TenantId, Timestamp};
use nimbus_wire::message::{ArchiveKeyFinalReply, HintedHandoffReply};
use nimbus_wire::{Message, MessageEnvelope, ReplyResult, ReplyStatus, SegmentDescriptor, WireFrame};
use tempfile::TempDir;

use crate::{
    HandoffConfig, HandoffCoordinator, HandoffError, HandoffRecord, HandoffReplayer,
    HandoffState, HandoffStore, Link, LinkSet, Placement, ReplayConfig,
};

// ============================================================================
// Fake node
// ============================================================================

/// One node's writer and handoff service, kept in memory.
struct FakeNode {
    name: NodeName,
    reachable: AtomicBool,
    reject_with: Mutex<Option<ReplyResult>>,
    /// Newest archived segment per (key, segment number): (timestamp, size).
    archived: Mutex<HashMap<(String, u8), (Timestamp, u64)>>,
    archive_requests: Mutex<Vec<MessageEnvelope>>,
    handoffs: Mutex<Vec<MessageEnvelope>>,
}

impl FakeNode {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: NodeName::new(name),
            reachable: AtomicBool::new(true),
            reject_with: Mutex::new(None),
            archived: Mutex::new(HashMap::new()),
            archive_requests: Mutex::new(Vec::new()),
            handoffs: Mutex::new(Vec::new()),
        })
    }

    fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn reject(&self, result: ReplyResult) {
        *self.reject_with.lock().unwrap() = Some(result);
    }

    fn handoff_count(&self) -> usize {
        self.handoffs.lock().unwrap().len()
    }

    fn archive_count(&self) -> usize {
        self.archive_requests.lock().unwrap().len()
    }

    fn status(&self) -> ReplyStatus {
        match *self.reject_with.lock().unwrap() {
            Some(result) => ReplyStatus::failure(result, "refused"),
            None => ReplyStatus::success(),
        }
    }
}

impl Link for FakeNode {
    fn node(&self) -> &NodeName {
        &self.name
    }

    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn request(&self, request: WireFrame) -> ClientResult<WireFrame> {
        if !self.is_reachable() {
            return Err(ClientError::DestinationUnreachable {
                node: self.name.clone(),
            });
        }
        let WireFrame::Message(envelope) = request else {
            panic!("fake node only speaks messages");
        };

        let reply = match &envelope.message {
            Message::ArchiveKeyEntire(archive) => {
                let status = self.status();
                let mut previous_size = 0;
                if status.is_success() {
                    let segment = &archive.segment;
                    let mut archived = self.archived.lock().unwrap();
                    let slot = archived
                        .entry((segment.key.clone(), segment.segment_number))
                        .or_insert((Timestamp::ZERO, 0));
                    if segment.timestamp > slot.0 {
                        previous_size = slot.1;
                        *slot = (segment.timestamp, envelope.data.len() as u64);
                    }
                }
                self.archive_requests.lock().unwrap().push(envelope.clone());
                Message::ArchiveKeyFinalReply(ArchiveKeyFinalReply {
                    message_id: archive.message_id,
                    status,
                    previous_size,
                })
            }
            Message::HintedHandoff(handoff) => {
                let status = self.status();
                if status.is_success() {
                    self.handoffs.lock().unwrap().push(envelope.clone());
                }
                Message::HintedHandoffReply(HintedHandoffReply {
                    message_id: handoff.message_id,
                    status,
                })
            }
            other => panic!("unexpected request {}", other.kind()),
        };
        Ok(WireFrame::from(reply))
    }
}

fn links(nodes: &[&Arc<FakeNode>]) -> LinkSet {
    nodes
        .iter()
        .map(|node| Arc::clone(*node) as Arc<dyn Link>)
        .collect()
}

fn coordinator(nodes: &[&Arc<FakeNode>], backup_count: usize) -> HandoffCoordinator {
    HandoffCoordinator::new(
        HandoffConfig::default().with_backup_count(backup_count),
        links(nodes),
        links(nodes),
    )
}

fn segment(key: &str, segment_number: u8, timestamp: u64, data: &[u8]) -> SegmentDescriptor {
    let digest = md5::compute(data).0;
    SegmentDescriptor {
        tenant_id: TenantId::new(42),
        key: key.to_string(),
        version_number: 0,
        segment_number,
        timestamp: Timestamp::from_nanos(timestamp),
        total_size: data.len() as u64,
        file_adler32: 0,
        file_md5: digest,
        segment_adler32: 0,
        segment_md5: digest,
    }
}

fn node_names(names: &[&str]) -> Vec<NodeName> {
    names.iter().map(|n| NodeName::new(*n)).collect()
}

// ============================================================================
// Coordinator
// ============================================================================

#[test]
fn test_reachable_primary_takes_the_write() {
    let a = FakeNode::new("node-a");
    let b = FakeNode::new("node-b");
    let c = FakeNode::new("node-c");
    let coordinator = coordinator(&[&a, &b, &c], 2);

    let placement = coordinator
        .archive(&b.name, segment("x", 0, 10, b"1234"), Bytes::from_static(b"1234"))
        .unwrap();
    assert_eq!(placement, Placement::Primary { previous_size: 0 });

    let placement = coordinator
        .archive(&b.name, segment("x", 0, 20, b"123456"), Bytes::from_static(b"123456"))
        .unwrap();
    assert_eq!(placement, Placement::Primary { previous_size: 4 });

    assert_eq!(b.archive_count(), 2);
    assert_eq!(a.handoff_count() + c.handoff_count(), 0);
}

#[test]
fn test_unreachable_primary_hands_off_to_backups() {
    let a = FakeNode::new("node-a");
    let b = FakeNode::new("node-b");
    let c = FakeNode::new("node-c");
    let d = FakeNode::new("node-d");
    let coordinator = coordinator(&[&a, &b, &c, &d], 2);
    b.set_reachable(false);

    let data = Bytes::from_static(b"payload");
    let placement = coordinator
        .archive(&b.name, segment("x", 0, 10, &data), data.clone())
        .unwrap();

    let Placement::HandedOff { mut backups } = placement else {
        panic!("expected handoff, got {placement:?}");
    };
    backups.sort();
    assert_eq!(backups.len(), 2);
    assert!(!backups.contains(&b.name));

    for node in [&a, &c, &d] {
        let held = node.handoffs.lock().unwrap();
        if backups.contains(&node.name) {
            assert_eq!(held.len(), 1);
            let Message::HintedHandoff(handoff) = &held[0].message else {
                panic!("expected hinted-handoff");
            };
            assert_eq!(handoff.original_destination, b.name);
            assert_eq!(handoff.segment.key, "x");
            assert_eq!(held[0].data, data);
        } else {
            assert!(held.is_empty());
        }
    }
}

#[test]
fn test_backups_exclude_nodes_holding_the_object() {
    let a = FakeNode::new("node-a");
    let b = FakeNode::new("node-b");
    let c = FakeNode::new("node-c");
    let d = FakeNode::new("node-d");
    let coordinator = coordinator(&[&a, &b, &c, &d], 2);

    // Segment 0 lands on node-a.
    coordinator
        .archive(&a.name, segment("x", 0, 10, b"s0"), Bytes::from_static(b"s0"))
        .unwrap();

    // Segment 1's primary is down: node-a already holds a segment of "x".
    b.set_reachable(false);
    let placement = coordinator
        .archive(&b.name, segment("x", 1, 10, b"s1"), Bytes::from_static(b"s1"))
        .unwrap();

    let Placement::HandedOff { mut backups } = placement else {
        panic!("expected handoff");
    };
    backups.sort();
    assert_eq!(backups, node_names(&["node-c", "node-d"]));
    assert_eq!(a.handoff_count(), 0);
    assert_eq!(
        coordinator.holders(&segment("x", 2, 10, b"")),
        node_names(&["node-a", "node-c", "node-d"])
    );

    coordinator.forget_object(TenantId::new(42), "x", 0);
    assert!(coordinator.holders(&segment("x", 2, 10, b"")).is_empty());
}

#[test]
fn test_holder_history_is_bounded() {
    let a = FakeNode::new("node-a");
    let b = FakeNode::new("node-b");
    let coordinator = HandoffCoordinator::new(
        HandoffConfig::default().with_holder_capacity(3),
        links(&[&a, &b]),
        links(&[&a, &b]),
    );

    for i in 0..10 {
        let key = format!("object-{i}");
        coordinator
            .archive(&a.name, segment(&key, 0, 10, b"s0"), Bytes::from_static(b"s0"))
            .unwrap();
        assert!(coordinator.tracked_objects() <= 3);
    }
    assert_eq!(coordinator.tracked_objects(), 3);

    // Recent objects are remembered, the oldest are forgotten.
    assert_eq!(
        coordinator.holders(&segment("object-9", 1, 10, b"")),
        node_names(&["node-a"])
    );
    assert!(coordinator.holders(&segment("object-0", 1, 10, b"")).is_empty());
}

#[test]
fn test_recently_used_object_survives_eviction() {
    let a = FakeNode::new("node-a");
    let coordinator = HandoffCoordinator::new(
        HandoffConfig::default().with_holder_capacity(2),
        links(&[&a]),
        links(&[&a]),
    );
    let write = |key: &str| {
        coordinator
            .archive(&a.name, segment(key, 0, 10, b"s0"), Bytes::from_static(b"s0"))
            .unwrap();
    };

    write("first");
    write("second");
    // Touching "first" makes "second" the eviction candidate.
    assert!(!coordinator.holders(&segment("first", 1, 10, b"")).is_empty());
    write("third");

    assert!(!coordinator.holders(&segment("first", 1, 10, b"")).is_empty());
    assert!(coordinator.holders(&segment("second", 1, 10, b"")).is_empty());
    assert_eq!(coordinator.tracked_objects(), 2);
}

#[test]
fn test_failed_backup_is_replaced() {
    let a = FakeNode::new("node-a");
    let b = FakeNode::new("node-b");
    let c = FakeNode::new("node-c");
    let d = FakeNode::new("node-d");
    let coordinator = coordinator(&[&a, &b, &c, &d], 2);
    b.set_reachable(false);
    c.reject(ReplyResult::StorageError);

    let placement = coordinator
        .archive(&b.name, segment("x", 0, 10, b"p"), Bytes::from_static(b"p"))
        .unwrap();

    let Placement::HandedOff { mut backups } = placement else {
        panic!("expected handoff");
    };
    backups.sort();
    assert_eq!(backups, node_names(&["node-a", "node-d"]));
}

#[test]
fn test_too_few_backups() {
    let a = FakeNode::new("node-a");
    let b = FakeNode::new("node-b");
    let c = FakeNode::new("node-c");
    let coordinator = coordinator(&[&a, &b, &c], 2);
    b.set_reachable(false);
    c.set_reachable(false);

    let result = coordinator.archive(&b.name, segment("x", 0, 10, b"p"), Bytes::from_static(b"p"));
    assert!(matches!(
        result,
        Err(HandoffError::InsufficientBackups {
            needed: 2,
            accepted: 1
        })
    ));
    // The backup that accepted keeps its copy.
    assert_eq!(a.handoff_count(), 1);
}

#[test]
fn test_rejection_by_reachable_primary_is_not_handed_off() {
    let a = FakeNode::new("node-a");
    let b = FakeNode::new("node-b");
    let c = FakeNode::new("node-c");
    let coordinator = coordinator(&[&a, &b, &c], 2);
    b.reject(ReplyResult::ChecksumMismatch);

    let result = coordinator.archive(&b.name, segment("x", 0, 10, b"p"), Bytes::from_static(b"p"));
    assert!(matches!(
        result,
        Err(HandoffError::Rejected {
            result: ReplyResult::ChecksumMismatch,
            ..
        })
    ));
    assert_eq!(a.handoff_count() + c.handoff_count(), 0);
}

#[test]
fn test_unknown_destination() {
    let a = FakeNode::new("node-a");
    let coordinator = coordinator(&[&a], 1);
    let result = coordinator.archive(
        &NodeName::new("node-z"),
        segment("x", 0, 10, b"p"),
        Bytes::from_static(b"p"),
    );
    assert!(matches!(result, Err(HandoffError::UnknownNode(_))));
}

#[test]
fn test_backup_choice_varies() {
    let nodes: Vec<_> = ["node-a", "node-b", "node-c", "node-d", "node-e"]
        .iter()
        .map(|n| FakeNode::new(n))
        .collect();
    let refs: Vec<_> = nodes.iter().collect();
    let coordinator = coordinator(&refs, 1);
    nodes[0].set_reachable(false);

    for i in 0..200 {
        let key = format!("object-{i}");
        coordinator
            .handoff(&nodes[0].name, segment(&key, 0, 10, b"p"), Bytes::from_static(b"p"))
            .unwrap();
    }

    for node in &nodes[1..] {
        assert!(node.handoff_count() > 0, "{} never chosen", node.name);
    }
    assert_eq!(nodes[0].handoff_count(), 0);
}

// ============================================================================
// Store
// ============================================================================

fn record(destination: &str, key: &str, timestamp: u64) -> HandoffRecord {
    let data = format!("data for {key}@{timestamp}");
    HandoffRecord::new(
        NodeName::new(destination),
        segment(key, 0, timestamp, data.as_bytes()),
        Bytes::from(data),
    )
}

#[test]
fn test_store_accept_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = HandoffStore::open(dir.path().join("handoff.redb")).unwrap();

    let r = record("node-b", "x", 10);
    assert!(store.accept(&r).unwrap());
    assert!(!store.accept(&r).unwrap());
    assert_eq!(store.len().unwrap(), 1);

    // A newer write of the same slot is a separate record.
    assert!(store.accept(&record("node-b", "x", 11)).unwrap());
    assert_eq!(store.len().unwrap(), 2);

    assert_eq!(store.get(&r.id()).unwrap(), Some(r));
}

#[test]
fn test_store_state_transitions() {
    let dir = TempDir::new().unwrap();
    let store = HandoffStore::open(dir.path().join("handoff.redb")).unwrap();
    let r = record("node-b", "x", 10);
    let id = r.id();
    store.accept(&r).unwrap();

    assert!(store.set_state(&id, HandoffState::Forwarded, false).unwrap());
    assert!(store.pending().unwrap().is_empty());

    assert!(store.set_state(&id, HandoffState::Pending, true).unwrap());
    let pending = store.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].1.attempts, 1);

    assert!(store.remove(&id).unwrap());
    assert!(!store.remove(&id).unwrap());
    assert!(!store.set_state(&id, HandoffState::Pending, false).unwrap());
    assert!(store.is_empty().unwrap());
}

#[test]
fn test_store_groups_by_destination() {
    let dir = TempDir::new().unwrap();
    let store = HandoffStore::open(dir.path().join("handoff.redb")).unwrap();
    store.accept(&record("node-c", "a", 1)).unwrap();
    store.accept(&record("node-b", "z", 1)).unwrap();
    store.accept(&record("node-b", "a", 1)).unwrap();

    let order: Vec<_> = store
        .all()
        .unwrap()
        .into_iter()
        .map(|(_, r)| (r.original_destination.to_string(), r.segment.key))
        .collect();
    assert_eq!(
        order,
        vec![
            ("node-b".to_string(), "a".to_string()),
            ("node-b".to_string(), "z".to_string()),
            ("node-c".to_string(), "a".to_string()),
        ]
    );
}

#[test]
fn test_store_recovers_interrupted_deliveries() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("handoff.redb");
    let forwarded = record("node-b", "x", 10);
    let acknowledged = record("node-b", "y", 10);
    {
        let store = HandoffStore::open(&path).unwrap();
        store.accept(&forwarded).unwrap();
        store.accept(&acknowledged).unwrap();
        store.set_state(&forwarded.id(), HandoffState::Forwarded, false).unwrap();
        store
            .set_state(&acknowledged.id(), HandoffState::Acknowledged, false)
            .unwrap();
    }

    let store = HandoffStore::open(&path).unwrap();
    let pending = store.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].0, forwarded.id());
    assert_eq!(store.len().unwrap(), 1);
}

// ============================================================================
// Replay
// ============================================================================

fn quick_replay() -> ReplayConfig {
    ReplayConfig::default()
        .with_interval(Duration::from_millis(10))
        .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
}

#[test]
fn test_replay_delivers_after_destination_recovers() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(HandoffStore::open(dir.path().join("handoff.redb")).unwrap());
    let b = FakeNode::new("node-b");
    b.set_reachable(false);

    let first = record("node-b", "x", 10);
    let second = record("node-b", "y", 10);
    store.accept(&first).unwrap();
    store.accept(&second).unwrap();

    let mut replayer = HandoffReplayer::new(quick_replay(), Arc::clone(&store), links(&[&b]));

    // The first failure puts the destination into backoff for the rest of the pass.
    let stats = replayer.run_once().unwrap();
    assert_eq!((stats.delivered, stats.failed, stats.deferred), (0, 1, 1));
    assert_eq!(store.len().unwrap(), 2);

    b.set_reachable(true);
    std::thread::sleep(Duration::from_millis(10));
    let stats = replayer.run_once().unwrap();
    assert_eq!((stats.delivered, stats.failed, stats.deferred), (2, 0, 0));
    assert!(store.is_empty().unwrap());

    let requests = b.archive_requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    for request in requests.iter() {
        let Message::ArchiveKeyEntire(archive) = &request.message else {
            panic!("expected archive-key-entire");
        };
        assert_eq!(md5::compute(&request.data).0, archive.segment.segment_md5);
    }
}

#[test]
fn test_replay_keeps_rejected_records() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(HandoffStore::open(dir.path().join("handoff.redb")).unwrap());
    let b = FakeNode::new("node-b");
    b.reject(ReplyResult::StorageUnavailable);
    let r = record("node-b", "x", 10);
    store.accept(&r).unwrap();

    let mut replayer = HandoffReplayer::new(quick_replay(), Arc::clone(&store), links(&[&b]));
    let stats = replayer.run_once().unwrap();
    assert_eq!(stats.failed, 1);

    let held = store.get(&r.id()).unwrap().unwrap();
    assert_eq!(held.state, HandoffState::Pending);
    assert_eq!(held.attempts, 1);
}

#[test]
fn test_replay_defers_unknown_destination() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(HandoffStore::open(dir.path().join("handoff.redb")).unwrap());
    store.accept(&record("node-q", "x", 10)).unwrap();

    let mut replayer = HandoffReplayer::new(quick_replay(), Arc::clone(&store), LinkSet::new());
    let stats = replayer.run_once().unwrap();
    assert_eq!(stats.deferred, 1);
    assert_eq!(store.len().unwrap(), 1);
}

#[test]
fn test_replay_is_idempotent_at_destination() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(HandoffStore::open(dir.path().join("handoff.redb")).unwrap());
    let b = FakeNode::new("node-b");

    // The destination already has a newer write of the slot.
    let newer = segment("x", 0, 20, b"newer");
    b.request(WireFrame::from(MessageEnvelope::with_data(
        Message::ArchiveKeyEntire(nimbus_wire::message::ArchiveKeyEntire {
            message_id: Default::default(),
            segment: newer,
        }),
        Bytes::from_static(b"newer"),
    )))
    .unwrap();

    store.accept(&record("node-b", "x", 10)).unwrap();
    let mut replayer = HandoffReplayer::new(quick_replay(), Arc::clone(&store), links(&[&b]));
    assert_eq!(replayer.run_once().unwrap().delivered, 1);

    let archived = b.archived.lock().unwrap();
    assert_eq!(
        archived.get(&("x".to_string(), 0)),
        Some(&(Timestamp::from_nanos(20), 5))
    );
}

#[test]
fn test_replay_run_stops_on_shutdown() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(HandoffStore::open(dir.path().join("handoff.redb")).unwrap());
    let b = FakeNode::new("node-b");
    store.accept(&record("node-b", "x", 10)).unwrap();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handle = {
        let shutdown = Arc::clone(&shutdown);
        let store = Arc::clone(&store);
        let writers = links(&[&b]);
        std::thread::spawn(move || {
            HandoffReplayer::new(quick_replay(), store, writers).run(&shutdown);
        })
    };

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !store.is_empty().unwrap() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    shutdown.store(true, Ordering::SeqCst);
    handle.join().unwrap();

    assert!(store.is_empty().unwrap());
    assert_eq!(b.archive_count(), 1);
}
