//! Placing writes at the primary node or, failing that, at backups.
//!
//! A write is accepted once it is stored at its primary node or at
//! `backup_count` backup nodes. Backups hold the segment as a hinted
//! handoff and replay it to the primary once it is reachable again.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use nimbus_types::{NodeName, TenantId};
use nimbus_wire::SegmentDescriptor;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{HandoffError, HandoffResult};
use crate::link::{self, LinkSet};

/// Default number of backups a handed-off write must reach.
pub const DEFAULT_BACKUP_COUNT: usize = 2;

/// Default number of objects whose holders are remembered.
pub const DEFAULT_HOLDER_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffConfig {
    /// Backups required before a handed-off write counts as accepted.
    pub backup_count: usize,
    /// Objects whose holders are remembered. The least recently used object
    /// is forgotten first.
    #[serde(default = "default_holder_capacity")]
    pub holder_capacity: usize,
}

fn default_holder_capacity() -> usize {
    DEFAULT_HOLDER_CAPACITY
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            backup_count: DEFAULT_BACKUP_COUNT,
            holder_capacity: DEFAULT_HOLDER_CAPACITY,
        }
    }
}

impl HandoffConfig {
    pub fn with_backup_count(mut self, backup_count: usize) -> Self {
        self.backup_count = backup_count.max(1);
        self
    }

    pub fn with_holder_capacity(mut self, capacity: usize) -> Self {
        self.holder_capacity = capacity.max(1);
        self
    }
}

/// Where a write ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Stored at the intended node.
    Primary { previous_size: u64 },
    /// Held by backups for later replay.
    HandedOff { backups: Vec<NodeName> },
}

/// The object a segment belongs to. Two segments of one object never share
/// a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ObjectKey {
    tenant_id: TenantId,
    key: String,
    version_number: u32,
}

impl ObjectKey {
    fn of(segment: &SegmentDescriptor) -> Self {
        Self {
            tenant_id: segment.tenant_id,
            key: segment.key.clone(),
            version_number: segment.version_number,
        }
    }
}

/// Nodes holding segments of recently written objects.
///
/// Bounded by capacity. Every use stamps the object with the next tick of a
/// logical clock, and the object with the oldest stamp is evicted first.
#[derive(Debug)]
struct HolderMap {
    capacity: usize,
    clock: u64,
    entries: HashMap<ObjectKey, (u64, HashSet<NodeName>)>,
    by_use: BTreeMap<u64, ObjectKey>,
}

impl HolderMap {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            clock: 0,
            entries: HashMap::new(),
            by_use: BTreeMap::new(),
        }
    }

    fn get(&mut self, key: &ObjectKey) -> HashSet<NodeName> {
        let stamp = self.tick();
        match self.entries.get_mut(key) {
            Some((used, nodes)) => {
                self.by_use.remove(used);
                *used = stamp;
                self.by_use.insert(stamp, key.clone());
                nodes.clone()
            }
            None => HashSet::new(),
        }
    }

    fn insert(&mut self, key: ObjectKey, node: NodeName) {
        let stamp = self.tick();
        if let Some((used, nodes)) = self.entries.get_mut(&key) {
            self.by_use.remove(used);
            *used = stamp;
            nodes.insert(node);
            self.by_use.insert(stamp, key);
            return;
        }

        while self.entries.len() >= self.capacity {
            let Some((_, oldest)) = self.by_use.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
            debug!(key = %oldest.key, "forgot holders of least recently used object");
        }
        self.entries.insert(key.clone(), (stamp, HashSet::from([node])));
        self.by_use.insert(stamp, key);
    }

    fn remove(&mut self, key: &ObjectKey) {
        if let Some((used, _)) = self.entries.remove(key) {
            self.by_use.remove(&used);
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Sends writes to their primary and hands them off on unreachability.
#[derive(Debug)]
pub struct HandoffCoordinator {
    config: HandoffConfig,
    writers: LinkSet,
    handoff_servers: LinkSet,
    holders: Mutex<HolderMap>,
}

impl HandoffCoordinator {
    /// `writers` reach each node's writer service; `handoff_servers` reach
    /// each node's handoff service.
    pub fn new(config: HandoffConfig, writers: LinkSet, handoff_servers: LinkSet) -> Self {
        let holders = Mutex::new(HolderMap::new(config.holder_capacity));
        Self {
            config,
            writers,
            handoff_servers,
            holders,
        }
    }

    pub fn config(&self) -> &HandoffConfig {
        &self.config
    }

    /// Archives one whole segment at `destination`, handing it off to
    /// backups if `destination` cannot be reached.
    ///
    /// A refusal by a reachable destination (bad checksum, storage failure)
    /// is returned as is; only unreachability triggers handoff.
    pub fn archive(
        &self,
        destination: &NodeName,
        segment: SegmentDescriptor,
        data: Bytes,
    ) -> HandoffResult<Placement> {
        let writer = self
            .writers
            .get(destination)
            .ok_or_else(|| HandoffError::UnknownNode(destination.clone()))?;

        match link::archive_entire(writer.as_ref(), &segment, &data) {
            Ok(previous_size) => {
                self.record_holder(&segment, destination);
                Ok(Placement::Primary { previous_size })
            }
            Err(HandoffError::Client(e)) if e.is_unreachable() => {
                warn!(
                    destination = %destination,
                    tenant = %segment.tenant_id,
                    key = %segment.key,
                    segment = segment.segment_number,
                    error = %e,
                    "destination unreachable, handing off"
                );
                let backups = self.handoff(destination, segment, data)?;
                Ok(Placement::HandedOff { backups })
            }
            Err(e) => Err(e),
        }
    }

    /// Places the segment at `backup_count` reachable backups, excluding
    /// `original_destination` and every node already holding a segment of
    /// the same object.
    ///
    /// Candidates are tried in uniformly random order; a backup that fails
    /// is replaced by the next candidate. Backups that accepted keep their
    /// copy even when the call fails with
    /// [`HandoffError::InsufficientBackups`].
    pub fn handoff(
        &self,
        original_destination: &NodeName,
        segment: SegmentDescriptor,
        data: Bytes,
    ) -> HandoffResult<Vec<NodeName>> {
        let needed = self.config.backup_count;
        let mut excluded = self.holders_of(&segment);
        excluded.insert(original_destination.clone());

        let mut candidates: Vec<_> = self
            .handoff_servers
            .iter()
            .filter(|link| !excluded.contains(link.node()) && link.is_reachable())
            .collect();
        candidates.shuffle(&mut rand::thread_rng());

        let mut accepted = Vec::with_capacity(needed);
        for candidate in candidates {
            if accepted.len() == needed {
                break;
            }
            match link::hinted_handoff(candidate.as_ref(), original_destination, &segment, &data) {
                Ok(()) => {
                    debug!(
                        backup = %candidate.node(),
                        original_destination = %original_destination,
                        key = %segment.key,
                        "backup accepted handoff"
                    );
                    self.record_holder(&segment, candidate.node());
                    accepted.push(candidate.node().clone());
                }
                Err(e) => {
                    warn!(backup = %candidate.node(), error = %e, "backup refused handoff");
                }
            }
        }

        if accepted.len() < needed {
            warn!(
                original_destination = %original_destination,
                key = %segment.key,
                needed,
                accepted = accepted.len(),
                "not enough backups"
            );
            return Err(HandoffError::InsufficientBackups {
                needed,
                accepted: accepted.len(),
            });
        }

        info!(
            original_destination = %original_destination,
            tenant = %segment.tenant_id,
            key = %segment.key,
            segment = segment.segment_number,
            backups = ?accepted,
            "write handed off"
        );
        Ok(accepted)
    }

    /// Forgets placement history for an object once all of its segments
    /// are written.
    pub fn forget_object(&self, tenant_id: TenantId, key: &str, version_number: u32) {
        self.lock_holders().remove(&ObjectKey {
            tenant_id,
            key: key.to_string(),
            version_number,
        });
    }

    /// Nodes known to hold a segment of the same object.
    pub fn holders(&self, segment: &SegmentDescriptor) -> Vec<NodeName> {
        let mut holders: Vec<_> = self.holders_of(segment).into_iter().collect();
        holders.sort();
        holders
    }

    /// Number of objects whose holders are remembered.
    pub fn tracked_objects(&self) -> usize {
        self.lock_holders().len()
    }

    fn holders_of(&self, segment: &SegmentDescriptor) -> HashSet<NodeName> {
        self.lock_holders().get(&ObjectKey::of(segment))
    }

    fn record_holder(&self, segment: &SegmentDescriptor, node: &NodeName) {
        self.lock_holders()
            .insert(ObjectKey::of(segment), node.clone());
    }

    fn lock_holders(&self) -> MutexGuard<'_, HolderMap> {
        self.holders.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
