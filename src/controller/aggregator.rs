//! In-memory snapshot of owned routing resources
//!
//! The aggregator is the single writer of the snapshot. It applies watch
//! events one at a time, re-evaluating ownership on every create/update so
//! that a revoked class marker de-provisions the resource.

use crate::controller::ownership::{is_owned, ControllerIdentity};
use crate::model::{BackendEndpoints, BackendRef, ResourceKey, RoutingResource, RoutingRule, RuleError};
use std::collections::{BTreeMap, HashMap, VecDeque};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Create => "create",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
        }
    }
}

/// A change to one routing resource, with its dependent endpoint data
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceEvent {
    pub kind: EventKind,
    pub resource: RoutingResource,
    pub dependents: Vec<BackendEndpoints>,
}

impl ResourceEvent {
    pub fn new(kind: EventKind, resource: RoutingResource, dependents: Vec<BackendEndpoints>) -> Self {
        Self {
            kind,
            resource,
            dependents,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregateError {
    #[error("dropping malformed resource {key}: {source}")]
    Malformed {
        key: ResourceKey,
        #[source]
        source: RuleError,
    },

    #[error("dropping stale event for {key}: version {incoming} is older than {current}")]
    Stale {
        key: ResourceKey,
        incoming: u64,
        current: u64,
    },
}

/// Snapshot content of one owned resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedEntry {
    pub rules: Vec<RoutingRule>,
    pub dependents: Vec<BackendEndpoints>,
}

impl OwnedEntry {
    fn new(resource: RoutingResource, dependents: Vec<BackendEndpoints>) -> Self {
        let mut entry = Self {
            rules: resource.rules,
            dependents: Vec::new(),
        };
        entry.refresh_dependents(dependents);
        entry
    }

    /// Replace endpoint data while keeping the rules
    fn refresh_dependents(&mut self, mut dependents: Vec<BackendEndpoints>) {
        dependents.sort();
        dependents.dedup();
        self.dependents = dependents;
    }

    /// Endpoints known for `backend`, if any
    pub fn endpoints_for(&self, backend: &BackendRef) -> Option<&BackendEndpoints> {
        self.dependents.iter().find(|d| &d.backend == backend)
    }
}

/// Owned resources keyed by identity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    entries: BTreeMap<ResourceKey, OwnedEntry>,
}

impl Snapshot {
    pub fn get(&self, key: &ResourceKey) -> Option<&OwnedEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&ResourceKey, &OwnedEntry)> {
        self.entries.iter()
    }
}

/// Result of replacing the snapshot from a full listing
#[derive(Debug, Default)]
pub struct ResyncOutcome {
    pub changed: bool,
    pub rejected: Vec<AggregateError>,
}

/// Tombstones kept before the oldest is evicted
pub const DEFAULT_TOMBSTONE_LIMIT: usize = 4096;

/// Versions of deleted resources, oldest evicted first
///
/// A tombstone only guards against late events from before the delete, so
/// it is dropped once a newer event for the key arrives.
#[derive(Debug)]
struct Tombstones {
    limit: usize,
    versions: HashMap<ResourceKey, u64>,
    // Deletion order, one slot per key
    order: VecDeque<ResourceKey>,
}

impl Tombstones {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            versions: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &ResourceKey) -> Option<u64> {
        self.versions.get(key).copied()
    }

    fn insert(&mut self, key: ResourceKey, version: u64) {
        let version = self.remove(&key).map_or(version, |prior| prior.max(version));
        self.versions.insert(key.clone(), version);
        self.order.push_back(key);

        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.versions.remove(&oldest);
                debug!(resource = %oldest, "Evicted delete tombstone");
            }
        }
    }

    fn remove(&mut self, key: &ResourceKey) -> Option<u64> {
        let version = self.versions.remove(key)?;
        self.order.retain(|k| k != key);
        Some(version)
    }

    fn clear(&mut self) {
        self.versions.clear();
        self.order.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.versions.len()
    }
}

pub struct Aggregator {
    identity: ControllerIdentity,
    snapshot: Snapshot,
    // Last version seen per live key
    versions: HashMap<ResourceKey, u64>,
    tombstones: Tombstones,
}

impl Aggregator {
    pub fn new(identity: ControllerIdentity) -> Self {
        Self::with_tombstone_limit(identity, DEFAULT_TOMBSTONE_LIMIT)
    }

    /// Aggregator remembering at most `limit` deleted resources
    pub fn with_tombstone_limit(identity: ControllerIdentity, limit: usize) -> Self {
        Self {
            identity,
            snapshot: Snapshot::default(),
            versions: HashMap::new(),
            tombstones: Tombstones::new(limit),
        }
    }

    pub fn identity(&self) -> &ControllerIdentity {
        &self.identity
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Apply one watch event
    ///
    /// Returns whether the snapshot content changed. Stale events leave the
    /// snapshot untouched. A malformed event keeps the prior rules of the
    /// resource but still refreshes its endpoints, so the caller should
    /// re-render after `Malformed`.
    pub fn apply(&mut self, event: ResourceEvent) -> Result<bool, AggregateError> {
        let key = event.resource.key.clone();

        if event.kind == EventKind::Delete {
            let live = self.versions.remove(&key);
            if let Some(version) = event.resource.version().max(live) {
                self.tombstones.insert(key.clone(), version);
            }
            let removed = self.snapshot.entries.remove(&key).is_some();
            debug!(resource = %key, removed, "Applied delete");
            return Ok(removed);
        }

        if let Some(incoming) = event.resource.version() {
            let current = self.versions.get(&key).copied().max(self.tombstones.get(&key));
            if let Some(current) = current {
                if incoming < current {
                    return Err(AggregateError::Stale {
                        key,
                        incoming,
                        current,
                    });
                }
            }
            self.versions.insert(key.clone(), incoming);
            self.tombstones.remove(&key);
        }

        if !is_owned(&event.resource, &self.identity) {
            let revoked = self.snapshot.entries.remove(&key).is_some();
            if revoked {
                debug!(resource = %key, class = ?event.resource.class, "Ownership revoked");
            }
            return Ok(revoked);
        }

        if let Err(source) = event.resource.validate() {
            if let Some(previous) = self.snapshot.entries.get_mut(&key) {
                previous.refresh_dependents(event.dependents);
            }
            return Err(AggregateError::Malformed { key, source });
        }

        let entry = OwnedEntry::new(event.resource, event.dependents);
        let changed = self.snapshot.entries.get(&key) != Some(&entry);
        if changed {
            self.snapshot.entries.insert(key.clone(), entry);
        }
        debug!(resource = %key, changed, "Applied {}", event.kind.as_str());
        Ok(changed)
    }

    /// Replace the snapshot from a complete listing
    ///
    /// Resources missing from the listing are dropped. A malformed owned
    /// resource keeps its previous entry, if it had one.
    pub fn resync(&mut self, listing: Vec<ResourceEvent>) -> ResyncOutcome {
        let mut rejected = Vec::new();
        let mut entries = BTreeMap::new();
        let mut versions = HashMap::new();

        for event in listing {
            let key = event.resource.key.clone();
            if let Some(version) = event.resource.version() {
                versions.insert(key.clone(), version);
            }
            if !is_owned(&event.resource, &self.identity) {
                continue;
            }
            match event.resource.validate() {
                Ok(()) => {
                    entries.insert(key, OwnedEntry::new(event.resource, event.dependents));
                }
                Err(source) => {
                    if let Some(previous) = self.snapshot.entries.get(&key) {
                        let mut retained = previous.clone();
                        retained.refresh_dependents(event.dependents);
                        entries.insert(key.clone(), retained);
                    }
                    rejected.push(AggregateError::Malformed { key, source });
                }
            }
        }

        let changed = self.snapshot.entries != entries;
        self.snapshot.entries = entries;
        self.versions = versions;
        self.tombstones.clear();
        debug!(owned = self.snapshot.len(), changed, "Resynchronized snapshot");

        ResyncOutcome { changed, rejected }
    }

    #[cfg(test)]
    pub(crate) fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }
}

#[cfg(test)]
#[path = "aggregator_test.rs"]
mod tests;
