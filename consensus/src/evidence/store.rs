//! Storage of pending and committed [Evidence].
//!
//! The two collections are keyed by [EvidenceId] and are unordered: readers recompute any
//! ordering from ids. Keeping them disjoint is the responsibility of the [super::Pool].

use super::{Evidence, EvidenceId};
use dashmap::DashMap;
use std::sync::Arc;

/// Persistent collections of pending and committed evidence.
pub trait Store: Send + Sync + 'static {
    fn put_pending(&self, evidence: Evidence);
    fn get_pending(&self, id: &EvidenceId) -> Option<Evidence>;
    fn contains_pending(&self, id: &EvidenceId) -> bool;
    fn delete_pending(&self, id: &EvidenceId) -> Option<Evidence>;
    /// Returns the ids of all pending evidence (in no particular order).
    fn pending_ids(&self) -> Vec<EvidenceId>;

    fn put_committed(&self, evidence: Evidence);
    fn get_committed(&self, id: &EvidenceId) -> Option<Evidence>;
    fn contains_committed(&self, id: &EvidenceId) -> bool;
    fn delete_committed(&self, id: &EvidenceId) -> Option<Evidence>;
    /// Returns the ids of all committed evidence (in no particular order).
    fn committed_ids(&self) -> Vec<EvidenceId>;
}

/// In-memory [Store]. Clones share the same collections.
#[derive(Clone, Default)]
pub struct MemoryStore {
    pending: Arc<DashMap<EvidenceId, Evidence>>,
    committed: Arc<DashMap<EvidenceId, Evidence>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn put_pending(&self, evidence: Evidence) {
        self.pending.insert(*evidence.id(), evidence);
    }

    fn get_pending(&self, id: &EvidenceId) -> Option<Evidence> {
        self.pending.get(id).map(|entry| entry.value().clone())
    }

    fn contains_pending(&self, id: &EvidenceId) -> bool {
        self.pending.contains_key(id)
    }

    fn delete_pending(&self, id: &EvidenceId) -> Option<Evidence> {
        self.pending.remove(id).map(|(_, evidence)| evidence)
    }

    fn pending_ids(&self) -> Vec<EvidenceId> {
        self.pending.iter().map(|entry| *entry.key()).collect()
    }

    fn put_committed(&self, evidence: Evidence) {
        self.committed.insert(*evidence.id(), evidence);
    }

    fn get_committed(&self, id: &EvidenceId) -> Option<Evidence> {
        self.committed.get(id).map(|entry| entry.value().clone())
    }

    fn contains_committed(&self, id: &EvidenceId) -> bool {
        self.committed.contains_key(id)
    }

    fn delete_committed(&self, id: &EvidenceId) -> Option<Evidence> {
        self.committed.remove(id).map(|(_, evidence)| evidence)
    }

    fn committed_ids(&self) -> Vec<EvidenceId> {
        self.committed.iter().map(|entry| *entry.key()).collect()
    }
}
