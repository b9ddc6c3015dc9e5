//! Lifecycle of evidence between detection and on-chain commitment.
//!
//! ```text
//! Unknown --add--> Pending --commit--> Committed
//!    |                |
//!    |                +--expire--> Unknown
//!    +-------------commit--------> Committed
//! ```
//!
//! Committed evidence is permanent. Pending evidence that is not committed within
//! [Chain::max_evidence_pending_duration] blocks of its height expires and can no longer be
//! added or committed.
//!
//! Every transition of an id happens under that id's entry in a concurrent index, so two
//! concurrent adds (or commits) of the same evidence resolve to one success and one
//! explicit error.

use super::{
    metrics::{Metrics, Rejection},
    Error as EvidenceError, Evidence, EvidenceId, Store,
};
use crate::{types::Height, Chain};
use commonware_runtime::Metrics as RuntimeMetrics;
use dashmap::{mapref::entry::Entry, DashMap};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur when interacting with the pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("evidence {0} already pending")]
    AlreadyPending(EvidenceId),
    #[error("evidence {0} already committed")]
    AlreadyCommitted(EvidenceId),
    #[error("evidence height {height} is ahead of tip {tip}")]
    FutureHeight { height: Height, tip: Height },
    #[error("evidence {0} expired")]
    Expired(EvidenceId),
    #[error("no validator set at height {0}")]
    MissingValidatorSet(Height),
    #[error("evidence {0} references a different validator set")]
    ValidatorSetMismatch(EvidenceId),
    #[error("invalid evidence: {0}")]
    Invalid(EvidenceError),
    #[error("evidence {0} appears more than once")]
    Duplicate(EvidenceId),
}

/// Configuration for the [Pool].
#[derive(Clone, Debug)]
pub struct Config {
    /// Namespace votes are signed under.
    pub namespace: Vec<u8>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Status {
    Pending,
    Committed,
}

/// Pending and committed evidence, backed by a [Store].
pub struct Pool<C: Chain, S: Store> {
    chain: C,
    store: S,
    namespace: Vec<u8>,

    index: DashMap<EvidenceId, Status>,

    metrics: Metrics,
}

impl<C: Chain, S: Store> Pool<C, S> {
    /// Creates a pool, restoring its state from `store`, with metrics registered on `context`.
    pub fn new(chain: C, store: S, cfg: Config, context: &impl RuntimeMetrics) -> Self {
        Self::with_metrics(chain, store, cfg, Metrics::init(context))
    }

    /// Creates a pool that reports to existing `metrics`.
    pub fn with_metrics(chain: C, store: S, cfg: Config, metrics: Metrics) -> Self {
        let index = DashMap::new();
        for id in store.committed_ids() {
            index.insert(id, Status::Committed);
        }
        let mut pending: i64 = 0;
        for id in store.pending_ids() {
            if index.contains_key(&id) {
                // An id is never both pending and committed, committed wins.
                warn!(%id, "removing pending copy of committed evidence");
                store.delete_pending(&id);
                continue;
            }
            index.insert(id, Status::Pending);
            pending += 1;
        }
        metrics.pending.set(pending);
        info!(
            pending,
            committed = index.len() as i64 - pending,
            "restored evidence pool"
        );
        Self {
            chain,
            store,
            namespace: cfg.namespace,
            index,
            metrics,
        }
    }

    /// Adds `evidence` as pending.
    ///
    /// The evidence is re-verified against the validator set at its height, regardless of
    /// any verification performed when it was created.
    pub fn add(&self, evidence: Evidence) -> Result<(), Error> {
        let id = *evidence.id();
        if let Err(err) = self.admissible(&evidence) {
            self.metrics.reject(match &err {
                Error::AlreadyPending(_) => Rejection::AlreadyPending,
                Error::AlreadyCommitted(_) => Rejection::AlreadyCommitted,
                Error::FutureHeight { .. } => Rejection::FutureHeight,
                Error::Expired(_) => Rejection::Expired,
                _ => Rejection::Invalid,
            });
            return Err(err);
        }
        match self.index.entry(id) {
            Entry::Occupied(entry) => {
                let err = match entry.get() {
                    Status::Pending => Error::AlreadyPending(id),
                    Status::Committed => Error::AlreadyCommitted(id),
                };
                Err(err)
            }
            Entry::Vacant(entry) => {
                debug!(
                    %id,
                    height = evidence.height(),
                    target = %evidence.target(),
                    "added pending evidence"
                );
                self.store.put_pending(evidence);
                entry.insert(Status::Pending);
                self.metrics.pending.inc();
                Ok(())
            }
        }
    }

    fn admissible(&self, evidence: &Evidence) -> Result<(), Error> {
        let id = *evidence.id();
        match self.status(&id) {
            Some(Status::Committed) => return Err(Error::AlreadyCommitted(id)),
            Some(Status::Pending) => return Err(Error::AlreadyPending(id)),
            None => {}
        }
        let height = evidence.height();
        let tip = self.chain.tip_height();
        if height > tip {
            return Err(Error::FutureHeight { height, tip });
        }
        if self.is_expired(evidence) {
            return Err(Error::Expired(id));
        }
        let validators = self
            .chain
            .validator_set(height)
            .ok_or(Error::MissingValidatorSet(height))?;
        evidence
            .verify(&validators, &self.namespace)
            .map_err(|err| match err {
                EvidenceError::ValidatorSetMismatch => Error::ValidatorSetMismatch(id),
                err => Error::Invalid(err),
            })
    }

    /// Commits `evidence`, removing it from pending if present.
    ///
    /// Evidence that was never pending (for example, evidence embedded in a block received
    /// during sync) can be committed directly.
    pub fn commit(&self, evidence: Evidence) -> Result<(), Error> {
        let id = *evidence.id();
        if self.status(&id) == Some(Status::Committed) {
            return Err(Error::AlreadyCommitted(id));
        }
        if self.is_expired(&evidence) {
            return Err(Error::Expired(id));
        }
        match self.index.entry(id) {
            Entry::Occupied(mut entry) => {
                if *entry.get() == Status::Committed {
                    return Err(Error::AlreadyCommitted(id));
                }
                self.store.delete_pending(&id);
                self.store.put_committed(evidence);
                *entry.get_mut() = Status::Committed;
                self.metrics.pending.dec();
            }
            Entry::Vacant(entry) => {
                self.store.put_committed(evidence);
                entry.insert(Status::Committed);
            }
        }
        debug!(%id, "committed evidence");
        self.metrics.committed.inc();
        Ok(())
    }

    fn status(&self, id: &EvidenceId) -> Option<Status> {
        self.index.get(id).map(|entry| *entry.value())
    }

    /// Returns true if `id` is pending.
    pub fn is_pending(&self, id: &EvidenceId) -> bool {
        self.status(id) == Some(Status::Pending)
    }

    /// Returns true if `id` has been committed.
    pub fn is_committed(&self, id: &EvidenceId) -> bool {
        self.status(id) == Some(Status::Committed)
    }

    /// Returns the pending evidence with `id`, if any.
    pub fn pending(&self, id: &EvidenceId) -> Option<Evidence> {
        self.store.get_pending(id)
    }

    /// Returns the committed evidence with `id`, if any.
    pub fn committed(&self, id: &EvidenceId) -> Option<Evidence> {
        self.store.get_committed(id)
    }

    /// Returns all pending evidence, ordered by id.
    pub fn pending_evidence(&self) -> Vec<Evidence> {
        let mut evidence: Vec<Evidence> = self
            .pending_ids()
            .iter()
            .filter_map(|id| self.store.get_pending(id))
            .collect();
        evidence.sort();
        evidence
    }

    fn pending_ids(&self) -> Vec<EvidenceId> {
        self.index
            .iter()
            .filter(|entry| *entry.value() == Status::Pending)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Returns true if `evidence` is too old to be added or committed at the current tip.
    pub fn is_expired(&self, evidence: &Evidence) -> bool {
        let height = evidence.height();
        let duration = self.chain.max_evidence_pending_duration(height);
        height.saturating_add(duration) < self.chain.tip_height()
    }

    /// Removes all expired pending evidence, returning how many items were removed.
    ///
    /// Call before assembling a block so that it never embeds expired evidence.
    pub fn process_expiration_ahead(&self) -> usize {
        let mut removed = 0;
        for id in self.pending_ids() {
            let Some(evidence) = self.store.get_pending(&id) else {
                continue;
            };
            if !self.is_expired(&evidence) {
                continue;
            }
            if let Entry::Occupied(entry) = self.index.entry(id) {
                if *entry.get() != Status::Pending {
                    continue;
                }
                self.store.delete_pending(&id);
                entry.remove();
                removed += 1;
            }
        }
        if removed > 0 {
            self.metrics.pending.dec_by(removed as i64);
            self.metrics.expired.inc_by(removed as u64);
            info!(removed, tip = self.chain.tip_height(), "pruned expired evidence");
        }
        removed
    }

    /// Checks the evidence embedded in a block before the block is appended.
    pub fn verify_block_evidence(&self, evidence: &[Evidence]) -> Result<(), Error> {
        let mut seen = HashSet::with_capacity(evidence.len());
        for item in evidence {
            let id = *item.id();
            if !seen.insert(id) {
                return Err(Error::Duplicate(id));
            }
            if self.is_committed(&id) {
                return Err(Error::AlreadyCommitted(id));
            }
            if self.is_expired(item) {
                return Err(Error::Expired(id));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        evidence::{DuplicateVoteEvidence, MemoryStore},
        mocks::{fixtures, Chain as MockChain},
        types::{Address, Timestamp},
        validator::ValidatorSet,
        vote::{Flag, Vote, VoteMetadata},
    };
    use commonware_cryptography::{
        ed25519::PrivateKey, sha256::hash, PrivateKeyExt as _, Signer as _,
    };
    use commonware_runtime::{deterministic, Runner as _};
    use std::{sync::Arc, thread};

    const NAMESPACE: &[u8] = b"_PALISADE";

    fn vote(signer: &PrivateKey, height: Height, block: &[u8], timestamp: Timestamp) -> Vote {
        VoteMetadata::new(
            signer.public_key(),
            height,
            2,
            hash(block),
            timestamp,
            1,
            Flag::PreCommit,
        )
        .unwrap()
        .sign(signer, NAMESPACE)
        .unwrap()
    }

    fn evidence(signer: &PrivateKey, validators: &ValidatorSet, height: Height) -> Evidence {
        DuplicateVoteEvidence::new(
            vote(signer, height, b"A", 1),
            vote(signer, height, b"B", 2),
            validators.clone(),
            NAMESPACE,
        )
        .unwrap()
        .into()
    }

    fn pool(chain: MockChain, store: MemoryStore) -> Pool<MockChain, MemoryStore> {
        let cfg = Config {
            namespace: NAMESPACE.to_vec(),
        };
        Pool::with_metrics(chain, store, cfg, Metrics::default())
    }

    #[test]
    fn test_metrics_registered() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (signers, validators) = fixtures(4);
            let chain = MockChain::new(validators.clone(), 10);
            chain.set_tip(5);
            let cfg = Config {
                namespace: NAMESPACE.to_vec(),
            };
            let pool = Pool::new(
                chain,
                MemoryStore::new(),
                cfg,
                &context.with_label("evidence"),
            );
            pool.add(evidence(&signers[0], &validators, 5)).unwrap();
            let pending = evidence(&signers[1], &validators, 5);
            pool.add(pending.clone()).unwrap();
            pool.commit(pending).unwrap();

            let buffer = context.encode();
            assert!(buffer.contains("evidence_pending 1"));
            assert!(buffer.contains("evidence_committed_total 1"));
        });
    }

    #[test]
    fn test_lifecycle() {
        let (signers, validators) = fixtures(4);
        let chain = MockChain::new(validators.clone(), 10);
        chain.set_tip(5);
        let pool = pool(chain.clone(), MemoryStore::new());
        let evidence = evidence(&signers[0], &validators, 5);
        let id = *evidence.id();

        pool.add(evidence.clone()).unwrap();
        assert!(pool.is_pending(&id));
        assert!(!pool.is_committed(&id));
        assert_eq!(pool.pending(&id), Some(evidence.clone()));
        assert_eq!(
            pool.add(evidence.clone()),
            Err(Error::AlreadyPending(id))
        );

        pool.commit(evidence.clone()).unwrap();
        assert!(!pool.is_pending(&id));
        assert!(pool.is_committed(&id));
        assert!(pool.pending_evidence().is_empty());
        assert_eq!(pool.committed(&id), Some(evidence.clone()));
        assert_eq!(
            pool.commit(evidence.clone()),
            Err(Error::AlreadyCommitted(id))
        );
        assert_eq!(pool.add(evidence), Err(Error::AlreadyCommitted(id)));
    }

    #[test]
    fn test_commit_without_pending() {
        let (signers, validators) = fixtures(4);
        let chain = MockChain::new(validators.clone(), 10);
        chain.set_tip(5);
        let pool = pool(chain, MemoryStore::new());
        let evidence = evidence(&signers[0], &validators, 5);
        pool.commit(evidence.clone()).unwrap();
        assert!(pool.is_committed(evidence.id()));
    }

    #[test]
    fn test_future_height() {
        let (signers, validators) = fixtures(4);
        let chain = MockChain::new(validators.clone(), 10);
        chain.set_tip(4);
        let pool = pool(chain, MemoryStore::new());
        assert_eq!(
            pool.add(evidence(&signers[0], &validators, 5)),
            Err(Error::FutureHeight { height: 5, tip: 4 })
        );
    }

    #[test]
    fn test_expiry() {
        let (signers, validators) = fixtures(4);
        let chain = MockChain::new(validators.clone(), 10);
        chain.set_tip(5);
        let pool = pool(chain.clone(), MemoryStore::new());
        let pending = evidence(&signers[0], &validators, 5);
        let late = evidence(&signers[1], &validators, 5);
        pool.add(pending.clone()).unwrap();

        // 5 + 10 == 15 is not yet expired
        chain.set_tip(15);
        assert!(!pool.is_expired(&pending));
        assert_eq!(pool.process_expiration_ahead(), 0);

        chain.set_tip(16);
        assert!(pool.is_expired(&pending));
        assert_eq!(pool.add(late.clone()), Err(Error::Expired(*late.id())));
        assert_eq!(pool.commit(late.clone()), Err(Error::Expired(*late.id())));
        assert_eq!(
            pool.verify_block_evidence(&[late.clone()]),
            Err(Error::Expired(*late.id()))
        );

        assert_eq!(pool.process_expiration_ahead(), 1);
        assert!(!pool.is_pending(pending.id()));
        assert!(pool.pending_evidence().is_empty());
        assert_eq!(pool.process_expiration_ahead(), 0);
    }

    #[test]
    fn test_validator_set_mismatch() {
        let (signers, validators) = fixtures(4);
        let (_, other) = fixtures(5);
        let chain = MockChain::new(other, 10);
        chain.set_tip(5);
        let pool = pool(chain, MemoryStore::new());
        let evidence = evidence(&signers[0], &validators, 5);
        assert_eq!(
            pool.add(evidence.clone()),
            Err(Error::ValidatorSetMismatch(*evidence.id()))
        );
    }

    #[test]
    fn test_missing_validator_set() {
        let (signers, validators) = fixtures(4);
        let chain = MockChain::new(validators.clone(), 10);
        chain.set_tip(5);
        chain.remove_validator_set(5);
        let pool = pool(chain, MemoryStore::new());
        assert_eq!(
            pool.add(evidence(&signers[0], &validators, 5)),
            Err(Error::MissingValidatorSet(5))
        );
    }

    #[test]
    fn test_pending_ordered_by_id() {
        let (signers, validators) = fixtures(4);
        let chain = MockChain::new(validators.clone(), 10);
        chain.set_tip(5);
        let pool = pool(chain, MemoryStore::new());
        for signer in signers.iter().rev() {
            pool.add(evidence(signer, &validators, 5)).unwrap();
        }
        let pending = pool.pending_evidence();
        assert_eq!(pending.len(), 4);
        for pair in pending.windows(2) {
            assert!(pair[0].id() < pair[1].id());
        }
    }

    #[test]
    fn test_verify_block_evidence() {
        let (signers, validators) = fixtures(4);
        let chain = MockChain::new(validators.clone(), 10);
        chain.set_tip(5);
        let pool = pool(chain, MemoryStore::new());
        let first = evidence(&signers[0], &validators, 5);
        let second = evidence(&signers[1], &validators, 5);
        assert!(pool
            .verify_block_evidence(&[first.clone(), second.clone()])
            .is_ok());
        assert_eq!(
            pool.verify_block_evidence(&[first.clone(), first.clone()]),
            Err(Error::Duplicate(*first.id()))
        );
        pool.commit(first.clone()).unwrap();
        assert_eq!(
            pool.verify_block_evidence(&[second, first.clone()]),
            Err(Error::AlreadyCommitted(*first.id()))
        );
    }

    #[test]
    fn test_restore_from_store() {
        let (signers, validators) = fixtures(4);
        let chain = MockChain::new(validators.clone(), 10);
        chain.set_tip(5);
        let store = MemoryStore::new();
        let pending = evidence(&signers[0], &validators, 5);
        let committed = evidence(&signers[1], &validators, 5);
        {
            let pool = pool(chain.clone(), store.clone());
            pool.add(pending.clone()).unwrap();
            pool.commit(committed.clone()).unwrap();
        }

        // Both pending and committed copies of the same id: committed wins
        store.put_pending(committed.clone());

        let pool = pool(chain, store.clone());
        assert!(pool.is_pending(pending.id()));
        assert!(pool.is_committed(committed.id()));
        assert!(!store.contains_pending(committed.id()));
        assert_eq!(pool.pending_evidence(), vec![pending]);
    }

    #[test]
    fn test_concurrent_add_single_success() {
        let (signers, validators) = fixtures(4);
        let chain = MockChain::new(validators.clone(), 10);
        chain.set_tip(5);
        let pool = Arc::new(pool(chain, MemoryStore::new()));
        let evidence = evidence(&signers[0], &validators, 5);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let evidence = evidence.clone();
                thread::spawn(move || pool.add(evidence))
            })
            .collect();
        let results: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();
        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        for result in results.into_iter().filter(|result| result.is_err()) {
            assert_eq!(result, Err(Error::AlreadyPending(*evidence.id())));
        }
    }

    #[test]
    fn test_concurrent_commit_single_success() {
        let (signers, validators) = fixtures(4);
        let chain = MockChain::new(validators.clone(), 10);
        chain.set_tip(5);
        let pool = Arc::new(pool(chain, MemoryStore::new()));
        let evidence = evidence(&signers[0], &validators, 5);
        let id = *evidence.id();
        pool.add(evidence.clone()).unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let pool = pool.clone();
                let evidence = evidence.clone();
                thread::spawn(move || pool.commit(evidence))
            })
            .collect();
        let results: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();
        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        for result in results.into_iter().filter(|result| result.is_err()) {
            assert_eq!(result, Err(Error::AlreadyCommitted(id)));
        }
        assert!(!pool.is_pending(&id));
        assert!(pool.is_committed(&id));
        assert!(pool.pending_evidence().is_empty());
        assert_eq!(pool.committed(&id), Some(evidence));
    }

    #[test]
    fn test_scenario() {
        let (signers, validators) = fixtures(4);
        let chain = MockChain::new(validators.clone(), 10);
        chain.set_tip(5);
        let pool = pool(chain.clone(), MemoryStore::new());

        // Validator X double-precommits at height 5, round 2 (A before B)
        let x = &signers[3];
        let a = vote(x, 5, b"A", 100);
        let b = vote(x, 5, b"B", 200);
        let collector = crate::evidence::Collector::new(NAMESPACE, Metrics::default());
        assert!(collector.handle(crate::evidence::Fault::duplicate_vote(b.clone(), a.clone())));
        let mut materialized = collector.exhaust(&chain);
        assert_eq!(materialized.len(), 1);
        let evidence = materialized.remove(0);
        let Evidence::DuplicateVote(inner) = &evidence;
        assert_eq!(inner.vote_ref(), &a);
        assert_eq!(inner.vote_dup(), &b);
        assert_eq!(evidence.target(), Address::from(&x.public_key()));

        pool.add(evidence.clone()).unwrap();
        assert_eq!(pool.pending_evidence(), vec![evidence.clone()]);

        // Block embedding the evidence is appended
        let block = pool.pending_evidence();
        pool.verify_block_evidence(&block).unwrap();
        for item in block {
            pool.commit(item).unwrap();
        }
        assert!(pool.pending_evidence().is_empty());
        assert!(pool.is_committed(evidence.id()));
        assert_eq!(pool.committed(evidence.id()), Some(evidence));
    }
}
