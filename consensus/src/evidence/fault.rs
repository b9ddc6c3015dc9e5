//! Misbehavior observed by message handlers, awaiting materialization into [Evidence].
//!
//! A [Fault] is recorded the instant a conflict is detected, before the validator set of
//! its height is necessarily known. The [Collector] queues faults (reporting each distinct
//! pair only once) and later turns them into [Evidence] in a single pass.

use super::{duplicate_vote, metrics::Metrics, DuplicateVoteEvidence, Error, Evidence};
use crate::{
    types::{Address, Digest, Height},
    validator::ValidatorSet,
    vote::Vote,
    Chain,
};
use commonware_codec::Encode;
use commonware_cryptography::{Hasher as _, Sha256};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::{collections::VecDeque, mem};
use tracing::{debug, warn};

/// A detected, not yet materialized, protocol violation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// A validator signed two different block hashes in the same phase.
    DuplicateVote { vote_ref: Vote, vote_dup: Vote },
}

impl Fault {
    /// Records a pair of conflicting votes (in either order).
    pub fn duplicate_vote(v1: Vote, v2: Vote) -> Self {
        let (vote_ref, vote_dup) = duplicate_vote::order(v1, v2);
        Fault::DuplicateVote { vote_ref, vote_dup }
    }

    /// Height the violation occurred at.
    pub fn height(&self) -> Height {
        match self {
            Fault::DuplicateVote { vote_ref, .. } => vote_ref.height(),
        }
    }

    /// Address of the misbehaving validator.
    pub fn target(&self) -> Address {
        match self {
            Fault::DuplicateVote { vote_ref, .. } => vote_ref.address(),
        }
    }

    /// Identifies the fault independently of when (or by whom) it was observed.
    pub fn key(&self) -> Digest {
        match self {
            Fault::DuplicateVote { vote_ref, vote_dup } => {
                let mut hasher = Sha256::new();
                hasher.update(&vote_ref.encode());
                hasher.update(&vote_dup.encode());
                hasher.finalize()
            }
        }
    }

    /// Builds [Evidence] against `validators`, the set active at [Fault::height].
    ///
    /// The result is verified before it is returned.
    pub fn materialize(
        &self,
        validators: &ValidatorSet,
        namespace: &[u8],
    ) -> Result<Evidence, Error> {
        let evidence: Evidence = match self {
            Fault::DuplicateVote { vote_ref, vote_dup } => DuplicateVoteEvidence::new(
                vote_ref.clone(),
                vote_dup.clone(),
                validators.clone(),
                namespace,
            )?
            .into(),
        };
        evidence.verify(validators, namespace)?;
        Ok(evidence)
    }
}

/// Queue of [Fault]s, drained once per block-proposal cycle.
pub struct Collector {
    namespace: Vec<u8>,
    queue: Mutex<VecDeque<Fault>>,
    seen: DashMap<Digest, Height>,
    metrics: Metrics,
}

impl Collector {
    /// Creates an empty collector. Faults are materialized under `namespace`.
    pub fn new(namespace: &[u8], metrics: Metrics) -> Self {
        Self {
            namespace: namespace.to_vec(),
            queue: Mutex::new(VecDeque::new()),
            seen: DashMap::new(),
            metrics,
        }
    }

    /// Queues `fault`.
    ///
    /// Returns false if the same fault was already reported (and not pruned).
    pub fn handle(&self, fault: Fault) -> bool {
        if self.seen.insert(fault.key(), fault.height()).is_some() {
            return false;
        }
        debug!(
            height = fault.height(),
            target = %fault.target(),
            "queued fault"
        );
        self.metrics.faults.inc();
        self.queue.lock().push_back(fault);
        true
    }

    /// Drains every queued fault and materializes it against the validator set of its
    /// height.
    ///
    /// Faults that cannot be materialized are logged and dropped.
    pub fn exhaust(&self, chain: &impl Chain) -> Vec<Evidence> {
        let faults = mem::take(&mut *self.queue.lock());
        let mut evidence = Vec::with_capacity(faults.len());
        for fault in faults {
            let Some(validators) = chain.validator_set(fault.height()) else {
                warn!(
                    height = fault.height(),
                    target = %fault.target(),
                    "dropping fault: no validator set"
                );
                continue;
            };
            match fault.materialize(&validators, &self.namespace) {
                Ok(materialized) => {
                    self.metrics.materialized.inc();
                    evidence.push(materialized);
                }
                Err(err) => {
                    warn!(
                        ?err,
                        height = fault.height(),
                        target = %fault.target(),
                        "dropping fault: failed to materialize"
                    );
                }
            }
        }
        evidence
    }

    /// Forgets reported faults below `min_height` (they may be reported again).
    pub fn prune(&self, min_height: Height) {
        self.seen.retain(|_, height| *height >= min_height);
    }

    /// Number of queued faults.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Returns true if no fault is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mocks::{fixtures, Chain as MockChain},
        types::Timestamp,
        vote::{Flag, VoteMetadata},
    };
    use commonware_cryptography::{
        ed25519::PrivateKey, sha256::hash, PrivateKeyExt as _, Signer as _,
    };
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

    #[test]
    fn test_fault_orders_pair() {
        let signer = PrivateKey::from_seed(0);
        let a = vote(&signer, 5, b"A", 1);
        let b = vote(&signer, 5, b"B", 2);
        let one = Fault::duplicate_vote(b.clone(), a.clone());
        let two = Fault::duplicate_vote(a.clone(), b.clone());
        assert_eq!(one, two);
        assert_eq!(one.key(), two.key());
        assert_eq!(
            one,
            Fault::DuplicateVote {
                vote_ref: a,
                vote_dup: b
            }
        );
    }

    #[test]
    fn test_materialize() {
        let (signers, validators) = fixtures(4);
        let fault = Fault::duplicate_vote(
            vote(&signers[1], 5, b"A", 1),
            vote(&signers[1], 5, b"B", 2),
        );
        let evidence = fault.materialize(&validators, NAMESPACE).unwrap();
        assert_eq!(evidence.target(), Address::from(&signers[1].public_key()));

        // Deterministic
        let again = fault.materialize(&validators, NAMESPACE).unwrap();
        assert_eq!(evidence.id(), again.id());

        // Fails loudly for a pair that is not evidence under this namespace
        assert_eq!(
            fault.materialize(&validators, b"other").unwrap_err(),
            Error::InvalidSignature
        );
    }

    #[test]
    fn test_collector_dedup_and_exhaust() {
        let (signers, validators) = fixtures(4);
        let chain = MockChain::new(validators, 100);
        let collector = Collector::new(NAMESPACE, Metrics::default());

        let fault = Fault::duplicate_vote(
            vote(&signers[0], 5, b"A", 1),
            vote(&signers[0], 5, b"B", 2),
        );
        assert!(collector.handle(fault.clone()));
        assert!(!collector.handle(fault.clone()));
        assert!(collector.handle(Fault::duplicate_vote(
            vote(&signers[1], 6, b"A", 1),
            vote(&signers[1], 6, b"B", 2),
        )));
        assert_eq!(collector.len(), 2);

        let evidence = collector.exhaust(&chain);
        assert_eq!(evidence.len(), 2);
        assert!(collector.is_empty());
        assert!(collector.exhaust(&chain).is_empty());

        // Still remembered until pruned
        assert!(!collector.handle(fault.clone()));
        collector.prune(6);
        assert!(collector.handle(fault));
    }

    #[test]
    fn test_exhaust_drops_unmaterializable() {
        let (signers, validators) = fixtures(4);
        let chain = MockChain::new(validators, 100);
        let collector = Collector::new(NAMESPACE, Metrics::default());

        // Signed by a validator outside the set
        let outsider = PrivateKey::from_seed(1_000);
        collector.handle(Fault::duplicate_vote(
            vote(&outsider, 5, b"A", 1),
            vote(&outsider, 5, b"B", 2),
        ));
        collector.handle(Fault::duplicate_vote(
            vote(&signers[0], 5, b"A", 1),
            vote(&signers[0], 5, b"B", 2),
        ));
        let evidence = collector.exhaust(&chain);
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].target(), Address::from(&signers[0].public_key()));
    }

    #[test]
    fn test_concurrent_reports() {
        let (signers, _) = fixtures(4);
        let collector = Arc::new(Collector::new(NAMESPACE, Metrics::default()));
        let a = vote(&signers[0], 5, b"A", 1);
        let b = vote(&signers[0], 5, b"B", 2);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let collector = collector.clone();
                let (a, b) = (a.clone(), b.clone());
                thread::spawn(move || {
                    if i % 2 == 0 {
                        collector.handle(Fault::duplicate_vote(a, b))
                    } else {
                        collector.handle(Fault::duplicate_vote(b, a))
                    }
                })
            })
            .collect();
        let accepted = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|accepted| *accepted)
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(collector.len(), 1);
    }
}
