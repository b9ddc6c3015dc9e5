//! Aggregation of votes for a single `(height, round, flag)`.
//!
//! A [VoteSet] holds at most one vote per validator (indexed by the validator's position in
//! the [ValidatorSet]), tallies power per block hash, and remembers the first block hash to
//! gather strictly more than two thirds of the total power. Bit-vectors over validator
//! indices let two nodes work out exactly which votes one of them is missing.
//!
//! [HeightVoteSet] groups every [VoteSet] of one height.

use crate::{
    types::{Digest, Height, Round},
    validator::ValidatorSet,
    vote::{Flag, Vote},
};
use commonware_cryptography::ed25519::PublicKey;
use commonware_utils::BitVec;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tracing::debug;

/// Why a vote was not added to a [VoteSet].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    #[error("height mismatch: expected {expected}, got {got}")]
    HeightMismatch { expected: Height, got: Height },
    #[error("round mismatch: expected {expected}, got {got}")]
    RoundMismatch { expected: Round, got: Round },
    #[error("flag mismatch: expected {expected}, got {got}")]
    FlagMismatch { expected: Flag, got: Flag },
    #[error("validator not in set")]
    UnknownValidator,
    #[error("power mismatch: expected {expected}, got {got}")]
    PowerMismatch { expected: u64, got: u64 },
    #[error("invalid signature")]
    InvalidSignature,
}

/// Result of [VoteSet::add].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The vote was stored.
    ///
    /// `majority` is set if (and only if) this vote caused the set to cross the two-thirds
    /// threshold for that block hash.
    Added { majority: Option<Digest> },
    /// An identical vote was already stored.
    Duplicate,
    /// The validator already voted for a different block hash (the stored vote is returned).
    /// The new vote is not stored.
    Conflicting(Vote),
    /// The vote does not belong in this set.
    Rejected(Reason),
}

/// Errors returned by reconciliation operations on a [VoteSet].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("peer not in validator set")]
    UnknownValidator,
    #[error("peer already claimed a majority for {existing}, now claims {claimed}")]
    ConflictingClaim { existing: Digest, claimed: Digest },
    #[error("bit-vector length mismatch: expected {expected}, got {got}")]
    LengthMismatch { expected: usize, got: usize },
}

/// Votes for one `(height, round, flag)`.
pub struct VoteSet {
    namespace: Vec<u8>,
    height: Height,
    round: Round,
    flag: Flag,
    validators: ValidatorSet,

    votes: Vec<Option<Vote>>,
    count: usize,
    tally: HashMap<Digest, u64>,
    voted_power: u64,
    majority: Option<Digest>,
    peer_claims: HashMap<PublicKey, Digest>,
}

impl VoteSet {
    /// Creates an empty set. Signatures are verified under `namespace`.
    pub fn new(
        namespace: &[u8],
        height: Height,
        round: Round,
        flag: Flag,
        validators: ValidatorSet,
    ) -> Self {
        Self {
            namespace: namespace.to_vec(),
            height,
            round,
            flag,
            votes: vec![None; validators.len()],
            validators,
            count: 0,
            tally: HashMap::new(),
            voted_power: 0,
            majority: None,
            peer_claims: HashMap::new(),
        }
    }

    /// Adds a vote.
    ///
    /// # Panics
    ///
    /// Panics if two different block hashes both gather a two-thirds majority (which requires
    /// more than one third of the power to equivocate, something this set never counts).
    pub fn add(&mut self, vote: Vote) -> Outcome {
        if vote.height() != self.height {
            return Outcome::Rejected(Reason::HeightMismatch {
                expected: self.height,
                got: vote.height(),
            });
        }
        if vote.round() != self.round {
            return Outcome::Rejected(Reason::RoundMismatch {
                expected: self.round,
                got: vote.round(),
            });
        }
        if vote.flag() != self.flag {
            return Outcome::Rejected(Reason::FlagMismatch {
                expected: self.flag,
                got: vote.flag(),
            });
        }
        let Some(index) = self.validators.index(vote.validator()) else {
            return Outcome::Rejected(Reason::UnknownValidator);
        };
        let Some(power) = self.validators.get(index).map(|validator| validator.power()) else {
            return Outcome::Rejected(Reason::UnknownValidator);
        };
        if vote.power() != power {
            return Outcome::Rejected(Reason::PowerMismatch {
                expected: power,
                got: vote.power(),
            });
        }
        if let Some(existing) = &self.votes[index] {
            if existing == &vote {
                return Outcome::Duplicate;
            }
        }
        if !vote.verify(&self.namespace) {
            return Outcome::Rejected(Reason::InvalidSignature);
        }

        // Same validator, same block hash: keep the latest vote without touching the tally.
        if let Some(existing) = &self.votes[index] {
            if existing.block_hash() != vote.block_hash() {
                return Outcome::Conflicting(existing.clone());
            }
            self.votes[index] = Some(vote);
            return Outcome::Added { majority: None };
        }

        let block_hash = *vote.block_hash();
        self.votes[index] = Some(vote);
        self.count += 1;
        self.voted_power += power;
        let tally = self.tally.entry(block_hash).or_default();
        *tally += power;
        let tally = *tally;

        if tally <= self.validators.two_thirds_power() {
            return Outcome::Added { majority: None };
        }
        match self.majority {
            None => {
                self.majority = Some(block_hash);
                debug!(
                    height = self.height,
                    round = self.round,
                    flag = %self.flag,
                    %block_hash,
                    "reached two-thirds majority"
                );
                Outcome::Added {
                    majority: Some(block_hash),
                }
            }
            Some(existing) => {
                assert_eq!(existing, block_hash, "conflicting two-thirds majorities");
                Outcome::Added { majority: None }
            }
        }
    }

    /// Returns the block hash that gathered more than two thirds of the power, if any.
    pub fn majority(&self) -> Option<Digest> {
        self.majority
    }

    /// Returns true if more than two thirds of the power has voted (for any block hash).
    pub fn has_two_thirds_any(&self) -> bool {
        self.voted_power > self.validators.two_thirds_power()
    }

    /// Returns true if more than one third of the power has voted (for any block hash).
    pub fn has_one_third_any(&self) -> bool {
        self.voted_power > self.validators.one_third_power()
    }

    /// Returns the power that voted for `block_hash`.
    pub fn power(&self, block_hash: &Digest) -> u64 {
        self.tally.get(block_hash).copied().unwrap_or_default()
    }

    /// Returns the number of votes held.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns true if no vote is held.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns the vote held for the validator at `index`.
    pub fn vote(&self, index: usize) -> Option<&Vote> {
        self.votes.get(index).and_then(Option::as_ref)
    }

    /// Returns a bit-vector (in validator-set order) with a bit set for every validator whose
    /// vote for `block_hash` is held.
    pub fn bits(&self, block_hash: &Digest) -> BitVec {
        let mut bits = BitVec::zeroes(self.votes.len());
        for (index, vote) in self.votes.iter().enumerate() {
            if matches!(vote, Some(vote) if vote.block_hash() == block_hash) {
                bits.set(index);
            }
        }
        bits
    }

    /// Returns the held votes whose bits are set, in validator-index order.
    ///
    /// Bits for validators whose vote is not held are skipped.
    pub fn votes(&self, bits: &BitVec) -> Vec<Vote> {
        bits.iter()
            .enumerate()
            .filter(|(_, set)| *set)
            .filter_map(|(index, _)| self.vote(index).cloned())
            .collect()
    }

    /// Returns the votes for `block_hash` held locally but not marked in `peer_bits`.
    pub fn missing(&self, block_hash: &Digest, peer_bits: &BitVec) -> Result<Vec<Vote>, Error> {
        if peer_bits.len() != self.votes.len() {
            return Err(Error::LengthMismatch {
                expected: self.votes.len(),
                got: peer_bits.len(),
            });
        }
        let mut wanted = peer_bits.clone();
        wanted.invert();
        wanted.and(&self.bits(block_hash));
        Ok(self.votes(&wanted))
    }

    /// Records that `peer` claims a two-thirds majority for `block_hash`.
    ///
    /// Returns false if the same claim was already recorded.
    pub fn set_peer_maj23(&mut self, peer: PublicKey, block_hash: Digest) -> Result<bool, Error> {
        if !self.validators.contains(&peer) {
            return Err(Error::UnknownValidator);
        }
        match self.peer_claims.get(&peer) {
            Some(existing) if *existing == block_hash => Ok(false),
            Some(existing) => Err(Error::ConflictingClaim {
                existing: *existing,
                claimed: block_hash,
            }),
            None => {
                self.peer_claims.insert(peer, block_hash);
                Ok(true)
            }
        }
    }

    /// Returns the majority `peer` claimed, if any.
    pub fn peer_maj23(&self, peer: &PublicKey) -> Option<Digest> {
        self.peer_claims.get(peer).copied()
    }

    /// Returns the height every vote in the set shares.
    pub fn height(&self) -> Height {
        self.height
    }

    /// Returns the round every vote in the set shares.
    pub fn round(&self) -> Round {
        self.round
    }

    /// Returns the voting phase of the set.
    pub fn flag(&self) -> Flag {
        self.flag
    }

    /// Returns the validators eligible to vote.
    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }
}

/// Shared handle to a [VoteSet].
pub type SharedVoteSet = Arc<Mutex<VoteSet>>;

/// Every [VoteSet] of one height, created on first use.
///
/// Concurrent callers asking for the same `(round, flag)` always receive the same set.
pub struct HeightVoteSet {
    namespace: Vec<u8>,
    height: Height,
    validators: ValidatorSet,
    sets: DashMap<(Round, Flag), SharedVoteSet>,
}

impl HeightVoteSet {
    /// Creates an empty collection for `height`.
    pub fn new(namespace: &[u8], height: Height, validators: ValidatorSet) -> Self {
        Self {
            namespace: namespace.to_vec(),
            height,
            validators,
            sets: DashMap::new(),
        }
    }

    /// Returns the height of every set.
    pub fn height(&self) -> Height {
        self.height
    }

    /// Returns the validators shared by every set.
    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    /// Returns the prevote set of `round`.
    pub fn prevotes(&self, round: Round) -> SharedVoteSet {
        self.get_or_create(round, Flag::PreVote)
    }

    /// Returns the precommit set of `round`.
    pub fn precommits(&self, round: Round) -> SharedVoteSet {
        self.get_or_create(round, Flag::PreCommit)
    }

    /// Returns the set for `(round, flag)`, creating it if needed.
    ///
    /// Returns `None` if `flag` is not a voting phase.
    pub fn vote_set(&self, round: Round, flag: Flag) -> Option<SharedVoteSet> {
        if !flag.is_phase() {
            return None;
        }
        Some(self.get_or_create(round, flag))
    }

    /// Returns the set for `(round, flag)` if it exists.
    pub fn get(&self, round: Round, flag: Flag) -> Option<SharedVoteSet> {
        self.sets.get(&(round, flag)).map(|entry| entry.value().clone())
    }

    /// Adds `vote` to the set matching its round and flag.
    pub fn add(&self, vote: Vote) -> Outcome {
        if vote.height() != self.height {
            return Outcome::Rejected(Reason::HeightMismatch {
                expected: self.height,
                got: vote.height(),
            });
        }
        if !vote.flag().is_phase() {
            return Outcome::Rejected(Reason::FlagMismatch {
                expected: Flag::PreVote,
                got: vote.flag(),
            });
        }
        let set = self.get_or_create(vote.round(), vote.flag());
        let mut set = set.lock();
        set.add(vote)
    }

    /// Returns every round with at least one set, in ascending order.
    pub fn rounds(&self) -> Vec<Round> {
        let mut rounds: Vec<Round> = self.sets.iter().map(|entry| entry.key().0).collect();
        rounds.sort_unstable();
        rounds.dedup();
        rounds
    }

    fn get_or_create(&self, round: Round, flag: Flag) -> SharedVoteSet {
        self.sets
            .entry((round, flag))
            .or_insert_with(|| {
                Arc::new(Mutex::new(VoteSet::new(
                    &self.namespace,
                    self.height,
                    round,
                    flag,
                    self.validators.clone(),
                )))
            })
            .value()
            .clone()
    }
}
