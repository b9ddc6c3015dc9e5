//! Verifiable proof that a validator violated protocol rules.
//!
//! # Lifecycle
//!
//! Misbehavior is first observed by a message handler as a [Fault] (for example, two
//! conflicting votes from the same validator) and queued in a [Collector]. Once the
//! validator set of the fault's height is available, the [Collector] materializes every
//! queued [Fault] into [Evidence]. Block assembly adds that evidence to the [Pool] (where it
//! is pending) and, once a block embedding it is appended, commits it. Pending evidence that
//! is not committed in time expires.
//!
//! # Identity
//!
//! Every piece of [Evidence] is content-addressed: its [EvidenceId] is the SHA-256 digest of
//! its canonical encoding, computed once at construction. Equality, ordering, and hashing all
//! delegate to the id. Two observers building evidence from the same pair of conflicting
//! votes (in either order) produce byte-identical evidence and therefore the same id.
//!
//! # Encoding
//!
//! ```text
//! kind (u8) | body length (u32) | body
//! ```
//!
//! Bodies are decoded through a [Registry] that maps each kind tag to its decoder.

use crate::{
    types::{Address, Digest, Height, Timestamp},
    validator::ValidatorSet,
};
use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error as CodecError, Read, ReadExt, Write};
use commonware_cryptography::{Hasher as _, Sha256};
use std::{
    cmp::Ordering,
    fmt::{self, Display, Formatter},
    hash::{Hash, Hasher},
};
use thiserror::Error;

pub mod duplicate_vote;
pub use duplicate_vote::DuplicateVoteEvidence;
pub mod fault;
pub use fault::{Collector, Fault};
pub mod metrics;
pub mod pool;
pub use pool::Pool;
pub mod registry;
pub use registry::Registry;
pub mod store;
pub use store::{MemoryStore, Store};

/// Content address of a piece of [Evidence].
pub type EvidenceId = Digest;

/// Errors that can occur when checking evidence.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("votes are for different heights")]
    HeightMismatch,
    #[error("votes are for different rounds")]
    RoundMismatch,
    #[error("votes are from different validators")]
    ValidatorMismatch,
    #[error("votes have different flags")]
    FlagMismatch,
    #[error("votes are for the same block hash")]
    SameBlockHash,
    #[error("invalid vote signature")]
    InvalidSignature,
    #[error("validator not in set")]
    UnknownValidator,
    #[error("vote power does not match validator set")]
    PowerMismatch,
    #[error("validator set does not match the set at the evidence height")]
    ValidatorSetMismatch,
}

/// Kind of [Evidence].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    DuplicateVote,
}

impl Kind {
    /// Returns the tag used to encode this kind.
    pub fn tag(&self) -> u8 {
        match self {
            Kind::DuplicateVote => 0,
        }
    }
}

impl Display for Kind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Kind::DuplicateVote => f.write_str("duplicate_vote"),
        }
    }
}

/// Proof of validator misbehavior.
#[derive(Clone, Debug)]
pub enum Evidence {
    DuplicateVote(DuplicateVoteEvidence),
}

impl Evidence {
    /// Returns the kind of misbehavior proven.
    pub fn kind(&self) -> Kind {
        match self {
            Evidence::DuplicateVote(_) => Kind::DuplicateVote,
        }
    }

    /// Height the misbehavior occurred at.
    pub fn height(&self) -> Height {
        match self {
            Evidence::DuplicateVote(evidence) => evidence.height(),
        }
    }

    /// Address of the misbehaving validator.
    pub fn target(&self) -> Address {
        match self {
            Evidence::DuplicateVote(evidence) => evidence.target(),
        }
    }

    /// Time the misbehavior was observed at, taken from the evidence body.
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Evidence::DuplicateVote(evidence) => evidence.timestamp(),
        }
    }

    /// Returns the content address of the evidence.
    pub fn id(&self) -> &EvidenceId {
        match self {
            Evidence::DuplicateVote(evidence) => evidence.id(),
        }
    }

    /// Verifies the evidence against `validators`, the set active at [Evidence::height].
    pub fn verify(&self, validators: &ValidatorSet, namespace: &[u8]) -> Result<(), Error> {
        match self {
            Evidence::DuplicateVote(evidence) => evidence.verify(validators, namespace),
        }
    }

    fn body_size(&self) -> usize {
        match self {
            Evidence::DuplicateVote(evidence) => evidence.encode_size(),
        }
    }
}

impl From<DuplicateVoteEvidence> for Evidence {
    fn from(evidence: DuplicateVoteEvidence) -> Self {
        Evidence::DuplicateVote(evidence)
    }
}

impl PartialEq for Evidence {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Evidence {}

impl PartialOrd for Evidence {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Evidence {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id().cmp(other.id())
    }
}

impl Hash for Evidence {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

/// Computes the id of an evidence body of `kind`.
pub(crate) fn evidence_id(kind: Kind, body: &[u8]) -> EvidenceId {
    let mut hasher = Sha256::new();
    hasher.update(&[kind.tag()]);
    hasher.update(&(body.len() as u32).to_be_bytes());
    hasher.update(body);
    hasher.finalize()
}

impl Write for Evidence {
    fn write(&self, buf: &mut impl BufMut) {
        self.kind().tag().write(buf);
        (self.body_size() as u32).write(buf);
        match self {
            Evidence::DuplicateVote(evidence) => evidence.write(buf),
        }
    }
}

impl EncodeSize for Evidence {
    fn encode_size(&self) -> usize {
        self.kind().tag().encode_size() + (self.body_size() as u32).encode_size() + self.body_size()
    }
}

impl Read for Evidence {
    type Cfg = Registry;

    fn read_cfg(buf: &mut impl Buf, registry: &Registry) -> Result<Self, CodecError> {
        let tag = u8::read(buf)?;
        let len = u32::read(buf)? as usize;
        if buf.remaining() < len {
            return Err(CodecError::EndOfBuffer);
        }
        let body = buf.copy_to_bytes(len);
        registry.decode(tag, body)
    }
}
