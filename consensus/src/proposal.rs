//! Signed block proposals.
//!
//! A [Proposal] can only be constructed (or decoded) if its signature verifies and its
//! block hash matches the digest of the embedded marshaled block.

use crate::types::{Digest, Height, Round, Timestamp};
use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{Encode, EncodeSize, Error as CodecError, Read, ReadExt, Write};
use commonware_cryptography::{
    ed25519::{PrivateKey, PublicKey, Signature},
    sha256::hash,
    Signer, Verifier,
};
use commonware_utils::union;
use thiserror::Error;

/// Suffix appended to the namespace when signing proposals.
const PROPOSAL_SUFFIX: &[u8] = b"_PROPOSAL";

/// Returns the namespace proposals are signed under.
pub fn proposal_namespace(namespace: &[u8]) -> Vec<u8> {
    union(namespace, PROPOSAL_SUFFIX)
}

/// Errors that can occur when constructing a proposal.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("block hash does not match marshaled block")]
    BlockHashMismatch,
    #[error("valid round {valid_round} is not before round {round}")]
    InvalidValidRound { valid_round: Round, round: Round },
    #[error("signer does not match proposer")]
    WrongSigner,
    #[error("invalid signature")]
    InvalidSignature,
}

/// Unsigned content of a proposal.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProposalMetadata {
    height: Height,
    round: Round,
    block_hash: Digest,
    timestamp: Timestamp,
    proposer: PublicKey,
    marshaled_block: Bytes,
    valid_round: Option<Round>,
}

impl ProposalMetadata {
    /// Creates proposal metadata, deriving the block hash from `marshaled_block`.
    ///
    /// `valid_round` is the round in which the proposed block was last seen with a
    /// two-thirds prevote majority (if any) and must be earlier than `round`.
    pub fn new(
        height: Height,
        round: Round,
        timestamp: Timestamp,
        proposer: PublicKey,
        marshaled_block: Bytes,
        valid_round: Option<Round>,
    ) -> Result<Self, Error> {
        let block_hash = hash(&marshaled_block);
        Self::from_parts(
            height,
            round,
            block_hash,
            timestamp,
            proposer,
            marshaled_block,
            valid_round,
        )
    }

    fn from_parts(
        height: Height,
        round: Round,
        block_hash: Digest,
        timestamp: Timestamp,
        proposer: PublicKey,
        marshaled_block: Bytes,
        valid_round: Option<Round>,
    ) -> Result<Self, Error> {
        if hash(&marshaled_block) != block_hash {
            return Err(Error::BlockHashMismatch);
        }
        if let Some(valid_round) = valid_round {
            if valid_round >= round {
                return Err(Error::InvalidValidRound { valid_round, round });
            }
        }
        Ok(Self {
            height,
            round,
            block_hash,
            timestamp,
            proposer,
            marshaled_block,
            valid_round,
        })
    }

    /// Signs this metadata, producing a [Proposal].
    pub fn sign(self, signer: &PrivateKey, namespace: &[u8]) -> Result<Proposal, Error> {
        if signer.public_key() != self.proposer {
            return Err(Error::WrongSigner);
        }
        let signature = signer.sign(Some(&proposal_namespace(namespace)), &self.encode());
        Ok(Proposal {
            metadata: self,
            signature,
        })
    }

    /// Returns the height the block is proposed at.
    pub fn height(&self) -> Height {
        self.height
    }

    /// Returns the round the block is proposed in.
    pub fn round(&self) -> Round {
        self.round
    }

    /// Returns the digest of [ProposalMetadata::marshaled_block].
    pub fn block_hash(&self) -> &Digest {
        &self.block_hash
    }

    /// Returns the time the proposal was made, in milliseconds.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Returns the public key of the proposer.
    pub fn proposer(&self) -> &PublicKey {
        &self.proposer
    }

    /// Returns the opaque serialized block.
    pub fn marshaled_block(&self) -> &Bytes {
        &self.marshaled_block
    }

    /// Returns the last round with a prevote majority for this block, if any.
    pub fn valid_round(&self) -> Option<Round> {
        self.valid_round
    }
}

impl Write for ProposalMetadata {
    fn write(&self, buf: &mut impl BufMut) {
        self.height.write(buf);
        self.round.write(buf);
        self.block_hash.write(buf);
        self.timestamp.write(buf);
        self.proposer.write(buf);
        (self.marshaled_block.len() as u32).write(buf);
        buf.put_slice(&self.marshaled_block);
        match self.valid_round {
            Some(valid_round) => {
                true.write(buf);
                valid_round.write(buf);
            }
            None => false.write(buf),
        }
    }
}

impl EncodeSize for ProposalMetadata {
    fn encode_size(&self) -> usize {
        self.height.encode_size()
            + self.round.encode_size()
            + self.block_hash.encode_size()
            + self.timestamp.encode_size()
            + self.proposer.encode_size()
            + (self.marshaled_block.len() as u32).encode_size()
            + self.marshaled_block.len()
            + true.encode_size()
            + self.valid_round.map_or(0, |valid_round| valid_round.encode_size())
    }
}

impl Read for ProposalMetadata {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let height = Height::read(buf)?;
        let round = Round::read(buf)?;
        let block_hash = Digest::read(buf)?;
        let timestamp = Timestamp::read(buf)?;
        let proposer = PublicKey::read(buf)?;
        let len = u32::read(buf)? as usize;
        if buf.remaining() < len {
            return Err(CodecError::EndOfBuffer);
        }
        let marshaled_block = buf.copy_to_bytes(len);
        let valid_round = if bool::read(buf)? {
            Some(Round::read(buf)?)
        } else {
            None
        };
        Self::from_parts(
            height,
            round,
            block_hash,
            timestamp,
            proposer,
            marshaled_block,
            valid_round,
        )
        .map_err(|_| {
            CodecError::Invalid("consensus::proposal::ProposalMetadata", "invalid metadata")
        })
    }
}

/// A block proposal signed by its proposer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Proposal {
    metadata: ProposalMetadata,
    signature: Signature,
}

impl Proposal {
    /// Pairs metadata with a signature, rejecting the pair if the signature does not verify.
    pub fn new(
        metadata: ProposalMetadata,
        signature: Signature,
        namespace: &[u8],
    ) -> Result<Self, Error> {
        let valid = metadata.proposer.verify(
            Some(&proposal_namespace(namespace)),
            &metadata.encode(),
            &signature,
        );
        if !valid {
            return Err(Error::InvalidSignature);
        }
        Ok(Self {
            metadata,
            signature,
        })
    }

    /// Returns true if the signature is valid under `namespace`.
    pub fn verify(&self, namespace: &[u8]) -> bool {
        self.metadata.proposer.verify(
            Some(&proposal_namespace(namespace)),
            &self.metadata.encode(),
            &self.signature,
        )
    }

    /// Returns the signed content.
    pub fn metadata(&self) -> &ProposalMetadata {
        &self.metadata
    }

    /// Returns the proposer's signature over [Proposal::metadata].
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Returns the height the block is proposed at.
    pub fn height(&self) -> Height {
        self.metadata.height
    }

    /// Returns the round the block is proposed in.
    pub fn round(&self) -> Round {
        self.metadata.round
    }

    /// Returns the digest of the proposed block.
    pub fn block_hash(&self) -> &Digest {
        &self.metadata.block_hash
    }

    /// Returns the public key of the proposer.
    pub fn proposer(&self) -> &PublicKey {
        &self.metadata.proposer
    }
}

impl Write for Proposal {
    fn write(&self, buf: &mut impl BufMut) {
        self.metadata.write(buf);
        self.signature.write(buf);
    }
}

impl EncodeSize for Proposal {
    fn encode_size(&self) -> usize {
        self.metadata.encode_size() + self.signature.encode_size()
    }
}

impl Read for Proposal {
    /// Namespace the proposal signature is checked under.
    type Cfg = Vec<u8>;

    fn read_cfg(buf: &mut impl Buf, namespace: &Vec<u8>) -> Result<Self, CodecError> {
        let metadata = ProposalMetadata::read(buf)?;
        let signature = Signature::read(buf)?;
        Self::new(metadata, signature, namespace)
            .map_err(|_| CodecError::Invalid("consensus::proposal::Proposal", "invalid signature"))
    }
}
