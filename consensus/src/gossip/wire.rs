//! Messages exchanged between validators.
//!
//! [Maj23] and [VoteSetBits] are signed by the validator named in them, over the encoding of
//! every other field, under a namespace distinct from votes and proposals.

use crate::{
    proposal::Proposal,
    types::{Digest, Height, Round, Timestamp},
    vote::{Flag, Vote},
};
use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error as CodecError, Read, ReadExt, Write};
use commonware_cryptography::{
    ed25519::{PrivateKey, PublicKey, Signature},
    Signer, Verifier,
};
use commonware_utils::{union, BitVec};

const MAJ23_SUFFIX: &[u8] = b"_MAJ23";
const VOTE_SET_BITS_SUFFIX: &[u8] = b"_VOTE_SET_BITS";

const VOTE: u8 = 0;
const PROPOSAL: u8 = 1;
const MAJ23: u8 = 2;
const VOTE_SET_BITS: u8 = 3;

/// A claim that more than two thirds of the power voted for `block_hash` in
/// `(height, round, flag)`.
///
/// The recipient replies to `validator` (not to whoever delivered the message) with its
/// [VoteSetBits] for the same block hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Maj23 {
    pub height: Height,
    pub round: Round,
    pub block_hash: Digest,
    pub flag: Flag,
    pub validator: PublicKey,
    pub timestamp: Timestamp,
    pub signature: Signature,
}

impl Maj23 {
    /// Creates a claim signed by `signer`.
    pub fn sign(
        signer: &PrivateKey,
        namespace: &[u8],
        height: Height,
        round: Round,
        block_hash: Digest,
        flag: Flag,
        timestamp: Timestamp,
    ) -> Self {
        let validator = signer.public_key();
        let mut payload = Vec::new();
        write_header(
            &mut payload,
            height,
            round,
            &block_hash,
            flag,
            &validator,
            timestamp,
        );
        let signature = signer.sign(Some(&union(namespace, MAJ23_SUFFIX)), &payload);
        Self {
            height,
            round,
            block_hash,
            flag,
            validator,
            timestamp,
            signature,
        }
    }

    /// Returns true if `validator` signed this claim.
    pub fn verify(&self, namespace: &[u8]) -> bool {
        self.validator.verify(
            Some(&union(namespace, MAJ23_SUFFIX)),
            &self.payload(),
            &self.signature,
        )
    }

    fn payload(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        write_header(
            &mut payload,
            self.height,
            self.round,
            &self.block_hash,
            self.flag,
            &self.validator,
            self.timestamp,
        );
        payload
    }
}

impl Write for Maj23 {
    fn write(&self, buf: &mut impl BufMut) {
        write_header(
            buf,
            self.height,
            self.round,
            &self.block_hash,
            self.flag,
            &self.validator,
            self.timestamp,
        );
        self.signature.write(buf);
    }
}

impl EncodeSize for Maj23 {
    fn encode_size(&self) -> usize {
        header_size(&self.block_hash, self.flag, &self.validator) + self.signature.encode_size()
    }
}

impl Read for Maj23 {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            height: Height::read(buf)?,
            round: Round::read(buf)?,
            block_hash: Digest::read(buf)?,
            flag: Flag::read(buf)?,
            validator: PublicKey::read(buf)?,
            timestamp: Timestamp::read(buf)?,
            signature: Signature::read(buf)?,
        })
    }
}

/// The votes a validator holds for `block_hash` in `(height, round, flag)`, as a bit per
/// validator index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoteSetBits {
    pub height: Height,
    pub round: Round,
    pub block_hash: Digest,
    pub flag: Flag,
    pub validator: PublicKey,
    pub timestamp: Timestamp,
    pub bits: BitVec,
    pub signature: Signature,
}

impl VoteSetBits {
    /// Creates a reply signed by `signer`.
    #[allow(clippy::too_many_arguments)]
    pub fn sign(
        signer: &PrivateKey,
        namespace: &[u8],
        height: Height,
        round: Round,
        block_hash: Digest,
        flag: Flag,
        timestamp: Timestamp,
        bits: BitVec,
    ) -> Self {
        let validator = signer.public_key();
        let mut payload = Vec::new();
        write_header(
            &mut payload,
            height,
            round,
            &block_hash,
            flag,
            &validator,
            timestamp,
        );
        bits.write(&mut payload);
        let signature = signer.sign(Some(&union(namespace, VOTE_SET_BITS_SUFFIX)), &payload);
        Self {
            height,
            round,
            block_hash,
            flag,
            validator,
            timestamp,
            bits,
            signature,
        }
    }

    /// Returns true if `validator` signed this reply.
    pub fn verify(&self, namespace: &[u8]) -> bool {
        self.validator.verify(
            Some(&union(namespace, VOTE_SET_BITS_SUFFIX)),
            &self.payload(),
            &self.signature,
        )
    }

    fn payload(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        write_header(
            &mut payload,
            self.height,
            self.round,
            &self.block_hash,
            self.flag,
            &self.validator,
            self.timestamp,
        );
        self.bits.write(&mut payload);
        payload
    }
}

impl Write for VoteSetBits {
    fn write(&self, buf: &mut impl BufMut) {
        write_header(
            buf,
            self.height,
            self.round,
            &self.block_hash,
            self.flag,
            &self.validator,
            self.timestamp,
        );
        self.bits.write(buf);
        self.signature.write(buf);
    }
}

impl EncodeSize for VoteSetBits {
    fn encode_size(&self) -> usize {
        header_size(&self.block_hash, self.flag, &self.validator)
            + self.bits.encode_size()
            + self.signature.encode_size()
    }
}

impl Read for VoteSetBits {
    /// Maximum number of bits (validators) accepted.
    type Cfg = usize;

    fn read_cfg(buf: &mut impl Buf, max_bits: &usize) -> Result<Self, CodecError> {
        Ok(Self {
            height: Height::read(buf)?,
            round: Round::read(buf)?,
            block_hash: Digest::read(buf)?,
            flag: Flag::read(buf)?,
            validator: PublicKey::read(buf)?,
            timestamp: Timestamp::read(buf)?,
            bits: BitVec::read_cfg(buf, &(..=*max_bits).into())?,
            signature: Signature::read(buf)?,
        })
    }
}

fn write_header(
    buf: &mut impl BufMut,
    height: Height,
    round: Round,
    block_hash: &Digest,
    flag: Flag,
    validator: &PublicKey,
    timestamp: Timestamp,
) {
    height.write(buf);
    round.write(buf);
    block_hash.write(buf);
    flag.write(buf);
    validator.write(buf);
    timestamp.write(buf);
}

fn header_size(block_hash: &Digest, flag: Flag, validator: &PublicKey) -> usize {
    Height::default().encode_size()
        + Round::default().encode_size()
        + block_hash.encode_size()
        + flag.encode_size()
        + validator.encode_size()
        + Timestamp::default().encode_size()
}

/// Every message handled by [super::Handler].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Vote(Vote),
    Proposal(Proposal),
    Maj23(Maj23),
    VoteSetBits(VoteSetBits),
}

impl Message {
    /// Returns a short name for the message kind (used in logs and metrics).
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Vote(_) => "vote",
            Message::Proposal(_) => "proposal",
            Message::Maj23(_) => "maj23",
            Message::VoteSetBits(_) => "vote_set_bits",
        }
    }
}

impl Write for Message {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Message::Vote(vote) => {
                VOTE.write(buf);
                vote.write(buf);
            }
            Message::Proposal(proposal) => {
                PROPOSAL.write(buf);
                proposal.write(buf);
            }
            Message::Maj23(maj23) => {
                MAJ23.write(buf);
                maj23.write(buf);
            }
            Message::VoteSetBits(bits) => {
                VOTE_SET_BITS.write(buf);
                bits.write(buf);
            }
        }
    }
}

impl EncodeSize for Message {
    fn encode_size(&self) -> usize {
        1 + match self {
            Message::Vote(vote) => vote.encode_size(),
            Message::Proposal(proposal) => proposal.encode_size(),
            Message::Maj23(maj23) => maj23.encode_size(),
            Message::VoteSetBits(bits) => bits.encode_size(),
        }
    }
}

impl Read for Message {
    /// Namespace proposals are verified under and the maximum number of validators.
    type Cfg = (Vec<u8>, usize);

    fn read_cfg(
        buf: &mut impl Buf,
        (namespace, max_validators): &Self::Cfg,
    ) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            VOTE => Ok(Message::Vote(Vote::read(buf)?)),
            PROPOSAL => Ok(Message::Proposal(Proposal::read_cfg(buf, namespace)?)),
            MAJ23 => Ok(Message::Maj23(Maj23::read(buf)?)),
            VOTE_SET_BITS => Ok(Message::VoteSetBits(VoteSetBits::read_cfg(
                buf,
                max_validators,
            )?)),
            _ => Err(CodecError::Invalid(
                "consensus::gossip::Message",
                "invalid message type",
            )),
        }
    }
}
