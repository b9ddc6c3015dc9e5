//! Signed votes cast by validators.
//!
//! A [Vote] is a [VoteMetadata] plus a detached signature over the metadata's canonical
//! encoding. Votes are immutable and verifiable without any other context: the metadata
//! carries the validator's public key.

use crate::types::{is_nil, Address, Digest, Height, Round, Timestamp};
use bytes::{Buf, BufMut};
use commonware_codec::{Encode, EncodeSize, Error as CodecError, Read, ReadExt, Write};
use commonware_cryptography::{
    ed25519::{PrivateKey, PublicKey, Signature},
    Signer, Verifier,
};
use commonware_utils::union;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// Suffix appended to the namespace when signing votes.
const VOTE_SUFFIX: &[u8] = b"_VOTE";

/// Returns the namespace votes are signed under.
pub fn vote_namespace(namespace: &[u8]) -> Vec<u8> {
    union(namespace, VOTE_SUFFIX)
}

/// Errors that can occur when building or signing a vote.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("{0} vote must reference a non-nil block hash")]
    NilBlockHash(Flag),
    #[error("validator power must be positive")]
    ZeroPower,
    #[error("signer does not match vote validator")]
    WrongSigner,
}

/// Phase a vote belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Flag {
    /// No vote was cast.
    Null,
    /// Vote phase is not known.
    Unknown,
    /// First voting phase of a round.
    PreVote,
    /// Second voting phase of a round.
    PreCommit,
}

impl Flag {
    /// Returns true if votes of this flag are aggregated in a [crate::vote_set::VoteSet].
    pub fn is_phase(&self) -> bool {
        matches!(self, Flag::PreVote | Flag::PreCommit)
    }

    fn to_u8(self) -> u8 {
        match self {
            Flag::Null => 0,
            Flag::Unknown => 1,
            Flag::PreVote => 2,
            Flag::PreCommit => 3,
        }
    }
}

impl Display for Flag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Flag::Null => "null",
            Flag::Unknown => "unknown",
            Flag::PreVote => "prevote",
            Flag::PreCommit => "precommit",
        };
        f.write_str(name)
    }
}

impl Write for Flag {
    fn write(&self, buf: &mut impl BufMut) {
        self.to_u8().write(buf);
    }
}

impl EncodeSize for Flag {
    fn encode_size(&self) -> usize {
        self.to_u8().encode_size()
    }
}

impl Read for Flag {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            0 => Ok(Flag::Null),
            1 => Ok(Flag::Unknown),
            2 => Ok(Flag::PreVote),
            3 => Ok(Flag::PreCommit),
            _ => Err(CodecError::Invalid("consensus::vote::Flag", "invalid flag")),
        }
    }
}

/// Unsigned content of a vote.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VoteMetadata {
    validator: PublicKey,
    height: Height,
    round: Round,
    block_hash: Digest,
    timestamp: Timestamp,
    power: u64,
    flag: Flag,
}

impl VoteMetadata {
    /// Creates vote metadata.
    ///
    /// Fails if a [Flag::PreVote] or [Flag::PreCommit] vote references the nil hash or if
    /// `power` is zero. [Flag::Null] and [Flag::Unknown] may reference any hash.
    pub fn new(
        validator: PublicKey,
        height: Height,
        round: Round,
        block_hash: Digest,
        timestamp: Timestamp,
        power: u64,
        flag: Flag,
    ) -> Result<Self, Error> {
        if flag.is_phase() && is_nil(&block_hash) {
            return Err(Error::NilBlockHash(flag));
        }
        if power == 0 {
            return Err(Error::ZeroPower);
        }
        Ok(Self {
            validator,
            height,
            round,
            block_hash,
            timestamp,
            power,
            flag,
        })
    }

    /// Signs the canonical encoding of this metadata.
    ///
    /// Fails if `signer` is not the validator named in the metadata.
    pub fn sign(self, signer: &PrivateKey, namespace: &[u8]) -> Result<Vote, Error> {
        if signer.public_key() != self.validator {
            return Err(Error::WrongSigner);
        }
        let signature = signer.sign(Some(&vote_namespace(namespace)), &self.encode());
        Ok(Vote {
            metadata: self,
            signature,
        })
    }

    /// Verifies `signature` over the canonical encoding of this metadata.
    pub fn verify(&self, namespace: &[u8], signature: &Signature) -> bool {
        self.validator
            .verify(Some(&vote_namespace(namespace)), &self.encode(), signature)
    }

    /// Returns the public key of the validator casting the vote.
    pub fn validator(&self) -> &PublicKey {
        &self.validator
    }

    /// Returns the height voted on.
    pub fn height(&self) -> Height {
        self.height
    }

    /// Returns the round voted in.
    pub fn round(&self) -> Round {
        self.round
    }

    /// Returns the block hash voted for.
    pub fn block_hash(&self) -> &Digest {
        &self.block_hash
    }

    /// Returns the time the vote was cast, in milliseconds.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Returns the power the validator claims to hold.
    pub fn power(&self) -> u64 {
        self.power
    }

    /// Returns the phase of the vote.
    pub fn flag(&self) -> Flag {
        self.flag
    }
}

impl Write for VoteMetadata {
    fn write(&self, buf: &mut impl BufMut) {
        self.height.write(buf);
        self.round.write(buf);
        self.block_hash.write(buf);
        self.timestamp.write(buf);
        self.validator.write(buf);
        self.power.write(buf);
        self.flag.write(buf);
    }
}

impl EncodeSize for VoteMetadata {
    fn encode_size(&self) -> usize {
        self.height.encode_size()
            + self.round.encode_size()
            + self.block_hash.encode_size()
            + self.timestamp.encode_size()
            + self.validator.encode_size()
            + self.power.encode_size()
            + self.flag.encode_size()
    }
}

impl Read for VoteMetadata {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let height = Height::read(buf)?;
        let round = Round::read(buf)?;
        let block_hash = Digest::read(buf)?;
        let timestamp = Timestamp::read(buf)?;
        let validator = PublicKey::read(buf)?;
        let power = u64::read(buf)?;
        let flag = Flag::read(buf)?;
        Self::new(
            validator, height, round, block_hash, timestamp, power, flag,
        )
        .map_err(|_| CodecError::Invalid("consensus::vote::VoteMetadata", "invalid metadata"))
    }
}

/// A [VoteMetadata] and the validator's signature over it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Vote {
    metadata: VoteMetadata,
    signature: Signature,
}

impl Vote {
    /// Pairs metadata with a detached signature.
    ///
    /// The signature is not checked here; call [Vote::verify] before trusting the vote.
    pub fn new(metadata: VoteMetadata, signature: Signature) -> Self {
        Self {
            metadata,
            signature,
        }
    }

    /// Returns true if the signature is valid over the metadata.
    pub fn verify(&self, namespace: &[u8]) -> bool {
        self.metadata.verify(namespace, &self.signature)
    }

    /// Returns the signed content.
    pub fn metadata(&self) -> &VoteMetadata {
        &self.metadata
    }

    /// Returns the validator's signature over [Vote::metadata].
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Returns the public key of the validator that cast this vote.
    pub fn validator(&self) -> &PublicKey {
        self.metadata.validator()
    }

    /// Returns the [Address] of the validator that cast this vote.
    pub fn address(&self) -> Address {
        Address::from(self.metadata.validator())
    }

    /// Returns the height voted on.
    pub fn height(&self) -> Height {
        self.metadata.height()
    }

    /// Returns the round voted in.
    pub fn round(&self) -> Round {
        self.metadata.round()
    }

    /// Returns the block hash voted for.
    pub fn block_hash(&self) -> &Digest {
        self.metadata.block_hash()
    }

    /// Returns the time the vote was cast, in milliseconds.
    pub fn timestamp(&self) -> Timestamp {
        self.metadata.timestamp()
    }

    /// Returns the power the validator claims to hold.
    pub fn power(&self) -> u64 {
        self.metadata.power()
    }

    /// Returns the phase of the vote.
    pub fn flag(&self) -> Flag {
        self.metadata.flag()
    }
}

impl Write for Vote {
    fn write(&self, buf: &mut impl BufMut) {
        self.metadata.write(buf);
        self.signature.write(buf);
    }
}

impl EncodeSize for Vote {
    fn encode_size(&self) -> usize {
        self.metadata.encode_size() + self.signature.encode_size()
    }
}

impl Read for Vote {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let metadata = VoteMetadata::read(buf)?;
        let signature = Signature::read(buf)?;
        Ok(Self {
            metadata,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::nil;
    use commonware_codec::DecodeExt;
    use commonware_cryptography::{sha256::hash, PrivateKeyExt as _};

    const NAMESPACE: &[u8] = b"_PALISADE";

    fn metadata(signer: &PrivateKey, block_hash: Digest, flag: Flag) -> VoteMetadata {
        VoteMetadata::new(signer.public_key(), 5, 2, block_hash, 1_000, 1, flag).unwrap()
    }

    #[test]
    fn test_sign_and_verify() {
        let signer = PrivateKey::from_seed(0);
        let vote = metadata(&signer, hash(b"a"), Flag::PreCommit)
            .sign(&signer, NAMESPACE)
            .unwrap();
        assert!(vote.verify(NAMESPACE));
        assert!(!vote.verify(b"other"));
        assert_eq!(vote.address(), Address::from(&signer.public_key()));
    }

    #[test]
    fn test_nil_hash_rules() {
        let signer = PrivateKey::from_seed(0);
        for flag in [Flag::PreVote, Flag::PreCommit] {
            assert_eq!(
                VoteMetadata::new(signer.public_key(), 1, 0, nil(), 0, 1, flag),
                Err(Error::NilBlockHash(flag))
            );
        }
        for flag in [Flag::Null, Flag::Unknown] {
            assert!(VoteMetadata::new(signer.public_key(), 1, 0, nil(), 0, 1, flag).is_ok());
            assert!(
                VoteMetadata::new(signer.public_key(), 1, 0, hash(b"x"), 0, 1, flag)
                    .is_ok()
            );
        }
    }

    #[test]
    fn test_zero_power() {
        let signer = PrivateKey::from_seed(0);
        assert_eq!(
            VoteMetadata::new(
                signer.public_key(),
                1,
                0,
                hash(b"x"),
                0,
                0,
                Flag::PreVote
            ),
            Err(Error::ZeroPower)
        );
    }

    #[test]
    fn test_wrong_signer() {
        let signer = PrivateKey::from_seed(0);
        let other = PrivateKey::from_seed(1);
        let result = metadata(&signer, hash(b"a"), Flag::PreVote).sign(&other, NAMESPACE);
        assert_eq!(result, Err(Error::WrongSigner));
    }

    #[test]
    fn test_tampered_vote_fails_verification() {
        let signer = PrivateKey::from_seed(0);
        let vote = metadata(&signer, hash(b"a"), Flag::PreVote)
            .sign(&signer, NAMESPACE)
            .unwrap();
        let forged = Vote::new(
            metadata(&signer, hash(b"b"), Flag::PreVote),
            vote.signature().clone(),
        );
        assert!(!forged.verify(NAMESPACE));
    }

    #[test]
    fn test_codec() {
        let signer = PrivateKey::from_seed(7);
        let vote = metadata(&signer, hash(b"a"), Flag::PreVote)
            .sign(&signer, NAMESPACE)
            .unwrap();
        let decoded = Vote::decode(vote.encode()).unwrap();
        assert_eq!(decoded, vote);
        assert!(decoded.verify(NAMESPACE));
    }

    #[test]
    fn test_decode_rejects_invalid_flag() {
        let signer = PrivateKey::from_seed(7);
        let vote = metadata(&signer, hash(b"a"), Flag::PreVote)
            .sign(&signer, NAMESPACE)
            .unwrap();
        let mut encoded = vote.encode().to_vec();
        // Flag is the last byte of the metadata, directly before the 64-byte signature
        let flag_index = encoded.len() - 64 - 1;
        encoded[flag_index] = 9;
        assert!(Vote::decode(encoded.as_slice()).is_err());
    }
}
