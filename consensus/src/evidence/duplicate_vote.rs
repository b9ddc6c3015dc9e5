//! Evidence that a validator signed two different block hashes in the same vote phase.

use super::{evidence_id, Error, EvidenceId, Kind};
use crate::{
    types::{nil, Address, Height, Timestamp},
    validator::ValidatorSet,
    vote::Vote,
};
use bytes::{Buf, BufMut};
use commonware_codec::{Encode, EncodeSize, Error as CodecError, Read, ReadExt, Write};

/// Checks that `v1` and `v2` form a duplicate-vote pair under `validators`.
///
/// Each violated condition is reported as a distinct [Error].
pub fn check(
    v1: &Vote,
    v2: &Vote,
    validators: &ValidatorSet,
    namespace: &[u8],
) -> Result<(), Error> {
    check_structure(v1, v2)?;
    let validator = validators
        .validator(v1.validator())
        .ok_or(Error::UnknownValidator)?;
    if v1.power() != validator.power() || v2.power() != validator.power() {
        return Err(Error::PowerMismatch);
    }
    if !v1.verify(namespace) || !v2.verify(namespace) {
        return Err(Error::InvalidSignature);
    }
    Ok(())
}

/// Checks the conditions that do not require a validator set or signature verification.
fn check_structure(v1: &Vote, v2: &Vote) -> Result<(), Error> {
    if v1.height() != v2.height() {
        return Err(Error::HeightMismatch);
    }
    if v1.round() != v2.round() {
        return Err(Error::RoundMismatch);
    }
    if v1.validator() != v2.validator() {
        return Err(Error::ValidatorMismatch);
    }
    if v1.flag() != v2.flag() {
        return Err(Error::FlagMismatch);
    }
    if v1.block_hash() == v2.block_hash() {
        return Err(Error::SameBlockHash);
    }
    Ok(())
}

/// Orders a pair of conflicting votes into `(reference, duplicate)`.
///
/// The vote with the earlier timestamp is the reference. On a tie, the vote with the
/// lexicographically smaller block hash is the reference.
pub fn order(v1: Vote, v2: Vote) -> (Vote, Vote) {
    let first = (v1.timestamp(), *v1.block_hash());
    let second = (v2.timestamp(), *v2.block_hash());
    if first <= second {
        (v1, v2)
    } else {
        (v2, v1)
    }
}

/// Two conflicting votes from the same validator, with the validator set they were checked
/// against.
#[derive(Clone, Debug)]
pub struct DuplicateVoteEvidence {
    vote_ref: Vote,
    vote_dup: Vote,
    validators: ValidatorSet,
    id: EvidenceId,
}

impl DuplicateVoteEvidence {
    /// Checks the pair and builds canonical evidence (the input order does not matter).
    pub fn new(
        v1: Vote,
        v2: Vote,
        validators: ValidatorSet,
        namespace: &[u8],
    ) -> Result<Self, Error> {
        check(&v1, &v2, &validators, namespace)?;
        let (vote_ref, vote_dup) = order(v1, v2);
        Ok(Self::from_ordered(vote_ref, vote_dup, validators))
    }

    fn from_ordered(vote_ref: Vote, vote_dup: Vote, validators: ValidatorSet) -> Self {
        let mut evidence = Self {
            vote_ref,
            vote_dup,
            validators,
            id: nil(),
        };
        evidence.id = evidence_id(Kind::DuplicateVote, &evidence.encode());
        evidence
    }

    /// Verifies the evidence against `validators`, the set active at its height.
    pub fn verify(&self, validators: &ValidatorSet, namespace: &[u8]) -> Result<(), Error> {
        if &self.validators != validators {
            return Err(Error::ValidatorSetMismatch);
        }
        check(&self.vote_ref, &self.vote_dup, validators, namespace)
    }

    /// The earlier vote of the pair.
    pub fn vote_ref(&self) -> &Vote {
        &self.vote_ref
    }

    /// The later vote of the pair.
    pub fn vote_dup(&self) -> &Vote {
        &self.vote_dup
    }

    /// The validator set the pair was checked against.
    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    pub fn height(&self) -> Height {
        self.vote_ref.height()
    }

    /// Address of the validator that signed both votes.
    pub fn target(&self) -> Address {
        self.vote_ref.address()
    }

    /// The timestamp of the later vote.
    pub fn timestamp(&self) -> Timestamp {
        self.vote_dup.timestamp()
    }

    pub fn id(&self) -> &EvidenceId {
        &self.id
    }
}

impl Write for DuplicateVoteEvidence {
    fn write(&self, buf: &mut impl BufMut) {
        self.vote_ref.write(buf);
        self.vote_dup.write(buf);
        self.validators.write(buf);
    }
}

impl EncodeSize for DuplicateVoteEvidence {
    fn encode_size(&self) -> usize {
        self.vote_ref.encode_size() + self.vote_dup.encode_size() + self.validators.encode_size()
    }
}

impl Read for DuplicateVoteEvidence {
    /// Maximum number of validators in the embedded set.
    type Cfg = usize;

    fn read_cfg(buf: &mut impl Buf, max_validators: &usize) -> Result<Self, CodecError> {
        let vote_ref = Vote::read(buf)?;
        let vote_dup = Vote::read(buf)?;
        let validators = ValidatorSet::read_cfg(buf, max_validators)?;
        check_structure(&vote_ref, &vote_dup).map_err(|_| {
            CodecError::Invalid(
                "consensus::evidence::DuplicateVoteEvidence",
                "not a duplicate vote pair",
            )
        })?;

        // Reject pairs that are not in canonical order so that each pair has one encoding.
        let (first, second) = order(vote_ref.clone(), vote_dup.clone());
        if first != vote_ref || second != vote_dup {
            return Err(CodecError::Invalid(
                "consensus::evidence::DuplicateVoteEvidence",
                "votes not in canonical order",
            ));
        }
        Ok(Self::from_ordered(vote_ref, vote_dup, validators))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mocks::fixtures,
        vote::{Flag, VoteMetadata},
    };
    use commonware_codec::Decode;
    use commonware_cryptography::{
        ed25519::PrivateKey, sha256::hash, PrivateKeyExt as _, Signer as _,
    };

    const NAMESPACE: &[u8] = b"_PALISADE";

    fn vote_with(
        signer: &PrivateKey,
        height: Height,
        round: u64,
        block: &[u8],
        timestamp: Timestamp,
        flag: Flag,
    ) -> Vote {
        VoteMetadata::new(
            signer.public_key(),
            height,
            round,
            hash(block),
            timestamp,
            1,
            flag,
        )
        .unwrap()
        .sign(signer, NAMESPACE)
        .unwrap()
    }

    fn vote(signer: &PrivateKey, block: &[u8], timestamp: Timestamp) -> Vote {
        vote_with(signer, 5, 2, block, timestamp, Flag::PreCommit)
    }

    #[test]
    fn test_scenario_double_precommit() {
        let (signers, validators) = fixtures(4);
        let x = &signers[2];
        let a = vote(x, b"A", 100);
        let b = vote(x, b"B", 200);
        let evidence = DuplicateVoteEvidence::new(b.clone(), a.clone(), validators.clone(), NAMESPACE)
            .unwrap();
        assert_eq!(evidence.vote_ref(), &a);
        assert_eq!(evidence.vote_dup(), &b);
        assert_eq!(evidence.target(), Address::from(&x.public_key()));
        assert_eq!(evidence.timestamp(), 200);
        assert_eq!(evidence.height(), 5);
        assert!(evidence.verify(&validators, NAMESPACE).is_ok());
    }

    #[test]
    fn test_id_independent_of_input_order() {
        let (signers, validators) = fixtures(4);
        let a = vote(&signers[0], b"A", 100);
        let b = vote(&signers[0], b"B", 100);
        let one = DuplicateVoteEvidence::new(a.clone(), b.clone(), validators.clone(), NAMESPACE)
            .unwrap();
        let two = DuplicateVoteEvidence::new(b, a, validators, NAMESPACE).unwrap();
        assert_eq!(one.id(), two.id());
        assert_eq!(one.encode(), two.encode());
    }

    #[test]
    fn test_order_tie_breaks_on_block_hash() {
        let signer = PrivateKey::from_seed(0);
        let a = vote(&signer, b"A", 100);
        let b = vote(&signer, b"B", 100);
        let (smaller, larger) = if a.block_hash() < b.block_hash() {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        };
        assert_eq!(order(a.clone(), b.clone()), (smaller.clone(), larger.clone()));
        assert_eq!(order(b, a), (smaller, larger));
    }

    #[test]
    fn test_check_rejections() {
        let (signers, validators) = fixtures(4);
        let x = &signers[0];
        let base = vote(x, b"A", 1);
        let cases = [
            (
                vote_with(x, 6, 2, b"B", 1, Flag::PreCommit),
                Error::HeightMismatch,
            ),
            (
                vote_with(x, 5, 3, b"B", 1, Flag::PreCommit),
                Error::RoundMismatch,
            ),
            (vote(&signers[1], b"B", 1), Error::ValidatorMismatch),
            (
                vote_with(x, 5, 2, b"B", 1, Flag::PreVote),
                Error::FlagMismatch,
            ),
            (vote(x, b"A", 2), Error::SameBlockHash),
        ];
        for (other, expected) in cases {
            assert_eq!(check(&base, &other, &validators, NAMESPACE), Err(expected));
        }

        // Forged signature
        let forged = Vote::new(
            vote(x, b"B", 1).metadata().clone(),
            base.signature().clone(),
        );
        assert_eq!(
            check(&base, &forged, &validators, NAMESPACE),
            Err(Error::InvalidSignature)
        );

        // Validator outside the set
        let outsider = PrivateKey::from_seed(1_000);
        assert_eq!(
            check(
                &vote(&outsider, b"A", 1),
                &vote(&outsider, b"B", 1),
                &validators,
                NAMESPACE
            ),
            Err(Error::UnknownValidator)
        );
    }

    #[test]
    fn test_verify_against_other_set() {
        let (signers, validators) = fixtures(4);
        let (_, other) = fixtures(5);
        let evidence = DuplicateVoteEvidence::new(
            vote(&signers[0], b"A", 1),
            vote(&signers[0], b"B", 2),
            validators,
            NAMESPACE,
        )
        .unwrap();
        assert_eq!(
            evidence.verify(&other, NAMESPACE),
            Err(Error::ValidatorSetMismatch)
        );
    }

    #[test]
    fn test_decode_rejects_non_canonical_order() {
        let (signers, validators) = fixtures(4);
        let a = vote(&signers[0], b"A", 1);
        let b = vote(&signers[0], b"B", 2);
        let mut raw = Vec::new();
        b.write(&mut raw);
        a.write(&mut raw);
        validators.write(&mut raw);
        assert!(DuplicateVoteEvidence::decode_cfg(raw.as_slice(), &16).is_err());

        let mut raw = Vec::new();
        a.write(&mut raw);
        b.write(&mut raw);
        validators.write(&mut raw);
        let decoded = DuplicateVoteEvidence::decode_cfg(raw.as_slice(), &16).unwrap();
        assert_eq!(decoded.vote_ref(), &a);
    }
}
