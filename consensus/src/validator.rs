//! Weighted validator sets.

use crate::types::{Address, Height, Round};
use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error as CodecError, Read, ReadExt, Write};
use commonware_cryptography::ed25519::PublicKey;
use std::{collections::HashSet, sync::Arc};
use thiserror::Error;

/// Errors that can occur when constructing a validator set.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("validator set is empty")]
    Empty,
    #[error("validator power must be positive")]
    ZeroPower,
    #[error("duplicate validator: {0}")]
    Duplicate(PublicKey),
    #[error("total power overflows")]
    PowerOverflow,
}

/// A validator and its voting power.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Validator {
    public_key: PublicKey,
    address: Address,
    power: u64,
}

impl Validator {
    /// Creates a validator with the given `power` (which must be positive).
    pub fn new(public_key: PublicKey, power: u64) -> Result<Self, Error> {
        if power == 0 {
            return Err(Error::ZeroPower);
        }
        let address = Address::from(&public_key);
        Ok(Self {
            public_key,
            address,
            power,
        })
    }

    /// Returns the key the validator signs with.
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Returns the [Address] derived from [Validator::public_key].
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Returns the validator's voting power.
    pub fn power(&self) -> u64 {
        self.power
    }
}

impl From<PublicKey> for Validator {
    /// Creates a validator with power 1.
    fn from(public_key: PublicKey) -> Self {
        let address = Address::from(&public_key);
        Self {
            public_key,
            address,
            power: 1,
        }
    }
}

impl Write for Validator {
    fn write(&self, buf: &mut impl BufMut) {
        self.public_key.write(buf);
        self.power.write(buf);
    }
}

impl EncodeSize for Validator {
    fn encode_size(&self) -> usize {
        self.public_key.encode_size() + self.power.encode_size()
    }
}

impl Read for Validator {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let public_key = PublicKey::read(buf)?;
        let power = u64::read(buf)?;
        Self::new(public_key, power)
            .map_err(|_| CodecError::Invalid("consensus::validator::Validator", "zero power"))
    }
}

#[derive(Debug, PartialEq, Eq, Hash)]
struct Inner {
    validators: Vec<Validator>,
    total_power: u64,
}

/// An immutable, ordered set of validators.
///
/// Validators are ordered by power (descending) and then by address (ascending), so every
/// node derives the same indices (and therefore the same bit positions in a
/// [commonware_utils::BitVec]) from the same membership. Cloning is cheap.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ValidatorSet {
    inner: Arc<Inner>,
}

impl ValidatorSet {
    /// Creates a validator set, sorting `validators` into canonical order.
    pub fn new(mut validators: Vec<Validator>) -> Result<Self, Error> {
        if validators.is_empty() {
            return Err(Error::Empty);
        }
        let mut seen = HashSet::with_capacity(validators.len());
        let mut total_power: u64 = 0;
        for validator in &validators {
            if !seen.insert(&validator.public_key) {
                return Err(Error::Duplicate(validator.public_key.clone()));
            }
            total_power = total_power
                .checked_add(validator.power)
                .ok_or(Error::PowerOverflow)?;
        }
        validators.sort_by(|a, b| b.power.cmp(&a.power).then_with(|| a.address.cmp(&b.address)));
        Ok(Self {
            inner: Arc::new(Inner {
                validators,
                total_power,
            }),
        })
    }

    /// Creates a validator set where every key has power 1.
    pub fn equal(public_keys: impl IntoIterator<Item = PublicKey>) -> Result<Self, Error> {
        Self::new(public_keys.into_iter().map(Validator::from).collect())
    }

    /// Sum of the power of every validator.
    pub fn total_power(&self) -> u64 {
        self.inner.total_power
    }

    /// `floor(total_power * 2 / 3)`: a majority requires strictly more than this.
    pub fn two_thirds_power(&self) -> u64 {
        ((self.inner.total_power as u128 * 2) / 3) as u64
    }

    /// `floor(total_power / 3)`.
    pub fn one_third_power(&self) -> u64 {
        self.inner.total_power / 3
    }

    /// Number of validators.
    pub fn len(&self) -> usize {
        self.inner.validators.len()
    }

    /// Always false (constructed sets are non-empty).
    pub fn is_empty(&self) -> bool {
        self.inner.validators.is_empty()
    }

    /// Returns the index of `public_key` in canonical order.
    pub fn index(&self, public_key: &PublicKey) -> Option<usize> {
        self.inner
            .validators
            .iter()
            .position(|validator| &validator.public_key == public_key)
    }

    /// Returns the index of the validator with `address`.
    pub fn index_of_address(&self, address: &Address) -> Option<usize> {
        self.inner
            .validators
            .iter()
            .position(|validator| &validator.address == address)
    }

    /// Returns the validator at `index`.
    pub fn get(&self, index: usize) -> Option<&Validator> {
        self.inner.validators.get(index)
    }

    /// Returns the validator with `public_key`.
    pub fn validator(&self, public_key: &PublicKey) -> Option<&Validator> {
        self.index(public_key).and_then(|index| self.get(index))
    }

    /// Returns true if `public_key` is a member.
    pub fn contains(&self, public_key: &PublicKey) -> bool {
        self.index(public_key).is_some()
    }

    /// Iterates over validators in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = &Validator> {
        self.inner.validators.iter()
    }

    /// Returns the proposer for `(height, round)`.
    pub fn proposer(&self, height: Height, round: Round) -> &Validator {
        let n = self.inner.validators.len() as u64;
        let index = height.wrapping_add(round) % n;
        &self.inner.validators[index as usize]
    }
}

impl Write for ValidatorSet {
    fn write(&self, buf: &mut impl BufMut) {
        (self.inner.validators.len() as u32).write(buf);
        for validator in &self.inner.validators {
            validator.write(buf);
        }
    }
}

impl EncodeSize for ValidatorSet {
    fn encode_size(&self) -> usize {
        (self.inner.validators.len() as u32).encode_size()
            + self
                .inner
                .validators
                .iter()
                .map(EncodeSize::encode_size)
                .sum::<usize>()
    }
}

impl Read for ValidatorSet {
    /// Maximum number of validators accepted.
    type Cfg = usize;

    fn read_cfg(buf: &mut impl Buf, max_validators: &usize) -> Result<Self, CodecError> {
        let len = u32::read(buf)? as usize;
        if len > *max_validators {
            return Err(CodecError::Invalid(
                "consensus::validator::ValidatorSet",
                "too many validators",
            ));
        }
        let mut validators = Vec::with_capacity(len);
        for _ in 0..len {
            validators.push(Validator::read(buf)?);
        }
        let set = Self::new(validators.clone()).map_err(|_| {
            CodecError::Invalid("consensus::validator::ValidatorSet", "invalid set")
        })?;

        // Only the canonical ordering is accepted so that encodings are unique.
        if !set.iter().eq(validators.iter()) {
            return Err(CodecError::Invalid(
                "consensus::validator::ValidatorSet",
                "not in canonical order",
            ));
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_codec::{Decode, Encode};
    use commonware_cryptography::{ed25519::PrivateKey, PrivateKeyExt as _, Signer as _};

    fn keys(n: u64) -> Vec<PublicKey> {
        (0..n)
            .map(|seed| PrivateKey::from_seed(seed).public_key())
            .collect()
    }

    #[test]
    fn test_thresholds() {
        let set = ValidatorSet::equal(keys(4)).unwrap();
        assert_eq!(set.total_power(), 4);
        assert_eq!(set.two_thirds_power(), 2);
        assert_eq!(set.one_third_power(), 1);

        let set = ValidatorSet::equal(keys(3)).unwrap();
        assert_eq!(set.two_thirds_power(), 2);
    }

    #[test]
    fn test_canonical_order() {
        let keys = keys(5);
        let validators: Vec<_> = keys
            .iter()
            .enumerate()
            .map(|(i, key)| Validator::new(key.clone(), 1 + (i as u64 % 2)).unwrap())
            .collect();
        let mut reversed = validators.clone();
        reversed.reverse();
        let a = ValidatorSet::new(validators).unwrap();
        let b = ValidatorSet::new(reversed).unwrap();
        assert_eq!(a, b);

        let ordered: Vec<_> = a.iter().collect();
        for pair in ordered.windows(2) {
            let (x, y) = (pair[0], pair[1]);
            assert!(x.power() > y.power() || (x.power() == y.power() && x.address() < y.address()));
        }
    }

    #[test]
    fn test_invalid_sets() {
        assert_eq!(ValidatorSet::new(Vec::new()), Err(Error::Empty));
        let key = PrivateKey::from_seed(0).public_key();
        assert_eq!(
            ValidatorSet::equal(vec![key.clone(), key.clone()]),
            Err(Error::Duplicate(key.clone()))
        );
        assert_eq!(Validator::new(key, 0), Err(Error::ZeroPower));
    }

    #[test]
    fn test_proposer_rotation() {
        let set = ValidatorSet::equal(keys(4)).unwrap();
        assert_eq!(set.proposer(5, 2), set.get(3).unwrap());
        assert_eq!(set.proposer(5, 3), set.get(0).unwrap());
        assert_eq!(set.proposer(0, 0), set.get(0).unwrap());
    }

    #[test]
    fn test_lookup() {
        let keys = keys(4);
        let set = ValidatorSet::equal(keys.clone()).unwrap();
        for key in &keys {
            let index = set.index(key).unwrap();
            assert_eq!(set.get(index).unwrap().public_key(), key);
            assert_eq!(set.index_of_address(&Address::from(key)), Some(index));
            assert!(set.contains(key));
        }
        assert!(!set.contains(&PrivateKey::from_seed(99).public_key()));
    }

    #[test]
    fn test_codec() {
        let set = ValidatorSet::equal(keys(4)).unwrap();
        let decoded = ValidatorSet::decode_cfg(set.encode(), &4).unwrap();
        assert_eq!(decoded, set);
        assert!(ValidatorSet::decode_cfg(set.encode(), &3).is_err());
    }
}
