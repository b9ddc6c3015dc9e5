//! Primitive types shared across the crate.
//!
//! - [`Height`]: Monotonically increasing block index.
//! - [`Round`]: Sub-attempt within a height until a proposal commits.
//! - [`Timestamp`]: Milliseconds since the UNIX epoch, as carried in signed messages.
//! - [`Digest`]: A SHA-256 digest. The all-zero digest is the "nil" block hash.
//! - [`Address`]: A 20-byte identifier derived from a validator's public key.

use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error, Read, ReadExt, Write};
use commonware_cryptography::{ed25519::PublicKey, sha256};
use commonware_utils::hex;
use std::fmt::{self, Debug, Display, Formatter};

pub use commonware_cryptography::sha256::Digest;

/// Block index.
pub type Height = u64;

/// Round within a [Height].
pub type Round = u64;

/// Milliseconds since the UNIX epoch.
pub type Timestamp = u64;

const DIGEST_LENGTH: usize = 32;
const ADDRESS_LENGTH: usize = 20;

/// Returns the all-zero ("nil") digest.
pub fn nil() -> Digest {
    Digest::from([0u8; DIGEST_LENGTH])
}

/// Returns true if `digest` is the nil digest.
pub fn is_nil(digest: &Digest) -> bool {
    digest.iter().all(|byte| *byte == 0)
}

/// Identifier of a validator, derived from the first 20 bytes of the SHA-256 digest
/// of its public key.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address([u8; ADDRESS_LENGTH]);

impl Address {
    /// Derives the address of a serialized public key.
    pub fn derive(public_key: &[u8]) -> Self {
        let digest = sha256::hash(public_key);
        let mut raw = [0u8; ADDRESS_LENGTH];
        raw.copy_from_slice(&digest[..ADDRESS_LENGTH]);
        Self(raw)
    }
}

impl From<&PublicKey> for Address {
    fn from(public_key: &PublicKey) -> Self {
        Self::derive(public_key.as_ref())
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Write for Address {
    fn write(&self, buf: &mut impl BufMut) {
        self.0.write(buf);
    }
}

impl EncodeSize for Address {
    fn encode_size(&self) -> usize {
        ADDRESS_LENGTH
    }
}

impl Read for Address {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
        Ok(Self(<[u8; ADDRESS_LENGTH]>::read(buf)?))
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex(&self.0))
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_codec::{DecodeExt, Encode};
    use commonware_cryptography::{ed25519::PrivateKey, PrivateKeyExt as _, Signer as _};

    #[test]
    fn test_nil_digest() {
        assert!(is_nil(&nil()));
        assert!(!is_nil(&sha256::hash(b"block")));
    }

    #[test]
    fn test_address_of_public_key() {
        let public_key = PrivateKey::from_seed(0).public_key();
        let address = Address::from(&public_key);
        assert_eq!(address, Address::derive(public_key.as_ref()));
        assert_eq!(address.as_ref(), &sha256::hash(public_key.as_ref())[..ADDRESS_LENGTH]);
    }

    #[test]
    fn test_address_codec() {
        let address = Address::derive(&[7u8; 32]);
        let encoded = address.encode();
        assert_eq!(encoded.len(), ADDRESS_LENGTH);
        assert_eq!(Address::decode(encoded).unwrap(), address);
    }

    #[test]
    fn test_address_display() {
        let address = Address::derive(&[7u8; 32]);
        let rendered = address.to_string();
        assert!(rendered.starts_with("0x"));
        assert_eq!(rendered.len(), 42);
    }
}
