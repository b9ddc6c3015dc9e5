//! Decoders for each [Kind] of [Evidence].
//!
//! Evidence kinds are registered explicitly (rather than discovered) so that the set of
//! kinds a node accepts is fixed at startup and identical across nodes running the same
//! configuration.

use super::{DuplicateVoteEvidence, Evidence, Kind};
use bytes::{Buf, Bytes};
use commonware_codec::{Error as CodecError, Read};
use std::{collections::BTreeMap, fmt};

/// Decodes an evidence body, given the maximum number of validators a set may contain.
pub type Decoder = fn(&mut Bytes, usize) -> Result<Evidence, CodecError>;

fn decode_duplicate_vote(body: &mut Bytes, max_validators: usize) -> Result<Evidence, CodecError> {
    DuplicateVoteEvidence::read_cfg(body, &max_validators).map(Evidence::from)
}

/// Table of evidence decoders keyed by kind tag.
#[derive(Clone)]
pub struct Registry {
    decoders: BTreeMap<u8, Decoder>,
    max_validators: usize,
}

impl Registry {
    /// Creates a registry containing every built-in kind.
    pub fn new(max_validators: usize) -> Self {
        let mut registry = Self::empty(max_validators);
        registry.register(Kind::DuplicateVote.tag(), decode_duplicate_vote);
        registry
    }

    /// Creates a registry without any decoders.
    pub fn empty(max_validators: usize) -> Self {
        Self {
            decoders: BTreeMap::new(),
            max_validators,
        }
    }

    /// Registers `decoder` for `tag`.
    ///
    /// Returns false (and keeps the existing decoder) if `tag` is already registered.
    pub fn register(&mut self, tag: u8, decoder: Decoder) -> bool {
        if self.decoders.contains_key(&tag) {
            return false;
        }
        self.decoders.insert(tag, decoder);
        true
    }

    /// Returns true if a decoder is registered for `tag`.
    pub fn contains(&self, tag: u8) -> bool {
        self.decoders.contains_key(&tag)
    }

    pub fn max_validators(&self) -> usize {
        self.max_validators
    }

    /// Decodes a complete evidence `body` of kind `tag`.
    pub fn decode(&self, tag: u8, mut body: Bytes) -> Result<Evidence, CodecError> {
        let decoder = self
            .decoders
            .get(&tag)
            .ok_or(CodecError::Invalid("consensus::evidence::Registry", "unknown kind"))?;
        let evidence = decoder(&mut body, self.max_validators)?;
        if body.has_remaining() {
            return Err(CodecError::Invalid(
                "consensus::evidence::Registry",
                "trailing bytes in body",
            ));
        }
        if evidence.kind().tag() != tag {
            return Err(CodecError::Invalid(
                "consensus::evidence::Registry",
                "decoder produced wrong kind",
            ));
        }
        Ok(evidence)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("tags", &self.decoders.keys().collect::<Vec<_>>())
            .field("max_validators", &self.max_validators)
            .finish()
    }
}
