//! Aggregate validator votes, prove double-voting, and track evidence through its on-chain
//! lifecycle.
//!
//! # Overview
//!
//! A known, weighted set of validators agrees on one block per height through rounds of
//! signed voting. This crate provides the core of that process:
//!
//! * [vote] and [proposal]: immutable signed statements, verifiable without context.
//! * [vote_set]: per `(height, round, flag)` aggregation with two-thirds majority detection
//!   and bit-vectors that describe which votes a node holds.
//! * [evidence]: detection of conflicting votes, canonical evidence construction, and the
//!   pending/committed evidence [evidence::Pool].
//! * [gossip]: the handler that feeds inbound messages into the above and reconciles vote
//!   sets with peers (`Maj23` -> `VoteSetBits` -> missing votes).
//!
//! Block assembly, state storage, peer discovery, and transport framing are provided by the
//! caller through [Chain], [evidence::Store], and [gossip::Transport].
//!
//! # Status
//!
//! `palisade-consensus` is **ALPHA** software and is not yet recommended for production use.
//! Developers should expect breaking changes and occasional instability.

pub mod evidence;
pub mod gossip;
pub mod proposal;
pub mod types;
pub mod validator;
pub mod vote;
pub mod vote_set;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

use types::Height;
use validator::ValidatorSet;

/// Chain is the interface to the state the consensus core reads (but never writes).
///
/// Validator sets are immutable once associated with a height, so implementations may
/// return the same snapshot for every call with that height.
pub trait Chain: Clone + Send + Sync + 'static {
    /// Returns the validator set active at `height`, if known.
    fn validator_set(&self, height: Height) -> Option<ValidatorSet>;

    /// Returns the height of the latest appended block.
    fn tip_height(&self) -> Height;

    /// Returns the number of blocks evidence from `height` may remain pending before it
    /// expires.
    fn max_evidence_pending_duration(&self, height: Height) -> u64;
}
