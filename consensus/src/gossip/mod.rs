//! Turn inbound messages into vote set and evidence operations, and reconcile vote sets with
//! peers.
//!
//! # Reconciliation
//!
//! When a vote set first reaches a two-thirds majority for some block hash, the [Handler]
//! reconciles with every other validator:
//!
//! 1. Send `Maj23{height, round, block_hash, flag, validator = self}` to the peer.
//! 2. The peer records the claim and replies (to the claim's `validator`, using the same
//!    correlation id) with `VoteSetBits` describing which votes for `block_hash` it holds.
//! 3. Send the peer exactly the votes whose bit it does not have
//!    (`own_bits AND NOT peer_bits`).
//!
//! One crossing therefore costs up to N-1 round trips. Peers whose recorded claim for the set
//! already names the same block hash are skipped, since they hold that majority themselves.
//!
//! A peer that never replies is abandoned after [Config::reconcile_timeout]. There are no
//! retries. Reconciliations run as tasks spawned on the handler's runtime context and time
//! out on its clock.
//!
//! # Conflicts
//!
//! A vote that conflicts with one already held from the same validator is not an error: it
//! is turned into a [crate::evidence::Fault] and handed to the [crate::evidence::Collector].

use crate::{
    types::{Height, Round},
    vote::Flag,
    vote_set,
};
use commonware_cryptography::ed25519::{PrivateKey, PublicKey};
use std::{future::Future, time::Duration};
use thiserror::Error;

mod handler;
pub use handler::Handler;
pub mod metrics;
pub mod wire;
pub use wire::{Maj23, Message, VoteSetBits};

/// Configuration for the [Handler].
#[derive(Clone, Debug)]
pub struct Config {
    /// Signer used for reconciliation messages.
    pub signer: PrivateKey,

    /// Namespace all messages are signed under.
    pub namespace: Vec<u8>,

    /// How long to wait for a peer's `VoteSetBits` before abandoning a reconciliation.
    pub reconcile_timeout: Duration,
}

/// Transport is the interface used to send messages to peers.
///
/// Delivery is best-effort: the handler never waits for an acknowledgement.
pub trait Transport: Clone + Send + Sync + 'static {
    /// Sends `message` to `peer`, tagged with `correlation` so that replies can be matched
    /// to requests.
    fn post(
        &self,
        peer: PublicKey,
        message: Message,
        correlation: u64,
    ) -> impl Future<Output = ()> + Send;
}

/// Errors that can occur when handling a message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("no validator set at height {0}")]
    UnknownHeight(Height),
    #[error("sender not in validator set")]
    UnknownValidator,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("{0} is not a voting phase")]
    InvalidFlag(Flag),
    #[error("vote rejected: {0}")]
    Rejected(vote_set::Reason),
    #[error("proposal not from proposer of height {height} round {round}")]
    WrongProposer { height: Height, round: Round },
    #[error("conflicting proposal for height {height} round {round}")]
    ConflictingProposal { height: Height, round: Round },
    #[error("reconciliation failed: {0}")]
    Reconcile(vote_set::Error),
    #[error("reconciliation timed out")]
    Timeout,
    #[error("reconciliation canceled")]
    Canceled,
}
