use super::{
    metrics::{MessageLabel, Metrics},
    wire::{Maj23, Message, VoteSetBits},
    Config, Error, Transport,
};
use crate::{
    evidence::{Collector, Fault},
    proposal::Proposal,
    types::{Digest, Height, Round, Timestamp},
    vote::{Flag, Vote},
    vote_set::{HeightVoteSet, Outcome},
    Chain,
};
use commonware_cryptography::{
    ed25519::{PrivateKey, PublicKey},
    Signer,
};
use commonware_macros::select;
use commonware_runtime::{Clock, Metrics as RuntimeMetrics, Spawner};
use commonware_utils::{BitVec, SystemTimeExt};
use dashmap::{mapref::entry::Entry, DashMap};
use futures::channel::oneshot;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, info, warn};

/// An outstanding reconciliation, waiting for the peer's [VoteSetBits].
struct Request {
    peer: PublicKey,
    height: Height,
    round: Round,
    flag: Flag,
    block_hash: Digest,
    sender: oneshot::Sender<BitVec>,
}

impl Request {
    fn answered_by(&self, reply: &VoteSetBits) -> bool {
        self.peer == reply.validator
            && self.height == reply.height
            && self.round == reply.round
            && self.flag == reply.flag
            && self.block_hash == reply.block_hash
    }
}

struct Inner<E: Spawner + Clock + RuntimeMetrics, C: Chain, T: Transport> {
    context: E,
    chain: C,
    transport: T,
    signer: PrivateKey,
    namespace: Vec<u8>,
    reconcile_timeout: Duration,

    heights: DashMap<Height, Arc<HeightVoteSet>>,
    proposals: DashMap<(Height, Round), Proposal>,
    requests: DashMap<u64, Request>,
    next_correlation: AtomicU64,

    collector: Arc<Collector>,
    metrics: Metrics,
}

/// Handles inbound messages.
///
/// Cloning is cheap and every clone shares the same state, so a handler can be driven from
/// many concurrent tasks.
pub struct Handler<E: Spawner + Clock + RuntimeMetrics, C: Chain, T: Transport> {
    inner: Arc<Inner<E, C, T>>,
}

impl<E: Spawner + Clock + RuntimeMetrics, C: Chain, T: Transport> Clone for Handler<E, C, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Spawner + Clock + RuntimeMetrics, C: Chain, T: Transport> Handler<E, C, T> {
    /// Creates a handler, registering its metrics with `context`.
    ///
    /// Reconciliations run as tasks spawned on `context` and time out on its clock.
    pub fn new(
        context: E,
        cfg: Config,
        chain: C,
        transport: T,
        collector: Arc<Collector>,
    ) -> Self {
        let metrics = Metrics::init(&context);
        Self::with_metrics(context, cfg, chain, transport, collector, metrics)
    }

    /// Creates a handler that reports to existing `metrics`.
    pub fn with_metrics(
        context: E,
        cfg: Config,
        chain: C,
        transport: T,
        collector: Arc<Collector>,
        metrics: Metrics,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                context,
                chain,
                transport,
                signer: cfg.signer,
                namespace: cfg.namespace,
                reconcile_timeout: cfg.reconcile_timeout,
                heights: DashMap::new(),
                proposals: DashMap::new(),
                requests: DashMap::new(),
                next_correlation: AtomicU64::new(0),
                collector,
                metrics,
            }),
        }
    }

    /// Returns the public key this handler signs with.
    pub fn public_key(&self) -> PublicKey {
        self.inner.signer.public_key()
    }

    fn now(&self) -> Timestamp {
        self.inner.context.current().epoch_millis()
    }

    /// Returns the votes of `height`, creating them if the validator set at `height` is
    /// known.
    pub fn vote_set(&self, height: Height) -> Option<Arc<HeightVoteSet>> {
        if let Some(existing) = self.inner.heights.get(&height) {
            return Some(existing.value().clone());
        }
        let validators = self.inner.chain.validator_set(height)?;
        let votes = self
            .inner
            .heights
            .entry(height)
            .or_insert_with(|| {
                Arc::new(HeightVoteSet::new(
                    &self.inner.namespace,
                    height,
                    validators,
                ))
            })
            .value()
            .clone();
        Some(votes)
    }

    /// Returns the first valid proposal seen for `(height, round)`.
    pub fn proposal(&self, height: Height, round: Round) -> Option<Proposal> {
        self.inner
            .proposals
            .get(&(height, round))
            .map(|entry| entry.value().clone())
    }

    /// Forgets all state below `min_height`.
    pub fn prune(&self, min_height: Height) {
        self.inner.heights.retain(|height, _| *height >= min_height);
        self.inner
            .proposals
            .retain(|(height, _), _| *height >= min_height);
        self.inner
            .requests
            .retain(|_, request| request.height >= min_height);
        self.inner.collector.prune(min_height);
    }

    /// Handles `message`, delivered with `correlation`.
    pub async fn handle(&self, message: Message, correlation: u64) -> Result<(), Error> {
        let kind = message.kind();
        let label = MessageLabel::new(kind);
        self.inner.metrics.received.get_or_create(&label).inc();
        let result = match message {
            Message::Vote(vote) => self.handle_vote(vote),
            Message::Proposal(proposal) => self.handle_proposal(proposal),
            Message::Maj23(maj23) => self.handle_maj23(maj23, correlation).await,
            Message::VoteSetBits(reply) => self.handle_vote_set_bits(reply, correlation),
        };
        if let Err(err) = &result {
            self.inner.metrics.rejected.get_or_create(&label).inc();
            debug!(?err, kind, correlation, "rejected message");
        }
        result
    }

    fn handle_vote(&self, vote: Vote) -> Result<(), Error> {
        let height = vote.height();
        let votes = self.vote_set(height).ok_or(Error::UnknownHeight(height))?;
        match votes.add(vote.clone()) {
            Outcome::Added {
                majority: Some(block_hash),
            } => {
                self.inner.metrics.majorities.inc();
                info!(
                    height,
                    round = vote.round(),
                    flag = %vote.flag(),
                    %block_hash,
                    "reached majority, reconciling with peers"
                );
                let (round, flag) = (vote.round(), vote.flag());
                let me = self.public_key();
                let claimed = votes.get(round, flag);
                for validator in votes.validators().iter() {
                    let peer = validator.public_key().clone();
                    if peer == me {
                        continue;
                    }

                    // A peer that already claimed this majority holds the votes for it.
                    if let Some(set) = &claimed {
                        if set.lock().peer_maj23(&peer) == Some(block_hash) {
                            continue;
                        }
                    }
                    let handler = self.clone();
                    self.inner
                        .context
                        .with_label("reconcile")
                        .spawn(move |_| async move {
                            match handler
                                .reconcile(peer.clone(), height, round, flag, block_hash)
                                .await
                            {
                                Ok(sent) => debug!(%peer, sent, "reconciled"),
                                Err(err) => debug!(%peer, ?err, "reconciliation failed"),
                            }
                        });
                }
                Ok(())
            }
            Outcome::Added { majority: None } | Outcome::Duplicate => Ok(()),
            Outcome::Conflicting(existing) => {
                self.inner.metrics.conflicts.inc();
                warn!(
                    height,
                    round = vote.round(),
                    flag = %vote.flag(),
                    validator = %vote.address(),
                    "conflicting vote"
                );
                self.inner
                    .collector
                    .handle(Fault::duplicate_vote(existing, vote));
                Ok(())
            }
            Outcome::Rejected(reason) => Err(Error::Rejected(reason)),
        }
    }

    fn handle_proposal(&self, proposal: Proposal) -> Result<(), Error> {
        let height = proposal.height();
        let round = proposal.round();
        let validators = self
            .inner
            .chain
            .validator_set(height)
            .ok_or(Error::UnknownHeight(height))?;
        if validators.proposer(height, round).public_key() != proposal.proposer() {
            return Err(Error::WrongProposer { height, round });
        }
        if !proposal.verify(&self.inner.namespace) {
            return Err(Error::InvalidSignature);
        }
        match self.inner.proposals.entry((height, round)) {
            Entry::Vacant(entry) => {
                debug!(height, round, block_hash = %proposal.block_hash(), "recorded proposal");
                entry.insert(proposal);
                Ok(())
            }
            Entry::Occupied(entry) => {
                if entry.get() == &proposal {
                    return Ok(());
                }
                warn!(
                    height,
                    round,
                    existing = %entry.get().block_hash(),
                    received = %proposal.block_hash(),
                    "conflicting proposal"
                );
                Err(Error::ConflictingProposal { height, round })
            }
        }
    }

    async fn handle_maj23(&self, maj23: Maj23, correlation: u64) -> Result<(), Error> {
        if !maj23.flag.is_phase() {
            return Err(Error::InvalidFlag(maj23.flag));
        }
        let votes = self
            .vote_set(maj23.height)
            .ok_or(Error::UnknownHeight(maj23.height))?;
        if !votes.validators().contains(&maj23.validator) {
            return Err(Error::UnknownValidator);
        }
        if !maj23.verify(&self.inner.namespace) {
            return Err(Error::InvalidSignature);
        }
        let set = votes
            .vote_set(maj23.round, maj23.flag)
            .ok_or(Error::InvalidFlag(maj23.flag))?;
        let bits = {
            let mut set = set.lock();
            set.set_peer_maj23(maj23.validator.clone(), maj23.block_hash)
                .map_err(Error::Reconcile)?;
            set.bits(&maj23.block_hash)
        };

        // Reply to the claimant, which is not necessarily whoever delivered the claim.
        let reply = VoteSetBits::sign(
            &self.inner.signer,
            &self.inner.namespace,
            maj23.height,
            maj23.round,
            maj23.block_hash,
            maj23.flag,
            self.now(),
            bits,
        );
        self.inner
            .transport
            .post(maj23.validator, Message::VoteSetBits(reply), correlation)
            .await;
        Ok(())
    }

    fn handle_vote_set_bits(&self, reply: VoteSetBits, correlation: u64) -> Result<(), Error> {
        let votes = self
            .vote_set(reply.height)
            .ok_or(Error::UnknownHeight(reply.height))?;
        if !votes.validators().contains(&reply.validator) {
            return Err(Error::UnknownValidator);
        }
        if !reply.verify(&self.inner.namespace) {
            return Err(Error::InvalidSignature);
        }
        let Some((_, request)) = self
            .inner
            .requests
            .remove_if(&correlation, |_, request| request.answered_by(&reply))
        else {
            debug!(correlation, peer = %reply.validator, "ignoring unsolicited vote set bits");
            return Ok(());
        };
        // The requester may have timed out in the meantime.
        let _ = request.sender.send(reply.bits);
        Ok(())
    }

    /// Reconciles the votes for `block_hash` in `(height, round, flag)` with `peer`.
    ///
    /// Sends `peer` a [Maj23] claim, waits for its [VoteSetBits], and then sends every vote
    /// for `block_hash` the peer does not have. Returns the number of votes sent.
    pub async fn reconcile(
        &self,
        peer: PublicKey,
        height: Height,
        round: Round,
        flag: Flag,
        block_hash: Digest,
    ) -> Result<usize, Error> {
        let votes = self.vote_set(height).ok_or(Error::UnknownHeight(height))?;
        let set = votes
            .vote_set(round, flag)
            .ok_or(Error::InvalidFlag(flag))?;

        let correlation = self.inner.next_correlation.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        self.inner.requests.insert(
            correlation,
            Request {
                peer: peer.clone(),
                height,
                round,
                flag,
                block_hash,
                sender,
            },
        );
        let maj23 = Maj23::sign(
            &self.inner.signer,
            &self.inner.namespace,
            height,
            round,
            block_hash,
            flag,
            self.now(),
        );
        self.inner
            .transport
            .post(peer.clone(), Message::Maj23(maj23), correlation)
            .await;

        let peer_bits = select! {
            result = receiver => {
                let Ok(bits) = result else {
                    self.inner.requests.remove(&correlation);
                    return Err(Error::Canceled);
                };
                bits
            },
            _ = self.inner.context.sleep(self.inner.reconcile_timeout) => {
                self.inner.requests.remove(&correlation);
                self.inner.metrics.timeouts.inc();
                debug!(%peer, height, round, correlation, "reconciliation timed out");
                return Err(Error::Timeout);
            },
        };

        let missing = set
            .lock()
            .missing(&block_hash, &peer_bits)
            .map_err(Error::Reconcile)?;
        for vote in &missing {
            self.inner
                .transport
                .post(peer.clone(), Message::Vote(vote.clone()), correlation)
                .await;
        }
        self.inner.metrics.reconciled.inc();
        self.inner.metrics.votes_sent.inc_by(missing.len() as u64);
        Ok(missing.len())
    }
}
