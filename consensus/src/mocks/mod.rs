//! Mock implementations of the interfaces the consensus core depends on.

use crate::validator::{Validator, ValidatorSet};
use commonware_cryptography::{ed25519::PrivateKey, PrivateKeyExt as _, Signer as _};

mod chain;
pub use chain::Chain;
mod transport;
pub use transport::{Post, Transport};

/// Generates `n` deterministic signers (seeded `0..n`) and the equal-power validator set they
/// form.
///
/// Signers are returned in validator-set order, so `signers[i]` is validator `i`.
pub fn fixtures(n: u64) -> (Vec<PrivateKey>, ValidatorSet) {
    let mut signers: Vec<PrivateKey> = (0..n).map(PrivateKey::from_seed).collect();
    let validators = ValidatorSet::new(
        signers
            .iter()
            .map(|signer| Validator::from(signer.public_key()))
            .collect(),
    )
    .expect("fixture keys are distinct");
    signers.sort_by_key(|signer| validators.index(&signer.public_key()));
    (signers, validators)
}
