use crate::{types::Height, validator::ValidatorSet};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

struct State {
    validators: ValidatorSet,
    overrides: HashMap<Height, Option<ValidatorSet>>,
    tip: Height,
    max_evidence_pending_duration: u64,
}

/// In-memory chain with a fixed validator set (unless overridden per height) and a
/// settable tip. Clones share state.
#[derive(Clone)]
pub struct Chain {
    state: Arc<Mutex<State>>,
}

impl Chain {
    pub fn new(validators: ValidatorSet, max_evidence_pending_duration: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                validators,
                overrides: HashMap::new(),
                tip: 0,
                max_evidence_pending_duration,
            })),
        }
    }

    pub fn set_tip(&self, tip: Height) {
        self.state.lock().tip = tip;
    }

    /// Uses `validators` at `height` instead of the default set.
    pub fn set_validator_set(&self, height: Height, validators: ValidatorSet) {
        self.state.lock().overrides.insert(height, Some(validators));
    }

    /// Makes the validator set at `height` unknown.
    pub fn remove_validator_set(&self, height: Height) {
        self.state.lock().overrides.insert(height, None);
    }
}

impl crate::Chain for Chain {
    fn validator_set(&self, height: Height) -> Option<ValidatorSet> {
        let state = self.state.lock();
        match state.overrides.get(&height) {
            Some(validators) => validators.clone(),
            None => Some(state.validators.clone()),
        }
    }

    fn tip_height(&self) -> Height {
        self.state.lock().tip
    }

    fn max_evidence_pending_duration(&self, _: Height) -> u64 {
        self.state.lock().max_evidence_pending_duration
    }
}
