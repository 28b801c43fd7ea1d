//! Retrain trigger: rebuild the classifier after store mutations.

use crate::classifier::{Trainer, TrainingError};
use crate::recognizer::ModelSlot;
use crate::store::{DirtyFlags, IdentityStore};

#[derive(Debug)]
pub enum RetrainOutcome {
    /// Nothing pending.
    Skipped,
    Published { version: u64 },
    /// No complete profiles remain; the previous model was removed.
    Withdrawn,
    /// Training failed; the previous model stays published.
    Failed(TrainingError),
}

pub struct RetrainScheduler {
    trainer: Trainer,
    slot: ModelSlot,
}

impl RetrainScheduler {
    pub fn new(trainer: Trainer, slot: ModelSlot) -> Self {
        Self { trainer, slot }
    }

    /// Run after every successful store mutation. Flags are cleared only
    /// when a new model is published.
    pub fn after_mutation(&self, store: &mut IdentityStore, change: DirtyFlags) -> RetrainOutcome {
        let pending = store.dirty();
        if !change.any() && !pending.any() {
            return RetrainOutcome::Skipped;
        }

        match self.trainer.train(store.profiles()) {
            Ok(model) => {
                let version = self.slot.publish(model);
                store.clear_dirty();
                tracing::info!(
                    version,
                    identities = store.complete_count(),
                    "classifier published"
                );
                RetrainOutcome::Published { version }
            }
            Err(TrainingError::NoTrainableData) => {
                tracing::info!("no complete profiles, withdrawing classifier");
                self.slot.withdraw();
                RetrainOutcome::Withdrawn
            }
            Err(err) => {
                tracing::warn!(error = %err, "retrain failed, keeping previous classifier");
                RetrainOutcome::Failed(err)
            }
        }
    }
}
