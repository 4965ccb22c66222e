//! Presentation boundary
//!
//! The scheduler never renders pages. It hands trials to a [`Presenter`]
//! and takes back normalized answers.

use crate::error::SchedulerError;
use crate::paradigm::Paradigm;
use relay_store::Trial;
use serde_json::Value;
use std::sync::Arc;

/// Opaque render/submit pair supplied by the front end
pub trait Presenter: Send + Sync {
    /// Content shown to the participant
    fn render(&self, trial: &Trial) -> Value;

    /// Normalize a raw answer before it is stored
    ///
    /// # Errors
    /// `SchedulerError::Paradigm` if the answer is rejected.
    fn submit(&self, trial: &Trial, raw_answer: Value) -> Result<Value, SchedulerError>;
}

/// Presenter that defers to the paradigm
#[derive(Clone)]
pub struct ParadigmPresenter {
    paradigm: Arc<dyn Paradigm>,
}

impl ParadigmPresenter {
    /// Presenter delegating to `paradigm`
    #[must_use]
    pub fn new(paradigm: Arc<dyn Paradigm>) -> Self {
        Self { paradigm }
    }
}

impl Presenter for ParadigmPresenter {
    fn render(&self, trial: &Trial) -> Value {
        self.paradigm.show_trial(trial)
    }

    fn submit(&self, trial: &Trial, raw_answer: Value) -> Result<Value, SchedulerError> {
        self.paradigm.normalize_answer(trial, raw_answer)
    }
}

impl std::fmt::Debug for ParadigmPresenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParadigmPresenter")
            .field("paradigm", &self.paradigm.name())
            .finish()
    }
}
