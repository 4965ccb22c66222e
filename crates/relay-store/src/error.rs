//! Error types for the chain store

use crate::ids::{EntityRef, JobId, ParticipantId};

/// Store-level errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// Entity does not exist
    #[error("{0} not found")]
    NotFound(EntityRef),

    /// Participant does not exist
    #[error("{0} not found")]
    ParticipantNotFound(ParticipantId),

    /// Job id is not in the owner's pending set
    #[error("job {0} is not pending")]
    UnknownJob(JobId),

    /// Participant variable was never set (distinct from holding null)
    #[error("undefined participant variable: {0}")]
    UndefinedVariable(String),

    /// Participant variable holds a value of the wrong type
    #[error("participant variable {name} is not {expected}")]
    InvalidVariable {
        /// Variable name
        name: String,
        /// Expected type
        expected: &'static str,
    },

    /// A structural invariant does not hold
    #[error("invariant violated: {0}")]
    Invariant(String),
}
