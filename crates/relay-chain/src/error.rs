//! Error types for the chain scheduler
//!
//! Signals such as "head not ready" or "network busy" are return values
//! ([`crate::Growth`], [`crate::TrialOutcome::Wait`]), not errors.

use relay_jobs::JobError;
use relay_store::{NetworkId, ParticipantId, StoreError, TrialId};
use std::path::PathBuf;

/// Invalid or unreadable configuration, rejected at construction
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A setting or combination of settings is not allowed
    #[error("invalid trial maker configuration: {0}")]
    Invalid(String),

    /// Configuration file could not be read
    #[error("could not read {path}: {source}")]
    Io {
        /// File that was read
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// TOML syntax or schema error
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// YAML syntax or schema error
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// File extension is neither TOML nor YAML
    #[error("unsupported configuration format: {0}")]
    UnsupportedFormat(String),
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Storage error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Job queuing error
    #[error(transparent)]
    Job(#[from] JobError),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// `find_node` was called on a network with pending async work
    #[error("{0} has pending asynchronous work")]
    DirtyNetwork(NetworkId),

    /// No paradigm registered under this name
    #[error("unknown paradigm: {0}")]
    UnknownParadigm(String),

    /// No recruitment criterion registered under this name
    #[error("unknown recruitment criterion: {0}")]
    UnknownRecruitmentCriterion(String),

    /// The trial was assigned to someone else
    #[error("{trial} does not belong to {participant}")]
    TrialNotOwned {
        /// Trial being answered
        trial: TrialId,
        /// Participant who tried to answer it
        participant: ParticipantId,
    },

    /// The trial already has an answer
    #[error("{0} has already been finalized")]
    TrialAlreadyFinalized(TrialId),

    /// A paradigm could not interpret an answer or a trial set
    #[error("paradigm error: {0}")]
    Paradigm(String),
}

impl SchedulerError {
    /// Whether a retry of the same request could succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DirtyNetwork(_))
    }
}
