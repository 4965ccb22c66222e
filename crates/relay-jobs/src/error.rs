//! Error types for the job lifecycle

use relay_store::{EntityRef, StoreError};

/// Job lifecycle errors
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// No function registered under this name
    #[error("unknown job function: {0}")]
    UnknownFunction(String),

    /// The job function returned an error
    #[error("{0}")]
    Function(String),

    /// The job function panicked
    #[error("panicked: {0}")]
    Panicked(String),

    /// Store access failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The job could not be handed to a dispatcher
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    /// Jobs are never queued on a failed owner
    #[error("{0} has failed; refusing to queue job")]
    OwnerFailed(EntityRef),
}

impl JobError {
    /// Whether the error came from running the job itself, as opposed to
    /// the machinery around it
    #[inline]
    #[must_use]
    pub fn is_job_fault(&self) -> bool {
        matches!(
            self,
            Self::UnknownFunction(_) | Self::Function(_) | Self::Panicked(_)
        )
    }
}
