//! Relay Chain - chain-growth scheduling
//!
//! Assigns participants to transmission, Gibbs and MCMCP chains and grows
//! those chains as answers arrive:
//! - Network selection filters, partitions and ranks candidate chains
//! - Growth waits for completed, fully processed trials on the head
//! - Post-trial and post-grow work runs as asynchronous jobs
//! - Performance checks can fail a participant and prune their trials
//!
//! # Example
//!
//! ```rust,ignore
//! use relay_chain::prelude::*;
//!
//! let scheduler = ChainScheduler::with_defaults(config, jobs)?.install();
//! scheduler.init_networks()?;
//!
//! let participant = scheduler.create_participant("default");
//! if let TrialOutcome::Trial(trial) = scheduler.prepare_trial(participant)? {
//!     scheduler.finalize_trial(answer, trial, participant)?;
//! }
//! ```

pub mod chain;
pub mod config;
pub mod error;
pub mod paradigm;
pub mod performance;
pub mod presentation;
pub mod recruitment;
pub mod scheduler;

pub use chain::{degrees_contiguous, Growth, NetworkOwner};
pub use config::{ExperimentConfig, PerformanceConfig, PerformanceMethod, TrialMakerConfig};
pub use error::{ConfigError, SchedulerError};
pub use paradigm::{Gibbs, Mcmcp, Paradigm, ParadigmRegistry, Transmission};
pub use performance::{PerformanceCheck, PerformanceResult};
pub use presentation::{ParadigmPresenter, Presenter};
pub use recruitment::{NumParticipants, NumTrials, RecruitmentCriterion, RecruitmentRegistry};
pub use scheduler::{
    ChainScheduler, Finalized, NetworkFilter, NetworkSelection, TrialOutcome,
    PERFORMANCE_CHECK_REASON, PREMATURE_EXIT_REASON,
};

/// Common imports
pub mod prelude {
    pub use crate::{
        ChainScheduler, ExperimentConfig, Growth, ParadigmRegistry, PerformanceResult,
        SchedulerError, TrialMakerConfig, TrialOutcome,
    };
    pub use relay_store::{NetworkId, ParticipantId, TrialId};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
