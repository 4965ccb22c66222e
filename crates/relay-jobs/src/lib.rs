//! Relay Jobs - asynchronous process lifecycle
//!
//! Background work attached to networks, nodes and trials:
//! - Jobs are committed as pending on their owner before they are dispatched
//! - Dispatch is local (thread per job) or distributed (shared queue and
//!   worker pool); both re-resolve the owner by id before running
//! - A job that raises or panics fails its owner and the owner's cascade
//! - The timeout supervisor fails unanswered trials and stalled owners
//!
//! # Example
//!
//! ```rust,ignore
//! use relay_jobs::prelude::*;
//!
//! let registry = JobRegistry::new().with("synthesize", |ctx| render(ctx.arguments));
//! let jobs = JobManager::new(store.clone(), registry, DispatchMode::Local);
//! jobs.queue_job(EntityRef::Node(node), JobDescriptor::new("synthesize"), timeout)?;
//!
//! let supervisor = TimeoutSupervisor::new(store, SupervisorConfig::default()).spawn();
//! ```

pub mod dispatcher;
pub mod duration_secs;
pub mod error;
pub mod manager;
pub mod owner;
pub mod registry;
pub mod supervisor;
pub mod worker;

pub use dispatcher::{
    dispatcher_for, DispatchMode, DistributedDispatcher, JobDispatcher, JobEnvelope,
    LocalDispatcher, OUTCOME_LOG_CAPACITY,
};
pub use error::JobError;
pub use manager::JobManager;
pub use owner::AsyncProcessOwner;
pub use registry::{JobContext, JobFunction, JobRegistry};
pub use supervisor::{
    SupervisorConfig, SupervisorHandle, TimeoutReport, TimeoutSupervisor, ASYNC_TIMEOUT_REASON,
    RESPONSE_TIMEOUT_REASON,
};
pub use worker::{JobObserver, JobOutcome, JobRunner, EXCEPTION_PREFIX};

/// Common imports
pub mod prelude {
    pub use crate::{
        AsyncProcessOwner, DispatchMode, JobContext, JobError, JobManager, JobRegistry,
        SupervisorConfig, TimeoutSupervisor,
    };
    pub use relay_store::{EntityRef, JobDescriptor};
}
