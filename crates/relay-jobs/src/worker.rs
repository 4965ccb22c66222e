//! Job execution
//!
//! [`JobRunner::execute`] is the single code path every dispatcher uses to
//! run a job: it re-resolves the owner from the store, skips jobs that are
//! no longer live, runs the function with panics captured, and commits the
//! result. Nothing escapes it; every error ends up on the owner.

use crate::dispatcher::JobEnvelope;
use crate::error::JobError;
use crate::owner::AsyncProcessOwner;
use crate::registry::{JobContext, JobRegistry};
use chrono::Utc;
use parking_lot::RwLock;
use relay_store::{EntityRef, Failable, JobId, Store, StoreError};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

/// Prefix of the failure reason recorded when a job function errors or panics
pub const EXCEPTION_PREFIX: &str = "Exception in asynchronous process:";

/// What happened to a dispatched job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    /// Ran and committed
    Completed {
        /// Job that ran
        job_id: JobId,
    },
    /// Raised; the owner was failed
    Failed {
        /// Job that raised
        job_id: JobId,
        /// Failure reason recorded on the owner
        reason: String,
    },
    /// No longer pending or cancelled before it ran
    Skipped {
        /// Job that did not run
        job_id: JobId,
    },
    /// Ran, but its owner stopped waiting for it in the meantime
    Discarded {
        /// Job whose result was dropped
        job_id: JobId,
    },
}

impl JobOutcome {
    /// Job this outcome belongs to
    #[must_use]
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Completed { job_id }
            | Self::Failed { job_id, .. }
            | Self::Skipped { job_id }
            | Self::Discarded { job_id } => *job_id,
        }
    }

    /// Whether the job ran and committed
    #[inline]
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Hook run after a job's completion has been committed
pub trait JobObserver: Send + Sync {
    /// Called outside any transaction, on the worker thread
    fn on_job_finished(&self, owner: EntityRef, job_id: JobId);
}

/// Executes job envelopes against the shared store
pub struct JobRunner {
    store: Arc<Store>,
    registry: JobRegistry,
    observer: RwLock<Option<Weak<dyn JobObserver>>>,
}

impl JobRunner {
    /// Runner over `store` resolving functions through `registry`
    #[must_use]
    pub fn new(store: Arc<Store>, registry: JobRegistry) -> Self {
        Self {
            store,
            registry,
            observer: RwLock::new(None),
        }
    }

    /// Install the completion hook; held weakly so the observer may own us
    pub fn set_observer(&self, observer: Weak<dyn JobObserver>) {
        *self.observer.write() = Some(observer);
    }

    /// Shared store
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Registered job functions
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Run one job to a terminal outcome
    pub fn execute(&self, envelope: &JobEnvelope) -> JobOutcome {
        let span = tracing::info_span!(
            "job",
            job_id = %envelope.job_id,
            owner = %envelope.owner,
            function = %envelope.descriptor.function
        );
        let _enter = span.enter();
        let job_id = envelope.job_id;

        let deadline = match self.live_deadline(envelope) {
            Ok(Some(deadline)) => deadline,
            Ok(None) => {
                tracing::debug!("job no longer pending; skipping");
                return JobOutcome::Skipped { job_id };
            }
            Err(e) => {
                tracing::warn!(error = %e, "job owner unavailable; skipping");
                return JobOutcome::Skipped { job_id };
            }
        };

        let function = match self.registry.resolve(&envelope.descriptor.function) {
            Ok(function) => function,
            Err(e) => return self.fail(envelope, &e),
        };
        let ctx = JobContext {
            job_id,
            owner: envelope.owner,
            arguments: &envelope.descriptor.arguments,
            store: &self.store,
            deadline,
        };

        match panic::catch_unwind(AssertUnwindSafe(|| function.run(&ctx))) {
            Ok(Ok(())) => self.complete(envelope),
            Ok(Err(e)) => self.fail(envelope, &JobError::Function(format!("{e:#}"))),
            Err(payload) => self.fail(envelope, &JobError::Panicked(panic_message(&*payload))),
        }
    }

    fn live_deadline(
        &self,
        envelope: &JobEnvelope,
    ) -> Result<Option<chrono::DateTime<Utc>>, StoreError> {
        self.store.read(|tables| {
            let owner = tables.failable(envelope.owner)?;
            Ok(owner
                .async_state()
                .pending_job(envelope.job_id)
                .filter(|job| !job.cancelled && !owner.failed())
                .map(|job| job.timeout_deadline))
        })
    }

    fn complete(&self, envelope: &JobEnvelope) -> JobOutcome {
        let job_id = envelope.job_id;
        let committed = self.store.transaction(|tables| {
            tables
                .failable_mut(envelope.owner)?
                .async_state_mut()
                .finish(job_id, Utc::now())
        });
        match committed {
            Ok(_) => {
                tracing::info!("job finished");
                let observer = self.observer.read().as_ref().and_then(Weak::upgrade);
                if let Some(observer) = observer {
                    observer.on_job_finished(envelope.owner, job_id);
                }
                JobOutcome::Completed { job_id }
            }
            Err(StoreError::UnknownJob(_)) => {
                tracing::warn!("job completed after it was purged; result discarded");
                JobOutcome::Discarded { job_id }
            }
            Err(e) => {
                tracing::error!(error = %e, "could not record job completion");
                JobOutcome::Discarded { job_id }
            }
        }
    }

    fn fail(&self, envelope: &JobEnvelope, error: &JobError) -> JobOutcome {
        let job_id = envelope.job_id;
        let reason = format!("{EXCEPTION_PREFIX} {error}");
        tracing::error!(%reason, "asynchronous process raised");

        let applied = self.store.transaction(|tables| {
            if !tables.job_is_live(envelope.owner, job_id)? {
                return Ok(None);
            }
            tables
                .fail_async_processes(envelope.owner, &reason, Utc::now())
                .map(Some)
        });
        match applied {
            Ok(Some(report)) => {
                tracing::info!(failed = report.failed.len(), "owner failed after job error");
                JobOutcome::Failed { job_id, reason }
            }
            Ok(None) => {
                tracing::warn!("job raised after it was purged; error discarded");
                JobOutcome::Discarded { job_id }
            }
            Err(e) => {
                tracing::error!(error = %e, "could not record job failure");
                JobOutcome::Discarded { job_id }
            }
        }
    }
}

impl std::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRunner")
            .field("registry", &self.registry)
            .field("observer", &self.observer.read().is_some())
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
