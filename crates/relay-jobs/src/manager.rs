//! Queuing front door
//!
//! [`JobManager`] owns the runner and the dispatcher and enforces the
//! commit-then-dispatch order. Callers that must queue jobs as part of a
//! larger transaction [`JobManager::stage`] them inside it and
//! [`JobManager::dispatch_staged`] after it commits.

use crate::dispatcher::{dispatcher_for, DispatchMode, JobDispatcher, JobEnvelope};
use crate::error::JobError;
use crate::owner::AsyncProcessOwner;
use crate::registry::JobRegistry;
use crate::worker::{JobObserver, JobOutcome, JobRunner};
use chrono::Utc;
use relay_store::{AsyncJob, EntityRef, Failable, JobDescriptor, JobId, Store, Tables};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Store, runner and dispatcher wired together
#[derive(Debug, Clone)]
pub struct JobManager {
    store: Arc<Store>,
    runner: Arc<JobRunner>,
    dispatcher: Arc<dyn JobDispatcher>,
}

impl JobManager {
    /// Manager dispatching according to `mode`
    #[must_use]
    pub fn new(store: Arc<Store>, registry: JobRegistry, mode: DispatchMode) -> Self {
        let runner = Arc::new(JobRunner::new(Arc::clone(&store), registry));
        let dispatcher = dispatcher_for(mode, Arc::clone(&runner));
        tracing::info!(dispatcher = dispatcher.name(), "job manager ready");
        Self {
            store,
            runner,
            dispatcher,
        }
    }

    /// Manager over a caller-supplied dispatcher
    #[must_use]
    pub fn with_dispatcher(
        store: Arc<Store>,
        runner: Arc<JobRunner>,
        dispatcher: Arc<dyn JobDispatcher>,
    ) -> Self {
        Self {
            store,
            runner,
            dispatcher,
        }
    }

    /// Shared store
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Runner executing dispatched jobs
    #[inline]
    #[must_use]
    pub fn runner(&self) -> &Arc<JobRunner> {
        &self.runner
    }

    /// Dispatch strategy in use
    #[inline]
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<dyn JobDispatcher> {
        &self.dispatcher
    }

    /// Install the completion hook on the runner
    pub fn set_observer(&self, observer: Weak<dyn JobObserver>) {
        self.runner.set_observer(observer);
    }

    /// Record a pending job inside an open transaction
    ///
    /// The returned envelope must be passed to
    /// [`JobManager::dispatch_staged`] once the transaction has committed;
    /// if the transaction rolls back, drop it.
    ///
    /// # Errors
    /// `OwnerFailed` or `Store` from [`AsyncProcessOwner::enqueue_job`].
    pub fn stage(
        tables: &mut Tables,
        owner: EntityRef,
        descriptor: JobDescriptor,
        timeout: Duration,
    ) -> Result<JobEnvelope, JobError> {
        let job: AsyncJob = tables.enqueue_job(owner, descriptor, timeout, Utc::now())?;
        Ok(JobEnvelope::from_job(&job, timeout))
    }

    /// Hand committed envelopes to the dispatcher
    ///
    /// A job that cannot be handed over is failed on its owner's ledger so
    /// the owner does not wait for it forever.
    pub fn dispatch_staged(&self, envelopes: impl IntoIterator<Item = JobEnvelope>) {
        for envelope in envelopes {
            let owner = envelope.owner;
            let job_id = envelope.job_id;
            if let Err(e) = self.dispatcher.dispatch(envelope) {
                tracing::error!(%job_id, %owner, error = %e, "dispatch failed");
                let reason = e.to_string();
                let recorded = self.store.transaction(|tables| {
                    tables
                        .failable_mut(owner)?
                        .async_state_mut()
                        .fail_job(job_id, &reason, Utc::now())
                });
                if let Err(e) = recorded {
                    tracing::warn!(%job_id, error = %e, "could not record dispatch failure");
                }
            }
        }
    }

    /// Queue a job: commit it as pending, then dispatch it
    ///
    /// # Errors
    /// `OwnerFailed` or `Store` if the job could not be recorded.
    pub fn queue_job(
        &self,
        owner: EntityRef,
        descriptor: JobDescriptor,
        timeout: Duration,
    ) -> Result<JobId, JobError> {
        let envelope = self
            .store
            .transaction(|tables| Self::stage(tables, owner, descriptor, timeout))?;
        let job_id = envelope.job_id;
        self.dispatch_staged([envelope]);
        Ok(job_id)
    }

    /// Cancel a pending job
    ///
    /// # Errors
    /// `Store(UnknownJob)` if it is no longer pending.
    pub fn cancel_job(&self, owner: EntityRef, job_id: JobId) -> Result<AsyncJob, JobError> {
        Ok(self
            .store
            .transaction(|tables| tables.cancel_job(owner, job_id, Utc::now()))?)
    }

    /// Block until dispatched jobs have run
    pub fn wait_idle(&self) -> Vec<JobOutcome> {
        self.dispatcher.wait_idle()
    }

    /// Stop dispatcher workers
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }
}
