//! Owner-side job operations
//!
//! These run inside a [`relay_store::Store::transaction`]. Queuing a job only
//! records it as pending; handing it to a dispatcher happens after the
//! transaction commits (see [`crate::JobManager`]).

use crate::error::JobError;
use chrono::{DateTime, Utc};
use relay_store::{
    AsyncJob, EntityRef, Failable, FailureReport, JobDescriptor, JobId, StoreError, Tables,
};
use std::time::Duration;

/// Job bookkeeping on any failable entity
pub trait AsyncProcessOwner {
    /// Record a new pending job on `owner`
    ///
    /// # Errors
    /// `OwnerFailed` if the owner has failed, `Store` if it does not exist.
    fn enqueue_job(
        &mut self,
        owner: EntityRef,
        descriptor: JobDescriptor,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<AsyncJob, JobError>;

    /// Remove a job from the owner's pending set
    ///
    /// # Errors
    /// `UnknownJob` if it is not pending.
    fn pop_job(&mut self, owner: EntityRef, id: JobId) -> Result<AsyncJob, StoreError>;

    /// Fail every pending job of `owner` without running it
    ///
    /// # Errors
    /// `NotFound` if the owner does not exist.
    fn fail_all_pending(
        &mut self,
        owner: EntityRef,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// Fail the owner, its pending jobs, and its failure cascade
    ///
    /// # Errors
    /// `NotFound` if the owner or a cascade target does not exist.
    fn fail_async_processes(
        &mut self,
        owner: EntityRef,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureReport, StoreError>;

    /// Cancel a pending job; it is failed immediately with reason "cancelled"
    ///
    /// # Errors
    /// `UnknownJob` if it is not pending.
    fn cancel_job(
        &mut self,
        owner: EntityRef,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<AsyncJob, StoreError>;

    /// Whether `id` is still pending on `owner` and not cancelled
    ///
    /// # Errors
    /// `NotFound` if the owner does not exist.
    fn job_is_live(&self, owner: EntityRef, id: JobId) -> Result<bool, StoreError>;
}

impl AsyncProcessOwner for Tables {
    fn enqueue_job(
        &mut self,
        owner: EntityRef,
        descriptor: JobDescriptor,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<AsyncJob, JobError> {
        let entity = self.failable_mut(owner)?;
        if entity.failed() {
            return Err(JobError::OwnerFailed(owner));
        }
        let job = AsyncJob::new(owner, descriptor, now, timeout);
        entity.async_state_mut().push_pending(job.clone());
        tracing::debug!(job_id = %job.id, %owner, function = %job.descriptor.function, "job queued");
        Ok(job)
    }

    fn pop_job(&mut self, owner: EntityRef, id: JobId) -> Result<AsyncJob, StoreError> {
        self.failable_mut(owner)?.async_state_mut().pop(id)
    }

    fn fail_all_pending(
        &mut self,
        owner: EntityRef,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        Ok(self
            .failable_mut(owner)?
            .async_state_mut()
            .fail_all_pending(reason, now))
    }

    fn fail_async_processes(
        &mut self,
        owner: EntityRef,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureReport, StoreError> {
        // an already-failed owner can still be holding jobs queued by a
        // worker that raced the failure
        let stragglers = self.fail_all_pending(owner, reason, now)?;
        let mut report = self.fail_at(owner, reason, now)?;
        report.jobs_failed += stragglers;
        Ok(report)
    }

    fn cancel_job(
        &mut self,
        owner: EntityRef,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<AsyncJob, StoreError> {
        let job = self.failable_mut(owner)?.async_state_mut().cancel(id, now)?;
        tracing::info!(job_id = %id, %owner, "job cancelled");
        Ok(job)
    }

    fn job_is_live(&self, owner: EntityRef, id: JobId) -> Result<bool, StoreError> {
        Ok(self
            .failable(owner)?
            .async_state()
            .pending_job(id)
            .is_some_and(|job| !job.cancelled))
    }
}
