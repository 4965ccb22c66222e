//! Asynchronous job records and the owner-side job ledger
//!
//! Every failable entity embeds an [`AsyncState`]: the set of jobs still
//! pending, plus permanent logs of jobs that failed or finished. The owner is
//! "awaiting async process" exactly while the pending set is non-empty.

use crate::error::StoreError;
use crate::ids::{EntityRef, JobId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Reason recorded on jobs that were cancelled explicitly
pub const CANCELLED_REASON: &str = "cancelled";

/// Serializable description of the work a job performs
///
/// The function is resolved by name through a registry on the executing
/// side; the arguments travel as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Registered function name
    pub function: String,
    /// Function arguments
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl JobDescriptor {
    /// Descriptor with no arguments
    #[must_use]
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            arguments: serde_json::Value::Null,
        }
    }

    /// With arguments
    #[must_use]
    pub fn with_arguments(mut self, arguments: serde_json::Value) -> Self {
        self.arguments = arguments;
        self
    }
}

/// Lifecycle status of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued or running
    Pending,
    /// Ran to completion
    Finished,
    /// Failed, timed out or cancelled
    Failed {
        /// Why the job failed
        reason: String,
    },
}

/// A unit of background work attached to an owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncJob {
    /// Job identifier
    pub id: JobId,
    /// Entity waiting on the job
    pub owner: EntityRef,
    /// Function and arguments
    pub descriptor: JobDescriptor,
    /// Lifecycle state
    pub status: JobStatus,
    /// Set when cancelled before it ran
    pub cancelled: bool,
    /// When the job was queued
    pub start_time: DateTime<Utc>,
    /// When the supervisor gives up on it
    pub timeout_deadline: DateTime<Utc>,
    /// When it finished, failed or was cancelled
    pub ended_at: Option<DateTime<Utc>>,
}

impl AsyncJob {
    /// New pending job starting at `start_time`
    #[must_use]
    pub fn new(
        owner: EntityRef,
        descriptor: JobDescriptor,
        start_time: DateTime<Utc>,
        timeout: Duration,
    ) -> Self {
        let timeout_deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|timeout| start_time.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            id: JobId::new(),
            owner,
            descriptor,
            status: JobStatus::Pending,
            cancelled: false,
            start_time,
            timeout_deadline,
            ended_at: None,
        }
    }

    /// Whether the job is still pending
    #[inline]
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self.status, JobStatus::Pending)
    }

    /// Whether the job failed
    #[inline]
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self.status, JobStatus::Failed { .. })
    }

    /// Failure reason, if the job failed
    #[must_use]
    pub fn failure_reason(&self) -> Option<&str> {
        match &self.status {
            JobStatus::Failed { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Owner-side job ledger
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AsyncState {
    pending: BTreeMap<JobId, AsyncJob>,
    failed_jobs: Vec<AsyncJob>,
    finished_jobs: Vec<AsyncJob>,
}

impl AsyncState {
    /// True while at least one job is pending
    #[inline]
    #[must_use]
    pub fn awaiting_async_process(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Pending jobs keyed by id
    #[must_use]
    pub fn pending(&self) -> &BTreeMap<JobId, AsyncJob> {
        &self.pending
    }

    /// Look up a pending job
    #[must_use]
    pub fn pending_job(&self, id: JobId) -> Option<&AsyncJob> {
        self.pending.get(&id)
    }

    /// Permanent log of failed jobs
    #[must_use]
    pub fn failed_jobs(&self) -> &[AsyncJob] {
        &self.failed_jobs
    }

    /// Permanent log of finished jobs
    #[must_use]
    pub fn finished_jobs(&self) -> &[AsyncJob] {
        &self.finished_jobs
    }

    /// Start time of the oldest pending job
    #[must_use]
    pub fn earliest_pending_start(&self) -> Option<DateTime<Utc>> {
        self.pending.values().map(|job| job.start_time).min()
    }

    /// Register a new pending job
    pub fn push_pending(&mut self, job: AsyncJob) {
        self.pending.insert(job.id, job);
    }

    /// Remove a job from the pending set
    ///
    /// # Errors
    /// `StoreError::UnknownJob` if the id is not pending. A job that was
    /// purged by a timeout or a cancellation must not complete silently.
    pub fn pop(&mut self, id: JobId) -> Result<AsyncJob, StoreError> {
        self.pending.remove(&id).ok_or(StoreError::UnknownJob(id))
    }

    /// Pop a pending job and record it as finished
    ///
    /// # Errors
    /// `StoreError::UnknownJob` if the id is not pending.
    pub fn finish(&mut self, id: JobId, now: DateTime<Utc>) -> Result<AsyncJob, StoreError> {
        let mut job = self.pop(id)?;
        job.status = JobStatus::Finished;
        job.ended_at = Some(now);
        self.finished_jobs.push(job.clone());
        Ok(job)
    }

    /// Pop a pending job and record it as failed
    ///
    /// # Errors
    /// `StoreError::UnknownJob` if the id is not pending.
    pub fn fail_job(
        &mut self,
        id: JobId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<AsyncJob, StoreError> {
        let job = self.pop(id)?;
        Ok(self.record_failure(job, reason, now))
    }

    /// Mark a pending job cancelled and fail it immediately
    ///
    /// # Errors
    /// `StoreError::UnknownJob` if the id is not pending.
    pub fn cancel(&mut self, id: JobId, now: DateTime<Utc>) -> Result<AsyncJob, StoreError> {
        let mut job = self.pop(id)?;
        job.cancelled = true;
        Ok(self.record_failure(job, CANCELLED_REASON, now))
    }

    /// Convert every pending job into a recorded failure without running it
    ///
    /// Returns the number of jobs drained.
    pub fn fail_all_pending(&mut self, reason: &str, now: DateTime<Utc>) -> usize {
        let drained = std::mem::take(&mut self.pending);
        let count = drained.len();
        for job in drained.into_values() {
            self.record_failure(job, reason, now);
        }
        count
    }

    fn record_failure(&mut self, mut job: AsyncJob, reason: &str, now: DateTime<Utc>) -> AsyncJob {
        job.status = JobStatus::Failed {
            reason: reason.to_string(),
        };
        job.ended_at = Some(now);
        self.failed_jobs.push(job.clone());
        job
    }
}
