//! Timeout supervision
//!
//! Runs independently of participant requests. Each tick:
//! 1. fails incomplete trials that have waited longer than the response
//!    timeout;
//! 2. fails owners whose oldest pending job started longer ago than the
//!    async timeout, or whose pending job passed its own deadline.
//!
//! Every victim is failed in its own transaction, so one bad entity cannot
//! block the rest of the tick.

use crate::owner::AsyncProcessOwner;
use chrono::{DateTime, Utc};
use relay_store::{EntityRef, Failable, FailureReport, Store, StoreError, Tables, TrialId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Reason recorded on trials nobody answered in time
pub const RESPONSE_TIMEOUT_REASON: &str = "response timeout";
/// Reason recorded on owners whose jobs never came back
pub const ASYNC_TIMEOUT_REASON: &str = "long-pending process";

/// Supervisor timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Time between ticks
    #[serde(with = "crate::duration_secs")]
    pub interval: Duration,
    /// Maximum age of an unanswered trial
    #[serde(with = "crate::duration_secs")]
    pub response_timeout: Duration,
    /// Maximum age of the oldest pending job on any owner
    #[serde(with = "crate::duration_secs")]
    pub async_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            response_timeout: Duration::from_secs(60 * 60),
            async_timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl SupervisorConfig {
    /// Set the time between ticks
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the maximum age of an unanswered trial
    #[must_use]
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set the maximum age of a pending job
    #[must_use]
    pub fn with_async_timeout(mut self, timeout: Duration) -> Self {
        self.async_timeout = timeout;
        self
    }
}

/// What one tick failed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeoutReport {
    /// Trials failed for not being answered
    pub response_timeouts: Vec<TrialId>,
    /// Owners failed for long-pending jobs
    pub async_timeouts: Vec<EntityRef>,
    /// Everything failed, cascades included
    pub cascade: FailureReport,
    /// Victims that could not be failed
    pub errors: usize,
}

impl TimeoutReport {
    /// True if the tick changed nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cascade.is_empty() && self.errors == 0
    }
}

/// Periodic response-timeout and async-timeout checks
#[derive(Debug)]
pub struct TimeoutSupervisor {
    store: Arc<Store>,
    config: SupervisorConfig,
}

impl TimeoutSupervisor {
    /// Supervisor over `store`
    #[must_use]
    pub fn new(store: Arc<Store>, config: SupervisorConfig) -> Self {
        Self { store, config }
    }

    /// Timing settings
    #[inline]
    #[must_use]
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// One tick, now
    pub fn run_timeout_checks(&self) -> TimeoutReport {
        self.run_timeout_checks_at(Utc::now())
    }

    /// One tick, as if the clock read `now`
    pub fn run_timeout_checks_at(&self, now: DateTime<Utc>) -> TimeoutReport {
        let mut report = TimeoutReport::default();
        let response_cutoff = cutoff(now, self.config.response_timeout);
        let async_cutoff = cutoff(now, self.config.async_timeout);

        let unanswered = self.store.read(|t| unanswered_trials(t, response_cutoff));
        for trial in unanswered {
            let owner = EntityRef::Trial(trial);
            let result = self.store.transaction(|t| {
                // re-check under the write lock; the trial may have been answered
                if !unanswered_trials(t, response_cutoff).contains(&trial) {
                    return Ok(None);
                }
                t.fail_async_processes(owner, RESPONSE_TIMEOUT_REASON, now).map(Some)
            });
            if let Some(cascade) = record(owner, result, &mut report) {
                tracing::warn!(%trial, "trial failed: response timeout");
                report.response_timeouts.push(trial);
                report.cascade.merge(cascade);
            }
        }

        let stalled = self.store.read(|t| stalled_owners(t, async_cutoff, now));
        for owner in stalled {
            let result = self.store.transaction(|t| {
                if !stalled_owners(t, async_cutoff, now).contains(&owner) {
                    return Ok(None);
                }
                t.fail_async_processes(owner, ASYNC_TIMEOUT_REASON, now).map(Some)
            });
            if let Some(cascade) = record(owner, result, &mut report) {
                tracing::warn!(%owner, "owner failed: long-pending process");
                report.async_timeouts.push(owner);
                report.cascade.merge(cascade);
            }
        }

        report
    }

    /// Run ticks on a tokio interval until the handle is shut down
    ///
    /// Each tick runs on the blocking pool; a panicking tick is logged and
    /// the loop carries on.
    #[must_use]
    pub fn spawn(self) -> SupervisorHandle {
        let supervisor = Arc::new(self);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let period = supervisor.config.interval.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(interval_ms = period.as_millis() as u64, "timeout supervisor started");
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let tick = Arc::clone(&supervisor);
                        match tokio::task::spawn_blocking(move || tick.run_timeout_checks()).await {
                            Ok(report) if !report.is_empty() => tracing::info!(
                                response_timeouts = report.response_timeouts.len(),
                                async_timeouts = report.async_timeouts.len(),
                                failed = report.cascade.failed.len(),
                                errors = report.errors,
                                "timeout tick"
                            ),
                            Ok(_) => {}
                            Err(e) => tracing::error!(error = %e, "timeout tick aborted"),
                        }
                    }
                }
            }
            tracing::info!("timeout supervisor stopped");
        });

        SupervisorHandle {
            stop: Some(stop_tx),
            task,
        }
    }
}

/// Control handle for a spawned supervisor loop
#[derive(Debug)]
pub struct SupervisorHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Stop the loop and wait for the current tick to finish
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "timeout supervisor task failed");
        }
    }

    /// True while the loop is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

fn cutoff(now: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|timeout| now.checked_sub_signed(timeout))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Incomplete, non-failed trials created before `cutoff`
///
/// A complete trial still waiting on its own post-processing is not
/// unanswered; that wait is the async timeout's business.
fn unanswered_trials(tables: &Tables, cutoff: DateTime<Utc>) -> Vec<TrialId> {
    tables
        .trials()
        .filter(|t| !t.complete && !t.failed() && t.created_at < cutoff)
        .map(|t| t.id)
        .collect()
}

/// Owners whose oldest pending job started before `cutoff`, or whose
/// pending job is past its own deadline
fn stalled_owners(tables: &Tables, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Vec<EntityRef> {
    tables
        .owners_awaiting()
        .into_iter()
        .filter(|owner| {
            tables.failable(*owner).is_ok_and(|entity| {
                let state = entity.async_state();
                state.earliest_pending_start().is_some_and(|start| start < cutoff)
                    || state.pending().values().any(|job| job.timeout_deadline < now)
            })
        })
        .collect()
}

fn record(
    victim: EntityRef,
    result: Result<Option<FailureReport>, StoreError>,
    report: &mut TimeoutReport,
) -> Option<FailureReport> {
    match result {
        Ok(cascade) => cascade,
        Err(e) => {
            tracing::error!(%victim, error = %e, "timeout could not be applied");
            report.errors += 1;
            None
        }
    }
}
