//! Job dispatch
//!
//! Two strategies share one contract: a dispatched envelope is eventually
//! handed to [`JobRunner::execute`] at least once.
//!
//! - [`LocalDispatcher`] spawns a background thread per job.
//! - [`DistributedDispatcher`] serializes the envelope onto a shared MPMC
//!   queue drained by a pool of worker threads. With zero workers the queue
//!   is drained explicitly through [`JobDispatcher::wait_idle`].
//!
//! Finished job threads are reaped on every dispatch. Outcomes are kept in a
//! bounded log holding the most recent [`OUTCOME_LOG_CAPACITY`] entries.

use crate::error::JobError;
use crate::worker::{JobOutcome, JobRunner};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use relay_store::{AsyncJob, EntityRef, JobDescriptor, JobId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Outcomes kept between two [`JobDispatcher::wait_idle`] calls
pub const OUTCOME_LOG_CAPACITY: usize = 4096;

/// What travels from the queuing side to the executing side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    /// Pending job on the owner's ledger
    pub job_id: JobId,
    /// Entity the job belongs to
    pub owner: EntityRef,
    /// Function and arguments
    pub descriptor: JobDescriptor,
    /// Async timeout the job was queued with
    pub timeout: Duration,
}

impl JobEnvelope {
    /// Envelope for a freshly queued job
    #[must_use]
    pub fn from_job(job: &AsyncJob, timeout: Duration) -> Self {
        Self {
            job_id: job.id,
            owner: job.owner,
            descriptor: job.descriptor.clone(),
            timeout,
        }
    }
}

/// Dispatch strategy, selected from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DispatchMode {
    /// One background thread per job
    Local,
    /// Shared queue drained by `workers` threads
    Distributed {
        /// Worker threads draining the queue
        #[serde(default = "default_workers")]
        workers: usize,
    },
}

fn default_workers() -> usize {
    4
}

impl Default for DispatchMode {
    fn default() -> Self {
        Self::Local
    }
}

/// Hands committed jobs to something that will run them
pub trait JobDispatcher: Send + Sync {
    /// Strategy name, for logs
    fn name(&self) -> &'static str;

    /// Hand over one job; must only be called after the job was committed
    ///
    /// # Errors
    /// `JobError::Dispatch` if the job could not be handed over.
    fn dispatch(&self, envelope: JobEnvelope) -> Result<(), JobError>;

    /// Block until every job dispatched so far has run, returning the
    /// outcomes collected since the previous call (the most recent
    /// [`OUTCOME_LOG_CAPACITY`] of them)
    fn wait_idle(&self) -> Vec<JobOutcome>;

    /// Stop background workers; already-queued jobs may be dropped
    fn shutdown(&self) {}
}

impl std::fmt::Debug for dyn JobDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobDispatcher({})", self.name())
    }
}

/// Build the dispatcher for `mode`
#[must_use]
pub fn dispatcher_for(mode: DispatchMode, runner: Arc<JobRunner>) -> Arc<dyn JobDispatcher> {
    match mode {
        DispatchMode::Local => Arc::new(LocalDispatcher::new(runner)),
        DispatchMode::Distributed { workers } => {
            Arc::new(DistributedDispatcher::new(runner, workers))
        }
    }
}

/// Ring of recent outcomes; the oldest entry is dropped when full
#[derive(Debug)]
struct OutcomeLog {
    entries: Mutex<VecDeque<JobOutcome>>,
    capacity: usize,
}

impl OutcomeLog {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, outcome: JobOutcome) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            if let Some(dropped) = entries.pop_front() {
                tracing::trace!(job_id = %dropped.job_id(), "outcome log full; dropping oldest");
            }
        }
        entries.push_back(outcome);
    }

    fn take(&self) -> Vec<JobOutcome> {
        std::mem::take(&mut *self.entries.lock()).into()
    }
}

fn join_job(handle: JoinHandle<JobOutcome>, log: &OutcomeLog) {
    match handle.join() {
        Ok(outcome) => log.push(outcome),
        Err(_) => tracing::error!("job thread terminated abnormally"),
    }
}

// ---------------------------------------------------------------------------
// Local
// ---------------------------------------------------------------------------

/// Thread-per-job dispatcher
#[derive(Debug)]
pub struct LocalDispatcher {
    runner: Arc<JobRunner>,
    handles: Mutex<Vec<JoinHandle<JobOutcome>>>,
    outcomes: OutcomeLog,
}

impl LocalDispatcher {
    /// Dispatcher running every job on a fresh thread
    #[must_use]
    pub fn new(runner: Arc<JobRunner>) -> Self {
        Self {
            runner,
            handles: Mutex::new(Vec::new()),
            outcomes: OutcomeLog::new(OUTCOME_LOG_CAPACITY),
        }
    }

    /// Job threads not yet joined
    #[must_use]
    pub fn running(&self) -> usize {
        self.handles.lock().len()
    }

    /// Join threads that have already finished
    fn reap(&self) {
        let finished: Vec<JoinHandle<JobOutcome>> = {
            let mut handles = self.handles.lock();
            let (finished, running) = std::mem::take(&mut *handles)
                .into_iter()
                .partition(JoinHandle::is_finished);
            *handles = running;
            finished
        };
        for handle in finished {
            join_job(handle, &self.outcomes);
        }
    }
}

impl JobDispatcher for LocalDispatcher {
    fn name(&self) -> &'static str {
        "local"
    }

    fn dispatch(&self, envelope: JobEnvelope) -> Result<(), JobError> {
        self.reap();
        let runner = Arc::clone(&self.runner);
        let handle = thread::Builder::new()
            .name(format!("relay-job-{}", envelope.job_id))
            .spawn(move || runner.execute(&envelope))
            .map_err(|e| JobError::Dispatch(e.to_string()))?;
        self.handles.lock().push(handle);
        Ok(())
    }

    fn wait_idle(&self) -> Vec<JobOutcome> {
        loop {
            // jobs may dispatch further jobs while we join
            let handles = std::mem::take(&mut *self.handles.lock());
            if handles.is_empty() {
                return self.outcomes.take();
            }
            for handle in handles {
                join_job(handle, &self.outcomes);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Distributed
// ---------------------------------------------------------------------------

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct Queue {
    sender: Sender<String>,
    receiver: Receiver<String>,
    runner: Arc<JobRunner>,
    in_flight: AtomicUsize,
    outcomes: OutcomeLog,
    stop: AtomicBool,
}

impl Queue {
    fn process(&self, raw: &str) {
        match serde_json::from_str::<JobEnvelope>(raw) {
            Ok(envelope) => {
                let outcome = self.runner.execute(&envelope);
                self.outcomes.push(outcome);
            }
            Err(e) => tracing::error!(error = %e, "dropping malformed job envelope"),
        }
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    fn work(&self, worker: usize) {
        tracing::debug!(worker, "job worker started");
        while !self.stop.load(Ordering::Acquire) {
            match self.receiver.recv_timeout(POLL_INTERVAL) {
                Ok(raw) => self.process(&raw),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::debug!(worker, "job worker stopped");
    }
}

/// Shared-queue dispatcher with a worker pool
#[derive(Debug)]
pub struct DistributedDispatcher {
    queue: Arc<Queue>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DistributedDispatcher {
    /// Start `workers` worker threads; zero means jobs only run when the
    /// queue is drained through [`JobDispatcher::wait_idle`]
    #[must_use]
    pub fn new(runner: Arc<JobRunner>, workers: usize) -> Self {
        let (sender, receiver) = channel::unbounded();
        let queue = Arc::new(Queue {
            sender,
            receiver,
            runner,
            in_flight: AtomicUsize::new(0),
            outcomes: OutcomeLog::new(OUTCOME_LOG_CAPACITY),
            stop: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let queue = Arc::clone(&queue);
            match thread::Builder::new()
                .name(format!("relay-worker-{worker}"))
                .spawn(move || queue.work(worker))
            {
                Ok(handle) => handles.push(handle),
                Err(e) => tracing::error!(worker, error = %e, "could not start job worker"),
            }
        }
        if workers > 0 && handles.is_empty() {
            tracing::warn!("no job workers running; the queue drains only on wait_idle");
        }

        Self {
            queue,
            workers: Mutex::new(handles),
        }
    }

    /// Jobs queued or running
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.queue.in_flight.load(Ordering::Acquire)
    }

    /// Run queued jobs on the calling thread until the queue is empty
    pub fn run_queued(&self) -> usize {
        let mut ran = 0;
        while let Ok(raw) = self.queue.receiver.try_recv() {
            self.queue.process(&raw);
            ran += 1;
        }
        ran
    }
}

impl JobDispatcher for DistributedDispatcher {
    fn name(&self) -> &'static str {
        "distributed"
    }

    fn dispatch(&self, envelope: JobEnvelope) -> Result<(), JobError> {
        let raw = serde_json::to_string(&envelope).map_err(|e| JobError::Dispatch(e.to_string()))?;
        self.queue.in_flight.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self.queue.sender.send(raw) {
            self.queue.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(JobError::Dispatch(e.to_string()));
        }
        Ok(())
    }

    fn wait_idle(&self) -> Vec<JobOutcome> {
        loop {
            self.run_queued();
            if self.in_flight() == 0 {
                break;
            }
            thread::sleep(POLL_INTERVAL / 5);
        }
        self.queue.outcomes.take()
    }

    fn shutdown(&self) {
        self.queue.stop.store(true, Ordering::Release);
        for handle in std::mem::take(&mut *self.workers.lock()) {
            if handle.join().is_err() {
                tracing::error!("job worker terminated abnormally");
            }
        }
    }
}

impl Drop for DistributedDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
