//! Job function registry
//!
//! Descriptors name a function; the executing side resolves the name here.
//! Registration happens at startup, lookups happen on worker threads.

use crate::error::JobError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relay_store::{EntityRef, JobId, Store};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Everything a job function can see while it runs
pub struct JobContext<'a> {
    /// Job being executed
    pub job_id: JobId,
    /// Entity that owns the job
    pub owner: EntityRef,
    /// Arguments from the descriptor
    pub arguments: &'a Value,
    /// Shared store, for reading inputs and committing results
    pub store: &'a Store,
    /// After this instant the supervisor may purge the job
    pub deadline: DateTime<Utc>,
}

impl fmt::Debug for JobContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("owner", &self.owner)
            .field("arguments", &self.arguments)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// A unit of background work callable by name
pub trait JobFunction: Send + Sync + 'static {
    /// Run the job
    ///
    /// # Errors
    /// Any error fails the owner with an "Exception in asynchronous process"
    /// reason.
    fn run(&self, ctx: &JobContext<'_>) -> anyhow::Result<()>;
}

impl<F> JobFunction for F
where
    F: Fn(&JobContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn run(&self, ctx: &JobContext<'_>) -> anyhow::Result<()> {
        self(ctx)
    }
}

/// Name to function map
#[derive(Clone, Default)]
pub struct JobRegistry {
    functions: Arc<DashMap<String, Arc<dyn JobFunction>>>,
}

impl JobRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure, replacing any previous function with the same name
    pub fn register<F>(&self, name: impl Into<String>, function: F)
    where
        F: Fn(&JobContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_job(name, function);
    }

    /// Register any [`JobFunction`] implementation
    pub fn register_job(&self, name: impl Into<String>, function: impl JobFunction) {
        let name = name.into();
        if self.functions.insert(name.clone(), Arc::new(function)).is_some() {
            tracing::debug!(%name, "job function replaced");
        }
    }

    /// Builder-style [`JobRegistry::register`]
    #[must_use]
    pub fn with<F>(self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&JobContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(name, function);
        self
    }

    /// Look a function up by name
    ///
    /// # Errors
    /// `JobError::UnknownFunction` if nothing is registered under `name`.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn JobFunction>, JobError> {
        self.functions
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| JobError::UnknownFunction(name.to_string()))
    }

    /// Whether `name` is registered
    #[inline]
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("functions", &self.names())
            .finish()
    }
}
