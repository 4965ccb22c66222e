//! Testing utilities for the relay workspace
//!
//! Shared fixtures: a store, job manager and installed scheduler wired
//! together, plus job functions with known behaviour.

#![allow(missing_docs)]

use relay_chain::{ChainScheduler, NetworkFilter, TrialMakerConfig, TrialOutcome};
use relay_jobs::{DispatchMode, JobManager, JobOutcome, JobRegistry};
use relay_store::{Failable, NetworkId, Node, ParticipantId, Store, TrialId};
use serde_json::Value;
use std::sync::Arc;

/// Job that succeeds
pub const OK_JOB: &str = "ok";
/// Job that returns an error
pub const FAILING_JOB: &str = "boom";
/// Job that panics
pub const PANICKING_JOB: &str = "panic";

/// Registry with [`OK_JOB`], [`FAILING_JOB`] and [`PANICKING_JOB`]
pub fn test_registry() -> JobRegistry {
    JobRegistry::new()
        .with(OK_JOB, |_| Ok(()))
        .with(FAILING_JOB, |_| anyhow::bail!("synthesis service unavailable"))
        .with(PANICKING_JOB, |_| panic!("worker crashed"))
}

/// `across` configuration with one chain, a fixed seed and the given growth
pub fn across_config(trials_per_node: u32, target_num_nodes: u32) -> TrialMakerConfig {
    TrialMakerConfig::across(1)
        .with_growth(trials_per_node, target_num_nodes)
        .with_seed(7)
}

pub struct HarnessBuilder {
    config: TrialMakerConfig,
    registry: JobRegistry,
    mode: DispatchMode,
    filter: Option<NetworkFilter>,
}

impl HarnessBuilder {
    pub fn new(config: TrialMakerConfig) -> Self {
        Self {
            config,
            registry: test_registry(),
            // jobs stay pending until the test drains them
            mode: DispatchMode::Distributed { workers: 0 },
            filter: None,
        }
    }

    pub fn registry(mut self, registry: JobRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn dispatch(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn network_filter(mut self, filter: NetworkFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Build, install and initialise networks
    pub fn build(self) -> Harness {
        let store = Arc::new(Store::new());
        let jobs = JobManager::new(Arc::clone(&store), self.registry, self.mode);
        let mut scheduler =
            ChainScheduler::with_defaults(self.config, jobs.clone()).expect("valid test configuration");
        if let Some(filter) = self.filter {
            scheduler = scheduler.with_network_filter(move |n, p| filter(n, p));
        }
        let scheduler = scheduler.install();
        scheduler.init_networks().expect("networks initialise");
        Harness {
            store,
            jobs,
            scheduler,
        }
    }
}

/// Store, job manager and installed scheduler
pub struct Harness {
    pub store: Arc<Store>,
    pub jobs: JobManager,
    pub scheduler: Arc<ChainScheduler>,
}

impl Harness {
    pub fn new(config: TrialMakerConfig) -> Self {
        HarnessBuilder::new(config).build()
    }

    pub fn participant(&self) -> ParticipantId {
        self.scheduler.create_participant("default")
    }

    /// Run every queued job
    pub fn drain(&self) -> Vec<JobOutcome> {
        self.jobs.wait_idle()
    }

    /// Prepare a trial, answer it and drain jobs; `None` if no trial was given
    pub fn answer(&self, participant: ParticipantId, answer: Value) -> Option<TrialId> {
        match self.scheduler.prepare_trial(participant).expect("prepare_trial") {
            TrialOutcome::Trial(trial) => {
                self.scheduler
                    .finalize_trial(answer, trial, participant)
                    .expect("finalize_trial");
                self.drain();
                Some(trial)
            }
            TrialOutcome::Wait | TrialOutcome::Exit { .. } => None,
        }
    }

    /// Networks of the configured trial maker, in id order
    pub fn networks(&self) -> Vec<NetworkId> {
        let id = self.scheduler.config().id.clone();
        self.store.read(|t| {
            t.networks()
                .filter(|n| n.trial_maker_id == id)
                .map(|n| n.id)
                .collect()
        })
    }

    /// Non-failed nodes of a network ordered by degree
    pub fn alive_nodes(&self, network: NetworkId) -> Vec<Node> {
        self.store.read(|t| {
            t.nodes_of(network)
                .into_iter()
                .filter(|n| !n.failed())
                .cloned()
                .collect()
        })
    }
}
