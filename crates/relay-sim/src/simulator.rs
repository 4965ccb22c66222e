//! Relay simulator
//!
//! Drives simulated participants through the scheduler while the timeout
//! supervisor and background jobs run, then audits the resulting chains:
//! - degrees of non-failed nodes are contiguous from zero
//! - no degree holds two non-failed nodes
//! - no chain grows past its target, no node takes more trials than it needs
//! - no failed owner is still waiting on a job

use anyhow::Context;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use relay_chain::{degrees_contiguous, ChainScheduler, ExperimentConfig, TrialMakerConfig, TrialOutcome};
use relay_jobs::{DispatchMode, JobManager, JobOutcome, JobRegistry, SupervisorConfig, TimeoutSupervisor};
use relay_store::{EntityRef, Failable, NetworkId, NodeId, ParticipantId, Store, Tables};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn};

/// Job registered for post-trial and post-grow processing
pub const SIM_JOB: &str = "synthesize";

/// Consecutive `Wait` answers before a participant gives up
const MAX_CONSECUTIVE_WAITS: u32 = 3;

/// Participants between outcome collections; keeps each batch well under
/// the dispatcher's outcome log capacity
const COLLECT_EVERY: u64 = 64;

/// Simulator configuration
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Participants to run, one after another
    pub participants: u64,
    /// Chance that a participant abandons an assigned trial
    pub abandon_probability: f64,
    /// Chance that a background job raises
    pub job_failure_probability: f64,
    /// Half-width of the uniform noise added to numeric answers
    pub answer_noise: f64,
    /// Scheduler calls per participant before they are sent away
    pub max_steps_per_participant: u32,
    /// Truncate the report to the first violation found
    pub stop_on_first_violation: bool,
    /// Experiment under simulation
    pub experiment: ExperimentConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            participants: 50,
            abandon_probability: 0.05,
            job_failure_probability: 0.05,
            answer_noise: 0.1,
            max_steps_per_participant: 20,
            stop_on_first_violation: false,
            experiment: default_experiment(),
        }
    }
}

impl SimulatorConfig {
    fn validate(&self) -> anyhow::Result<()> {
        for (name, p) in [
            ("abandon probability", self.abandon_probability),
            ("job failure probability", self.job_failure_probability),
        ] {
            anyhow::ensure!((0.0..=1.0).contains(&p), "{name} must be within [0, 1], got {p}");
        }
        anyhow::ensure!(
            self.answer_noise.is_finite() && self.answer_noise >= 0.0,
            "answer noise must be a non-negative number"
        );
        Ok(())
    }
}

/// Four transmission chains with post-trial processing, dispatched locally
#[must_use]
pub fn default_experiment() -> ExperimentConfig {
    ExperimentConfig {
        trial_maker: TrialMakerConfig {
            async_post_trial: Some(SIM_JOB.to_string()),
            max_trials_per_participant: Some(4),
            ..TrialMakerConfig::across(4).with_id("simulated").with_growth(2, 6)
        },
        supervisor: SupervisorConfig::default(),
        dispatch: DispatchMode::Local,
    }
}

/// An invariant broken in the final state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// Non-failed degrees are not `0..n`
    NonContiguous {
        /// Affected network
        network: NetworkId,
        /// Degrees found
        degrees: Vec<u32>,
    },
    /// More than one non-failed node at a degree
    DuplicateDegree {
        /// Affected network
        network: NetworkId,
        /// Degree held twice or more
        degree: u32,
        /// Non-failed nodes at that degree
        count: usize,
    },
    /// More non-failed nodes than the target
    Overgrown {
        /// Affected network
        network: NetworkId,
        /// Non-failed nodes
        alive: usize,
        /// Target number of nodes
        target: u32,
    },
    /// More viable trials on a node than it needs
    OverfilledNode {
        /// Affected node
        node: NodeId,
        /// Viable trials found
        viable: usize,
        /// Trials the node needs
        target: u32,
    },
    /// Failed entity that still has pending jobs
    PendingOnFailedOwner {
        /// Failed entity
        owner: EntityRef,
    },
}

/// Counters collected while participants run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SimulatorStats {
    /// Participants run
    pub participants: u64,
    /// Trials handed out
    pub trials_assigned: u64,
    /// Trials answered
    pub trials_finalized: u64,
    /// Trials abandoned
    pub abandoned: u64,
    /// `Wait` answers
    pub waits: u64,
    /// Participants sent away after waiting too often
    pub gave_up: u64,
    /// Participants told to exit
    pub exits: u64,
    /// Participants who failed a performance check
    pub performance_failures: u64,
    /// Jobs that completed
    pub jobs_completed: u64,
    /// Jobs that raised
    pub jobs_failed: u64,
    /// Jobs skipped or discarded
    pub jobs_skipped: u64,
    /// Participants whose run ended on a scheduler error
    pub errors: u64,
}

impl SimulatorStats {
    fn record_jobs(&mut self, outcomes: &[JobOutcome]) {
        for outcome in outcomes {
            match outcome {
                JobOutcome::Completed { .. } => self.jobs_completed += 1,
                JobOutcome::Failed { .. } => self.jobs_failed += 1,
                JobOutcome::Skipped { .. } | JobOutcome::Discarded { .. } => self.jobs_skipped += 1,
            }
        }
    }
}

/// Final shape of one chain
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainStats {
    /// Network
    pub network: NetworkId,
    /// Block the network belongs to
    pub block: String,
    /// Participant group the network belongs to
    pub participant_group: String,
    /// Non-failed nodes
    pub alive_nodes: usize,
    /// Failed nodes
    pub failed_nodes: usize,
    /// Trials, repeats included
    pub trials: usize,
    /// Failed trials
    pub failed_trials: usize,
    /// Whether the network reached its target
    pub full: bool,
    /// Whether the network failed
    pub failed: bool,
}

/// Final report from simulator
#[derive(Debug, Clone, Serialize)]
pub struct SimulatorReport {
    /// Seed the run used
    pub seed: u64,
    /// Trial maker id
    pub trial_maker: String,
    /// Run counters
    pub stats: SimulatorStats,
    /// Final shape of every chain
    pub chains: Vec<ChainStats>,
    /// Broken invariants
    pub violations: Vec<Violation>,
}

impl SimulatorReport {
    /// True if every invariant held
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Human-readable summary
    #[must_use]
    pub fn generate_text(&self) -> String {
        let s = &self.stats;
        let mut report = String::new();

        let _ = writeln!(report, "=== Relay Simulator Report ===\n");
        let _ = writeln!(report, "Seed: {}", self.seed);
        let _ = writeln!(report, "Trial maker: {}", self.trial_maker);
        let _ = writeln!(report, "Participants: {}", s.participants);
        let _ = writeln!(report, "Trials assigned: {}", s.trials_assigned);
        let _ = writeln!(report, "Trials finalized: {}", s.trials_finalized);
        let _ = writeln!(report, "Abandoned: {}", s.abandoned);
        let _ = writeln!(report, "Waits: {} (gave up: {})", s.waits, s.gave_up);
        let _ = writeln!(report, "Performance failures: {}", s.performance_failures);
        let _ = writeln!(
            report,
            "Jobs: {} completed, {} failed, {} skipped",
            s.jobs_completed, s.jobs_failed, s.jobs_skipped
        );
        let _ = writeln!(report, "Scheduler errors: {}", s.errors);

        let _ = writeln!(report, "\n=== Chains ===");
        for c in &self.chains {
            let state = match (c.failed, c.full) {
                (true, _) => "failed",
                (false, true) => "full",
                (false, false) => "growing",
            };
            let _ = writeln!(
                report,
                "{} [{}/{}] {} nodes ({} failed), {} trials ({} failed), {}",
                c.network,
                c.block,
                c.participant_group,
                c.alive_nodes,
                c.failed_nodes,
                c.trials,
                c.failed_trials,
                state
            );
        }

        if !self.violations.is_empty() {
            let _ = writeln!(report, "\n=== Violations ===");
            for (i, v) in self.violations.iter().enumerate() {
                let _ = writeln!(report, "{}. {v:?}", i + 1);
            }
        }

        let _ = writeln!(report, "\n=== Result: {} ===", if self.passed() { "PASS" } else { "FAIL" });
        report
    }

    /// Pretty-printed JSON
    ///
    /// # Errors
    /// Serialization errors.
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Job functions used by the simulation; each raises with `failure_probability`
#[must_use]
pub fn simulation_registry(seed: u64, failure_probability: f64) -> JobRegistry {
    let rng = Arc::new(Mutex::new(StdRng::seed_from_u64(seed.rotate_left(17))));
    JobRegistry::new().with(SIM_JOB, move |ctx| {
        if rng.lock().gen_bool(failure_probability) {
            anyhow::bail!("simulated failure processing {}", ctx.owner);
        }
        Ok(())
    })
}

/// Run the simulation to completion and audit the result
///
/// # Errors
/// Invalid configuration, or a scheduler that cannot be built.
pub async fn run_simulator(config: SimulatorConfig) -> anyhow::Result<SimulatorReport> {
    config.validate()?;
    let mut experiment = config.experiment.clone();
    experiment.trial_maker.seed.get_or_insert(config.seed);

    let store = Arc::new(Store::new());
    let registry = simulation_registry(config.seed, config.job_failure_probability);
    let jobs = JobManager::new(Arc::clone(&store), registry, experiment.dispatch);
    let scheduler = ChainScheduler::with_defaults(experiment.trial_maker.clone(), jobs.clone())
        .context("building scheduler")?
        .install();
    let networks = scheduler.init_networks().context("initialising networks")?;
    info!(networks = networks.len(), seed = config.seed, "simulation started");

    let supervisor = TimeoutSupervisor::new(Arc::clone(&store), experiment.supervisor.clone()).spawn();

    // scheduler calls block on the store lock, keep them off the async workers
    let driver = Arc::clone(&scheduler);
    let driven = config.clone();
    let stats = tokio::task::spawn_blocking(move || drive(&driver, &driven))
        .await
        .context("participant loop panicked")?;

    supervisor.shutdown().await;
    jobs.shutdown();

    let tables = store.snapshot();
    let mut violations = check_invariants(&tables, &experiment.trial_maker);
    if config.stop_on_first_violation {
        violations.truncate(1);
    }
    for v in &violations {
        warn!(violation = ?v, "invariant violated");
    }

    Ok(SimulatorReport {
        seed: config.seed,
        trial_maker: experiment.trial_maker.id.clone(),
        stats,
        chains: chain_stats(&tables, &experiment.trial_maker),
        violations,
    })
}

fn drive(scheduler: &ChainScheduler, config: &SimulatorConfig) -> SimulatorStats {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut stats = SimulatorStats::default();
    let groups = scheduler.config().participant_groups.clone();

    for _ in 0..config.participants {
        let group = groups.choose(&mut rng).map_or("default", String::as_str);
        let participant = scheduler.create_participant(group);
        stats.participants += 1;
        if let Err(e) = run_participant(scheduler, participant, config, &mut rng, &mut stats) {
            warn!(%participant, error = %e, "participant aborted");
            stats.errors += 1;
        }
        if stats.participants % COLLECT_EVERY == 0 {
            stats.record_jobs(&scheduler.jobs().wait_idle());
        }
    }

    stats.record_jobs(&scheduler.jobs().wait_idle());
    stats
}

fn run_participant(
    scheduler: &ChainScheduler,
    participant: ParticipantId,
    config: &SimulatorConfig,
    rng: &mut StdRng,
    stats: &mut SimulatorStats,
) -> anyhow::Result<()> {
    let span = info_span!("participant", %participant);
    let _enter = span.enter();
    let mut waits = 0;

    for _ in 0..config.max_steps_per_participant {
        match scheduler.prepare_trial(participant)? {
            TrialOutcome::Trial(trial) => {
                stats.trials_assigned += 1;
                waits = 0;
                if rng.gen_bool(config.abandon_probability) {
                    let report = scheduler.on_premature_exit(participant)?;
                    debug!(failed = report.failed.len(), "participant abandoned");
                    stats.abandoned += 1;
                    return Ok(());
                }
                let shown = scheduler.render(trial)?;
                let answer = simulated_answer(&shown, config.answer_noise, rng);
                scheduler.finalize_trial(answer, trial, participant)?;
                stats.trials_finalized += 1;
            }
            TrialOutcome::Wait => {
                stats.waits += 1;
                waits += 1;
                if waits > MAX_CONSECUTIVE_WAITS {
                    stats.gave_up += 1;
                    return Ok(());
                }
                // let background jobs settle before asking again
                stats.record_jobs(&scheduler.jobs().wait_idle());
            }
            TrialOutcome::Exit { performance } => {
                stats.exits += 1;
                if performance.is_some_and(|p| !p.passed) {
                    stats.performance_failures += 1;
                }
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Answer a rendered trial: pick a side for two-alternative trials,
/// otherwise copy the shown value with noise
pub fn simulated_answer(shown: &Value, noise: f64, rng: &mut impl Rng) -> Value {
    if shown.get("first").is_some() {
        return json!(if rng.gen_bool(0.5) { "first" } else { "second" });
    }
    let definition = shown.get("definition").unwrap_or(&Value::Null);
    let target = definition.as_f64().or_else(|| {
        let vector = definition.get("vector")?.as_array()?;
        let index = usize::try_from(definition.get("active_index")?.as_u64()?).ok()?;
        vector.get(index)?.as_f64()
    });
    match target {
        Some(value) => json!(value + rng.gen_range(-noise..=noise)),
        None => json!(rng.gen::<f64>()),
    }
}

/// Audit the chains of one trial maker
#[must_use]
pub fn check_invariants(tables: &Tables, config: &TrialMakerConfig) -> Vec<Violation> {
    let mut violations = Vec::new();

    for network in tables.networks().filter(|n| n.trial_maker_id == config.id) {
        let alive: Vec<_> = tables
            .nodes_of(network.id)
            .into_iter()
            .filter(|n| !n.failed())
            .collect();

        let mut per_degree = BTreeMap::<u32, usize>::new();
        for node in &alive {
            *per_degree.entry(node.degree).or_default() += 1;
        }
        for (&degree, &count) in per_degree.iter().filter(|(_, c)| **c > 1) {
            violations.push(Violation::DuplicateDegree {
                network: network.id,
                degree,
                count,
            });
        }

        if !degrees_contiguous(tables, network.id) {
            violations.push(Violation::NonContiguous {
                network: network.id,
                degrees: alive.iter().map(|n| n.degree).collect(),
            });
        }

        if alive.len() > network.target_num_nodes as usize {
            violations.push(Violation::Overgrown {
                network: network.id,
                alive: alive.len(),
                target: network.target_num_nodes,
            });
        }

        for node in &alive {
            let viable = tables
                .trials_of_node(node.id)
                .filter(|t| !t.failed() && !t.is_repeat_trial)
                .count();
            if viable > node.target_num_trials as usize {
                violations.push(Violation::OverfilledNode {
                    node: node.id,
                    viable,
                    target: node.target_num_trials,
                });
            }
        }
    }

    for owner in tables.owners_awaiting() {
        if tables.failable(owner).is_ok_and(|entity| entity.failed()) {
            violations.push(Violation::PendingOnFailedOwner { owner });
        }
    }

    violations
}

/// Per-chain summary of one trial maker
#[must_use]
pub fn chain_stats(tables: &Tables, config: &TrialMakerConfig) -> Vec<ChainStats> {
    tables
        .networks()
        .filter(|n| n.trial_maker_id == config.id)
        .map(|network| {
            let nodes = tables.nodes_of(network.id);
            let failed_nodes = nodes.iter().filter(|n| n.failed()).count();
            let trials: Vec<_> = tables.trials_of_network(network.id).collect();
            ChainStats {
                network: network.id,
                block: network.block.clone(),
                participant_group: network.participant_group.clone(),
                alive_nodes: nodes.len() - failed_nodes,
                failed_nodes,
                trials: trials.len(),
                failed_trials: trials.iter().filter(|t| t.failed()).count(),
                full: network.full,
                failed: network.failed(),
            }
        })
        .collect()
}
