//! Chain scheduler
//!
//! Runs the participant pipeline synchronously on the caller's thread:
//!
//! 1. `find_networks` ranks the networks this participant may visit
//! 2. each candidate gets a growth attempt (staging post-grow work)
//! 3. `find_node` takes the head of the first clean candidate with capacity
//! 4. the trial is created and committed
//! 5. with no node left the participant moves on to repeat trials, then
//!    exits (after an optional end-of-phase performance check)
//!
//! Participants work through their blocks in order. The current block is
//! the first remaining one with a network left for them; taking a trial in
//! a block drops the blocks before it, so a participant never goes back.
//!
//! Every step commits on its own. Two participants may race to grow the
//! same network; duplicate heads are repaired the next time the head is
//! computed. Jobs are staged inside the committing transaction and only
//! dispatched after it commits.
//!
//! Lock order: store, then the scheduler's random generator.

use crate::chain::{self, Growth, NetworkOwner};
use crate::config::TrialMakerConfig;
use crate::error::{ConfigError, SchedulerError};
use crate::paradigm::{Paradigm, ParadigmRegistry};
use crate::performance::{self, PerformanceCheck, PerformanceResult};
use crate::presentation::{ParadigmPresenter, Presenter};
use crate::recruitment::{RecruitmentCriterion, RecruitmentRegistry};
use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use relay_jobs::{JobEnvelope, JobManager, JobObserver};
use relay_store::{
    ChainScope, EntityRef, Failable, FailureReport, JobDescriptor, JobId, Network, NetworkId,
    NewTrial, NodeId, Participant, ParticipantId, Store, StoreError, Tables, Trial, TrialId,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::convert::Infallible;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, info, info_span, warn};

const INITIALIZED: &str = "initialized";
const TRIALS_COMPLETED: &str = "trials_completed";
const REPEAT_TRIAL_IDS: &str = "repeat_trial_ids";
const REPEAT_TRIALS_DONE: &str = "repeat_trials_done";
const PERFORMANCE_CHECK: &str = "performance_check";
const END_OF_PHASE_CHECK: &str = "end_of_phase_performance_check";

/// Failure reason for trials of a participant who failed a performance check
pub const PERFORMANCE_CHECK_REASON: &str = "failed performance check";
/// Failure reason for trials of a participant who left early
pub const PREMATURE_EXIT_REASON: &str = "premature exit";

/// User-supplied network filter, applied after the built-in filters
pub type NetworkFilter = Arc<dyn Fn(&Network, &Participant) -> bool + Send + Sync>;

/// Ranked networks, or why there are none
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkSelection {
    /// Best candidate first
    Candidates(Vec<NetworkId>),
    /// Networks exist but are busy; ask again later
    Wait,
    /// Nothing left for this participant
    Exit,
}

/// Result of [`ChainScheduler::prepare_trial`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrialOutcome {
    /// A trial was assigned
    Trial(TrialId),
    /// Networks are busy; ask again later
    Wait,
    /// The participant is done with this trial maker
    Exit {
        /// End-of-phase performance result, when checked
        performance: Option<PerformanceResult>,
    },
}

/// Result of [`ChainScheduler::finalize_trial`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Finalized {
    /// Finalized trial
    pub trial: TrialId,
    /// Growth attempt on the trial's network
    pub growth: Growth,
    /// Every-trial performance check, when enabled and not pending
    pub performance: Option<PerformanceResult>,
}

/// Assigns participants to chains and grows them
pub struct ChainScheduler {
    config: TrialMakerConfig,
    store: Arc<Store>,
    jobs: JobManager,
    paradigm: Arc<dyn Paradigm>,
    presenter: Arc<dyn Presenter>,
    recruitment: Arc<dyn RecruitmentCriterion>,
    network_filter: Option<NetworkFilter>,
    rng: Mutex<StdRng>,
}

impl ChainScheduler {
    /// Build a scheduler over the job manager's store
    ///
    /// # Errors
    /// `Config` if the configuration is invalid or names an unregistered job
    /// function, `UnknownParadigm` or `UnknownRecruitmentCriterion` if a name
    /// does not resolve.
    pub fn new(
        config: TrialMakerConfig,
        jobs: JobManager,
        paradigms: &ParadigmRegistry,
        criteria: &RecruitmentRegistry,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        let paradigm = paradigms.resolve(&config.paradigm)?;
        let recruitment = criteria.resolve(config.recruit_criterion())?;
        for function in [&config.async_post_trial, &config.async_post_grow].into_iter().flatten() {
            if !jobs.runner().registry().contains(function) {
                return Err(ConfigError::Invalid(format!("job function {function} is not registered")).into());
            }
        }
        let rng = config.seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);

        Ok(Self {
            store: Arc::clone(jobs.store()),
            presenter: Arc::new(ParadigmPresenter::new(Arc::clone(&paradigm))),
            paradigm,
            recruitment,
            config,
            jobs,
            network_filter: None,
            rng: Mutex::new(rng),
        })
    }

    /// [`ChainScheduler::new`] with the built-in paradigms and criteria
    ///
    /// # Errors
    /// See [`ChainScheduler::new`].
    pub fn with_defaults(config: TrialMakerConfig, jobs: JobManager) -> Result<Self, SchedulerError> {
        Self::new(
            config,
            jobs,
            &ParadigmRegistry::with_defaults(),
            &RecruitmentRegistry::with_defaults(),
        )
    }

    /// Exclude networks for which `filter` returns false
    #[must_use]
    pub fn with_network_filter(
        mut self,
        filter: impl Fn(&Network, &Participant) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.network_filter = Some(Arc::new(filter));
        self
    }

    /// Replace the default paradigm presenter
    #[must_use]
    pub fn with_presenter(mut self, presenter: Arc<dyn Presenter>) -> Self {
        self.presenter = presenter;
        self
    }

    /// Share the scheduler and register it for job completions, so a
    /// finished job re-attempts growth on its network
    #[must_use]
    pub fn install(self) -> Arc<Self> {
        let scheduler = Arc::new(self);
        let weak: Weak<Self> = Arc::downgrade(&scheduler);
        let observer: Weak<dyn JobObserver> = weak;
        scheduler.jobs.set_observer(observer);
        scheduler
    }

    /// Trial maker settings
    #[inline]
    #[must_use]
    pub fn config(&self) -> &TrialMakerConfig {
        &self.config
    }

    /// Shared store
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Job manager used for post-trial and post-grow work
    #[inline]
    #[must_use]
    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    /// Resolved paradigm
    #[inline]
    #[must_use]
    pub fn paradigm(&self) -> &Arc<dyn Paradigm> {
        &self.paradigm
    }

    // ---------------------------------------------------------------
    // Setup
    // ---------------------------------------------------------------

    /// Register a participant in `participant_group`
    pub fn create_participant(&self, participant_group: &str) -> ParticipantId {
        match self
            .store
            .transaction(|t| Ok::<_, Infallible>(t.create_participant(participant_group)))
        {
            Ok(id) => id,
            Err(never) => match never {},
        }
    }

    /// Create the shared networks of an `across` design
    ///
    /// `chains_per_experiment` networks per block and participant group.
    /// Calling it again only tops up missing networks.
    ///
    /// # Errors
    /// Store errors from network creation.
    pub fn init_networks(&self) -> Result<Vec<NetworkId>, SchedulerError> {
        let chains = match (self.config.chain_type, self.config.chains_per_experiment) {
            (ChainScope::Across, Some(chains)) => chains as usize,
            _ => return Ok(Vec::new()),
        };
        self.store.transaction(|t| -> Result<Vec<NetworkId>, SchedulerError> {
            let mut rng = self.rng.lock();
            let mut created = Vec::new();
            for block in &self.config.blocks {
                for group in &self.config.participant_groups {
                    let existing = t
                        .networks()
                        .filter(|n| {
                            n.trial_maker_id == self.config.id
                                && &n.block == block
                                && &n.participant_group == group
                        })
                        .count();
                    for _ in existing..chains {
                        let network =
                            chain::create_network(t, &self.config, &*self.paradigm, block, group, None, &mut *rng)?;
                        created.push(network);
                    }
                }
            }
            info!(trial_maker = %self.config.id, created = created.len(), "networks initialised");
            Ok(created)
        })
    }

    /// Record block order and counters; create `within` networks
    ///
    /// Runs once per participant; later calls are no-ops. A block order set
    /// before initialisation is kept.
    ///
    /// # Errors
    /// `Store(ParticipantNotFound)` or network creation errors.
    pub fn init_participant(&self, participant: ParticipantId) -> Result<(), SchedulerError> {
        let flag = self.config.var_name(INITIALIZED);
        if self.store.read(|t| t.participant(participant).map(|p| p.has_var(&flag)))? {
            return Ok(());
        }
        self.store.transaction(|t| -> Result<(), SchedulerError> {
            let p = t.participant_mut(participant)?;
            if p.has_var(&flag) {
                return Ok(());
            }
            if p.block_order.is_empty() {
                p.block_order = self.config.blocks.clone();
            }
            p.set_var(self.config.var_name(TRIALS_COMPLETED), json!(0));
            p.set_var(self.config.var_name(REPEAT_TRIALS_DONE), json!(0));
            p.set_var(flag.as_str(), Value::Bool(true));
            let group = p.participant_group.clone();

            if self.config.chain_type == ChainScope::Within {
                let chains = self.config.chains_per_participant.unwrap_or(0);
                let mut rng = self.rng.lock();
                let mut index = 0;
                for block in &self.config.blocks {
                    for _ in 0..chains {
                        let owner = NetworkOwner {
                            participant,
                            id_within_participant: index,
                        };
                        index += 1;
                        chain::create_network(t, &self.config, &*self.paradigm, block, &group, Some(owner), &mut *rng)?;
                    }
                }
            }
            debug!(%participant, "participant initialised");
            Ok(())
        })
    }

    // ---------------------------------------------------------------
    // Selection and growth
    // ---------------------------------------------------------------

    /// Rank the networks `participant` may be assigned to
    ///
    /// Full and failed networks go first, then ownership or previously
    /// visited networks, then other groups, then the custom filter. The
    /// survivors are restricted to the current block: the first of the
    /// participant's remaining blocks that still has one. If nothing
    /// survives the participant exits. Among the rest, busy networks and
    /// heads without capacity lead to `Wait` (or `Exit` when not configured
    /// to wait). Candidates are ranked by fewest trials overall, then fewest
    /// trials by this participant, then block order.
    ///
    /// # Errors
    /// `Store(ParticipantNotFound)`.
    pub fn find_networks(
        &self,
        tables: &Tables,
        participant: ParticipantId,
    ) -> Result<NetworkSelection, SchedulerError> {
        let p = tables.participant(participant)?;
        let visited: HashSet<NetworkId> = tables
            .trials_of_participant(participant)
            .filter(|t| t.trial_maker_id == self.config.id && !t.is_repeat_trial)
            .map(|t| t.network_id)
            .collect();
        let block_rank = |block: &str| p.block_order.iter().position(|b| b == block);

        let open: Vec<&Network> = tables
            .networks()
            .filter(|n| n.trial_maker_id == self.config.id)
            .filter(|n| !n.full && !n.failed())
            .filter(|n| match self.config.chain_type {
                ChainScope::Within => n.participant_id == Some(participant),
                ChainScope::Across => {
                    self.config.allow_revisiting_networks_in_across_chains || !visited.contains(&n.id)
                }
            })
            .filter(|n| n.participant_group == p.participant_group)
            .filter(|n| self.network_filter.as_ref().map_or(true, |f| f(*n, p)))
            .collect();
        let Some(block) = p
            .block_order
            .iter()
            .find(|block| open.iter().any(|n| &n.block == *block))
        else {
            debug!(%participant, "no eligible networks");
            return Ok(NetworkSelection::Exit);
        };
        let eligible: Vec<&Network> = open.into_iter().filter(|n| &n.block == block).collect();

        let mut clean = Vec::with_capacity(eligible.len());
        for network in eligible {
            if chain::network_is_clean(tables, network.id)? {
                clean.push(network);
            }
        }
        if clean.is_empty() {
            debug!(%participant, "every eligible network is awaiting async work");
            return Ok(self.wait_or_exit());
        }

        let mut available: Vec<&Network> = clean
            .into_iter()
            .filter(|n| chain::head_has_capacity(tables, n.id, n.trials_per_node))
            .collect();
        if available.is_empty() {
            debug!(%participant, "no head has spare capacity");
            return Ok(self.wait_or_exit());
        }

        available.sort_by_cached_key(|n| {
            let trials: Vec<&Trial> = tables
                .trials_of_network(n.id)
                .filter(|t| !t.failed() && !t.is_repeat_trial)
                .collect();
            let mine = trials.iter().filter(|t| t.participant_id == participant).count();
            (trials.len(), mine, block_rank(n.block.as_str()).unwrap_or(usize::MAX), n.id)
        });
        Ok(NetworkSelection::Candidates(available.into_iter().map(|n| n.id).collect()))
    }

    fn wait_or_exit(&self) -> NetworkSelection {
        if self.config.wait_for_networks {
            NetworkSelection::Wait
        } else {
            NetworkSelection::Exit
        }
    }

    /// Attempt growth and stage post-grow work in the same commit
    ///
    /// # Errors
    /// Store, job staging or paradigm errors.
    pub fn grow_network(&self, network: NetworkId) -> Result<Growth, SchedulerError> {
        let (growth, staged) = self
            .store
            .transaction(|t| -> Result<(Growth, Option<JobEnvelope>), SchedulerError> {
                let growth = {
                    let mut rng = self.rng.lock();
                    chain::grow_network(t, &*self.paradigm, network, &mut *rng)?
                };
                let staged = match (growth, &self.config.async_post_grow) {
                    (Growth::Grew(node), Some(function)) => Some(JobManager::stage(
                        t,
                        EntityRef::Network(network),
                        JobDescriptor::new(function.as_str()).with_arguments(json!({ "node_id": node.get() })),
                        self.config.async_timeout,
                    )?),
                    _ => None,
                };
                Ok((growth, staged))
            })?;
        self.jobs.dispatch_staged(staged);
        Ok(growth)
    }

    /// Head of a clean network
    ///
    /// # Errors
    /// `DirtyNetwork` if the network or its head has pending async work.
    pub fn find_node(&self, tables: &Tables, network: NetworkId) -> Result<Option<NodeId>, SchedulerError> {
        if !chain::network_is_clean(tables, network)? {
            return Err(SchedulerError::DirtyNetwork(network));
        }
        Ok(chain::peek_head(tables, network).map(|n| n.id))
    }

    // ---------------------------------------------------------------
    // Trials
    // ---------------------------------------------------------------

    /// Next trial for `participant`, or a reason there is none
    ///
    /// # Errors
    /// Store or paradigm errors. Busy networks are `Wait`, not errors.
    pub fn prepare_trial(&self, participant: ParticipantId) -> Result<TrialOutcome, SchedulerError> {
        let span = info_span!("prepare_trial", %participant, trial_maker = %self.config.id);
        let _guard = span.enter();

        self.init_participant(participant)?;
        let (failed, assigned) = self.store.read(|t| -> Result<(bool, usize), StoreError> {
            let failed = t.participant(participant)?.failed();
            let assigned = t
                .trials_of_participant(participant)
                .filter(|tr| tr.trial_maker_id == self.config.id && !tr.is_repeat_trial)
                .count();
            Ok((failed, assigned))
        })?;
        if failed {
            return Ok(TrialOutcome::Exit { performance: None });
        }

        let capped = self
            .config
            .max_trials_per_participant
            .is_some_and(|max| assigned >= max as usize);
        if !capped {
            match self.store.read(|t| self.find_networks(t, participant))? {
                NetworkSelection::Wait => return Ok(TrialOutcome::Wait),
                NetworkSelection::Exit => {}
                NetworkSelection::Candidates(candidates) => {
                    for &network in &candidates {
                        if let Err(e) = self.grow_network(network) {
                            warn!(%network, error = %e, "growth attempt failed");
                        }
                    }
                    if let Some(trial) = self.assign_trial(participant, &candidates)? {
                        return Ok(TrialOutcome::Trial(trial));
                    }
                    debug!(%participant, "no trial available");
                    if self.config.wait_for_networks {
                        return Ok(TrialOutcome::Wait);
                    }
                }
            }
        }

        if let Some(trial) = self.next_repeat_trial(participant)? {
            return Ok(TrialOutcome::Trial(trial));
        }
        self.finish_phase(participant)
    }

    fn assign_trial(
        &self,
        participant: ParticipantId,
        candidates: &[NetworkId],
    ) -> Result<Option<TrialId>, SchedulerError> {
        self.store.transaction(|t| -> Result<Option<TrialId>, SchedulerError> {
            for &network in candidates {
                let net = t.network(network)?;
                if net.full || net.failed() || !chain::network_is_clean(t, network)? {
                    continue;
                }
                let block = net.block.clone();
                let Some(head) = self.find_node(t, network)? else {
                    continue;
                };
                let node = t.node(head)?;
                if chain::viable_trials(t, head).len() >= node.target_num_trials as usize {
                    continue;
                }
                let definition = {
                    let mut rng = self.rng.lock();
                    self.paradigm.trial_definition(node, &mut *rng)
                };
                let trial = t.insert_trial(NewTrial {
                    node_id: head,
                    participant_id: participant,
                    trial_maker_id: self.config.id.clone(),
                    is_repeat_trial: false,
                    parent_trial: None,
                    propagate_failure: self.config.propagate_failure,
                    definition,
                })?;
                let p = t.participant_mut(participant)?;
                if let Some(position) = p.block_order.iter().position(|b| *b == block) {
                    p.block_order.drain(..position);
                }
                info!(%trial, %network, node = %head, %block, "trial created");
                return Ok(Some(trial));
            }
            Ok(None)
        })
    }

    /// Repeat one of the participant's completed trials, if any remain
    ///
    /// The sample is drawn once and kept in the participant's variables.
    fn next_repeat_trial(&self, participant: ParticipantId) -> Result<Option<TrialId>, SchedulerError> {
        let wanted = self.config.num_repeat_trials as usize;
        if wanted == 0 {
            return Ok(None);
        }
        let ids_var = self.config.var_name(REPEAT_TRIAL_IDS);
        let done_var = self.config.var_name(REPEAT_TRIALS_DONE);

        self.store.transaction(|t| -> Result<Option<TrialId>, SchedulerError> {
            if !t.participant(participant)?.has_var(&ids_var) {
                let mut pool: Vec<u64> = t
                    .trials_of_participant(participant)
                    .filter(|tr| {
                        tr.trial_maker_id == self.config.id
                            && !tr.is_repeat_trial
                            && tr.complete
                            && !tr.failed()
                    })
                    .map(|tr| tr.id.get())
                    .collect();
                pool.shuffle(&mut *self.rng.lock());
                pool.truncate(wanted);
                t.participant_mut(participant)?.set_var(ids_var.as_str(), json!(pool));
            }

            let p = t.participant(participant)?;
            let ids: Vec<TrialId> = p
                .var(&ids_var)?
                .as_array()
                .map(|ids| ids.iter().filter_map(Value::as_u64).map(TrialId).collect())
                .unwrap_or_default();
            let done = p.var(&done_var).ok().and_then(Value::as_u64).unwrap_or(0) as usize;
            let Some(&original) = ids.get(done) else {
                return Ok(None);
            };

            let (node_id, definition) = {
                let source = t.trial(original)?;
                (source.node_id, source.definition.clone())
            };
            let trial = t.insert_trial(NewTrial {
                node_id,
                participant_id: participant,
                trial_maker_id: self.config.id.clone(),
                is_repeat_trial: true,
                parent_trial: Some(original),
                propagate_failure: false,
                definition,
            })?;
            t.participant_mut(participant)?.increment_var(&done_var, 1)?;
            info!(%trial, %original, "repeat trial created");
            Ok(Some(trial))
        })
    }

    fn finish_phase(&self, participant: ParticipantId) -> Result<TrialOutcome, SchedulerError> {
        if !self.config.check_performance_at_end {
            return Ok(TrialOutcome::Exit { performance: None });
        }
        // only an earlier end-of-phase result is final; every-trial results may be stale
        let end_var = self.config.var_name(END_OF_PHASE_CHECK);
        let stored = self.store.read(|t| -> Result<Option<PerformanceResult>, StoreError> {
            let p = t.participant(participant)?;
            Ok(p.var(&end_var).ok().and_then(|v| serde_json::from_value(v.clone()).ok()))
        })?;
        if let Some(result) = stored {
            return Ok(TrialOutcome::Exit { performance: Some(result) });
        }
        match self.check_performance(participant)? {
            PerformanceCheck::Pending => Ok(TrialOutcome::Wait),
            PerformanceCheck::Done(result) => {
                self.store.transaction(|t| -> Result<(), StoreError> {
                    t.participant_mut(participant)?
                        .set_var(end_var.as_str(), json!({ "score": result.score, "passed": result.passed }));
                    Ok(())
                })?;
                Ok(TrialOutcome::Exit { performance: Some(result) })
            }
        }
    }

    /// Record an answer and re-attempt growth on the trial's network
    ///
    /// The answer goes through the presenter before it is stored. Post-trial
    /// work is staged in the same commit and dispatched afterwards.
    ///
    /// # Errors
    /// `TrialNotOwned`, `TrialAlreadyFinalized`, answer normalization errors,
    /// or store and job errors.
    pub fn finalize_trial(
        &self,
        answer: Value,
        trial: TrialId,
        participant: ParticipantId,
    ) -> Result<Finalized, SchedulerError> {
        let span = info_span!("finalize_trial", %participant, %trial);
        let _guard = span.enter();

        let (network, staged) = self
            .store
            .transaction(|t| -> Result<(NetworkId, Option<JobEnvelope>), SchedulerError> {
                let record = t.trial(trial)?;
                if record.participant_id != participant {
                    return Err(SchedulerError::TrialNotOwned { trial, participant });
                }
                if record.complete {
                    return Err(SchedulerError::TrialAlreadyFinalized(trial));
                }
                let answer = self.presenter.submit(record, answer)?;
                let score = self.paradigm.score_answer(record, &answer);
                let (network, is_repeat, failed) = (record.network_id, record.is_repeat_trial, record.failed());

                t.complete_trial(trial, answer, score, Utc::now())?;
                if !is_repeat {
                    t.participant_mut(participant)?
                        .increment_var(&self.config.var_name(TRIALS_COMPLETED), 1)?;
                }
                let staged = match &self.config.async_post_trial {
                    Some(function) if !failed => Some(JobManager::stage(
                        t,
                        EntityRef::Trial(trial),
                        JobDescriptor::new(function.as_str()).with_arguments(json!({ "trial_id": trial.get() })),
                        self.config.async_timeout,
                    )?),
                    _ => None,
                };
                Ok((network, staged))
            })?;
        self.jobs.dispatch_staged(staged);

        let growth = self.grow_network(network)?;
        let performance = if self.config.check_performance_every_trial {
            match self.check_performance(participant)? {
                PerformanceCheck::Done(result) => Some(result),
                PerformanceCheck::Pending => None,
            }
        } else {
            None
        };
        info!(?growth, "trial finalized");
        Ok(Finalized {
            trial,
            growth,
            performance,
        })
    }

    // ---------------------------------------------------------------
    // Performance and exits
    // ---------------------------------------------------------------

    /// Score the participant's trials and apply the failure policy
    ///
    /// A failing participant is marked failed; with
    /// `fail_trials_on_participant_performance_check` their trials fail too,
    /// each with its cascade. The result is kept in the participant's
    /// variables.
    ///
    /// # Errors
    /// `Store(ParticipantNotFound)` or cascade errors.
    pub fn check_performance(&self, participant: ParticipantId) -> Result<PerformanceCheck, SchedulerError> {
        let trials: Vec<Trial> = self.store.read(|t| -> Result<Vec<Trial>, StoreError> {
            t.participant(participant)?;
            Ok(t.trials_of_participant(participant)
                .filter(|tr| tr.trial_maker_id == self.config.id)
                .cloned()
                .collect())
        })?;
        if self.config.performance.wait_for_async && trials.iter().any(|t| t.awaiting_async_process()) {
            debug!(%participant, "performance check waiting for async work");
            return Ok(PerformanceCheck::Pending);
        }

        let refs: Vec<&Trial> = trials.iter().collect();
        let result = performance::evaluate(&self.config.performance, &refs, &mut *self.rng.lock());

        let report = self.store.transaction(|t| -> Result<FailureReport, SchedulerError> {
            let mut report = FailureReport::default();
            if !result.passed {
                t.participant_mut(participant)?
                    .failure
                    .mark(PERFORMANCE_CHECK_REASON, Utc::now());
                if self.config.fail_trials_on_participant_performance_check {
                    for trial in &trials {
                        report.merge(t.fail(EntityRef::Trial(trial.id), PERFORMANCE_CHECK_REASON)?);
                    }
                }
            }
            t.participant_mut(participant)?.set_var(
                self.config.var_name(PERFORMANCE_CHECK),
                json!({ "score": result.score, "passed": result.passed }),
            );
            Ok(report)
        })?;
        info!(%participant, score = ?result.score, passed = result.passed, failed = report.failed.len(), "performance checked");
        Ok(PerformanceCheck::Done(result))
    }

    /// Score an explicit set of the participant's trials, without side effects
    ///
    /// # Errors
    /// `Store(NotFound)` or `TrialNotOwned`.
    pub fn performance_check(
        &self,
        participant: ParticipantId,
        trials: &[TrialId],
    ) -> Result<PerformanceResult, SchedulerError> {
        let records: Vec<Trial> = self.store.read(|t| -> Result<Vec<Trial>, SchedulerError> {
            t.participant(participant)?;
            trials
                .iter()
                .map(|&id| {
                    let trial = t.trial(id)?;
                    if trial.participant_id != participant {
                        return Err(SchedulerError::TrialNotOwned { trial: id, participant });
                    }
                    Ok(trial.clone())
                })
                .collect()
        })?;
        let refs: Vec<&Trial> = records.iter().collect();
        Ok(performance::evaluate(&self.config.performance, &refs, &mut *self.rng.lock()))
    }

    /// Mark the participant failed; optionally fail their trials
    ///
    /// # Errors
    /// `Store(ParticipantNotFound)` or cascade errors.
    pub fn on_premature_exit(&self, participant: ParticipantId) -> Result<FailureReport, SchedulerError> {
        self.store.transaction(|t| -> Result<FailureReport, SchedulerError> {
            t.participant_mut(participant)?
                .failure
                .mark(PREMATURE_EXIT_REASON, Utc::now());
            let mut report = FailureReport::default();
            if self.config.fail_trials_on_premature_exit {
                let trials: Vec<TrialId> = t
                    .trials_of_participant(participant)
                    .filter(|tr| tr.trial_maker_id == self.config.id)
                    .map(|tr| tr.id)
                    .collect();
                for trial in trials {
                    report.merge(t.fail(EntityRef::Trial(trial), PREMATURE_EXIT_REASON)?);
                }
            }
            info!(%participant, failed = report.failed.len(), "participant exited early");
            Ok(report)
        })
    }

    // ---------------------------------------------------------------
    // Recruitment and presentation
    // ---------------------------------------------------------------

    /// Work still required according to the configured criterion
    #[must_use]
    pub fn num_trials_still_required(&self) -> u64 {
        self.store
            .read(|t| self.recruitment.num_still_required(t, &self.config))
    }

    /// Whether more participants are needed
    #[must_use]
    pub fn needs_recruitment(&self) -> bool {
        self.num_trials_still_required() > 0
    }

    /// Participant-facing content for a trial
    ///
    /// # Errors
    /// `Store(NotFound)` if the trial does not exist.
    pub fn render(&self, trial: TrialId) -> Result<Value, SchedulerError> {
        let record = self.store.read(|t| t.trial(trial).cloned())?;
        Ok(self.presenter.render(&record))
    }

    fn owned_network(&self, tables: &Tables, owner: EntityRef) -> Result<Option<NetworkId>, StoreError> {
        let network = match owner {
            EntityRef::Network(id) => id,
            EntityRef::Node(id) => tables.node(id)?.network_id,
            EntityRef::Trial(id) => tables.trial(id)?.network_id,
        };
        Ok((tables.network(network)?.trial_maker_id == self.config.id).then_some(network))
    }
}

impl JobObserver for ChainScheduler {
    fn on_job_finished(&self, owner: EntityRef, job_id: JobId) {
        match self.store.read(|t| self.owned_network(t, owner)) {
            Ok(Some(network)) => {
                if let Err(e) = self.grow_network(network) {
                    warn!(%network, %job_id, error = %e, "growth after job completion failed");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(%owner, %job_id, error = %e, "job owner vanished"),
        }
    }
}

impl fmt::Debug for ChainScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainScheduler")
            .field("trial_maker", &self.config.id)
            .field("paradigm", &self.paradigm.name())
            .field("recruitment", &self.recruitment.name())
            .field("network_filter", &self.network_filter.is_some())
            .finish_non_exhaustive()
    }
}
